use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use plexus_events::ChangeHub;
use plexus_protocol::{Delta, DeltaOp, ErrorCode, ErrorInfo};
use plexus_records::{KindTag, QueryParams, Record};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::list::BusList;
use crate::plan::{Plan, UnaryOp};
use crate::{QueryError, ReplaySource};

#[derive(thiserror::Error, Debug, Clone)]
pub enum WatchError {
    #[error("list has no plan and cannot be watched")]
    Unreplayable,
    #[error("watched plan mixes buses: {}", .0.join(", "))]
    MixedBuses(Vec<String>),
    #[error(transparent)]
    Query(#[from] QueryError),
}

impl From<WatchError> for ErrorInfo {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::Unreplayable => ErrorInfo::new(ErrorCode::Unreplayable, err.to_string()),
            WatchError::MixedBuses(_) => ErrorInfo::new(ErrorCode::InvalidRequest, err.to_string()),
            WatchError::Query(inner) => inner.into(),
        }
    }
}

/// What changed in a watched list after one (possibly coalesced) recomputation.
#[derive(Clone, Debug)]
pub struct Notification {
    pub bus: String,
    pub rev: u64,
    /// Op of the latest delta in the batch.
    pub op: DeltaOp,
    pub payload: Value,
    pub added: Vec<Record>,
    pub removed: Vec<Record>,
    pub changed: Vec<Record>,
    pub current: BusList,
    pub coalesced: usize,
    pub reloaded: bool,
}

impl Notification {
    fn interests(&self, rules: &[DeltaOp]) -> bool {
        (!self.added.is_empty() && rules.contains(&DeltaOp::Add))
            || (!self.removed.is_empty() && rules.contains(&DeltaOp::Del))
            || (!self.changed.is_empty() && rules.contains(&DeltaOp::Change))
    }
}

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Subscriber {
    rules: Vec<DeltaOp>,
    callback: Callback,
}

enum Strategy {
    /// Unary chain over one `Get`: deltas patch the leaf snapshot.
    Incremental {
        params: QueryParams,
        ops: Vec<UnaryOp>,
        kind: Option<KindTag>,
    },
    Reload,
}

struct WatchState {
    current: BusList,
    leaf: Vec<Record>,
    rev: u64,
}

#[derive(Default)]
struct Pending {
    deltas: Vec<Delta>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    bus: String,
    plan: Plan,
    strategy: Strategy,
    source: Arc<dyn ReplaySource>,
    debounce: Duration,
    runtime: Handle,
    state: Mutex<WatchState>,
    subscribers: RwLock<Vec<Subscriber>>,
    pending: Mutex<Pending>,
    apply_lock: tokio::sync::Mutex<()>,
    attached: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// A live view over a replayable [`BusList`].
#[derive(Clone)]
pub struct Watcher {
    shared: Arc<Shared>,
}

impl Watcher {
    /// Starts watching `list`. Must be called from within a tokio runtime;
    /// deltas may later be pushed from any thread.
    pub async fn new(
        list: &BusList,
        source: Arc<dyn ReplaySource>,
        debounce: Duration,
    ) -> Result<Self, WatchError> {
        let plan = list.plan().cloned().ok_or(WatchError::Unreplayable)?;
        let bus = plan.single_bus().map_err(|err| match err {
            QueryError::MixedBuses(buses) => WatchError::MixedBuses(buses),
            other => WatchError::Query(other),
        })?;
        let strategy = match plan.linear_chain() {
            Some((_, params, ops)) if !plan.has_raw_predicate() => Strategy::Incremental {
                params: params.clone(),
                ops: ops.into_iter().cloned().collect(),
                kind: plan.kind_hint(),
            },
            _ => Strategy::Reload,
        };
        let (current, leaf) = match &strategy {
            Strategy::Incremental { params, ops, .. } => {
                let leaf = source.fetch(&bus, params).await?;
                (recompute(&bus, params, ops, &leaf)?, leaf)
            }
            Strategy::Reload => (list.clone(), Vec::new()),
        };
        debug!(
            target: "plexus::watch",
            bus = %bus,
            incremental = matches!(strategy, Strategy::Incremental { .. }),
            items = current.len(),
            "watcher started"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                bus,
                plan,
                strategy,
                source,
                debounce,
                runtime: Handle::current(),
                state: Mutex::new(WatchState {
                    current,
                    leaf,
                    rev: 0,
                }),
                subscribers: RwLock::new(Vec::new()),
                pending: Mutex::new(Pending::default()),
                apply_lock: tokio::sync::Mutex::new(()),
                attached: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Registers a callback for the given event kinds.
    pub fn on<F>(&self, rules: &[DeltaOp], callback: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.shared.subscribers.write().push(Subscriber {
            rules: rules.to_vec(),
            callback: Arc::new(callback),
        });
    }

    pub fn bus(&self) -> &str {
        &self.shared.bus
    }

    pub fn plan(&self) -> &Plan {
        &self.shared.plan
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self.shared.strategy, Strategy::Incremental { .. })
    }

    pub fn current(&self) -> BusList {
        self.shared.state.lock().current.clone()
    }

    pub fn revision(&self) -> u64 {
        self.shared.state.lock().rev
    }

    /// Queues a delta. Deltas arriving within the debounce window coalesce
    /// into one recomputation; each push restarts the window.
    pub fn push(&self, delta: Delta) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        if delta.bus != self.shared.bus {
            trace!(target: "plexus::watch", bus = %delta.bus, "ignoring delta for other bus");
            return;
        }
        let mut pending = self.shared.pending.lock();
        pending.deltas.push(delta);
        pending.generation += 1;
        let generation = pending.generation;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        let shared = self.shared.clone();
        pending.timer = Some(self.shared.runtime.spawn(async move {
            if !shared.debounce.is_zero() {
                tokio::time::sleep(shared.debounce).await;
            }
            let batch = {
                let mut pending = shared.pending.lock();
                if pending.generation != generation {
                    return;
                }
                pending.timer = None;
                std::mem::take(&mut pending.deltas)
            };
            if let Err(err) = shared.process(batch).await {
                warn!(target: "plexus::watch", bus = %shared.bus, %err, "watch recomputation failed");
            }
        }));
    }

    /// Applies whatever is queued right now, skipping the debounce wait.
    pub async fn flush(&self) -> Result<Option<Notification>, WatchError> {
        let batch = {
            let mut pending = self.shared.pending.lock();
            pending.generation += 1;
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut pending.deltas)
        };
        self.shared.process(batch).await
    }

    /// Applies deltas immediately, in order, as one recomputation.
    pub async fn apply(&self, deltas: Vec<Delta>) -> Result<Option<Notification>, WatchError> {
        let deltas = deltas
            .into_iter()
            .filter(|d| d.bus == self.shared.bus)
            .collect();
        self.shared.process(deltas).await
    }

    /// Full reload against the source.
    pub async fn refresh(&self) -> Result<Option<Notification>, WatchError> {
        self.shared.reload_and_notify(None, 0).await
    }

    /// Full reload known to reflect the source at bus revision `rev` or later,
    /// e.g. right after a subscription was acknowledged.
    pub async fn resync(&self, rev: u64) -> Result<Option<Notification>, WatchError> {
        let marker = Delta {
            bus: self.shared.bus.clone(),
            rev,
            op: DeltaOp::Change,
            topic: None,
            payload: Value::Null,
            ts: 0.0,
        };
        self.shared.reload_and_notify(Some(&marker), 0).await
    }

    /// Feeds this watcher from a hub until [`Watcher::stop`].
    pub fn attach(&self, hub: &ChangeHub) {
        let mut rx = hub.subscribe();
        let watcher = self.clone();
        let task = self.shared.runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(delta) => watcher.push(delta),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(target: "plexus::watch", bus = %watcher.bus(), missed, "watcher lagged; reloading");
                        if let Err(err) = watcher.refresh().await {
                            warn!(target: "plexus::watch", %err, "reload after lag failed");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.shared.attached.lock().replace(task) {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        self.shared.closed.store(true, Ordering::Release);
        if let Some(task) = self.shared.attached.lock().take() {
            task.abort();
        }
        let mut pending = self.shared.pending.lock();
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.deltas.clear();
    }
}

fn recompute(
    bus: &str,
    params: &QueryParams,
    ops: &[UnaryOp],
    leaf: &[Record],
) -> Result<BusList, QueryError> {
    let mut list = BusList::from_get(bus, params.clone(), params.apply_limit(leaf.to_vec()));
    for op in ops {
        list = list.apply(op.clone())?;
    }
    Ok(list)
}

fn decode_payload(payload: &Value, kind: Option<KindTag>) -> Option<Record> {
    match (payload.get("kind").is_some(), kind) {
        (true, _) => Record::from_raw(payload.clone()).ok(),
        (false, Some(kind)) => Record::from_raw_as(kind, payload.clone()).ok(),
        (false, None) => None,
    }
}

/// Patches the leaf snapshot. Returns false when the delta cannot be applied
/// locally and a full reload is needed.
///
/// `add` and `change` are upserts: the previous version of the key is dropped
/// and the new one, if it still matches, becomes the newest entry. This is the
/// order a store keeping one record per key reports on a fresh fetch.
fn apply_to_leaf(leaf: &mut Vec<Record>, delta: &Delta, params: &QueryParams, kind: Option<KindTag>) -> bool {
    if let (Some(wanted), Some(topic)) = (&params.topic, &delta.topic) {
        if wanted != topic {
            return true;
        }
    }
    let Some(record) = decode_payload(&delta.payload, kind) else {
        return false;
    };
    let key = record.dedupe_key();
    let position = leaf.iter().position(|r| r.dedupe_key() == key);
    match delta.op {
        DeltaOp::Add | DeltaOp::Change => {
            let matches = params.matches(&record);
            if params.limit.is_some() && position.is_some() && !matches {
                // a removal may expose records that were cut off by the limit
                return false;
            }
            if let Some(pos) = position {
                leaf.remove(pos);
            }
            if matches {
                leaf.push(record);
            }
        }
        DeltaOp::Del => {
            if params.limit.is_some() && position.is_some() {
                return false;
            }
            if let Some(pos) = position {
                leaf.remove(pos);
            }
        }
    }
    if let Some(limit) = params.limit {
        if leaf.len() > limit {
            let excess = leaf.len() - limit;
            leaf.drain(..excess);
        }
    }
    true
}

struct Diff {
    added: Vec<Record>,
    removed: Vec<Record>,
    changed: Vec<Record>,
}

fn diff(previous: &BusList, next: &BusList) -> Diff {
    let before: HashMap<String, &Record> = previous.iter().map(|r| (r.dedupe_key(), r)).collect();
    let after: HashSet<String> = next.key_set();
    let mut added = Vec::new();
    let mut changed = Vec::new();
    for record in next.iter() {
        match before.get(&record.dedupe_key()) {
            None => added.push(record.clone()),
            Some(old) if !old.same_payload(record) => changed.push(record.clone()),
            Some(_) => {}
        }
    }
    let removed = previous
        .iter()
        .filter(|r| !after.contains(&r.dedupe_key()))
        .cloned()
        .collect();
    Diff {
        added,
        removed,
        changed,
    }
}

impl Shared {
    async fn process(&self, batch: Vec<Delta>) -> Result<Option<Notification>, WatchError> {
        let Some(last) = batch.last().cloned() else {
            return Ok(None);
        };
        let _serial = self.apply_lock.lock().await;
        if let Strategy::Incremental { params, ops, kind } = &self.strategy {
            let mut leaf = self.state.lock().leaf.clone();
            let patched = batch.iter().all(|d| apply_to_leaf(&mut leaf, d, params, *kind));
            if patched {
                let next = recompute(&self.bus, params, ops, &leaf)?;
                return Ok(self.commit(next, leaf, &last, batch.len(), false));
            }
            debug!(target: "plexus::watch", bus = %self.bus, "delta not locally replayable; reloading");
        }
        self.reload_inner(Some(&last), batch.len()).await
    }

    async fn reload_and_notify(
        &self,
        last: Option<&Delta>,
        coalesced: usize,
    ) -> Result<Option<Notification>, WatchError> {
        let _serial = self.apply_lock.lock().await;
        self.reload_inner(last, coalesced).await
    }

    async fn reload_inner(
        &self,
        last: Option<&Delta>,
        coalesced: usize,
    ) -> Result<Option<Notification>, WatchError> {
        let (next, leaf) = match &self.strategy {
            Strategy::Incremental { params, ops, .. } => {
                let leaf = self.source.fetch(&self.bus, params).await?;
                (recompute(&self.bus, params, ops, &leaf)?, leaf)
            }
            Strategy::Reload => (self.source.replay(&self.plan).await?, Vec::new()),
        };
        let marker = last.cloned().unwrap_or_else(|| Delta {
            bus: self.bus.clone(),
            rev: self.state.lock().rev,
            op: DeltaOp::Change,
            topic: None,
            payload: Value::Null,
            ts: 0.0,
        });
        Ok(self.commit(next, leaf, &marker, coalesced, true))
    }

    fn commit(
        &self,
        next: BusList,
        leaf: Vec<Record>,
        last: &Delta,
        coalesced: usize,
        reloaded: bool,
    ) -> Option<Notification> {
        let notification = {
            let mut state = self.state.lock();
            let Diff {
                added,
                removed,
                changed,
            } = diff(&state.current, &next);
            state.current = next.clone();
            state.leaf = leaf;
            state.rev = state.rev.max(last.rev);
            if added.is_empty() && removed.is_empty() && changed.is_empty() {
                trace!(target: "plexus::watch", bus = %self.bus, rev = state.rev, "no visible change");
                return None;
            }
            Notification {
                bus: self.bus.clone(),
                rev: state.rev,
                op: last.op,
                payload: last.payload.clone(),
                added,
                removed,
                changed,
                current: next,
                coalesced,
                reloaded,
            }
        };
        let subscribers: Vec<Callback> = self
            .subscribers
            .read()
            .iter()
            .filter(|s| notification.interests(&s.rules))
            .map(|s| s.callback.clone())
            .collect();
        for callback in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(&notification))).is_err() {
                warn!(target: "plexus::watch", bus = %self.bus, "watch callback panicked");
            }
        }
        Some(notification)
    }
}
