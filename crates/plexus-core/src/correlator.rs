//! Request/response correlation across task and thread boundaries.
//!
//! Callers [`Correlator::register`] before sending a request, then wait on the
//! returned [`Ticket`]. A reader delivers replies by id. Replies nobody waits
//! for are kept in a bounded pending cache so a late registration can still
//! collect them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::{Condvar, Mutex};
use plexus_protocol::{ErrorCode, ErrorInfo};
use tokio::sync::Notify;
use tracing::{debug, warn};

pub const DEFAULT_PENDING_CAPACITY: usize = 256;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CorrelatorError {
    #[error("no reply for `{id}` within {waited_ms}ms")]
    Timeout { id: String, waited_ms: u64 },
    #[error("correlator closed while waiting for `{id}`")]
    Closed { id: String },
    #[error("blocking `{operation}` called inside handler `{handler}`")]
    PolicyViolation { handler: String, operation: String },
}

impl From<CorrelatorError> for ErrorInfo {
    fn from(err: CorrelatorError) -> Self {
        let code = match err {
            CorrelatorError::Timeout { .. } => ErrorCode::Timeout,
            CorrelatorError::Closed { .. } => ErrorCode::Communication,
            CorrelatorError::PolicyViolation { .. } => ErrorCode::PolicyViolation,
        };
        ErrorInfo::new(code, err.to_string())
    }
}

/// Outcome of [`Correlator::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Waiter,
    Orphan,
}

/// A registered interest in one reply id.
#[derive(Debug)]
#[must_use = "a ticket must be waited on or cancelled"]
pub struct Ticket {
    id: String,
}

impl Ticket {
    pub fn id(&self) -> &str {
        &self.id
    }
}

type OrphanHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Slot<T> {
    value: Option<T>,
    notify: Arc<Notify>,
}

struct State<T> {
    waiting: HashMap<String, Slot<T>>,
    pending: HashMap<String, T>,
    pending_order: VecDeque<String>,
    closed: bool,
}

struct Inner<T> {
    name: &'static str,
    state: Mutex<State<T>>,
    cond: Condvar,
    pending_capacity: usize,
    orphans: AtomicU64,
    on_orphan: Mutex<Option<OrphanHook>>,
}

/// Removes an abandoned registration when an async wait is dropped mid-flight.
struct SlotGuard<'a, T> {
    inner: &'a Inner<T>,
    id: &'a str,
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.waiting.remove(self.id) {
            if slot.value.is_some() {
                debug!(target: "plexus::correlator", name = self.inner.name, id = %self.id, "reply discarded with abandoned wait");
            }
        }
    }
}

pub struct Correlator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Correlator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Correlator<T> {
    pub fn new(name: &'static str, pending_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    waiting: HashMap::new(),
                    pending: HashMap::new(),
                    pending_order: VecDeque::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
                pending_capacity: pending_capacity.max(1),
                orphans: AtomicU64::new(0),
                on_orphan: Mutex::new(None),
            }),
        }
    }

    /// Called with the reply id whenever a reply arrives with no live waiter.
    pub fn on_orphan<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.inner.on_orphan.lock() = Some(Arc::new(hook));
    }

    /// Registers interest under a fresh UUID v4.
    pub fn register(&self) -> Ticket {
        self.register_id(uuid::Uuid::new_v4().to_string())
    }

    /// Registers interest under `id`. A reply already cached for `id` is
    /// moved into the slot and resolves the next wait immediately.
    pub fn register_id(&self, id: impl Into<String>) -> Ticket {
        let id = id.into();
        let mut state = self.inner.state.lock();
        let early = state.pending.remove(&id);
        if early.is_some() {
            state.pending_order.retain(|p| p != &id);
        }
        state.waiting.insert(
            id.clone(),
            Slot {
                value: early,
                notify: Arc::new(Notify::new()),
            },
        );
        Ticket { id }
    }

    /// Drops a registration without waiting, e.g. after a failed send.
    pub fn cancel(&self, ticket: Ticket) {
        self.inner.state.lock().waiting.remove(&ticket.id);
    }

    pub fn deliver(&self, id: &str, value: T) -> Delivery {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.waiting.get_mut(id) {
            slot.value = Some(value);
            slot.notify.notify_one();
            drop(state);
            self.inner.cond.notify_all();
            return Delivery::Waiter;
        }
        state.pending.insert(id.to_string(), value);
        state.pending_order.retain(|p| p != id);
        state.pending_order.push_back(id.to_string());
        while state.pending_order.len() > self.inner.pending_capacity {
            if let Some(oldest) = state.pending_order.pop_front() {
                state.pending.remove(&oldest);
                counter!("plexus_correlator_pending_evicted_total", "correlator" => self.inner.name).increment(1);
                debug!(target: "plexus::correlator", name = self.inner.name, id = %oldest, "evicted pending reply");
            }
        }
        drop(state);
        let total = self.inner.orphans.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("plexus_correlator_orphans_total", "correlator" => self.inner.name).increment(1);
        warn!(
            target: "plexus::correlator",
            name = self.inner.name,
            id = %id,
            orphans = total,
            "reply without waiter cached as pending"
        );
        let hook = self.inner.on_orphan.lock().clone();
        if let Some(hook) = hook {
            hook(id);
        }
        Delivery::Orphan
    }

    /// Fails every current and future wait with [`CorrelatorError::Closed`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        for slot in state.waiting.values() {
            slot.notify.notify_one();
        }
        drop(state);
        self.inner.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Takes a cached orphan reply, if any.
    pub fn take_pending(&self, id: &str) -> Option<T> {
        let mut state = self.inner.state.lock();
        let value = state.pending.remove(id);
        if value.is_some() {
            state.pending_order.retain(|p| p != id);
        }
        value
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn waiting_len(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    pub fn orphan_count(&self) -> u64 {
        self.inner.orphans.load(Ordering::Relaxed)
    }

    /// Resolves a ready slot, or reports closure. `None` means keep waiting.
    fn poll_slot(state: &mut State<T>, id: &str) -> Option<Result<T, CorrelatorError>> {
        let ready = state
            .waiting
            .get(id)
            .map(|slot| slot.value.is_some())
            .unwrap_or(false);
        if ready {
            let slot = state.waiting.remove(id)?;
            return slot.value.map(Ok);
        }
        if state.closed || !state.waiting.contains_key(id) {
            state.waiting.remove(id);
            return Some(Err(CorrelatorError::Closed { id: id.to_string() }));
        }
        None
    }

    fn expire(&self, id: &str, started: Instant) -> Result<T, CorrelatorError> {
        let mut state = self.inner.state.lock();
        // a reply may have landed between the deadline and the lock
        if let Some(outcome) = Self::poll_slot(&mut state, id) {
            return outcome;
        }
        state.waiting.remove(id);
        Err(CorrelatorError::Timeout {
            id: id.to_string(),
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Dropping the returned future before it resolves releases the slot, so a
    /// reply arriving afterwards is treated as an orphan.
    pub async fn wait(&self, ticket: Ticket, timeout: Duration) -> Result<T, CorrelatorError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let _slot = SlotGuard {
            inner: &self.inner,
            id: &ticket.id,
        };
        loop {
            let notify = {
                let mut state = self.inner.state.lock();
                if let Some(outcome) = Self::poll_slot(&mut state, &ticket.id) {
                    return outcome;
                }
                match state.waiting.get(&ticket.id) {
                    Some(slot) => slot.notify.clone(),
                    None => return Err(CorrelatorError::Closed { id: ticket.id.clone() }),
                }
            };
            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return self.expire(&ticket.id, started);
            }
        }
    }

    /// Blocking wait for threads outside the async runtime.
    pub fn wait_blocking(&self, ticket: Ticket, timeout: Duration) -> Result<T, CorrelatorError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = Self::poll_slot(&mut state, &ticket.id) {
                return outcome;
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                drop(state);
                return self.expire(&ticket.id, started);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn unrelated_reply_does_not_disturb_waiter() {
        let corr: Correlator<&'static str> = Correlator::new("test", 8);
        let r1 = corr.register();
        let r1_id = r1.id().to_string();

        let waiter = {
            let corr = corr.clone();
            tokio::spawn(async move { corr.wait(r1, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(corr.deliver("r2-unrelated", "two"), Delivery::Orphan);
        assert_eq!(corr.deliver(&r1_id, "one"), Delivery::Waiter);

        let got = waiter.await.expect("join").expect("resolved");
        assert_eq!(got, "one");
        assert_eq!(corr.orphan_count(), 1);
        assert_eq!(corr.take_pending("r2-unrelated"), Some("two"));
        assert_eq!(corr.waiting_len(), 0);
    }

    #[tokio::test]
    async fn timeout_reports_id_and_clears_slot() {
        let corr: Correlator<u32> = Correlator::new("test", 8);
        let ticket = corr.register_id("slow");
        let err = corr
            .wait(ticket, Duration::from_millis(30))
            .await
            .expect_err("times out");
        assert!(matches!(err, CorrelatorError::Timeout { ref id, .. } if id == "slow"));
        assert_eq!(corr.waiting_len(), 0);
        // the late reply becomes an orphan
        assert_eq!(corr.deliver("slow", 1), Delivery::Orphan);
    }

    #[tokio::test]
    async fn aborted_wait_releases_its_slot() {
        let corr: Correlator<u32> = Correlator::new("test", 8);
        let ticket = corr.register_id("abandoned");
        let waiter = {
            let corr = corr.clone();
            tokio::spawn(async move { corr.wait(ticket, Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter.abort();
        assert!(waiter.await.expect_err("aborted").is_cancelled());

        assert_eq!(corr.waiting_len(), 0);
        assert_eq!(corr.deliver("abandoned", 7), Delivery::Orphan);
        assert_eq!(corr.orphan_count(), 1);
        assert_eq!(corr.take_pending("abandoned"), Some(7));
    }

    #[tokio::test]
    async fn outer_timeout_releases_the_slot() {
        let corr: Correlator<u32> = Correlator::new("test", 8);
        let ticket = corr.register_id("outer");
        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            corr.wait(ticket, Duration::from_secs(30)),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(corr.waiting_len(), 0);
        assert_eq!(corr.deliver("outer", 1), Delivery::Orphan);
    }

    #[tokio::test]
    async fn early_reply_is_picked_up_on_registration() {
        let corr: Correlator<u32> = Correlator::new("test", 8);
        corr.deliver("early", 5);
        let ticket = corr.register_id("early");
        let value = corr
            .wait(ticket, Duration::from_millis(10))
            .await
            .expect("cached");
        assert_eq!(value, 5);
        assert_eq!(corr.pending_len(), 0);
    }

    #[test]
    fn pending_cache_evicts_oldest() {
        let corr: Correlator<u32> = Correlator::new("test", 2);
        let seen = Arc::new(AtomicUsize::new(0));
        let hook_seen = seen.clone();
        corr.on_orphan(move |_| {
            hook_seen.fetch_add(1, Ordering::SeqCst);
        });
        corr.deliver("a", 1);
        corr.deliver("b", 2);
        corr.deliver("c", 3);
        assert_eq!(corr.pending_len(), 2);
        assert_eq!(corr.take_pending("a"), None);
        assert_eq!(corr.take_pending("c"), Some(3));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn blocking_wait_resolves_from_another_thread() {
        let corr: Correlator<String> = Correlator::new("test", 8);
        let ticket = corr.register();
        let id = ticket.id().to_string();
        let sender = corr.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.deliver(&id, "pong".to_string());
        });
        let reply = corr
            .wait_blocking(ticket, Duration::from_secs(1))
            .expect("reply");
        handle.join().expect("sender thread");
        assert_eq!(reply, "pong");
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let corr: Correlator<u32> = Correlator::new("test", 8);
        let ticket = corr.register();
        let closer = corr.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        let err = corr
            .wait(ticket, Duration::from_secs(1))
            .await
            .expect_err("closed");
        assert!(matches!(err, CorrelatorError::Closed { .. }));
        let late = corr.register();
        assert!(matches!(
            corr.wait_blocking(late, Duration::from_millis(10)),
            Err(CorrelatorError::Closed { .. })
        ));
    }
}
