//! Advisory deadlock detection for named mutexes.
//!
//! [`TrackedMutex`] records who holds it and who waits for it in a
//! [`LockTracker`]. When an acquisition times out the tracker reports the
//! holder, how long it has held the lock and any wait cycle through the
//! current thread. Nothing here ever breaks a lock.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use tracing::{error, warn};

static LOCK_TIMEOUT_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("PLEXUS_LOCK_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(5_000)
});

static CAPTURE_BACKTRACE: Lazy<bool> = Lazy::new(|| {
    std::env::var("PLEXUS_LOCK_BACKTRACE")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
});

static GLOBAL: Lazy<Arc<LockTracker>> = Lazy::new(|| Arc::new(LockTracker::new()));

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

const BACKTRACE_FRAMES: usize = 12;

#[derive(Clone, Debug)]
struct HolderInfo {
    thread: ThreadId,
    thread_name: String,
    acquired_at: Instant,
    location: &'static Location<'static>,
    backtrace: Option<String>,
}

#[derive(Clone, Debug)]
struct WaitInfo {
    lock: u64,
    since: Instant,
}

#[derive(Default)]
struct TrackerState {
    names: HashMap<u64, Arc<str>>,
    holders: HashMap<u64, HolderInfo>,
    waiting: HashMap<ThreadId, WaitInfo>,
    held: HashMap<ThreadId, Vec<u64>>,
}

/// Snapshot of a contended lock at the moment an acquisition gave up.
#[derive(Clone, Debug)]
pub struct ContentionReport {
    pub lock: String,
    pub holder_thread: Option<String>,
    pub held_for: Option<Duration>,
    pub location: Option<String>,
    pub backtrace: Option<String>,
    /// Lock names forming a wait cycle through the current thread.
    pub cycle: Option<Vec<String>>,
}

impl fmt::Display for ContentionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock `{}` contended", self.lock)?;
        if let Some(holder) = &self.holder_thread {
            write!(f, "; held by {holder}")?;
        }
        if let Some(held_for) = self.held_for {
            write!(f, " for {}ms", held_for.as_millis())?;
        }
        if let Some(location) = &self.location {
            write!(f, " (acquired at {location})")?;
        }
        if let Some(cycle) = &self.cycle {
            write!(f, "; cycle: {}", cycle.join(" -> "))?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms: {report}")]
    Timeout {
        waited_ms: u64,
        report: ContentionReport,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub enum LockDiagnostic {
    LongHold {
        lock: String,
        thread: String,
        held_for: Duration,
        location: String,
    },
    Stalled {
        thread: String,
        lock: String,
        waiting_for: Duration,
    },
}

pub struct LockTracker {
    state: Mutex<TrackerState>,
}

impl Default for LockTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn thread_label() -> String {
    let current = std::thread::current();
    match current.name() {
        Some(name) => name.to_string(),
        None => format!("{:?}", current.id()),
    }
}

fn short_backtrace() -> Option<String> {
    if !*CAPTURE_BACKTRACE {
        return None;
    }
    let full = std::backtrace::Backtrace::force_capture().to_string();
    Some(
        full.lines()
            .take(BACKTRACE_FRAMES * 2)
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

impl LockTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn global() -> Arc<LockTracker> {
        GLOBAL.clone()
    }

    fn register(&self, id: u64, name: Arc<str>) {
        self.state.lock().names.insert(id, name);
    }

    fn forget(&self, id: u64) {
        let mut state = self.state.lock();
        state.names.remove(&id);
        state.holders.remove(&id);
    }

    fn begin_wait(&self, id: u64) {
        self.state.lock().waiting.insert(
            std::thread::current().id(),
            WaitInfo {
                lock: id,
                since: Instant::now(),
            },
        );
    }

    fn end_wait(&self) {
        self.state.lock().waiting.remove(&std::thread::current().id());
    }

    fn acquired(&self, id: u64, location: &'static Location<'static>) {
        let thread = std::thread::current().id();
        let mut state = self.state.lock();
        state.waiting.remove(&thread);
        state.holders.insert(
            id,
            HolderInfo {
                thread,
                thread_name: thread_label(),
                acquired_at: Instant::now(),
                location,
                backtrace: short_backtrace(),
            },
        );
        state.held.entry(thread).or_default().push(id);
    }

    fn released(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(holder) = state.holders.remove(&id) {
            if let Some(list) = state.held.get_mut(&holder.thread) {
                list.retain(|l| *l != id);
                if list.is_empty() {
                    state.held.remove(&holder.thread);
                }
            }
        }
    }

    fn name_of(state: &TrackerState, id: u64) -> String {
        state
            .names
            .get(&id)
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("lock#{id}"))
    }

    /// Follows holder -> waits-for edges starting at `wanted`. Returns the
    /// locks on the path if it leads back to a lock held by `me`.
    fn find_cycle(state: &TrackerState, me: ThreadId, wanted: u64) -> Option<Vec<String>> {
        let mine = state.held.get(&me)?;
        let mut path = vec![Self::name_of(state, wanted)];
        let mut lock = wanted;
        for _ in 0..state.holders.len() + 1 {
            let holder = state.holders.get(&lock)?;
            if holder.thread == me {
                return None;
            }
            let next = state.waiting.get(&holder.thread)?.lock;
            path.push(Self::name_of(state, next));
            if mine.contains(&next) {
                return Some(path);
            }
            lock = next;
        }
        None
    }

    fn report(&self, id: u64) -> ContentionReport {
        let state = self.state.lock();
        let holder = state.holders.get(&id);
        ContentionReport {
            lock: Self::name_of(&state, id),
            holder_thread: holder.map(|h| h.thread_name.clone()),
            held_for: holder.map(|h| h.acquired_at.elapsed()),
            location: holder.map(|h| h.location.to_string()),
            backtrace: holder.and_then(|h| h.backtrace.clone()),
            cycle: Self::find_cycle(&state, std::thread::current().id(), id),
        }
    }

    /// Locks held longer than `long_hold` and waiters stuck at least as long.
    pub fn check_all(&self, long_hold: Duration) -> Vec<LockDiagnostic> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for (id, holder) in &state.holders {
            let held_for = holder.acquired_at.elapsed();
            if held_for >= long_hold {
                out.push(LockDiagnostic::LongHold {
                    lock: Self::name_of(&state, *id),
                    thread: holder.thread_name.clone(),
                    held_for,
                    location: holder.location.to_string(),
                });
            }
        }
        for (thread, wait) in &state.waiting {
            let waiting_for = wait.since.elapsed();
            if waiting_for >= long_hold {
                out.push(LockDiagnostic::Stalled {
                    thread: format!("{thread:?}"),
                    lock: Self::name_of(&state, wait.lock),
                    waiting_for,
                });
            }
        }
        for diag in &out {
            warn!(target: "plexus::locks", diagnostic = ?diag, "lock sweep");
        }
        out
    }
}

/// A named mutex whose holders and waiters are visible to a [`LockTracker`].
pub struct TrackedMutex<T> {
    id: u64,
    name: Arc<str>,
    inner: Mutex<T>,
    tracker: Arc<LockTracker>,
}

impl<T> TrackedMutex<T> {
    pub fn new(name: impl Into<Arc<str>>, value: T) -> Self {
        Self::with_tracker(name, value, LockTracker::global())
    }

    pub fn with_tracker(name: impl Into<Arc<str>>, value: T, tracker: Arc<LockTracker>) -> Self {
        let id = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        tracker.register(id, name.clone());
        Self {
            id,
            name,
            inner: Mutex::new(value),
            tracker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires within `timeout` or returns a contention report.
    #[track_caller]
    pub fn lock_timeout(&self, timeout: Duration) -> Result<TrackedGuard<'_, T>, LockError> {
        let location = Location::caller();
        if let Some(guard) = self.inner.try_lock() {
            self.tracker.acquired(self.id, location);
            return Ok(self.wrap(guard));
        }
        self.tracker.begin_wait(self.id);
        let started = Instant::now();
        match self.inner.try_lock_for(timeout) {
            Some(guard) => {
                self.tracker.acquired(self.id, location);
                Ok(self.wrap(guard))
            }
            None => {
                let report = self.tracker.report(self.id);
                self.tracker.end_wait();
                if report.cycle.is_some() {
                    error!(target: "plexus::locks", %report, "lock cycle detected");
                } else {
                    warn!(target: "plexus::locks", %report, "lock acquisition timed out");
                }
                Err(LockError::Timeout {
                    waited_ms: started.elapsed().as_millis() as u64,
                    report,
                })
            }
        }
    }

    /// Acquires, logging a contention report each time the default timeout
    /// (`PLEXUS_LOCK_TIMEOUT_MS`) elapses, then keeps waiting.
    #[track_caller]
    pub fn lock(&self) -> TrackedGuard<'_, T> {
        let location = Location::caller();
        let timeout = Duration::from_millis(*LOCK_TIMEOUT_MS);
        if let Some(guard) = self.inner.try_lock() {
            self.tracker.acquired(self.id, location);
            return self.wrap(guard);
        }
        self.tracker.begin_wait(self.id);
        loop {
            if let Some(guard) = self.inner.try_lock_for(timeout) {
                self.tracker.acquired(self.id, location);
                return self.wrap(guard);
            }
            let report = self.tracker.report(self.id);
            warn!(target: "plexus::locks", %report, "still waiting for lock");
        }
    }

    fn wrap<'a>(&'a self, guard: MutexGuard<'a, T>) -> TrackedGuard<'a, T> {
        TrackedGuard { guard, owner: self }
    }
}

impl<T> Drop for TrackedMutex<T> {
    fn drop(&mut self) {
        self.tracker.forget(self.id);
    }
}

pub struct TrackedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: &'a TrackedMutex<T>,
}

impl<T> Deref for TrackedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TrackedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TrackedGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.tracker.released(self.owner.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn timeout_reports_holder_and_location() {
        let tracker = Arc::new(LockTracker::new());
        let lock = Arc::new(TrackedMutex::with_tracker("store", 0u32, tracker));
        let guard = lock.lock();
        let contender = lock.clone();
        let err = std::thread::Builder::new()
            .name("contender".into())
            .spawn(move || contender.lock_timeout(Duration::from_millis(30)).err())
            .expect("spawn")
            .join()
            .expect("join")
            .expect("timed out");
        let LockError::Timeout { report, .. } = err;
        assert_eq!(report.lock, "store");
        assert!(report.held_for.is_some());
        assert!(report.location.as_deref().unwrap_or("").contains("locks.rs"));
        assert!(report.cycle.is_none());
        drop(guard);
        assert_eq!(*lock.lock_timeout(Duration::from_millis(30)).expect("free"), 0);
    }

    #[test]
    fn crossed_acquisition_reports_cycle() {
        let tracker = Arc::new(LockTracker::new());
        let first = Arc::new(TrackedMutex::with_tracker("first", (), tracker.clone()));
        let second = Arc::new(TrackedMutex::with_tracker("second", (), tracker));
        let barrier = Arc::new(Barrier::new(2));

        let worker = {
            let (first, second, barrier) = (first.clone(), second.clone(), barrier.clone());
            std::thread::spawn(move || {
                let _held = first.lock();
                barrier.wait();
                // released by the main thread once it gives up
                second.lock_timeout(Duration::from_secs(2)).is_ok()
            })
        };

        let held = second.lock();
        barrier.wait();
        std::thread::sleep(Duration::from_millis(50));
        let err = first
            .lock_timeout(Duration::from_millis(100))
            .err()
            .expect("contended");
        let LockError::Timeout { report, .. } = err;
        assert_eq!(
            report.cycle,
            Some(vec!["first".to_string(), "second".to_string()])
        );
        drop(held);
        assert!(worker.join().expect("worker"));
    }

    #[test]
    fn sweep_flags_long_holds_and_stalled_waiters() {
        let tracker = Arc::new(LockTracker::new());
        let lock = Arc::new(TrackedMutex::with_tracker("slow", (), tracker.clone()));
        let guard = lock.lock();
        let waiter = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let _ = lock.lock_timeout(Duration::from_millis(300));
            })
        };
        std::thread::sleep(Duration::from_millis(80));
        let diags = tracker.check_all(Duration::from_millis(40));
        assert!(diags
            .iter()
            .any(|d| matches!(d, LockDiagnostic::LongHold { lock, .. } if lock == "slow")));
        assert!(diags
            .iter()
            .any(|d| matches!(d, LockDiagnostic::Stalled { lock, .. } if lock == "slow")));
        drop(guard);
        waiter.join().expect("waiter");
        assert!(tracker.check_all(Duration::ZERO).is_empty());
    }
}
