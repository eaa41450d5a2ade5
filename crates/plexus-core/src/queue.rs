use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

const DROP_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Refuse the incoming item.
    #[default]
    DropNewest,
    /// Evict the oldest queued item to make room.
    DropOldest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    DroppedNewest,
    DroppedOldest,
    Closed,
}

struct Inner<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    dropped: AtomicU64,
    last_drop_log: Mutex<Option<Instant>>,
    closed: std::sync::atomic::AtomicBool,
}

/// Bounded FIFO that never blocks producers. On overflow it drops per
/// [`OverflowPolicy`] and logs at most once per interval.
pub struct LossyQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for LossyQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> LossyQueue<T> {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                items: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                policy,
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                last_drop_log: Mutex::new(None),
                closed: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        let outcome = {
            let mut items = self.inner.items.lock();
            if items.len() < self.inner.capacity {
                items.push_back(item);
                PushOutcome::Queued
            } else {
                match self.inner.policy {
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                        items.push_back(item);
                        PushOutcome::DroppedOldest
                    }
                }
            }
        };
        match outcome {
            PushOutcome::Queued | PushOutcome::DroppedOldest => self.inner.notify.notify_one(),
            _ => {}
        }
        if matches!(
            outcome,
            PushOutcome::DroppedNewest | PushOutcome::DroppedOldest
        ) {
            self.note_drop();
        }
        outcome
    }

    fn note_drop(&self) {
        let total = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        counter!("plexus_queue_dropped_total", "queue" => self.inner.name).increment(1);
        let mut last = self.inner.last_drop_log.lock();
        let due = last
            .map(|at| at.elapsed() >= DROP_LOG_INTERVAL)
            .unwrap_or(true);
        if due {
            *last = Some(Instant::now());
            warn!(
                target: "plexus::queue",
                queue = self.inner.name,
                dropped_total = total,
                capacity = self.inner.capacity,
                "queue full; dropping"
            );
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.items.lock().pop_front()
    }

    /// Waits for the next item. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(item) = self.pop() {
                return Some(item);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_newest_keeps_existing_items() {
        let q = LossyQueue::new("t", 2, OverflowPolicy::DropNewest);
        assert_eq!(q.push(1), PushOutcome::Queued);
        assert_eq!(q.push(2), PushOutcome::Queued);
        assert_eq!(q.push(3), PushOutcome::DroppedNewest);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn drop_oldest_keeps_latest_items() {
        let q = LossyQueue::new("t", 2, OverflowPolicy::DropOldest);
        for i in 1..=4 {
            q.push(i);
        }
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(4));
        assert_eq!(q.dropped(), 2);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_ends_on_close() {
        let q = LossyQueue::new("t", 4, OverflowPolicy::DropNewest);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(v) = q.recv().await {
                    seen.push(v);
                }
                seen
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.push("a");
        q.push("b");
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.close();
        let seen = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer finished")
            .expect("join");
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(q.push("late"), PushOutcome::Closed);
    }
}
