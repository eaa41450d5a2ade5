use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use plexus_protocol::{now_ts, Delta, DeltaOp};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_RING_CAPACITY: usize = 256;

#[derive(Default)]
struct BusLog {
    rev: u64,
    ring: VecDeque<Delta>,
}

/// Per-bus revision counter plus a short ring of recent deltas.
///
/// Every recorded change bumps the bus revision by one and is fanned out to
/// live subscribers. Late joiners catch up with [`ChangeHub::since`] as long
/// as the revision they hold is still inside the ring.
pub struct ChangeHub {
    logs: Mutex<HashMap<String, BusLog>>,
    tx: broadcast::Sender<Delta>,
    capacity: usize,
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl ChangeHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _rx) = broadcast::channel(capacity.max(16));
        Self {
            logs: Mutex::new(HashMap::new()),
            tx,
            capacity,
        }
    }

    pub fn record(&self, bus: &str, op: DeltaOp, topic: Option<&str>, payload: Value) -> Delta {
        let delta = {
            let mut logs = self.logs.lock();
            let log = logs.entry(bus.to_string()).or_default();
            log.rev += 1;
            let delta = Delta {
                bus: bus.to_string(),
                rev: log.rev,
                op,
                topic: topic.map(str::to_string),
                payload,
                ts: now_ts(),
            };
            if log.ring.len() == self.capacity {
                log.ring.pop_front();
            }
            log.ring.push_back(delta.clone());
            delta
        };
        trace!(target: "plexus::hub", bus = %delta.bus, rev = delta.rev, op = delta.op.as_str(), "delta recorded");
        let _ = self.tx.send(delta.clone());
        delta
    }

    pub fn revision(&self, bus: &str) -> u64 {
        self.logs.lock().get(bus).map(|log| log.rev).unwrap_or(0)
    }

    /// Deltas newer than `rev`, oldest first.
    ///
    /// Returns `None` when `rev` has already been rotated out of the ring and
    /// the caller must fall back to a full reload.
    pub fn since(&self, bus: &str, rev: u64) -> Option<Vec<Delta>> {
        let logs = self.logs.lock();
        let Some(log) = logs.get(bus) else {
            return Some(Vec::new());
        };
        if rev >= log.rev {
            return Some(Vec::new());
        }
        let oldest = log.ring.front().map(|d| d.rev).unwrap_or(log.rev + 1);
        if rev + 1 < oldest {
            return None;
        }
        Some(log.ring.iter().filter(|d| d.rev > rev).cloned().collect())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Delta> {
        self.tx.subscribe()
    }

    pub fn buses(&self) -> Vec<(String, u64)> {
        let logs = self.logs.lock();
        let mut out: Vec<_> = logs.iter().map(|(k, v)| (k.clone(), v.rev)).collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn revisions_are_per_bus_and_monotonic() {
        let hub = ChangeHub::new(8);
        assert_eq!(hub.record("messages", DeltaOp::Add, None, json!({"n": 1})).rev, 1);
        assert_eq!(hub.record("messages", DeltaOp::Add, None, json!({"n": 2})).rev, 2);
        assert_eq!(hub.record("events", DeltaOp::Del, None, json!({})).rev, 1);
        assert_eq!(hub.revision("messages"), 2);
        assert_eq!(hub.revision("unknown"), 0);
    }

    #[test]
    fn since_replays_from_ring_or_reports_gap() {
        let hub = ChangeHub::new(3);
        for n in 0..5 {
            hub.record("messages", DeltaOp::Add, Some("chat"), json!({"n": n}));
        }
        let tail = hub.since("messages", 3).expect("inside ring");
        assert_eq!(tail.iter().map(|d| d.rev).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(tail[0].topic.as_deref(), Some("chat"));
        assert!(hub.since("messages", 5).expect("up to date").is_empty());
        // revisions 1 and 2 were rotated out
        assert!(hub.since("messages", 1).is_none());
        assert_eq!(hub.since("messages", 2).expect("oldest kept").len(), 3);
    }

    #[tokio::test]
    async fn subscribers_receive_recorded_deltas() {
        let hub = ChangeHub::default();
        let mut rx = hub.subscribe();
        hub.record("lifecycle", DeltaOp::Change, None, json!({"state": "ready"}));
        let delta = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("delta in time")
            .expect("delta");
        assert_eq!(delta.bus, "lifecycle");
        assert_eq!(delta.op, DeltaOp::Change);
    }
}
