//! In-process event plumbing for the host.
//!
//! [`Bus`] fans out lifecycle notices (plugin spawned, run updated, orphaned
//! replies) to whoever is listening; [`ChangeHub`] keeps per-bus revisions and
//! a replay ring of record deltas.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

mod hub;

pub use hub::{ChangeHub, DEFAULT_RING_CAPACITY};
pub use plexus_protocol::{Delta, DeltaOp};

/// Host event as seen by subscribers. `time` is RFC3339 with millisecond precision.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    /// True for `kind` itself and for dotted children (`plugin` matches `plugin.exited`).
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
            || (self.kind.starts_with(kind) && self.kind.as_bytes().get(kind.len()) == Some(&b'.'))
    }
}

#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Returns how many subscribers saw the event; zero when nobody listens.
    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) -> usize {
        let payload = serde_json::to_value(payload).unwrap_or_else(|err| {
            tracing::warn!(target: "plexus::events", %kind, error = %err, "event payload not serializable");
            json!({ "error": "unserializable payload" })
        });
        let envelope = Envelope {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.to_string(),
            payload,
        };
        self.tx.send(envelope).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_kinds_match_their_prefix_only() {
        let env = Envelope {
            time: String::new(),
            kind: "plugin.state.changed".into(),
            payload: Value::Null,
        };
        assert!(env.is("plugin.state.changed"));
        assert!(env.is("plugin"));
        assert!(env.is("plugin.state"));
        assert!(!env.is("plug"));
        assert!(!env.is("run"));
    }

    #[tokio::test]
    async fn publish_reports_listeners() {
        let bus = Bus::new(8);
        assert_eq!(bus.publish("run.updated", &json!({"run_id": "r1"})), 0);
        let mut rx = bus.subscribe();
        assert_eq!(bus.receiver_count(), 1);
        assert_eq!(bus.publish("run.updated", &json!({"run_id": "r2"})), 1);
        let env = rx.recv().await.expect("event");
        assert_eq!(env.kind, "run.updated");
        assert_eq!(env.payload["run_id"], json!("r2"));
    }
}
