use serde::{Deserialize, Serialize};

use crate::record::{KindTag, Record};

/// Server-side filter set shared by `bus.query` and plan `Get` leaves.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct QueryParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<KindTag>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_min: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<f64>,
    /// Keep only the newest `limit` matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QueryParams {
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    pub fn record_type(mut self, ty: impl Into<String>) -> Self {
        self.record_type = Some(ty.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Record-level predicate; `topic` and `limit` are applied by the store.
    pub fn matches(&self, record: &Record) -> bool {
        if self.kind.is_some_and(|kind| kind != record.tag()) {
            return false;
        }
        if let Some(plugin) = &self.plugin_id {
            if record.plugin_id() != Some(plugin.as_str()) {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if record.source() != Some(source.as_str()) {
                return false;
            }
        }
        if let Some(ty) = &self.record_type {
            if record.record_type() != Some(ty.as_str()) {
                return false;
            }
        }
        if self.priority_min.is_some_and(|min| record.priority() < min) {
            return false;
        }
        if self.since.is_some() || self.until.is_some() {
            let Some(ts) = record.timestamp() else {
                return false;
            };
            if self.since.is_some_and(|s| ts < s) || self.until.is_some_and(|u| ts > u) {
                return false;
            }
        }
        true
    }

    /// Applies `limit` to an oldest-first sequence, keeping the newest tail.
    pub fn apply_limit<T>(&self, mut items: Vec<T>) -> Vec<T> {
        if let Some(limit) = self.limit {
            if items.len() > limit {
                items.drain(..items.len() - limit);
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_filter_on_every_dimension() {
        let record = Record::from_raw(json!({
            "kind": "message",
            "message_id": "m-1",
            "plugin_id": "echo",
            "source": "user",
            "type": "chat",
            "priority": 4,
            "timestamp": 50.0,
        }))
        .expect("parses");
        let base = QueryParams::default().plugin("echo").record_type("chat");
        assert!(base.matches(&record));
        assert!(!QueryParams::default().plugin("other").matches(&record));
        let mut wrong_kind = base.clone();
        wrong_kind.kind = Some(KindTag::Event);
        assert!(!wrong_kind.matches(&record));
        let mut window = base.clone();
        window.since = Some(60.0);
        assert!(!window.matches(&record));
        let mut prio = base;
        prio.priority_min = Some(5);
        assert!(!prio.matches(&record));
    }

    #[test]
    fn limit_keeps_newest_tail() {
        let params = QueryParams::default().limit(2);
        assert_eq!(params.apply_limit(vec![1, 2, 3, 4]), vec![3, 4]);
        assert_eq!(params.apply_limit(vec![1]), vec![1]);
    }

    #[test]
    fn type_field_uses_wire_name() {
        let params: QueryParams =
            serde_json::from_value(json!({"type": "chat", "kind": "message"})).expect("parses");
        assert_eq!(params.record_type.as_deref(), Some("chat"));
        assert_eq!(params.kind, Some(KindTag::Message));
    }
}
