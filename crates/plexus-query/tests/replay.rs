use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use plexus_query::{BusList, QueryError, ReplaySource};
use plexus_records::{FilterSpec, QueryParams, Record};
use serde_json::json;

#[derive(Default)]
struct Bus {
    records: Mutex<Vec<Record>>,
}

#[async_trait]
impl ReplaySource for Bus {
    async fn fetch(&self, bus: &str, params: &QueryParams) -> Result<Vec<Record>, QueryError> {
        assert_eq!(bus, "messages");
        let records = self.records.lock();
        Ok(params.apply_limit(records.iter().filter(|r| params.matches(r)).cloned().collect()))
    }
}

fn message(id: &str, priority: i64, plugin: &str) -> Record {
    Record::from_raw(json!({
        "kind": "message",
        "message_id": id,
        "priority": priority,
        "plugin_id": plugin,
    }))
    .expect("parses")
}

#[tokio::test]
async fn replay_recomputes_from_plan_alone() {
    let bus = Arc::new(Bus::default());
    bus.records.lock().extend([
        message("a", 1, "echo"),
        message("b", 4, "echo"),
        message("c", 3, "other"),
    ]);
    let params = QueryParams::default().plugin("echo");
    let fetched = bus.fetch("messages", &params).await.expect("fetch");
    let view = BusList::from_get("messages", params, fetched)
        .merge(&BusList::from_get("messages", QueryParams::default().plugin("other"), vec![message("c", 3, "other")]))
        .filter_spec(FilterSpec::new().priority_min(2))
        .expect("filter")
        .sort(&["priority"], true);
    assert_eq!(view.keys(), vec!["message:b", "message:c"]);

    bus.records.lock().push(message("d", 9, "echo"));
    let replayed = view.replay(bus.as_ref()).await.expect("replay");
    assert_eq!(replayed.keys(), vec!["message:d", "message:b", "message:c"]);
    assert!(replayed.explain().contains("merge"));
    // the original list is untouched
    assert_eq!(view.len(), 2);
}

#[tokio::test]
async fn replay_without_plan_is_an_error() {
    let bus = Bus::default();
    let bare = BusList::new(vec![message("a", 1, "echo")]);
    assert!(matches!(
        bare.replay(&bus).await,
        Err(QueryError::Unreplayable(_))
    ));
}
