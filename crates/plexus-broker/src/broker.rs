use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use plexus_events::ChangeHub;
use plexus_protocol::{
    BrokerMessage, BrokerReply, BrokerRequest, DeltaBatch, DeltaItem, DeltaOp, ErrorCode,
    ErrorInfo, SubscribeAck, SubscribeRequest, PROTOCOL_VERSION,
};
use plexus_query::{BusList, Plan, ReplaySource};
use plexus_records::QueryParams;
use plexus_topics as topics;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::store::{MessageStore, Published, StoredMessage};

pub const DEFAULT_RECENT_LIMIT: usize = 20;
const SESSION_QUEUE: usize = 1024;

pub type SessionId = u64;

#[derive(Clone, Debug)]
pub struct BrokerOptions {
    pub ring_capacity: usize,
    pub hub_capacity: usize,
    /// Name stamped into `from` of outgoing delta batches.
    pub name: String,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            ring_capacity: crate::store::DEFAULT_RING_CAPACITY,
            hub_capacity: plexus_events::DEFAULT_RING_CAPACITY,
            name: "broker".to_string(),
        }
    }
}

struct Subscription {
    session: SessionId,
    request: SubscribeRequest,
}

#[derive(Default)]
struct Sessions {
    next_id: SessionId,
    outboxes: HashMap<SessionId, mpsc::Sender<BrokerMessage>>,
    subscriptions: HashMap<String, Subscription>,
}

/// Authority for every bus: holds the store, the change hub and the
/// subscription table, and answers [`BrokerRequest`]s.
pub struct Broker {
    options: BrokerOptions,
    store: Arc<MessageStore>,
    hub: Arc<ChangeHub>,
    sessions: Mutex<Sessions>,
}

#[derive(Deserialize)]
struct PublishArgs {
    store: String,
    topic: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct RecentArgs {
    store: String,
    topic: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct QueryArgs {
    store: String,
    #[serde(default)]
    params: QueryParams,
}

#[derive(Deserialize)]
struct ReplayArgs {
    #[serde(default)]
    store: Option<String>,
    plan: Plan,
}

#[derive(Deserialize)]
struct DeleteArgs {
    store: String,
    topic: String,
    key: String,
}

#[derive(Deserialize)]
struct UnsubscribeArgs {
    sub_id: String,
}

fn parse<T: serde::de::DeserializeOwned>(op: &str, args: Value) -> Result<T, ErrorInfo> {
    serde_json::from_value(args).map_err(|err| {
        ErrorInfo::new(ErrorCode::InvalidRequest, format!("bad arguments for {op}: {err}"))
    })
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            store: Arc::new(MessageStore::new(options.ring_capacity)),
            hub: Arc::new(ChangeHub::new(options.hub_capacity)),
            sessions: Mutex::new(Sessions::default()),
            options,
        }
    }

    /// Shared handle, usable as a [`ReplaySource`] for local watchers.
    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn hub(&self) -> Arc<ChangeHub> {
        self.hub.clone()
    }

    /// Opens a delivery session. Delta batches for its subscriptions arrive on
    /// the returned receiver.
    pub fn open_session(&self) -> (SessionId, mpsc::Receiver<BrokerMessage>) {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        let mut sessions = self.sessions.lock();
        sessions.next_id += 1;
        let id = sessions.next_id;
        sessions.outboxes.insert(id, tx);
        (id, rx)
    }

    /// Drops a session and every subscription it owns.
    pub fn close_session(&self, session: SessionId) {
        let mut sessions = self.sessions.lock();
        sessions.outboxes.remove(&session);
        let before = sessions.subscriptions.len();
        sessions.subscriptions.retain(|_, sub| sub.session != session);
        let dropped = before - sessions.subscriptions.len();
        if dropped > 0 {
            debug!(target: "plexus::broker", session, dropped, "session closed; subscriptions removed");
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.sessions.lock().subscriptions.len()
    }

    /// Handles one request. Never fails; errors travel inside the reply.
    pub async fn handle(&self, req: BrokerRequest, session: Option<SessionId>) -> BrokerReply {
        if req.v != PROTOCOL_VERSION {
            return BrokerReply::err(
                req.req_id,
                ErrorInfo::new(
                    ErrorCode::UnsupportedVersion,
                    format!("protocol v{} not supported (want v{PROTOCOL_VERSION})", req.v),
                ),
            );
        }
        let from = req.from_plugin.clone();
        match self.dispatch(&req.op, req.args, session, from.as_deref()).await {
            Ok(value) => BrokerReply::ok(req.req_id, value),
            Err(err) => {
                debug!(target: "plexus::broker", op = %req.op, code = %err.code, error = %err.message, "request failed");
                BrokerReply::err(req.req_id, err)
            }
        }
    }

    async fn dispatch(
        &self,
        op: &str,
        args: Value,
        session: Option<SessionId>,
        from: Option<&str>,
    ) -> Result<Value, ErrorInfo> {
        match op {
            topics::OP_PUBLISH => {
                let args: PublishArgs = parse(op, args)?;
                let (message, rev) = self.publish(&args.store, &args.topic, args.payload, from);
                Ok(json!({"seq": message.seq, "rev": rev}))
            }
            topics::OP_GET_RECENT => {
                let args: RecentArgs = parse(op, args)?;
                let limit = args.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
                let items: Vec<Value> = self
                    .store
                    .get_recent(&args.store, &args.topic, limit)
                    .into_iter()
                    .map(|m| m.payload)
                    .collect();
                Ok(json!({"items": items}))
            }
            topics::OP_QUERY => {
                let args: QueryArgs = parse(op, args)?;
                let records = self.store.query(&args.store, &args.params);
                let items: Vec<Value> = records.iter().map(|r| r.dump()).collect();
                Ok(json!({"items": items}))
            }
            topics::OP_REPLAY => {
                let args: ReplayArgs = parse(op, args)?;
                if let Some(store) = &args.store {
                    let buses = args.plan.buses();
                    if !buses.iter().all(|b| b == store) {
                        return Err(ErrorInfo::new(
                            ErrorCode::InvalidRequest,
                            format!("plan reads {buses:?}, request names `{store}`"),
                        ));
                    }
                }
                let list = self.replay_plan(&args.plan).await?;
                Ok(json!({"items": list.dump(), "trace": list.trace()}))
            }
            topics::OP_DELETE => {
                let args: DeleteArgs = parse(op, args)?;
                let removed = self.delete(&args.store, &args.topic, &args.key, from);
                Ok(json!({"removed": removed}))
            }
            topics::OP_SUBSCRIBE => {
                let request: SubscribeRequest = parse(op, args)?;
                let session = session.ok_or_else(|| {
                    ErrorInfo::new(ErrorCode::InvalidRequest, "subscribe needs a delivery session")
                })?;
                let ack = self.subscribe(session, request)?;
                serde_json::to_value(ack)
                    .map_err(|err| ErrorInfo::new(ErrorCode::Internal, err.to_string()))
            }
            topics::OP_UNSUBSCRIBE => {
                let args: UnsubscribeArgs = parse(op, args)?;
                Ok(json!({"removed": self.unsubscribe(&args.sub_id)}))
            }
            topics::OP_STATS => {
                let stats = self.store.stats();
                let mut revisions = serde_json::Map::new();
                for (bus, rev) in self.hub.buses() {
                    revisions.insert(bus, json!(rev));
                }
                Ok(json!({
                    "store": stats,
                    "revisions": revisions,
                    "subscriptions": self.subscription_count(),
                }))
            }
            topics::OP_PING => Ok(json!({"pong": true, "v": PROTOCOL_VERSION})),
            other => Err(ErrorInfo::new(
                ErrorCode::UnknownOp,
                format!("unknown op `{other}`"),
            )),
        }
    }

    /// Appends, records the deltas and fans them out as one batch. Evicted
    /// entries go out as `del`, a replaced entry of the same topic turns the
    /// publish into a `change`, and one replaced from another topic as a `del`
    /// there followed by an `add`. Returns the stored message and the bus
    /// revision of its own delta.
    pub fn publish(
        &self,
        store: &str,
        topic: &str,
        payload: Value,
        from: Option<&str>,
    ) -> (StoredMessage, u64) {
        let Published {
            message,
            replaced,
            evicted,
        } = self.store.publish(store, topic, payload);
        let mut items: Vec<DeltaItem> = evicted
            .iter()
            .map(|old| self.record_delta(old, DeltaOp::Del))
            .collect();
        let op = match &replaced {
            Some(old) if old.topic == message.topic => DeltaOp::Change,
            Some(old) => {
                items.push(self.record_delta(old, DeltaOp::Del));
                DeltaOp::Add
            }
            None => DeltaOp::Add,
        };
        let own = self.record_delta(&message, op);
        let rev = own.rev;
        items.push(own);
        self.fan_out(from, items);
        (message, rev)
    }

    fn record_delta(&self, message: &StoredMessage, op: DeltaOp) -> DeltaItem {
        let delta = self
            .hub
            .record(&message.store, op, Some(&message.topic), message.payload.clone());
        DeltaItem {
            store: message.store.clone(),
            topic: message.topic.clone(),
            op,
            rev: delta.rev,
            payload: message.payload.clone(),
        }
    }

    pub fn delete(&self, store: &str, topic: &str, key: &str, from: Option<&str>) -> usize {
        let items: Vec<DeltaItem> = self
            .store
            .delete(store, topic, key)
            .iter()
            .map(|m| self.record_delta(m, DeltaOp::Del))
            .collect();
        let count = items.len();
        if count > 0 {
            self.fan_out(from, items);
        }
        count
    }

    pub async fn replay_plan(&self, plan: &Plan) -> Result<BusList, ErrorInfo> {
        if !plan.is_remote_replayable() {
            return Err(ErrorInfo::new(
                ErrorCode::Unreplayable,
                "plan carries an in-process predicate",
            ));
        }
        Ok(self.store.replay(plan).await?)
    }

    pub fn subscribe(
        &self,
        session: SessionId,
        request: SubscribeRequest,
    ) -> Result<SubscribeAck, ErrorInfo> {
        let mut sessions = self.sessions.lock();
        if !sessions.outboxes.contains_key(&session) {
            return Err(ErrorInfo::new(ErrorCode::NotFound, "unknown session"));
        }
        let sub_id = uuid::Uuid::new_v4().to_string();
        let rev = self.hub.revision(&request.bus);
        info!(target: "plexus::broker", sub_id = %sub_id, bus = %request.bus, session, "subscription added");
        sessions.subscriptions.insert(sub_id.clone(), Subscription { session, request });
        Ok(SubscribeAck { sub_id, rev })
    }

    pub fn unsubscribe(&self, sub_id: &str) -> bool {
        self.sessions.lock().subscriptions.remove(sub_id).is_some()
    }

    fn fan_out(&self, from: Option<&str>, items: Vec<DeltaItem>) {
        let from = from.unwrap_or(&self.options.name);
        let sessions = self.sessions.lock();
        // one batch per session, restricted to what its subscriptions accept
        let mut per_session: HashMap<SessionId, Vec<DeltaItem>> = HashMap::new();
        for sub in sessions.subscriptions.values() {
            let wanted = per_session.entry(sub.session).or_default();
            for item in &items {
                if item.store == sub.request.bus
                    && sub.request.accepts(item.op)
                    && !wanted.iter().any(|w| w.rev == item.rev && w.store == item.store)
                {
                    wanted.push(item.clone());
                }
            }
        }
        for (session, batch) in per_session {
            if batch.is_empty() {
                continue;
            }
            let Some(outbox) = sessions.outboxes.get(&session) else {
                continue;
            };
            let message = BrokerMessage::Batch(DeltaBatch::new(
                from,
                uuid::Uuid::new_v4().to_string(),
                batch,
            ));
            if let Err(err) = outbox.try_send(message) {
                warn!(target: "plexus::broker", session, %err, "subscriber outbox full or closed; batch dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_query::{UnaryOp, Watcher};
    use std::time::Duration;

    fn req(op: &str, args: Value) -> BrokerRequest {
        BrokerRequest::new(op, uuid::Uuid::new_v4().to_string(), args)
    }

    #[tokio::test]
    async fn publish_then_recent_returns_payload() {
        let broker = Broker::new(BrokerOptions::default());
        let reply = broker
            .handle(
                req(
                    topics::OP_PUBLISH,
                    json!({"store": "messages", "topic": "chat", "payload": {"message_id": "m1", "content": "hi"}}),
                ),
                None,
            )
            .await;
        assert!(reply.ok, "{reply:?}");
        let recent = broker
            .handle(
                req(
                    topics::OP_GET_RECENT,
                    json!({"store": "messages", "topic": "chat", "limit": 1}),
                ),
                None,
            )
            .await
            .into_result()
            .expect("recent");
        assert_eq!(recent["items"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn unknown_op_and_version_are_structured_errors() {
        let broker = Broker::new(BrokerOptions::default());
        let err = broker
            .handle(req("bus.teleport", json!({})), None)
            .await
            .into_result()
            .expect_err("unknown");
        assert_eq!(err.code, ErrorCode::UnknownOp);

        let mut old = req(topics::OP_PING, Value::Null);
        old.v = 0;
        let reply = broker.handle(old, None).await;
        assert_eq!(
            reply.error.map(|e| e.code),
            Some(ErrorCode::UnsupportedVersion)
        );
    }

    #[tokio::test]
    async fn subscribers_receive_matching_batches() {
        let broker = Broker::new(BrokerOptions::default());
        let (session, mut rx) = broker.open_session();
        let mut request = SubscribeRequest::new("messages");
        request.rules = vec![DeltaOp::Del];
        let ack = broker.subscribe(session, request).expect("subscribe");
        assert_eq!(ack.rev, 0);

        broker.publish("messages", "chat", json!({"message_id": "a"}), None);
        broker.publish("events", "chat", json!({"event_id": "e"}), None);
        assert!(rx.try_recv().is_err(), "add is filtered by rules");

        assert_eq!(broker.delete("messages", "chat", "a", Some("tester")), 1);
        match rx.try_recv().expect("batch") {
            BrokerMessage::Batch(batch) => {
                assert_eq!(batch.from, "tester");
                assert_eq!(batch.items.len(), 1);
                assert_eq!(batch.items[0].op, DeltaOp::Del);
                assert_eq!(batch.items[0].rev, 2);
            }
            other => panic!("unexpected {other:?}"),
        }

        broker.close_session(session);
        assert_eq!(broker.subscription_count(), 0);
    }

    fn ids(list: &BusList) -> Vec<String> {
        list.iter()
            .filter_map(|r| r.identity().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn watcher_tracks_replay_across_eviction_and_republish() {
        let broker = Broker::new(BrokerOptions {
            ring_capacity: 2,
            ..BrokerOptions::default()
        });
        let source: Arc<dyn ReplaySource> = broker.store().clone();
        let list = BusList::from_get("messages", QueryParams::default(), Vec::new());
        let watcher = Watcher::new(&list, source.clone(), Duration::ZERO)
            .await
            .expect("watcher");
        assert!(watcher.is_incremental());

        let hub = broker.hub();
        let mut seen = 0;
        let steps = [
            ("chat", json!({"message_id": "m0", "content": "a"})),
            ("chat", json!({"message_id": "m1"})),
            ("chat", json!({"message_id": "m0", "content": "b"})),
            ("chat", json!({"message_id": "m2"})),
            ("alerts", json!({"message_id": "m3"})),
            ("chat", json!({"message_id": "m3", "content": "moved"})),
        ];
        for (topic, payload) in steps {
            broker.publish("messages", topic, payload, None);
            let deltas = hub.since("messages", seen).expect("ring holds every delta");
            seen = hub.revision("messages");
            watcher.apply(deltas).await.expect("apply");
            let replayed = list.replay(&*source).await.expect("replay");
            assert_eq!(ids(&watcher.current()), ids(&replayed), "after {topic}");
        }
        assert_eq!(ids(&watcher.current()), vec!["m2", "m3"]);
        let current = watcher.current();
        assert_eq!(current.items()[1].field("content"), Some(json!("moved")));
    }

    #[tokio::test]
    async fn republish_emits_change_and_eviction_emits_del() {
        let broker = Broker::new(BrokerOptions {
            ring_capacity: 1,
            ..BrokerOptions::default()
        });
        let (session, mut rx) = broker.open_session();
        broker
            .subscribe(session, SubscribeRequest::new("messages"))
            .expect("subscribe");

        broker.publish("messages", "chat", json!({"message_id": "a"}), None);
        broker.publish("messages", "chat", json!({"message_id": "a", "content": "v2"}), None);
        broker.publish("messages", "chat", json!({"message_id": "b"}), None);

        let mut ops = Vec::new();
        while let Ok(BrokerMessage::Batch(batch)) = rx.try_recv() {
            ops.push(
                batch
                    .items
                    .iter()
                    .map(|item| (item.op, item.payload["message_id"].as_str().map(str::to_string)))
                    .collect::<Vec<_>>(),
            );
        }
        let a = Some("a".to_string());
        let b = Some("b".to_string());
        assert_eq!(
            ops,
            vec![
                vec![(DeltaOp::Add, a.clone())],
                vec![(DeltaOp::Change, a.clone())],
                vec![(DeltaOp::Del, a), (DeltaOp::Add, b)],
            ]
        );
        assert_eq!(broker.store().stats().total, 1);
    }

    #[tokio::test]
    async fn replay_runs_the_shared_engine() {
        let broker = Broker::new(BrokerOptions::default());
        for (id, priority) in [("a", 1), ("b", 7), ("c", 3)] {
            broker.publish("messages", "chat", json!({"message_id": id, "priority": priority}), None);
        }
        let plan = Plan::unary(
            UnaryOp::Sort {
                by: vec!["priority".into()],
                reverse: true,
            },
            Plan::get("messages", QueryParams::default()),
        );
        let result = broker
            .handle(
                req(topics::OP_REPLAY, json!({"store": "messages", "plan": plan})),
                None,
            )
            .await
            .into_result()
            .expect("replay");
        let ids: Vec<&str> = result["items"]
            .as_array()
            .expect("items")
            .iter()
            .filter_map(|v| v["message_id"].as_str())
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert_eq!(result["trace"].as_array().map(Vec::len), Some(2));
    }
}
