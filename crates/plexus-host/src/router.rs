use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use plexus_broker::{Broker, BrokerClient};
use plexus_core::{LossyQueue, OverflowPolicy};
use plexus_protocol::{
    now_ts, BrokerRequest, Delta, ErrorCode, ErrorInfo, HostRequestBody, SubscribeAck,
    SubscribeRequest,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::host::{Host, PushHandler};

const FORWARD_QUEUE: usize = 1024;

/// Live hosts by plugin id, shared between the manager and the router.
pub type HostTable = Arc<RwLock<HashMap<String, Host>>>;

/// Where relayed bus operations end up.
#[derive(Clone)]
pub enum BusBackend {
    /// A broker living in this process.
    Local(Arc<Broker>),
    /// A broker reached over TCP.
    Remote(BrokerClient),
}

struct Subscription {
    plugin_id: String,
    request: SubscribeRequest,
    // id the remote broker assigned, if any
    remote_id: Option<String>,
}

type SubTable = Arc<RwLock<HashMap<String, Subscription>>>;

/// Routes host-bound requests from plugins: bus operations to the backend,
/// `plugin.trigger` to another host, and subscriptions into `BUS_CHANGE`
/// deliveries.
#[derive(Clone)]
pub struct HostRouter {
    backend: BusBackend,
    hosts: HostTable,
    subs: SubTable,
    forward: LossyQueue<(String, String, Delta)>,
    cancel: CancellationToken,
}

impl HostRouter {
    /// Starts the delta forwarding tasks. Must run inside a tokio runtime.
    pub fn new(backend: BusBackend, hosts: HostTable) -> Self {
        let router = Self {
            backend,
            hosts,
            subs: Arc::new(RwLock::new(HashMap::new())),
            forward: LossyQueue::new("bus-change", FORWARD_QUEUE, OverflowPolicy::DropOldest),
            cancel: CancellationToken::new(),
        };
        router.spawn_listener();
        router.spawn_delivery();
        router
    }

    pub fn backend(&self) -> &BusBackend {
        &self.backend
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.read().len()
    }

    /// Drops every subscription `plugin_id` holds.
    pub async fn forget_plugin(&self, plugin_id: &str) {
        let removed: Vec<(String, Option<String>)> = {
            let mut subs = self.subs.write();
            let ids: Vec<String> = subs
                .iter()
                .filter(|(_, s)| s.plugin_id == plugin_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| subs.remove(&id).map(|s| (id, s.remote_id)))
                .collect()
        };
        for (sub_id, remote) in &removed {
            if let (BusBackend::Remote(client), Some(remote)) = (&self.backend, remote) {
                if let Err(err) = client.unsubscribe(remote).await {
                    debug!(target: "plexus::supervisor", sub_id = %sub_id, error = %err, "remote unsubscribe failed");
                }
            }
        }
        if !removed.is_empty() {
            debug!(target: "plexus::supervisor", plugin = %plugin_id, count = removed.len(), "subscriptions dropped");
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.forward.close();
    }

    async fn bus_op(&self, from: &str, op: &str, args: Value) -> Result<Value, ErrorInfo> {
        match &self.backend {
            BusBackend::Local(broker) => {
                let mut request = BrokerRequest::new(op, uuid::Uuid::new_v4().to_string(), args);
                request.from_plugin = Some(from.to_string());
                broker.handle(request, None).await.into_result()
            }
            BusBackend::Remote(client) => client.request(op, args).await.map_err(Into::into),
        }
    }

    async fn trigger_plugin(
        &self,
        from: &str,
        plugin_id: &str,
        entry_id: &str,
        args: plexus_protocol::Args,
    ) -> Result<Value, ErrorInfo> {
        let host = self.hosts.read().get(plugin_id).cloned().ok_or_else(|| {
            ErrorInfo::new(ErrorCode::NotFound, format!("plugin `{plugin_id}` not loaded"))
        })?;
        debug!(target: "plexus::supervisor", from = %from, plugin = %plugin_id, entry = %entry_id, "relaying trigger");
        let envelope = host.trigger(entry_id, args, None).await?;
        if envelope.success {
            Ok(envelope.data)
        } else {
            Err(envelope
                .error
                .unwrap_or_else(|| ErrorInfo::new(ErrorCode::Execution, "handler failed")))
        }
    }

    async fn subscribe(&self, from: &str, request: SubscribeRequest) -> Result<Value, ErrorInfo> {
        let (sub_id, rev, remote_id) = match &self.backend {
            BusBackend::Local(broker) => (
                uuid::Uuid::new_v4().to_string(),
                broker.hub().revision(&request.bus),
                None,
            ),
            BusBackend::Remote(client) => {
                let ack = client.subscribe(&request).await?;
                (ack.sub_id.clone(), ack.rev, Some(ack.sub_id))
            }
        };
        info!(target: "plexus::supervisor", plugin = %from, sub_id = %sub_id, bus = %request.bus, "subscription relayed");
        self.subs.write().insert(
            sub_id.clone(),
            Subscription {
                plugin_id: from.to_string(),
                request,
                remote_id,
            },
        );
        serde_json::to_value(SubscribeAck { sub_id, rev })
            .map_err(|err| ErrorInfo::new(ErrorCode::Internal, err.to_string()))
    }

    async fn unsubscribe(&self, sub_id: &str) -> Result<Value, ErrorInfo> {
        let removed = self.subs.write().remove(sub_id);
        let Some(sub) = removed else {
            return Ok(json!({"removed": false}));
        };
        if let (BusBackend::Remote(client), Some(remote)) = (&self.backend, &sub.remote_id) {
            client.unsubscribe(remote).await?;
        }
        Ok(json!({"removed": true}))
    }

    fn route(subs: &SubTable, forward: &LossyQueue<(String, String, Delta)>, delta: Delta) {
        let subs = subs.read();
        for (sub_id, sub) in subs.iter() {
            if sub.request.bus == delta.bus && sub.request.accepts(delta.op) {
                forward.push((sub.plugin_id.clone(), sub_id.clone(), delta.clone()));
            }
        }
    }

    fn spawn_listener(&self) {
        let subs = self.subs.clone();
        let forward = self.forward.clone();
        let cancel = self.cancel.clone();
        match &self.backend {
            BusBackend::Local(broker) => {
                let mut rx = broker.hub().subscribe();
                tokio::spawn(async move {
                    loop {
                        let delta = tokio::select! {
                            _ = cancel.cancelled() => break,
                            delta = rx.recv() => delta,
                        };
                        match delta {
                            Ok(delta) => Self::route(&subs, &forward, delta),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(target: "plexus::supervisor", skipped, "change hub lagged; deltas lost");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }
            BusBackend::Remote(client) => {
                let mut rx = client.deltas();
                tokio::spawn(async move {
                    loop {
                        let batch = tokio::select! {
                            _ = cancel.cancelled() => break,
                            batch = rx.recv() => batch,
                        };
                        match batch {
                            Ok(batch) => {
                                let ts = if batch.ts > 0.0 { batch.ts } else { now_ts() };
                                for item in &batch.items {
                                    Self::route(&subs, &forward, item.to_delta(ts));
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(target: "plexus::supervisor", skipped, "broker batches lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
            }
        }
    }

    fn spawn_delivery(&self) {
        let forward = self.forward.clone();
        let hosts = self.hosts.clone();
        tokio::spawn(async move {
            while let Some((plugin_id, sub_id, delta)) = forward.recv().await {
                let host = hosts.read().get(&plugin_id).cloned();
                let Some(host) = host else {
                    continue;
                };
                if let Err(err) = host.deliver_bus_change(&sub_id, delta).await {
                    debug!(target: "plexus::supervisor", plugin = %plugin_id, sub_id = %sub_id, error = %err, "BUS_CHANGE not delivered");
                }
            }
        });
    }
}

#[async_trait]
impl PushHandler for HostRouter {
    async fn handle(&self, from: &str, body: HostRequestBody) -> Result<Value, ErrorInfo> {
        match body {
            HostRequestBody::Bus { op, args } => self.bus_op(from, &op, args).await,
            HostRequestBody::PluginTrigger {
                plugin_id,
                entry_id,
                args,
            } => self.trigger_plugin(from, &plugin_id, &entry_id, args).await,
            HostRequestBody::Subscribe(request) => self.subscribe(from, request).await,
            HostRequestBody::Unsubscribe { sub_id } => self.unsubscribe(&sub_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use plexus_broker::BrokerOptions;
    use plexus_protocol::DeltaOp;
    use plexus_topics as topics;

    use super::*;

    fn local_router() -> (HostRouter, Arc<Broker>) {
        let broker = Arc::new(Broker::new(BrokerOptions::default()));
        let hosts: HostTable = Arc::new(RwLock::new(HashMap::new()));
        (HostRouter::new(BusBackend::Local(broker.clone()), hosts), broker)
    }

    #[tokio::test]
    async fn bus_ops_reach_the_local_broker() {
        let (router, _broker) = local_router();
        router
            .handle(
                "writer",
                HostRequestBody::Bus {
                    op: topics::OP_PUBLISH.into(),
                    args: json!({"store": "messages", "topic": "chat", "payload": {"text": "hi"}}),
                },
            )
            .await
            .expect("publish");
        let recent = router
            .handle(
                "reader",
                HostRequestBody::Bus {
                    op: topics::OP_GET_RECENT.into(),
                    args: json!({"store": "messages", "topic": "chat", "limit": 1}),
                },
            )
            .await
            .expect("get_recent");
        assert_eq!(recent["items"], json!([{"text": "hi"}]));
        router.close();
    }

    #[tokio::test]
    async fn unknown_plugin_trigger_is_not_found() {
        let (router, _broker) = local_router();
        let err = router
            .handle(
                "caller",
                HostRequestBody::PluginTrigger {
                    plugin_id: "absent".into(),
                    entry_id: "echo".into(),
                    args: Default::default(),
                },
            )
            .await
            .expect_err("no such plugin");
        assert_eq!(err.code, ErrorCode::NotFound);
        router.close();
    }

    #[tokio::test]
    async fn subscriptions_are_tracked_and_routed() {
        let (router, broker) = local_router();
        broker.publish("memory", "facts", json!({"k": 1}), None);
        let ack = router
            .handle("watcher", HostRequestBody::Subscribe(SubscribeRequest::new("memory")))
            .await
            .expect("subscribe");
        let ack: SubscribeAck = serde_json::from_value(ack).expect("ack shape");
        assert_eq!(ack.rev, 1);
        assert_eq!(router.subscription_count(), 1);

        // no host is registered for "watcher", so routed deltas queue and drain
        broker.publish("memory", "facts", json!({"k": 2}), None);
        broker.publish("messages", "chat", json!({"k": 3}), None);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !router.forward.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue drained");

        let removed = router
            .handle(
                "watcher",
                HostRequestBody::Unsubscribe {
                    sub_id: ack.sub_id.clone(),
                },
            )
            .await
            .expect("unsubscribe");
        assert_eq!(removed, json!({"removed": true}));
        assert_eq!(router.subscription_count(), 0);
        router.close();
    }

    #[test]
    fn route_filters_by_bus_and_rules() {
        let subs: SubTable = Arc::new(RwLock::new(HashMap::new()));
        let queue = LossyQueue::new("test", 8, OverflowPolicy::DropOldest);
        let mut adds_only = SubscribeRequest::new("memory");
        adds_only.rules = vec![DeltaOp::Add];
        subs.write().insert(
            "s1".into(),
            Subscription {
                plugin_id: "p".into(),
                request: adds_only,
                remote_id: None,
            },
        );
        let delta = |bus: &str, op| Delta {
            bus: bus.into(),
            rev: 1,
            op,
            topic: None,
            payload: Value::Null,
            ts: 0.0,
        };
        HostRouter::route(&subs, &queue, delta("memory", DeltaOp::Add));
        HostRouter::route(&subs, &queue, delta("memory", DeltaOp::Del));
        HostRouter::route(&subs, &queue, delta("events", DeltaOp::Add));
        assert_eq!(queue.len(), 1);
        let (plugin, sub, routed) = queue.pop().expect("one routed");
        assert_eq!((plugin.as_str(), sub.as_str()), ("p", "s1"));
        assert_eq!(routed.op, DeltaOp::Add);
    }
}
