//! Bus access from inside a plugin.
//!
//! Operations go either straight to the broker over TCP or through the host
//! relay on the push channel, depending on the transport mode. Plugin-to-plugin
//! triggers always use the relay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plexus_broker::BrokerClient;
use plexus_core::{Correlator, SyncPolicyGuard};
use plexus_protocol::{
    Args, ErrorCode, ErrorInfo, HostRequest, HostRequestBody, HostResponse, SubscribeAck,
    SubscribeRequest,
};
use plexus_query::{BusList, Plan, QueryError, ReplaySource, Watcher};
use plexus_records::{QueryParams, Record};
use plexus_topics as topics;
use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::transport::Outbound;
use crate::watchers::WatcherRegistry;

pub type BusResult<T> = Result<T, ErrorInfo>;

/// Request/response over the stdio push channel.
#[derive(Clone)]
pub(crate) struct HostRelay {
    outbound: Outbound,
    responses: Correlator<HostResponse>,
}

impl HostRelay {
    pub(crate) fn new(outbound: Outbound, responses: Correlator<HostResponse>) -> Self {
        Self {
            outbound,
            responses,
        }
    }

    fn send(&self, from_plugin: &str, id: &str, timeout: Duration, body: HostRequestBody) -> BusResult<()> {
        let request = HostRequest {
            request_id: id.to_string(),
            from_plugin: from_plugin.to_string(),
            timeout: Some(timeout.as_secs_f64()),
            body,
        };
        self.outbound
            .send_push(&request)
            .map_err(|err| ErrorInfo::new(ErrorCode::Communication, err.to_string()))
    }

    async fn request(&self, from_plugin: &str, timeout: Duration, body: HostRequestBody) -> BusResult<Value> {
        let ticket = self.responses.register();
        if let Err(err) = self.send(from_plugin, ticket.id(), timeout, body) {
            self.responses.cancel(ticket);
            return Err(err);
        }
        let response = self.responses.wait(ticket, timeout).await?;
        response.into_result()
    }

    fn request_blocking(&self, from_plugin: &str, timeout: Duration, body: HostRequestBody) -> BusResult<Value> {
        let ticket = self.responses.register();
        if let Err(err) = self.send(from_plugin, ticket.id(), timeout, body) {
            self.responses.cancel(ticket);
            return Err(err);
        }
        let response = self.responses.wait_blocking(ticket, timeout)?;
        response.into_result()
    }
}

struct BusInner {
    plugin_id: String,
    relay: HostRelay,
    broker: Option<BrokerClient>,
    guard: SyncPolicyGuard,
    watchers: WatcherRegistry,
    timeout: Duration,
    debounce: Duration,
}

/// Typed bus operations for handlers. Async methods are the default; the
/// `_blocking` variants are checked against the sync policy first.
#[derive(Clone)]
pub struct PluginBus {
    inner: Arc<BusInner>,
}

pub(crate) struct BusOptions {
    pub timeout: Duration,
    pub debounce: Duration,
}

impl PluginBus {
    pub(crate) fn new(
        plugin_id: impl Into<String>,
        relay: HostRelay,
        broker: Option<BrokerClient>,
        guard: SyncPolicyGuard,
        watchers: WatcherRegistry,
        options: BusOptions,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                plugin_id: plugin_id.into(),
                relay,
                broker,
                guard,
                watchers,
                timeout: options.timeout,
                debounce: options.debounce,
            }),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    /// True when bus operations dial the broker instead of the host relay.
    pub fn is_direct(&self) -> bool {
        self.inner.broker.is_some()
    }

    pub fn watchers(&self) -> &WatcherRegistry {
        &self.inner.watchers
    }

    /// Forwards broker-pushed batches to this plugin's watchers until the
    /// connection drops.
    pub(crate) fn spawn_delta_forwarder(&self, runtime: &Handle) {
        let Some(client) = &self.inner.broker else {
            return;
        };
        let mut rx = client.deltas();
        let watchers = self.inner.watchers.clone();
        runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(batch) => {
                        for item in &batch.items {
                            watchers.deliver_bus(&item.to_delta(batch.ts));
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(target: "plexus::plugin", missed, "delta forwarder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(target: "plexus::plugin", "delta forwarder finished");
        });
    }

    pub async fn call(&self, op: &str, args: Value) -> BusResult<Value> {
        match &self.inner.broker {
            Some(client) => client.request(op, args).await.map_err(Into::into),
            None => {
                self.inner
                    .relay
                    .request(
                        &self.inner.plugin_id,
                        self.inner.timeout,
                        HostRequestBody::Bus {
                            op: op.to_string(),
                            args,
                        },
                    )
                    .await
            }
        }
    }

    /// Blocking form of [`PluginBus::call`] for synchronous handlers.
    pub fn call_blocking(&self, op: &str, args: Value) -> BusResult<Value> {
        self.inner.guard.check(op)?;
        match &self.inner.broker {
            Some(client) => client.request_blocking(op, args).map_err(Into::into),
            None => self.inner.relay.request_blocking(
                &self.inner.plugin_id,
                self.inner.timeout,
                HostRequestBody::Bus {
                    op: op.to_string(),
                    args,
                },
            ),
        }
    }

    pub async fn publish(&self, store: &str, topic: &str, payload: Value) -> BusResult<Value> {
        self.call(
            topics::OP_PUBLISH,
            json!({"store": store, "topic": topic, "payload": payload}),
        )
        .await
    }

    pub fn publish_blocking(&self, store: &str, topic: &str, payload: Value) -> BusResult<Value> {
        self.call_blocking(
            topics::OP_PUBLISH,
            json!({"store": store, "topic": topic, "payload": payload}),
        )
    }

    pub async fn get_recent(&self, store: &str, topic: &str, limit: usize) -> BusResult<Vec<Value>> {
        let result = self
            .call(
                topics::OP_GET_RECENT,
                json!({"store": store, "topic": topic, "limit": limit}),
            )
            .await?;
        items(result)
    }

    pub fn get_recent_blocking(&self, store: &str, topic: &str, limit: usize) -> BusResult<Vec<Value>> {
        let result = self.call_blocking(
            topics::OP_GET_RECENT,
            json!({"store": store, "topic": topic, "limit": limit}),
        )?;
        items(result)
    }

    pub async fn query(&self, store: &str, params: &QueryParams) -> BusResult<Vec<Record>> {
        let result = self
            .call(topics::OP_QUERY, json!({"store": store, "params": params}))
            .await?;
        decode_records(items(result)?)
    }

    pub fn query_blocking(&self, store: &str, params: &QueryParams) -> BusResult<Vec<Record>> {
        let result = self.call_blocking(topics::OP_QUERY, json!({"store": store, "params": params}))?;
        decode_records(items(result)?)
    }

    /// A replayable list rooted at one bus query.
    pub async fn get(&self, store: &str, params: QueryParams) -> BusResult<BusList> {
        let records = self.query(store, &params).await?;
        Ok(BusList::from_get(store, params, records))
    }

    pub async fn delete(&self, store: &str, topic: &str, key: &str) -> BusResult<usize> {
        let result = self
            .call(
                topics::OP_DELETE,
                json!({"store": store, "topic": topic, "key": key}),
            )
            .await?;
        Ok(result["removed"].as_u64().unwrap_or(0) as usize)
    }

    pub async fn subscribe(&self, request: SubscribeRequest) -> BusResult<SubscribeAck> {
        match &self.inner.broker {
            Some(client) => client.subscribe(&request).await.map_err(Into::into),
            None => {
                let result = self
                    .inner
                    .relay
                    .request(
                        &self.inner.plugin_id,
                        self.inner.timeout,
                        HostRequestBody::Subscribe(request),
                    )
                    .await?;
                serde_json::from_value(result)
                    .map_err(|err| ErrorInfo::new(ErrorCode::Internal, format!("bad subscribe ack: {err}")))
            }
        }
    }

    pub async fn unsubscribe(&self, sub_id: &str) -> BusResult<bool> {
        match &self.inner.broker {
            Some(client) => client.unsubscribe(sub_id).await.map_err(Into::into),
            None => {
                let result = self
                    .inner
                    .relay
                    .request(
                        &self.inner.plugin_id,
                        self.inner.timeout,
                        HostRequestBody::Unsubscribe {
                            sub_id: sub_id.to_string(),
                        },
                    )
                    .await?;
                Ok(result["removed"].as_bool().unwrap_or(false))
            }
        }
    }

    fn trigger_body(plugin_id: &str, entry_id: &str, args: Args) -> HostRequestBody {
        HostRequestBody::PluginTrigger {
            plugin_id: plugin_id.to_string(),
            entry_id: entry_id.to_string(),
            args,
        }
    }

    /// Triggers an entry of another plugin through the host.
    pub async fn trigger_plugin(&self, plugin_id: &str, entry_id: &str, args: Args) -> BusResult<Value> {
        self.inner
            .relay
            .request(
                &self.inner.plugin_id,
                self.inner.timeout,
                Self::trigger_body(plugin_id, entry_id, args),
            )
            .await
    }

    pub fn trigger_plugin_blocking(&self, plugin_id: &str, entry_id: &str, args: Args) -> BusResult<Value> {
        self.inner.guard.check("plugin.trigger")?;
        self.inner.relay.request_blocking(
            &self.inner.plugin_id,
            self.inner.timeout,
            Self::trigger_body(plugin_id, entry_id, args),
        )
    }

    /// Starts a live view over `list` and subscribes it to every change of its
    /// bus. Plans without in-process predicates travel with the subscription.
    /// Narrow notifications with [`Watcher::on`]; the view itself must see
    /// deletes and changes to stay equal to a replay.
    ///
    /// The view is reloaded once the subscription is acknowledged, so writes
    /// that landed between fetching `list` and subscribing are not lost.
    pub async fn watch(&self, list: &BusList) -> BusResult<(String, Watcher)> {
        let source: Arc<dyn ReplaySource> = Arc::new(self.clone());
        let watcher = Watcher::new(list, source, self.inner.debounce).await?;
        let mut request = SubscribeRequest::new(watcher.bus());
        if watcher.plan().is_remote_replayable() {
            request.plan = serde_json::to_value(watcher.plan()).ok();
        }
        let ack = match self.subscribe(request).await {
            Ok(ack) => ack,
            Err(err) => {
                watcher.stop();
                return Err(err);
            }
        };
        debug!(target: "plexus::plugin", sub_id = %ack.sub_id, bus = %watcher.bus(), rev = ack.rev, "watch subscribed");
        self.inner.watchers.insert(ack.sub_id.clone(), watcher.clone());
        if let Err(err) = watcher.resync(ack.rev).await {
            self.inner.watchers.remove(&ack.sub_id);
            watcher.stop();
            if let Err(unsub) = self.unsubscribe(&ack.sub_id).await {
                debug!(target: "plexus::plugin", sub_id = %ack.sub_id, error = %unsub, "unsubscribe after failed resync");
            }
            return Err(err.into());
        }
        Ok((ack.sub_id, watcher))
    }

    pub async fn unwatch(&self, sub_id: &str) -> BusResult<bool> {
        let local = self.inner.watchers.remove(sub_id).is_some();
        let remote = self.unsubscribe(sub_id).await?;
        Ok(local || remote)
    }
}

fn items(mut result: Value) -> BusResult<Vec<Value>> {
    match result.get_mut("items").map(Value::take) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(ErrorInfo::new(ErrorCode::Internal, "reply has no `items` array")),
    }
}

fn decode_records(items: Vec<Value>) -> BusResult<Vec<Record>> {
    items
        .into_iter()
        .map(|item| Record::from_raw(item).map_err(|err| ErrorInfo::new(ErrorCode::Internal, err.to_string())))
        .collect()
}

#[async_trait]
impl ReplaySource for PluginBus {
    async fn fetch(&self, bus: &str, params: &QueryParams) -> Result<Vec<Record>, QueryError> {
        Ok(self.query(bus, params).await?)
    }

    async fn replay(&self, plan: &Plan) -> Result<BusList, QueryError> {
        match &self.inner.broker {
            Some(client) => client.replay(plan).await,
            None => BusList::evaluate(plan, self).await,
        }
    }
}
