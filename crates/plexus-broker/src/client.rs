use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use plexus_core::{Correlator, CorrelatorError, DEFAULT_PENDING_CAPACITY};
use plexus_protocol::{
    BrokerMessage, BrokerReply, BrokerRequest, DeltaBatch, ErrorCode, ErrorInfo, SubscribeAck,
    SubscribeRequest,
};
use plexus_query::{BusList, Plan, QueryError, ReplaySource, TraceEntry};
use plexus_records::{QueryParams, Record};
use plexus_topics as topics;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::server::MAX_LINE_BYTES;

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("broker connection closed")]
    Closed,
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
    #[error("broker replied with {0}")]
    Remote(ErrorInfo),
    #[error("undecodable broker reply: {0}")]
    Decode(String),
}

impl From<BrokerError> for ErrorInfo {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Remote(info) => info,
            BrokerError::Correlator(inner) => inner.into(),
            BrokerError::Decode(_) => ErrorInfo::new(ErrorCode::Internal, err.to_string()),
            BrokerError::Io(_) | BrokerError::Closed => {
                ErrorInfo::new(ErrorCode::Communication, err.to_string())
            }
        }
    }
}

impl From<BrokerError> for QueryError {
    fn from(err: BrokerError) -> Self {
        QueryError::Source(err.into())
    }
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub pending_capacity: usize,
    /// Stamped into `from_plugin` of every request.
    pub from_plugin: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            from_plugin: None,
        }
    }
}

struct ClientInner {
    outbound: mpsc::Sender<String>,
    correlator: Correlator<BrokerReply>,
    deltas: broadcast::Sender<DeltaBatch>,
    options: ClientOptions,
    cancel: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// TCP client for a broker. Replies are matched to requests by `req_id`;
/// pushed delta batches are rebroadcast to [`BrokerClient::deltas`] receivers.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

impl BrokerClient {
    pub async fn connect(addr: &str, options: ClientOptions) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut writer = FramedWrite::new(write_half, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let (outbound, mut outbound_rx) = mpsc::channel::<String>(256);
        let (deltas, _) = broadcast::channel(1024);
        let correlator = Correlator::new("broker-client", options.pending_capacity);
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    line = outbound_rx.recv() => {
                        let Some(line) = line else { break };
                        if let Err(err) = writer.send(line).await {
                            warn!(target: "plexus::broker", %err, "broker write failed");
                            writer_cancel.cancel();
                            break;
                        }
                    }
                }
            }
        });

        let reader_cancel = cancel.clone();
        let reader_corr = correlator.clone();
        let reader_deltas = deltas.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    line = reader.next() => line,
                };
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(err)) => {
                        warn!(target: "plexus::broker", %err, "broker read failed");
                        break;
                    }
                    None => break,
                };
                match serde_json::from_str::<BrokerMessage>(&line) {
                    Ok(BrokerMessage::Reply(reply)) => {
                        let id = reply.req_id.clone();
                        reader_corr.deliver(&id, reply);
                    }
                    Ok(BrokerMessage::Batch(batch)) => {
                        let _ = reader_deltas.send(batch);
                    }
                    Err(err) => {
                        warn!(target: "plexus::broker", %err, "ignoring undecodable broker line");
                    }
                }
            }
            debug!(target: "plexus::broker", "broker connection reader finished");
            reader_corr.close();
            reader_cancel.cancel();
        });

        Ok(Self {
            inner: Arc::new(ClientInner {
                outbound,
                correlator,
                deltas,
                options,
                cancel,
            }),
        })
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Delta batches pushed for this connection's subscriptions.
    pub fn deltas(&self) -> broadcast::Receiver<DeltaBatch> {
        self.inner.deltas.subscribe()
    }

    pub fn correlator(&self) -> &Correlator<BrokerReply> {
        &self.inner.correlator
    }

    fn encode(&self, op: &str, req_id: &str, args: Value) -> Result<String, BrokerError> {
        let mut request = BrokerRequest::new(op, req_id, args);
        request.from_plugin = self.inner.options.from_plugin.clone();
        serde_json::to_string(&request).map_err(|err| BrokerError::Decode(err.to_string()))
    }

    pub async fn request(&self, op: &str, args: Value) -> Result<Value, BrokerError> {
        let ticket = self.inner.correlator.register();
        let line = self.encode(op, ticket.id(), args)?;
        if self.inner.outbound.send(line).await.is_err() {
            self.inner.correlator.cancel(ticket);
            return Err(BrokerError::Closed);
        }
        let reply = self
            .inner
            .correlator
            .wait(ticket, self.inner.options.request_timeout)
            .await?;
        reply.into_result().map_err(BrokerError::Remote)
    }

    /// Blocking request for threads outside the async runtime.
    pub fn request_blocking(&self, op: &str, args: Value) -> Result<Value, BrokerError> {
        let ticket = self.inner.correlator.register();
        let line = self.encode(op, ticket.id(), args)?;
        if self.inner.outbound.blocking_send(line).is_err() {
            self.inner.correlator.cancel(ticket);
            return Err(BrokerError::Closed);
        }
        let reply = self
            .inner
            .correlator
            .wait_blocking(ticket, self.inner.options.request_timeout)?;
        reply.into_result().map_err(BrokerError::Remote)
    }

    pub async fn publish(&self, store: &str, topic: &str, payload: Value) -> Result<Value, BrokerError> {
        self.request(
            topics::OP_PUBLISH,
            json!({"store": store, "topic": topic, "payload": payload}),
        )
        .await
    }

    pub async fn get_recent(&self, store: &str, topic: &str, limit: usize) -> Result<Vec<Value>, BrokerError> {
        let result = self
            .request(
                topics::OP_GET_RECENT,
                json!({"store": store, "topic": topic, "limit": limit}),
            )
            .await?;
        items(result)
    }

    pub async fn query(&self, store: &str, params: &QueryParams) -> Result<Vec<Record>, BrokerError> {
        let result = self
            .request(topics::OP_QUERY, json!({"store": store, "params": params}))
            .await?;
        decode_records(items(result)?)
    }

    pub async fn delete(&self, store: &str, topic: &str, key: &str) -> Result<usize, BrokerError> {
        let result = self
            .request(
                topics::OP_DELETE,
                json!({"store": store, "topic": topic, "key": key}),
            )
            .await?;
        Ok(result["removed"].as_u64().unwrap_or(0) as usize)
    }

    /// Remote evaluation of a serializable plan.
    pub async fn replay_remote(&self, plan: &Plan) -> Result<BusList, BrokerError> {
        let result = self
            .request(topics::OP_REPLAY, json!({"plan": plan}))
            .await?;
        let trace: Vec<TraceEntry> = serde_json::from_value(result["trace"].clone())
            .map_err(|err| BrokerError::Decode(err.to_string()))?;
        let records = decode_records(items(result)?)?;
        Ok(BusList::from_parts(records, plan.clone(), trace))
    }

    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<SubscribeAck, BrokerError> {
        let args = serde_json::to_value(request).map_err(|err| BrokerError::Decode(err.to_string()))?;
        let result = self.request(topics::OP_SUBSCRIBE, args).await?;
        serde_json::from_value(result).map_err(|err| BrokerError::Decode(err.to_string()))
    }

    pub async fn unsubscribe(&self, sub_id: &str) -> Result<bool, BrokerError> {
        let result = self
            .request(topics::OP_UNSUBSCRIBE, json!({"sub_id": sub_id}))
            .await?;
        Ok(result["removed"].as_bool().unwrap_or(false))
    }

    pub async fn stats(&self) -> Result<Value, BrokerError> {
        self.request(topics::OP_STATS, Value::Null).await
    }

    pub async fn ping(&self) -> Result<Value, BrokerError> {
        self.request(topics::OP_PING, Value::Null).await
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.correlator.close();
    }
}

fn items(mut result: Value) -> Result<Vec<Value>, BrokerError> {
    match result.get_mut("items").map(Value::take) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(BrokerError::Decode("reply has no `items` array".into())),
    }
}

fn decode_records(items: Vec<Value>) -> Result<Vec<Record>, BrokerError> {
    items
        .into_iter()
        .map(|item| Record::from_raw(item).map_err(|err| BrokerError::Decode(err.to_string())))
        .collect()
}

#[async_trait]
impl ReplaySource for BrokerClient {
    async fn fetch(&self, bus: &str, params: &QueryParams) -> Result<Vec<Record>, QueryError> {
        Ok(self.query(bus, params).await?)
    }

    async fn replay(&self, plan: &Plan) -> Result<BusList, QueryError> {
        if plan.is_remote_replayable() {
            Ok(self.replay_remote(plan).await?)
        } else {
            BusList::evaluate(plan, self).await
        }
    }
}
