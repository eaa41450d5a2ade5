//! Wire envelopes shared by the host, plugin processes and the broker.
//!
//! Every frame that crosses a process boundary is one of the types below,
//! serialized as a single line of JSON.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broker RPC protocol version. Requests carrying another version are refused.
pub const PROTOCOL_VERSION: u32 = 1;

pub type Args = Map<String, Value>;

/// Unix timestamp in fractional seconds, the representation used on the wire.
pub fn now_ts() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

// -------- Errors --------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    NotRunning,
    Timeout,
    Execution,
    Communication,
    InvalidTransition,
    FilterError,
    PolicyViolation,
    UnknownOp,
    UnsupportedVersion,
    InvalidRequest,
    Unreplayable,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::NotRunning => "not_running",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Execution => "execution",
            ErrorCode::Communication => "communication",
            ErrorCode::InvalidTransition => "invalid_transition",
            ErrorCode::FilterError => "filter_error",
            ErrorCode::PolicyViolation => "policy_violation",
            ErrorCode::UnknownOp => "unknown_op",
            ErrorCode::UnsupportedVersion => "unsupported_version",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Unreplayable => "unreplayable",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error shape carried by every failed reply.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

// -------- Deltas --------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeltaOp {
    Add,
    Del,
    Change,
}

impl DeltaOp {
    pub const ALL: [DeltaOp; 3] = [DeltaOp::Add, DeltaOp::Del, DeltaOp::Change];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaOp::Add => "add",
            DeltaOp::Del => "del",
            DeltaOp::Change => "change",
        }
    }
}

/// One revision-tagged change against a bus.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Delta {
    pub bus: String,
    pub rev: u64,
    pub op: DeltaOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub ts: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeltaItem {
    pub store: String,
    pub topic: String,
    pub op: DeltaOp,
    pub rev: u64,
    pub payload: Value,
}

impl DeltaItem {
    pub fn to_delta(&self, ts: f64) -> Delta {
        Delta {
            bus: self.store.clone(),
            rev: self.rev,
            op: self.op,
            topic: Some(self.topic.clone()),
            payload: self.payload.clone(),
            ts,
        }
    }
}

pub const DELTA_BATCH_KIND: &str = "delta_batch";

/// Publish/subscribe fan-out envelope.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeltaBatch {
    pub v: u32,
    pub kind: String,
    pub from: String,
    pub ts: f64,
    pub batch_id: String,
    pub items: Vec<DeltaItem>,
}

impl DeltaBatch {
    pub fn new(from: impl Into<String>, batch_id: impl Into<String>, items: Vec<DeltaItem>) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind: DELTA_BATCH_KIND.to_string(),
            from: from.into(),
            ts: now_ts(),
            batch_id: batch_id.into(),
            items,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub bus: String,
    #[serde(default = "default_rules")]
    pub rules: Vec<DeltaOp>,
    #[serde(default = "default_deliver")]
    pub deliver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Value>,
}

fn default_rules() -> Vec<DeltaOp> {
    DeltaOp::ALL.to_vec()
}

fn default_deliver() -> String {
    "delta".to_string()
}

impl SubscribeRequest {
    pub fn new(bus: impl Into<String>) -> Self {
        Self {
            bus: bus.into(),
            rules: default_rules(),
            deliver: default_deliver(),
            plan: None,
        }
    }

    pub fn accepts(&self, op: DeltaOp) -> bool {
        self.rules.contains(&op)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub sub_id: String,
    pub rev: u64,
}

// -------- Plugin command / result plane --------

/// Commands delivered to a plugin process.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
    },
    Trigger {
        entry_id: String,
        #[serde(default)]
        args: Args,
        req_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    TriggerCustom {
        event_type: String,
        event_id: String,
        #[serde(default)]
        args: Args,
        req_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    BusChange {
        sub_id: String,
        delta: Delta,
    },
    Cancel {
        req_id: String,
    },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Stop { .. } => "STOP",
            Command::Trigger { .. } => "TRIGGER",
            Command::TriggerCustom { .. } => "TRIGGER_CUSTOM",
            Command::BusChange { .. } => "BUS_CHANGE",
            Command::Cancel { .. } => "CANCEL",
        }
    }

    pub fn req_id(&self) -> Option<&str> {
        match self {
            Command::Stop { req_id } => req_id.as_deref(),
            Command::Trigger { req_id, .. }
            | Command::TriggerCustom { req_id, .. }
            | Command::Cancel { req_id } => Some(req_id),
            Command::BusChange { .. } => None,
        }
    }
}

/// Outcome of one dispatch, keyed by the originating `req_id`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResultEnvelope {
    pub req_id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResultEnvelope {
    pub fn ok(req_id: impl Into<String>, data: Value) -> Self {
        Self {
            req_id: req_id.into(),
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(req_id: impl Into<String>, error: ErrorInfo) -> Self {
        Self {
            req_id: req_id.into(),
            success: false,
            data: Value::Null,
            error: Some(error),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    #[default]
    Starting,
    Ready,
    Stopping,
    Stopped,
    Crashed,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Starting => "starting",
            PluginState::Ready => "ready",
            PluginState::Stopping => "stopping",
            PluginState::Stopped => "stopped",
            PluginState::Crashed => "crashed",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "ready" | "ok" => PluginState::Ready,
            "stopping" => PluginState::Stopping,
            "stopped" | "exited" => PluginState::Stopped,
            "crashed" | "error" => PluginState::Crashed,
            _ => PluginState::Starting,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatusFrame {
    pub state: PluginState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub ts: f64,
}

impl StatusFrame {
    pub fn new(state: PluginState, message: Option<String>) -> Self {
        Self {
            state,
            message,
            ts: now_ts(),
        }
    }
}

// -------- Host-bound requests (push / response channels) --------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HostRequest {
    pub request_id: String,
    pub from_plugin: String,
    /// Seconds the caller is prepared to wait.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,
    #[serde(flatten)]
    pub body: HostRequestBody,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequestBody {
    /// A broker operation relayed through the host.
    Bus {
        op: String,
        #[serde(default)]
        args: Value,
    },
    PluginTrigger {
        plugin_id: String,
        entry_id: String,
        #[serde(default)]
        args: Args,
    },
    Subscribe(SubscribeRequest),
    Unsubscribe {
        sub_id: String,
    },
}

impl HostRequestBody {
    pub fn label(&self) -> &str {
        match self {
            HostRequestBody::Bus { op, .. } => op,
            HostRequestBody::PluginTrigger { .. } => "plugin.trigger",
            HostRequestBody::Subscribe(_) => "bus.subscribe",
            HostRequestBody::Unsubscribe { .. } => "bus.unsubscribe",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HostResponse {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl HostResponse {
    pub fn from_result(request_id: impl Into<String>, outcome: Result<Value, ErrorInfo>) -> Self {
        let request_id = request_id.into();
        match outcome {
            Ok(value) => Self {
                request_id,
                result: Some(value),
                error: None,
            },
            Err(err) => Self {
                request_id,
                result: None,
                error: Some(err),
            },
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorInfo> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

// -------- Broker RPC --------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrokerRequest {
    pub v: u32,
    pub op: String,
    pub req_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_plugin: Option<String>,
    #[serde(default)]
    pub args: Value,
}

impl BrokerRequest {
    pub fn new(op: impl Into<String>, req_id: impl Into<String>, args: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            op: op.into(),
            req_id: req_id.into(),
            from_plugin: None,
            args,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrokerReply {
    pub v: u32,
    pub req_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl BrokerReply {
    pub fn ok(req_id: impl Into<String>, result: Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            req_id: req_id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(req_id: impl Into<String>, error: ErrorInfo) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            req_id: req_id.into(),
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<Value, ErrorInfo> {
        if self.ok {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| ErrorInfo::new(ErrorCode::Internal, "broker reply without error")))
        }
    }
}

/// Anything the broker may write to a client connection.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum BrokerMessage {
    Batch(DeltaBatch),
    Reply(BrokerReply),
}

// -------- Stdio framing --------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// host -> plugin
    Command,
    /// host -> plugin, answers to push requests
    Response,
    /// plugin -> host
    Result,
    /// plugin -> host
    Status,
    /// plugin -> host, host-bound requests
    Push,
}

/// One line on a plugin's stdin or stdout.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Frame {
    pub ch: Channel,
    pub body: Value,
}

impl Frame {
    pub fn new<T: Serialize>(ch: Channel, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            ch,
            body: serde_json::to_value(body)?,
        })
    }

    pub fn command(cmd: &Command) -> Result<Self, serde_json::Error> {
        Self::new(Channel::Command, cmd)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    pub fn parse_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_wire_names_are_screaming_snake() {
        let cmd = Command::TriggerCustom {
            event_type: "greeting".into(),
            event_id: "hello".into(),
            args: Args::new(),
            req_id: "r-1".into(),
            timeout_ms: None,
        };
        let value = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(value["type"], "TRIGGER_CUSTOM");
        assert_eq!(value["event_id"], "hello");

        let parsed: Command =
            serde_json::from_value(json!({"type": "STOP"})).expect("stop parses");
        assert_eq!(parsed, Command::Stop { req_id: None });
        assert_eq!(parsed.kind(), "STOP");
    }

    #[test]
    fn host_request_flattens_type_tag() {
        let req = HostRequest {
            request_id: "q-1".into(),
            from_plugin: "echo".into(),
            timeout: Some(2.0),
            body: HostRequestBody::Bus {
                op: "bus.get_recent".into(),
                args: json!({"store": "messages", "topic": "chat", "limit": 1}),
            },
        };
        let value = serde_json::to_value(&req).expect("serialize");
        assert_eq!(value["type"], "bus");
        assert_eq!(value["from_plugin"], "echo");
        let back: HostRequest = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, req);
    }

    #[test]
    fn broker_message_distinguishes_batches_from_replies() {
        let batch = DeltaBatch::new("broker", "b-1", Vec::new());
        let line = serde_json::to_string(&batch).expect("encode");
        assert!(matches!(
            serde_json::from_str::<BrokerMessage>(&line).expect("decode"),
            BrokerMessage::Batch(_)
        ));

        let reply = BrokerReply::err("r-9", ErrorInfo::new(ErrorCode::UnknownOp, "nope"));
        let line = serde_json::to_string(&reply).expect("encode");
        match serde_json::from_str::<BrokerMessage>(&line).expect("decode") {
            BrokerMessage::Reply(r) => {
                assert_eq!(r.req_id, "r-9");
                assert_eq!(r.into_result().unwrap_err().code, ErrorCode::UnknownOp);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn subscribe_request_defaults_to_all_rules() {
        let req: SubscribeRequest =
            serde_json::from_value(json!({"bus": "messages"})).expect("parse");
        assert_eq!(req.deliver, "delta");
        assert!(req.accepts(DeltaOp::Del));
        assert_eq!(req.rules.len(), 3);
    }

    #[test]
    fn frames_round_trip_through_a_line() {
        let frame = Frame::command(&Command::Cancel {
            req_id: "r-2".into(),
        })
        .expect("frame");
        let line = frame.encode().expect("encode");
        assert!(!line.contains('\n'));
        let decoded = Frame::decode(&line).expect("decode");
        assert_eq!(decoded.ch, Channel::Command);
        let cmd: Command = decoded.parse_body().expect("body");
        assert_eq!(cmd.req_id(), Some("r-2"));
    }
}
