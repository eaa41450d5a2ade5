use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::RecordError;

/// Record category, the `kind` tag on the wire.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum KindTag {
    Message,
    Event,
    Lifecycle,
    Memory,
    Conversation,
}

impl KindTag {
    pub const ALL: [KindTag; 5] = [
        KindTag::Message,
        KindTag::Event,
        KindTag::Lifecycle,
        KindTag::Memory,
        KindTag::Conversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KindTag::Message => "message",
            KindTag::Event => "event",
            KindTag::Lifecycle => "lifecycle",
            KindTag::Memory => "memory",
            KindTag::Conversation => "conversation",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "message" | "messages" | "msg" => Some(KindTag::Message),
            "event" | "events" => Some(KindTag::Event),
            "lifecycle" => Some(KindTag::Lifecycle),
            "memory" | "bucket" => Some(KindTag::Memory),
            "conversation" | "conversations" => Some(KindTag::Conversation),
            _ => None,
        }
    }

    /// Name of the identity field carried by this category.
    pub fn identity_field(&self) -> &'static str {
        match self {
            KindTag::Message => "message_id",
            KindTag::Event => "event_id",
            KindTag::Lifecycle => "lifecycle_id",
            KindTag::Memory => "bucket_id",
            KindTag::Conversation => "conversation_id",
        }
    }

    /// Default category for records stored on a canonical bus.
    pub fn for_bus(bus: &str) -> Option<Self> {
        match bus {
            plexus_topics::BUS_MESSAGES => Some(KindTag::Message),
            plexus_topics::BUS_EVENTS => Some(KindTag::Event),
            plexus_topics::BUS_LIFECYCLE => Some(KindTag::Lifecycle),
            plexus_topics::BUS_MEMORY => Some(KindTag::Memory),
            plexus_topics::BUS_CONVERSATIONS => Some(KindTag::Conversation),
            _ => None,
        }
    }
}

impl std::fmt::Display for KindTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record specialization with its identity field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Message { message_id: Option<String> },
    Event { event_id: Option<String> },
    Lifecycle { lifecycle_id: Option<String> },
    Memory { bucket_id: Option<String> },
    Conversation { conversation_id: Option<String> },
}

impl RecordKind {
    /// An empty identity is stored as absent.
    pub fn with_identity(tag: KindTag, id: Option<String>) -> Self {
        let id = id.filter(|s| !s.is_empty());
        match tag {
            KindTag::Message => RecordKind::Message { message_id: id },
            KindTag::Event => RecordKind::Event { event_id: id },
            KindTag::Lifecycle => RecordKind::Lifecycle { lifecycle_id: id },
            KindTag::Memory => RecordKind::Memory { bucket_id: id },
            KindTag::Conversation => RecordKind::Conversation {
                conversation_id: id,
            },
        }
    }

    pub fn tag(&self) -> KindTag {
        match self {
            RecordKind::Message { .. } => KindTag::Message,
            RecordKind::Event { .. } => KindTag::Event,
            RecordKind::Lifecycle { .. } => KindTag::Lifecycle,
            RecordKind::Memory { .. } => KindTag::Memory,
            RecordKind::Conversation { .. } => KindTag::Conversation,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        let id = match self {
            RecordKind::Message { message_id } => message_id,
            RecordKind::Event { event_id } => event_id,
            RecordKind::Lifecycle { lifecycle_id } => lifecycle_id,
            RecordKind::Memory { bucket_id } => bucket_id,
            RecordKind::Conversation { conversation_id } => conversation_id,
        };
        id.as_deref().filter(|s| !s.is_empty())
    }
}

/// An immutable typed record as carried on a bus.
#[derive(Clone, Debug)]
pub struct Record {
    kind: RecordKind,
    record_type: Option<String>,
    timestamp: Option<f64>,
    plugin_id: Option<String>,
    source: Option<String>,
    priority: i64,
    content: Value,
    metadata: BTreeMap<String, Value>,
    raw: Value,
}

impl Record {
    /// Builds a record from a full payload whose `kind` field names the category.
    pub fn from_raw(raw: Value) -> Result<Self, RecordError> {
        let obj = raw.as_object().ok_or(RecordError::NotAnObject)?;
        let slug = obj
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(RecordError::MissingKind)?;
        let tag = KindTag::from_slug(slug).ok_or_else(|| RecordError::UnknownKind(slug.to_string()))?;
        Self::from_raw_as(tag, raw)
    }

    /// Builds a record of a known category; a `kind` field in the payload is ignored.
    pub fn from_raw_as(tag: KindTag, raw: Value) -> Result<Self, RecordError> {
        let obj = raw.as_object().ok_or(RecordError::NotAnObject)?;
        let identity = obj.get(tag.identity_field()).and_then(scalar_string);
        let record_type = obj.get("type").and_then(scalar_string);
        let timestamp = match obj.get("timestamp") {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_timestamp(value)?),
        };
        let priority = match obj.get("priority") {
            None | Some(Value::Null) => 0,
            Some(value) => parse_priority(value)?,
        };
        let metadata = match obj.get("metadata") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Some(_) => return Err(RecordError::InvalidField("metadata")),
        };
        Ok(Self {
            kind: RecordKind::with_identity(tag, identity),
            record_type,
            timestamp,
            plugin_id: obj.get("plugin_id").and_then(scalar_string),
            source: obj.get("source").and_then(scalar_string),
            priority,
            content: obj.get("content").cloned().unwrap_or(Value::Null),
            metadata,
            raw,
        })
    }

    /// Builds a record from a compact index projection, optionally completed
    /// by the full payload. Fields present in `full` win over the index.
    pub fn from_index(tag: KindTag, index: &Value, full: Option<&Value>) -> Result<Self, RecordError> {
        let mut merged = index.as_object().cloned().ok_or(RecordError::NotAnObject)?;
        if let Some(full) = full {
            let full = full.as_object().ok_or(RecordError::NotAnObject)?;
            for (key, value) in full {
                merged.insert(key.clone(), value.clone());
            }
        }
        let mut record = Self::from_raw_as(tag, Value::Object(merged))?;
        record.raw = full.cloned().unwrap_or_else(|| index.clone());
        Ok(record)
    }

    /// Normalized payload; `Record::from_raw(record.dump())` reproduces the record.
    pub fn dump(&self) -> Value {
        let tag = self.kind.tag();
        let mut out = Map::new();
        out.insert("kind".into(), Value::from(tag.as_str()));
        if let Some(id) = self.kind.identity() {
            out.insert(tag.identity_field().into(), Value::from(id));
        }
        if let Some(t) = &self.record_type {
            out.insert("type".into(), Value::from(t.as_str()));
        }
        if let Some(ts) = self.timestamp {
            out.insert("timestamp".into(), Value::from(ts));
        }
        if let Some(p) = &self.plugin_id {
            out.insert("plugin_id".into(), Value::from(p.as_str()));
        }
        if let Some(s) = &self.source {
            out.insert("source".into(), Value::from(s.as_str()));
        }
        out.insert("priority".into(), Value::from(self.priority));
        out.insert("content".into(), self.content.clone());
        if !self.metadata.is_empty() {
            out.insert(
                "metadata".into(),
                Value::Object(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            );
        }
        Value::Object(out)
    }

    /// Field-for-field equality ignoring `raw`.
    pub fn same_payload(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.record_type == other.record_type
            && self.timestamp == other.timestamp
            && self.plugin_id == other.plugin_id
            && self.source == other.source
            && self.priority == other.priority
            && self.content == other.content
            && self.metadata == other.metadata
    }

    /// Identity used by set operations: `<kind>:<id>` when the identity field
    /// is present, otherwise a SHA-256 fingerprint of the canonical dump.
    pub fn dedupe_key(&self) -> String {
        match self.kind.identity() {
            Some(id) => format!("{}:{}", self.kind.tag(), id),
            None => {
                // serde_json maps are ordered by key, which makes the dump canonical
                let canonical = self.dump().to_string();
                format!("fp:{}", hex::encode(Sha256::digest(canonical.as_bytes())))
            }
        }
    }

    /// Looks up a named field. Unknown names resolve against `metadata.<key>`
    /// paths and then the raw payload. Nulls read as absent.
    pub fn field(&self, name: &str) -> Option<Value> {
        let tag = self.kind.tag();
        let value = match name {
            "kind" => Some(Value::from(tag.as_str())),
            "type" => self.record_type.as_deref().map(Value::from),
            "timestamp" => self.timestamp.map(Value::from),
            "plugin_id" => self.plugin_id.as_deref().map(Value::from),
            "source" => self.source.as_deref().map(Value::from),
            "priority" => Some(Value::from(self.priority)),
            "content" => Some(self.content.clone()),
            "metadata" => Some(Value::Object(
                self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            )),
            _ if name == tag.identity_field() => self.kind.identity().map(Value::from),
            _ => match name.strip_prefix("metadata.") {
                Some(key) => self.metadata.get(key).cloned(),
                None => self.raw.get(name).cloned(),
            },
        };
        value.filter(|v| !v.is_null())
    }

    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    pub fn tag(&self) -> KindTag {
        self.kind.tag()
    }

    pub fn identity(&self) -> Option<&str> {
        self.kind.identity()
    }

    pub fn record_type(&self) -> Option<&str> {
        self.record_type.as_deref()
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    pub fn plugin_id(&self) -> Option<&str> {
        self.plugin_id.as_deref()
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Unix seconds from a number, a numeric string or RFC3339. Non-finite values
/// have no JSON representation and are rejected.
fn parse_timestamp(value: &Value) -> Result<f64, RecordError> {
    let secs = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .map(|dt| dt.timestamp_millis() as f64 / 1000.0)
        }),
        _ => None,
    };
    secs.filter(|s| s.is_finite())
        .ok_or(RecordError::InvalidField("timestamp"))
}

/// Integral numbers only; `3.0` is accepted, `2.5` is not.
fn parse_priority(value: &Value) -> Result<i64, RecordError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                    .map(|f| f as i64)
            })
            .ok_or(RecordError::InvalidField("priority")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| RecordError::InvalidField("priority")),
        _ => Err(RecordError::InvalidField("priority")),
    }
}
