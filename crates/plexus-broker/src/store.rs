use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use plexus_core::TrackedMutex;
use plexus_protocol::now_ts;
use plexus_query::{QueryError, ReplaySource};
use plexus_records::{KindTag, QueryParams, Record};
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

pub const DEFAULT_RING_CAPACITY: usize = 512;

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StoredMessage {
    pub seq: u64,
    pub store: String,
    pub topic: String,
    pub ts: f64,
    pub payload: Value,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TopicStats {
    pub store: String,
    pub topic: String,
    pub count: usize,
    pub last_seq: Option<u64>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StoreStats {
    pub capacity: usize,
    pub total: usize,
    pub seq: u64,
    pub topics: Vec<TopicStats>,
}

/// What a publish did to the store besides appending.
#[derive(Clone, Debug, PartialEq)]
pub struct Published {
    pub message: StoredMessage,
    /// Earlier version of the same dedupe key, possibly from another topic.
    pub replaced: Option<StoredMessage>,
    /// Oldest entries pushed out of a full ring.
    pub evicted: Vec<StoredMessage>,
}

#[derive(Default)]
struct Rings {
    seq: u64,
    by_topic: HashMap<(String, String), VecDeque<StoredMessage>>,
    // (store, dedupe key) -> (topic, seq) of the live entry
    keys: HashMap<(String, String), (String, u64)>,
}

impl Rings {
    fn take(&mut self, store: &str, topic: &str, seq: u64) -> Option<StoredMessage> {
        let ring = self.by_topic.get_mut(&(store.to_string(), topic.to_string()))?;
        let pos = ring.iter().position(|m| m.seq == seq)?;
        ring.remove(pos)
    }

    fn forget(&mut self, message: &StoredMessage) {
        if let Some(key) = record_key(&message.store, &message.payload) {
            let index = (message.store.clone(), key);
            if self.keys.get(&index).is_some_and(|(_, seq)| *seq == message.seq) {
                self.keys.remove(&index);
            }
        }
    }
}

fn record_key(store: &str, payload: &Value) -> Option<String> {
    decode_record(store, payload).map(|r| r.dedupe_key())
}

/// Decodes a stored payload. Payloads naming their own `kind` win; otherwise
/// the store's canonical category applies, falling back to `event`.
pub fn decode_record(store: &str, payload: &Value) -> Option<Record> {
    if payload.get("kind").is_some() {
        if let Ok(record) = Record::from_raw(payload.clone()) {
            return Some(record);
        }
    }
    let tag = KindTag::for_bus(store).unwrap_or(KindTag::Event);
    Record::from_raw_as(tag, payload.clone()).ok()
}

/// Bounded per-(store, topic) rings with a broker-wide sequence number.
///
/// A store holds at most one entry per record dedupe key: publishing a key
/// that is already present replaces the earlier entry, wherever it lives, and
/// the new entry becomes the newest. Payloads that do not decode as records
/// are kept as-is.
pub struct MessageStore {
    rings: TrackedMutex<Rings>,
    capacity: usize,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

impl MessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: TrackedMutex::new("broker.store", Rings::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a payload, replacing an entry with the same dedupe key and
    /// evicting the oldest entries of a full ring.
    pub fn publish(&self, store: &str, topic: &str, payload: Value) -> Published {
        let key = record_key(store, &payload);
        let mut rings = self.rings.lock();
        let replaced = key.as_ref().and_then(|key| {
            let (old_topic, old_seq) = rings.keys.get(&(store.to_string(), key.clone())).cloned()?;
            rings.take(store, &old_topic, old_seq)
        });
        rings.seq += 1;
        let message = StoredMessage {
            seq: rings.seq,
            store: store.to_string(),
            topic: topic.to_string(),
            ts: now_ts(),
            payload,
        };
        let mut evicted = Vec::new();
        {
            let ring = rings
                .by_topic
                .entry((store.to_string(), topic.to_string()))
                .or_default();
            while ring.len() >= self.capacity {
                match ring.pop_front() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
            ring.push_back(message.clone());
        }
        for old in &evicted {
            trace!(target: "plexus::broker", store, topic, seq = old.seq, "ring full; evicted oldest");
            rings.forget(old);
        }
        if let Some(key) = key {
            rings
                .keys
                .insert((store.to_string(), key), (topic.to_string(), message.seq));
        }
        Published {
            message,
            replaced,
            evicted,
        }
    }

    /// The newest `limit` payloads of one topic, oldest first.
    pub fn get_recent(&self, store: &str, topic: &str, limit: usize) -> Vec<StoredMessage> {
        let rings = self.rings.lock();
        let Some(ring) = rings.by_topic.get(&(store.to_string(), topic.to_string())) else {
            return Vec::new();
        };
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Matching records across the store's topics in publish order.
    pub fn query(&self, store: &str, params: &QueryParams) -> Vec<Record> {
        let mut messages: Vec<StoredMessage> = {
            let rings = self.rings.lock();
            rings
                .by_topic
                .iter()
                .filter(|((s, t), _)| s == store && params.topic.as_ref().is_none_or(|want| want == t))
                .flat_map(|(_, ring)| ring.iter().cloned())
                .collect()
        };
        messages.sort_by_key(|m| m.seq);
        let records = messages
            .iter()
            .filter_map(|m| decode_record(store, &m.payload))
            .filter(|r| params.matches(r))
            .collect();
        params.apply_limit(records)
    }

    /// Removes records of `topic` whose dedupe key or identity equals `key`.
    pub fn delete(&self, store: &str, topic: &str, key: &str) -> Vec<StoredMessage> {
        let mut rings = self.rings.lock();
        let Some(ring) = rings
            .by_topic
            .get_mut(&(store.to_string(), topic.to_string()))
        else {
            return Vec::new();
        };
        let mut removed = Vec::new();
        ring.retain(|m| {
            let hit = decode_record(store, &m.payload)
                .map(|r| r.dedupe_key() == key || r.identity() == Some(key))
                .unwrap_or(false);
            if hit {
                removed.push(m.clone());
            }
            !hit
        });
        for message in &removed {
            rings.forget(message);
        }
        removed
    }

    pub fn stats(&self) -> StoreStats {
        let rings = self.rings.lock();
        let mut topics: BTreeMap<(String, String), TopicStats> = BTreeMap::new();
        for ((store, topic), ring) in &rings.by_topic {
            topics.insert(
                (store.clone(), topic.clone()),
                TopicStats {
                    store: store.clone(),
                    topic: topic.clone(),
                    count: ring.len(),
                    last_seq: ring.back().map(|m| m.seq),
                },
            );
        }
        StoreStats {
            capacity: self.capacity,
            total: topics.values().map(|t| t.count).sum(),
            seq: rings.seq,
            topics: topics.into_values().collect(),
        }
    }
}

#[async_trait]
impl ReplaySource for MessageStore {
    async fn fetch(&self, bus: &str, params: &QueryParams) -> Result<Vec<Record>, QueryError> {
        Ok(self.query(bus, params))
    }
}
