//! The message-plane broker: bounded per-topic stores, delta fan-out to
//! subscribers, and a newline-delimited JSON RPC over TCP.

mod broker;
mod client;
mod server;
mod store;

pub use broker::{Broker, BrokerOptions, SessionId, DEFAULT_RECENT_LIMIT};
pub use client::{BrokerClient, BrokerError, ClientOptions};
pub use server::{BrokerServer, MAX_LINE_BYTES};
pub use store::{decode_record, MessageStore, Published, StoreStats, StoredMessage, TopicStats, DEFAULT_RING_CAPACITY};
