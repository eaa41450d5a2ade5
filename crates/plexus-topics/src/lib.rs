//! Canonical bus names, broker operation names and event topics.
//!
//! Keep this list alphabetized within sections and favor dot.case names.

// Buses
pub const BUS_CONVERSATIONS: &str = "conversations";
pub const BUS_EVENTS: &str = "events";
pub const BUS_LIFECYCLE: &str = "lifecycle";
pub const BUS_MEMORY: &str = "memory";
pub const BUS_MESSAGES: &str = "messages";

// Broker operations
pub const OP_DELETE: &str = "bus.delete";
pub const OP_GET_RECENT: &str = "bus.get_recent";
pub const OP_PING: &str = "ping";
pub const OP_PUBLISH: &str = "bus.publish";
pub const OP_QUERY: &str = "bus.query";
pub const OP_REPLAY: &str = "bus.replay";
pub const OP_STATS: &str = "bus.stats";
pub const OP_SUBSCRIBE: &str = "bus.subscribe";
pub const OP_UNSUBSCRIBE: &str = "bus.unsubscribe";

// Host events
pub const TOPIC_CORRELATOR_ORPHAN: &str = "correlator.orphan";
pub const TOPIC_PLUGIN_EXITED: &str = "plugin.exited";
pub const TOPIC_PLUGIN_SPAWNED: &str = "plugin.spawned";
pub const TOPIC_PLUGIN_STATE_CHANGED: &str = "plugin.state.changed";
pub const TOPIC_RUN_UPDATED: &str = "run.updated";

// Environment handed to plugin processes
pub const ENV_PLUGIN_ID: &str = "PLEXUS_PLUGIN_ID";
pub const ENV_PLUGIN_CONFIG: &str = "PLEXUS_PLUGIN_CONFIG";
pub const ENV_BROKER_ADDR: &str = "PLEXUS_BROKER_ADDR";
pub const ENV_TRANSPORT: &str = "PLEXUS_TRANSPORT";
