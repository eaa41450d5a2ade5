use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV: &str = "PLEXUS_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "configs/plexus.toml";

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

static DEFAULT_GRACEFUL_MS: Lazy<u64> =
    Lazy::new(|| env_u64("PLEXUS_GRACEFUL_TIMEOUT_MS", 2_000));
static DEFAULT_TERMINATE_MS: Lazy<u64> =
    Lazy::new(|| env_u64("PLEXUS_TERMINATE_TIMEOUT_MS", 1_000));
static DEFAULT_KILL_MS: Lazy<u64> = Lazy::new(|| env_u64("PLEXUS_KILL_TIMEOUT_MS", 1_000));
static DEFAULT_TRIGGER_MS: Lazy<u64> =
    Lazy::new(|| env_u64("PLEXUS_TRIGGER_TIMEOUT_MS", 30_000));
static DEFAULT_HEALTH_MS: Lazy<u64> =
    Lazy::new(|| env_u64("PLEXUS_HEALTH_INTERVAL_MS", 5_000));
static DEFAULT_DEBOUNCE_MS: Lazy<u64> = Lazy::new(|| env_u64("PLEXUS_DEBOUNCE_MS", 50));

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time a plugin gets to honor STOP before it is terminated.
    pub graceful_timeout_ms: u64,
    pub terminate_timeout_ms: u64,
    pub kill_timeout_ms: u64,
    /// Default bound for a trigger round trip.
    pub trigger_timeout_ms: u64,
    pub health_interval_ms: u64,
    /// Interval between exit-status probes while waiting on a child.
    pub poll_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_ms: *DEFAULT_GRACEFUL_MS,
            terminate_timeout_ms: *DEFAULT_TERMINATE_MS,
            kill_timeout_ms: *DEFAULT_KILL_MS,
            trigger_timeout_ms: *DEFAULT_TRIGGER_MS,
            health_interval_ms: *DEFAULT_HEALTH_MS,
            poll_interval_ms: 50,
        }
    }
}

impl SupervisorConfig {
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_timeout_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_millis(self.trigger_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(100))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(5, 1_000))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listen address of the broker, e.g. `127.0.0.1:7788`.
    pub addr: String,
    /// Records kept per (store, topic) ring.
    pub ring_capacity: usize,
    pub request_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addr: std::env::var("PLEXUS_BROKER_ADDR").unwrap_or_else(|_| "127.0.0.1:7788".into()),
            ring_capacity: 512,
            request_timeout_ms: 5_000,
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Orphaned replies retained for late pickup.
    pub pending_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            pending_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    /// Ring size of the change hub per bus.
    pub hub_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: *DEFAULT_DEBOUNCE_MS,
            hub_capacity: 256,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RunsConfig {
    pub completed_cap: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self { completed_cap: 256 }
    }
}

/// Which path plugins use for bus operations. Plugin and host always talk over stdio.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Plugins dial the broker over TCP.
    Broker,
    /// Plugins relay bus operations through the host's push channel.
    #[default]
    Host,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Broker => "broker",
            TransportMode::Host => "host",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "broker" | "tcp" => Some(TransportMode::Broker),
            "host" | "relay" | "stdio" => Some(TransportMode::Host),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
}

/// What a blocking bus call does when issued from inside a handler.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    Reject,
    #[default]
    Warn,
    Allow,
}

impl SyncPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPolicy::Reject => "reject",
            SyncPolicy::Warn => "warn",
            SyncPolicy::Allow => "allow",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SyncPolicyConfig {
    pub default: SyncPolicy,
    /// Per-plugin overrides keyed by plugin id.
    pub plugins: BTreeMap<String, SyncPolicy>,
}

impl SyncPolicyConfig {
    pub fn policy_for(&self, plugin_id: &str) -> SyncPolicy {
        self.plugins.get(plugin_id).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub correlator: CorrelatorConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub sync_policy: SyncPolicyConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: &Path) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

/// Parses and validates TOML text against the configuration schema.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path.display()))
}

/// `PLEXUS_CONFIG` if set, otherwise `configs/plexus.toml`.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Loads the config at [`config_path`]; a missing file yields defaults.
pub fn load_default() -> Result<Config> {
    let path = config_path();
    if !path.exists() {
        tracing::debug!(target: "plexus::config", path = %path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    load_config(&path)
}
