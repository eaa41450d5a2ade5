use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use plexus_core::config::{Config, SupervisorConfig};
use plexus_core::TransportMode;
use plexus_events::Bus;
use plexus_runtime::RunRegistry;
use plexus_topics as topics;
use serde_json::Value;
use tokio::process::Command;
use tracing::info;

use crate::host::{Host, HostError, HostParts, PushHandler, RejectPush};

/// What to execute for a plugin.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryPoint {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl EntryPoint {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Spawns plugin processes, one OS process per plugin.
#[derive(Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    transport: TransportMode,
    broker_addr: String,
    pending_capacity: usize,
    runs: RunRegistry,
    events: Option<Bus>,
}

impl Supervisor {
    pub fn new(cfg: &Config) -> Self {
        Self {
            config: cfg.supervisor.clone(),
            transport: cfg.transport.mode,
            broker_addr: cfg.broker.addr.clone(),
            pending_capacity: cfg.correlator.pending_capacity,
            runs: RunRegistry::new(cfg.runs.completed_cap),
            events: None,
        }
    }

    /// Publishes orphaned replies and run updates on `bus`.
    pub fn with_events(mut self, bus: Bus) -> Self {
        self.runs = self.runs.with_bus(bus.clone());
        self.events = Some(bus);
        self
    }

    pub fn with_broker_addr(mut self, addr: impl Into<String>) -> Self {
        self.broker_addr = addr.into();
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    pub fn transport(&self) -> TransportMode {
        self.transport
    }

    /// Spawns `entry` with no host-side request routing.
    pub fn spawn(&self, plugin_id: &str, entry: &EntryPoint, config: Value) -> Result<Host, HostError> {
        self.spawn_with(plugin_id, entry, config, Arc::new(RejectPush))
    }

    /// Spawns `entry`; push requests from the plugin go to `push`.
    /// Must be called from within a tokio runtime.
    pub fn spawn_with(
        &self,
        plugin_id: &str,
        entry: &EntryPoint,
        config: Value,
        push: Arc<dyn PushHandler>,
    ) -> Result<Host, HostError> {
        let mut command = Command::new(&entry.program);
        command
            .args(&entry.args)
            .envs(&entry.env)
            .env(topics::ENV_PLUGIN_ID, plugin_id)
            .env(topics::ENV_PLUGIN_CONFIG, config.to_string())
            .env(topics::ENV_TRANSPORT, self.transport.as_str())
            .env(topics::ENV_BROKER_ADDR, &self.broker_addr)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &entry.cwd {
            command.current_dir(dir);
        }
        let child = command.spawn().map_err(|source| HostError::Spawn {
            plugin: plugin_id.to_string(),
            source,
        })?;
        info!(
            target: "plexus::supervisor",
            plugin = %plugin_id,
            pid = ?child.id(),
            program = %entry.program.display(),
            transport = self.transport.as_str(),
            "plugin spawned"
        );
        Host::attach(HostParts {
            plugin_id: plugin_id.to_string(),
            child,
            config: self.config.clone(),
            runs: self.runs.clone(),
            events: self.events.clone(),
            pending_capacity: self.pending_capacity,
            push,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_point_builder_collects_parts() {
        let entry = EntryPoint::new("/bin/plugin")
            .arg("--quiet")
            .env("RUST_LOG", "debug")
            .cwd("/tmp");
        assert_eq!(entry.args, vec!["--quiet".to_string()]);
        assert_eq!(entry.env.get("RUST_LOG").map(String::as_str), Some("debug"));
        assert_eq!(entry.cwd, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let supervisor = Supervisor::new(&Config::default());
        let err = supervisor
            .spawn(
                "ghost",
                &EntryPoint::new("/nonexistent/plexus-plugin-binary"),
                Value::Null,
            )
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, HostError::Spawn { .. }), "got {err:?}");
    }
}
