use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use plexus_core::config::Config;
use plexus_events::Bus;
use plexus_protocol::{Args, ResultEnvelope};
use plexus_runtime::{Run, RunRegistry};
use plexus_topics as topics;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::host::{Host, HostError, ShutdownOutcome};
use crate::router::{BusBackend, HostRouter, HostTable};
use crate::supervisor::{EntryPoint, Supervisor};

struct Loaded {
    entry: EntryPoint,
    config: Value,
    health: CancellationToken,
}

/// Owns the hosts of one deployment by plugin id.
///
/// A plugin that dies stays dead until [`PluginManager::restart`] is called.
pub struct PluginManager {
    supervisor: Supervisor,
    hosts: HostTable,
    loaded: Mutex<HashMap<String, Loaded>>,
    router: HostRouter,
    events: Bus,
    health_interval: Duration,
}

impl PluginManager {
    /// Must be called from within a tokio runtime.
    pub fn new(cfg: &Config, backend: BusBackend, events: Bus) -> Self {
        let hosts: HostTable = Arc::new(RwLock::new(HashMap::new()));
        Self {
            supervisor: Supervisor::new(cfg).with_events(events.clone()),
            router: HostRouter::new(backend, hosts.clone()),
            hosts,
            loaded: Mutex::new(HashMap::new()),
            events,
            health_interval: cfg.supervisor.health_interval(),
        }
    }

    /// Replaces the supervisor, e.g. to point plugins at a different broker.
    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor.with_events(self.events.clone());
        self
    }

    pub fn events(&self) -> &Bus {
        &self.events
    }

    pub fn router(&self) -> &HostRouter {
        &self.router
    }

    pub fn runs(&self) -> &RunRegistry {
        self.supervisor.runs()
    }

    pub fn get(&self, plugin_id: &str) -> Option<Host> {
        self.hosts.read().get(plugin_id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn spawn(&self, plugin_id: &str, entry: EntryPoint, config: Value) -> Result<Host, HostError> {
        if self.get(plugin_id).is_some_and(|h| h.is_alive()) {
            return Err(HostError::AlreadyRunning(plugin_id.to_string()));
        }
        let host = self.supervisor.spawn_with(
            plugin_id,
            &entry,
            config.clone(),
            Arc::new(self.router.clone()),
        )?;
        self.hosts.write().insert(plugin_id.to_string(), host.clone());
        let health = self.spawn_health_loop(host.clone());
        if let Some(previous) = self.loaded.lock().insert(
            plugin_id.to_string(),
            Loaded {
                entry,
                config,
                health,
            },
        ) {
            previous.health.cancel();
        }
        self.events.publish(
            topics::TOPIC_PLUGIN_SPAWNED,
            &json!({"plugin": plugin_id, "pid": host.pid()}),
        );
        Ok(host)
    }

    pub async fn trigger(
        &self,
        plugin_id: &str,
        entry_id: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<ResultEnvelope, HostError> {
        self.host(plugin_id)?.trigger(entry_id, args, timeout).await
    }

    pub async fn start_run(
        &self,
        plugin_id: &str,
        entry_id: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<Run, HostError> {
        self.host(plugin_id)?.start_run(entry_id, args, timeout).await
    }

    pub async fn cancel_run(&self, run_id: &str, reason: Option<&str>) -> Result<Run, HostError> {
        let run = self
            .runs()
            .get(run_id)
            .ok_or_else(|| HostError::Run(plexus_runtime::RunError::NotFound(run_id.to_string())))?;
        self.host(&run.plugin_id)?.cancel_run(run_id, reason).await
    }

    /// Stops `plugin_id` and starts it again from its recorded entry point.
    pub async fn restart(&self, plugin_id: &str) -> Result<Host, HostError> {
        let (entry, config) = {
            let loaded = self.loaded.lock();
            let spec = loaded
                .get(plugin_id)
                .ok_or_else(|| HostError::NotFound(plugin_id.to_string()))?;
            (spec.entry.clone(), spec.config.clone())
        };
        if let Some(host) = self.get(plugin_id) {
            if host.is_alive() {
                let graceful = self.supervisor.config().graceful_timeout();
                host.shutdown(graceful).await?;
            }
        }
        self.router.forget_plugin(plugin_id).await;
        info!(target: "plexus::supervisor", plugin = %plugin_id, "restarting plugin");
        self.spawn(plugin_id, entry, config)
    }

    pub async fn shutdown(&self, plugin_id: &str, timeout: Duration) -> Result<ShutdownOutcome, HostError> {
        let host = self.host(plugin_id)?;
        let health = self.loaded.lock().get(plugin_id).map(|l| l.health.clone());
        if let Some(health) = health {
            health.cancel();
        }
        let outcome = host.shutdown(timeout).await;
        self.router.forget_plugin(plugin_id).await;
        self.hosts.write().remove(plugin_id);
        self.loaded.lock().remove(plugin_id);
        let outcome = outcome?;
        self.events.publish(
            topics::TOPIC_PLUGIN_EXITED,
            &json!({"plugin": plugin_id, "outcome": outcome.as_str()}),
        );
        Ok(outcome)
    }

    /// Stops every plugin concurrently and reports each outcome.
    pub async fn shutdown_all(&self, timeout: Duration) -> Vec<(String, Result<ShutdownOutcome, HostError>)> {
        let ids = self.list();
        let stops = ids.iter().map(|id| self.shutdown(id, timeout));
        let outcomes = futures_util::future::join_all(stops).await;
        self.router.close();
        ids.into_iter().zip(outcomes).collect()
    }

    fn host(&self, plugin_id: &str) -> Result<Host, HostError> {
        self.get(plugin_id)
            .ok_or_else(|| HostError::NotFound(plugin_id.to_string()))
    }

    fn spawn_health_loop(&self, host: Host) -> CancellationToken {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let events = self.events.clone();
        let router = self.router.clone();
        let every = self.health_interval;
        tokio::spawn(async move {
            let plugin = host.plugin_id().to_string();
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(target: "plexus::supervisor", plugin = %plugin, "health loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = host.health_check();
                        let observed = (report.alive, report.status);
                        if last != Some(observed) {
                            if last.is_some() {
                                info!(
                                    target: "plexus::supervisor",
                                    plugin = %plugin,
                                    alive = report.alive,
                                    status = report.status.as_str(),
                                    "plugin state changed"
                                );
                            }
                            events.publish(
                                topics::TOPIC_PLUGIN_STATE_CHANGED,
                                &json!({"plugin": plugin, "health": report}),
                            );
                            last = Some(observed);
                        }
                        if !report.alive {
                            if report.exitcode == Some(0) {
                                warn!(target: "plexus::supervisor", plugin = %plugin, "plugin exited on its own");
                            } else {
                                error!(
                                    target: "plexus::supervisor",
                                    plugin = %plugin,
                                    exitcode = ?report.exitcode,
                                    "plugin died; explicit restart required"
                                );
                            }
                            events.publish(
                                topics::TOPIC_PLUGIN_EXITED,
                                &json!({"plugin": plugin, "exitcode": report.exitcode}),
                            );
                            router.forget_plugin(&plugin).await;
                            break;
                        }
                    }
                }
            }
        });
        cancel
    }
}
