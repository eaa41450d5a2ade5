use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::bus::PluginBus;
use crate::watchers::WatcherRegistry;

struct ContextInner {
    plugin_id: String,
    config: Value,
    bus: PluginBus,
    cancel: CancellationToken,
    runtime: Handle,
}

/// What every handler, hook and timer sees of its plugin.
#[derive(Clone)]
pub struct PluginContext {
    inner: Arc<ContextInner>,
}

impl PluginContext {
    pub(crate) fn new(
        plugin_id: impl Into<String>,
        config: Value,
        bus: PluginBus,
        cancel: CancellationToken,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                plugin_id: plugin_id.into(),
                config,
                bus,
                cancel,
                runtime,
            }),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    /// Configuration handed over by the host at spawn time.
    pub fn config(&self) -> &Value {
        &self.inner.config
    }

    /// Deserializes one top-level config key.
    pub fn config_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.inner
            .config
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn bus(&self) -> &PluginBus {
        &self.inner.bus
    }

    pub fn watchers(&self) -> &WatcherRegistry {
        self.inner.bus.watchers()
    }

    /// Cancelled once the plugin begins shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Worker pool for async handlers and timers.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }
}
