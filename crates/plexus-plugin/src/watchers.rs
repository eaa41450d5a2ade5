use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use plexus_protocol::Delta;
use plexus_query::Watcher;
use tracing::{debug, trace};

/// Live watchers of one plugin, keyed by subscription id.
#[derive(Clone, Default)]
pub struct WatcherRegistry {
    inner: Arc<RwLock<HashMap<String, Watcher>>>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, sub_id: impl Into<String>, watcher: Watcher) {
        let sub_id = sub_id.into();
        if let Some(previous) = self.inner.write().insert(sub_id.clone(), watcher) {
            debug!(target: "plexus::plugin", sub_id = %sub_id, "replaced watcher");
            previous.stop();
        }
    }

    pub fn remove(&self, sub_id: &str) -> Option<Watcher> {
        let removed = self.inner.write().remove(sub_id);
        if let Some(watcher) = &removed {
            watcher.stop();
        }
        removed
    }

    pub fn get(&self, sub_id: &str) -> Option<Watcher> {
        self.inner.read().get(sub_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Routes a `BUS_CHANGE` to its subscription. False when no watcher owns it.
    pub fn deliver(&self, sub_id: &str, delta: Delta) -> bool {
        match self.get(sub_id) {
            Some(watcher) => {
                watcher.push(delta);
                true
            }
            None => {
                trace!(target: "plexus::plugin", sub_id, "delta for unknown subscription");
                false
            }
        }
    }

    /// Fans a delta out to every watcher of its bus; returns how many got it.
    pub fn deliver_bus(&self, delta: &Delta) -> usize {
        let watchers: Vec<Watcher> = self
            .inner
            .read()
            .values()
            .filter(|w| w.bus() == delta.bus)
            .cloned()
            .collect();
        for watcher in &watchers {
            watcher.push(delta.clone());
        }
        watchers.len()
    }

    pub fn stop_all(&self) {
        let drained: Vec<Watcher> = self.inner.write().drain().map(|(_, w)| w).collect();
        for watcher in drained {
            watcher.stop();
        }
    }
}
