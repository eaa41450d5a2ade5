//! Guards against blocking bus calls issued from inside a handler.
//!
//! A handler that blocks on a reply routed back through its own command loop
//! deadlocks the plugin. The dispatcher marks the current thread with a
//! [`HandlerScope`]; blocking clients consult [`SyncPolicyGuard::check`] before
//! sending.

use std::cell::RefCell;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::{load_config, SyncPolicy, SyncPolicyConfig};
use crate::correlator::CorrelatorError;

thread_local! {
    static CURRENT_HANDLER: RefCell<Vec<Arc<str>>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as running handler `name` until dropped.
#[must_use]
pub struct HandlerScope {
    _private: (),
}

impl HandlerScope {
    pub fn enter(name: impl Into<Arc<str>>) -> Self {
        let name = name.into();
        CURRENT_HANDLER.with(|stack| stack.borrow_mut().push(name));
        Self { _private: () }
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        CURRENT_HANDLER.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Innermost handler running on this thread, if any.
pub fn current_handler() -> Option<Arc<str>> {
    CURRENT_HANDLER.with(|stack| stack.borrow().last().cloned())
}

pub fn in_handler() -> bool {
    current_handler().is_some()
}

/// Future wrapper that holds a [`HandlerScope`] for the duration of each poll,
/// so async handlers are marked on whichever worker thread polls them.
pub struct Scoped<F> {
    name: Arc<str>,
    inner: Pin<Box<F>>,
}

pub fn scoped<F: Future>(name: impl Into<Arc<str>>, fut: F) -> Scoped<F> {
    Scoped {
        name: name.into(),
        inner: Box::pin(fut),
    }
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _scope = HandlerScope::enter(self.name.clone());
        self.inner.as_mut().poll(cx)
    }
}

struct Cached {
    modified: Option<SystemTime>,
    policies: SyncPolicyConfig,
}

/// Sync policies read from the config file, re-read only when its mtime moves.
pub struct SyncPolicyCache {
    path: Option<PathBuf>,
    fallback: SyncPolicyConfig,
    cached: Mutex<Option<Cached>>,
}

impl SyncPolicyCache {
    pub fn new(path: Option<PathBuf>, fallback: SyncPolicyConfig) -> Self {
        Self {
            path,
            fallback,
            cached: Mutex::new(None),
        }
    }

    /// Fixed policies, no file backing.
    pub fn fixed(policies: SyncPolicyConfig) -> Self {
        Self::new(None, policies)
    }

    pub fn policy_for(&self, plugin_id: &str) -> SyncPolicy {
        let Some(path) = &self.path else {
            return self.fallback.policy_for(plugin_id);
        };
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        let mut cached = self.cached.lock();
        let stale = match cached.as_ref() {
            Some(c) => c.modified != modified,
            None => true,
        };
        if stale {
            let policies = if modified.is_none() {
                self.fallback.clone()
            } else {
                match load_config(path) {
                    Ok(cfg) => cfg.sync_policy,
                    Err(err) => {
                        warn!(
                            target: "plexus::correlator",
                            path = %path.display(),
                            error = %err,
                            "sync policy reload failed; keeping previous"
                        );
                        cached
                            .as_ref()
                            .map(|c| c.policies.clone())
                            .unwrap_or_else(|| self.fallback.clone())
                    }
                }
            };
            *cached = Some(Cached { modified, policies });
        }
        cached
            .as_ref()
            .map(|c| c.policies.policy_for(plugin_id))
            .unwrap_or_else(|| self.fallback.policy_for(plugin_id))
    }
}

#[derive(Clone)]
pub struct SyncPolicyGuard {
    plugin_id: String,
    cache: Arc<SyncPolicyCache>,
}

impl SyncPolicyGuard {
    pub fn new(plugin_id: impl Into<String>, cache: Arc<SyncPolicyCache>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            cache,
        }
    }

    /// Checks a blocking `operation` against the plugin's policy. Outside a
    /// handler scope this always passes.
    pub fn check(&self, operation: &str) -> Result<(), CorrelatorError> {
        let Some(handler) = current_handler() else {
            return Ok(());
        };
        match self.cache.policy_for(&self.plugin_id) {
            SyncPolicy::Allow => Ok(()),
            SyncPolicy::Warn => {
                warn!(
                    target: "plexus::correlator",
                    plugin = %self.plugin_id,
                    handler = %handler,
                    operation,
                    "blocking call inside handler may deadlock the command loop"
                );
                Ok(())
            }
            SyncPolicy::Reject => Err(CorrelatorError::PolicyViolation {
                handler: handler.to_string(),
                operation: operation.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;

    fn guard(default: SyncPolicy) -> SyncPolicyGuard {
        let policies = SyncPolicyConfig {
            default,
            plugins: BTreeMap::from([("relaxed".to_string(), SyncPolicy::Allow)]),
        };
        SyncPolicyGuard::new("strict", Arc::new(SyncPolicyCache::fixed(policies)))
    }

    #[test]
    fn reject_applies_only_inside_handler_scope() {
        let guard = guard(SyncPolicy::Reject);
        assert!(guard.check("bus.query").is_ok());
        {
            let _scope = HandlerScope::enter("on_trigger");
            let err = guard.check("bus.query").expect_err("rejected");
            assert_eq!(
                err,
                CorrelatorError::PolicyViolation {
                    handler: "on_trigger".into(),
                    operation: "bus.query".into()
                }
            );
        }
        assert!(!in_handler());
        assert!(guard.check("bus.query").is_ok());
    }

    #[test]
    fn warn_and_allow_proceed() {
        let _scope = HandlerScope::enter("h");
        assert!(guard(SyncPolicy::Warn).check("bus.publish").is_ok());
        assert!(guard(SyncPolicy::Allow).check("bus.publish").is_ok());
    }

    #[test]
    fn nested_scopes_restore_outer_handler() {
        let outer = HandlerScope::enter("outer");
        {
            let _inner = HandlerScope::enter("inner");
            assert_eq!(current_handler().as_deref(), Some("inner"));
        }
        assert_eq!(current_handler().as_deref(), Some("outer"));
        drop(outer);
        assert_eq!(current_handler(), None);
    }

    #[tokio::test]
    async fn scoped_future_marks_each_poll() {
        let seen = scoped("async_entry", async {
            tokio::task::yield_now().await;
            current_handler()
        })
        .await;
        assert_eq!(seen.as_deref(), Some("async_entry"));
        assert_eq!(current_handler(), None);
    }

    #[test]
    fn cache_rereads_file_when_modified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plexus.toml");
        std::fs::write(&path, "[sync_policy]\ndefault = \"allow\"\n").expect("write");
        let cache = SyncPolicyCache::new(Some(path.clone()), SyncPolicyConfig::default());
        assert_eq!(cache.policy_for("echo"), SyncPolicy::Allow);

        // make sure the mtime actually moves on coarse filesystems
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut file = std::fs::File::create(&path).expect("truncate");
        writeln!(file, "[sync_policy]\ndefault = \"reject\"").expect("rewrite");
        drop(file);
        let later = SystemTime::now() + std::time::Duration::from_secs(2);
        let handle = std::fs::File::options()
            .write(true)
            .open(&path)
            .expect("reopen");
        handle.set_modified(later).expect("bump mtime");
        drop(handle);
        assert_eq!(cache.policy_for("echo"), SyncPolicy::Reject);
    }
}
