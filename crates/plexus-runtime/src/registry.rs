use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use plexus_events::Bus;
use tracing::{debug, info};

use crate::{Run, RunError, RunOutcome, RunStatus};

pub const DEFAULT_COMPLETED_CAP: usize = 256;

#[derive(Default)]
struct Store {
    active: HashMap<String, Run>,
    completed: HashMap<String, Run>,
    // completion order, oldest first
    order: VecDeque<String>,
}

impl Store {
    fn lookup(&self, run_id: &str) -> Option<&Run> {
        self.active
            .get(run_id)
            .or_else(|| self.completed.get(run_id))
    }
}

/// Active and recently finished runs. Terminal runs move into a bounded
/// completed set and are evicted oldest first once `completed_cap` is exceeded.
#[derive(Clone)]
pub struct RunRegistry {
    store: Arc<Mutex<Store>>,
    completed_cap: usize,
    bus: Option<Bus>,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETED_CAP)
    }
}

impl RunRegistry {
    pub fn new(completed_cap: usize) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            completed_cap: completed_cap.max(1),
            bus: None,
        }
    }

    /// Publishes every committed change on `bus` as `run.updated`.
    pub fn with_bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn completed_cap(&self) -> usize {
        self.completed_cap
    }

    pub fn create(&self, plugin_id: &str, entry_id: &str) -> Run {
        let run = Run::new(plugin_id, entry_id);
        self.store
            .lock()
            .active
            .insert(run.run_id.clone(), run.clone());
        debug!(
            target: "plexus::runs",
            run_id = %run.run_id,
            plugin = %plugin_id,
            entry = %entry_id,
            "run created"
        );
        self.publish(&run);
        run
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.store.lock().lookup(run_id).cloned()
    }

    /// All known runs, active first, then completed from newest to oldest.
    pub fn list(&self) -> Vec<Run> {
        let store = self.store.lock();
        let mut active: Vec<Run> = store.active.values().cloned().collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active.extend(
            store
                .order
                .iter()
                .rev()
                .filter_map(|id| store.completed.get(id).cloned()),
        );
        active
    }

    pub fn active_len(&self) -> usize {
        self.store.lock().active.len()
    }

    pub fn completed_len(&self) -> usize {
        self.store.lock().completed.len()
    }

    pub fn transition(&self, run_id: &str, to: RunStatus) -> Result<Run, RunError> {
        self.commit(run_id, |run| run.transition(to))
    }

    /// Updates progress fields on a non-terminal run. Progress is clamped to `[0, 1]`.
    pub fn progress(
        &self,
        run_id: &str,
        progress: Option<f64>,
        stage: Option<&str>,
        message: Option<&str>,
    ) -> Result<Run, RunError> {
        self.commit(run_id, |run| {
            if run.is_terminal() {
                return Err(RunError::InvalidTransition {
                    run_id: run.run_id.clone(),
                    from: run.status,
                    to: run.status,
                });
            }
            if let Some(p) = progress {
                run.progress = if p.is_finite() { p.clamp(0.0, 1.0) } else { 0.0 };
            }
            if let Some(stage) = stage {
                run.stage = stage.to_string();
            }
            if let Some(message) = message {
                run.message = message.to_string();
            }
            run.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Queued runs are canceled immediately; running runs move to
    /// `cancel_requested` and wait for the worker to acknowledge.
    pub fn request_cancel(&self, run_id: &str, reason: Option<&str>) -> Result<Run, RunError> {
        self.commit(run_id, |run| {
            let to = match run.status {
                RunStatus::Queued => RunStatus::Canceled,
                _ => RunStatus::CancelRequested,
            };
            run.transition(to)?;
            run.cancel_requested = true;
            run.cancel_reason = reason.map(str::to_string);
            Ok(())
        })
    }

    pub fn finish(&self, run_id: &str, outcome: RunOutcome) -> Result<Run, RunError> {
        if !outcome.status.is_terminal() {
            return Err(RunError::NotTerminal {
                run_id: run_id.to_string(),
                status: outcome.status,
            });
        }
        self.commit(run_id, move |run| {
            if let Some(message) = outcome.message {
                run.message = message;
            }
            run.error = outcome.error;
            run.result_ref = outcome.result_ref;
            run.transition(outcome.status)
        })
    }

    /// Applies `f` to a scratch copy and stores it only on success, so a
    /// rejected change never leaves a partially updated run behind.
    fn commit<F>(&self, run_id: &str, f: F) -> Result<Run, RunError>
    where
        F: FnOnce(&mut Run) -> Result<(), RunError>,
    {
        let updated = {
            let mut store = self.store.lock();
            let Some(current) = store.active.get(run_id) else {
                return match store.completed.get(run_id) {
                    Some(done) => {
                        let mut scratch = done.clone();
                        f(&mut scratch)?;
                        // terminal runs accept nothing, f must have failed
                        Err(RunError::InvalidTransition {
                            run_id: run_id.to_string(),
                            from: done.status,
                            to: scratch.status,
                        })
                    }
                    None => Err(RunError::NotFound(run_id.to_string())),
                };
            };
            let mut scratch = current.clone();
            f(&mut scratch)?;
            if scratch.is_terminal() {
                store.active.remove(run_id);
                store.completed.insert(run_id.to_string(), scratch.clone());
                store.order.push_back(run_id.to_string());
                while store.order.len() > self.completed_cap {
                    if let Some(oldest) = store.order.pop_front() {
                        store.completed.remove(&oldest);
                        debug!(target: "plexus::runs", run_id = %oldest, "evicted completed run");
                    }
                }
            } else {
                store.active.insert(run_id.to_string(), scratch.clone());
            }
            scratch
        };
        if updated.is_terminal() {
            info!(
                target: "plexus::runs",
                run_id = %updated.run_id,
                plugin = %updated.plugin_id,
                status = %updated.status,
                "run finished"
            );
        }
        self.publish(&updated);
        Ok(updated)
    }

    fn publish(&self, run: &Run) {
        if let Some(bus) = &self.bus {
            bus.publish(plexus_topics::TOPIC_RUN_UPDATED, run);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_protocol::{ErrorCode, ErrorInfo};

    fn finished(registry: &RunRegistry, entry: &str) -> Run {
        let run = registry.create("echo", entry);
        registry
            .transition(&run.run_id, RunStatus::Running)
            .expect("start");
        registry
            .finish(&run.run_id, RunOutcome::succeeded(None))
            .expect("finish")
    }

    #[test]
    fn completed_runs_are_evicted_oldest_first() {
        let registry = RunRegistry::new(2);
        let first = finished(&registry, "a");
        let second = finished(&registry, "b");
        let third = finished(&registry, "c");
        assert_eq!(registry.completed_len(), 2);
        assert!(registry.get(&first.run_id).is_none());
        assert!(registry.get(&second.run_id).is_some());
        assert!(registry.get(&third.run_id).is_some());
        let listed: Vec<String> = registry.list().into_iter().map(|r| r.entry_id).collect();
        assert_eq!(listed, vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn rejected_transition_leaves_store_unchanged() {
        let registry = RunRegistry::default();
        let run = registry.create("echo", "echo");
        let before = registry.get(&run.run_id).expect("present");
        let err = registry
            .transition(&run.run_id, RunStatus::Succeeded)
            .expect_err("queued cannot succeed");
        assert!(matches!(err, RunError::InvalidTransition { .. }));
        assert_eq!(registry.get(&run.run_id), Some(before));
        assert_eq!(registry.active_len(), 1);
    }

    #[test]
    fn cancel_depends_on_current_status() {
        let registry = RunRegistry::default();
        let queued = registry.create("echo", "slow");
        let canceled = registry
            .request_cancel(&queued.run_id, Some("user"))
            .expect("cancel queued");
        assert_eq!(canceled.status, RunStatus::Canceled);
        assert_eq!(canceled.cancel_reason.as_deref(), Some("user"));
        assert!(canceled.finished_at.is_some());

        let running = registry.create("echo", "slow");
        registry
            .transition(&running.run_id, RunStatus::Running)
            .expect("start");
        let pending = registry
            .request_cancel(&running.run_id, None)
            .expect("cancel running");
        assert_eq!(pending.status, RunStatus::CancelRequested);
        assert!(pending.cancel_requested);
        let done = registry
            .finish(&running.run_id, RunOutcome::with_status(RunStatus::Canceled))
            .expect("acknowledge");
        assert_eq!(done.status, RunStatus::Canceled);
    }

    #[test]
    fn finish_requires_terminal_outcome_and_records_error() {
        let registry = RunRegistry::default();
        let run = registry.create("echo", "boom");
        registry
            .transition(&run.run_id, RunStatus::Running)
            .expect("start");
        let err = registry
            .finish(&run.run_id, RunOutcome::with_status(RunStatus::Running))
            .expect_err("not terminal");
        assert!(matches!(err, RunError::NotTerminal { .. }));

        let failure = ErrorInfo::new(ErrorCode::Execution, "handler raised");
        let done = registry
            .finish(&run.run_id, RunOutcome::failed(failure.clone()))
            .expect("fail");
        assert_eq!(done.status, RunStatus::Failed);
        assert_eq!(done.error, Some(failure));
        assert_eq!(done.message, "handler raised");

        let again = registry.transition(&run.run_id, RunStatus::Running);
        assert!(matches!(again, Err(RunError::InvalidTransition { .. })));
        assert!(matches!(
            registry.transition("missing", RunStatus::Running),
            Err(RunError::NotFound(_))
        ));
    }

    #[test]
    fn progress_is_clamped_and_rejected_after_finish() {
        let registry = RunRegistry::default();
        let run = registry.create("echo", "slow");
        registry
            .transition(&run.run_id, RunStatus::Running)
            .expect("start");
        let updated = registry
            .progress(&run.run_id, Some(1.7), Some("uploading"), None)
            .expect("progress");
        assert_eq!(updated.progress, 1.0);
        assert_eq!(updated.stage, "uploading");
        registry
            .finish(&run.run_id, RunOutcome::with_status(RunStatus::Timeout))
            .expect("timeout");
        assert!(registry.progress(&run.run_id, Some(0.5), None, None).is_err());
    }

    #[tokio::test]
    async fn updates_are_published_on_the_bus() {
        let bus = Bus::new(16);
        let mut rx = bus.subscribe();
        let registry = RunRegistry::default().with_bus(bus);
        let run = registry.create("echo", "echo");
        registry
            .transition(&run.run_id, RunStatus::Running)
            .expect("start");
        let created = rx.recv().await.expect("created event");
        assert_eq!(created.kind, plexus_topics::TOPIC_RUN_UPDATED);
        assert_eq!(created.payload["status"], "queued");
        let started = rx.recv().await.expect("started event");
        assert_eq!(started.payload["status"], "running");
    }
}
