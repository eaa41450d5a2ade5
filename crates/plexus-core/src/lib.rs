//! Shared runtime plumbing: configuration, reply correlation, the blocking-call
//! guard, lock diagnostics, lossy queues and retry helpers.

pub mod config;
pub mod correlator;
pub mod locks;
pub mod queue;
pub mod retry;
pub mod sync_guard;

pub use config::{load_config, load_default, Config, SyncPolicy, TransportMode};
pub use correlator::{Correlator, CorrelatorError, Delivery, Ticket, DEFAULT_PENDING_CAPACITY};
pub use locks::{LockDiagnostic, LockError, LockTracker, TrackedMutex};
pub use queue::{LossyQueue, OverflowPolicy, PushOutcome};
pub use retry::{Backoff, Retry};
pub use sync_guard::{HandlerScope, SyncPolicyCache, SyncPolicyGuard};
