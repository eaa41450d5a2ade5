//! Host side of the plugin runtime: spawns plugin processes, speaks the stdio
//! frame protocol to them, routes their bus requests and stops them within a
//! bounded time.

mod host;
mod manager;
mod router;
mod supervisor;

pub use host::{HealthReport, Host, HostError, PushHandler, RejectPush, ShutdownOutcome};
pub use manager::PluginManager;
pub use router::{BusBackend, HostRouter, HostTable};
pub use supervisor::{EntryPoint, Supervisor};
