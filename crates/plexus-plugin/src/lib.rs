//! Plugin-side runtime: handler registration, the command loop, stdio framing
//! and bus access.
//!
//! A plugin binary builds a [`PluginSpec`] and hands it to [`run`]:
//!
//! ```no_run
//! use plexus_plugin::{PluginBuilder, HandlerError};
//! use serde_json::json;
//!
//! fn main() -> anyhow::Result<()> {
//!     let spec = PluginBuilder::new("echo")
//!         .entry("echo", |_, call| {
//!             let message = call.str_arg("message")?;
//!             Ok(json!(format!("Echo: {message}")))
//!         })
//!         .build()?;
//!     plexus_plugin::run(spec)
//! }
//! ```

mod builder;
mod bus;
mod context;
mod crash;
mod dispatch;
mod transport;
mod watchers;

pub use builder::{BuildError, Call, EventKey, Handler, HandlerError, HandlerResult, PluginBuilder, PluginSpec};
pub use bus::{BusResult, PluginBus};
pub use context::PluginContext;
pub use crash::install_crash_hook;
pub use dispatch::{CommandLoop, LoopExit, LoopOptions};
pub use transport::{Outbound, TransportError};
pub use watchers::WatcherRegistry;

use std::io::BufReader;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use plexus_broker::{BrokerClient, ClientOptions};
use plexus_core::config::{config_path, Config};
use plexus_core::{load_default, Correlator, HandlerScope, SyncPolicyCache, SyncPolicyGuard, TransportMode};
use plexus_protocol::{PluginState, StatusFrame};
use plexus_topics as topics;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{BusOptions, HostRelay};

const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(2);

/// What the host hands a plugin process through its environment.
#[derive(Clone, Debug)]
pub struct PluginEnv {
    pub plugin_id: String,
    pub config: Value,
    pub transport: TransportMode,
    pub broker_addr: String,
}

impl PluginEnv {
    pub fn from_env(default_id: &str, cfg: &Config) -> anyhow::Result<Self> {
        let plugin_id = std::env::var(topics::ENV_PLUGIN_ID)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_id.to_string());
        let config = match std::env::var(topics::ENV_PLUGIN_CONFIG) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .with_context(|| format!("{} is not valid JSON", topics::ENV_PLUGIN_CONFIG))?,
            _ => Value::Object(Default::default()),
        };
        let transport = match std::env::var(topics::ENV_TRANSPORT) {
            Ok(raw) => TransportMode::from_slug(&raw)
                .ok_or_else(|| anyhow!("unknown transport mode `{raw}`"))?,
            Err(_) => cfg.transport.mode,
        };
        let broker_addr = std::env::var(topics::ENV_BROKER_ADDR)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| cfg.broker.addr.clone());
        Ok(Self {
            plugin_id,
            config,
            transport,
            broker_addr,
        })
    }
}

fn run_startup_hooks(spec: &PluginSpec, ctx: &PluginContext) -> anyhow::Result<()> {
    for hook in &spec.startup {
        let _scope = HandlerScope::enter("on_startup");
        match catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(anyhow!("startup hook failed: {err}")),
            Err(panic) => {
                return Err(anyhow!(
                    "startup hook panicked: {}",
                    dispatch::panic_message(panic.as_ref())
                ))
            }
        }
    }
    Ok(())
}

/// Serves `spec` over stdin/stdout until `STOP` or stdin closes.
pub fn run(spec: PluginSpec) -> anyhow::Result<()> {
    plexus_otel::init_plugin();
    install_crash_hook();
    let cfg = load_default().unwrap_or_else(|err| {
        warn!(target: "plexus::plugin", error = %err, "config unreadable; using defaults");
        Config::default()
    });
    let env = PluginEnv::from_env(spec.id(), &cfg)?;
    if env.plugin_id != spec.id() {
        warn!(target: "plexus::plugin", declared = %spec.id(), assigned = %env.plugin_id, "host assigned a different plugin id");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("plexus-worker")
        .enable_all()
        .build()
        .context("building plugin worker pool")?;

    let (outbound, writer_rx) = transport::outbound_channel();
    let writer = transport::spawn_writer(std::io::stdout(), writer_rx).context("spawning stdout writer")?;
    let responses = Correlator::new("host-relay", cfg.correlator.pending_capacity);
    let (commands_tx, commands_rx) = std::sync::mpsc::channel();
    transport::spawn_reader(BufReader::new(std::io::stdin()), commands_tx, responses.clone())
        .context("spawning stdin reader")?;

    let fail = |message: String| -> anyhow::Error {
        outbound.send_status(&StatusFrame::new(PluginState::Crashed, Some(message.clone())));
        anyhow!(message)
    };

    let broker = match env.transport {
        TransportMode::Host => None,
        TransportMode::Broker => {
            let options = ClientOptions {
                request_timeout: cfg.broker.request_timeout(),
                pending_capacity: cfg.correlator.pending_capacity,
                from_plugin: Some(env.plugin_id.clone()),
            };
            match runtime.block_on(BrokerClient::connect(&env.broker_addr, options)) {
                Ok(client) => Some(client),
                Err(err) => {
                    let err = fail(format!("broker {} unreachable: {err}", env.broker_addr));
                    outbound.close();
                    let _ = writer.join();
                    return Err(err);
                }
            }
        }
    };

    let policies = Arc::new(SyncPolicyCache::new(Some(config_path()), cfg.sync_policy.clone()));
    let bus = PluginBus::new(
        env.plugin_id.clone(),
        HostRelay::new(outbound.clone(), responses),
        broker,
        SyncPolicyGuard::new(env.plugin_id.clone(), policies),
        WatcherRegistry::new(),
        BusOptions {
            timeout: cfg.broker.request_timeout(),
            debounce: cfg.watch.debounce(),
        },
    );
    bus.spawn_delta_forwarder(runtime.handle());
    let ctx = PluginContext::new(
        env.plugin_id.clone(),
        env.config.clone(),
        bus,
        CancellationToken::new(),
        runtime.handle().clone(),
    );

    if let Err(err) = run_startup_hooks(&spec, &ctx) {
        let err = fail(format!("{err:#}"));
        outbound.close();
        let _ = writer.join();
        return Err(err);
    }
    dispatch::spawn_timers(&spec, &ctx);

    info!(
        target: "plexus::plugin",
        plugin = %env.plugin_id,
        transport = env.transport.as_str(),
        handlers = spec.keys().len(),
        "plugin ready"
    );
    outbound.send_status(&StatusFrame::new(PluginState::Ready, None));

    let options = LoopOptions {
        poll_interval: cfg.supervisor.poll_interval(),
        ..LoopOptions::default()
    };
    let handle = CommandLoop::new(Arc::new(spec), ctx, outbound.clone(), commands_rx, options)
        .spawn()
        .context("spawning command loop")?;
    let exit = handle.join().map_err(|_| anyhow!("command loop panicked"))?;

    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    outbound.close();
    if writer.join().is_err() {
        warn!(target: "plexus::plugin", "writer thread panicked");
    }
    info!(target: "plexus::plugin", ?exit, "plugin exited");
    Ok(())
}
