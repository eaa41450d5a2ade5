use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use plexus_broker::{Broker, BrokerOptions, BrokerServer};
use plexus_core::{load_config, load_default, LockDiagnostic, LockTracker};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "plexus-broker", version, about = "Plexus message-plane broker")]
struct Cli {
    /// Config file (defaults to $PLEXUS_CONFIG or configs/plexus.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen address, overrides `broker.addr`
    #[arg(long)]
    addr: Option<String>,
    /// Messages kept per (store, topic), overrides `broker.ring_capacity`
    #[arg(long)]
    ring_capacity: Option<usize>,
    /// Interval between lock diagnostics sweeps, in seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    lock_sweep_secs: u64,
}

fn spawn_lock_sweep(every: Duration, cancel: CancellationToken) {
    tokio::spawn(async move {
        let tracker = LockTracker::global();
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(target: "plexus::locks", "lock sweep cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    for diagnostic in tracker.check_all(every) {
                        match diagnostic {
                            LockDiagnostic::LongHold { lock, thread, held_for, location } => warn!(
                                target: "plexus::locks",
                                %lock,
                                %thread,
                                held_ms = held_for.as_millis() as u64,
                                %location,
                                "lock held for a long time"
                            ),
                            LockDiagnostic::Stalled { thread, lock, waiting_for } => warn!(
                                target: "plexus::locks",
                                %lock,
                                %thread,
                                waiting_ms = waiting_for.as_millis() as u64,
                                "thread stalled waiting for lock"
                            ),
                        }
                    }
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    plexus_otel::init();
    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => load_config(path)?,
        None => load_default()?,
    };
    let addr = cli.addr.unwrap_or_else(|| cfg.broker.addr.clone());
    let options = BrokerOptions {
        ring_capacity: cli.ring_capacity.unwrap_or(cfg.broker.ring_capacity),
        ..BrokerOptions::default()
    };
    let broker = Arc::new(Broker::new(options));
    let server = BrokerServer::bind(broker, &addr)
        .await
        .with_context(|| format!("binding broker on {addr}"))?;
    let cancel = server.cancel_token();

    if cli.lock_sweep_secs > 0 {
        spawn_lock_sweep(Duration::from_secs(cli.lock_sweep_secs), cancel.clone());
    }
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "plexus::broker", "shutdown requested");
            signal_cancel.cancel();
        }
    });

    server.run().await.context("broker server failed")?;
    Ok(())
}
