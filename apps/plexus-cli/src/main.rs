use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use plexus_broker::{Broker, BrokerClient, BrokerOptions, ClientOptions};
use plexus_core::config::{config_schema_json, write_schema_file, Config};
use plexus_core::{load_config, load_default};
use plexus_events::Bus;
use plexus_host::{BusBackend, EntryPoint, PluginManager};
use plexus_protocol::Args;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "plexus-cli", version, about = "Plexus plugin runtime utilities")]
struct Cli {
    /// Config file (defaults to $PLEXUS_CONFIG or configs/plexus.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a plugin, trigger one entry, print the result and stop it
    Trigger(TriggerArgs),
    /// Spawn a plugin, print its health report and stop it
    Health(PluginArgs),
    /// Talk to a running broker
    Broker {
        #[command(subcommand)]
        cmd: BrokerCmd,
    },
    /// Print or write the JSON schema of the config file
    Schema {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate a config file and print the effective values
    CheckConfig { path: PathBuf },
}

#[derive(ClapArgs)]
struct PluginArgs {
    /// Plugin executable
    #[arg(long)]
    plugin: PathBuf,
    /// Plugin id handed to the process
    #[arg(long, default_value = "plugin")]
    id: String,
    /// Plugin configuration as JSON
    #[arg(long, default_value = "{}")]
    plugin_config: String,
    /// Seconds to wait for the plugin to report ready
    #[arg(long, default_value_t = 10)]
    ready_secs: u64,
}

#[derive(ClapArgs)]
struct TriggerArgs {
    #[command(flatten)]
    plugin: PluginArgs,
    /// Entry id, or `type:id` for a custom event
    #[arg(long)]
    entry: String,
    /// Arguments as a JSON object
    #[arg(long, default_value = "{}")]
    args: String,
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
enum BrokerCmd {
    Publish {
        #[arg(long)]
        addr: Option<String>,
        store: String,
        topic: String,
        /// Payload as JSON
        payload: String,
    },
    Recent {
        #[arg(long)]
        addr: Option<String>,
        store: String,
        topic: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Stats {
        #[arg(long)]
        addr: Option<String>,
    },
    Ping {
        #[arg(long)]
        addr: Option<String>,
    },
}

fn parse_json_object(raw: &str, what: &str) -> Result<Args> {
    match serde_json::from_str::<Value>(raw).with_context(|| format!("{what} is not valid JSON"))? {
        Value::Object(map) => Ok(map),
        other => bail!("{what} must be a JSON object, got {other}"),
    }
}

fn split_entry(entry: &str) -> Option<(&str, &str)> {
    entry
        .split_once(':')
        .filter(|(kind, id)| !kind.is_empty() && !id.is_empty())
}

fn load(cli_config: Option<&Path>) -> Result<Config> {
    match cli_config {
        Some(path) => load_config(path),
        None => load_default(),
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn with_plugin<F, Fut>(cfg: &Config, args: &PluginArgs, f: F) -> Result<()>
where
    F: FnOnce(plexus_host::Host) -> Fut,
    Fut: std::future::Future<Output = Result<Value>>,
{
    let plugin_config: Value = Value::Object(parse_json_object(&args.plugin_config, "--plugin-config")?);
    let broker = Arc::new(Broker::new(BrokerOptions {
        ring_capacity: cfg.broker.ring_capacity,
        ..BrokerOptions::default()
    }));
    let manager = PluginManager::new(cfg, BusBackend::Local(broker), Bus::new(64));
    let host = manager.spawn(&args.id, EntryPoint::new(&args.plugin), plugin_config)?;
    let outcome = match host.wait_ready(Duration::from_secs(args.ready_secs)).await {
        Ok(()) => f(host).await,
        Err(err) => Err(anyhow!(err)),
    };
    for (id, stopped) in manager
        .shutdown_all(cfg.supervisor.graceful_timeout())
        .await
    {
        match stopped {
            Ok(how) => tracing::debug!(target: "plexus::supervisor", plugin = %id, outcome = how.as_str(), "plugin stopped"),
            Err(err) => tracing::warn!(target: "plexus::supervisor", plugin = %id, error = %err, "plugin stop failed"),
        }
    }
    print_json(&outcome?)
}

async fn broker_client(cfg: &Config, addr: Option<String>) -> Result<BrokerClient> {
    let addr = addr.unwrap_or_else(|| cfg.broker.addr.clone());
    let options = ClientOptions {
        request_timeout: cfg.broker.request_timeout(),
        ..ClientOptions::default()
    };
    BrokerClient::connect(&addr, options)
        .await
        .with_context(|| format!("connecting to broker at {addr}"))
}

async fn run_broker(cfg: &Config, cmd: BrokerCmd) -> Result<()> {
    let result = match cmd {
        BrokerCmd::Publish {
            addr,
            store,
            topic,
            payload,
        } => {
            let payload: Value = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            broker_client(cfg, addr).await?.publish(&store, &topic, payload).await?
        }
        BrokerCmd::Recent {
            addr,
            store,
            topic,
            limit,
        } => json!(broker_client(cfg, addr).await?.get_recent(&store, &topic, limit).await?),
        BrokerCmd::Stats { addr } => broker_client(cfg, addr).await?.stats().await?,
        BrokerCmd::Ping { addr } => broker_client(cfg, addr).await?.ping().await?,
    };
    print_json(&result)
}

#[tokio::main]
async fn main() -> Result<()> {
    plexus_otel::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Schema { out } => match out {
            Some(path) => {
                write_schema_file(&path).with_context(|| format!("writing {}", path.display()))?;
                println!("wrote {}", path.display());
                Ok(())
            }
            None => print_json(&config_schema_json()),
        },
        Commands::CheckConfig { path } => print_json(&load_config(&path)?),
        Commands::Trigger(args) => {
            let cfg = load(cli.config.as_deref())?;
            let call_args = parse_json_object(&args.args, "--args")?;
            let timeout = args.timeout_ms.map(Duration::from_millis);
            let entry = args.entry.clone();
            with_plugin(&cfg, &args.plugin, |host| async move {
                let result = match split_entry(&entry) {
                    Some((kind, id)) => host.trigger_custom(kind, id, call_args, timeout).await?,
                    None => host.trigger(&entry, call_args, timeout).await?,
                };
                Ok(serde_json::to_value(result)?)
            })
            .await
        }
        Commands::Health(args) => {
            let cfg = load(cli.config.as_deref())?;
            with_plugin(&cfg, &args, |host| async move {
                Ok(serde_json::to_value(host.health_check())?)
            })
            .await
        }
        Commands::Broker { cmd } => {
            let cfg = load(cli.config.as_deref())?;
            run_broker(&cfg, cmd).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_arguments_must_be_objects() {
        let args = parse_json_object(r#"{"message": "hi"}"#, "--args").expect("object");
        assert_eq!(args.get("message"), Some(&json!("hi")));
        assert!(parse_json_object("[1, 2]", "--args").is_err());
        assert!(parse_json_object("{", "--args").is_err());
    }

    #[test]
    fn custom_entries_split_on_colon() {
        assert_eq!(split_entry("greeting:hello"), Some(("greeting", "hello")));
        assert_eq!(split_entry("echo"), None);
        assert_eq!(split_entry(":hello"), None);
    }

    #[test]
    fn config_files_load_through_the_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plexus.toml");
        std::fs::write(&path, "[supervisor]\ngraceful_timeout_ms = 750\n").expect("write config");
        let cfg = load(Some(&path)).expect("valid config");
        assert_eq!(cfg.supervisor.graceful_timeout(), Duration::from_millis(750));
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
