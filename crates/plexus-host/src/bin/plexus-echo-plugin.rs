//! Reference plugin used by the supervisor tests and the CLI.
//!
//! `PLEXUS_ECHO_STOP_DELAY_MS` makes the shutdown hook stall, which simulates a
//! plugin that does not honor `STOP` in time.

use std::time::Duration;

use plexus_plugin::{HandlerError, PluginBuilder};
use serde_json::{json, Value};
use tracing::info;

const STOP_DELAY_ENV: &str = "PLEXUS_ECHO_STOP_DELAY_MS";

fn stop_delay() -> Option<Duration> {
    std::env::var(STOP_DELAY_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn main() -> anyhow::Result<()> {
    let spec = PluginBuilder::new("echo")
        .declare_entries(["echo", "slow", "publish", "fail"])
        .entry("echo", |_, call| {
            let message = call.str_arg("message")?;
            Ok(json!(format!("Echo: {message}")))
        })
        .entry_async("slow", |_, call| async move {
            let ms = call.arg("ms").and_then(Value::as_u64).unwrap_or(500);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"slept_ms": ms}))
        })
        .entry_async("publish", |ctx, call| async move {
            let store = call.str_arg("store")?.to_string();
            let topic = call.str_arg("topic")?.to_string();
            let payload = call.arg("payload").cloned().unwrap_or(Value::Null);
            Ok(ctx.bus().publish(&store, &topic, payload).await?)
        })
        .entry("fail", |_, call| {
            let reason = call.str_arg("reason").unwrap_or("requested failure");
            Err(HandlerError::msg(reason))
        })
        .custom("greeting", "hello", |ctx, call| {
            let name = call.str_arg("name").unwrap_or("there");
            Ok(json!(format!("Hello, {name}! from {}", ctx.plugin_id())))
        })
        .on_shutdown(|ctx| {
            if let Some(delay) = stop_delay() {
                info!(target: "plexus::plugin", plugin = %ctx.plugin_id(), delay_ms = delay.as_millis() as u64, "stalling shutdown");
                std::thread::sleep(delay);
            }
            Ok(())
        })
        .build()?;
    plexus_plugin::run(spec)
}
