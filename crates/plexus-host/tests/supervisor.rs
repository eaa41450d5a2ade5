use std::time::{Duration, Instant};

use plexus_core::config::Config;
use plexus_host::{EntryPoint, HostError, ShutdownOutcome, Supervisor};
use plexus_protocol::{Args, ErrorCode, PluginState};
use serde_json::{json, Value};

const READY: Duration = Duration::from_secs(10);

fn echo_entry() -> EntryPoint {
    EntryPoint::new(env!("CARGO_BIN_EXE_plexus-echo-plugin")).env("RUST_LOG", "warn")
}

fn args(value: Value) -> Args {
    match value {
        Value::Object(map) => map,
        _ => Args::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_answers_within_a_second() {
    let supervisor = Supervisor::new(&Config::default());
    let host = supervisor
        .spawn("echo-1", &echo_entry(), json!({}))
        .expect("spawn echo plugin");
    host.wait_ready(READY).await.expect("plugin ready");

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        host.trigger("echo", args(json!({"message": "hi"})), None),
    )
    .await
    .expect("echo within 1s")
    .expect("trigger succeeded");
    assert!(result.success, "{result:?}");
    assert_eq!(result.data, json!("Echo: hi"));

    let outcome = host
        .shutdown(Duration::from_secs(2))
        .await
        .expect("shutdown");
    assert_eq!(outcome, ShutdownOutcome::Graceful);
    assert!(!host.is_alive());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_failures_come_back_as_failed_results() {
    let supervisor = Supervisor::new(&Config::default());
    let host = supervisor
        .spawn("echo-2", &echo_entry(), json!({}))
        .expect("spawn echo plugin");
    host.wait_ready(READY).await.expect("plugin ready");

    let missing = host
        .trigger("nope", Args::new(), Some(Duration::from_secs(2)))
        .await
        .expect("round trip");
    assert!(!missing.success);
    assert_eq!(missing.error.expect("error").code, ErrorCode::NotFound);

    let bad_args = host
        .trigger("echo", Args::new(), Some(Duration::from_secs(2)))
        .await
        .expect("round trip");
    assert_eq!(bad_args.error.expect("error").code, ErrorCode::InvalidRequest);

    let greeting = host
        .trigger_custom("greeting", "hello", args(json!({"name": "ada"})), None)
        .await
        .expect("custom trigger");
    assert_eq!(greeting.data, json!("Hello, ada! from echo-2"));

    host.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trigger_timeout_cancels_the_request() {
    let supervisor = Supervisor::new(&Config::default());
    let host = supervisor
        .spawn("echo-3", &echo_entry(), json!({}))
        .expect("spawn echo plugin");
    host.wait_ready(READY).await.expect("plugin ready");

    let err = host
        .trigger("slow", args(json!({"ms": 5_000})), Some(Duration::from_millis(200)))
        .await
        .expect_err("slow handler must time out");
    assert!(matches!(err, HostError::Timeout { .. }), "got {err:?}");

    // the plugin is still usable afterwards
    let result = host
        .trigger("echo", args(json!({"message": "still here"})), None)
        .await
        .expect("trigger after timeout");
    assert_eq!(result.data, json!("Echo: still here"));
    host.shutdown(Duration::from_secs(2)).await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_ignoring_plugin_is_terminated() {
    let config = Config::default();
    let supervisor = Supervisor::new(&config);
    let entry = echo_entry().env("PLEXUS_ECHO_STOP_DELAY_MS", "3000");
    let host = supervisor
        .spawn("stubborn", &entry, json!({}))
        .expect("spawn echo plugin");
    host.wait_ready(READY).await.expect("plugin ready");

    let graceful = Duration::from_secs(2);
    let bound = graceful
        + config.supervisor.terminate_timeout()
        + config.supervisor.kill_timeout()
        + Duration::from_millis(500);
    let started = Instant::now();
    let outcome = host.shutdown(graceful).await.expect("shutdown escalates");
    assert_eq!(outcome, ShutdownOutcome::Terminated);
    assert!(started.elapsed() >= graceful);
    assert!(started.elapsed() <= bound, "took {:?}", started.elapsed());
    assert!(!host.is_alive());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_check_tracks_liveness() {
    let supervisor = Supervisor::new(&Config::default());
    let host = supervisor
        .spawn("echo-4", &echo_entry(), json!({}))
        .expect("spawn echo plugin");
    host.wait_ready(READY).await.expect("plugin ready");

    let report = host.health_check();
    assert!(report.alive);
    assert_eq!(report.exitcode, None);
    assert_eq!(report.pid, host.pid());
    assert_eq!(report.status, PluginState::Ready);

    host.shutdown(Duration::from_secs(2)).await.expect("shutdown");
    let report = host.health_check();
    assert!(!report.alive);
    assert_eq!(report.exitcode, Some(0));
    assert_eq!(report.status, PluginState::Stopped);

    let err = host
        .trigger("echo", args(json!({"message": "late"})), None)
        .await
        .expect_err("dead plugin");
    assert!(matches!(err, HostError::NotRunning(_)), "got {err:?}");
}
