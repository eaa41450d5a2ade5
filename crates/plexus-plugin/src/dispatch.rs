//! The plugin's command loop.
//!
//! One dedicated thread drains the command queue. Sync handlers run inline on
//! that thread; async handlers are spawned on the worker pool and report back
//! through the same result channel.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures_util::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use plexus_core::sync_guard::scoped;
use plexus_core::HandlerScope;
use plexus_protocol::{Args, Command, ErrorCode, ErrorInfo, PluginState, ResultEnvelope, StatusFrame};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::{AsyncFn, Call, EventKey, Handler, HandlerError, PluginSpec};
use crate::context::PluginContext;
use crate::transport::{Outbound, TransportError};

fn env_ms(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

static DEFAULT_HANDLER_TIMEOUT_MS: Lazy<u64> =
    Lazy::new(|| env_ms("PLEXUS_HANDLER_TIMEOUT_MS", 30_000));
static DEFAULT_POLL_MS: Lazy<u64> = Lazy::new(|| env_ms("PLEXUS_POLL_INTERVAL_MS", 50));

#[derive(Clone, Copy, Debug)]
pub struct LoopOptions {
    /// Bound on async handlers that carry no `timeout_ms` of their own.
    pub handler_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_millis(*DEFAULT_HANDLER_TIMEOUT_MS),
            poll_interval: Duration::from_millis(*DEFAULT_POLL_MS),
        }
    }
}

/// Why the loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    Stopped,
    InputClosed,
    OutputClosed,
}

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct CommandLoop {
    spec: Arc<PluginSpec>,
    ctx: PluginContext,
    outbound: Outbound,
    commands: Receiver<Command>,
    in_flight: InFlight,
    fatal: CancellationToken,
    options: LoopOptions,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn envelope(req_id: &str, outcome: Result<serde_json::Value, ErrorInfo>) -> ResultEnvelope {
    match outcome {
        Ok(data) => ResultEnvelope::ok(req_id, data),
        Err(err) => ResultEnvelope::failed(req_id, err),
    }
}

/// Sends a result; a closed channel is fatal for the loop.
fn report(outbound: &Outbound, fatal: &CancellationToken, result: ResultEnvelope) {
    match outbound.send_result(&result) {
        Ok(()) => {}
        Err(TransportError::Closed) => {
            error!(target: "plexus::plugin", req_id = %result.req_id, "result channel closed");
            fatal.cancel();
        }
        Err(err) => {
            error!(target: "plexus::plugin", req_id = %result.req_id, %err, "result dropped");
        }
    }
}

impl CommandLoop {
    pub fn new(
        spec: Arc<PluginSpec>,
        ctx: PluginContext,
        outbound: Outbound,
        commands: Receiver<Command>,
        options: LoopOptions,
    ) -> Self {
        Self {
            spec,
            ctx,
            outbound,
            commands,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            fatal: CancellationToken::new(),
            options,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<LoopExit>> {
        std::thread::Builder::new()
            .name("plexus-command-loop".into())
            .spawn(move || self.run())
    }

    pub fn run(self) -> LoopExit {
        info!(target: "plexus::plugin", plugin = %self.ctx.plugin_id(), "command loop started");
        let exit = loop {
            if self.fatal.is_cancelled() {
                break LoopExit::OutputClosed;
            }
            match self.commands.recv_timeout(self.options.poll_interval) {
                Ok(cmd) => {
                    if let Some(exit) = self.dispatch(cmd) {
                        break exit;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break LoopExit::InputClosed,
            }
        };
        self.finish(exit);
        exit
    }

    fn dispatch(&self, cmd: Command) -> Option<LoopExit> {
        debug!(target: "plexus::plugin", kind = cmd.kind(), req_id = ?cmd.req_id(), "dispatching");
        match cmd {
            Command::Stop { req_id } => {
                self.outbound
                    .send_status(&StatusFrame::new(PluginState::Stopping, None));
                if let Some(req_id) = req_id {
                    report(
                        &self.outbound,
                        &self.fatal,
                        ResultEnvelope::ok(req_id, json!({"stopping": true})),
                    );
                }
                return Some(LoopExit::Stopped);
            }
            Command::Trigger {
                entry_id,
                args,
                req_id,
                timeout_ms,
            } => self.invoke(EventKey::Entry(entry_id), req_id, args, timeout_ms),
            Command::TriggerCustom {
                event_type,
                event_id,
                args,
                req_id,
                timeout_ms,
            } => self.invoke(
                EventKey::Custom {
                    event_type,
                    event_id,
                },
                req_id,
                args,
                timeout_ms,
            ),
            Command::BusChange { sub_id, delta } => {
                if !self.ctx.watchers().deliver(&sub_id, delta) {
                    debug!(target: "plexus::plugin", sub_id = %sub_id, "bus change for unknown subscription");
                }
            }
            Command::Cancel { req_id } => match self.in_flight.lock().remove(&req_id) {
                Some(token) => {
                    info!(target: "plexus::plugin", req_id = %req_id, "cancel requested");
                    token.cancel();
                }
                None => debug!(target: "plexus::plugin", req_id = %req_id, "cancel for idle request"),
            },
        }
        if self.fatal.is_cancelled() {
            return Some(LoopExit::OutputClosed);
        }
        None
    }

    fn invoke(&self, key: EventKey, req_id: String, args: Args, timeout_ms: Option<u64>) {
        let Some(handler) = self.spec.handler(&key).cloned() else {
            warn!(target: "plexus::plugin", key = %key, req_id = %req_id, "no handler registered");
            report(
                &self.outbound,
                &self.fatal,
                ResultEnvelope::failed(
                    req_id,
                    ErrorInfo::new(ErrorCode::NotFound, format!("no handler for `{key}`")),
                ),
            );
            return;
        };
        match handler {
            Handler::Sync(f) => {
                let call = Call {
                    req_id: req_id.clone(),
                    args,
                    cancel: self.ctx.shutdown_token().child_token(),
                };
                let outcome = {
                    let _scope = HandlerScope::enter(key.to_string());
                    catch_unwind(AssertUnwindSafe(|| f(&self.ctx, call)))
                };
                let outcome = match outcome {
                    Ok(result) => result.map_err(ErrorInfo::from),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        error!(target: "plexus::plugin", key = %key, req_id = %req_id, %message, "handler panicked");
                        Err(ErrorInfo::new(
                            ErrorCode::Execution,
                            format!("handler panicked: {message}"),
                        ))
                    }
                };
                report(&self.outbound, &self.fatal, envelope(&req_id, outcome));
            }
            Handler::Async(f) => self.spawn_async(f, key, req_id, args, timeout_ms),
        }
    }

    fn spawn_async(
        &self,
        f: Arc<AsyncFn>,
        key: EventKey,
        req_id: String,
        args: Args,
        timeout_ms: Option<u64>,
    ) {
        let token = self.ctx.shutdown_token().child_token();
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&req_id) {
                drop(in_flight);
                report(
                    &self.outbound,
                    &self.fatal,
                    ResultEnvelope::failed(
                        req_id,
                        ErrorInfo::new(ErrorCode::InvalidRequest, "request id already in flight"),
                    ),
                );
                return;
            }
            in_flight.insert(req_id.clone(), token.clone());
        }
        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.options.handler_timeout);
        let call = Call {
            req_id: req_id.clone(),
            args,
            cancel: token.clone(),
        };
        let ctx = self.ctx.clone();
        let outbound = self.outbound.clone();
        let fatal = self.fatal.clone();
        let in_flight = self.in_flight.clone();
        let label = key.to_string();
        self.ctx.runtime().spawn(async move {
            let work = scoped(label.clone(), AssertUnwindSafe(f(ctx, call)).catch_unwind());
            let outcome = tokio::select! {
                _ = token.cancelled() => Err(ErrorInfo::from(HandlerError::Canceled)),
                finished = tokio::time::timeout(timeout, work) => match finished {
                    Err(_) => {
                        warn!(target: "plexus::plugin", key = %label, req_id = %req_id, timeout_ms = timeout.as_millis() as u64, "handler timed out");
                        token.cancel();
                        Err(ErrorInfo::new(
                            ErrorCode::Timeout,
                            format!("handler `{label}` exceeded {}ms", timeout.as_millis()),
                        ))
                    }
                    Ok(Err(panic)) => {
                        let message = panic_message(panic.as_ref());
                        error!(target: "plexus::plugin", key = %label, req_id = %req_id, %message, "async handler panicked");
                        Err(ErrorInfo::new(ErrorCode::Execution, format!("handler panicked: {message}")))
                    }
                    Ok(Ok(result)) => result.map_err(ErrorInfo::from),
                },
            };
            in_flight.lock().remove(&req_id);
            report(&outbound, &fatal, envelope(&req_id, outcome));
        });
    }

    fn finish(&self, exit: LoopExit) {
        info!(target: "plexus::plugin", plugin = %self.ctx.plugin_id(), ?exit, "command loop exiting");
        self.ctx.shutdown_token().cancel();
        for hook in &self.spec.shutdown {
            let _scope = HandlerScope::enter("on_shutdown");
            match catch_unwind(AssertUnwindSafe(|| hook(&self.ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(target: "plexus::plugin", %err, "shutdown hook failed"),
                Err(panic) => {
                    warn!(target: "plexus::plugin", message = %panic_message(panic.as_ref()), "shutdown hook panicked")
                }
            }
        }
        self.ctx.watchers().stop_all();
        self.outbound
            .send_status(&StatusFrame::new(PluginState::Stopped, None));
    }
}

/// Starts every registered timer on the worker pool. Timers stop with the
/// context's shutdown token.
pub(crate) fn spawn_timers(spec: &PluginSpec, ctx: &PluginContext) {
    for timer in &spec.timers {
        let run = timer.run.clone();
        let every = timer.every;
        let name = timer.name.clone();
        let ctx = ctx.clone();
        let shutdown = ctx.shutdown_token();
        ctx.runtime().clone().spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let tick = scoped(format!("timer:{name}"), AssertUnwindSafe(run(ctx.clone())).catch_unwind());
                        if let Err(panic) = tick.await {
                            warn!(target: "plexus::plugin", timer = %name, message = %panic_message(panic.as_ref()), "timer panicked");
                        }
                    }
                }
            }
            debug!(target: "plexus::plugin", timer = %name, "timer stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PluginBuilder;
    use crate::bus::{BusOptions, HostRelay, PluginBus};
    use crate::transport::{outbound_channel, WriterMsg};
    use crate::watchers::WatcherRegistry;
    use plexus_core::config::SyncPolicyConfig;
    use plexus_core::{Correlator, SyncPolicyCache, SyncPolicyGuard};
    use plexus_protocol::{Channel, Frame};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    struct Harness {
        runtime: tokio::runtime::Runtime,
        commands: mpsc::Sender<Command>,
        frames: Receiver<WriterMsg>,
        handle: JoinHandle<LoopExit>,
    }

    fn start(builder: PluginBuilder) -> Harness {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("runtime");
        let spec = Arc::new(builder.build().expect("valid plugin"));
        let (outbound, frames) = outbound_channel();
        let bus = PluginBus::new(
            spec.id(),
            HostRelay::new(outbound.clone(), Correlator::new("test", 8)),
            None,
            SyncPolicyGuard::new(
                spec.id(),
                Arc::new(SyncPolicyCache::fixed(SyncPolicyConfig::default())),
            ),
            WatcherRegistry::new(),
            BusOptions {
                timeout: Duration::from_secs(1),
                debounce: Duration::ZERO,
            },
        );
        let ctx = PluginContext::new(
            spec.id(),
            json!({"greeting": "hi"}),
            bus,
            CancellationToken::new(),
            runtime.handle().clone(),
        );
        spawn_timers(&spec, &ctx);
        let (commands, rx) = mpsc::channel();
        let handle = CommandLoop::new(
            spec,
            ctx,
            outbound,
            rx,
            LoopOptions {
                handler_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(10),
            },
        )
        .spawn()
        .expect("spawn loop");
        Harness {
            runtime,
            commands,
            frames,
            handle,
        }
    }

    fn next_frame(frames: &Receiver<WriterMsg>) -> Frame {
        match frames.recv_timeout(Duration::from_secs(2)).expect("frame") {
            WriterMsg::Frame(frame) => frame,
            WriterMsg::Close => panic!("writer closed"),
        }
    }

    fn next_result(frames: &Receiver<WriterMsg>) -> ResultEnvelope {
        loop {
            let frame = next_frame(frames);
            if frame.ch == Channel::Result {
                return frame.parse_body().expect("result body");
            }
        }
    }

    fn trigger(entry: &str, req_id: &str, args: serde_json::Value) -> Command {
        Command::Trigger {
            entry_id: entry.into(),
            args: args.as_object().cloned().unwrap_or_default(),
            req_id: req_id.into(),
            timeout_ms: None,
        }
    }

    fn echo_builder() -> PluginBuilder {
        PluginBuilder::new("echo")
            .entry("echo", |_, call| {
                let message = call.str_arg("message")?;
                Ok(json!(format!("Echo: {message}")))
            })
            .entry("boom", |_, _| panic!("kaboom"))
            .entry_async("slow", |_, call| async move {
                tokio::select! {
                    _ = call.cancel.cancelled() => Err(HandlerError::Canceled),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Ok(json!("late")),
                }
            })
            .custom("greeting", "hello", |ctx, _| {
                Ok(json!({"greeting": ctx.config()["greeting"].clone()}))
            })
    }

    fn stop(h: Harness) -> LoopExit {
        h.commands.send(Command::Stop { req_id: None }).expect("send stop");
        let exit = h.handle.join().expect("loop join");
        h.runtime.shutdown_timeout(Duration::from_secs(1));
        exit
    }

    #[test]
    fn sync_entry_returns_result_envelope() {
        let h = start(echo_builder());
        h.commands
            .send(trigger("echo", "r-1", json!({"message": "hi"})))
            .expect("send");
        let result = next_result(&h.frames);
        assert_eq!(result.req_id, "r-1");
        assert!(result.success);
        assert_eq!(result.data, json!("Echo: hi"));
        assert_eq!(stop(h), LoopExit::Stopped);
    }

    #[test]
    fn errors_and_panics_become_failed_results() {
        let h = start(echo_builder());
        h.commands.send(trigger("echo", "r-1", json!({}))).expect("send");
        let bad_args = next_result(&h.frames);
        assert!(!bad_args.success);
        assert_eq!(bad_args.error.expect("error").code, ErrorCode::InvalidRequest);

        h.commands.send(trigger("boom", "r-2", json!({}))).expect("send");
        let panicked = next_result(&h.frames);
        let err = panicked.error.expect("error");
        assert_eq!(err.code, ErrorCode::Execution);
        assert!(err.message.contains("kaboom"));

        h.commands.send(trigger("missing", "r-3", json!({}))).expect("send");
        let missing = next_result(&h.frames);
        assert_eq!(missing.error.expect("error").code, ErrorCode::NotFound);

        // loop survives all of the above
        h.commands
            .send(Command::TriggerCustom {
                event_type: "greeting".into(),
                event_id: "hello".into(),
                args: Args::new(),
                req_id: "r-4".into(),
                timeout_ms: None,
            })
            .expect("send");
        let custom = next_result(&h.frames);
        assert_eq!(custom.data, json!({"greeting": "hi"}));
        assert_eq!(stop(h), LoopExit::Stopped);
    }

    #[test]
    fn async_handlers_time_out_and_cancel_without_blocking_the_loop() {
        let h = start(echo_builder());
        h.commands.send(trigger("slow", "r-slow", json!({}))).expect("send");
        // loop keeps serving while the async handler runs
        h.commands
            .send(trigger("echo", "r-fast", json!({"message": "x"})))
            .expect("send");
        let first = next_result(&h.frames);
        assert_eq!(first.req_id, "r-fast");
        let timed_out = next_result(&h.frames);
        assert_eq!(timed_out.req_id, "r-slow");
        assert_eq!(timed_out.error.expect("error").code, ErrorCode::Timeout);

        h.commands
            .send(Command::Trigger {
                entry_id: "slow".into(),
                args: Args::new(),
                req_id: "r-cancel".into(),
                timeout_ms: Some(5_000),
            })
            .expect("send");
        std::thread::sleep(Duration::from_millis(50));
        h.commands
            .send(Command::Cancel {
                req_id: "r-cancel".into(),
            })
            .expect("send");
        let canceled = next_result(&h.frames);
        assert_eq!(canceled.req_id, "r-cancel");
        assert!(!canceled.success);
        assert!(canceled.error.expect("error").message.contains("canceled"));
        assert_eq!(stop(h), LoopExit::Stopped);
    }

    #[test]
    fn stop_runs_shutdown_hooks_and_reports_status() {
        let hooks = Arc::new(AtomicUsize::new(0));
        let seen = hooks.clone();
        let h = start(echo_builder().on_shutdown(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        h.commands.send(Command::Stop { req_id: None }).expect("send");
        assert_eq!(h.handle.join().expect("join"), LoopExit::Stopped);
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        let mut states = Vec::new();
        while let Ok(WriterMsg::Frame(frame)) = h.frames.try_recv() {
            if frame.ch == Channel::Status {
                let status: StatusFrame = frame.parse_body().expect("status");
                states.push(status.state);
            }
        }
        assert_eq!(states, vec![PluginState::Stopping, PluginState::Stopped]);
        h.runtime.shutdown_timeout(Duration::from_secs(1));
    }

    #[test]
    fn timers_tick_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let h = start(echo_builder().timer("tick", Duration::from_millis(10), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
        std::thread::sleep(Duration::from_millis(120));
        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(stop(h), LoopExit::Stopped);
    }

    #[test]
    fn closed_input_ends_the_loop() {
        let h = start(echo_builder());
        drop(h.commands);
        assert_eq!(h.handle.join().expect("join"), LoopExit::InputClosed);
        h.runtime.shutdown_timeout(Duration::from_secs(1));
    }
}
