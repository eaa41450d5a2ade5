use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use plexus_broker::MAX_LINE_BYTES;
use plexus_core::config::SupervisorConfig;
use plexus_core::{Correlator, CorrelatorError};
use plexus_events::Bus;
use plexus_protocol::{
    Args, Channel, Command, Delta, ErrorCode, ErrorInfo, Frame, HostRequest, HostRequestBody,
    HostResponse, PluginState, ResultEnvelope, StatusFrame,
};
use plexus_runtime::{Run, RunError, RunOutcome, RunRegistry, RunStatus};
use plexus_topics as topics;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const COMMAND_QUEUE: usize = 256;
const RUN_MESSAGE_MAX: usize = 256;

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("plugin `{0}` is not running")]
    NotRunning(String),
    #[error("{what} did not finish within {waited_ms}ms")]
    Timeout { what: String, waited_ms: u64 },
    #[error("failed to spawn plugin `{plugin}`: {source}")]
    Spawn {
        plugin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("plugin `{0}` is already running")]
    AlreadyRunning(String),
    #[error("plugin `{0}` not found")]
    NotFound(String),
    #[error("plugin stdio unavailable: {0}")]
    Io(String),
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
    #[error(transparent)]
    Run(#[from] RunError),
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<HostError> for ErrorInfo {
    fn from(err: HostError) -> Self {
        let code = match &err {
            HostError::NotRunning(_) => ErrorCode::NotRunning,
            HostError::Timeout { .. } => ErrorCode::Timeout,
            HostError::NotFound(_) => ErrorCode::NotFound,
            HostError::AlreadyRunning(_) => ErrorCode::InvalidRequest,
            HostError::Spawn { .. } | HostError::Io(_) => ErrorCode::Communication,
            HostError::Correlator(inner) => return inner.clone().into(),
            HostError::Run(inner) => return inner.clone().into(),
            HostError::Encode(_) => ErrorCode::Internal,
        };
        ErrorInfo::new(code, err.to_string())
    }
}

/// How far [`Host::shutdown`] had to escalate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    Graceful,
    Terminated,
    Killed,
}

impl ShutdownOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownOutcome::Graceful => "graceful",
            ShutdownOutcome::Terminated => "terminated",
            ShutdownOutcome::Killed => "killed",
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct HealthReport {
    pub alive: bool,
    pub exitcode: Option<i32>,
    pub pid: Option<u32>,
    pub status: PluginState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Answers host-bound requests a plugin sends on its push channel.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn handle(&self, from: &str, body: HostRequestBody) -> Result<Value, ErrorInfo>;
}

/// Refuses every push request. Used when a host has nothing to route to.
pub struct RejectPush;

#[async_trait]
impl PushHandler for RejectPush {
    async fn handle(&self, _from: &str, body: HostRequestBody) -> Result<Value, ErrorInfo> {
        Err(ErrorInfo::new(
            ErrorCode::NotFound,
            format!("no route for `{}`", body.label()),
        ))
    }
}

pub(crate) struct HostParts {
    pub plugin_id: String,
    pub child: Child,
    pub config: SupervisorConfig,
    pub runs: RunRegistry,
    pub events: Option<Bus>,
    pub pending_capacity: usize,
    pub push: Arc<dyn PushHandler>,
}

struct HostInner {
    plugin_id: String,
    pid: Option<u32>,
    child: Mutex<Child>,
    exit: Mutex<Option<ExitStatus>>,
    commands: mpsc::Sender<Frame>,
    results: Correlator<ResultEnvelope>,
    status: watch::Receiver<StatusFrame>,
    config: SupervisorConfig,
    runs: RunRegistry,
    cancel: CancellationToken,
}

/// Handle to one running plugin process.
///
/// Cloning is cheap; every clone talks to the same child. Frames to the child
/// go through a single writer task, frames from it are routed by a reader task
/// that lives until the child closes stdout.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Wires the child's stdio. Must run inside a tokio runtime.
    pub(crate) fn attach(parts: HostParts) -> Result<Self, HostError> {
        let HostParts {
            plugin_id,
            mut child,
            config,
            runs,
            events,
            pending_capacity,
            push,
        } = parts;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Io("stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Io("stdout not piped".into()))?;
        let stderr = child.stderr.take();

        let cancel = CancellationToken::new();
        let results: Correlator<ResultEnvelope> = Correlator::new("plugin-results", pending_capacity);
        if let Some(bus) = events {
            let plugin = plugin_id.clone();
            results.on_orphan(move |req_id| {
                bus.publish(
                    topics::TOPIC_CORRELATOR_ORPHAN,
                    &json!({"plugin": plugin, "req_id": req_id}),
                );
            });
        }
        let (commands, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status) = watch::channel(StatusFrame::new(PluginState::Starting, None));

        tokio::spawn(write_commands(plugin_id.clone(), stdin, commands_rx, cancel.clone()));
        tokio::spawn(read_frames(ReadCtx {
            plugin_id: plugin_id.clone(),
            stdout,
            results: results.clone(),
            status: status_tx,
            commands: commands.clone(),
            push,
            push_timeout: config.trigger_timeout(),
        }));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(plugin_id.clone(), stderr));
        }

        Ok(Self {
            inner: Arc::new(HostInner {
                pid: child.id(),
                plugin_id,
                child: Mutex::new(child),
                exit: Mutex::new(None),
                commands,
                results,
                status,
                config,
                runs,
                cancel,
            }),
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.inner.runs
    }

    /// Last status frame the plugin reported.
    pub fn status(&self) -> StatusFrame {
        self.inner.status.borrow().clone()
    }

    /// Waits until the plugin reports `ready`. Fails early if it reports
    /// `crashed` or exits first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), HostError> {
        let mut status = self.inner.status.clone();
        let wait = async {
            loop {
                let state = status.borrow_and_update().state;
                match state {
                    PluginState::Ready => return Ok(()),
                    PluginState::Crashed | PluginState::Stopped => {
                        return Err(HostError::NotRunning(self.inner.plugin_id.clone()))
                    }
                    _ => {}
                }
                if status.changed().await.is_err() {
                    return Err(HostError::NotRunning(self.inner.plugin_id.clone()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| HostError::Timeout {
                what: format!("startup of `{}`", self.inner.plugin_id),
                waited_ms: timeout.as_millis() as u64,
            })?
    }

    /// True while the process exists and no exit status has been observed.
    pub fn is_alive(&self) -> bool {
        self.poll_exit().is_none()
    }

    pub fn health_check(&self) -> HealthReport {
        let exit = self.poll_exit();
        let frame = self.status();
        let status = match (exit, frame.state) {
            (None, state) => state,
            (Some(_), state @ (PluginState::Crashed | PluginState::Stopped)) => state,
            (Some(exit), _) if exit.success() => PluginState::Stopped,
            (Some(_), _) => PluginState::Crashed,
        };
        HealthReport {
            alive: exit.is_none(),
            exitcode: exit.and_then(exit_code),
            pid: self.inner.pid,
            status,
            message: frame.message,
        }
    }

    pub async fn trigger(
        &self,
        entry_id: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<ResultEnvelope, HostError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.trigger_timeout());
        let ticket = self.inner.results.register();
        let req_id = ticket.id().to_string();
        let command = Command::Trigger {
            entry_id: entry_id.to_string(),
            args,
            req_id: req_id.clone(),
            timeout_ms: Some(timeout.as_millis() as u64),
        };
        if let Err(err) = self.send_checked(&command).await {
            self.inner.results.cancel(ticket);
            return Err(err);
        }
        self.await_result(ticket, &req_id, format!("trigger `{entry_id}`"), timeout)
            .await
    }

    pub async fn trigger_custom(
        &self,
        event_type: &str,
        event_id: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<ResultEnvelope, HostError> {
        let timeout = timeout.unwrap_or_else(|| self.inner.config.trigger_timeout());
        let ticket = self.inner.results.register();
        let req_id = ticket.id().to_string();
        let command = Command::TriggerCustom {
            event_type: event_type.to_string(),
            event_id: event_id.to_string(),
            args,
            req_id: req_id.clone(),
            timeout_ms: Some(timeout.as_millis() as u64),
        };
        if let Err(err) = self.send_checked(&command).await {
            self.inner.results.cancel(ticket);
            return Err(err);
        }
        self.await_result(
            ticket,
            &req_id,
            format!("trigger `{event_type}:{event_id}`"),
            timeout,
        )
        .await
    }

    /// Sends an out-of-band `CANCEL` for an in-flight request.
    pub async fn cancel(&self, req_id: &str) -> Result<(), HostError> {
        self.send_checked(&Command::Cancel {
            req_id: req_id.to_string(),
        })
        .await
    }

    pub async fn deliver_bus_change(&self, sub_id: &str, delta: Delta) -> Result<(), HostError> {
        self.send_checked(&Command::BusChange {
            sub_id: sub_id.to_string(),
            delta,
        })
        .await
    }

    /// Triggers `entry_id` as a tracked run. The run id doubles as the
    /// request id, so [`Host::cancel_run`] reaches the in-flight handler.
    pub async fn start_run(
        &self,
        entry_id: &str,
        args: Args,
        timeout: Option<Duration>,
    ) -> Result<Run, HostError> {
        self.ensure_alive()?;
        let timeout = timeout.unwrap_or_else(|| self.inner.config.trigger_timeout());
        let runs = &self.inner.runs;
        let run = runs.create(&self.inner.plugin_id, entry_id);
        let run_id = run.run_id.clone();
        runs.transition(&run_id, RunStatus::Running)?;
        let ticket = self.inner.results.register_id(run_id.clone());
        let command = Command::Trigger {
            entry_id: entry_id.to_string(),
            args,
            req_id: run_id.clone(),
            timeout_ms: Some(timeout.as_millis() as u64),
        };
        if let Err(err) = self.send_checked(&command).await {
            self.inner.results.cancel(ticket);
            runs.finish(&run_id, RunOutcome::failed(ErrorInfo::from(HostError::NotRunning(
                self.inner.plugin_id.clone(),
            ))))?;
            return Err(err);
        }

        let outcome = match self.inner.results.wait(ticket, timeout).await {
            Ok(envelope) if envelope.success => {
                let mut outcome = RunOutcome::succeeded(None);
                outcome.message = Some(summarize(&envelope.data));
                outcome
            }
            Ok(envelope) => {
                let cancelled = runs.get(&run_id).map(|r| r.cancel_requested).unwrap_or(false);
                if timed_out(&envelope) {
                    let mut outcome = RunOutcome::with_status(RunStatus::Timeout);
                    outcome.error = envelope.error;
                    outcome
                } else if cancelled {
                    RunOutcome::with_status(RunStatus::Canceled)
                } else {
                    RunOutcome::failed(envelope.error.unwrap_or_else(|| {
                        ErrorInfo::new(ErrorCode::Execution, "handler failed without detail")
                    }))
                }
            }
            Err(CorrelatorError::Timeout { waited_ms, .. }) => {
                self.cancel_after_timeout(&run_id).await;
                let mut outcome = RunOutcome::with_status(RunStatus::Timeout);
                outcome.error = Some(ErrorInfo::new(
                    ErrorCode::Timeout,
                    format!("run exceeded {waited_ms}ms"),
                ));
                outcome
            }
            Err(err) => RunOutcome::failed(err.into()),
        };
        let run = runs.finish(&run_id, outcome)?;
        info!(
            target: "plexus::supervisor",
            plugin = %self.inner.plugin_id,
            run_id = %run.run_id,
            status = run.status.as_str(),
            "run finished"
        );
        Ok(run)
    }

    /// The handler may already be gone, so a failure here is only noted.
    async fn cancel_after_timeout(&self, req_id: &str) {
        if let Err(err) = self.cancel(req_id).await {
            debug!(
                target: "plexus::supervisor",
                plugin = %self.inner.plugin_id,
                req_id,
                error = %err,
                "cancel after timeout failed"
            );
        }
    }

    pub async fn cancel_run(&self, run_id: &str, reason: Option<&str>) -> Result<Run, HostError> {
        let run = self.inner.runs.request_cancel(run_id, reason)?;
        if !run.is_terminal() {
            self.cancel(run_id).await?;
        }
        Ok(run)
    }

    /// Stops the plugin, escalating STOP → terminate → kill.
    ///
    /// `timeout` bounds the graceful stage. The terminate and kill stages use
    /// the configured `terminate_timeout` and `kill_timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownOutcome, HostError> {
        let plugin = self.inner.plugin_id.as_str();
        if !self.is_alive() {
            self.release();
            return Ok(ShutdownOutcome::Graceful);
        }
        let started = Instant::now();
        if let Err(err) = self.send(&Command::Stop { req_id: None }).await {
            debug!(target: "plexus::supervisor", plugin, error = %err, "STOP not delivered");
        }
        if self.wait_exit(timeout).await {
            info!(target: "plexus::supervisor", plugin, elapsed_ms = started.elapsed().as_millis() as u64, "plugin stopped gracefully");
            self.release();
            return Ok(ShutdownOutcome::Graceful);
        }

        warn!(target: "plexus::supervisor", plugin, timeout_ms = timeout.as_millis() as u64, "plugin ignored STOP; terminating");
        self.terminate();
        if self.wait_exit(self.inner.config.terminate_timeout()).await {
            warn!(target: "plexus::supervisor", plugin, elapsed_ms = started.elapsed().as_millis() as u64, "plugin terminated");
            self.release();
            return Ok(ShutdownOutcome::Terminated);
        }

        warn!(target: "plexus::supervisor", plugin, "plugin survived terminate; killing");
        self.kill();
        if self.wait_exit(self.inner.config.kill_timeout()).await {
            warn!(target: "plexus::supervisor", plugin, elapsed_ms = started.elapsed().as_millis() as u64, "plugin killed");
            self.release();
            return Ok(ShutdownOutcome::Killed);
        }

        error!(target: "plexus::supervisor", plugin, pid = ?self.inner.pid, "plugin did not exit after kill");
        Err(HostError::Timeout {
            what: format!("shutdown of `{plugin}`"),
            waited_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn await_result(
        &self,
        ticket: plexus_core::Ticket,
        req_id: &str,
        what: String,
        timeout: Duration,
    ) -> Result<ResultEnvelope, HostError> {
        match self.inner.results.wait(ticket, timeout).await {
            // the plugin enforces the same bound and may report it first
            Ok(envelope) if timed_out(&envelope) => Err(HostError::Timeout {
                what,
                waited_ms: timeout.as_millis() as u64,
            }),
            Ok(envelope) => Ok(envelope),
            Err(CorrelatorError::Timeout { waited_ms, .. }) => {
                self.cancel_after_timeout(req_id).await;
                Err(HostError::Timeout { what, waited_ms })
            }
            Err(CorrelatorError::Closed { .. }) => {
                Err(HostError::NotRunning(self.inner.plugin_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn ensure_alive(&self) -> Result<(), HostError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(HostError::NotRunning(self.inner.plugin_id.clone()))
        }
    }

    async fn send_checked(&self, command: &Command) -> Result<(), HostError> {
        self.ensure_alive()?;
        self.send(command).await
    }

    async fn send(&self, command: &Command) -> Result<(), HostError> {
        let frame = Frame::command(command)?;
        trace!(target: "plexus::supervisor", plugin = %self.inner.plugin_id, kind = command.kind(), "command queued");
        self.inner
            .commands
            .send(frame)
            .await
            .map_err(|_| HostError::NotRunning(self.inner.plugin_id.clone()))
    }

    fn poll_exit(&self) -> Option<ExitStatus> {
        let mut exit = self.inner.exit.lock();
        if exit.is_none() {
            match self.inner.child.lock().try_wait() {
                Ok(Some(status)) => *exit = Some(status),
                Ok(None) => {}
                Err(err) => {
                    warn!(target: "plexus::supervisor", plugin = %self.inner.plugin_id, error = %err, "exit probe failed");
                }
            }
        }
        *exit
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        let poll = self.inner.config.poll_interval();
        loop {
            if !self.is_alive() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.inner.pid else {
            return;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => {
                debug!(target: "plexus::supervisor", plugin = %self.inner.plugin_id, pid, "process already gone");
            }
            Err(err) => {
                warn!(target: "plexus::supervisor", plugin = %self.inner.plugin_id, pid, error = %err, "SIGTERM failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        self.kill();
    }

    fn kill(&self) {
        if let Err(err) = self.inner.child.lock().start_kill() {
            warn!(target: "plexus::supervisor", plugin = %self.inner.plugin_id, error = %err, "kill failed");
        }
    }

    fn release(&self) {
        self.inner.cancel.cancel();
        self.inner.results.close();
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| -sig))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

fn timed_out(envelope: &ResultEnvelope) -> bool {
    !envelope.success
        && envelope
            .error
            .as_ref()
            .is_some_and(|err| err.code == ErrorCode::Timeout)
}

fn summarize(data: &Value) -> String {
    let text = match data {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= RUN_MESSAGE_MAX {
        return text;
    }
    let mut cut: String = text.chars().take(RUN_MESSAGE_MAX).collect();
    cut.push('…');
    cut
}

async fn write_commands(
    plugin_id: String,
    stdin: ChildStdin,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    let mut sink = FramedWrite::new(stdin, LinesCodec::new());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let line = match frame.encode() {
            Ok(line) => line,
            Err(err) => {
                warn!(target: "plexus::supervisor", plugin = %plugin_id, error = %err, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(err) = sink.send(line).await {
            debug!(target: "plexus::supervisor", plugin = %plugin_id, error = %err, "plugin stdin closed");
            break;
        }
    }
}

struct ReadCtx {
    plugin_id: String,
    stdout: ChildStdout,
    results: Correlator<ResultEnvelope>,
    status: watch::Sender<StatusFrame>,
    commands: mpsc::Sender<Frame>,
    push: Arc<dyn PushHandler>,
    push_timeout: Duration,
}

async fn read_frames(ctx: ReadCtx) {
    let ReadCtx {
        plugin_id,
        stdout,
        results,
        status,
        commands,
        push,
        push_timeout,
    } = ctx;
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(target: "plexus::supervisor", plugin = %plugin_id, error = %err, "unreadable plugin output");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame = match Frame::decode(&line) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target: "plexus::supervisor", plugin = %plugin_id, error = %err, "malformed frame");
                continue;
            }
        };
        match frame.ch {
            Channel::Result => match frame.parse_body::<ResultEnvelope>() {
                Ok(envelope) => {
                    let req_id = envelope.req_id.clone();
                    results.deliver(&req_id, envelope);
                }
                Err(err) => warn!(target: "plexus::supervisor", plugin = %plugin_id, error = %err, "bad result frame"),
            },
            Channel::Status => match frame.parse_body::<StatusFrame>() {
                Ok(frame) => {
                    debug!(target: "plexus::supervisor", plugin = %plugin_id, state = frame.state.as_str(), "status");
                    status.send_replace(frame);
                }
                Err(err) => warn!(target: "plexus::supervisor", plugin = %plugin_id, error = %err, "bad status frame"),
            },
            Channel::Push => match frame.parse_body::<HostRequest>() {
                Ok(request) => {
                    tokio::spawn(answer_push(
                        plugin_id.clone(),
                        request,
                        push.clone(),
                        commands.clone(),
                        push_timeout,
                    ));
                }
                Err(err) => warn!(target: "plexus::supervisor", plugin = %plugin_id, error = %err, "bad push frame"),
            },
            Channel::Command | Channel::Response => {
                warn!(target: "plexus::supervisor", plugin = %plugin_id, ch = ?frame.ch, "plugin wrote a host-bound channel");
            }
        }
    }
    debug!(target: "plexus::supervisor", plugin = %plugin_id, "plugin stdout closed");
    results.close();
}

async fn answer_push(
    plugin_id: String,
    request: HostRequest,
    push: Arc<dyn PushHandler>,
    commands: mpsc::Sender<Frame>,
    default_timeout: Duration,
) {
    let HostRequest {
        request_id,
        from_plugin,
        timeout,
        body,
    } = request;
    let limit = timeout
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default_timeout);
    let label = body.label().to_string();
    let from = if from_plugin.is_empty() { plugin_id.clone() } else { from_plugin };
    let outcome = match tokio::time::timeout(limit, push.handle(&from, body)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ErrorInfo::new(
            ErrorCode::Timeout,
            format!("`{label}` exceeded {}ms", limit.as_millis()),
        )),
    };
    if let Err(err) = &outcome {
        debug!(target: "plexus::supervisor", plugin = %plugin_id, op = %label, code = %err.code, "push request failed");
    }
    let response = HostResponse::from_result(request_id, outcome);
    match Frame::new(Channel::Response, &response) {
        Ok(frame) => {
            if commands.send(frame).await.is_err() {
                debug!(target: "plexus::supervisor", plugin = %plugin_id, "response dropped; plugin gone");
            }
        }
        Err(err) => warn!(target: "plexus::supervisor", plugin = %plugin_id, error = %err, "response not encodable"),
    }
}

async fn forward_stderr(plugin_id: String, stderr: ChildStderr) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) if !line.trim().is_empty() => {
                info!(target: "plexus::plugin", plugin = %plugin_id, "{}", line.trim_end());
            }
            Ok(_) => {}
            Err(err) => {
                debug!(target: "plexus::plugin", plugin = %plugin_id, error = %err, "stderr unreadable");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_errors_map_to_stable_codes() {
        let info: ErrorInfo = HostError::NotRunning("echo".into()).into();
        assert_eq!(info.code, ErrorCode::NotRunning);
        let info: ErrorInfo = HostError::Timeout {
            what: "trigger `echo`".into(),
            waited_ms: 10,
        }
        .into();
        assert_eq!(info.code, ErrorCode::Timeout);
        let info: ErrorInfo = HostError::Correlator(CorrelatorError::Closed { id: "r".into() }).into();
        assert_eq!(info.code, ErrorCode::Communication);
    }

    #[test]
    fn long_results_are_truncated_for_run_messages() {
        let short = summarize(&json!("Echo: hi"));
        assert_eq!(short, "Echo: hi");
        let long = summarize(&json!("x".repeat(RUN_MESSAGE_MAX * 2)));
        assert_eq!(long.chars().count(), RUN_MESSAGE_MAX + 1);
        assert!(long.ends_with('…'));
        assert_eq!(summarize(&json!({"a": 1})), r#"{"a":1}"#);
    }

    #[tokio::test]
    async fn reject_push_reports_not_found() {
        let err = RejectPush
            .handle(
                "echo",
                HostRequestBody::Unsubscribe {
                    sub_id: "s1".into(),
                },
            )
            .await
            .expect_err("rejected");
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("bus.unsubscribe"));
    }
}
