//! Stdio framing for the plugin side: one reader thread over stdin, one
//! writer thread owning stdout.

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::Mutex;
use plexus_core::retry::{retry_blocking, Backoff, Retry};
use plexus_core::Correlator;
use plexus_protocol::{Channel, Command, Frame, HostRequest, HostResponse, ResultEnvelope, StatusFrame};
use tracing::{debug, error, trace, warn};

/// Frames buffered between producers and the writer thread.
pub const WRITER_QUEUE: usize = 256;
const DROP_LOG_EVERY: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("outbound channel closed")]
    Closed,
    #[error("outbound channel full")]
    Full,
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

pub(crate) enum WriterMsg {
    Frame(Frame),
    Close,
}

struct OutboundInner {
    tx: SyncSender<WriterMsg>,
    status_dropped: AtomicU64,
    last_drop_log: Mutex<Option<Instant>>,
    backoff: Backoff,
}

/// Cloneable handle that queues frames for the writer thread.
#[derive(Clone)]
pub struct Outbound {
    inner: Arc<OutboundInner>,
}

impl Outbound {
    pub(crate) fn new(tx: SyncSender<WriterMsg>) -> Self {
        Self {
            inner: Arc::new(OutboundInner {
                tx,
                status_dropped: AtomicU64::new(0),
                last_drop_log: Mutex::new(None),
                backoff: Backoff::default(),
            }),
        }
    }

    fn send_reliable(&self, what: &str, frame: Frame) -> Result<(), TransportError> {
        let mut slot = Some(frame);
        retry_blocking(&self.inner.backoff, what, |_| {
            let Some(frame) = slot.take() else {
                return Err(Retry::Fatal(TransportError::Closed));
            };
            match self.inner.tx.try_send(WriterMsg::Frame(frame)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(WriterMsg::Frame(frame))) => {
                    slot = Some(frame);
                    Err(Retry::Transient(TransportError::Full))
                }
                Err(TrySendError::Full(WriterMsg::Close)) => Err(Retry::Fatal(TransportError::Full)),
                Err(TrySendError::Disconnected(_)) => Err(Retry::Fatal(TransportError::Closed)),
            }
        })
    }

    /// Results are retried while the writer is saturated.
    pub fn send_result(&self, result: &ResultEnvelope) -> Result<(), TransportError> {
        let frame = Frame::new(Channel::Result, result)?;
        self.send_reliable("result", frame)
    }

    pub fn send_push(&self, request: &HostRequest) -> Result<(), TransportError> {
        let frame = Frame::new(Channel::Push, request)?;
        self.send_reliable("push", frame)
    }

    /// Best effort; a full queue drops the status frame.
    pub fn send_status(&self, status: &StatusFrame) {
        let frame = match Frame::new(Channel::Status, status) {
            Ok(frame) => frame,
            Err(err) => {
                error!(target: "plexus::plugin", %err, "failed to encode status frame");
                return;
            }
        };
        match self.inner.tx.try_send(WriterMsg::Frame(frame)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.inner.status_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                counter!("plexus_plugin_status_dropped_total", "state" => status.state.as_str()).increment(1);
                let mut last = self.inner.last_drop_log.lock();
                if last.is_none_or(|at| at.elapsed() >= DROP_LOG_EVERY) {
                    *last = Some(Instant::now());
                    warn!(target: "plexus::plugin", dropped, state = status.state.as_str(), "status frame dropped; writer saturated");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!(target: "plexus::plugin", "status after writer shutdown");
            }
        }
    }

    pub fn status_dropped(&self) -> u64 {
        self.inner.status_dropped.load(Ordering::Relaxed)
    }

    /// Asks the writer to flush and exit once queued frames are written.
    pub fn close(&self) {
        let _ = self.inner.tx.send(WriterMsg::Close);
    }
}

pub(crate) fn outbound_channel() -> (Outbound, Receiver<WriterMsg>) {
    let (tx, rx) = mpsc::sync_channel(WRITER_QUEUE);
    (Outbound::new(tx), rx)
}

/// Writes one frame per line, flushing after each so the host sees results
/// immediately.
pub(crate) fn spawn_writer<W>(mut out: W, rx: Receiver<WriterMsg>) -> std::io::Result<JoinHandle<()>>
where
    W: Write + Send + 'static,
{
    std::thread::Builder::new()
        .name("plexus-stdout".into())
        .spawn(move || {
            while let Ok(msg) = rx.recv() {
                let frame = match msg {
                    WriterMsg::Frame(frame) => frame,
                    WriterMsg::Close => break,
                };
                let line = match frame.encode() {
                    Ok(line) => line,
                    Err(err) => {
                        error!(target: "plexus::plugin", %err, "failed to encode frame");
                        continue;
                    }
                };
                if let Err(err) = writeln!(out, "{line}").and_then(|_| out.flush()) {
                    warn!(target: "plexus::plugin", %err, "stdout closed; writer exiting");
                    break;
                }
            }
            let _ = out.flush();
            debug!(target: "plexus::plugin", "writer finished");
        })
}

/// Splits stdin into commands and host responses. EOF closes both.
pub(crate) fn spawn_reader<R>(
    input: R,
    commands: mpsc::Sender<Command>,
    responses: Correlator<HostResponse>,
) -> std::io::Result<JoinHandle<()>>
where
    R: BufRead + Send + 'static,
{
    std::thread::Builder::new()
        .name("plexus-stdin".into())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(target: "plexus::plugin", %err, "stdin read failed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match Frame::decode(&line) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(target: "plexus::plugin", %err, "ignoring malformed frame");
                        continue;
                    }
                };
                match frame.ch {
                    Channel::Command => match frame.parse_body::<Command>() {
                        Ok(cmd) => {
                            if commands.send(cmd).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(target: "plexus::plugin", %err, "ignoring malformed command"),
                    },
                    Channel::Response => match frame.parse_body::<HostResponse>() {
                        Ok(resp) => {
                            let id = resp.request_id.clone();
                            responses.deliver(&id, resp);
                        }
                        Err(err) => warn!(target: "plexus::plugin", %err, "ignoring malformed response"),
                    },
                    other => {
                        warn!(target: "plexus::plugin", channel = ?other, "unexpected channel on stdin");
                    }
                }
            }
            debug!(target: "plexus::plugin", "stdin closed");
            responses.close();
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use plexus_core::Delivery;
    use plexus_protocol::PluginState;
    use serde_json::json;
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_emits_one_line_per_frame_in_order() {
        let sink = Sink::default();
        let (outbound, rx) = outbound_channel();
        let handle = spawn_writer(sink.clone(), rx).expect("spawn writer");
        outbound.send_status(&StatusFrame::new(PluginState::Ready, None));
        outbound
            .send_result(&ResultEnvelope::ok("r-1", json!("Echo: hi")))
            .expect("result");
        outbound.close();
        handle.join().expect("writer join");

        let text = String::from_utf8(sink.0.lock().clone()).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first = Frame::decode(lines[0]).expect("status");
        assert_eq!(first.ch, Channel::Status);
        let second = Frame::decode(lines[1]).expect("result");
        let result: ResultEnvelope = second.parse_body().expect("body");
        assert_eq!(result.req_id, "r-1");
        assert_eq!(result.data, json!("Echo: hi"));
    }

    #[test]
    fn reader_routes_commands_and_responses() {
        let cmd = Frame::command(&Command::Cancel { req_id: "r-1".into() })
            .expect("frame")
            .encode()
            .expect("encode");
        let resp = Frame::new(
            Channel::Response,
            &HostResponse::from_result("q-1", Ok(json!({"seq": 1}))),
        )
        .expect("frame")
        .encode()
        .expect("encode");
        let input = format!("{cmd}\nnot json\n\n{resp}\n");

        let (tx, rx) = mpsc::channel();
        let responses: Correlator<HostResponse> = Correlator::new("test", 8);
        let ticket = responses.register_id("q-1");
        let handle = spawn_reader(Cursor::new(input), tx, responses.clone()).expect("spawn reader");
        handle.join().expect("reader join");

        assert_eq!(
            rx.recv().expect("command"),
            Command::Cancel { req_id: "r-1".into() }
        );
        let reply = responses
            .wait_blocking(ticket, Duration::from_millis(100))
            .expect("response delivered");
        assert_eq!(reply.into_result().expect("ok")["seq"], 1);
        assert!(responses.is_closed());
        assert_eq!(responses.deliver("late", HostResponse::from_result("late", Ok(json!(null)))), Delivery::Orphan);
    }

    #[test]
    fn status_frames_drop_when_writer_is_saturated() {
        let (tx, _rx) = mpsc::sync_channel(1);
        let outbound = Outbound::new(tx);
        outbound.send_status(&StatusFrame::new(PluginState::Ready, None));
        outbound.send_status(&StatusFrame::new(PluginState::Ready, None));
        outbound.send_status(&StatusFrame::new(PluginState::Ready, None));
        assert_eq!(outbound.status_dropped(), 2);
    }
}
