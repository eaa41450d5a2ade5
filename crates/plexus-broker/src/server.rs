use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use plexus_protocol::{BrokerMessage, BrokerReply, BrokerRequest, ErrorCode, ErrorInfo};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;

/// Upper bound on one JSON line.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Newline-delimited JSON front end for a [`Broker`].
pub struct BrokerServer {
    broker: Arc<Broker>,
    listener: TcpListener,
    cancel: CancellationToken,
}

impl BrokerServer {
    pub async fn bind(broker: Arc<Broker>, addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            broker,
            listener,
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and every connection task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> std::io::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(target: "plexus::broker", %addr, "broker listening");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(target: "plexus::broker", %addr, "broker stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(target: "plexus::broker", %peer, "connection accepted");
                        let broker = self.broker.clone();
                        let cancel = self.cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(broker, stream, cancel).await {
                                warn!(target: "plexus::broker", %peer, %err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => error!(target: "plexus::broker", %err, "accept failed"),
                }
            }
        }
    }
}

fn encode(message: &BrokerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(line) => Some(line),
        Err(err) => {
            error!(target: "plexus::broker", %err, "failed to encode broker message");
            None
        }
    }
}

async fn serve_connection(
    broker: Arc<Broker>,
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<(), tokio_util::codec::LinesCodecError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let (session, mut outbox) = broker.open_session();
    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            pushed = outbox.recv() => {
                let Some(message) = pushed else { break Ok(()) };
                if let Some(line) = encode(&message) {
                    if let Err(err) = framed.send(line).await {
                        break Err(err);
                    }
                }
            }
            line = framed.next() => {
                let line = match line {
                    None => break Ok(()),
                    Some(Err(err)) => break Err(err),
                    Some(Ok(line)) => line,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match serde_json::from_str::<BrokerRequest>(&line) {
                    Ok(req) => broker.handle(req, Some(session)).await,
                    Err(err) => BrokerReply::err(
                        "",
                        ErrorInfo::new(ErrorCode::InvalidRequest, format!("malformed request: {err}")),
                    ),
                };
                if let Some(line) = encode(&BrokerMessage::Reply(reply)) {
                    if let Err(err) = framed.send(line).await {
                        break Err(err);
                    }
                }
            }
        }
    };
    broker.close_session(session);
    debug!(target: "plexus::broker", session, "connection closed");
    outcome
}
