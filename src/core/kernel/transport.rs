use crate::core::errors::RelayError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, instrument};

/// Outbound half of an open socket
pub type FrameSink = Pin<Box<dyn Sink<Message, Error = RelayError> + Send>>;

/// Inbound half of an open socket
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, RelayError>> + Send>>;

/// An open socket, already split into its two halves
pub struct SocketConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for SocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketConnection").finish_non_exhaustive()
    }
}

/// Socket capability selected once when the client is built
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a socket to `url`. Resolves once the socket is open.
    async fn connect(&self, url: &Url) -> Result<SocketConnection, RelayError>;
}

/// Network websocket transport
#[derive(Debug, Clone, Default)]
pub struct TungsteniteTransport;

impl TungsteniteTransport {
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    #[instrument(skip(self, url), fields(host = ?url.host_str(), path = %url.path()))]
    async fn connect(&self, url: &Url) -> Result<SocketConnection, RelayError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RelayError::Socket(format!("WebSocket connection failed: {}", e)))?;

        let (write, read) = ws_stream.split();
        let sink = write.sink_map_err(|e| RelayError::Socket(format!("WebSocket send failed: {}", e)));
        let stream = read.map(|message| {
            message.map_err(|e| RelayError::Socket(format!("WebSocket error: {}", e)))
        });

        Ok(SocketConnection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// In-process transport: every `connect` shows up on the paired
/// [`ChannelAcceptor`], which plays the server side.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    requests: mpsc::UnboundedSender<PendingConnection>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, ChannelAcceptor) {
        let (requests, incoming) = mpsc::unbounded_channel();
        (Self { requests }, ChannelAcceptor { incoming })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self, url: &Url) -> Result<SocketConnection, RelayError> {
        let (to_peer, from_client) = mpsc::unbounded_channel::<Message>();
        let (to_client, from_peer) = mpsc::unbounded_channel::<Message>();
        let (accepted_tx, accepted_rx) = oneshot::channel();

        self.requests
            .send(PendingConnection {
                url: url.to_string(),
                peer: PeerSocket {
                    incoming: from_client,
                    outgoing: Some(to_client),
                },
                accepted: accepted_tx,
            })
            .map_err(|_| RelayError::Socket("connection refused: no peer is listening".to_string()))?;

        accepted_rx
            .await
            .map_err(|_| RelayError::Socket("connection dropped before it was accepted".to_string()))??;

        let sink = futures_util::sink::unfold(
            to_peer,
            |tx: mpsc::UnboundedSender<Message>, message: Message| async move {
                tx.send(message)
                    .map_err(|_| RelayError::Socket("peer went away".to_string()))?;
                Ok::<_, RelayError>(tx)
            },
        );
        let stream = futures_util::stream::unfold(from_peer, |mut rx| async move {
            rx.recv().await.map(|message| (Ok(message), rx))
        });

        Ok(SocketConnection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Server side of a [`ChannelTransport`]
#[derive(Debug)]
pub struct ChannelAcceptor {
    incoming: mpsc::UnboundedReceiver<PendingConnection>,
}

impl ChannelAcceptor {
    /// Next connection attempt, not yet accepted
    pub async fn next(&mut self) -> Option<PendingConnection> {
        self.incoming.recv().await
    }

    /// Accept the next connection attempt
    pub async fn accept(&mut self) -> Option<PeerSocket> {
        self.next().await.map(PendingConnection::accept)
    }

    /// Non-blocking check for a waiting attempt
    pub fn try_next(&mut self) -> Option<PendingConnection> {
        self.incoming.try_recv().ok()
    }
}

/// A connection attempt awaiting the acceptor's decision
#[derive(Debug)]
pub struct PendingConnection {
    url: String,
    peer: PeerSocket,
    accepted: oneshot::Sender<Result<(), RelayError>>,
}

impl PendingConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn accept(self) -> PeerSocket {
        let _ = self.accepted.send(Ok(()));
        self.peer
    }

    pub fn refuse(self, reason: &str) {
        let _ = self
            .accepted
            .send(Err(RelayError::Socket(format!("connection refused: {}", reason))));
    }
}

/// Peer end of an in-process socket
#[derive(Debug)]
pub struct PeerSocket {
    incoming: mpsc::UnboundedReceiver<Message>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
}

impl PeerSocket {
    /// Next message from the client, `None` once the client side is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.incoming.recv().await
    }

    /// Next text frame from the client parsed as JSON; other frames are skipped
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            match self.recv().await? {
                Message::Text(text) => match serde_json::from_str(&text) {
                    Ok(value) => return Some(value),
                    Err(e) => debug!(error = %e, "peer received non-JSON text"),
                },
                Message::Close(_) => return None,
                _ => {}
            }
        }
    }

    pub fn send(&self, message: Message) -> bool {
        self.outgoing
            .as_ref()
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send(Message::Text(value.to_string()))
    }

    /// Close from the peer side; the client observes end of stream
    pub fn close(&mut self) {
        self.outgoing = None;
    }
}
