/// Relay kernel - connection lifecycle, correlation and fan-out
///
/// The kernel turns one long-lived socket into a request/reply channel
/// shared by every feature that talks to the server extension.
///
/// # Architecture
///
/// ## Connection
/// - `RelayClient`: lifecycle manager, reconnect path, send path and disposal
/// - `ConnectionState` / `transition`: the connection state machine
/// - `BackoffState`: retry budget with a 0s, 1s, 2s, 4s, 8s schedule
///
/// ## Transport
/// - `Transport`: socket capability chosen once at construction
/// - `TungsteniteTransport`: network websocket
/// - `ChannelTransport`: in-process socket for embedding and tests
/// - `AvailabilityProbe` / `HttpProbe`: pre-flight HTTP availability check
///
/// ## Message Handling
/// - `FrameCodec`: JSON frame encoding and classification
/// - `Correlator`: pending requests keyed by correlation id
/// - `MessageHub`: `messages`, `stream` and `connection_status` channels
///
/// # Usage
/// ```rust,no_run
/// use relaylink::core::config::ClientSettings;
/// use relaylink::core::kernel::RelayClient;
/// use serde_json::{json, Value};
///
/// # async fn example() -> Result<(), relaylink::RelayError> {
/// let settings = ClientSettings::new(
///     "http://localhost:8888".to_string(),
///     "ws://localhost:8888".to_string(),
///     "notebook_relay/ws".to_string(),
/// )
/// .with_token("secret".to_string());
///
/// let client = RelayClient::builder(settings).build()?;
/// let reply: Value = client
///     .send_message(&json!({"id": relaylink::new_correlation_id(), "type": "ping"}))
///     .await?;
/// println!("{}", reply);
/// client.dispose();
/// # Ok(())
/// # }
/// ```
pub mod backoff;
pub mod client;
pub mod codec;
pub mod correlator;
pub mod hub;
pub mod probe;
pub mod state;
pub mod transport;

// Re-export key types for convenience
pub use backoff::{backoff_delay, BackoffState, RetryDecision};
pub use client::{RelayClient, RelayClientBuilder};
pub use codec::FrameCodec;
pub use correlator::{Correlator, Route};
pub use hub::{EventBus, MessageHub, StreamSubscription};
pub use probe::{AvailabilityProbe, HttpProbe};
pub use state::{transition, ConnectionEvent, ConnectionState, InvalidTransition};
pub use transport::{
    ChannelAcceptor, ChannelTransport, PeerSocket, PendingConnection, SocketConnection, Transport,
    TungsteniteTransport,
};
