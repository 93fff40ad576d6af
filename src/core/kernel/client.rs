use crate::core::config::ClientSettings;
use crate::core::errors::RelayError;
use crate::core::kernel::backoff::{BackoffState, RetryDecision};
use crate::core::kernel::codec::FrameCodec;
use crate::core::kernel::correlator::{Correlator, ReplyResult, Route};
use crate::core::kernel::hub::{MessageHub, StreamSubscription};
use crate::core::kernel::probe::{AvailabilityProbe, HttpProbe};
use crate::core::kernel::state::{transition, ConnectionEvent, ConnectionState};
use crate::core::kernel::transport::{FrameSink, FrameStream, SocketConnection, Transport, TungsteniteTransport};
use crate::core::types::{ClientEvent, ConnectionStatus, StreamChunk};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, instrument, trace, warn};

type SharedAttempt = Shared<BoxFuture<'static, Result<(), RelayError>>>;

/// Builder for [`RelayClient`]
///
/// Defaults to the HTTP availability probe and the network websocket
/// transport; both can be replaced, e.g. with an in-process transport.
pub struct RelayClientBuilder {
    settings: ClientSettings,
    probe: Option<Arc<dyn AvailabilityProbe>>,
    transport: Option<Arc<dyn Transport>>,
}

impl RelayClientBuilder {
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            settings,
            probe: None,
            transport: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn AvailabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<RelayClient, RelayError> {
        self.settings.validate()?;

        let probe = match self.probe {
            Some(probe) => probe,
            None => Arc::new(HttpProbe::new(self.settings.clone())?),
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport::new()));

        Ok(RelayClient {
            inner: Arc::new(Inner {
                codec: FrameCodec::new(self.settings.correlation_field.clone()),
                hub: MessageHub::new(self.settings.channel_capacity),
                shared: Mutex::new(SharedState {
                    state: ConnectionState::Closed,
                    generation: 0,
                    socket: None,
                    correlator: Correlator::new(),
                    backoff: BackoffState::new(self.settings.max_reconnect_attempts),
                    initializing: None,
                    reconnecting: None,
                    disposed: false,
                }),
                settings: self.settings,
                probe,
                transport,
            }),
        })
    }
}

/// Request/reply client over one long-lived socket.
///
/// Cloning is cheap; all clones share the connection, the pending
/// requests and the subscription channels.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("service_path", &self.inner.settings.service_path)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

struct Inner {
    settings: ClientSettings,
    codec: FrameCodec,
    probe: Arc<dyn AvailabilityProbe>,
    transport: Arc<dyn Transport>,
    hub: MessageHub,
    shared: Mutex<SharedState>,
}

/// Everything mutated by socket callbacks lives behind one lock
struct SharedState {
    state: ConnectionState,
    /// Bumped whenever the current socket is replaced or torn down;
    /// callbacks from an older generation are ignored
    generation: u64,
    socket: Option<SocketHandle>,
    correlator: Correlator,
    backoff: BackoffState,
    initializing: Option<SharedAttempt>,
    reconnecting: Option<SharedAttempt>,
    disposed: bool,
}

struct SocketHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SocketHandle {
    /// Detach the reader first so nothing from this socket reaches client
    /// state, then let the writer flush a close frame and exit
    fn close(self) {
        self.reader.abort();
        drop(self.outbound);
        trace!(generation = self.generation, writer_done = self.writer.is_finished(), "socket handle closed");
    }
}

impl RelayClient {
    pub fn builder(settings: ClientSettings) -> RelayClientBuilder {
        RelayClientBuilder::new(settings)
    }

    /// Client using the HTTP availability probe and the network websocket
    pub fn connect_default(settings: ClientSettings) -> Result<Self, RelayError> {
        RelayClientBuilder::new(settings).build()
    }

    /// Client with an explicit probe and transport
    pub fn new(
        settings: ClientSettings,
        probe: Arc<dyn AvailabilityProbe>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, RelayError> {
        RelayClientBuilder::new(settings)
            .with_probe(probe)
            .with_transport(transport)
            .build()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        let shared = self.inner.lock();
        shared.state == ConnectionState::Open && shared.socket.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().correlator.len()
    }

    /// Current value of the reconnect attempt counter
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().backoff.attempt()
    }

    /// Every decoded inbound frame plus client-side errors.
    ///
    /// Each receiver buffers up to `channel_capacity` events. A receiver
    /// that falls further behind gets `RecvError::Lagged(n)` on its next
    /// `recv`, naming how many events it missed, and then resumes with the
    /// oldest retained event.
    pub fn messages(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.hub.messages()
    }

    /// All streamed chunks, for every parent id
    pub fn stream(&self) -> broadcast::Receiver<StreamChunk> {
        self.inner.hub.stream()
    }

    pub fn stream_for(&self, parent_id: impl Into<String>) -> StreamSubscription {
        self.inner.hub.stream_for(parent_id)
    }

    pub fn connection_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.inner.hub.connection_status()
    }

    /// Establish the connection: probe, then open the socket.
    ///
    /// Concurrent callers share one in-flight attempt. A no-op after
    /// [`dispose`](Self::dispose). Never retries; see [`reconnect`](Self::reconnect).
    pub async fn initialize(&self) -> Result<(), RelayError> {
        let attempt = {
            let mut shared = self.inner.lock();
            if shared.disposed {
                return Ok(());
            }
            match &shared.initializing {
                Some(attempt) => attempt.clone(),
                None => {
                    let inner = Arc::clone(&self.inner);
                    let attempt = async move {
                        let result = inner.run_attempt().await;
                        inner.lock().initializing = None;
                        result
                    }
                    .boxed()
                    .shared();
                    shared.initializing = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Retry [`initialize`](Self::initialize) with exponential backoff.
    ///
    /// `reset_counter` starts a fresh budget; pass `false` to continue
    /// counting from earlier failures. Concurrent callers join the
    /// sequence already running.
    pub async fn reconnect(&self, reset_counter: bool) -> Result<(), RelayError> {
        let sequence = {
            let mut shared = self.inner.lock();
            if shared.disposed {
                return Err(RelayError::Disposed);
            }
            match &shared.reconnecting {
                Some(sequence) => sequence.clone(),
                None => {
                    if reset_counter {
                        shared.backoff.reset();
                    }
                    let client = self.clone();
                    let sequence = async move {
                        let result = client.run_reconnect().await;
                        client.inner.lock().reconnecting = None;
                        result
                    }
                    .boxed()
                    .shared();
                    shared.reconnecting = Some(sequence.clone());
                    sequence
                }
            }
        };
        sequence.await
    }

    /// Wait for the attempt currently in flight, if any
    pub async fn wait_ready(&self) -> Result<(), RelayError> {
        let attempt = {
            let shared = self.inner.lock();
            if shared.disposed {
                return Err(RelayError::Disposed);
            }
            if shared.state == ConnectionState::Open && shared.socket.is_some() {
                return Ok(());
            }
            shared
                .reconnecting
                .clone()
                .or_else(|| shared.initializing.clone())
        };
        match attempt {
            Some(attempt) => attempt.await,
            None => Err(RelayError::Socket(
                "not connected and no connection attempt in progress".to_string(),
            )),
        }
    }

    /// Send a request and wait for the reply carrying its correlation id.
    ///
    /// Reconnects first when the socket is not open; if that fails the
    /// reconnect error is returned and nothing is sent.
    #[instrument(skip(self, message), fields(service = %self.inner.settings.service_path))]
    pub async fn send_message<Req, Resp>(&self, message: &Req) -> Result<Resp, RelayError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        if self.is_disposed() {
            return Err(RelayError::Disposed);
        }
        let (correlation_id, frame) = self.inner.codec.encode(message)?;
        self.ensure_open().await?;

        let receiver = self.inner.register_and_send(&correlation_id, frame)?;
        let mut guard = PendingGuard {
            inner: &self.inner,
            correlation_id: &correlation_id,
            armed: true,
        };
        debug!(correlation_id = %correlation_id, "request sent");

        let outcome = match self.inner.settings.request_timeout {
            Some(limit) => match timeout(limit, receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    guard.disarm();
                    self.inner.lock().correlator.cancel(&correlation_id);
                    warn!(correlation_id = %correlation_id, "request timed out");
                    return Err(RelayError::Timeout(format!(
                        "no reply to '{}' within {:?}",
                        correlation_id, limit
                    )));
                }
            },
            None => receiver.await,
        };
        guard.disarm();

        // A dropped sender means the entry was discarded without an answer
        let value = outcome.map_err(|_| RelayError::Disposed)??;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a request whose answer arrives as stream chunks.
    ///
    /// No pending entry is registered; the returned subscription yields
    /// chunks for the request's correlation id and ends after `done`.
    #[instrument(skip(self, message), fields(service = %self.inner.settings.service_path))]
    pub async fn send_streaming<Req>(&self, message: &Req) -> Result<StreamSubscription, RelayError>
    where
        Req: Serialize + ?Sized,
    {
        if self.is_disposed() {
            return Err(RelayError::Disposed);
        }
        let (correlation_id, frame) = self.inner.codec.encode(message)?;
        self.ensure_open().await?;

        // Subscribe before sending so no early chunk is missed
        let subscription = self.inner.hub.stream_for(correlation_id.clone());
        self.inner.send_frame(frame)?;
        debug!(correlation_id = %correlation_id, "streaming request sent");
        Ok(subscription)
    }

    /// Tear down: close the socket, fail every pending request and drop
    /// all subscriptions. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    async fn ensure_open(&self) -> Result<(), RelayError> {
        {
            let shared = self.inner.lock();
            if shared.disposed {
                return Err(RelayError::Disposed);
            }
            if shared.state == ConnectionState::Open && shared.socket.is_some() {
                return Ok(());
            }
        }
        self.reconnect(true).await?;
        if self.is_disposed() {
            return Err(RelayError::Disposed);
        }
        Ok(())
    }

    async fn run_reconnect(&self) -> Result<(), RelayError> {
        let mut last_error: Option<RelayError> = None;
        loop {
            let decision = {
                let mut shared = self.inner.lock();
                if shared.disposed {
                    return Err(RelayError::Disposed);
                }
                shared.backoff.next_attempt()
            };

            let attempt = match decision {
                RetryDecision::Retry { attempt, delay } => {
                    if !delay.is_zero() {
                        self.inner.apply_event(ConnectionEvent::RetryScheduled);
                        info!(attempt, delay_secs = delay.as_secs(), "reconnecting after backoff");
                        sleep(delay).await;
                        if self.is_disposed() {
                            return Err(RelayError::Disposed);
                        }
                        // Someone else opened a socket while we slept
                        if self.is_connected() {
                            self.inner.lock().backoff.reset();
                            debug!(attempt, "connected during backoff, sequence done");
                            return Ok(());
                        }
                    }
                    attempt
                }
                RetryDecision::Exhausted { attempts } => {
                    let last = last_error
                        .map_or_else(|| "no attempt was made".to_string(), |e| e.to_string());
                    warn!(attempts, last = %last, "reconnect budget exhausted");
                    return Err(RelayError::Exhausted { attempts, last });
                }
            };

            match self.initialize().await {
                Ok(()) if self.is_disposed() => return Err(RelayError::Disposed),
                Ok(()) => {
                    self.inner.lock().backoff.reset();
                    return Ok(());
                }
                Err(RelayError::Disposed) => return Err(RelayError::Disposed),
                Err(e) if e.is_permanent() => {
                    self.inner.lock().backoff.reset();
                    warn!(error = %e, "permanent failure, not retrying");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = self.inner.settings.max_reconnect_attempts,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }
    }
}

/// Removes a pending entry if the awaiting future is dropped early
struct PendingGuard<'a> {
    inner: &'a Inner,
    correlation_id: &'a str,
    armed: bool,
}

impl PendingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().correlator.cancel(self.correlation_id);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(shared: &mut SharedState, event: ConnectionEvent) {
        match transition(shared.state, event) {
            Ok(next) => shared.state = next,
            Err(e) => debug!(error = %e, "state event ignored"),
        }
    }

    fn apply_event(&self, event: ConnectionEvent) {
        let mut shared = self.lock();
        if !shared.disposed {
            Self::apply(&mut shared, event);
        }
    }

    /// Apply an event for the attempt of `generation`, failing if the
    /// attempt has been superseded or the client disposed meanwhile
    fn advance(&self, generation: u64, event: ConnectionEvent) -> Result<(), RelayError> {
        let mut shared = self.lock();
        if shared.disposed || shared.generation != generation {
            return Err(RelayError::Disposed);
        }
        Self::apply(&mut shared, event);
        Ok(())
    }

    fn fail_attempt(&self, generation: u64, event: ConnectionEvent, error: &RelayError) {
        warn!(error = %error, "connection attempt failed");
        let mut shared = self.lock();
        if !shared.disposed && shared.generation == generation {
            Self::apply(&mut shared, event);
        }
    }

    /// One probe-then-connect attempt
    #[instrument(skip(self), fields(service = %self.settings.service_path))]
    async fn run_attempt(self: &Arc<Self>) -> Result<(), RelayError> {
        let generation = {
            let mut shared = self.lock();
            if shared.disposed {
                return Err(RelayError::Disposed);
            }
            shared.generation += 1;
            if let Some(previous) = shared.socket.take() {
                debug!(generation = previous.generation, "neutralizing previous socket");
                previous.close();
            }
            Self::apply(&mut shared, ConnectionEvent::AttemptStarted);
            shared.generation
        };

        if let Err(e) = self.probe.check().await {
            self.fail_attempt(generation, ConnectionEvent::ProbeFailed, &e);
            self.hub.publish_event(ClientEvent::Error(e.clone()));
            return Err(e);
        }
        self.advance(generation, ConnectionEvent::ProbePassed)?;

        let url = match self.settings.socket_url() {
            Ok(url) => url,
            Err(e) => {
                let e = RelayError::from(e);
                self.fail_attempt(generation, ConnectionEvent::SocketFailed, &e);
                return Err(e);
            }
        };
        info!(path = %url.path(), "opening socket");

        let connect_timeout = self.settings.connect_timeout;
        let connection = match timeout(connect_timeout, self.transport.connect(&url)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                self.fail_attempt(generation, ConnectionEvent::SocketFailed, &e);
                return Err(e);
            }
            Err(_) => {
                let e = RelayError::Timeout(format!(
                    "socket did not open within {:?}",
                    connect_timeout
                ));
                self.fail_attempt(generation, ConnectionEvent::SocketFailed, &e);
                return Err(e);
            }
        };

        self.install_socket(generation, connection)
    }

    fn install_socket(
        self: &Arc<Self>,
        generation: u64,
        connection: SocketConnection,
    ) -> Result<(), RelayError> {
        {
            let mut shared = self.lock();
            if shared.disposed || shared.generation != generation {
                debug!("discarding socket opened for a superseded attempt");
                return Err(RelayError::Disposed);
            }

            let (outbound, outbound_rx) = mpsc::unbounded_channel();
            let writer = tokio::spawn(write_loop(connection.sink, outbound_rx));
            let reader = tokio::spawn(read_loop(
                Arc::downgrade(self),
                generation,
                connection.stream,
                outbound.clone(),
            ));

            shared.socket = Some(SocketHandle {
                generation,
                outbound,
                reader,
                writer,
            });
            Self::apply(&mut shared, ConnectionEvent::SocketOpened);
        }

        info!(generation, "socket open");
        self.hub.publish_status(ConnectionStatus::Connected);
        Ok(())
    }

    fn register_and_send(
        &self,
        correlation_id: &str,
        frame: Message,
    ) -> Result<oneshot::Receiver<ReplyResult>, RelayError> {
        let result = {
            let mut shared = self.lock();
            if shared.disposed {
                return Err(RelayError::Disposed);
            }
            let Some(outbound) = shared.socket.as_ref().map(|s| s.outbound.clone()) else {
                return Err(RelayError::Socket(
                    "socket closed before the request could be sent".to_string(),
                ));
            };
            shared.correlator.register(correlation_id).and_then(|receiver| {
                if outbound.send(frame).is_err() {
                    shared.correlator.cancel(correlation_id);
                    return Err(RelayError::Socket("socket writer has stopped".to_string()));
                }
                Ok(receiver)
            })
        };

        if let Err(e @ RelayError::Protocol(_)) = &result {
            warn!(error = %e, "request rejected");
            self.hub.publish_event(ClientEvent::Error(e.clone()));
        }
        result
    }

    fn send_frame(&self, frame: Message) -> Result<(), RelayError> {
        let shared = self.lock();
        if shared.disposed {
            return Err(RelayError::Disposed);
        }
        let socket = shared.socket.as_ref().ok_or_else(|| {
            RelayError::Socket("socket closed before the request could be sent".to_string())
        })?;
        socket
            .outbound
            .send(frame)
            .map_err(|_| RelayError::Socket("socket writer has stopped".to_string()))
    }

    fn handle_message(&self, generation: u64, message: Message) {
        let frame = match self.codec.decode_message(message) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                if self.lock().generation == generation {
                    warn!(error = %e, "undecodable frame");
                    self.hub.publish_event(ClientEvent::Error(e));
                }
                return;
            }
        };

        let route = {
            let mut shared = self.lock();
            if shared.disposed || shared.generation != generation {
                debug!(generation, "ignoring frame from stale socket");
                return;
            }
            shared.correlator.route(&frame)
        };

        self.hub.publish_event(ClientEvent::Frame(frame));
        match route {
            Route::Stream(chunk) => self.hub.publish_chunk(chunk),
            Route::Unmatched(e) => {
                warn!(error = %e, "unmatched reply");
                self.hub.publish_event(ClientEvent::Error(e));
            }
            Route::Resolved { correlation_id } => trace!(%correlation_id, "request resolved"),
            Route::Rejected { correlation_id } => trace!(%correlation_id, "request rejected"),
            Route::OutOfBand => trace!("out-of-band frame"),
        }
    }

    fn handle_closed(&self, generation: u64, reason: &str) {
        {
            let mut shared = self.lock();
            if shared.disposed || shared.generation != generation {
                return;
            }
            let Some(socket) = shared.socket.take() else {
                return;
            };
            socket.close();
            Self::apply(&mut shared, ConnectionEvent::SocketClosed);
        }
        info!(generation, reason, "socket closed");
        self.hub.publish_status(ConnectionStatus::Disconnected);
    }

    fn dispose(&self) {
        let failed = {
            let mut shared = self.lock();
            if shared.disposed {
                return;
            }
            shared.disposed = true;
            Self::apply(&mut shared, ConnectionEvent::Dispose);
            shared.generation += 1;
            if let Some(socket) = shared.socket.take() {
                socket.close();
            }
            shared.initializing = None;
            shared.reconnecting = None;
            shared.correlator.fail_all(&RelayError::Disposed)
        };
        self.hub.close();
        info!(failed, "client disposed");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let shared = self
            .shared
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = shared.socket.take() {
            socket.close();
        }
    }
}

async fn write_loop(mut sink: FrameSink, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "socket write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut stream: FrameStream,
    outbound: mpsc::UnboundedSender<Message>,
) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Ping(data))) => {
                // Answer pings at the transport level
                let _ = outbound.send(Message::Pong(data));
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map_or_else(
                    || "closed by peer".to_string(),
                    |f| format!("closed by peer: {} {}", f.code, f.reason),
                );
            }
            Some(Ok(message)) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                inner.handle_message(generation, message);
            }
            Some(Err(e)) => break e.to_string(),
            None => break "stream ended".to_string(),
        }
    };
    drop(outbound);
    if let Some(inner) = inner.upgrade() {
        inner.handle_closed(generation, &reason);
    }
}
