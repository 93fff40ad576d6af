use crate::core::types::{ClientEvent, ConnectionStatus, StreamChunk};
use serde_json::Value;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Narrowly scoped publish/subscribe channel.
///
/// Publishing never fails: a missing audience is not an error, and every
/// subscriber owns its own receiver so a slow or panicking consumer cannot
/// affect delivery to the others.
#[derive(Debug)]
pub struct EventBus<T: Clone> {
    sender: Mutex<Option<broadcast::Sender<T>>>,
    name: &'static str,
}

impl<T: Clone> EventBus<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            name,
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<broadcast::Sender<T>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the number of subscribers the event reached
    pub fn publish(&self, event: T) -> usize {
        self.sender()
            .as_ref()
            .and_then(|sender| sender.send(event).ok())
            .unwrap_or(0)
    }

    /// Subscribe to future events. After [`close`](Self::close) the
    /// returned receiver is already closed.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        if let Some(sender) = self.sender().as_ref() {
            return sender.subscribe();
        }
        let (_, receiver) = broadcast::channel(1);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Drop every registration; existing receivers observe `Closed`
    pub fn close(&self) {
        if self.sender().take().is_some() {
            debug!(channel = self.name, "event channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }
}

/// Fans inbound traffic out to the three client channels
#[derive(Debug)]
pub struct MessageHub {
    messages: EventBus<ClientEvent>,
    stream: EventBus<StreamChunk>,
    status: EventBus<ConnectionStatus>,
}

impl MessageHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: EventBus::new("messages", capacity),
            stream: EventBus::new("stream", capacity),
            status: EventBus::new("connection_status", capacity),
        }
    }

    pub fn publish_event(&self, event: ClientEvent) {
        self.messages.publish(event);
    }

    pub fn publish_chunk(&self, chunk: StreamChunk) {
        self.stream.publish(chunk);
    }

    pub fn publish_status(&self, status: ConnectionStatus) {
        self.status.publish(status);
    }

    pub fn messages(&self) -> broadcast::Receiver<ClientEvent> {
        self.messages.subscribe()
    }

    pub fn stream(&self) -> broadcast::Receiver<StreamChunk> {
        self.stream.subscribe()
    }

    pub fn stream_for(&self, parent_id: impl Into<String>) -> StreamSubscription {
        StreamSubscription::new(parent_id.into(), self.stream.subscribe())
    }

    pub fn connection_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn close(&self) {
        self.messages.close();
        self.stream.close();
        self.status.close();
    }
}

/// Chunks of one streamed reply, in arrival order
#[derive(Debug)]
pub struct StreamSubscription {
    parent_id: String,
    receiver: broadcast::Receiver<StreamChunk>,
    finished: bool,
}

impl StreamSubscription {
    pub fn new(parent_id: String, receiver: broadcast::Receiver<StreamChunk>) -> Self {
        Self {
            parent_id,
            receiver,
            finished: false,
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next chunk for this parent id; `None` after the `done` chunk or
    /// once the client is disposed.
    ///
    /// A subscriber that falls more than the channel capacity behind has
    /// lost chunks it cannot recover, so the stream ends with a synthetic
    /// terminal chunk whose payload describes the gap.
    pub async fn next(&mut self) -> Option<StreamChunk> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(chunk) if chunk.parent_id == self.parent_id => {
                    self.finished = chunk.done;
                    return Some(chunk);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(parent_id = %self.parent_id, skipped, "stream subscriber lagged");
                    self.finished = true;
                    return Some(StreamChunk {
                        parent_id: self.parent_id.clone(),
                        payload: Value::String(format!(
                            "stream lagged: {} chunks were dropped",
                            skipped
                        )),
                        done: true,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Drain the stream until its terminal chunk
    pub async fn collect(mut self) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await {
            chunks.push(chunk);
        }
        chunks
    }
}
