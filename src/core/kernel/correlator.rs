use crate::core::errors::RelayError;
use crate::core::types::{InboundFrame, StreamChunk};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub type ReplyResult = Result<Value, RelayError>;

/// Where an inbound frame ended up
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// A pending request was resolved with the payload
    Resolved { correlation_id: String },
    /// A pending request was rejected with the remote error
    Rejected { correlation_id: String },
    /// Belongs on the stream channel
    Stream(StreamChunk),
    /// No pending request claims it; observers only
    OutOfBand,
    /// A reply nobody is waiting for
    Unmatched(RelayError),
}

/// Outstanding requests keyed by correlation id.
///
/// An entry is removed the moment it is settled, so a repeated reply for
/// the same id is reported as [`Route::Unmatched`] rather than delivered
/// twice.
#[derive(Debug, Default)]
pub struct Correlator {
    pending: HashMap<String, oneshot::Sender<ReplyResult>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// Register a pending request; an id that is already outstanding is a
    /// protocol error and leaves the existing entry untouched
    pub fn register(
        &mut self,
        correlation_id: &str,
    ) -> Result<oneshot::Receiver<ReplyResult>, RelayError> {
        if self.pending.contains_key(correlation_id) {
            return Err(RelayError::Protocol(format!(
                "correlation id '{}' is already pending",
                correlation_id
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }

    /// Drop an entry without settling it
    pub fn cancel(&mut self, correlation_id: &str) -> bool {
        self.pending.remove(correlation_id).is_some()
    }

    /// Settle a specific entry with an error
    pub fn reject(&mut self, correlation_id: &str, error: RelayError) -> bool {
        self.settle(correlation_id, Err(error))
    }

    /// Reject every outstanding request, returning how many there were
    pub fn fail_all(&mut self, error: &RelayError) -> usize {
        let drained: Vec<_> = self.pending.drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Decide where a frame goes, settling the matching entry if any
    pub fn route(&mut self, frame: &InboundFrame) -> Route {
        match frame {
            InboundFrame::Reply {
                correlation_id,
                payload,
            } => {
                if self.settle(correlation_id, Ok(payload.clone())) {
                    Route::Resolved {
                        correlation_id: correlation_id.clone(),
                    }
                } else {
                    Route::Unmatched(RelayError::Protocol(format!(
                        "reply for unknown or already settled request '{}'",
                        correlation_id
                    )))
                }
            }
            InboundFrame::ErrorReply {
                correlation_id: Some(id),
                error,
            } => {
                if self.settle(id, Err(error.clone().into())) {
                    Route::Rejected {
                        correlation_id: id.clone(),
                    }
                } else {
                    // Mid-stream failure: end the stream gracefully
                    Route::Stream(StreamChunk {
                        parent_id: id.clone(),
                        payload: Value::String(error.hint_or_message().to_string()),
                        done: true,
                    })
                }
            }
            InboundFrame::ErrorReply {
                correlation_id: None,
                error,
            } => match self.sole_pending() {
                Some(id) => {
                    self.settle(&id, Err(error.clone().into()));
                    Route::Rejected { correlation_id: id }
                }
                None => Route::OutOfBand,
            },
            InboundFrame::StreamChunk(chunk) => Route::Stream(chunk.clone()),
            InboundFrame::OutOfBand { payload } => match self.sole_pending() {
                Some(id) => {
                    self.settle(&id, Ok(payload.clone()));
                    Route::Resolved { correlation_id: id }
                }
                None => Route::OutOfBand,
            },
        }
    }

    // Frames without an id are only attributable when exactly one request waits
    fn sole_pending(&self) -> Option<String> {
        if self.pending.len() == 1 {
            self.pending.keys().next().cloned()
        } else {
            None
        }
    }

    fn settle(&mut self, correlation_id: &str, result: ReplyResult) -> bool {
        match self.pending.remove(correlation_id) {
            Some(tx) => {
                // The caller may have stopped waiting; the entry is settled either way
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }
}
