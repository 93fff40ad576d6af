use crate::core::errors::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

/// Error payload carried by an `ErrorReply` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub kind: String,
    pub message: String,
    pub hint: Option<String>,
}

impl ErrorDetails {
    /// What a streaming consumer should see: the hint when present, else the message
    pub fn hint_or_message(&self) -> &str {
        self.hint.as_deref().unwrap_or(&self.message)
    }
}

impl From<ErrorDetails> for RelayError {
    fn from(details: ErrorDetails) -> Self {
        Self::Remote {
            kind: details.kind,
            message: details.message,
            hint: details.hint,
        }
    }
}

/// A partial reply associated with a parent request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub parent_id: String,
    pub payload: Value,
    pub done: bool,
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Direct reply; payload has the routing keys stripped
    Reply { correlation_id: String, payload: Value },
    /// Error answer; the id is absent when the peer omitted it
    ErrorReply {
        correlation_id: Option<String>,
        error: ErrorDetails,
    },
    StreamChunk(StreamChunk),
    /// Server-pushed frame with no correlation id
    OutOfBand { payload: Value },
}

impl InboundFrame {
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Reply { correlation_id, .. } => Some(correlation_id),
            Self::ErrorReply { correlation_id, .. } => correlation_id.as_deref(),
            Self::StreamChunk(chunk) => Some(&chunk.parent_id),
            Self::OutOfBand { .. } => None,
        }
    }
}

/// Coarse connectivity signal, decoupled from any request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Everything published on the observer stream
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Frame(InboundFrame),
    Error(RelayError),
}

/// Generate a correlation id unique within this process.
///
/// Ids are a random per-process prefix followed by a monotonically
/// increasing counter.
pub fn new_correlation_id() -> String {
    static PREFIX: OnceLock<u32> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    let prefix = PREFIX.get_or_init(rand::random::<u32>);
    format!("{:08x}-{}", prefix, COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_correlation_ids_are_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| new_correlation_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_hint_or_message() {
        let mut details = ErrorDetails {
            kind: "quota".to_string(),
            message: "quota exceeded".to_string(),
            hint: None,
        };
        assert_eq!(details.hint_or_message(), "quota exceeded");
        details.hint = Some("upgrade your plan".to_string());
        assert_eq!(details.hint_or_message(), "upgrade your plan");
    }

    #[test]
    fn test_error_details_into_remote_error() {
        let err: RelayError = ErrorDetails {
            kind: "not_found".to_string(),
            message: "no such app".to_string(),
            hint: Some("deploy it first".to_string()),
        }
        .into();
        assert_eq!(err.hint(), Some("deploy it first"));
        assert!(err.to_string().contains("no such app"));
    }
}
