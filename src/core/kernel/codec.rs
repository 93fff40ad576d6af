use crate::core::errors::RelayError;
use crate::core::types::{ErrorDetails, InboundFrame, StreamChunk};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite::Message;

const PARENT_ID_FIELD: &str = "parent_id";
const DONE_FIELD: &str = "done";
const ERROR_FIELD: &str = "error";

/// JSON frame codec for the relay protocol
///
/// Outbound frames carry the caller-assigned correlation field. Inbound
/// frames are classified by shape:
/// - an `error` member makes an [`InboundFrame::ErrorReply`]
/// - `parent_id` together with a boolean `done` makes a [`StreamChunk`]
/// - the correlation field or `parent_id` makes an [`InboundFrame::Reply`]
/// - anything else is [`InboundFrame::OutOfBand`]
#[derive(Debug, Clone)]
pub struct FrameCodec {
    correlation_field: String,
}

impl FrameCodec {
    pub fn new(correlation_field: impl Into<String>) -> Self {
        Self {
            correlation_field: correlation_field.into(),
        }
    }

    pub fn correlation_field(&self) -> &str {
        &self.correlation_field
    }

    /// Serialize an outbound message and extract its correlation id
    pub fn encode<T: Serialize + ?Sized>(&self, message: &T) -> Result<(String, Message), RelayError> {
        let value = serde_json::to_value(message)?;
        let Value::Object(map) = &value else {
            return Err(RelayError::Protocol(
                "outbound message must be a JSON object".to_string(),
            ));
        };

        let id = map
            .get(&self.correlation_field)
            .and_then(id_to_string)
            .ok_or_else(|| {
                RelayError::Protocol(format!(
                    "outbound message is missing the '{}' correlation field",
                    self.correlation_field
                ))
            })?;

        Ok((id, Message::Text(serde_json::to_string(&value)?)))
    }

    /// Decode a raw websocket message
    ///
    /// Returns `Ok(None)` for control frames, which the transport handles.
    pub fn decode_message(&self, message: Message) -> Result<Option<InboundFrame>, RelayError> {
        match message {
            Message::Text(text) => self.decode(&text).map(Some),
            Message::Binary(data) => {
                let text = String::from_utf8(data)
                    .map_err(|e| RelayError::Protocol(format!("binary frame is not UTF-8: {}", e)))?;
                self.decode(&text).map(Some)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => Ok(None),
        }
    }

    pub fn decode(&self, text: &str) -> Result<InboundFrame, RelayError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::Protocol(format!("malformed frame: {}", e)))?;
        let Value::Object(mut map) = value else {
            return Err(RelayError::Protocol(
                "frame is not a JSON object".to_string(),
            ));
        };

        let direct_id = map.get(&self.correlation_field).and_then(id_to_string);
        let parent_id = map.get(PARENT_ID_FIELD).and_then(id_to_string);

        if let Some(error) = map.get(ERROR_FIELD) {
            let error = parse_error(error);
            return Ok(InboundFrame::ErrorReply {
                correlation_id: direct_id.or(parent_id),
                error,
            });
        }

        if let Some(parent) = parent_id.clone() {
            if let Some(done) = map.get(DONE_FIELD).and_then(Value::as_bool) {
                map.remove(PARENT_ID_FIELD);
                map.remove(DONE_FIELD);
                return Ok(InboundFrame::StreamChunk(StreamChunk {
                    parent_id: parent,
                    payload: Value::Object(map),
                    done,
                }));
            }
        }

        match direct_id.or(parent_id) {
            Some(correlation_id) => {
                map.remove(&self.correlation_field);
                map.remove(PARENT_ID_FIELD);
                Ok(InboundFrame::Reply {
                    correlation_id,
                    payload: Value::Object(map),
                })
            }
            None => Ok(InboundFrame::OutOfBand {
                payload: Value::Object(map),
            }),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new("id")
    }
}

fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_error(error: &Value) -> ErrorDetails {
    match error {
        Value::Object(obj) => ErrorDetails {
            kind: string_field(obj, "type")
                .or_else(|| string_field(obj, "kind"))
                .unwrap_or_else(|| "error".to_string()),
            message: string_field(obj, "message").unwrap_or_else(|| error.to_string()),
            hint: string_field(obj, "hint"),
        },
        Value::String(message) => ErrorDetails {
            kind: "error".to_string(),
            message: message.clone(),
            hint: None,
        },
        other => ErrorDetails {
            kind: "error".to_string(),
            message: other.to_string(),
            hint: None,
        },
    }
}

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_extracts_id() {
        let codec = FrameCodec::default();
        let (id, message) = codec.encode(&json!({"id": "r1", "type": "ping"})).unwrap();
        assert_eq!(id, "r1");

        if let Message::Text(text) = message {
            assert!(text.contains("\"type\":\"ping\""));
        } else {
            panic!("Expected text message");
        }
    }

    #[test]
    fn test_encode_numeric_id() {
        let codec = FrameCodec::default();
        let (id, _) = codec.encode(&json!({"id": 42})).unwrap();
        assert_eq!(id, "42");
    }

    #[test]
    fn test_encode_missing_id_is_protocol_error() {
        let codec = FrameCodec::default();
        let result = codec.encode(&json!({"type": "ping"}));
        assert!(matches!(result, Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_decode_parent_id_reply_strips_routing() {
        let codec = FrameCodec::default();
        let frame = codec.decode(r#"{"parent_id":"r1","ok":true}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Reply {
                correlation_id: "r1".to_string(),
                payload: json!({"ok": true}),
            }
        );
    }

    #[test]
    fn test_decode_custom_correlation_field() {
        let codec = FrameCodec::new("request_id");
        let frame = codec.decode(r#"{"request_id":"a","value":1}"#).unwrap();
        assert_eq!(frame.correlation_id(), Some("a"));
    }

    #[test]
    fn test_decode_stream_chunk() {
        let codec = FrameCodec::default();
        let frame = codec
            .decode(r#"{"parent_id":"c1","done":false,"content":"Hel"}"#)
            .unwrap();
        if let InboundFrame::StreamChunk(chunk) = frame {
            assert_eq!(chunk.parent_id, "c1");
            assert!(!chunk.done);
            assert_eq!(chunk.payload, json!({"content": "Hel"}));
        } else {
            panic!("Expected stream chunk");
        }
    }

    #[test]
    fn test_decode_error_reply() {
        let codec = FrameCodec::default();
        let frame = codec
            .decode(r#"{"id":"r2","error":{"type":"auth","message":"denied","hint":"log in again"}}"#)
            .unwrap();
        if let InboundFrame::ErrorReply { correlation_id, error } = frame {
            assert_eq!(correlation_id.as_deref(), Some("r2"));
            assert_eq!(error.kind, "auth");
            assert_eq!(error.message, "denied");
            assert_eq!(error.hint.as_deref(), Some("log in again"));
        } else {
            panic!("Expected error reply");
        }
    }

    #[test]
    fn test_decode_string_error_without_id() {
        let codec = FrameCodec::default();
        let frame = codec.decode(r#"{"error":"boom"}"#).unwrap();
        assert!(matches!(
            frame,
            InboundFrame::ErrorReply { correlation_id: None, ref error } if error.message == "boom"
        ));
    }

    #[test]
    fn test_decode_out_of_band() {
        let codec = FrameCodec::default();
        let frame = codec.decode(r#"{"type":"signup","user":"x"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::OutOfBand { .. }));
    }

    #[test]
    fn test_decode_malformed() {
        let codec = FrameCodec::default();
        assert!(matches!(codec.decode("not json"), Err(RelayError::Protocol(_))));
        assert!(matches!(codec.decode("[1,2]"), Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_decode_control_frames_are_skipped() {
        let codec = FrameCodec::default();
        assert!(codec.decode_message(Message::Ping(vec![1])).unwrap().is_none());
    }

    #[test]
    fn test_decode_binary_text() {
        let codec = FrameCodec::default();
        let frame = codec
            .decode_message(Message::Binary(br#"{"id":"b1"}"#.to_vec()))
            .unwrap();
        assert_eq!(frame.and_then(|f| f.correlation_id().map(str::to_string)), Some("b1".to_string()));
    }
}
