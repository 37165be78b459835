//! SignalR JSON hub protocol, version 1.
//!
//! Every record is a JSON object followed by the ASCII record separator (0x1E). A single
//! WebSocket text frame may carry several records, or trail a partial one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::HubError;

pub const RECORD_SEPARATOR: char = '\u{1e}';

pub const MESSAGE_INVOCATION: u8 = 1;
pub const MESSAGE_COMPLETION: u8 = 3;
pub const MESSAGE_PING: u8 = 6;
pub const MESSAGE_CLOSE: u8 = 7;

#[derive(Debug, Serialize)]
pub struct HandshakeRequest<'a> {
    pub protocol: &'a str,
    pub version: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Messages we understand. Anything else (stream items, acks, sequence) is ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    Other(u8),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

impl HubMessage {
    pub fn decode(record: &str) -> Result<Self, HubError> {
        let raw: RawMessage = serde_json::from_str(record)
            .map_err(|e| HubError::Protocol(format!("bad hub record: {}", e)))?;

        Ok(match raw.kind {
            MESSAGE_INVOCATION => HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target: raw
                    .target
                    .ok_or_else(|| HubError::Protocol("invocation without target".to_string()))?,
                arguments: raw.arguments,
            },
            MESSAGE_COMPLETION => HubMessage::Completion {
                invocation_id: raw
                    .invocation_id
                    .ok_or_else(|| HubError::Protocol("completion without invocationId".to_string()))?,
                result: raw.result,
                error: raw.error,
            },
            MESSAGE_PING => HubMessage::Ping,
            MESSAGE_CLOSE => HubMessage::Close {
                error: raw.error,
                allow_reconnect: raw.allow_reconnect,
            },
            other => HubMessage::Other(other),
        })
    }
}

/// Terminate a JSON payload with the record separator.
pub fn frame(payload: &Value) -> String {
    let mut text = payload.to_string();
    text.push(RECORD_SEPARATOR);
    text
}

pub fn handshake_request() -> String {
    let mut text = serde_json::to_string(&HandshakeRequest {
        protocol: "json",
        version: 1,
    })
    .unwrap_or_default();
    text.push(RECORD_SEPARATOR);
    text
}

pub fn invocation(invocation_id: &str, target: &str, arguments: Vec<Value>) -> String {
    frame(&serde_json::json!({
        "type": MESSAGE_INVOCATION,
        "invocationId": invocation_id,
        "target": target,
        "arguments": arguments,
    }))
}

pub fn ping() -> String {
    frame(&serde_json::json!({ "type": MESSAGE_PING }))
}

pub fn close() -> String {
    frame(&serde_json::json!({ "type": MESSAGE_CLOSE }))
}

/// Accumulates text frames and yields complete records.
#[derive(Debug, Default)]
pub struct RecordBuffer {
    pending: String,
}

impl RecordBuffer {
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.pending.push_str(text);

        let mut records = Vec::new();
        while let Some(end) = self.pending.find(RECORD_SEPARATOR) {
            let record: String = self.pending.drain(..end + RECORD_SEPARATOR.len_utf8()).collect();
            let record = record.trim_end_matches(RECORD_SEPARATOR);
            if !record.trim().is_empty() {
                records.push(record.to_string());
            }
        }
        records
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiple_records_and_keeps_partial_tail() {
        let mut buffer = RecordBuffer::default();
        let records = buffer.push("{\"type\":6}\u{1e}{\"type\":1,\"target\":\"ReceiveMessage\"");
        assert_eq!(records, vec!["{\"type\":6}".to_string()]);
        assert!(!buffer.is_empty());

        let records = buffer.push(",\"arguments\":[\"E1\",\"hi\",\"2024-01-01T10:00:00Z\"]}\u{1e}");
        assert_eq!(records.len(), 1);
        assert!(buffer.is_empty());

        match HubMessage::decode(&records[0]).unwrap() {
            HubMessage::Invocation { target, arguments, .. } => {
                assert_eq!(target, "ReceiveMessage");
                assert_eq!(arguments.len(), 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decodes_completion_with_error() {
        let message = HubMessage::decode(r#"{"type":3,"invocationId":"4","error":"boom"}"#).unwrap();
        assert_eq!(
            message,
            HubMessage::Completion {
                invocation_id: "4".to_string(),
                result: None,
                error: Some("boom".to_string()),
            }
        );
    }

    #[test]
    fn decodes_close_and_unknown_types() {
        let close = HubMessage::decode(r#"{"type":7,"error":"bye","allowReconnect":true}"#).unwrap();
        assert_eq!(
            close,
            HubMessage::Close {
                error: Some("bye".to_string()),
                allow_reconnect: true,
            }
        );
        assert_eq!(HubMessage::decode(r#"{"type":2}"#).unwrap(), HubMessage::Other(2));
    }

    #[test]
    fn invocation_frame_is_terminated() {
        let text = invocation("1", "SendMessageToUser", vec![Value::from("E1")]);
        assert!(text.ends_with(RECORD_SEPARATOR));

        let value: Value = serde_json::from_str(text.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(value["type"], 1);
        assert_eq!(value["invocationId"], "1");
        assert_eq!(value["arguments"][0], "E1");
    }

    #[test]
    fn handshake_is_json_protocol_v1() {
        assert_eq!(handshake_request(), "{\"protocol\":\"json\",\"version\":1}\u{1e}");
    }
}
