//! Wire protocol for the backend realtime endpoint
//!
//! Frames are JSON text of the shape `{id?, type, data?}`. The `Signal` type
//! is reserved for heartbeat/handshake traffic and never reaches subscriber
//! business callbacks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Message type carried in the envelope's `type` field.
///
/// The set is closed for protocol purposes but unknown strings are preserved
/// in `Other` so newer backends do not break older clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Heartbeat / connection handshake (internal, never dispatched)
    Signal,
    /// Task progress update
    Progress,
    /// Task result
    Result,
    /// Task or backend error
    Error,
    /// User-facing notification
    Notify,
    /// Forward-compatible catch-all
    Other(String),
}

impl MessageType {
    /// Wire representation of this type
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Signal => "Signal",
            MessageType::Progress => "Progress",
            MessageType::Result => "Result",
            MessageType::Error => "Error",
            MessageType::Notify => "Notify",
            MessageType::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Signal" => MessageType::Signal,
            "Progress" => MessageType::Progress,
            "Result" => MessageType::Result,
            "Error" => MessageType::Error,
            "Notify" => MessageType::Notify,
            _ => MessageType::Other(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message envelope exchanged with the backend.
///
/// `id` addresses a single subscriber; without it the message is broadcast
/// to every registered subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Target subscriber id (absent = broadcast)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Message type
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Arbitrary payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Build an outbound envelope
    pub fn new(kind: MessageType, data: Option<Value>, id: Option<String>) -> Self {
        Self { id, kind, data }
    }

    /// Build a heartbeat ping signal
    pub fn ping(timestamp_ms: u64, connection_id: &str) -> Self {
        Self {
            id: None,
            kind: MessageType::Signal,
            data: Some(json!({
                "Ping": timestamp_ms,
                "connectionId": connection_id,
            })),
        }
    }

    /// Extract the pong timestamp if this is a heartbeat pong signal
    pub fn pong_timestamp(&self) -> Option<u64> {
        if self.kind != MessageType::Signal {
            return None;
        }
        self.data.as_ref()?.get("Pong")?.as_u64()
    }

    /// Serialize to a JSON text frame
    pub fn to_text(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    pub fn from_text(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new(
            MessageType::Progress,
            Some(json!({"percent": 50})),
            Some("task-1".to_string()),
        );
        let text = env.to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["id"], "task-1");
        assert_eq!(value["type"], "Progress");
        assert_eq!(value["data"]["percent"], 50);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let env = Envelope::new(MessageType::Notify, None, None);
        let text = env.to_text().unwrap();
        assert_eq!(text, r#"{"type":"Notify"}"#);
    }

    #[test]
    fn test_unknown_type_preserved() {
        let env = Envelope::from_text(r#"{"type":"Telemetry","data":{"x":1}}"#).unwrap();
        assert_eq!(env.kind, MessageType::Other("Telemetry".to_string()));
        let text = env.to_text().unwrap();
        assert!(text.contains(r#""type":"Telemetry""#));
    }

    #[test]
    fn test_ping_shape() {
        let env = Envelope::ping(1234, "conn-abc");
        let data = env.data.as_ref().unwrap();
        assert_eq!(data["Ping"], 1234);
        assert_eq!(data["connectionId"], "conn-abc");
        assert_eq!(env.kind, MessageType::Signal);
    }

    #[test]
    fn test_pong_detection() {
        let pong = Envelope::from_text(r#"{"type":"Signal","data":{"Pong":987}}"#).unwrap();
        assert_eq!(pong.pong_timestamp(), Some(987));

        // A ping is not a pong
        let ping = Envelope::ping(1, "c");
        assert_eq!(ping.pong_timestamp(), None);

        // Non-signal frames never read as pongs
        let other = Envelope::from_text(r#"{"type":"Result","data":{"Pong":1}}"#).unwrap();
        assert_eq!(other.pong_timestamp(), None);
    }

    #[test]
    fn test_malformed_frame_is_error() {
        assert!(Envelope::from_text("not json").is_err());
        assert!(Envelope::from_text(r#"{"data":{}}"#).is_err());
    }
}
