use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::id::PeerId;

/// Message kind tags with meaning to the mesh itself. Anything else is an
/// application-defined kind and passes through the transport untouched.
pub mod kind {
    pub const PRESENCE: &str = "presence";
    pub const ELECTION: &str = "election";
    pub const ANSWER: &str = "answer";
    pub const COORDINATOR: &str = "coordinator";
    pub const HEARTBEAT: &str = "heartbeat";
}

/// Milliseconds since the unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Canonical envelope for every frame exchanged between peers.
///
/// The wire form is compact JSON. Payload contents are opaque to the mesh;
/// only `kind` is inspected for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: PeerId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    pub msg_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at_ms: Option<u64>,
}

impl Message {
    pub fn new(sender: PeerId, kind: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            sender,
            kind: kind.into(),
            data,
            msg_id: Uuid::new_v4(),
            sent_at_ms: None,
            received_at_ms: None,
        }
    }

    /// A control message with an empty payload.
    pub fn control(sender: PeerId, kind: &str) -> Self {
        Self::new(sender, kind, Map::new())
    }

    pub fn encode(&self) -> String {
        // Serialization of this shape cannot fail; fall back to an empty
        // object rather than propagating an impossible error.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Decode a wire payload. Malformed input is "no message", never an
    /// error: every caller treats a failed decode as drop-and-continue.
    pub fn decode(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    pub fn stamp_sent(&mut self) {
        self.sent_at_ms = Some(unix_millis());
    }

    pub fn stamp_received(&mut self) {
        self.received_at_ms = Some(unix_millis());
    }

    /// Wire-to-receipt latency, when both sides stamped the envelope.
    pub fn latency_ms(&self) -> Option<u64> {
        match (self.sent_at_ms, self.received_at_ms) {
            (Some(sent), Some(received)) => Some(received.saturating_sub(sent)),
            _ => None,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self.kind.as_str(),
            kind::ELECTION | kind::ANSWER | kind::COORDINATOR | kind::HEARTBEAT
        )
    }
}

/// An inbound message classified for routing.
///
/// The four election kinds are handled by the mesh; everything else reaches
/// the application callback unmodified via the `App` variant.
#[derive(Debug, Clone)]
pub enum Control {
    Election { sender: PeerId },
    Answer { sender: PeerId },
    Coordinator { sender: PeerId },
    Heartbeat { sender: PeerId },
    App(Message),
}

impl Control {
    pub fn classify(message: Message) -> Self {
        let sender = message.sender;
        match message.kind.as_str() {
            kind::ELECTION => Control::Election { sender },
            kind::ANSWER => Control::Answer { sender },
            kind::COORDINATOR => Control::Coordinator { sender },
            kind::HEARTBEAT => Control::Heartbeat { sender },
            _ => Control::App(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut data = Map::new();
        data.insert("score".into(), Value::from(3));
        data.insert("paddle_y".into(), Value::from(128));
        Message::new(PeerId::generate(), "state", data)
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let message = sample();
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_timestamps_survive_roundtrip() {
        let mut message = sample();
        message.stamp_sent();
        let mut decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.sent_at_ms, message.sent_at_ms);
        assert_eq!(decoded.received_at_ms, None);
        decoded.stamp_received();
        assert!(decoded.latency_ms().is_some());
    }

    #[test]
    fn test_malformed_input_is_no_message() {
        assert!(Message::decode("").is_none());
        assert!(Message::decode("not json at all").is_none());
        assert!(Message::decode("{\"kind\":\"state\"}").is_none());
        assert!(Message::decode("{truncated").is_none());
    }

    #[test]
    fn test_control_kinds_are_classified() {
        let sender = PeerId::generate();
        for control_kind in [
            kind::ELECTION,
            kind::ANSWER,
            kind::COORDINATOR,
            kind::HEARTBEAT,
        ] {
            let message = Message::control(sender, control_kind);
            assert!(message.is_control());
            match Control::classify(message) {
                Control::App(_) => panic!("{control_kind} should not pass through"),
                _ => {}
            }
        }
    }

    #[test]
    fn test_unknown_kinds_pass_through_unmodified() {
        let message = sample();
        let original = message.clone();
        match Control::classify(message) {
            Control::App(passed) => assert_eq!(passed, original),
            other => panic!("expected passthrough, got {other:?}"),
        }
    }

    #[test]
    fn test_presence_is_not_an_election_control() {
        let message = Message::control(PeerId::generate(), kind::PRESENCE);
        assert!(!message.is_control());
        assert!(matches!(Control::classify(message), Control::App(_)));
    }
}
