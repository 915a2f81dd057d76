//! The WebSocket message envelope shared by client and server frames.
//!
//! Keeping `payload` as an opaque `serde_json::Value` rather than a typed
//! diagram-mutation document lets the collaboration core pass mutations
//! through without interpreting them — only the diagram subsystem
//! understands their shape.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMessageKind {
    OpSubmit,
    PresenterRequest,
    PresenterGrant,
    PresenterDeny,
    Leave,
    Pong,
}

/// A frame sent from a connected client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: ClientMessageKind,
    pub op_id: Uuid,
    #[serde(default)]
    pub base_sequence: u64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessageKind {
    /// Sent once, immediately after a successful join, carrying the
    /// session descriptor plus whatever catch-up the ring buffer allows.
    SessionState,
    OpApplied,
    OpRejected,
    StateCorrection,
    PresenterRequested,
    PresenterChanged,
    ParticipantJoined,
    ParticipantLeft,
    SessionEnded,
    Ping,
}

/// A frame sent from the server to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub kind: ServerMessageKind,
    /// Echoes the originating client `op_id` for `op_applied`/`op_rejected`;
    /// absent for server-initiated frames (`presenter_changed`, `ping`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_id: Option<Uuid>,
    /// Carried whenever the frame reflects a sequence-bearing event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_sequence: Option<u64>,
    pub payload: serde_json::Value,
}

impl ServerEnvelope {
    pub fn new(kind: ServerMessageKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            op_id: None,
            server_sequence: None,
            payload,
        }
    }

    pub fn with_op_id(mut self, op_id: Uuid) -> Self {
        self.op_id = Some(op_id);
        self
    }

    pub fn with_server_sequence(mut self, server_sequence: u64) -> Self {
        self.server_sequence = Some(server_sequence);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_envelope_op_submit_roundtrip() {
        let env = ClientEnvelope {
            kind: ClientMessageKind::OpSubmit,
            op_id: Uuid::nil(),
            base_sequence: 5,
            payload: json!({"mutation": "add_node"}),
        };
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains(r#""type":"op_submit""#));
        let parsed: ClientEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.base_sequence, 5);
        assert_eq!(parsed.kind, ClientMessageKind::OpSubmit);
    }

    #[test]
    fn client_envelope_defaults_base_sequence_and_payload() {
        let text = r#"{"type":"leave","op_id":"00000000-0000-0000-0000-000000000000"}"#;
        let parsed: ClientEnvelope = serde_json::from_str(text).unwrap();
        assert_eq!(parsed.base_sequence, 0);
        assert_eq!(parsed.payload, serde_json::Value::Null);
    }

    #[test]
    fn server_envelope_omits_absent_fields() {
        let env = ServerEnvelope::new(ServerMessageKind::Ping, serde_json::Value::Null);
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("op_id"));
        assert!(!text.contains("server_sequence"));
    }

    #[test]
    fn server_envelope_op_applied_carries_sequence_and_op_id() {
        let op_id = Uuid::new_v4();
        let env = ServerEnvelope::new(ServerMessageKind::OpApplied, json!({}))
            .with_op_id(op_id)
            .with_server_sequence(42);
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains(r#""type":"op_applied""#));
        assert!(text.contains("42"));
        let parsed: ServerEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.op_id, Some(op_id));
        assert_eq!(parsed.server_sequence, Some(42));
    }
}
