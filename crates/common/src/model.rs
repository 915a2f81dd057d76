//! Core collaboration data model: principals, roles, and the session
//! entities shared between the REST surface and the WebSocket transport.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A validated, request-scoped identity derived from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: Uuid,
    pub email: String,
    /// Identifier of the issuing identity provider (e.g. "google", "test").
    pub provider: String,
    /// Admins are granted owner-equivalent access to every threat model.
    pub admin: bool,
}

/// A role within one threat model, with a total order:
/// `None < Reader < Writer < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    None,
    Reader,
    Writer,
    Owner,
}

impl Role {
    /// The permission level a participant holds inside a session once they
    /// join with this threat-model role. Readers may never write;
    /// owners/writers both resolve to `SessionPermission::Writer`.
    pub fn session_permission(self) -> Option<SessionPermission> {
        match self {
            Role::Owner | Role::Writer => Some(SessionPermission::Writer),
            Role::Reader => Some(SessionPermission::Reader),
            Role::None => None,
        }
    }
}

/// A single entry in a threat model's authorization list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationEntry {
    /// An email address or group identifier.
    pub subject: String,
    pub role: Role,
}

/// The ownership and authorization facts Access Control needs about a
/// threat model. Owned by REST CRUD; read-only from the collaboration
/// core's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatModelRef {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub authorization: Vec<AuthorizationEntry>,
}

/// Write permission a participant holds for the lifetime of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPermission {
    Reader,
    Writer,
}

/// A participant as reported to REST clients (the `Session` response's
/// `participants` array). The live connection handle used for fan-out is
/// server-internal and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub email: String,
    pub permissions: SessionPermission,
    pub joined_at: u64,
}

/// The stable, public shape of a collaboration session — returned by the
/// REST surface and mirrored into `GET /collaboration/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: Uuid,
    pub threat_model_id: Uuid,
    pub diagram_id: Uuid,
    pub session_manager: Uuid,
    pub presenter: Option<Uuid>,
    pub participants: Vec<ParticipantInfo>,
    pub created_at: u64,
    /// The most recently accepted `server_sequence`, 0 if no operation has
    /// been accepted yet. Carried on `state_correction` frames so a
    /// corrected client knows exactly where the authoritative head is.
    pub current_sequence: u64,
}

/// An accepted or rejected diagram mutation. `payload` is an opaque
/// document the collaboration core never interprets — only the diagram
/// subsystem understands its shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: Uuid,
    pub client_sequence: u64,
    pub server_sequence: u64,
    pub author_user_id: Uuid,
    pub payload: serde_json::Value,
    pub timestamp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_total_order() {
        assert!(Role::None < Role::Reader);
        assert!(Role::Reader < Role::Writer);
        assert!(Role::Writer < Role::Owner);
    }

    #[test]
    fn role_session_permission_mapping() {
        assert_eq!(Role::Owner.session_permission(), Some(SessionPermission::Writer));
        assert_eq!(Role::Writer.session_permission(), Some(SessionPermission::Writer));
        assert_eq!(Role::Reader.session_permission(), Some(SessionPermission::Reader));
        assert_eq!(Role::None.session_permission(), None);
    }

    #[test]
    fn role_serializes_snake_case() {
        let json = serde_json::to_string(&Role::Writer).unwrap();
        assert_eq!(json, r#""writer""#);
    }
}
