//! Access Control's view onto threat-model ownership and authorization.
//!
//! REST CRUD for threat models and diagrams is out of scope here; this
//! module only models the *facts* the collaboration core and the REST
//! collaboration endpoints need about a threat model in order to decide
//! who may open a session and with what role. `InMemoryDirectory` is a
//! minimal seedable stand-in for whatever persistence layer eventually
//! owns this data.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tmi_common::{AppError, ThreatModelRef};
use uuid::Uuid;

/// Read-only facts about threat models and the diagrams that belong to
/// them, as needed to authorize a collaboration session.
#[async_trait]
pub trait ThreatModelDirectory: Send + Sync {
    async fn get(&self, threat_model_id: Uuid) -> Result<ThreatModelRef, AppError>;

    /// Whether `diagram_id` is one of `threat_model_id`'s diagrams.
    async fn diagram_belongs_to(
        &self,
        threat_model_id: Uuid,
        diagram_id: Uuid,
    ) -> Result<bool, AppError>;
}

/// An in-memory `ThreatModelDirectory`, seeded at startup. Stands in for
/// the REST CRUD persistence layer this server doesn't implement.
pub struct InMemoryDirectory {
    threat_models: RwLock<HashMap<Uuid, ThreatModelRef>>,
    diagrams: RwLock<HashMap<Uuid, Uuid>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            threat_models: RwLock::new(HashMap::new()),
            diagrams: RwLock::new(HashMap::new()),
        }
    }

    /// Register a threat model's ownership/authorization facts.
    pub fn insert_threat_model(&self, tm: ThreatModelRef) {
        self.threat_models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tm.id, tm);
    }

    /// Register a diagram as belonging to a threat model.
    pub fn insert_diagram(&self, diagram_id: Uuid, threat_model_id: Uuid) {
        self.diagrams
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(diagram_id, threat_model_id);
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThreatModelDirectory for InMemoryDirectory {
    async fn get(&self, threat_model_id: Uuid) -> Result<ThreatModelRef, AppError> {
        self.threat_models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&threat_model_id)
            .cloned()
            .ok_or(AppError::NotFound)
    }

    async fn diagram_belongs_to(
        &self,
        threat_model_id: Uuid,
        diagram_id: Uuid,
    ) -> Result<bool, AppError> {
        let diagrams = self.diagrams.read().unwrap_or_else(|e| e.into_inner());
        Ok(diagrams.get(&diagram_id) == Some(&threat_model_id))
    }
}

/// Where a session's accepted operations get mirrored back for durable
/// storage. Best-effort: a failed write must never block or fail a live
/// collaboration session, so every method returns `()` rather than a
/// `Result` the caller could mistakenly treat as load-bearing.
#[async_trait]
pub trait DiagramSnapshotWriter: Send + Sync {
    async fn record_operation(
        &self,
        diagram_id: Uuid,
        op_id: Uuid,
        server_sequence: u64,
        payload: &serde_json::Value,
    );
}

/// A `DiagramSnapshotWriter` that only logs. Stands in for the real
/// persistence hook this server doesn't implement.
pub struct LoggingSnapshotWriter;

#[async_trait]
impl DiagramSnapshotWriter for LoggingSnapshotWriter {
    async fn record_operation(
        &self,
        diagram_id: Uuid,
        op_id: Uuid,
        server_sequence: u64,
        _payload: &serde_json::Value,
    ) {
        tracing::debug!(%diagram_id, %op_id, server_sequence, "operation accepted");
    }
}
