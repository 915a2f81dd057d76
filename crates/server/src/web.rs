//! The REST collaboration surface: create/join/leave a diagram's
//! real-time session, list live sessions, and upgrade to its WebSocket.
//!
//! REST CRUD for threat models and diagrams themselves is out of scope —
//! `AppState::directory` is this server's read-only view onto facts an
//! external system owns.

use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tmi_common::{AppError, Principal, Role, SessionConfig, SessionDescriptor, SessionPermission, SigningKeySet};
use uuid::Uuid;

use crate::access;
use crate::auth::{AuthenticatedUser, HasSigningKeys};
use crate::directory::{DiagramSnapshotWriter, ThreatModelDirectory};
use crate::registry::{self, SessionRegistry};
use crate::ws;

/// Shared application state for the REST + WebSocket surface.
pub struct AppState {
    pub directory: Arc<dyn ThreatModelDirectory>,
    pub snapshot_writer: Arc<dyn DiagramSnapshotWriter>,
    pub registry: SessionRegistry,
    pub session_config: Arc<SessionConfig>,
    /// Snapshot of the signing key set used to validate bearer tokens.
    /// See `HasSigningKeys`'s doc comment for why this is a clone rather
    /// than a shared lock guard.
    pub signing_keys: StdRwLock<SigningKeySet>,
    pub started_at: std::time::Instant,
}

impl HasSigningKeys for AppState {
    fn signing_keys(&self) -> SigningKeySet {
        self.signing_keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Build the Axum router for the collaboration REST + WebSocket surface.
/// OAuth's own router (`oauth::routes`) is mounted separately by the
/// caller since it carries its own state type.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/threat_models/{threat_model_id}/diagrams/{diagram_id}/collaborate",
            post(create_session).put(join_session).delete(leave_or_end_session),
        )
        .route("/collaboration/sessions", get(list_sessions))
        .route("/ws/diagrams/{diagram_id}", get(ws_upgrade))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Require at least `Role::Reader` and translate the no-access case to
/// `Forbidden` (as opposed to `resolve_diagram_role`'s `Role::None`,
/// which read-only listing endpoints would instead use to filter a row).
fn permission_for(role: Role) -> Result<SessionPermission, AppError> {
    role.session_permission().ok_or(AppError::Forbidden)
}

/// `POST /threat_models/{tm}/diagrams/{d}/collaborate` — create (or
/// idempotently return) the collaboration session for a diagram. Only a
/// writer or owner may create one.
async fn create_session(
    State(state): State<Arc<AppState>>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> Result<impl IntoResponse, AppError> {
    let role =
        access::resolve_diagram_role(state.directory.as_ref(), &principal, threat_model_id, diagram_id).await?;
    if role < Role::Writer {
        return Err(AppError::Forbidden);
    }

    let (handle, created) = registry::get_or_create(
        &state.registry,
        diagram_id,
        threat_model_id,
        Arc::clone(&state.session_config),
    )
    .await;
    let outcome = handle
        .join(principal.user_id, principal.email.clone(), SessionPermission::Writer, None, None)
        .await?;

    let status = if created {
        axum::http::StatusCode::CREATED
    } else {
        axum::http::StatusCode::OK
    };
    Ok((status, Json(outcome.descriptor)))
}

/// `PUT /threat_models/{tm}/diagrams/{d}/collaborate` — join an existing
/// session as a reader or writer, depending on the caller's role. Does
/// not create a session; use `POST` for that.
async fn join_session(
    State(state): State<Arc<AppState>>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> Result<Json<SessionDescriptor>, AppError> {
    let role =
        access::resolve_diagram_role(state.directory.as_ref(), &principal, threat_model_id, diagram_id).await?;
    let permission = permission_for(role)?;

    let handle = registry::get_session(&state.registry, diagram_id)
        .await
        .ok_or(AppError::NotFound)?;
    let outcome = handle
        .join(principal.user_id, principal.email.clone(), permission, None, None)
        .await?;
    Ok(Json(outcome.descriptor))
}

/// `DELETE /threat_models/{tm}/diagrams/{d}/collaborate` — leave the
/// session. The session's manager, or the threat model's owner, may
/// instead force-end it for every participant.
async fn leave_or_end_session(
    State(state): State<Arc<AppState>>,
    Path((threat_model_id, diagram_id)): Path<(Uuid, Uuid)>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> Result<impl IntoResponse, AppError> {
    let role =
        access::resolve_diagram_role(state.directory.as_ref(), &principal, threat_model_id, diagram_id).await?;
    if role == Role::None {
        return Err(AppError::Forbidden);
    }

    let handle = registry::get_session(&state.registry, diagram_id)
        .await
        .ok_or(AppError::NotFound)?;
    let descriptor = handle.describe().await?;

    let may_force_end = role == Role::Owner || descriptor.session_manager == principal.user_id;
    if may_force_end {
        handle.terminate("ended_by_manager").await?;
    } else {
        handle.leave(principal.user_id).await;
    }
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// `GET /collaboration/sessions` — every live session the caller has at
/// least read access to.
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    AuthenticatedUser(principal): AuthenticatedUser,
) -> Result<Json<Vec<SessionDescriptor>>, AppError> {
    let mut visible = Vec::new();
    for handle in registry::all_sessions(&state.registry).await {
        let Ok(descriptor) = handle.describe().await else {
            continue;
        };
        let Ok(threat_model) = state.directory.get(descriptor.threat_model_id).await else {
            continue;
        };
        if access::resolve_role(&principal, &threat_model) != Role::None {
            visible.push(descriptor);
        }
    }
    Ok(Json(visible))
}

/// `GET /ws/diagrams/{diagram_id}` — upgrade to the collaboration
/// session's WebSocket. The diagram's threat model is looked up from the
/// session itself, so the URL need only name the diagram.
async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Path(diagram_id): Path<Uuid>,
    AuthenticatedUser(principal): AuthenticatedUser,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, AppError> {
    let handle = registry::get_session(&state.registry, diagram_id)
        .await
        .ok_or(AppError::NotFound)?;
    let descriptor = handle.describe().await?;
    let threat_model = state.directory.get(descriptor.threat_model_id).await?;
    let role = access::resolve_role(&principal, &threat_model);
    let permission = permission_for(role)?;

    let config = Arc::clone(&state.session_config);
    let snapshot_writer = Arc::clone(&state.snapshot_writer);
    let Principal { user_id, email, .. } = principal;
    Ok(ws.on_upgrade(move |socket| async move {
        ws::handle_ws(socket, user_id, email, permission, handle, config, None, snapshot_writer).await;
    }))
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
