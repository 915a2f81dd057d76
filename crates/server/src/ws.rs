//! The WebSocket transport for a collaboration session: per-connection
//! reader/writer loop, heartbeat, backpressure and rate limiting.
//!
//! Each connection gets its own bounded outbound queue rather than
//! subscribing to a broadcast channel — a slow reader falls behind on its
//! own queue instead of forcing every other participant's delivery rate
//! down to its pace, and a full queue is an observable policy violation
//! (`outbound_queue_capacity`) the connection is closed over, rather than
//! silently-dropped broadcast lag.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use serde_json::json;
use tmi_common::{
    AppError, ClientEnvelope, ClientMessageKind, ServerEnvelope, ServerMessageKind, SessionConfig,
    SessionPermission,
};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, interval};
use uuid::Uuid;

use crate::directory::DiagramSnapshotWriter;
use crate::session::{CatchUp, SessionHandle};

/// Interval between WebSocket ping frames.
const WS_PING_INTERVAL: Duration = Duration::from_secs(20);

/// Maximum time to wait for a pong before considering the connection
/// dead. Two missed pings (2 * 20s).
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(40);

/// A simple per-connection token bucket, refilled continuously rather
/// than in discrete ticks.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(refill_per_sec: u32, capacity: u32) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec: refill_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Drive one client's WebSocket connection for the lifetime of its
/// membership in `session`. Returns once the socket closes, the
/// connection violates policy (oversized message, rate limit, stalled
/// heartbeat), or the session itself shuts down.
pub async fn handle_ws(
    mut socket: WebSocket,
    user_id: Uuid,
    email: String,
    permission: SessionPermission,
    session: SessionHandle,
    config: Arc<SessionConfig>,
    resume_from_sequence: Option<u64>,
    snapshot_writer: Arc<dyn DiagramSnapshotWriter>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerEnvelope>(config.outbound_queue_capacity);

    let join = match session
        .join(user_id, email, permission, Some(outbound_tx), resume_from_sequence)
        .await
    {
        Ok(join) => join,
        Err(_) => {
            close_with(&mut socket, 1011, "session unavailable").await;
            return;
        }
    };

    let state_payload = match &join.catch_up {
        CatchUp::Operations(ops) => {
            json!({ "descriptor": join.descriptor, "catch_up": "operations", "operations": ops })
        }
        CatchUp::SnapshotRequired => {
            json!({ "descriptor": join.descriptor, "catch_up": "snapshot_required" })
        }
    };
    let welcome = ServerEnvelope::new(ServerMessageKind::SessionState, state_payload);
    if send_frame(&mut socket, &welcome).await.is_err() {
        session.notify_disconnected(user_id);
        return;
    }

    let mut rate_limiter = TokenBucket::new(config.ws_rate_limit_per_sec, config.ws_rate_limit_burst);
    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(%user_id, "ping timeout, closing connection");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(envelope) => {
                        if send_frame(&mut socket, &envelope).await.is_err() {
                            break;
                        }
                        if envelope.kind == ServerMessageKind::SessionEnded {
                            let (code, text) = match envelope.payload.get("reason").and_then(|v| v.as_str()) {
                                Some("idle_timeout") | Some("server_shutdown") => (1001, "session ending"),
                                _ => (1000, "session ended"),
                            };
                            close_with(&mut socket, code, text).await;
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > config.ws_max_message_bytes {
                            tracing::debug!(%user_id, "message exceeds max size, closing");
                            close_with(&mut socket, 1009, "message too large").await;
                            break;
                        }
                        if !rate_limiter.try_consume() {
                            tracing::debug!(%user_id, "rate limit exceeded, closing");
                            close_with(&mut socket, 1008, "rate limit exceeded").await;
                            break;
                        }
                        if !dispatch(&text, user_id, &session, &mut socket, &snapshot_writer).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!(%user_id, "binary frames are not accepted, closing");
                        close_with(&mut socket, 1003, "binary frames not accepted").await;
                        break;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%user_id, "websocket error: {e}");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    session.notify_disconnected(user_id);
}

/// Parse and act on one inbound client frame. Returns `false` when the
/// connection should be torn down (malformed payload — a client sending
/// garbage is closed rather than kept alive with per-message errors).
async fn dispatch(
    text: &str,
    user_id: Uuid,
    session: &SessionHandle,
    socket: &mut WebSocket,
    snapshot_writer: &Arc<dyn DiagramSnapshotWriter>,
) -> bool {
    let envelope: ClientEnvelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(%user_id, "malformed client frame: {e}");
            close_with(socket, 1008, "malformed frame").await;
            return false;
        }
    };

    match envelope.kind {
        ClientMessageKind::OpSubmit => {
            let result = session
                .submit(user_id, envelope.op_id, envelope.base_sequence, envelope.payload)
                .await;
            match result {
                Ok(op) => {
                    snapshot_writer
                        .record_operation(session.diagram_id(), op.op_id, op.server_sequence, &op.payload)
                        .await;
                }
                Err(AppError::DuplicateOpId) => {
                    // Idempotent resubmission: treated as a no-op, not an error.
                }
                Err(AppError::StaleBase) => {
                    // Rebase material: reply privately with the operations the
                    // client is missing, when the ring buffer still has them.
                    let mut payload = json!({
                        "code": AppError::StaleBase.code(),
                        "message": AppError::StaleBase.to_string(),
                    });
                    match session.ops_since(envelope.base_sequence).await {
                        CatchUp::Operations(ops) => {
                            payload["missing_ops"] = json!(ops);
                        }
                        CatchUp::SnapshotRequired => {
                            payload["snapshot_required"] = json!(true);
                        }
                    }
                    let rejection = ServerEnvelope::new(ServerMessageKind::OpRejected, payload)
                        .with_op_id(envelope.op_id);
                    if send_frame(socket, &rejection).await.is_err() {
                        return false;
                    }
                }
                Err(AppError::NotPresenter) => {
                    // Non-presenter submissions are corrected, not just
                    // rejected: the submitter gets a private echo of the
                    // authoritative state alongside the rejection.
                    let rejection = ServerEnvelope::new(
                        ServerMessageKind::OpRejected,
                        json!({ "code": AppError::NotPresenter.code(), "message": AppError::NotPresenter.to_string() }),
                    )
                    .with_op_id(envelope.op_id);
                    if send_frame(socket, &rejection).await.is_err() {
                        return false;
                    }
                    if let Ok(descriptor) = session.describe().await {
                        let correction = ServerEnvelope::new(
                            ServerMessageKind::StateCorrection,
                            json!({ "presenter": descriptor.presenter }),
                        )
                        .with_server_sequence(descriptor.current_sequence)
                        .with_op_id(envelope.op_id);
                        if send_frame(socket, &correction).await.is_err() {
                            return false;
                        }
                    }
                }
                Err(err) => {
                    let rejection = ServerEnvelope::new(
                        ServerMessageKind::OpRejected,
                        json!({ "code": err.code(), "message": err.to_string() }),
                    )
                    .with_op_id(envelope.op_id);
                    if send_frame(socket, &rejection).await.is_err() {
                        return false;
                    }
                }
            }
        }
        ClientMessageKind::PresenterRequest => {
            if let Err(err) = session.request_presenter(user_id).await {
                let rejection = ServerEnvelope::new(
                    ServerMessageKind::OpRejected,
                    json!({ "code": err.code(), "message": err.to_string() }),
                )
                .with_op_id(envelope.op_id);
                if send_frame(socket, &rejection).await.is_err() {
                    return false;
                }
            }
        }
        ClientMessageKind::PresenterGrant | ClientMessageKind::PresenterDeny => {
            let grant = envelope.kind == ClientMessageKind::PresenterGrant;
            let requester_user_id = match envelope.payload.get("requester_user_id").and_then(|v| v.as_str()) {
                Some(s) => match Uuid::parse_str(s) {
                    Ok(id) => id,
                    Err(_) => {
                        close_with(socket, 1008, "malformed requester_user_id").await;
                        return false;
                    }
                },
                None => {
                    close_with(socket, 1008, "missing requester_user_id").await;
                    return false;
                }
            };
            if let Err(err) = session
                .respond_presenter_request(user_id, requester_user_id, grant)
                .await
            {
                let rejection = ServerEnvelope::new(
                    ServerMessageKind::OpRejected,
                    json!({ "code": err.code(), "message": err.to_string() }),
                )
                .with_op_id(envelope.op_id);
                if send_frame(socket, &rejection).await.is_err() {
                    return false;
                }
            }
        }
        ClientMessageKind::Leave => {
            session.leave(user_id).await;
            return false;
        }
        ClientMessageKind::Pong => {
            // Application-level pong; the native WS pong frame already
            // resets the heartbeat, so there's nothing further to do.
        }
    }

    true
}

async fn send_frame(socket: &mut WebSocket, envelope: &ServerEnvelope) -> Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).expect("ServerEnvelope always serializes");
    socket.send(Message::Text(text.into())).await
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_starts_full() {
        let mut bucket = TokenBucket::new(10, 20);
        for _ in 0..20 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
    }

    #[test]
    fn token_bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1000, 1);
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.try_consume());
    }
}
