//! The single-writer collaboration session engine.
//!
//! Each live session is one task — a `SessionActor` owning all of that
//! diagram's state exclusively — draining a bounded command channel.
//! Every operation the collaboration core exposes becomes one
//! `SessionCommand` variant carrying a `oneshot` reply channel. This
//! replaces lock-guarded shared state with message passing: callers never
//! see a half-updated session, and the actor never has to reason about
//! concurrent mutation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tmi_common::{
    AppError, Operation, ParticipantInfo, ServerEnvelope, ServerMessageKind, SessionConfig,
    SessionDescriptor, SessionPermission,
};
use uuid::Uuid;

use crate::registry::{self, SessionRegistry};

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs()
}

/// What a freshly-joined (or reconnecting) participant needs sent before
/// it can apply further `op_applied` frames.
#[derive(Debug, Clone)]
pub enum CatchUp {
    /// Operations accepted since the caller's last known sequence, in
    /// order. Empty when the caller is already caught up.
    Operations(Vec<Operation>),
    /// The caller's last known sequence has fallen out of the ring
    /// buffer's retention window; it must fetch a full diagram snapshot
    /// out of band before trusting further `op_applied` frames.
    SnapshotRequired,
}

#[derive(Debug)]
pub struct JoinOutcome {
    pub descriptor: SessionDescriptor,
    pub catch_up: CatchUp,
}

pub enum SessionCommand {
    /// Registers (or reattaches) a participant. `outbound` is `None` for
    /// the REST create/join handlers, which register a participant
    /// without yet holding a live socket; the subsequent WebSocket
    /// upgrade re-joins with `Some(..)` to attach its outbound queue.
    Join {
        user_id: Uuid,
        email: String,
        permission: SessionPermission,
        outbound: Option<mpsc::Sender<ServerEnvelope>>,
        resume_from_sequence: Option<u64>,
        reply: oneshot::Sender<JoinOutcome>,
    },
    Leave {
        user_id: Uuid,
        reply: oneshot::Sender<()>,
    },
    Disconnected {
        user_id: Uuid,
    },
    Submit {
        user_id: Uuid,
        op_id: Uuid,
        base_sequence: u64,
        payload: serde_json::Value,
        reply: oneshot::Sender<Result<Operation, AppError>>,
    },
    /// Operations accepted since `since_sequence`, for a client that was
    /// just rejected with `stale_base` and needs to rebase.
    OpsSince {
        since_sequence: u64,
        reply: oneshot::Sender<CatchUp>,
    },
    RequestPresenter {
        user_id: Uuid,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    RespondPresenterRequest {
        responder_user_id: Uuid,
        requester_user_id: Uuid,
        grant: bool,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    TransferManager {
        requested_by: Uuid,
        new_manager: Uuid,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    Describe {
        reply: oneshot::Sender<SessionDescriptor>,
    },
    /// Force-ends the whole session, regardless of participant state.
    /// Used both for an owner/session-manager DELETE and for the
    /// server's own graceful shutdown sweep; `reason` is carried through
    /// to the `session_ended` broadcast so the WebSocket layer can pick
    /// an appropriate close code.
    Terminate {
        reason: String,
        reply: oneshot::Sender<()>,
    },
}

/// A cheap, cloneable reference to a live session actor. Equality of two
/// handles for "same session instance" purposes is `is_same_actor`, not
/// `PartialEq` on `session_id` — a torn-down and freshly recreated
/// session for the same diagram would share a diagram ID but not an
/// actor.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    diagram_id: Uuid,
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn spawn(
        session_id: Uuid,
        diagram_id: Uuid,
        threat_model_id: Uuid,
        config: Arc<SessionConfig>,
        registry: SessionRegistry,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let handle = SessionHandle {
            session_id,
            diagram_id,
            tx,
        };
        let actor = SessionActor::new(
            session_id,
            diagram_id,
            threat_model_id,
            config,
            registry,
            handle.clone(),
        );
        tokio::spawn(actor.run(rx));
        handle
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn diagram_id(&self) -> Uuid {
        self.diagram_id
    }

    pub fn is_same_actor(&self, other: &SessionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    pub async fn join(
        &self,
        user_id: Uuid,
        email: String,
        permission: SessionPermission,
        outbound: Option<mpsc::Sender<ServerEnvelope>>,
        resume_from_sequence: Option<u64>,
    ) -> Result<JoinOutcome, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Join {
                user_id,
                email,
                permission,
                outbound,
                resume_from_sequence,
                reply,
            })
            .await
            .map_err(|_| AppError::Gone)?;
        rx.await.map_err(|_| AppError::Gone)
    }

    pub async fn leave(&self, user_id: Uuid) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCommand::Leave { user_id, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Notify the session that a connection dropped without an explicit
    /// `leave`. Fire-and-forget: the actor will start this participant's
    /// grace-period clock.
    pub fn notify_disconnected(&self, user_id: Uuid) {
        let _ = self.tx.try_send(SessionCommand::Disconnected { user_id });
    }

    pub async fn submit(
        &self,
        user_id: Uuid,
        op_id: Uuid,
        base_sequence: u64,
        payload: serde_json::Value,
    ) -> Result<Operation, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Submit {
                user_id,
                op_id,
                base_sequence,
                payload,
                reply,
            })
            .await
            .map_err(|_| AppError::Gone)?;
        rx.await.map_err(|_| AppError::Gone)?
    }

    /// Operations the caller is missing since `since_sequence`, used to
    /// annotate an `op_rejected { code: "stale_base" }` frame so the
    /// client can rebase without a full resync.
    pub async fn ops_since(&self, since_sequence: u64) -> CatchUp {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SessionCommand::OpsSince { since_sequence, reply })
            .await
            .is_ok()
        {
            rx.await.unwrap_or(CatchUp::SnapshotRequired)
        } else {
            CatchUp::SnapshotRequired
        }
    }

    pub async fn request_presenter(&self, user_id: Uuid) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::RequestPresenter { user_id, reply })
            .await
            .map_err(|_| AppError::Gone)?;
        rx.await.map_err(|_| AppError::Gone)?
    }

    pub async fn respond_presenter_request(
        &self,
        responder_user_id: Uuid,
        requester_user_id: Uuid,
        grant: bool,
    ) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::RespondPresenterRequest {
                responder_user_id,
                requester_user_id,
                grant,
                reply,
            })
            .await
            .map_err(|_| AppError::Gone)?;
        rx.await.map_err(|_| AppError::Gone)?
    }

    pub async fn transfer_manager(
        &self,
        requested_by: Uuid,
        new_manager: Uuid,
    ) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::TransferManager {
                requested_by,
                new_manager,
                reply,
            })
            .await
            .map_err(|_| AppError::Gone)?;
        rx.await.map_err(|_| AppError::Gone)?
    }

    pub async fn describe(&self) -> Result<SessionDescriptor, AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Describe { reply })
            .await
            .map_err(|_| AppError::Gone)?;
        rx.await.map_err(|_| AppError::Gone)
    }

    /// Force-ends the session regardless of who else is still connected.
    /// `reply` resolves once the terminate command has been accepted
    /// into the queue, not once the actor has fully torn down — callers
    /// that need to observe the actual end should watch the registry.
    pub async fn terminate(&self, reason: impl Into<String>) -> Result<(), AppError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionCommand::Terminate {
                reason: reason.into(),
                reply,
            })
            .await
            .map_err(|_| AppError::Gone)?;
        rx.await.map_err(|_| AppError::Gone)
    }
}

struct Participant {
    email: String,
    permission: SessionPermission,
    outbound: Option<mpsc::Sender<ServerEnvelope>>,
    joined_at: u64,
    disconnected_at: Option<Instant>,
}

struct PendingPresenterRequest {
    requester_user_id: Uuid,
    requested_at: Instant,
}

struct SessionActor {
    session_id: Uuid,
    diagram_id: Uuid,
    threat_model_id: Uuid,
    session_manager: Uuid,
    presenter: Option<Uuid>,
    participants: HashMap<Uuid, Participant>,
    pending_presenter_request: Option<PendingPresenterRequest>,
    ring: VecDeque<Operation>,
    next_sequence: u64,
    config: Arc<SessionConfig>,
    registry: SessionRegistry,
    self_handle: SessionHandle,
    created_at: u64,
    idle_since: Option<Instant>,
    /// Set once the session has decided to end; `run` checks this after
    /// every command and stops draining once it's set.
    termination_reason: Option<String>,
}

impl SessionActor {
    fn new(
        session_id: Uuid,
        diagram_id: Uuid,
        threat_model_id: Uuid,
        config: Arc<SessionConfig>,
        registry: SessionRegistry,
        self_handle: SessionHandle,
    ) -> Self {
        Self {
            session_id,
            diagram_id,
            threat_model_id,
            session_manager: Uuid::nil(),
            presenter: None,
            participants: HashMap::new(),
            pending_presenter_request: None,
            ring: VecDeque::with_capacity(config.ring_buffer_size),
            next_sequence: 1,
            config,
            registry,
            self_handle,
            created_at: unix_now(),
            idle_since: Some(Instant::now()),
            termination_reason: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                    if self.termination_reason.is_some() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                    if self.termination_reason.is_none() && self.is_idle_expired() {
                        tracing::info!(session_id = %self.session_id, diagram_id = %self.diagram_id, "session idle timeout, terminating");
                        self.termination_reason = Some("idle_timeout".to_string());
                    }
                    if self.termination_reason.is_some() {
                        break;
                    }
                }
            }
        }
        let reason = self.termination_reason.clone().unwrap_or_else(|| "closed".to_string());
        self.shutdown(reason).await;
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join {
                user_id,
                email,
                permission,
                outbound,
                resume_from_sequence,
                reply,
            } => {
                let outcome = self
                    .handle_join(user_id, email, permission, outbound, resume_from_sequence)
                    .await;
                let _ = reply.send(outcome);
            }
            SessionCommand::Leave { user_id, reply } => {
                self.remove_participant(user_id, true).await;
                let _ = reply.send(());
            }
            SessionCommand::Disconnected { user_id } => {
                if let Some(p) = self.participants.get_mut(&user_id) {
                    p.outbound = None;
                    p.disconnected_at = Some(Instant::now());
                }
            }
            SessionCommand::Submit {
                user_id,
                op_id,
                base_sequence,
                payload,
                reply,
            } => {
                let result = self.handle_submit(user_id, op_id, base_sequence, payload).await;
                let _ = reply.send(result);
            }
            SessionCommand::OpsSince { since_sequence, reply } => {
                let _ = reply.send(self.catch_up_since(Some(since_sequence)));
            }
            SessionCommand::RequestPresenter { user_id, reply } => {
                let result = self.handle_request_presenter(user_id).await;
                let _ = reply.send(result);
            }
            SessionCommand::RespondPresenterRequest {
                responder_user_id,
                requester_user_id,
                grant,
                reply,
            } => {
                let result = self
                    .handle_respond_presenter_request(responder_user_id, requester_user_id, grant)
                    .await;
                let _ = reply.send(result);
            }
            SessionCommand::TransferManager {
                requested_by,
                new_manager,
                reply,
            } => {
                let result = self.handle_transfer_manager(requested_by, new_manager).await;
                let _ = reply.send(result);
            }
            SessionCommand::Describe { reply } => {
                let _ = reply.send(self.descriptor());
            }
            SessionCommand::Terminate { reason, reply } => {
                self.termination_reason = Some(reason);
                let _ = reply.send(());
            }
        }
    }

    async fn handle_join(
        &mut self,
        user_id: Uuid,
        email: String,
        permission: SessionPermission,
        outbound: Option<mpsc::Sender<ServerEnvelope>>,
        resume_from_sequence: Option<u64>,
    ) -> JoinOutcome {
        let is_new = !self.participants.contains_key(&user_id);
        if self.session_manager.is_nil() {
            self.session_manager = user_id;
        }

        let now = unix_now();
        let entry = self.participants.entry(user_id).or_insert_with(|| Participant {
            email: email.clone(),
            permission,
            outbound: None,
            joined_at: now,
            disconnected_at: None,
        });
        entry.email = email;
        entry.permission = permission;
        if let Some(sender) = outbound {
            entry.outbound = Some(sender);
            entry.disconnected_at = None;
        }

        if permission == SessionPermission::Writer && self.presenter.is_none() {
            self.presenter = Some(user_id);
        }

        if self.connected_count() > 0 {
            self.idle_since = None;
        }

        let catch_up = self.catch_up_since(resume_from_sequence);

        // A reconnect (the participant was already on the roster) never
        // re-emits `participant_joined` — only a genuinely new arrival
        // does.
        if is_new {
            self.broadcast_except(
                user_id,
                ServerEnvelope::new(
                    ServerMessageKind::ParticipantJoined,
                    json!({ "user_id": user_id }),
                ),
            )
            .await;
        }

        JoinOutcome {
            descriptor: self.descriptor(),
            catch_up,
        }
    }

    async fn remove_participant(&mut self, user_id: Uuid, broadcast: bool) {
        if self.participants.remove(&user_id).is_none() {
            return;
        }

        if self.session_manager == user_id {
            match self.longest_joined_writer() {
                Some(new_manager) => self.session_manager = new_manager,
                None => {
                    self.termination_reason
                        .get_or_insert_with(|| "no_remaining_writer".to_string());
                }
            }
        }
        if self.presenter == Some(user_id) {
            self.presenter = if self.termination_reason.is_some() {
                None
            } else {
                Some(self.session_manager)
            };
        }
        if let Some(pending) = &self.pending_presenter_request {
            if pending.requester_user_id == user_id {
                self.pending_presenter_request = None;
            }
        }
        if broadcast {
            self.broadcast_all(ServerEnvelope::new(
                ServerMessageKind::ParticipantLeft,
                json!({ "user_id": user_id }),
            ))
            .await;
        }
        if self.connected_count() == 0 {
            self.idle_since = Some(Instant::now());
        }
    }

    /// The remaining participant with writer permission who has been on
    /// the roster the longest, used to pick a new session_manager when
    /// the current one departs.
    fn longest_joined_writer(&self) -> Option<Uuid> {
        self.participants
            .iter()
            .filter(|(_, p)| p.permission == SessionPermission::Writer)
            .min_by_key(|(_, p)| p.joined_at)
            .map(|(uid, _)| *uid)
    }

    async fn handle_submit(
        &mut self,
        user_id: Uuid,
        op_id: Uuid,
        base_sequence: u64,
        payload: serde_json::Value,
    ) -> Result<Operation, AppError> {
        let permission = self.participants.get(&user_id).map(|p| p.permission);
        if permission != Some(SessionPermission::Writer) {
            return Err(AppError::Forbidden);
        }
        if self.presenter != Some(user_id) {
            return Err(AppError::NotPresenter);
        }
        if self.ring.iter().any(|op| op.op_id == op_id) {
            return Err(AppError::DuplicateOpId);
        }
        let current_head = self.next_sequence.saturating_sub(1);
        if base_sequence < current_head {
            return Err(AppError::StaleBase);
        }

        let server_sequence = self.next_sequence;
        self.next_sequence += 1;
        let op = Operation {
            op_id,
            client_sequence: base_sequence,
            server_sequence,
            author_user_id: user_id,
            payload,
            timestamp: unix_now(),
        };
        self.push_ring(op.clone());

        self.broadcast_all(
            ServerEnvelope::new(ServerMessageKind::OpApplied, op.payload.clone())
                .with_op_id(op_id)
                .with_server_sequence(server_sequence),
        )
        .await;

        Ok(op)
    }

    fn push_ring(&mut self, op: Operation) {
        if self.ring.len() >= self.config.ring_buffer_size {
            self.ring.pop_front();
        }
        self.ring.push_back(op);
    }

    fn catch_up_since(&self, resume_from_sequence: Option<u64>) -> CatchUp {
        let Some(seq) = resume_from_sequence else {
            return CatchUp::SnapshotRequired;
        };
        let current_head = self.next_sequence.saturating_sub(1);
        if seq >= current_head {
            return CatchUp::Operations(Vec::new());
        }
        match self.ring.front() {
            Some(oldest) if oldest.server_sequence <= seq + 1 => CatchUp::Operations(
                self.ring
                    .iter()
                    .filter(|op| op.server_sequence > seq)
                    .cloned()
                    .collect(),
            ),
            Some(_) => CatchUp::SnapshotRequired,
            None => CatchUp::Operations(Vec::new()),
        }
    }

    async fn handle_request_presenter(&mut self, user_id: Uuid) -> Result<(), AppError> {
        let permission = self.participants.get(&user_id).map(|p| p.permission);
        if permission != Some(SessionPermission::Writer) {
            return Err(AppError::Forbidden);
        }
        if self.presenter == Some(user_id) {
            return Ok(());
        }
        if self.pending_presenter_request.is_some() {
            return Err(AppError::Conflict);
        }
        self.pending_presenter_request = Some(PendingPresenterRequest {
            requester_user_id: user_id,
            requested_at: Instant::now(),
        });
        self.broadcast_all(ServerEnvelope::new(
            ServerMessageKind::PresenterRequested,
            json!({ "requester_user_id": user_id }),
        ))
        .await;
        Ok(())
    }

    /// `GrantPresenter`/`DenyPresenter`: only the session_manager may call
    /// this, and — unlike a bare approval of a pending `RequestPresenter` —
    /// it may target any writer participant directly, request pending or
    /// not. A matching pending request is cleared either way so a grant
    /// doesn't leave a stale request sitting around to auto-expire later.
    async fn handle_respond_presenter_request(
        &mut self,
        responder_user_id: Uuid,
        target_user_id: Uuid,
        grant: bool,
    ) -> Result<(), AppError> {
        if responder_user_id != self.session_manager {
            return Err(AppError::Forbidden);
        }
        let target_permission = self
            .participants
            .get(&target_user_id)
            .map(|p| p.permission)
            .ok_or(AppError::NotFound)?;

        if self
            .pending_presenter_request
            .as_ref()
            .is_some_and(|p| p.requester_user_id == target_user_id)
        {
            self.pending_presenter_request = None;
        }

        if !grant {
            return Ok(());
        }
        if target_permission != SessionPermission::Writer {
            return Err(AppError::Forbidden);
        }

        self.presenter = Some(target_user_id);
        self.broadcast_all(ServerEnvelope::new(
            ServerMessageKind::PresenterChanged,
            json!({ "presenter": target_user_id }),
        ))
        .await;
        Ok(())
    }

    async fn handle_transfer_manager(
        &mut self,
        requested_by: Uuid,
        new_manager: Uuid,
    ) -> Result<(), AppError> {
        if requested_by != self.session_manager {
            return Err(AppError::Forbidden);
        }
        if !self.participants.contains_key(&new_manager) {
            return Err(AppError::NotFound);
        }
        self.session_manager = new_manager;
        Ok(())
    }

    fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            session_id: self.session_id,
            threat_model_id: self.threat_model_id,
            diagram_id: self.diagram_id,
            session_manager: self.session_manager,
            presenter: self.presenter,
            participants: self
                .participants
                .iter()
                .map(|(uid, p)| ParticipantInfo {
                    user_id: *uid,
                    email: p.email.clone(),
                    permissions: p.permission,
                    joined_at: p.joined_at,
                })
                .collect(),
            created_at: self.created_at,
            current_sequence: self.next_sequence.saturating_sub(1),
        }
    }

    fn connected_count(&self) -> usize {
        self.participants
            .values()
            .filter(|p| p.outbound.is_some())
            .count()
    }

    async fn sweep(&mut self) {
        let grace = Duration::from_secs(self.config.grace_period_secs);
        let expired: Vec<Uuid> = self
            .participants
            .iter()
            .filter_map(|(uid, p)| {
                p.disconnected_at
                    .filter(|since| since.elapsed() >= grace)
                    .map(|_| *uid)
            })
            .collect();
        for uid in expired {
            tracing::debug!(session_id = %self.session_id, user_id = %uid, "grace period expired, dropping participant");
            self.remove_participant(uid, true).await;
        }

        let req_timeout = Duration::from_secs(self.config.request_timeout_secs);
        if let Some(pending) = &self.pending_presenter_request {
            if pending.requested_at.elapsed() >= req_timeout {
                let requester = pending.requester_user_id;
                self.pending_presenter_request = None;
                tracing::debug!(session_id = %self.session_id, user_id = %requester, "presenter request auto-expired");
            }
        }
    }

    fn is_idle_expired(&self) -> bool {
        match self.idle_since {
            Some(since) => since.elapsed() >= Duration::from_secs(self.config.idle_timeout_secs),
            None => false,
        }
    }

    async fn shutdown(mut self, reason: String) {
        let participants: Vec<Uuid> = self.participants.keys().copied().collect();
        for uid in participants {
            self.remove_participant(uid, false).await;
        }
        self.broadcast_all(ServerEnvelope::new(
            ServerMessageKind::SessionEnded,
            json!({ "reason": reason }),
        ))
        .await;
        registry::remove_session_if_current(&self.registry, self.diagram_id, &self.self_handle)
            .await;
    }

    async fn broadcast_all(&self, envelope: ServerEnvelope) {
        for participant in self.participants.values() {
            if let Some(outbound) = &participant.outbound {
                if outbound.try_send(envelope.clone()).is_err() {
                    tracing::warn!(session_id = %self.session_id, "outbound queue full or closed, dropping frame for a participant");
                }
            }
        }
    }

    async fn broadcast_except(&self, except: Uuid, envelope: ServerEnvelope) {
        for (uid, participant) in &self.participants {
            if *uid == except {
                continue;
            }
            if let Some(outbound) = &participant.outbound {
                if outbound.try_send(envelope.clone()).is_err() {
                    tracing::warn!(session_id = %self.session_id, "outbound queue full or closed, dropping frame for a participant");
                }
            }
        }
    }
}
