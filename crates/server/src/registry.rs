//! The process-wide table of live collaboration sessions, keyed by
//! diagram. Mirrors the teacher's channel registry: a single
//! `RwLock<HashMap<..>>` guarding handles to per-diagram actors, with
//! reads taking the read lock and only creation/removal taking the
//! write lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tmi_common::SessionConfig;
use uuid::Uuid;

use crate::session::SessionHandle;

/// Registry of active collaboration sessions, keyed by diagram ID. Only
/// one session may be open per diagram at a time.
pub type SessionRegistry = Arc<RwLock<HashMap<Uuid, SessionHandle>>>;

pub fn new_session_registry() -> SessionRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Look up the session for `diagram_id`, if one is currently live.
pub async fn get_session(registry: &SessionRegistry, diagram_id: Uuid) -> Option<SessionHandle> {
    registry.read().await.get(&diagram_id).cloned()
}

/// Returns the live session for `diagram_id`, spawning a fresh one under
/// the same write-lock critical section if none exists yet — the atomic
/// check-then-insert used by the `collaborate` create REST handler. The
/// returned `bool` is `true` when this call spawned the session.
pub async fn get_or_create(
    registry: &SessionRegistry,
    diagram_id: Uuid,
    threat_model_id: Uuid,
    config: Arc<SessionConfig>,
) -> (SessionHandle, bool) {
    let mut sessions = registry.write().await;
    if let Some(existing) = sessions.get(&diagram_id) {
        return (existing.clone(), false);
    }
    let handle = SessionHandle::spawn(
        Uuid::new_v4(),
        diagram_id,
        threat_model_id,
        config,
        registry.clone(),
    );
    sessions.insert(diagram_id, handle.clone());
    (handle, true)
}

/// Remove a session's registry entry, but only if it still matches
/// `handle` — guards against a freshly-created session being evicted by a
/// stale removal race from the session that just terminated.
pub async fn remove_session_if_current(
    registry: &SessionRegistry,
    diagram_id: Uuid,
    handle: &SessionHandle,
) {
    let mut sessions = registry.write().await;
    if let Some(current) = sessions.get(&diagram_id) {
        if current.is_same_actor(handle) {
            sessions.remove(&diagram_id);
        }
    }
}

/// All live sessions, for `GET /collaboration/sessions`.
pub async fn all_sessions(registry: &SessionRegistry) -> Vec<SessionHandle> {
    registry.read().await.values().cloned().collect()
}

/// Tells every live session to end, tagging the `session_ended` broadcast
/// with `reason` (the WebSocket layer maps this to a close code). Used by
/// the server's graceful shutdown sequence; unlike the former central
/// stale-session reaper, per-session idle timeout is handled by each
/// actor's own ticker and never goes through here.
pub async fn terminate_all(registry: &SessionRegistry, reason: &str) {
    for handle in all_sessions(registry).await {
        let _ = handle.terminate(reason.to_string()).await;
    }
}

/// Polls until the registry has drained, for bounding graceful shutdown
/// to a deadline with `tokio::time::timeout`.
pub async fn wait_until_drained(registry: &SessionRegistry) {
    loop {
        if registry.read().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmi_common::SessionConfig;

    #[tokio::test]
    async fn get_or_create_then_get_round_trips() {
        let registry = new_session_registry();
        let diagram_id = Uuid::new_v4();
        let (handle, created) =
            get_or_create(&registry, diagram_id, Uuid::new_v4(), Arc::new(SessionConfig::default())).await;
        assert!(created);
        assert!(get_session(&registry, diagram_id).await.is_some());
        drop(handle);
    }

    #[tokio::test]
    async fn missing_diagram_returns_none() {
        let registry = new_session_registry();
        assert!(get_session(&registry, Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn remove_if_current_ignores_stale_handle() {
        let registry = new_session_registry();
        let diagram_id = Uuid::new_v4();
        let config = Arc::new(SessionConfig::default());
        let (first, created) = get_or_create(&registry, diagram_id, Uuid::new_v4(), config.clone()).await;
        assert!(created);

        // Simulate a reborn session for the same diagram by spawning a
        // second actor directly and overwriting the registry entry.
        let second = SessionHandle::spawn(Uuid::new_v4(), diagram_id, Uuid::new_v4(), config, registry.clone());
        registry.write().await.insert(diagram_id, second.clone());

        remove_session_if_current(&registry, diagram_id, &first).await;
        assert!(get_session(&registry, diagram_id).await.is_some());

        remove_session_if_current(&registry, diagram_id, &second).await;
        assert!(get_session(&registry, diagram_id).await.is_none());
    }
}
