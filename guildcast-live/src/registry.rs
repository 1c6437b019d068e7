//! Authoritative record of what is currently live, keyed by room id.
//!
//! The registry is an owned object constructed at server startup (and
//! fresh per test), not process-global state. The worker process itself
//! is owned by its supervisor task; the registry entry holds the only
//! control handle to it, so nothing else can feed or kill a worker
//! except through the relay.

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use guildcast_core::models::RoomId;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{LiveError, Result};

/// Identifies one signaling connection (one browser tab).
pub type ConnectionId = String;

/// Control handle for a live session. Cloning is cheap; all clones
/// drive the same supervisor task.
#[derive(Clone)]
pub struct SessionHandle {
    /// The signaling connection authorized to feed this room; its
    /// disconnect tears the session down.
    pub connection_id: ConnectionId,
    /// Best-effort chunk path into the worker's stdin.
    pub(crate) chunk_tx: mpsc::Sender<Bytes>,
    /// Requests the two-phase graceful shutdown.
    pub(crate) stop: CancellationToken,
    /// Requests immediate termination (process shutdown sweep).
    pub(crate) kill: CancellationToken,
    /// Flips to true once the supervisor has cleaned up.
    pub(crate) done: watch::Receiver<bool>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

/// Process-wide map from room id to the active session. No
/// persistence: a restart loses all sessions, and any room the
/// registry does not know about is not live, stale segment files on
/// disk notwithstanding.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<RoomId, SessionHandle>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. At most one live session per room: an
    /// occupied entry rejects with `AlreadyActive` and is left
    /// untouched.
    pub fn register(&self, room_id: RoomId, handle: SessionHandle) -> Result<()> {
        match self.sessions.entry(room_id) {
            Entry::Occupied(occupied) => Err(LiveError::AlreadyActive(occupied.key().clone())),
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                Ok(())
            }
        }
    }

    /// Look up the handle for a room; never blocks.
    #[must_use]
    pub fn lookup(&self, room_id: &RoomId) -> Option<SessionHandle> {
        self.sessions.get(room_id).map(|entry| entry.clone())
    }

    /// Remove a room's session. Idempotent: removing an unknown room
    /// is a no-op, not an error.
    pub fn unregister(&self, room_id: &RoomId) -> Option<SessionHandle> {
        self.sessions.remove(room_id).map(|(_, handle)| handle)
    }

    /// All rooms whose originating connection matches. Linear scan:
    /// only the disconnect path calls this, so O(n) beats carrying a
    /// second index.
    #[must_use]
    pub fn find_by_connection(&self, connection_id: &str) -> Vec<RoomId> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().connection_id == connection_id)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of currently live rooms (shutdown sweep).
    #[must_use]
    pub fn rooms(&self) -> Vec<RoomId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_handle(connection_id: &str) -> SessionHandle {
    let (chunk_tx, _chunk_rx) = mpsc::channel(4);
    let (_done_tx, done) = watch::channel(false);
    SessionHandle {
        connection_id: connection_id.to_string(),
        chunk_tx,
        stop: CancellationToken::new(),
        kill: CancellationToken::new(),
        done,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: &str) -> RoomId {
        RoomId::from_string(id.to_string())
    }

    #[test]
    fn test_register_then_duplicate_fails() {
        let registry = SessionRegistry::new();

        registry.register(room("r1"), test_handle("c1")).unwrap();
        let err = registry
            .register(room("r1"), test_handle("c2"))
            .unwrap_err();
        assert!(matches!(err, LiveError::AlreadyActive(r) if r.as_str() == "r1"));

        // The original entry is untouched.
        let handle = registry.lookup(&room("r1")).unwrap();
        assert_eq!(handle.connection_id, "c1");
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = SessionRegistry::new();

        registry.register(room("r1"), test_handle("c1")).unwrap();
        assert!(registry.unregister(&room("r1")).is_some());
        assert!(registry.unregister(&room("r1")).is_none());
        assert!(registry.unregister(&room("never-lived")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_after_unregister_succeeds() {
        let registry = SessionRegistry::new();

        registry.register(room("r1"), test_handle("c1")).unwrap();
        registry.unregister(&room("r1"));
        registry.register(room("r1"), test_handle("c2")).unwrap();
        assert_eq!(registry.lookup(&room("r1")).unwrap().connection_id, "c2");
    }

    #[test]
    fn test_find_by_connection() {
        let registry = SessionRegistry::new();

        registry.register(room("r1"), test_handle("c1")).unwrap();
        registry.register(room("r2"), test_handle("c1")).unwrap();
        registry.register(room("r3"), test_handle("c2")).unwrap();

        let mut rooms = registry.find_by_connection("c1");
        rooms.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(rooms.len(), 2);
        assert_eq!(rooms[0].as_str(), "r1");
        assert_eq!(rooms[1].as_str(), "r2");

        assert!(registry.find_by_connection("c9").is_empty());
    }

    #[test]
    fn test_lookup_unknown_room() {
        let registry = SessionRegistry::new();
        assert!(registry.lookup(&room("r1")).is_none());
    }
}
