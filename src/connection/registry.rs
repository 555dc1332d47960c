//! Explicit lifecycle registry for connection actors.
//!
//! Connections report open/close to a [`Registry`] value shared by `Arc`,
//! so a server can enumerate live sessions (e.g. for a shutdown sweep)
//! without any process-wide mutable state.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

/// Identifier of one connection within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Tracks the set of live sessions.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    live: Mutex<HashSet<SessionId>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Registry::default()
    }

    fn live(&self) -> MutexGuard<'_, HashSet<SessionId>> {
        match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A connection opened; allocate its id and mark it live.
    pub fn session_opened(&self) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.live().insert(id);
        id
    }

    /// A connection reached its terminal state. Idempotent.
    pub fn session_closed(&self, id: SessionId) {
        self.live().remove(&id);
    }

    /// Number of live sessions.
    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    /// Whether the given session is still live.
    pub fn is_live(&self, id: SessionId) -> bool {
        self.live().contains(&id)
    }

    /// Snapshot of the live session ids.
    pub fn live_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.live().iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}
