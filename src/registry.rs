//! Process-wide session registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{lock_err, ExecutionError, ProgResult};
use crate::session::Session;

/// Session identifier. Allocated once and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Wraps a raw identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Map of live sessions with collision-free id allocation.
#[derive(Debug)]
pub struct SessionRegistry {
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// An empty registry. The first allocated id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Reserves a fresh id. Ids of sessions that fail to build are not reused.
    pub fn allocate_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Adds a session under its own id.
    pub fn insert(&self, session: Session) -> ProgResult<()> {
        let mut sessions = self.sessions.write().map_err(|_| lock_err("registry.sessions"))?;
        sessions.insert(session.id(), session);
        Ok(())
    }

    /// Looks up a live session.
    pub fn get(&self, id: SessionId) -> ProgResult<Session> {
        let sessions = self.sessions.read().map_err(|_| lock_err("registry.sessions"))?;
        sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| ExecutionError::SessionNotFound { id }.into())
    }

    /// Removes and ends a session. Its background jobs are detached, not awaited.
    pub fn remove(&self, id: SessionId) -> ProgResult<Session> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| lock_err("registry.sessions"))?
            .remove(&id);
        let session = removed.ok_or(ExecutionError::SessionNotFound { id })?;
        session.end();
        Ok(session)
    }

    /// Ids of live sessions, ascending.
    pub fn ids(&self) -> ProgResult<Vec<SessionId>> {
        let sessions = self.sessions.read().map_err(|_| lock_err("registry.sessions"))?;
        let mut ids: Vec<SessionId> = sessions.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Number of live sessions.
    pub fn len(&self) -> ProgResult<usize> {
        Ok(self.sessions.read().map_err(|_| lock_err("registry.sessions"))?.len())
    }

    /// True when no session is live.
    pub fn is_empty(&self) -> ProgResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Ends and removes every session.
    pub fn clear(&self) -> ProgResult<()> {
        let drained: Vec<Session> = self
            .sessions
            .write()
            .map_err(|_| lock_err("registry.sessions"))?
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in &drained {
            session.end();
        }
        Ok(())
    }
}
