//! In-memory session store
//!
//! Live sessions keyed by id. All lookup is by id; nothing iterates the
//! map. Removal is idempotent and hands the full session (including its
//! destroy callback) back to the caller.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tollgate_crypto::Address;

use crate::{Session, SessionId};

/// Callback-free view of a stored session
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub consumer_id: Address,
    pub last: bool,
}

/// Map of live sessions under a single lock
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SessionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session
    pub async fn add(&self, session: Session) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id.clone(), session);
    }

    /// Look up a session by id
    pub async fn find(&self, id: &SessionId) -> Option<SessionRecord> {
        let sessions = self.sessions.lock().await;
        sessions.get(id).map(|s| SessionRecord {
            id: s.id.clone(),
            consumer_id: s.consumer_id,
            last: s.last,
        })
    }

    /// Whether a session with this id exists
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }

    /// Number of live sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Remove a session, returning it; `None` if already gone
    pub async fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.lock().await.remove(id)
    }
}
