//! Live sessions by call id.
//!
//! The gateway inserts a session when the invite arrives and the session
//! removes itself when it closes. The call-control adapter looks up a
//! session's outbound media here when it answers the call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use dialbridge_common::MediaStream;

use crate::session::SessionHandle;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. An existing entry with the same id is replaced.
    pub async fn insert(&self, handle: SessionHandle) {
        let id = handle.id().to_string();
        if self.sessions.write().await.insert(id.clone(), handle).is_some() {
            tracing::warn!(session = %id, "Replaced existing session with the same call id");
        }
    }

    pub async fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.write().await.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Outbound media for the call with `id`.
    pub async fn media(&self, id: &str) -> Option<MediaStream> {
        self.sessions.read().await.get(id).map(SessionHandle::output)
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
