use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use grouptab_protocol::SessionId;

use crate::session::SessionSnapshot;

/// Durable snapshot storage, keyed by session ID. The engine writes a
/// snapshot after every successful mutation and reads one back on
/// restore; everything else (retention windows, backends, encryption) is
/// the persistence collaborator's business.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, snapshot: &SessionSnapshot) -> Result<()>;
    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>>;
    async fn delete(&self, session_id: &str) -> Result<()>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<SessionId, SessionSnapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put(&self, snapshot: &SessionSnapshot) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        Ok(self.entries.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.entries.write().await.remove(session_id);
        Ok(())
    }
}
