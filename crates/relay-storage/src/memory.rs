//! Capped, non-persistent driver. Last stop of the fallback chain.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::index::MemoryIndex;
use crate::store::MessageStore;
use crate::types::*;
use crate::StorageResult;

/// Messages retained by [`InMemoryStore`] before the oldest are dropped.
pub const MEMORY_MESSAGE_CAP: usize = 1000;

/// In-process store holding at most [`MEMORY_MESSAGE_CAP`] messages.
pub struct InMemoryStore {
    index: RwLock<MemoryIndex>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_cap(MEMORY_MESSAGE_CAP)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            index: RwLock::new(MemoryIndex::new(Some(cap))),
        }
    }

    pub async fn message_count(&self) -> usize {
        self.index.read().await.message_count()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn health_check(&self) -> HealthReport {
        HealthReport {
            persistent: false,
            driver: StorageDriver::Memory.as_str().to_string(),
            can_read: true,
            can_write: true,
            error: None,
        }
    }

    async fn save_message(&self, message: &StoredMessage) -> StorageResult<()> {
        self.index.write().await.upsert_message(message.clone());
        Ok(())
    }

    async fn get_messages(&self, query: &MessageQuery) -> StorageResult<Vec<StoredMessage>> {
        Ok(self.index.read().await.query(query))
    }

    async fn get_message_by_id(&self, id: &str) -> StorageResult<Option<StoredMessage>> {
        Ok(self.index.read().await.get_message(id).cloned())
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> StorageResult<()> {
        self.index.write().await.set_status(id, status);
        Ok(())
    }

    async fn reply_count(&self, id: &str) -> StorageResult<u64> {
        Ok(self.index.read().await.reply_count(id))
    }

    async fn start_session(&self, session: &StoredSession) -> StorageResult<()> {
        self.index.write().await.upsert_session(session.clone());
        Ok(())
    }

    async fn end_session(
        &self,
        session_id: &str,
        ended_at: u64,
        closed_by: ClosedBy,
    ) -> StorageResult<()> {
        if let Some(session) = self.index.write().await.session_mut(session_id) {
            session.ended_at = Some(ended_at);
            session.closed_by = Some(closed_by);
        }
        Ok(())
    }

    async fn increment_session_messages(&self, session_id: &str) -> StorageResult<()> {
        if let Some(session) = self.index.write().await.session_mut(session_id) {
            session.message_count += 1;
        }
        Ok(())
    }

    async fn get_session_by_resume_token(
        &self,
        token: &str,
    ) -> StorageResult<Option<StoredSession>> {
        Ok(self.index.read().await.session_by_resume_token(token))
    }

    async fn get_recent_sessions(&self, limit: usize) -> StorageResult<Vec<StoredSession>> {
        Ok(self.index.read().await.recent_sessions(limit))
    }

    async fn upsert_agent_summary(&self, summary: &AgentSummary) -> StorageResult<()> {
        self.index.write().await.upsert_agent(summary.clone());
        Ok(())
    }

    async fn get_agent_summary(&self, agent_name: &str) -> StorageResult<Option<AgentSummary>> {
        Ok(self.index.read().await.agent(agent_name))
    }

    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StoredMessage>> {
        Ok(self.index.read().await.pending_for_session(agent, session_id))
    }

    async fn get_max_seq_by_stream(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StreamSeq>> {
        Ok(self.index.read().await.max_seq_by_stream(agent, session_id))
    }
}
