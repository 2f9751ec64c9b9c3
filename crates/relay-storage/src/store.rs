//! The message store contract shared by every driver.

use async_trait::async_trait;

use crate::types::*;
use crate::StorageResult;

/// Persistence for messages, sessions, agent summaries and delivery
/// sequences.
///
/// The store is the single authority for these records; callers never keep
/// copies they are not prepared to treat as stale. `save_message` and
/// `start_session` are upserts keyed by id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Prepare the backend (create files, schema, load state).
    async fn init(&self) -> StorageResult<()>;

    async fn health_check(&self) -> HealthReport;

    async fn save_message(&self, message: &StoredMessage) -> StorageResult<()>;

    async fn get_messages(&self, query: &MessageQuery) -> StorageResult<Vec<StoredMessage>>;

    async fn get_message_by_id(&self, id: &str) -> StorageResult<Option<StoredMessage>>;

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> StorageResult<()>;

    /// Number of messages whose thread is `id`. Derived, never stored.
    async fn reply_count(&self, id: &str) -> StorageResult<u64>;

    async fn start_session(&self, session: &StoredSession) -> StorageResult<()>;

    async fn end_session(
        &self,
        session_id: &str,
        ended_at: u64,
        closed_by: ClosedBy,
    ) -> StorageResult<()>;

    async fn increment_session_messages(&self, session_id: &str) -> StorageResult<()>;

    async fn get_session_by_resume_token(&self, token: &str)
        -> StorageResult<Option<StoredSession>>;

    async fn get_recent_sessions(&self, limit: usize) -> StorageResult<Vec<StoredSession>>;

    async fn upsert_agent_summary(&self, summary: &AgentSummary) -> StorageResult<()>;

    async fn get_agent_summary(&self, agent_name: &str) -> StorageResult<Option<AgentSummary>>;

    /// Unread messages addressed to `agent` that were either never delivered
    /// or delivered within `session_id`, ordered by `(delivery_seq ?? 0, ts)`.
    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StoredMessage>>;

    /// Highest delivered sequence per (topic, peer) for messages addressed
    /// to `agent`, optionally restricted to one delivery session.
    async fn get_max_seq_by_stream(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StreamSeq>>;

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Deterministic replay order: `(delivery_seq ?? 0, ts)`.
pub(crate) fn sort_for_replay(messages: &mut [StoredMessage]) {
    messages.sort_by(|a, b| {
        a.delivery_seq
            .unwrap_or(0)
            .cmp(&b.delivery_seq.unwrap_or(0))
            .then(a.ts.cmp(&b.ts))
    });
}
