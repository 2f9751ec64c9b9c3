//! Driver selection with graceful degradation.
//!
//! The daemon never refuses to start over storage: the configured driver is
//! tried first, then the append-only JSONL directory, then the capped memory
//! store. Whatever was skipped is reported through `health_check().error`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::jsonl::JsonlStore;
use crate::memory::InMemoryStore;
use crate::sqlite::SqliteStore;
use crate::store::MessageStore;
use crate::types::*;
use crate::StorageResult;

pub const SQLITE_FILE: &str = "relay.db";
pub const JSONL_DIR: &str = "jsonl";

/// `[storage]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOptions {
    pub driver: StorageDriver,
    /// Data directory. SQLite lives at `<path>/relay.db`, JSONL under
    /// `<path>/jsonl/`.
    pub path: PathBuf,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Sqlite,
            path: PathBuf::from(".agent-relay"),
        }
    }
}

impl StorageOptions {
    pub fn sqlite_path(&self) -> PathBuf {
        self.path.join(SQLITE_FILE)
    }

    pub fn jsonl_dir(&self) -> PathBuf {
        self.path.join(JSONL_DIR)
    }
}

fn remediation(driver: &str) -> &'static str {
    match driver {
        "sqlite" => "check that the database file is writable and not locked, or set [storage].driver = \"jsonl\"",
        "jsonl" => "check that the data directory exists and is writable",
        _ => "check the [storage] configuration",
    }
}

/// Open the store described by `options`, degrading as needed.
pub async fn open_store(options: &StorageOptions) -> Arc<dyn MessageStore> {
    let mut chain: Vec<Arc<dyn MessageStore>> = Vec::new();
    if options.driver == StorageDriver::Sqlite {
        chain.push(Arc::new(SqliteStore::new(options.sqlite_path())));
    }
    if options.driver != StorageDriver::Memory {
        chain.push(Arc::new(JsonlStore::new(options.jsonl_dir())));
    }
    open_with_fallback(chain).await
}

/// Initialize each candidate in order and return the first that succeeds.
/// An in-memory store is always the final candidate.
pub async fn open_with_fallback(chain: Vec<Arc<dyn MessageStore>>) -> Arc<dyn MessageStore> {
    let mut failures: Vec<String> = Vec::new();

    for store in chain {
        let driver = store.health_check().await.driver;
        match store.init().await {
            Ok(()) => {
                if failures.is_empty() {
                    return store;
                }
                tracing::warn!(driver = %driver, "Storage degraded to fallback driver");
                return Arc::new(DegradedStore::new(store, failures.join("; ")));
            }
            Err(e) => {
                tracing::warn!(driver = %driver, error = %e, "Storage driver failed to initialize");
                failures.push(format!(
                    "{driver} unavailable ({e}): {}",
                    remediation(&driver)
                ));
            }
        }
    }

    let memory: Arc<dyn MessageStore> = Arc::new(InMemoryStore::new());
    if failures.is_empty() {
        return memory;
    }
    tracing::warn!(
        cap = crate::memory::MEMORY_MESSAGE_CAP,
        "All durable storage failed; messages are kept in memory only"
    );
    failures.push(format!(
        "running in memory, only the last {} messages are kept and nothing survives a restart",
        crate::memory::MEMORY_MESSAGE_CAP
    ));
    Arc::new(DegradedStore::new(memory, failures.join("; ")))
}

/// A working store that reports why the preferred drivers were skipped.
pub struct DegradedStore {
    inner: Arc<dyn MessageStore>,
    reason: String,
}

impl DegradedStore {
    pub fn new(inner: Arc<dyn MessageStore>, reason: impl Into<String>) -> Self {
        Self {
            inner,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl MessageStore for DegradedStore {
    async fn init(&self) -> StorageResult<()> {
        self.inner.init().await
    }

    async fn health_check(&self) -> HealthReport {
        let mut report = self.inner.health_check().await;
        report.error = Some(match report.error.take() {
            Some(inner) => format!("{}; {inner}", self.reason),
            None => self.reason.clone(),
        });
        report
    }

    async fn save_message(&self, message: &StoredMessage) -> StorageResult<()> {
        self.inner.save_message(message).await
    }

    async fn get_messages(&self, query: &MessageQuery) -> StorageResult<Vec<StoredMessage>> {
        self.inner.get_messages(query).await
    }

    async fn get_message_by_id(&self, id: &str) -> StorageResult<Option<StoredMessage>> {
        self.inner.get_message_by_id(id).await
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> StorageResult<()> {
        self.inner.update_message_status(id, status).await
    }

    async fn reply_count(&self, id: &str) -> StorageResult<u64> {
        self.inner.reply_count(id).await
    }

    async fn start_session(&self, session: &StoredSession) -> StorageResult<()> {
        self.inner.start_session(session).await
    }

    async fn end_session(
        &self,
        session_id: &str,
        ended_at: u64,
        closed_by: ClosedBy,
    ) -> StorageResult<()> {
        self.inner.end_session(session_id, ended_at, closed_by).await
    }

    async fn increment_session_messages(&self, session_id: &str) -> StorageResult<()> {
        self.inner.increment_session_messages(session_id).await
    }

    async fn get_session_by_resume_token(
        &self,
        token: &str,
    ) -> StorageResult<Option<StoredSession>> {
        self.inner.get_session_by_resume_token(token).await
    }

    async fn get_recent_sessions(&self, limit: usize) -> StorageResult<Vec<StoredSession>> {
        self.inner.get_recent_sessions(limit).await
    }

    async fn upsert_agent_summary(&self, summary: &AgentSummary) -> StorageResult<()> {
        self.inner.upsert_agent_summary(summary).await
    }

    async fn get_agent_summary(&self, agent_name: &str) -> StorageResult<Option<AgentSummary>> {
        self.inner.get_agent_summary(agent_name).await
    }

    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StoredMessage>> {
        self.inner
            .get_pending_messages_for_session(agent, session_id)
            .await
    }

    async fn get_max_seq_by_stream(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StreamSeq>> {
        self.inner.get_max_seq_by_stream(agent, session_id).await
    }

    async fn close(&self) -> StorageResult<()> {
        self.inner.close().await
    }
}
