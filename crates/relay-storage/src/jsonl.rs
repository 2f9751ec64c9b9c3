//! Append-only JSON-lines driver.
//!
//! Layout under the store directory:
//!
//! ```text
//! messages.jsonl   one StoredMessage per line
//! sessions.jsonl   one StoredSession per line
//! agents.jsonl     one AgentSummary per line
//! ```
//!
//! Every mutation appends the full updated record. On load, later lines for
//! the same id replace earlier ones, so status changes and session ends are
//! just newer copies of the record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::index::MemoryIndex;
use crate::store::MessageStore;
use crate::types::*;
use crate::{StorageError, StorageResult};

const MESSAGES_FILE: &str = "messages.jsonl";
const SESSIONS_FILE: &str = "sessions.jsonl";
const AGENTS_FILE: &str = "agents.jsonl";

pub struct JsonlStore {
    dir: PathBuf,
    index: RwLock<MemoryIndex>,
    initialized: RwLock<bool>,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            index: RwLock::new(MemoryIndex::new(None)),
            initialized: RwLock::new(false),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_initialized(&self) -> StorageResult<()> {
        if *self.initialized.read().await {
            Ok(())
        } else {
            Err(StorageError::NotInitialized(self.dir.display().to_string()))
        }
    }

    async fn append<T: Serialize>(&self, file: &str, record: &T) -> StorageResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))
            .await?;
        handle.write_all(line.as_bytes()).await?;
        handle.flush().await?;
        Ok(())
    }

    async fn load<T: DeserializeOwned>(&self, file: &str) -> StorageResult<Vec<T>> {
        let path = self.dir.join(file);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                // A torn final write leaves a partial line; skip it.
                Err(e) => tracing::warn!(
                    file = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable JSONL record"
                ),
            }
        }
        Ok(records)
    }

    /// Check that the directory accepts writes.
    async fn check_writable(&self) -> bool {
        let marker = self.dir.join(".write-check");
        let ok = tokio::fs::write(&marker, b"ok").await.is_ok();
        let _ = tokio::fs::remove_file(&marker).await;
        ok
    }
}

#[async_trait]
impl MessageStore for JsonlStore {
    async fn init(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let messages: Vec<StoredMessage> = self.load(MESSAGES_FILE).await?;
        let sessions: Vec<StoredSession> = self.load(SESSIONS_FILE).await?;
        let agents: Vec<AgentSummary> = self.load(AGENTS_FILE).await?;

        let mut index = MemoryIndex::new(None);
        for m in messages {
            index.upsert_message(m);
        }
        for s in sessions {
            index.upsert_session(s);
        }
        for a in agents {
            index.upsert_agent(a);
        }

        tracing::info!(
            dir = %self.dir.display(),
            messages = index.message_count(),
            "JSONL store loaded"
        );
        *self.index.write().await = index;
        *self.initialized.write().await = true;
        Ok(())
    }

    async fn health_check(&self) -> HealthReport {
        let initialized = *self.initialized.read().await;
        let can_write = initialized && self.check_writable().await;
        HealthReport {
            persistent: true,
            driver: StorageDriver::Jsonl.as_str().to_string(),
            can_read: initialized,
            can_write,
            error: if can_write {
                None
            } else {
                Some(format!(
                    "JSONL directory {} is not writable; check permissions or point [storage].path elsewhere",
                    self.dir.display()
                ))
            },
        }
    }

    async fn save_message(&self, message: &StoredMessage) -> StorageResult<()> {
        self.ensure_initialized().await?;
        self.append(MESSAGES_FILE, message).await?;
        self.index.write().await.upsert_message(message.clone());
        Ok(())
    }

    async fn get_messages(&self, query: &MessageQuery) -> StorageResult<Vec<StoredMessage>> {
        self.ensure_initialized().await?;
        Ok(self.index.read().await.query(query))
    }

    async fn get_message_by_id(&self, id: &str) -> StorageResult<Option<StoredMessage>> {
        self.ensure_initialized().await?;
        Ok(self.index.read().await.get_message(id).cloned())
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> StorageResult<()> {
        self.ensure_initialized().await?;
        let updated = self.index.write().await.set_status(id, status);
        if let Some(message) = updated {
            self.append(MESSAGES_FILE, &message).await?;
        }
        Ok(())
    }

    async fn reply_count(&self, id: &str) -> StorageResult<u64> {
        self.ensure_initialized().await?;
        Ok(self.index.read().await.reply_count(id))
    }

    async fn start_session(&self, session: &StoredSession) -> StorageResult<()> {
        self.ensure_initialized().await?;
        self.append(SESSIONS_FILE, session).await?;
        self.index.write().await.upsert_session(session.clone());
        Ok(())
    }

    async fn end_session(
        &self,
        session_id: &str,
        ended_at: u64,
        closed_by: ClosedBy,
    ) -> StorageResult<()> {
        self.ensure_initialized().await?;
        let updated = {
            let mut index = self.index.write().await;
            index.session_mut(session_id).map(|s| {
                s.ended_at = Some(ended_at);
                s.closed_by = Some(closed_by);
                s.clone()
            })
        };
        if let Some(session) = updated {
            self.append(SESSIONS_FILE, &session).await?;
        }
        Ok(())
    }

    async fn increment_session_messages(&self, session_id: &str) -> StorageResult<()> {
        self.ensure_initialized().await?;
        let updated = {
            let mut index = self.index.write().await;
            index.session_mut(session_id).map(|s| {
                s.message_count += 1;
                s.clone()
            })
        };
        if let Some(session) = updated {
            self.append(SESSIONS_FILE, &session).await?;
        }
        Ok(())
    }

    async fn get_session_by_resume_token(
        &self,
        token: &str,
    ) -> StorageResult<Option<StoredSession>> {
        self.ensure_initialized().await?;
        Ok(self.index.read().await.session_by_resume_token(token))
    }

    async fn get_recent_sessions(&self, limit: usize) -> StorageResult<Vec<StoredSession>> {
        self.ensure_initialized().await?;
        Ok(self.index.read().await.recent_sessions(limit))
    }

    async fn upsert_agent_summary(&self, summary: &AgentSummary) -> StorageResult<()> {
        self.ensure_initialized().await?;
        self.append(AGENTS_FILE, summary).await?;
        self.index.write().await.upsert_agent(summary.clone());
        Ok(())
    }

    async fn get_agent_summary(&self, agent_name: &str) -> StorageResult<Option<AgentSummary>> {
        self.ensure_initialized().await?;
        Ok(self.index.read().await.agent(agent_name))
    }

    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StoredMessage>> {
        self.ensure_initialized().await?;
        Ok(self.index.read().await.pending_for_session(agent, session_id))
    }

    async fn get_max_seq_by_stream(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StreamSeq>> {
        self.ensure_initialized().await?;
        Ok(self.index.read().await.max_seq_by_stream(agent, session_id))
    }
}
