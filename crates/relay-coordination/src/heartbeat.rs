//! The acting leader's liveness record.
//!
//! The coordinator rewrites this record on a fixed interval; watchdogs poll
//! it. Where it lives is up to the [`HeartbeatStore`].

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::CoordinationResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadHeartbeat {
    pub lead_name: String,
    pub lead_id: String,
    /// Epoch milliseconds of the write.
    pub timestamp: u64,
    pub active_task_count: usize,
    pub assigned_agents: Vec<String>,
}

impl LeadHeartbeat {
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }
}

#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// The current record, if any leader has ever written one.
    async fn read(&self) -> CoordinationResult<Option<LeadHeartbeat>>;

    async fn write(&self, heartbeat: &LeadHeartbeat) -> CoordinationResult<()>;
}

/// JSON document on disk, replaced atomically with temp file + rename.
pub struct FileHeartbeatStore {
    path: PathBuf,
}

impl FileHeartbeatStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl HeartbeatStore for FileHeartbeatStore {
    async fn read(&self) -> CoordinationResult<Option<LeadHeartbeat>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(hb) => Ok(Some(hb)),
            Err(e) => {
                // A corrupt record is as good as no leader.
                tracing::warn!(path = %self.path.display(), error = %e, "Unreadable lead heartbeat");
                Ok(None)
            }
        }
    }

    async fn write(&self, heartbeat: &LeadHeartbeat) -> CoordinationResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(heartbeat)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryHeartbeatStore {
    record: RwLock<Option<LeadHeartbeat>>,
}

impl MemoryHeartbeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clear(&self) {
        *self.record.write().await = None;
    }
}

#[async_trait]
impl HeartbeatStore for MemoryHeartbeatStore {
    async fn read(&self) -> CoordinationResult<Option<LeadHeartbeat>> {
        Ok(self.record.read().await.clone())
    }

    async fn write(&self, heartbeat: &LeadHeartbeat) -> CoordinationResult<()> {
        *self.record.write().await = Some(heartbeat.clone());
        Ok(())
    }
}
