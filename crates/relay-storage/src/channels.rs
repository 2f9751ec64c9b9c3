//! Channel membership: which agents receive `#channel` traffic.
//!
//! Direct-message channels (`dm:` prefix) are never recorded; every backend
//! treats joins and leaves on them as no-ops.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use relay_protocol::is_dm_channel;

use crate::{StorageError, StorageResult};

/// One `{channel, member}` row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelMembershipRecord {
    pub channel: String,
    pub member: String,
}

#[async_trait]
pub trait ChannelMembershipStore: Send + Sync {
    async fn init(&self) -> StorageResult<()>;

    async fn add_member(&self, channel: &str, member: &str) -> StorageResult<()>;

    async fn remove_member(&self, channel: &str, member: &str) -> StorageResult<()>;

    /// Members of `channel`, sorted by name.
    async fn members(&self, channel: &str) -> StorageResult<Vec<String>>;

    /// Channels `member` belongs to, sorted by name.
    async fn channels_for(&self, member: &str) -> StorageResult<Vec<String>>;

    async fn all(&self) -> StorageResult<Vec<ChannelMembershipRecord>>;
}

/// `[channels]` backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelBackend {
    #[default]
    Sqlite,
    File,
    Memory,
}

/// Open the configured backend, falling back to memory if it cannot start.
pub async fn open_channel_store(
    backend: ChannelBackend,
    data_dir: &std::path::Path,
) -> Arc<dyn ChannelMembershipStore> {
    let store: Arc<dyn ChannelMembershipStore> = match backend {
        ChannelBackend::Sqlite => Arc::new(SqliteChannelStore::new(data_dir.join("channels.db"))),
        ChannelBackend::File => Arc::new(FileChannelStore::new(data_dir.join("channels.json"))),
        ChannelBackend::Memory => return Arc::new(InMemoryChannelStore::default()),
    };
    match store.init().await {
        Ok(()) => store,
        Err(e) => {
            tracing::warn!(
                backend = ?backend,
                error = %e,
                "Channel membership store unavailable, memberships will not persist"
            );
            Arc::new(InMemoryChannelStore::default())
        }
    }
}

type MembershipMap = BTreeMap<String, BTreeSet<String>>;

fn channels_of(map: &MembershipMap, member: &str) -> Vec<String> {
    map.iter()
        .filter(|(_, members)| members.contains(member))
        .map(|(channel, _)| channel.clone())
        .collect()
}

fn records_of(map: &MembershipMap) -> Vec<ChannelMembershipRecord> {
    map.iter()
        .flat_map(|(channel, members)| {
            members.iter().map(move |m| ChannelMembershipRecord {
                channel: channel.clone(),
                member: m.clone(),
            })
        })
        .collect()
}

// ── In-memory ──────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemoryChannelStore {
    map: RwLock<MembershipMap>,
}

#[async_trait]
impl ChannelMembershipStore for InMemoryChannelStore {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn add_member(&self, channel: &str, member: &str) -> StorageResult<()> {
        if is_dm_channel(channel) {
            return Ok(());
        }
        self.map
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_member(&self, channel: &str, member: &str) -> StorageResult<()> {
        let mut map = self.map.write().await;
        if let Some(members) = map.get_mut(channel) {
            members.remove(member);
            if members.is_empty() {
                map.remove(channel);
            }
        }
        Ok(())
    }

    async fn members(&self, channel: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .map
            .read()
            .await
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn channels_for(&self, member: &str) -> StorageResult<Vec<String>> {
        Ok(channels_of(&*self.map.read().await, member))
    }

    async fn all(&self) -> StorageResult<Vec<ChannelMembershipRecord>> {
        Ok(records_of(&*self.map.read().await))
    }
}

// ── JSON file ──────────────────────────────────────────────────

/// Memberships kept in one JSON document, rewritten through a temp file and
/// rename on every change.
pub struct FileChannelStore {
    path: PathBuf,
    map: RwLock<MembershipMap>,
}

impl FileChannelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            map: RwLock::new(MembershipMap::new()),
        }
    }

    async fn persist(&self, map: &MembershipMap) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelMembershipStore for FileChannelStore {
    async fn init(&self) -> StorageResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let loaded = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<MembershipMap>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MembershipMap::new(),
            Err(e) => return Err(e.into()),
        };
        self.persist(&loaded).await?;
        *self.map.write().await = loaded;
        Ok(())
    }

    async fn add_member(&self, channel: &str, member: &str) -> StorageResult<()> {
        if is_dm_channel(channel) {
            return Ok(());
        }
        let mut map = self.map.write().await;
        let inserted = map
            .entry(channel.to_string())
            .or_default()
            .insert(member.to_string());
        if inserted {
            self.persist(&map).await?;
        }
        Ok(())
    }

    async fn remove_member(&self, channel: &str, member: &str) -> StorageResult<()> {
        let mut map = self.map.write().await;
        let Some(members) = map.get_mut(channel) else {
            return Ok(());
        };
        if members.remove(member) {
            if members.is_empty() {
                map.remove(channel);
            }
            self.persist(&map).await?;
        }
        Ok(())
    }

    async fn members(&self, channel: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .map
            .read()
            .await
            .get(channel)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn channels_for(&self, member: &str) -> StorageResult<Vec<String>> {
        Ok(channels_of(&*self.map.read().await, member))
    }

    async fn all(&self) -> StorageResult<Vec<ChannelMembershipRecord>> {
        Ok(records_of(&*self.map.read().await))
    }
}

// ── SQLite ─────────────────────────────────────────────────────

pub struct SqliteChannelStore {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteChannelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    async fn run<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StorageError::Unavailable("channel db lock poisoned".into()))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| StorageError::NotInitialized("channel db".into()))?;
            f(conn)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("channel db worker failed: {e}")))?
    }
}

#[async_trait]
impl ChannelMembershipStore for SqliteChannelStore {
    async fn init(&self) -> StorageResult<()> {
        let path = self.path.clone();
        let slot = self.conn.clone();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(&path)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS channel_members (
                    channel TEXT NOT NULL,
                    member TEXT NOT NULL,
                    joined_at TEXT NOT NULL,
                    PRIMARY KEY (channel, member)
                );
                CREATE INDEX IF NOT EXISTS idx_channel_members_member ON channel_members(member);",
            )?;
            let mut guard = slot
                .lock()
                .map_err(|_| StorageError::Unavailable("channel db lock poisoned".into()))?;
            *guard = Some(conn);
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("channel db worker failed: {e}")))?
    }

    async fn add_member(&self, channel: &str, member: &str) -> StorageResult<()> {
        if is_dm_channel(channel) {
            return Ok(());
        }
        let (channel, member) = (channel.to_string(), member.to_string());
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO channel_members (channel, member, joined_at) VALUES (?1, ?2, ?3)",
                params![channel, member, chrono::Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_member(&self, channel: &str, member: &str) -> StorageResult<()> {
        let (channel, member) = (channel.to_string(), member.to_string());
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM channel_members WHERE channel = ?1 AND member = ?2",
                params![channel, member],
            )?;
            Ok(())
        })
        .await
    }

    async fn members(&self, channel: &str) -> StorageResult<Vec<String>> {
        let channel = channel.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT member FROM channel_members WHERE channel = ?1 ORDER BY member",
            )?;
            let rows = stmt.query_map(params![channel], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
        .await
    }

    async fn channels_for(&self, member: &str) -> StorageResult<Vec<String>> {
        let member = member.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT channel FROM channel_members WHERE member = ?1 ORDER BY channel",
            )?;
            let rows = stmt.query_map(params![member], |row| row.get(0))?;
            Ok(rows.collect::<Result<Vec<String>, _>>()?)
        })
        .await
    }

    async fn all(&self) -> StorageResult<Vec<ChannelMembershipRecord>> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT channel, member FROM channel_members ORDER BY channel, member")?;
            let rows = stmt.query_map([], |row| {
                Ok(ChannelMembershipRecord {
                    channel: row.get(0)?,
                    member: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }
}
