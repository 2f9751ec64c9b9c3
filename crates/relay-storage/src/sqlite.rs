//! SQLite driver. The preferred durable backend.
//!
//! rusqlite is synchronous, so every call runs on the blocking pool against a
//! shared connection.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

use crate::store::MessageStore;
use crate::types::*;
use crate::{StorageError, StorageResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    ts INTEGER NOT NULL,
    sender TEXT NOT NULL,
    recipient TEXT NOT NULL,
    topic TEXT,
    kind TEXT NOT NULL,
    body TEXT NOT NULL,
    data TEXT,
    thread TEXT,
    delivery_seq INTEGER,
    delivery_session_id TEXT,
    session_id TEXT,
    status TEXT NOT NULL DEFAULT 'unread',
    is_urgent INTEGER NOT NULL DEFAULT 0,
    is_broadcast INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient, status);
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread);
CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);

CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    agent_name TEXT NOT NULL,
    cli TEXT,
    project_id TEXT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    message_count INTEGER NOT NULL DEFAULT 0,
    resume_token TEXT,
    closed_by TEXT
);
CREATE INDEX IF NOT EXISTS idx_sessions_resume ON sessions(resume_token);

CREATE TABLE IF NOT EXISTS agent_summaries (
    agent_name TEXT PRIMARY KEY,
    project_id TEXT,
    last_seen TEXT NOT NULL,
    last_message_id TEXT,
    current_task TEXT,
    completed_tasks TEXT NOT NULL DEFAULT '[]',
    context TEXT NOT NULL DEFAULT 'null'
);
";

const MESSAGE_COLUMNS: &str = "id, ts, sender, recipient, topic, kind, body, data, thread, \
     delivery_seq, delivery_session_id, session_id, status, is_urgent, is_broadcast";

const SESSION_COLUMNS: &str =
    "id, agent_name, cli, project_id, started_at, ended_at, message_count, resume_token, closed_by";

pub struct SqliteStore {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    /// Store backed by the database file at `path`, opened on `init`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// Private in-memory database, mostly for tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
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
                .map_err(|_| StorageError::Unavailable("sqlite connection lock poisoned".into()))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| StorageError::NotInitialized("sqlite".into()))?;
            f(conn)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("sqlite worker failed: {e}")))?
    }
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn from_i64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    let data: Option<String> = row.get(7)?;
    let status: String = row.get(12)?;
    Ok(StoredMessage {
        id: row.get(0)?,
        ts: from_i64(row.get(1)?),
        from: row.get(2)?,
        to: row.get(3)?,
        topic: row.get(4)?,
        kind: row.get(5)?,
        body: row.get(6)?,
        data: data.and_then(|d| serde_json::from_str(&d).ok()),
        thread: row.get(8)?,
        delivery_seq: row.get::<_, Option<i64>>(9)?.map(from_i64),
        delivery_session_id: row.get(10)?,
        session_id: row.get(11)?,
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Unread),
        is_urgent: row.get(13)?,
        is_broadcast: row.get(14)?,
    })
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<StoredSession> {
    let closed_by: Option<String> = row.get(8)?;
    Ok(StoredSession {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        cli: row.get(2)?,
        project_id: row.get(3)?,
        started_at: from_i64(row.get(4)?),
        ended_at: row.get::<_, Option<i64>>(5)?.map(from_i64),
        message_count: from_i64(row.get(6)?),
        resume_token: row.get(7)?,
        closed_by: closed_by.as_deref().and_then(ClosedBy::parse),
    })
}

fn row_to_summary(row: &Row<'_>) -> rusqlite::Result<AgentSummary> {
    let last_seen: String = row.get(2)?;
    let last_seen = chrono::DateTime::parse_from_rfc3339(&last_seen)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?
        .with_timezone(&chrono::Utc);
    let completed: String = row.get(5)?;
    let context: String = row.get(6)?;
    Ok(AgentSummary {
        agent_name: row.get(0)?,
        project_id: row.get(1)?,
        last_seen,
        last_message_id: row.get(3)?,
        current_task: row.get(4)?,
        completed_tasks: serde_json::from_str(&completed).unwrap_or_default(),
        context: serde_json::from_str(&context).unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn init(&self) -> StorageResult<()> {
        let path = self.path.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            let connection = match &path {
                Some(p) => {
                    if let Some(parent) = p.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    Connection::open(p)?
                }
                None => Connection::open_in_memory()?,
            };
            connection.execute_batch("PRAGMA journal_mode=WAL;")?;
            connection.execute_batch(SCHEMA)?;
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Unavailable("sqlite connection lock poisoned".into()))?;
            *guard = Some(connection);
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("sqlite worker failed: {e}")))??;

        tracing::info!(
            path = %self.path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| ":memory:".into()),
            "SQLite store initialized"
        );
        Ok(())
    }

    async fn health_check(&self) -> HealthReport {
        let check = self
            .run(|conn| {
                conn.query_row("SELECT 1", [], |_| Ok(()))?;
                let readonly = conn.is_readonly(rusqlite::DatabaseName::Main)?;
                Ok(!readonly)
            })
            .await;
        match check {
            Ok(can_write) => HealthReport {
                persistent: self.path.is_some(),
                driver: StorageDriver::Sqlite.as_str().to_string(),
                can_read: true,
                can_write,
                error: (!can_write).then(|| {
                    "SQLite database is read-only; check file permissions on [storage].path".to_string()
                }),
            },
            Err(e) => HealthReport {
                persistent: self.path.is_some(),
                driver: StorageDriver::Sqlite.as_str().to_string(),
                can_read: false,
                can_write: false,
                error: Some(format!(
                    "SQLite unavailable ({e}); verify the database path or set [storage].driver = \"jsonl\""
                )),
            },
        }
    }

    async fn save_message(&self, message: &StoredMessage) -> StorageResult<()> {
        let m = message.clone();
        self.run(move |conn| {
            let data = m.data.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO messages ({MESSAGE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                params![
                    m.id,
                    to_i64(m.ts),
                    m.from,
                    m.to,
                    m.topic,
                    m.kind,
                    m.body,
                    data,
                    m.thread,
                    m.delivery_seq.map(to_i64),
                    m.delivery_session_id,
                    m.session_id,
                    m.status.as_str(),
                    m.is_urgent,
                    m.is_broadcast,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_messages(&self, query: &MessageQuery) -> StorageResult<Vec<StoredMessage>> {
        let q = query.clone();
        self.run(move |conn| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(from) = q.from {
                clauses.push("sender = ?");
                values.push(Box::new(from));
            }
            if let Some(to) = q.to {
                clauses.push("recipient = ?");
                values.push(Box::new(to));
            }
            if let Some(topic) = q.topic {
                clauses.push("COALESCE(topic, 'default') = ?");
                values.push(Box::new(topic));
            }
            if let Some(thread) = q.thread {
                clauses.push("thread = ?");
                values.push(Box::new(thread));
            }
            if let Some(since) = q.since_ts {
                clauses.push("ts >= ?");
                values.push(Box::new(to_i64(since)));
            }
            if q.unread_only {
                clauses.push("status = 'unread'");
            }
            if q.urgent_only {
                clauses.push("is_urgent = 1");
            }

            let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(match q.order {
                SortOrder::Asc => " ORDER BY ts ASC",
                SortOrder::Desc => " ORDER BY ts DESC",
            });
            if let Some(limit) = q.limit {
                sql.push_str(" LIMIT ?");
                values.push(Box::new(i64::try_from(limit).unwrap_or(i64::MAX)));
            }

            let refs: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(&refs[..], row_to_message)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn get_message_by_id(&self, id: &str) -> StorageResult<Option<StoredMessage>> {
        let id = id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], row_to_message).optional()?)
        })
        .await
    }

    async fn update_message_status(&self, id: &str, status: MessageStatus) -> StorageResult<()> {
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE messages SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn reply_count(&self, id: &str) -> StorageResult<u64> {
        let id = id.to_string();
        self.run(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE thread = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(from_i64(count))
        })
        .await
    }

    async fn start_session(&self, session: &StoredSession) -> StorageResult<()> {
        let s = session.clone();
        self.run(move |conn| {
            conn.execute(
                &format!(
                    "INSERT OR REPLACE INTO sessions ({SESSION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    s.id,
                    s.agent_name,
                    s.cli,
                    s.project_id,
                    to_i64(s.started_at),
                    s.ended_at.map(to_i64),
                    to_i64(s.message_count),
                    s.resume_token,
                    s.closed_by.map(|c| c.as_str()),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn end_session(
        &self,
        session_id: &str,
        ended_at: u64,
        closed_by: ClosedBy,
    ) -> StorageResult<()> {
        let id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE sessions SET ended_at = ?1, closed_by = ?2 WHERE id = ?3",
                params![to_i64(ended_at), closed_by.as_str(), id],
            )?;
            Ok(())
        })
        .await
    }

    async fn increment_session_messages(&self, session_id: &str) -> StorageResult<()> {
        let id = session_id.to_string();
        self.run(move |conn| {
            conn.execute(
                "UPDATE sessions SET message_count = message_count + 1 WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session_by_resume_token(
        &self,
        token: &str,
    ) -> StorageResult<Option<StoredSession>> {
        let token = token.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE resume_token = ?1 \
                 ORDER BY started_at DESC LIMIT 1"
            );
            Ok(conn.query_row(&sql, params![token], row_to_session).optional()?)
        })
        .await
    }

    async fn get_recent_sessions(&self, limit: usize) -> StorageResult<Vec<StoredSession>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.run(move |conn| {
            let sql =
                format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at DESC LIMIT ?1");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit], row_to_session)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn upsert_agent_summary(&self, summary: &AgentSummary) -> StorageResult<()> {
        let s = summary.clone();
        self.run(move |conn| {
            let completed = serde_json::to_string(&s.completed_tasks)?;
            let context = serde_json::to_string(&s.context)?;
            conn.execute(
                "INSERT OR REPLACE INTO agent_summaries \
                 (agent_name, project_id, last_seen, last_message_id, current_task, completed_tasks, context) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    s.agent_name,
                    s.project_id,
                    s.last_seen.to_rfc3339(),
                    s.last_message_id,
                    s.current_task,
                    completed,
                    context,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_agent_summary(&self, agent_name: &str) -> StorageResult<Option<AgentSummary>> {
        let name = agent_name.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT agent_name, project_id, last_seen, last_message_id, current_task, \
                     completed_tasks, context FROM agent_summaries WHERE agent_name = ?1",
                    params![name],
                    row_to_summary,
                )
                .optional()?)
        })
        .await
    }

    async fn get_pending_messages_for_session(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StoredMessage>> {
        let agent = agent.to_string();
        let session = session_id.map(str::to_string);
        self.run(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE recipient = ?1 AND status = 'unread' \
                 AND (delivery_session_id IS NULL OR delivery_session_id = ?2) \
                 ORDER BY COALESCE(delivery_seq, 0) ASC, ts ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![agent, session], row_to_message)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn get_max_seq_by_stream(
        &self,
        agent: &str,
        session_id: Option<&str>,
    ) -> StorageResult<Vec<StreamSeq>> {
        let agent = agent.to_string();
        let session = session_id.map(str::to_string);
        self.run(move |conn| {
            let sql = "SELECT COALESCE(topic, 'default') AS t, sender, MAX(delivery_seq) \
                 FROM messages \
                 WHERE recipient = ?1 AND delivery_seq IS NOT NULL \
                 AND (?2 IS NULL OR delivery_session_id = ?2) \
                 GROUP BY t, sender ORDER BY t, sender";
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params![agent, session], |row| {
                Ok(StreamSeq {
                    topic: row.get(0)?,
                    peer: row.get(1)?,
                    max_seq: from_i64(row.get(2)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn close(&self) -> StorageResult<()> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = conn.lock() {
                guard.take();
            }
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("sqlite worker failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, to: &str, seq: Option<u64>, session: Option<&str>) -> StoredMessage {
        StoredMessage {
            id: id.into(),
            ts: 100,
            from: "alice".into(),
            to: to.into(),
            topic: None,
            kind: "message".into(),
            body: "hello".into(),
            data: Some(serde_json::json!({"k": 1})),
            thread: None,
            delivery_seq: seq,
            delivery_session_id: session.map(Into::into),
            session_id: None,
            status: MessageStatus::Unread,
            is_urgent: false,
            is_broadcast: false,
        }
    }

    #[tokio::test]
    async fn test_round_trip_message_columns() {
        let store = SqliteStore::in_memory();
        store.init().await.unwrap();
        let m = message("m1", "bob", Some(3), Some("s1"));
        store.save_message(&m).await.unwrap();
        let loaded = store.get_message_by_id("m1").await.unwrap().unwrap();
        assert_eq!(loaded, m);
    }

    #[tokio::test]
    async fn test_max_seq_filters_by_session() {
        let store = SqliteStore::in_memory();
        store.init().await.unwrap();
        store.save_message(&message("a", "bob", Some(2), Some("s1"))).await.unwrap();
        store.save_message(&message("b", "bob", Some(5), Some("s2"))).await.unwrap();

        let all = store.get_max_seq_by_stream("bob", None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].max_seq, 5);

        let s1 = store.get_max_seq_by_stream("bob", Some("s1")).await.unwrap();
        assert_eq!(s1[0].max_seq, 2);
        assert_eq!(s1[0].topic, "default");
        assert_eq!(s1[0].peer, "alice");
    }

    #[tokio::test]
    async fn test_calls_before_init_fail() {
        let store = SqliteStore::in_memory();
        let err = store.get_message_by_id("x").await.unwrap_err();
        assert!(matches!(err, StorageError::NotInitialized(_)));
    }
}
