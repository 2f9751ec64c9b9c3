use serde::{Deserialize, Serialize};

use relay_protocol::DEFAULT_TOPIC;

/// Delivery status of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Read,
    Acked,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unread => "unread",
            Self::Read => "read",
            Self::Acked => "acked",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unread" => Some(Self::Unread),
            "read" => Some(Self::Read),
            "acked" => Some(Self::Acked),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Persisted projection of a routed envelope.
///
/// One record per (envelope, recipient): a broadcast to three agents is
/// stored as three messages sharing a body, each with its own delivery
/// sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub ts: u64,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    pub kind: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_session_id: Option<String>,
    /// Sender's session at the time of the SEND.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: MessageStatus,
    #[serde(default)]
    pub is_urgent: bool,
    #[serde(default)]
    pub is_broadcast: bool,
}

impl StoredMessage {
    pub fn topic_or_default(&self) -> &str {
        self.topic.as_deref().unwrap_or(DEFAULT_TOPIC)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedBy {
    /// The agent said BYE.
    Agent,
    /// EOF or heartbeat timeout.
    Disconnect,
    /// Protocol or transport error.
    Error,
}

impl ClosedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Disconnect => "disconnect",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(Self::Agent),
            "disconnect" => Some(Self::Disconnect),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One agent connection lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
    /// Absent while the session is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_by: Option<ClosedBy>,
}

impl StoredSession {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Rolling per-agent summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<String>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl AgentSummary {
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            project_id: None,
            last_seen: chrono::Utc::now(),
            last_message_id: None,
            current_task: None,
            completed_tasks: Vec::new(),
            context: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter for [`crate::MessageStore::get_messages`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub topic: Option<String>,
    pub thread: Option<String>,
    pub since_ts: Option<u64>,
    pub order: SortOrder,
    pub unread_only: bool,
    pub urgent_only: bool,
    pub limit: Option<usize>,
}

impl MessageQuery {
    pub fn matches(&self, msg: &StoredMessage) -> bool {
        if self.from.as_deref().is_some_and(|f| f != msg.from) {
            return false;
        }
        if self.to.as_deref().is_some_and(|t| t != msg.to) {
            return false;
        }
        if self.topic.as_deref().is_some_and(|t| t != msg.topic_or_default()) {
            return false;
        }
        if self.thread.is_some() && self.thread != msg.thread {
            return false;
        }
        if self.since_ts.is_some_and(|since| msg.ts < since) {
            return false;
        }
        if self.unread_only && msg.status != MessageStatus::Unread {
            return false;
        }
        if self.urgent_only && !msg.is_urgent {
            return false;
        }
        true
    }
}

/// Highest delivered sequence on one (topic, peer) stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSeq {
    pub topic: String,
    pub peer: String,
    pub max_seq: u64,
}

/// Result of [`crate::MessageStore::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub persistent: bool,
    pub driver: String,
    pub can_read: bool,
    pub can_write: bool,
    /// Degradation or failure description with remediation text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageDriver {
    #[default]
    Sqlite,
    Jsonl,
    Memory,
}

impl StorageDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Jsonl => "jsonl",
            Self::Memory => "memory",
        }
    }
}
