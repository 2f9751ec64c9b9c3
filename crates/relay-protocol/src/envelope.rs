//! Wire envelope and the typed payloads carried inside it.
//!
//! Every frame on a relay connection holds exactly one [`Envelope`]. The
//! envelope header (`v`, `type`, `id`, `ts`, `from`, `to`, `topic`) is fixed;
//! the `payload` is a JSON value whose shape depends on the message type.
//! Typed payload structs below are decoded on demand with
//! [`Envelope::payload_as`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constants::{
    BROADCAST_TARGET, CHANNEL_PREFIX, DM_CHANNEL_PREFIX, PROJECT_SEPARATOR, PROTOCOL_VERSION,
};
use crate::ProtocolError;

/// Stream topic used when an envelope does not name one.
pub const DEFAULT_TOPIC: &str = "default";

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fixed enumeration of envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Hello,
    Welcome,
    Send,
    Deliver,
    Ack,
    Nack,
    Ping,
    Pong,
    Error,
    Busy,
    Log,
    Sync,
    Spawn,
    SpawnResult,
    Release,
    ReleaseResult,
    ShadowBind,
    ShadowUnbind,
    ChannelJoin,
    ChannelLeave,
    ChannelMessage,
    ProposalCreate,
    Vote,
    Bye,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Welcome => "WELCOME",
            Self::Send => "SEND",
            Self::Deliver => "DELIVER",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Error => "ERROR",
            Self::Busy => "BUSY",
            Self::Log => "LOG",
            Self::Sync => "SYNC",
            Self::Spawn => "SPAWN",
            Self::SpawnResult => "SPAWN_RESULT",
            Self::Release => "RELEASE",
            Self::ReleaseResult => "RELEASE_RESULT",
            Self::ShadowBind => "SHADOW_BIND",
            Self::ShadowUnbind => "SHADOW_UNBIND",
            Self::ChannelJoin => "CHANNEL_JOIN",
            Self::ChannelLeave => "CHANNEL_LEAVE",
            Self::ChannelMessage => "CHANNEL_MESSAGE",
            Self::ProposalCreate => "PROPOSAL_CREATE",
            Self::Vote => "VOTE",
            Self::Bye => "BYE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Synchronous-request metadata: the sender is blocked in `send_and_wait`
/// until an ACK carrying `correlation_id` comes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub blocking: bool,
}

/// Optional per-envelope delivery hints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_ack: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// 0-100; values >= 80 mark the message urgent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncMeta>,
}

/// Delivery bookkeeping stamped by the router on DELIVER envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub seq: u64,
    pub session_id: String,
}

/// The logical unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub id: String,
    pub ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_meta: Option<PayloadMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<DeliveryInfo>,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(kind: MessageType, payload: serde_json::Value) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            kind,
            id: uuid::Uuid::new_v4().to_string(),
            ts: now_ms(),
            from: None,
            to: None,
            topic: None,
            payload,
            payload_meta: None,
            delivery: None,
        }
    }

    /// Create an envelope from a typed payload.
    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    /// Build a SEND envelope addressed to `to`.
    pub fn send(to: impl Into<String>, payload: &SendPayload) -> Result<Self, ProtocolError> {
        Ok(Self::with_payload(MessageType::Send, payload)?.to(to))
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_meta(mut self, meta: PayloadMeta) -> Self {
        self.payload_meta = Some(meta);
        self
    }

    /// Decode the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| ProtocolError::MalformedEnvelope(format!("{} payload: {e}", self.kind)))
    }

    /// Topic of this envelope's stream, falling back to [`DEFAULT_TOPIC`].
    pub fn topic_or_default(&self) -> &str {
        self.topic.as_deref().unwrap_or(DEFAULT_TOPIC)
    }

    /// Correlation id for ACK matching: explicit `correlationId`, then the
    /// sync block's id.
    pub fn correlation_id(&self) -> Option<&str> {
        let meta = self.payload_meta.as_ref()?;
        meta.correlation_id
            .as_deref()
            .or_else(|| meta.sync.as_ref().map(|s| s.correlation_id.as_str()))
    }

    /// Whether the sender is blocked waiting for an ACK.
    pub fn is_sync_request(&self) -> bool {
        self.payload_meta
            .as_ref()
            .and_then(|m| m.sync.as_ref())
            .is_some_and(|s| s.blocking)
    }

    pub fn is_urgent(&self) -> bool {
        self.payload_meta
            .as_ref()
            .and_then(|m| m.importance)
            .is_some_and(|i| i >= 80)
    }

    /// Build an ERROR envelope.
    pub fn error(code: &str, message: impl Into<String>, fatal: bool) -> Self {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.into(),
            fatal,
        };
        Self::new(
            MessageType::Error,
            serde_json::to_value(payload).unwrap_or_default(),
        )
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Parsed form of a SEND envelope's `to` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Exact agent name.
    Agent(String),
    /// `*`: every connected agent except the sender.
    Broadcast,
    /// `#channel`: current channel members.
    Channel(String),
    /// `project:agent`: an agent behind a remote project bridge.
    Project { project: String, agent: String },
}

impl Target {
    pub fn parse(to: &str) -> Result<Self, ProtocolError> {
        let to = to.trim();
        if to.is_empty() {
            return Err(ProtocolError::InvalidTarget("empty target".into()));
        }
        if to == BROADCAST_TARGET {
            return Ok(Self::Broadcast);
        }
        if to.starts_with(CHANNEL_PREFIX) {
            if to.len() == 1 {
                return Err(ProtocolError::InvalidTarget("empty channel name".into()));
            }
            return Ok(Self::Channel(to.to_string()));
        }
        if let Some((project, agent)) = to.split_once(PROJECT_SEPARATOR) {
            if project.is_empty() || agent.is_empty() {
                return Err(ProtocolError::InvalidTarget(format!("bad project target '{to}'")));
            }
            return Ok(Self::Project {
                project: project.to_string(),
                agent: agent.to_string(),
            });
        }
        Ok(Self::Agent(to.to_string()))
    }
}

/// DM-style channels (`#dm:alice:bob`, `dm:alice:bob`) are excluded from
/// the membership store.
pub fn is_dm_channel(channel: &str) -> bool {
    channel
        .trim_start_matches(CHANNEL_PREFIX)
        .starts_with(DM_CHANNEL_PREFIX)
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<String>,
}

/// HELLO: first frame sent by a connecting agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<ResumeRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub max_frame_bytes: usize,
    pub heartbeat_ms: u64,
}

/// WELCOME: server's answer to a successful HELLO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomePayload {
    pub session_id: String,
    pub resume_token: String,
    pub server: ServerInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    #[default]
    Message,
    Action,
    State,
    Thinking,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Action => "action",
            Self::State => "state",
            Self::Thinking => "thinking",
        }
    }
}

/// SEND / DELIVER / CHANNEL_MESSAGE body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendPayload {
    #[serde(default)]
    pub kind: PayloadKind,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
}

impl SendPayload {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub ack_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackPayload {
    pub ack_id: String,
    pub code: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
}

/// BUSY: receiver-side backpressure signal. The sender owns the retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyPayload {
    pub retry_after_ms: u64,
    #[serde(default)]
    pub queue_depth: u64,
}

/// Last delivered sequence for one (topic, peer) stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStream {
    #[serde(default = "default_topic")]
    pub topic: String,
    pub peer: String,
    #[serde(default)]
    pub last_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_last_seq: Option<u64>,
}

fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}

/// SYNC request (agent → router) and response (router → agent).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub streams: Vec<SyncStream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPayload {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowBindPayload {
    pub primary_agent: String,
    #[serde(default = "default_true")]
    pub receive_incoming: bool,
    #[serde(default = "default_true")]
    pub receive_outgoing: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub name: String,
    pub cli: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePayload {
    pub name: String,
}

/// SPAWN_RESULT / RELEASE_RESULT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleResultPayload {
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub data: String,
}
