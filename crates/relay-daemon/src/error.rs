use thiserror::Error;

use relay_protocol::ProtocolError;
use relay_storage::StorageError;

/// Errors raised by the router, its connections and the client.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HELLO rejected; `code` is sent to the peer in the ERROR envelope.
    #[error("handshake rejected ({code}): {message}")]
    Handshake { code: &'static str, message: String },

    #[error("no bridge configured for project '{0}'")]
    UnknownProject(String),

    #[error("bridge to '{project}' failed: {message}")]
    Bridge { project: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("rejected by peer ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("peer busy, retry after {retry_after_ms} ms")]
    Busy { retry_after_ms: u64 },

    #[error("connection closed")]
    Closed,
}

impl RouterError {
    pub fn handshake(code: &'static str, message: impl Into<String>) -> Self {
        Self::Handshake {
            code,
            message: message.into(),
        }
    }

    /// Code for the ERROR envelope sent before closing.
    pub fn code(&self) -> &str {
        match self {
            Self::Protocol(e) => e.code(),
            Self::Storage(_) => "STORAGE",
            Self::Io(_) => "IO",
            Self::Handshake { code, .. } => code,
            Self::UnknownProject(_) => "UNKNOWN_PROJECT",
            Self::Bridge { .. } => "BRIDGE",
            Self::Config(_) => "CONFIG",
            Self::Timeout(_) => "TIMEOUT",
            Self::Rejected { code, .. } => code,
            Self::Busy { .. } => "BUSY",
            Self::Closed => "CLOSED",
        }
    }
}

pub type RouterResult<T> = Result<T, RouterError>;
