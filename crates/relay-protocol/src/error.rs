use thiserror::Error;

/// Errors raised by the envelope codec and protocol helpers.
///
/// Every framing variant is fatal for the connection that produced it:
/// the stream is torn down rather than resynchronized.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialized body (outbound) or declared length (inbound) exceeds the limit.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// The frame header or body is structurally invalid.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// The frame body is not a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("unsupported protocol version {got}, expected {expected}")]
    VersionMismatch { got: u32, expected: u32 },

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Short machine-readable code sent in ERROR envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            Self::InvalidFrame(_) => "INVALID_FRAME",
            Self::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            Self::VersionMismatch { .. } => "VERSION_MISMATCH",
            Self::InvalidTarget(_) => "INVALID_TARGET",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }
}
