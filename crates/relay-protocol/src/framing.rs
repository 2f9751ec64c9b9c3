//! Length-prefixed framing for envelopes.
//!
//! Wire format (current mode):
//!
//! ```text
//! +-----------+----------------------+------------------+
//! | format u8 | length (4 bytes, BE) | JSON body        |
//! +-----------+----------------------+------------------+
//! ```
//!
//! Legacy mode drops the format byte and carries only the 4-byte length.
//! The mode is fixed per connection by configuration; peers never negotiate
//! it in-band.

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

use crate::constants::{FORMAT_JSON, HEADER_SIZE, LEGACY_HEADER_SIZE, MAX_FRAME_BYTES};
use crate::{Envelope, ProtocolError};

/// Header layout used on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameMode {
    /// 1 format byte + 4-byte big-endian length.
    #[default]
    Current,
    /// 4-byte big-endian length only, for older peers.
    Legacy,
}

impl FrameMode {
    pub fn header_size(self) -> usize {
        match self {
            Self::Current => HEADER_SIZE,
            Self::Legacy => LEGACY_HEADER_SIZE,
        }
    }
}

/// Encode an envelope in the current framing mode.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    encode_with_mode(envelope, FrameMode::Current)
}

/// Encode an envelope using the given header layout.
///
/// The body size is checked before any output is produced, so an oversized
/// envelope never yields a partial frame.
pub fn encode_with_mode(envelope: &Envelope, mode: FrameMode) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }

    let mut frame = Vec::with_capacity(mode.header_size() + body.len());
    if mode == FrameMode::Current {
        frame.push(FORMAT_JSON);
    }
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a single frame body (no header) into an envelope.
pub fn decode_body(body: &[u8]) -> Result<Envelope, ProtocolError> {
    serde_json::from_slice(body).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
}

/// Streaming, incremental frame decoder.
///
/// Bytes are appended with [`FrameParser::push`]; every complete frame in
/// the buffer is decoded and returned, partial trailing bytes are kept for
/// the next call. Any error is fatal: callers must drop the connection and
/// the parser with it.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    mode: FrameMode,
    max_frame_bytes: usize,
}

impl FrameParser {
    pub fn new(mode: FrameMode) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            mode,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    /// Parser with a tighter frame limit (never above [`MAX_FRAME_BYTES`]).
    pub fn with_max_frame_bytes(mode: FrameMode, max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes: max_frame_bytes.min(MAX_FRAME_BYTES),
            ..Self::new(mode)
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Number of bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `chunk` and return every envelope completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>, ProtocolError> {
        self.buf.extend_from_slice(chunk);
        let mut envelopes = Vec::new();
        while let Some(envelope) = self.next_frame()? {
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    fn next_frame(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        let header_size = self.mode.header_size();
        if self.buf.len() < header_size {
            return Ok(None);
        }

        let length_offset = match self.mode {
            FrameMode::Current => {
                let format = self.buf[0];
                if format != FORMAT_JSON {
                    return Err(ProtocolError::InvalidFrame(format!(
                        "unknown format byte {format:#04x}"
                    )));
                }
                1
            }
            FrameMode::Legacy => 0,
        };

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&self.buf[length_offset..length_offset + 4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        // Checked before waiting for the body so a hostile length never
        // makes us buffer it.
        if length > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_bytes,
            });
        }
        if length == 0 {
            return Err(ProtocolError::InvalidFrame("zero-length frame".into()));
        }
        if self.buf.len() < header_size + length {
            return Ok(None);
        }

        self.buf.advance(header_size);
        let body = self.buf.split_to(length);
        decode_body(&body).map(Some)
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(FrameMode::Current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessageType;

    #[test]
    fn test_header_layout_current() {
        let env = Envelope::new(MessageType::Ping, serde_json::Value::Null);
        let frame = encode(&env).unwrap();
        assert_eq!(frame[0], FORMAT_JSON);
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(len, frame.len() - HEADER_SIZE);
    }

    #[test]
    fn test_header_layout_legacy() {
        let env = Envelope::new(MessageType::Ping, serde_json::Value::Null);
        let frame = encode_with_mode(&env, FrameMode::Legacy).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - LEGACY_HEADER_SIZE);
    }

    #[test]
    fn test_unknown_format_byte_is_fatal() {
        let mut parser = FrameParser::new(FrameMode::Current);
        let result = parser.push(&[7, 0, 0, 0, 2, b'{', b'}']);
        assert!(matches!(result, Err(ProtocolError::InvalidFrame(_))));
    }

    #[test]
    fn test_declared_length_over_limit_is_fatal() {
        let mut parser = FrameParser::with_max_frame_bytes(FrameMode::Legacy, 16);
        let result = parser.push(&100u32.to_be_bytes());
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 100, max: 16 })));
    }
}
