//! Relay Protocol - envelope types, message kinds and framing
//!
//! Implements the agent-relay wire protocol: JSON envelopes carried in
//! length-prefixed frames, plus receiver-side de-duplication.

pub mod constants;
pub mod dedup;
pub mod envelope;
pub mod error;
pub mod framing;

pub use constants::*;
pub use dedup::DedupWindow;
pub use envelope::*;
pub use error::*;
pub use framing::{decode_body, encode, encode_with_mode, FrameMode, FrameParser};
