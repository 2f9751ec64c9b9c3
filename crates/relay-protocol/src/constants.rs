/// Protocol version carried in every envelope's `v` field.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest serialized envelope body accepted on either side of a connection.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Header size in the current framing mode: 1 format byte + 4 length bytes.
pub const HEADER_SIZE: usize = 5;

/// Header size in the legacy framing mode: 4 length bytes only.
pub const LEGACY_HEADER_SIZE: usize = 4;

/// Format byte for JSON-encoded bodies.
pub const FORMAT_JSON: u8 = 0;

/// Broadcast target.
pub const BROADCAST_TARGET: &str = "*";

/// Prefix marking a channel target (`#general`).
pub const CHANNEL_PREFIX: char = '#';

/// Prefix of direct-message channels, which are never stored as memberships.
pub const DM_CHANNEL_PREFIX: &str = "dm:";

/// Separator in cross-project targets (`project:agent`).
pub const PROJECT_SEPARATOR: char = ':';

/// Tag that starts a gossip heartbeat message body.
pub const HEARTBEAT_TAG: &str = "HEARTBEAT:";

/// Default interval between server PINGs.
pub const DEFAULT_HEARTBEAT_MS: u64 = 5_000;

/// Default number of envelope ids remembered by a receiver-side de-dup window.
pub const DEDUP_CAPACITY: usize = 2_000;

/// Default age after which a remembered envelope id is forgotten.
pub const DEDUP_WINDOW_MS: u64 = 10 * 60 * 1000;
