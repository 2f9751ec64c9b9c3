//! Daemon and agent configuration.
//!
//! Loaded from a TOML file. Every field has a default, so an empty or
//! missing file yields a working single-host setup with data under
//! `dirs::data_local_dir()/agent-relay`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use relay_protocol::{FrameMode, DEFAULT_HEARTBEAT_MS, MAX_FRAME_BYTES};
use relay_storage::{ChannelBackend, StorageOptions};

use crate::RouterError;

pub const APP_DIR: &str = "agent-relay";
pub const CONFIG_FILE: &str = "config.toml";
pub const SOCKET_FILE: &str = "relay.sock";

/// Per-user data directory, falling back to `./.agent-relay`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".agent-relay"))
}

/// Where `RelayConfig::load(None)` looks for a config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE))
}

/// A listen or connect address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayAddr {
    Unix(PathBuf),
    Tcp(String),
}

impl RelayAddr {
    /// Parse `unix:<path>` or `tcp:<host:port>`.
    pub fn parse(s: &str) -> Result<Self, RouterError> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(RouterError::Config(format!("empty socket path in '{s}'")));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            if !addr.contains(':') {
                return Err(RouterError::Config(format!("tcp address needs host:port, got '{s}'")));
            }
            return Ok(Self::Tcp(addr.to_string()));
        }
        Err(RouterError::Config(format!(
            "address must start with unix: or tcp:, got '{s}'"
        )))
    }
}

impl std::fmt::Display for RelayAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Burst size, in SENDs.
    pub capacity: u32,
    /// Sustained SENDs per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            refill_per_sec: 50.0,
        }
    }
}

/// `[daemon]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// `unix:<path>` or `tcp:<host:port>`.
    pub listen: String,
    /// Use the 4-byte header on every connection.
    pub legacy_framing: bool,
    pub max_connections: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_ms: u64,
    /// Idle connections are dropped after `heartbeat_ms * multiplier`.
    pub heartbeat_timeout_multiplier: u32,
    pub banned_agents: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: format!("unix:{}", default_data_dir().join(SOCKET_FILE).display()),
            legacy_framing: false,
            max_connections: 256,
            max_frame_bytes: MAX_FRAME_BYTES,
            heartbeat_ms: DEFAULT_HEARTBEAT_MS,
            heartbeat_timeout_multiplier: 6,
            banned_agents: Vec::new(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn frame_mode(&self) -> FrameMode {
        if self.legacy_framing {
            FrameMode::Legacy
        } else {
            FrameMode::Current
        }
    }

    pub fn listen_addr(&self) -> Result<RelayAddr, RouterError> {
        RelayAddr::parse(&self.listen)
    }

    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_ms
            .saturating_mul(u64::from(self.heartbeat_timeout_multiplier.max(1)))
    }

    pub fn is_banned(&self, agent: &str) -> bool {
        self.banned_agents.iter().any(|b| b == agent)
    }
}

/// `[channels]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub backend: ChannelBackend,
}

/// `[coordination]` section, used by the `agent` subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub task_log: PathBuf,
    pub lead_heartbeat: PathBuf,
    pub lease_duration_ms: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub gossip_interval_ms: u64,
    pub gossip_stale_ms: u64,
    pub watchdog_interval_ms: u64,
    pub leader_stale_ms: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        let dir = default_data_dir();
        Self {
            task_log: dir.join("beads").join("issues.jsonl"),
            lead_heartbeat: dir.join("lead-heartbeat.json"),
            lease_duration_ms: 300_000,
            poll_interval_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            gossip_interval_ms: 5_000,
            gossip_stale_ms: 15_000,
            watchdog_interval_ms: 5_000,
            leader_stale_ms: 30_000,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub daemon: DaemonConfig,
    pub storage: StorageOptions,
    pub channels: ChannelsConfig,
    /// Project name to remote daemon address (`unix:` / `tcp:`).
    pub bridges: HashMap<String, String>,
    pub coordination: CoordinationConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            storage: StorageOptions {
                path: default_data_dir(),
                ..StorageOptions::default()
            },
            channels: ChannelsConfig::default(),
            bridges: HashMap::new(),
            coordination: CoordinationConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_toml(text: &str) -> Result<Self, RouterError> {
        toml::from_str(text).map_err(|e| RouterError::Config(e.to_string()))
    }

    /// Load `path`, or the default location when `None`. A missing default
    /// file is not an error; a missing explicit file is.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        if !explicit && !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Data directory shared by storage and the channel store.
    pub fn data_dir(&self) -> &Path {
        &self.storage.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            RelayAddr::parse("unix:/tmp/relay.sock").unwrap(),
            RelayAddr::Unix(PathBuf::from("/tmp/relay.sock"))
        );
        assert_eq!(
            RelayAddr::parse("tcp:127.0.0.1:4100").unwrap(),
            RelayAddr::Tcp("127.0.0.1:4100".into())
        );
        assert!(RelayAddr::parse("127.0.0.1:4100").is_err());
        assert!(RelayAddr::parse("tcp:localhost").is_err());
        assert!(RelayAddr::parse("unix:").is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RelayConfig::from_toml(
            r#"
            [daemon]
            listen = "tcp:127.0.0.1:4100"
            banned_agents = ["mallory"]

            [daemon.rate_limit]
            capacity = 5

            [storage]
            driver = "jsonl"
            path = "/var/lib/relay"

            [bridges]
            backend = "unix:/srv/backend/relay.sock"
            "#,
        )
        .unwrap();

        assert_eq!(config.daemon.listen, "tcp:127.0.0.1:4100");
        assert!(config.daemon.is_banned("mallory"));
        assert_eq!(config.daemon.rate_limit.capacity, 5);
        assert_eq!(config.daemon.rate_limit.refill_per_sec, 50.0);
        assert_eq!(config.daemon.heartbeat_ms, DEFAULT_HEARTBEAT_MS);
        assert_eq!(config.storage.driver, relay_storage::StorageDriver::Jsonl);
        assert_eq!(config.data_dir(), Path::new("/var/lib/relay"));
        assert_eq!(config.bridges.len(), 1);
        assert_eq!(config.coordination.lease_duration_ms, 300_000);
    }

    #[test]
    fn test_heartbeat_timeout() {
        let daemon = DaemonConfig {
            heartbeat_ms: 1_000,
            heartbeat_timeout_multiplier: 3,
            ..DaemonConfig::default()
        };
        assert_eq!(daemon.heartbeat_timeout_ms(), 3_000);
        assert_eq!(daemon.frame_mode(), FrameMode::Current);
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RelayConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }
}
