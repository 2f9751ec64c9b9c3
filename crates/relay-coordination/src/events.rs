//! Typed event streams for the coordination components.
//!
//! Each component owns a `tokio::sync::broadcast` sender; subscribers that
//! fall behind lose the oldest events, never block the emitter.

use serde::{Deserialize, Serialize};

use crate::beads::BeadsTask;

pub(crate) const EVENT_CAPACITY: usize = 256;

/// Lifecycle of a [`crate::StatelessLeadCoordinator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LeadEvent {
    Started { lead_id: String },
    TaskAssigned { task: BeadsTask, worker: String },
    LeaseRenewed { task_id: String, worker: String, lease_expires: u64 },
    TaskCompleted { task_id: String, worker: String },
    TaskBlocked { task_id: String, worker: String, reason: String },
    HeartbeatWritten { active_task_count: usize },
    Stopped { lead_id: String },
}

/// Peer liveness transitions seen by a [`crate::GossipMonitor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GossipEvent {
    PeerDiscovered { name: String, id: String },
    PeerRecovered { name: String },
    /// The peer reported itself unhealthy.
    PeerUnhealthy { name: String },
    NewLeader { name: String, id: String },
    /// No heartbeat within the staleness threshold.
    PeerStale { name: String, last_heartbeat: u64 },
    LeaderLost { name: String },
    Stopped,
}

/// Decisions made by a [`crate::LeaderWatchdog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchdogEvent {
    LeaderDetected { lead_id: String, lead_name: String },
    LeaderStale { lead_id: String, age_ms: u64 },
    ElectionFailed,
    ElectionWon { winner_id: String },
    Promoted { id: String },
    /// Another leader's heartbeat took over, or our own went stale.
    Demoted { id: String },
    Stopped,
}
