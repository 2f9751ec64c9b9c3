//! Relay Coordination - fault-tolerant work distribution over the relay
//!
//! Three independent primitives that share nothing but the message bus and
//! two durable records:
//!
//! - [`StatelessLeadCoordinator`] leases tasks from the beads task log.
//! - [`GossipMonitor`] derives peer liveness from broadcast heartbeats.
//! - [`LeaderWatchdog`] watches the lead heartbeat and runs elections.

pub mod beads;
pub mod error;
pub mod events;
pub mod gossip;
pub mod heartbeat;
pub mod lead;
mod runner;
pub mod transport;
pub mod watchdog;

pub use beads::{ready_tasks, BeadsTask, JsonlTaskLog, MemoryTaskLog, TaskLog, TaskMutation, TaskStatus};
pub use error::*;
pub use events::{GossipEvent, LeadEvent, WatchdogEvent};
pub use gossip::{format_heartbeat, parse_heartbeat, GossipConfig, GossipHeartbeat, GossipMonitor, PeerHealth};
pub use heartbeat::{FileHeartbeatStore, HeartbeatStore, LeadHeartbeat, MemoryHeartbeatStore};
pub use lead::{LeadConfig, StatelessLeadCoordinator, WorkerReport};
pub use transport::{MessageSink, OutboundMessage, StaticWorkers, WorkerSource};
pub use watchdog::{
    elect_leader, Candidate, CandidateSource, LeaderWatchdog, PromotionCallback, StaticCandidates,
    WatchdogConfig, WatchdogDecision,
};
