//! Relay Daemon - message router, client and agent runtime
//!
//! The daemon accepts agent connections over a unix socket or TCP, performs
//! the HELLO/WELCOME handshake and routes envelopes between agents, channels
//! and remote projects. [`RelayClient`] is the agent side of the same
//! protocol, and [`AgentRuntime`] runs the coordination layer on top of it.

pub mod agent;
pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod spawner;
pub mod state;
mod wire;

pub use agent::AgentRuntime;
pub use bridge::{ProjectBridge, SocketBridge};
pub use client::{ClientOptions, RelayClient};
pub use config::{RelayAddr, RelayConfig};
pub use connection::serve_connection;
pub use error::*;
pub use router::{Flow, Router, Session};
pub use server::RelayServer;
pub use spawner::Spawner;
pub use state::{new_coordinator_registry, CoordinatorRegistry, DaemonState};
