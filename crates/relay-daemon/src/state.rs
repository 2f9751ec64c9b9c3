//! The daemon registry: every piece of mutable router state, owned by one
//! [`DaemonState`] and threaded through the connection handlers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};

use relay_coordination::StatelessLeadCoordinator;
use relay_protocol::{Envelope, ShadowBindPayload};
use relay_storage::{open_channel_store, open_store, ChannelMembershipStore, MessageStore};

use crate::bridge::{ProjectBridge, SocketBridge};
use crate::config::{DaemonConfig, RelayAddr, RelayConfig};
use crate::rate_limit::RateLimiter;
use crate::spawner::Spawner;
use crate::{RouterError, RouterResult};

/// Lead coordinators running in this process, keyed by lead id.
pub type CoordinatorRegistry = Arc<RwLock<HashMap<String, Arc<StatelessLeadCoordinator>>>>;

pub fn new_coordinator_registry() -> CoordinatorRegistry {
    Arc::new(RwLock::new(HashMap::new()))
}

/// A live, handshaken connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: u64,
    pub agent: String,
    pub session_id: String,
    pub project: Option<String>,
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub connected_at: u64,
}

/// A delivered SEND awaiting its ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub stored_id: String,
    pub sender: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowBinding {
    pub primary: String,
    pub receive_incoming: bool,
    pub receive_outgoing: bool,
}

/// Sequence counter key: (recipient, topic, sender).
type StreamKey = (String, String, String);

#[derive(Default)]
struct RouterTables {
    connections: HashMap<String, ConnectionHandle>,
    seqs: HashMap<StreamKey, u64>,
    seeded: HashSet<String>,
    /// Keyed by (envelope id, recipient).
    pending: HashMap<(String, String), PendingDelivery>,
    /// Keyed by the shadowing agent.
    shadows: HashMap<String, ShadowBinding>,
    /// Serializes every delivery to one recipient, including handshake
    /// flushes and SYNC replays.
    gates: HashMap<String, Arc<Mutex<()>>>,
}

pub struct DaemonState {
    pub config: DaemonConfig,
    pub store: Arc<dyn MessageStore>,
    pub channels: Arc<dyn ChannelMembershipStore>,
    pub coordinators: CoordinatorRegistry,
    bridges: HashMap<String, Arc<dyn ProjectBridge>>,
    spawner: Option<Arc<dyn Spawner>>,
    tables: RwLock<RouterTables>,
    rate_limiter: Mutex<RateLimiter>,
    next_conn_id: AtomicU64,
}

impl DaemonState {
    pub fn new(
        config: DaemonConfig,
        store: Arc<dyn MessageStore>,
        channels: Arc<dyn ChannelMembershipStore>,
    ) -> Self {
        let rate_limiter = RateLimiter::from_config(&config.rate_limit);
        Self {
            config,
            store,
            channels,
            coordinators: new_coordinator_registry(),
            bridges: HashMap::new(),
            spawner: None,
            tables: RwLock::new(RouterTables::default()),
            rate_limiter: Mutex::new(rate_limiter),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Build the full registry from configuration: storage with fallback,
    /// the channel store and one socket bridge per `[bridges]` entry.
    pub async fn open(config: &RelayConfig) -> RouterResult<Self> {
        let store = open_store(&config.storage).await;
        let health = store.health_check().await;
        match &health.error {
            Some(error) => tracing::warn!(driver = %health.driver, %error, "Storage degraded"),
            None => tracing::info!(driver = %health.driver, persistent = health.persistent, "Storage ready"),
        }
        let channels = open_channel_store(config.channels.backend, config.data_dir()).await;

        let mut state = Self::new(config.daemon.clone(), store, channels);
        let bridge_name = format!("bridge-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        for (project, addr) in &config.bridges {
            let addr = RelayAddr::parse(addr)?;
            tracing::info!(project = %project, addr = %addr, "Project bridge configured");
            state = state.with_bridge(
                project.clone(),
                Arc::new(SocketBridge::new(project.clone(), addr, bridge_name.clone())),
            );
        }
        Ok(state)
    }

    pub fn with_bridge(mut self, project: impl Into<String>, bridge: Arc<dyn ProjectBridge>) -> Self {
        self.bridges.insert(project.into(), bridge);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_coordinators(mut self, coordinators: CoordinatorRegistry) -> Self {
        self.coordinators = coordinators;
        self
    }

    pub fn bridge(&self, project: &str) -> Option<Arc<dyn ProjectBridge>> {
        self.bridges.get(project).cloned()
    }

    pub fn spawner(&self) -> Option<Arc<dyn Spawner>> {
        self.spawner.clone()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Delivery gate for `agent`. Hold it while registering, flushing or
    /// delivering so per-recipient order is total.
    pub async fn gate(&self, agent: &str) -> Arc<Mutex<()>> {
        if let Some(gate) = self.tables.read().await.gates.get(agent) {
            return Arc::clone(gate);
        }
        let mut tables = self.tables.write().await;
        Arc::clone(tables.gates.entry(agent.to_string()).or_default())
    }

    /// Add a live connection. Fails if the name is already connected.
    pub async fn register(&self, handle: ConnectionHandle) -> RouterResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.connections.get(&handle.agent) {
            if !existing.outbound.is_closed() {
                return Err(RouterError::handshake(
                    "DUPLICATE_AGENT",
                    format!("agent '{}' is already connected", handle.agent),
                ));
            }
        }
        tables.connections.insert(handle.agent.clone(), handle);
        Ok(())
    }

    /// Remove `agent` if the registered connection is still `conn_id`.
    pub async fn unregister(&self, agent: &str, conn_id: u64) -> bool {
        let mut tables = self.tables.write().await;
        let matches = tables
            .connections
            .get(agent)
            .is_some_and(|h| h.conn_id == conn_id);
        if matches {
            tables.connections.remove(agent);
            tables.shadows.remove(agent);
            // Unacked deliveries stay `delivered` in storage; late ACKs
            // resolve through the store.
            tables.pending.retain(|(_, recipient), _| recipient != agent);
        }
        drop(tables);
        if matches {
            self.rate_limiter.lock().await.forget(agent);
        }
        matches
    }

    pub async fn connection(&self, agent: &str) -> Option<ConnectionHandle> {
        self.tables
            .read()
            .await
            .connections
            .get(agent)
            .filter(|h| !h.outbound.is_closed())
            .cloned()
    }

    /// Names of connected agents, sorted.
    pub async fn live_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .tables
            .read()
            .await
            .connections
            .values()
            .filter(|h| !h.outbound.is_closed())
            .map(|h| h.agent.clone())
            .collect();
        agents.sort();
        agents
    }

    // -----------------------------------------------------------------------
    // Sequences
    // -----------------------------------------------------------------------

    /// Next delivery sequence on (recipient, topic, sender). The first call
    /// for a recipient seeds its counters from the store so numbering
    /// continues across restarts.
    pub async fn next_seq(&self, recipient: &str, topic: &str, sender: &str) -> RouterResult<u64> {
        let seeded = self.tables.read().await.seeded.contains(recipient);
        if !seeded {
            let streams = self.store.get_max_seq_by_stream(recipient, None).await?;
            let mut tables = self.tables.write().await;
            if tables.seeded.insert(recipient.to_string()) {
                for stream in streams {
                    let counter = tables
                        .seqs
                        .entry((recipient.to_string(), stream.topic, stream.peer))
                        .or_insert(0);
                    *counter = (*counter).max(stream.max_seq);
                }
            }
        }

        let mut tables = self.tables.write().await;
        let counter = tables
            .seqs
            .entry((recipient.to_string(), topic.to_string(), sender.to_string()))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    // -----------------------------------------------------------------------
    // ACK tracking
    // -----------------------------------------------------------------------

    pub async fn track_pending(&self, envelope_id: &str, recipient: &str, pending: PendingDelivery) {
        self.tables
            .write()
            .await
            .pending
            .insert((envelope_id.to_string(), recipient.to_string()), pending);
    }

    pub async fn take_pending(&self, envelope_id: &str, recipient: &str) -> Option<PendingDelivery> {
        self.tables
            .write()
            .await
            .pending
            .remove(&(envelope_id.to_string(), recipient.to_string()))
    }

    pub async fn pending_count(&self) -> usize {
        self.tables.read().await.pending.len()
    }

    // -----------------------------------------------------------------------
    // Shadows
    // -----------------------------------------------------------------------

    pub async fn bind_shadow(&self, shadow: &str, bind: &ShadowBindPayload) {
        self.tables.write().await.shadows.insert(
            shadow.to_string(),
            ShadowBinding {
                primary: bind.primary_agent.clone(),
                receive_incoming: bind.receive_incoming,
                receive_outgoing: bind.receive_outgoing,
            },
        );
    }

    pub async fn unbind_shadow(&self, shadow: &str) -> bool {
        self.tables.write().await.shadows.remove(shadow).is_some()
    }

    /// Live shadows of `primary` that want traffic in this direction.
    pub async fn shadows_of(&self, primary: &str, incoming: bool) -> Vec<ConnectionHandle> {
        let tables = self.tables.read().await;
        let mut handles: Vec<ConnectionHandle> = tables
            .shadows
            .iter()
            .filter(|(_, b)| {
                b.primary == primary
                    && if incoming {
                        b.receive_incoming
                    } else {
                        b.receive_outgoing
                    }
            })
            .filter_map(|(shadow, _)| tables.connections.get(shadow).cloned())
            .collect();
        handles.sort_by(|a, b| a.agent.cmp(&b.agent));
        handles
    }

    // -----------------------------------------------------------------------
    // Rate limiting
    // -----------------------------------------------------------------------

    /// `Err(retry_after_ms)` when `agent` is over its SEND budget.
    pub async fn check_rate(&self, agent: &str) -> Result<(), u64> {
        self.rate_limiter.lock().await.check(agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_storage::{InMemoryChannelStore, InMemoryStore, MessageStatus, StoredMessage};

    fn state() -> DaemonState {
        DaemonState::new(
            DaemonConfig::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryChannelStore::default()),
        )
    }

    fn handle(agent: &str, conn_id: u64) -> (ConnectionHandle, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle {
                conn_id,
                agent: agent.into(),
                session_id: format!("s-{conn_id}"),
                project: None,
                outbound: tx,
                connected_at: 0,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_duplicate_live_name_rejected() {
        let state = state();
        let (first, _rx1) = handle("alice", 1);
        let (second, _rx2) = handle("alice", 2);
        state.register(first).await.unwrap();
        let err = state.register(second).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_AGENT");
    }

    #[tokio::test]
    async fn test_closed_connection_can_be_replaced() {
        let state = state();
        let (first, rx1) = handle("alice", 1);
        state.register(first).await.unwrap();
        drop(rx1);
        let (second, _rx2) = handle("alice", 2);
        state.register(second).await.unwrap();
        assert!(!state.unregister("alice", 1).await, "stale conn id must not evict");
        assert_eq!(state.live_agents().await, vec!["alice".to_string()]);
        assert!(state.unregister("alice", 2).await);
        assert!(state.live_agents().await.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_drops_recipient_pending_acks() {
        let state = state();
        let (bob, _rx) = handle("bob", 1);
        state.register(bob).await.unwrap();
        let delivery = |id: &str| PendingDelivery {
            stored_id: id.into(),
            sender: "alice".into(),
            correlation_id: None,
        };
        state.track_pending("e1", "bob", delivery("e1")).await;
        state.track_pending("e2", "bob", delivery("e2")).await;
        state.track_pending("e3", "carol", delivery("e3")).await;

        // A stale connection id leaves bob's entries alone.
        assert!(!state.unregister("bob", 7).await);
        assert_eq!(state.pending_count().await, 3);

        assert!(state.unregister("bob", 1).await);
        assert_eq!(state.pending_count().await, 1);
        assert!(state.take_pending("e3", "carol").await.is_some());
    }

    #[tokio::test]
    async fn test_sequences_per_stream() {
        let state = state();
        assert_eq!(state.next_seq("bob", "default", "alice").await.unwrap(), 1);
        assert_eq!(state.next_seq("bob", "default", "alice").await.unwrap(), 2);
        assert_eq!(state.next_seq("bob", "default", "carol").await.unwrap(), 1);
        assert_eq!(state.next_seq("bob", "builds", "alice").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sequences_seeded_from_store() {
        let store = Arc::new(InMemoryStore::new());
        store
            .save_message(&StoredMessage {
                id: "m1".into(),
                ts: 1,
                from: "alice".into(),
                to: "bob".into(),
                topic: None,
                kind: "message".into(),
                body: "hi".into(),
                data: None,
                thread: None,
                delivery_seq: Some(41),
                delivery_session_id: Some("old".into()),
                session_id: None,
                status: MessageStatus::Acked,
                is_urgent: false,
                is_broadcast: false,
            })
            .await
            .unwrap();
        let state = DaemonState::new(
            DaemonConfig::default(),
            store,
            Arc::new(InMemoryChannelStore::default()),
        );
        assert_eq!(state.next_seq("bob", "default", "alice").await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_shadow_direction_filter() {
        let state = state();
        let (shadow, _rx) = handle("auditor", 1);
        state.register(shadow).await.unwrap();
        state
            .bind_shadow(
                "auditor",
                &ShadowBindPayload {
                    primary_agent: "alice".into(),
                    receive_incoming: true,
                    receive_outgoing: false,
                },
            )
            .await;
        assert_eq!(state.shadows_of("alice", true).await.len(), 1);
        assert!(state.shadows_of("alice", false).await.is_empty());
        assert!(state.unbind_shadow("auditor").await);
        assert!(state.shadows_of("alice", true).await.is_empty());
    }
}
