//! Gossip health monitor.
//!
//! Every agent broadcasts `HEARTBEAT: <json>` on the shared broadcast target
//! and folds the heartbeats it hears into a local peer table. Nothing is
//! acknowledged; a peer that goes quiet is flipped unhealthy by a local
//! staleness check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use relay_protocol::{now_ms, BROADCAST_TARGET, HEARTBEAT_TAG};

use crate::events::{GossipEvent, EVENT_CAPACITY};
use crate::runner::Runner;
use crate::transport::{MessageSink, WorkerSource};
use crate::watchdog::{Candidate, CandidateSource};
use crate::CoordinationResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipConfig {
    pub name: String,
    pub id: String,
    /// Epoch ms this agent process started; used for leader election.
    pub spawned_at: u64,
    pub interval_ms: u64,
    pub stale_after_ms: u64,
}

impl GossipConfig {
    pub fn new(name: impl Into<String>, id: impl Into<String>, spawned_at: u64) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            spawned_at,
            interval_ms: 5_000,
            stale_after_ms: 15_000,
        }
    }
}

/// Body of a gossip broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipHeartbeat {
    pub name: String,
    pub id: String,
    pub timestamp: u64,
    #[serde(default)]
    pub load: f64,
    pub healthy: bool,
    #[serde(default)]
    pub is_leader: bool,
    #[serde(default)]
    pub task_count: usize,
    #[serde(default)]
    pub spawned_at: u64,
}

/// `HEARTBEAT: {"name":...}`
pub fn format_heartbeat(heartbeat: &GossipHeartbeat) -> String {
    let json = serde_json::to_string(heartbeat).unwrap_or_else(|_| "{}".to_string());
    format!("{HEARTBEAT_TAG} {json}")
}

/// Parse a message body, returning `None` for anything that is not a
/// well-formed gossip heartbeat.
pub fn parse_heartbeat(body: &str) -> Option<GossipHeartbeat> {
    let json = body.trim_start().strip_prefix(HEARTBEAT_TAG)?;
    serde_json::from_str(json.trim()).ok()
}

/// What this process knows about one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerHealth {
    pub name: String,
    pub id: String,
    /// Local receipt time of the latest heartbeat.
    pub last_heartbeat: u64,
    pub load: f64,
    pub healthy: bool,
    pub is_leader: bool,
    pub task_count: usize,
    pub spawned_at: u64,
    pub first_seen: u64,
    /// Set by the staleness check, cleared by the next heartbeat.
    #[serde(default)]
    pub stale: bool,
}

/// Values this agent advertises about itself.
#[derive(Debug, Clone, PartialEq)]
struct LocalStatus {
    load: f64,
    healthy: bool,
    is_leader: bool,
    task_count: usize,
}

#[derive(Default)]
struct PeerTable {
    peers: HashMap<String, PeerHealth>,
    leader: Option<String>,
}

pub struct GossipMonitor {
    config: GossipConfig,
    sink: Arc<dyn MessageSink>,
    local: RwLock<LocalStatus>,
    table: RwLock<PeerTable>,
    events: broadcast::Sender<GossipEvent>,
    runner: Runner,
}

impl GossipMonitor {
    pub fn new(config: GossipConfig, sink: Arc<dyn MessageSink>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            sink,
            local: RwLock::new(LocalStatus {
                load: 0.0,
                healthy: true,
                is_leader: false,
                task_count: 0,
            }),
            table: RwLock::new(PeerTable::default()),
            events,
            runner: Runner::new(),
        }
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.events.subscribe()
    }

    fn emit_all(&self, events: &[GossipEvent]) {
        for event in events {
            let _ = self.events.send(event.clone());
        }
    }

    pub async fn set_leader(&self, is_leader: bool) {
        self.local.write().await.is_leader = is_leader;
    }

    pub async fn set_load(&self, load: f64, task_count: usize) {
        let mut local = self.local.write().await;
        local.load = load;
        local.task_count = task_count;
    }

    pub async fn set_healthy(&self, healthy: bool) {
        self.local.write().await.healthy = healthy;
    }

    /// Our own heartbeat as it would be broadcast at `now`.
    pub async fn own_heartbeat(&self, now: u64) -> GossipHeartbeat {
        let local = self.local.read().await;
        GossipHeartbeat {
            name: self.config.name.clone(),
            id: self.config.id.clone(),
            timestamp: now,
            load: local.load,
            healthy: local.healthy,
            is_leader: local.is_leader,
            task_count: local.task_count,
            spawned_at: self.config.spawned_at,
        }
    }

    pub async fn broadcast_heartbeat(&self, now: u64) -> CoordinationResult<()> {
        let heartbeat = self.own_heartbeat(now).await;
        self.sink
            .send_message(BROADCAST_TARGET, &format_heartbeat(&heartbeat), None)
            .await
    }

    /// Fold one peer heartbeat into the table. Our own heartbeats are ignored.
    pub async fn handle_heartbeat(&self, hb: GossipHeartbeat, now: u64) -> Vec<GossipEvent> {
        if hb.name == self.config.name || hb.id == self.config.id {
            return Vec::new();
        }

        let mut events = Vec::new();
        let mut table = self.table.write().await;

        match table.peers.get_mut(&hb.name) {
            None => {
                tracing::info!(peer = %hb.name, peer_id = %hb.id, "Peer discovered");
                events.push(GossipEvent::PeerDiscovered {
                    name: hb.name.clone(),
                    id: hb.id.clone(),
                });
                table.peers.insert(
                    hb.name.clone(),
                    PeerHealth {
                        name: hb.name.clone(),
                        id: hb.id.clone(),
                        last_heartbeat: now,
                        load: hb.load,
                        healthy: hb.healthy,
                        is_leader: hb.is_leader,
                        task_count: hb.task_count,
                        spawned_at: hb.spawned_at,
                        first_seen: now,
                        stale: false,
                    },
                );
            }
            Some(peer) => {
                if !peer.healthy && hb.healthy {
                    tracing::info!(peer = %hb.name, "Peer recovered");
                    events.push(GossipEvent::PeerRecovered {
                        name: hb.name.clone(),
                    });
                } else if peer.healthy && !hb.healthy {
                    tracing::warn!(peer = %hb.name, "Peer reports unhealthy");
                    events.push(GossipEvent::PeerUnhealthy {
                        name: hb.name.clone(),
                    });
                }
                peer.id = hb.id.clone();
                peer.last_heartbeat = now;
                peer.load = hb.load;
                peer.healthy = hb.healthy;
                peer.task_count = hb.task_count;
                peer.spawned_at = hb.spawned_at;
                peer.stale = false;
            }
        }

        let was_leader = table
            .peers
            .get(&hb.name)
            .map(|p| p.is_leader)
            .unwrap_or(false);
        if hb.is_leader && (!was_leader || table.leader.as_deref() != Some(hb.name.as_str())) {
            tracing::info!(peer = %hb.name, "New leader announced");
            events.push(GossipEvent::NewLeader {
                name: hb.name.clone(),
                id: hb.id.clone(),
            });
            table.leader = Some(hb.name.clone());
        } else if !hb.is_leader && table.leader.as_deref() == Some(hb.name.as_str()) {
            table.leader = None;
        }
        if let Some(peer) = table.peers.get_mut(&hb.name) {
            peer.is_leader = hb.is_leader;
        }

        drop(table);
        self.emit_all(&events);
        events
    }

    /// Handle a delivered message body. Returns `None` if it was not gossip.
    pub async fn handle_message(&self, body: &str, now: u64) -> Option<Vec<GossipEvent>> {
        let heartbeat = parse_heartbeat(body)?;
        Some(self.handle_heartbeat(heartbeat, now).await)
    }

    /// Flip healthy peers unheard-from for longer than the staleness
    /// threshold. Each silence produces exactly one `PeerStale`; peers that
    /// already reported themselves unhealthy are left alone.
    pub async fn check_stale(&self, now: u64) -> Vec<GossipEvent> {
        let mut events = Vec::new();
        let mut table = self.table.write().await;
        let threshold = self.config.stale_after_ms;

        let mut lost_leader = false;
        let current_leader = table.leader.clone();
        for peer in table.peers.values_mut() {
            // Only a peer still marked healthy can go stale.
            if !peer.healthy || now.saturating_sub(peer.last_heartbeat) <= threshold {
                continue;
            }
            peer.stale = true;
            peer.healthy = false;
            tracing::warn!(
                peer = %peer.name,
                silent_ms = now.saturating_sub(peer.last_heartbeat),
                "Peer went stale"
            );
            events.push(GossipEvent::PeerStale {
                name: peer.name.clone(),
                last_heartbeat: peer.last_heartbeat,
            });
            if current_leader.as_deref() == Some(peer.name.as_str()) {
                lost_leader = true;
                events.push(GossipEvent::LeaderLost {
                    name: peer.name.clone(),
                });
            }
        }
        if lost_leader {
            tracing::warn!(leader = ?current_leader, "Leader lost");
            table.leader = None;
        }

        drop(table);
        self.emit_all(&events);
        events
    }

    pub async fn peer(&self, name: &str) -> Option<PeerHealth> {
        self.table.read().await.peers.get(name).cloned()
    }

    pub async fn peers(&self) -> Vec<PeerHealth> {
        let mut peers: Vec<PeerHealth> = self.table.read().await.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub async fn healthy_peers(&self) -> Vec<PeerHealth> {
        self.peers().await.into_iter().filter(|p| p.healthy).collect()
    }

    /// Name of the peer currently believed to be leader.
    pub async fn leader(&self) -> Option<String> {
        self.table.read().await.leader.clone()
    }

    pub async fn start(self: &Arc<Self>) -> CoordinationResult<()> {
        let this = Arc::clone(self);
        self.runner
            .launch("gossip monitor", move |mut shutdown| async move {
                let period = Duration::from_millis(this.config.interval_ms);
                let mut announce = tokio::time::interval(period);
                let mut sweep = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = announce.tick() => {
                            if let Err(e) = this.broadcast_heartbeat(now_ms()).await {
                                tracing::debug!(error = %e, "Gossip heartbeat not sent");
                            }
                        }
                        _ = sweep.tick() => {
                            this.check_stale(now_ms()).await;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
            .await?;
        tracing::info!(agent = %self.config.name, "Gossip monitor started");
        Ok(())
    }

    pub async fn stop(&self) {
        if self.runner.stop().await {
            tracing::info!(agent = %self.config.name, "Gossip monitor stopped");
            let _ = self.events.send(GossipEvent::Stopped);
        }
    }
}

/// Healthy peers plus this agent are the election candidates.
#[async_trait]
impl CandidateSource for GossipMonitor {
    async fn candidates(&self) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = self
            .healthy_peers()
            .await
            .into_iter()
            .map(|p| Candidate {
                id: p.id,
                name: p.name,
                spawned_at: p.spawned_at,
            })
            .collect();
        if self.local.read().await.healthy {
            candidates.push(Candidate {
                id: self.config.id.clone(),
                name: self.config.name.clone(),
                spawned_at: self.config.spawned_at,
            });
        }
        candidates
    }
}

/// Healthy peers that are not leading are the worker pool.
#[async_trait]
impl WorkerSource for GossipMonitor {
    async fn available_workers(&self) -> Vec<String> {
        self.healthy_peers()
            .await
            .into_iter()
            .filter(|p| !p.is_leader)
            .map(|p| p.name)
            .collect()
    }
}
