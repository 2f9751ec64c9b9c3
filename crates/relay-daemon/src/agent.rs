//! Coordination runtime for one agent process.
//!
//! Wires the gossip monitor, leader watchdog and (once promoted) a lead
//! coordinator to a live relay connection:
//!
//! - gossip heartbeats go out as broadcasts and come back as DELIVERs;
//! - healthy gossip peers are both the election candidates and the
//!   coordinator's worker pool;
//! - winning an election starts a lead coordinator and registers it;
//!   losing leadership stops and unregisters it.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use relay_coordination::{
    CandidateSource, CoordinationResult, FileHeartbeatStore, GossipConfig, GossipMonitor,
    HeartbeatStore, JsonlTaskLog, LeadConfig, LeaderWatchdog, MessageSink,
    StatelessLeadCoordinator, TaskLog, WatchdogConfig, WorkerReport, WorkerSource,
};
use relay_protocol::{now_ms, Envelope, MessageType, SendPayload};

use crate::client::RelayClient;
use crate::config::CoordinationConfig;
use crate::state::CoordinatorRegistry;

/// Applies watchdog transitions to this agent's lead coordinator, one at a
/// time and in the order they happened. `true` means take the lead.
struct Leadership {
    config: LeadConfig,
    task_log: Arc<dyn TaskLog>,
    workers: Arc<dyn WorkerSource>,
    sink: Arc<dyn MessageSink>,
    heartbeats: Arc<dyn HeartbeatStore>,
    gossip: Arc<GossipMonitor>,
    coordinators: CoordinatorRegistry,
}

impl Leadership {
    async fn run(self, mut transitions: mpsc::UnboundedReceiver<bool>) {
        while let Some(lead) = transitions.recv().await {
            if lead {
                self.take_lead().await;
            } else {
                self.step_down().await;
            }
        }
    }

    async fn take_lead(&self) {
        let lead_id = &self.config.lead_id;
        if self.coordinators.read().await.contains_key(lead_id) {
            return;
        }
        let coordinator = Arc::new(StatelessLeadCoordinator::new(
            self.config.clone(),
            Arc::clone(&self.task_log),
            Arc::clone(&self.workers),
            Arc::clone(&self.sink),
            Arc::clone(&self.heartbeats),
        ));
        match coordinator.start().await {
            Ok(()) => {
                self.gossip.set_leader(true).await;
                self.coordinators.write().await.insert(lead_id.clone(), coordinator);
            }
            Err(e) => tracing::warn!(error = %e, "Lead coordinator failed to start"),
        }
    }

    async fn step_down(&self) {
        let coordinator = self.coordinators.write().await.remove(&self.config.lead_id);
        if let Some(coordinator) = coordinator {
            coordinator.stop().await;
            tracing::info!(agent = %self.config.lead_name, "Lead coordinator handed off");
        }
        self.gossip.set_leader(false).await;
    }
}

type PendingLeadership = (Leadership, mpsc::UnboundedReceiver<bool>);

pub struct AgentRuntime {
    name: String,
    id: String,
    client: Arc<RelayClient>,
    gossip: Arc<GossipMonitor>,
    watchdog: Arc<LeaderWatchdog>,
    coordinators: CoordinatorRegistry,
    leadership: Mutex<Option<PendingLeadership>>,
    leadership_task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRuntime {
    /// Runtime backed by the task log and heartbeat files named in
    /// `[coordination]`.
    pub fn from_config(
        client: Arc<RelayClient>,
        config: &CoordinationConfig,
        coordinators: CoordinatorRegistry,
    ) -> Self {
        Self::new(
            client,
            Arc::new(JsonlTaskLog::new(&config.task_log)),
            Arc::new(FileHeartbeatStore::new(&config.lead_heartbeat)),
            config,
            coordinators,
        )
    }

    pub fn new(
        client: Arc<RelayClient>,
        task_log: Arc<dyn TaskLog>,
        heartbeats: Arc<dyn HeartbeatStore>,
        config: &CoordinationConfig,
        coordinators: CoordinatorRegistry,
    ) -> Self {
        let name = client.agent().to_string();
        let id = uuid::Uuid::new_v4().to_string();
        let sink: Arc<dyn MessageSink> = client.clone();

        let gossip = Arc::new(GossipMonitor::new(
            GossipConfig {
                interval_ms: config.gossip_interval_ms,
                stale_after_ms: config.gossip_stale_ms,
                ..GossipConfig::new(name.clone(), id.clone(), now_ms())
            },
            Arc::clone(&sink),
        ));

        let lead_config = LeadConfig {
            lease_duration_ms: config.lease_duration_ms,
            poll_interval_ms: config.poll_interval_ms,
            heartbeat_interval_ms: config.heartbeat_interval_ms,
            ..LeadConfig::new(name.clone(), id.clone())
        };
        let leadership = Leadership {
            config: lead_config,
            task_log,
            workers: gossip.clone(),
            sink,
            heartbeats: Arc::clone(&heartbeats),
            gossip: Arc::clone(&gossip),
            coordinators: Arc::clone(&coordinators),
        };
        let (transitions, transitions_rx) = mpsc::unbounded_channel();
        let promote = {
            let transitions = transitions.clone();
            move || {
                let _ = transitions.send(true);
            }
        };
        let demote = move || {
            let _ = transitions.send(false);
        };

        let candidates: Arc<dyn CandidateSource> = gossip.clone();
        let watchdog = Arc::new(
            LeaderWatchdog::new(
                WatchdogConfig {
                    poll_interval_ms: config.watchdog_interval_ms,
                    stale_after_ms: config.leader_stale_ms,
                    // Let one gossip round fill the candidate set.
                    initial_delay_ms: config.gossip_interval_ms,
                    ..WatchdogConfig::new(id.clone(), name.clone())
                },
                heartbeats,
                candidates,
            )
            .with_promotion(promote)
            .with_demotion(demote),
        );

        Self {
            name,
            id,
            client,
            gossip,
            watchdog,
            coordinators,
            leadership: Mutex::new(Some((leadership, transitions_rx))),
            leadership_task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gossip(&self) -> &Arc<GossipMonitor> {
        &self.gossip
    }

    pub fn watchdog(&self) -> &Arc<LeaderWatchdog> {
        &self.watchdog
    }

    /// Our coordinator, if this agent has been promoted.
    pub async fn coordinator(&self) -> Option<Arc<StatelessLeadCoordinator>> {
        self.coordinators.read().await.get(&self.id).cloned()
    }

    pub async fn start(&self) -> CoordinationResult<()> {
        if let Some((leadership, transitions)) = self.leadership.lock().await.take() {
            let task = tokio::spawn(leadership.run(transitions));
            *self.leadership_task.lock().await = Some(task);
        }
        self.gossip.start().await?;
        self.watchdog.start().await?;
        tracing::info!(agent = %self.name, id = %self.id, "Agent runtime started");
        Ok(())
    }

    /// Process inbound traffic until the relay connection closes.
    pub async fn run(&self) {
        while let Some(envelope) = self.client.recv().await {
            if envelope.kind == MessageType::Deliver {
                self.handle_delivery(&envelope).await;
            } else {
                tracing::debug!(agent = %self.name, kind = %envelope.kind, "Ignoring envelope");
            }
        }
        tracing::warn!(agent = %self.name, "Relay connection closed");
    }

    /// Route one DELIVER to gossip, the lead coordinator or the log, then
    /// ACK it.
    pub async fn handle_delivery(&self, envelope: &Envelope) {
        let now = now_ms();
        let from = envelope.from.clone().unwrap_or_default();
        match envelope.payload_as::<SendPayload>() {
            Ok(payload) => {
                if self.gossip.handle_message(&payload.body, now).await.is_none() {
                    self.handle_message(&from, &payload, now).await;
                }
            }
            Err(e) => tracing::warn!(from = %from, error = %e, "Undecodable delivery"),
        }
        if let Err(e) = self.client.ack(envelope, None) {
            tracing::debug!(error = %e, "ACK not sent");
        }
    }

    async fn handle_message(&self, from: &str, payload: &SendPayload, now: u64) {
        let data = payload.data.as_ref();
        if let Some(report) = data.and_then(WorkerReport::from_data) {
            let Some(coordinator) = self.coordinator().await else {
                tracing::debug!(from = %from, "Worker report received while not leading");
                return;
            };
            if let Err(e) = coordinator.handle_worker_report(from, report, now).await {
                tracing::warn!(from = %from, error = %e, "Worker report rejected");
            }
            return;
        }
        let is_assignment = data
            .and_then(|d| d.get("kind"))
            .and_then(|k| k.as_str())
            == Some("task_assignment");
        if is_assignment {
            let task_id = data
                .and_then(|d| d.pointer("/task/id"))
                .and_then(|v| v.as_str())
                .unwrap_or("?");
            tracing::info!(lead = %from, task_id, "Task assigned to this agent");
            return;
        }
        tracing::info!(from = %from, body = %payload.body, "Message received");
    }

    /// Stop every timer, any coordinator this process started, and say BYE.
    pub async fn stop(&self) {
        self.watchdog.stop().await;
        if let Some(task) = self.leadership_task.lock().await.take() {
            task.abort();
        }
        let coordinators: Vec<_> = self.coordinators.write().await.drain().collect();
        for (_, coordinator) in coordinators {
            coordinator.stop().await;
        }
        self.gossip.stop().await;
        let _ = self.client.bye();
    }
}
