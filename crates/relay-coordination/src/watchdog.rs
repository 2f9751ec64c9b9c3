//! Leader watchdog and deterministic election.
//!
//! Every agent polls the lead heartbeat record. When it is missing or stale
//! the agents each run the same election over the same healthy candidate set
//! and agree on the winner without talking to each other: earliest spawn
//! time wins, ties broken by id. Only the winner promotes itself.
//!
//! A leader steps down as soon as a fresh heartbeat names someone else, or
//! when its own heartbeat goes stale (its coordinator died).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use relay_protocol::now_ms;

use crate::events::{WatchdogEvent, EVENT_CAPACITY};
use crate::heartbeat::{HeartbeatStore, LeadHeartbeat};
use crate::runner::Runner;
use crate::CoordinationResult;

/// An agent eligible to lead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    /// Epoch ms the agent process started.
    pub spawned_at: u64,
}

/// Pick the leader among `candidates`: earliest `spawned_at`, then smallest
/// id. The result does not depend on input order.
pub fn elect_leader(candidates: &[Candidate]) -> Option<Candidate> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.spawned_at
                .cmp(&b.spawned_at)
                .then_with(|| a.id.cmp(&b.id))
        })
        .cloned()
}

/// Supplies the currently healthy candidates.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn candidates(&self) -> Vec<Candidate>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCandidates(pub Vec<Candidate>);

#[async_trait]
impl CandidateSource for StaticCandidates {
    async fn candidates(&self) -> Vec<Candidate> {
        self.0.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    pub id: String,
    pub name: String,
    pub poll_interval_ms: u64,
    /// Heartbeats older than this are treated as a dead leader.
    pub stale_after_ms: u64,
    /// Delay before the first poll, giving gossip time to fill the
    /// candidate set.
    #[serde(default)]
    pub initial_delay_ms: u64,
}

impl WatchdogConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            poll_interval_ms: 5_000,
            stale_after_ms: 30_000,
            initial_delay_ms: 0,
        }
    }
}

/// Outcome of one [`LeaderWatchdog::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogDecision {
    /// We lead and our heartbeat is fresh.
    SelfLeader,
    /// A fresh heartbeat names a leader other than our running self.
    HealthyLeader { lead_id: String },
    /// An election ran. `promoted` is true when we won.
    Elected { winner: Candidate, promoted: bool },
    /// No candidates; nobody leads.
    ElectionFailed,
}

/// Run on every transition into (or out of) leadership.
pub type PromotionCallback = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Default)]
struct WatchdogState {
    is_leader: bool,
    known_leader: Option<String>,
}

pub struct LeaderWatchdog {
    config: WatchdogConfig,
    store: Arc<dyn HeartbeatStore>,
    candidates: Arc<dyn CandidateSource>,
    on_promote: Option<PromotionCallback>,
    on_demote: Option<PromotionCallback>,
    state: RwLock<WatchdogState>,
    events: broadcast::Sender<WatchdogEvent>,
    runner: Runner,
}

impl LeaderWatchdog {
    pub fn new(
        config: WatchdogConfig,
        store: Arc<dyn HeartbeatStore>,
        candidates: Arc<dyn CandidateSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            store,
            candidates,
            on_promote: None,
            on_demote: None,
            state: RwLock::new(WatchdogState::default()),
            events,
            runner: Runner::new(),
        }
    }

    /// Callback run each time this watchdog becomes leader.
    pub fn with_promotion<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_promote = Some(Box::new(f));
        self
    }

    /// Callback run each time this watchdog gives up leadership.
    pub fn with_demotion<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_demote = Some(Box::new(f));
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: WatchdogEvent) {
        let _ = self.events.send(event);
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.is_leader
    }

    async fn note_leader(&self, hb: &LeadHeartbeat) {
        let mut state = self.state.write().await;
        if state.known_leader.as_deref() != Some(hb.lead_id.as_str()) {
            state.known_leader = Some(hb.lead_id.clone());
            drop(state);
            tracing::info!(lead = %hb.lead_name, lead_id = %hb.lead_id, "Leader detected");
            self.emit(WatchdogEvent::LeaderDetected {
                lead_id: hb.lead_id.clone(),
                lead_name: hb.lead_name.clone(),
            });
        }
    }

    /// One poll of the heartbeat record.
    pub async fn check(&self, now: u64) -> CoordinationResult<WatchdogDecision> {
        match self.store.read().await? {
            Some(hb) if hb.age_ms(now) > self.config.stale_after_ms => {
                let age_ms = hb.age_ms(now);
                tracing::warn!(lead_id = %hb.lead_id, age_ms, "Leader heartbeat is stale");
                self.emit(WatchdogEvent::LeaderStale {
                    lead_id: hb.lead_id.clone(),
                    age_ms,
                });
                self.state.write().await.known_leader = None;
                if hb.lead_id == self.config.id {
                    self.demote().await;
                }
                self.elect().await
            }
            Some(hb) if hb.lead_id == self.config.id && self.is_leader().await => {
                self.note_leader(&hb).await;
                Ok(WatchdogDecision::SelfLeader)
            }
            Some(hb) => {
                if hb.lead_id != self.config.id {
                    self.demote().await;
                }
                self.note_leader(&hb).await;
                Ok(WatchdogDecision::HealthyLeader { lead_id: hb.lead_id })
            }
            None => {
                tracing::debug!(agent = %self.config.name, "No leader heartbeat");
                self.elect().await
            }
        }
    }

    async fn elect(&self) -> CoordinationResult<WatchdogDecision> {
        let candidates = self.candidates.candidates().await;
        let Some(winner) = elect_leader(&candidates) else {
            tracing::warn!(agent = %self.config.name, "Election failed: no healthy candidates");
            self.emit(WatchdogEvent::ElectionFailed);
            return Ok(WatchdogDecision::ElectionFailed);
        };

        tracing::info!(
            winner = %winner.name,
            winner_id = %winner.id,
            candidates = candidates.len(),
            "Election decided"
        );
        self.emit(WatchdogEvent::ElectionWon {
            winner_id: winner.id.clone(),
        });

        let promoted = winner.id == self.config.id;
        if promoted {
            self.promote().await;
        }
        Ok(WatchdogDecision::Elected { winner, promoted })
    }

    async fn promote(&self) {
        {
            let mut state = self.state.write().await;
            if state.is_leader {
                return;
            }
            state.is_leader = true;
        }
        tracing::info!(agent = %self.config.name, "Promoted to leader");
        self.emit(WatchdogEvent::Promoted {
            id: self.config.id.clone(),
        });
        if let Some(callback) = &self.on_promote {
            callback();
        }
    }

    async fn demote(&self) {
        {
            let mut state = self.state.write().await;
            if !state.is_leader {
                return;
            }
            state.is_leader = false;
        }
        tracing::warn!(agent = %self.config.name, "Stepping down as leader");
        self.emit(WatchdogEvent::Demoted {
            id: self.config.id.clone(),
        });
        if let Some(callback) = &self.on_demote {
            callback();
        }
    }

    pub async fn start(self: &Arc<Self>) -> CoordinationResult<()> {
        let this = Arc::clone(self);
        self.runner
            .launch("leader watchdog", move |mut shutdown| async move {
                let first = tokio::time::Instant::now()
                    + Duration::from_millis(this.config.initial_delay_ms);
                let mut poll = tokio::time::interval_at(
                    first,
                    Duration::from_millis(this.config.poll_interval_ms),
                );
                loop {
                    tokio::select! {
                        _ = poll.tick() => {
                            if let Err(e) = this.check(now_ms()).await {
                                tracing::warn!(error = %e, "Leader heartbeat unreadable");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
            .await?;
        tracing::info!(agent = %self.config.name, "Leader watchdog started");
        Ok(())
    }

    pub async fn stop(&self) {
        if self.runner.stop().await {
            tracing::info!(agent = %self.config.name, "Leader watchdog stopped");
            self.emit(WatchdogEvent::Stopped);
        }
    }
}
