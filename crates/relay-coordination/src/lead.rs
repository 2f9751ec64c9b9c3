//! Stateless, lease-based lead coordinator.
//!
//! The coordinator keeps no task queue. Every poll re-reads the task log,
//! pairs ready tasks with available workers and writes the leases back.
//! If the coordinator dies its heartbeat stops and outstanding leases expire
//! on their own, so a successor can pick up exactly where the log says.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use relay_protocol::now_ms;

use crate::beads::{ready_tasks, BeadsTask, TaskLog, TaskStatus};
use crate::events::{LeadEvent, EVENT_CAPACITY};
use crate::heartbeat::{HeartbeatStore, LeadHeartbeat};
use crate::runner::Runner;
use crate::transport::{MessageSink, WorkerSource};
use crate::{CoordinationError, CoordinationResult};

/// Configuration for a [`StatelessLeadCoordinator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadConfig {
    pub lead_name: String,
    pub lead_id: String,
    pub lease_duration_ms: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl LeadConfig {
    pub fn new(lead_name: impl Into<String>, lead_id: impl Into<String>) -> Self {
        Self {
            lead_name: lead_name.into(),
            lead_id: lead_id.into(),
            lease_duration_ms: 300_000,
            poll_interval_ms: 5_000,
            heartbeat_interval_ms: 10_000,
        }
    }
}

/// Progress reports a worker sends back to the lead, carried in the `data`
/// field of an ordinary SEND.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerReport {
    TaskRenew {
        task_id: String,
    },
    TaskComplete {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    TaskBlocked {
        task_id: String,
        reason: String,
    },
}

impl WorkerReport {
    pub fn from_data(data: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }

    pub fn to_data(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Leases ready tasks from a durable log to available workers.
pub struct StatelessLeadCoordinator {
    config: LeadConfig,
    task_log: Arc<dyn TaskLog>,
    workers: Arc<dyn WorkerSource>,
    sink: Arc<dyn MessageSink>,
    heartbeats: Arc<dyn HeartbeatStore>,
    events: broadcast::Sender<LeadEvent>,
    runner: Runner,
}

impl StatelessLeadCoordinator {
    pub fn new(
        config: LeadConfig,
        task_log: Arc<dyn TaskLog>,
        workers: Arc<dyn WorkerSource>,
        sink: Arc<dyn MessageSink>,
        heartbeats: Arc<dyn HeartbeatStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            task_log,
            workers,
            sink,
            heartbeats,
            events,
            runner: Runner::new(),
        }
    }

    pub fn config(&self) -> &LeadConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeadEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LeadEvent) {
        let _ = self.events.send(event);
    }

    /// One poll: lease ready tasks to idle workers, most urgent first.
    ///
    /// Returns the `(task, worker)` pairs that were written to the log.
    pub async fn tick(&self, now: u64) -> CoordinationResult<Vec<(BeadsTask, String)>> {
        let tasks = self.task_log.load().await?;
        let ready = ready_tasks(&tasks, now);
        if ready.is_empty() {
            return Ok(Vec::new());
        }

        let busy: HashSet<&str> = tasks
            .iter()
            .filter_map(|t| t.assignee.as_deref().filter(|a| t.is_leased_to(a, now)))
            .collect();
        let workers: Vec<String> = self
            .workers
            .available_workers()
            .await
            .into_iter()
            .filter(|w| !busy.contains(w.as_str()))
            .collect();

        let lease_expires = now + self.config.lease_duration_ms;
        let mut assigned = Vec::new();

        // Positional pairing: workers are treated as interchangeable.
        for (task, worker) in ready.into_iter().zip(workers) {
            let assignee = worker.clone();
            let updated = match self
                .task_log
                .update(
                    &task.id,
                    Box::new(move |t: &mut BeadsTask| {
                        t.status = TaskStatus::InProgress;
                        t.assignee = Some(assignee);
                        t.lease_expires = Some(lease_expires);
                        t.updated_at = now;
                        Ok(())
                    }),
                )
                .await
            {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to lease task");
                    continue;
                }
            };

            let data = serde_json::json!({
                "kind": "task_assignment",
                "task": &updated,
            });
            if let Err(e) = self
                .sink
                .send_message(&worker, &updated.assignment_body(), Some(data))
                .await
            {
                // The lease stands; if the worker never hears about it the
                // lease expires and the task is offered again.
                tracing::warn!(task_id = %updated.id, worker = %worker, error = %e, "Failed to send task assignment");
            }

            tracing::info!(
                task_id = %updated.id,
                worker = %worker,
                priority = updated.priority,
                lease_expires,
                "Task leased"
            );
            self.emit(LeadEvent::TaskAssigned {
                task: updated.clone(),
                worker: worker.clone(),
            });
            assigned.push((updated, worker));
        }

        Ok(assigned)
    }

    fn check_assignee(task: &BeadsTask, worker: &str) -> CoordinationResult<()> {
        if task.status.is_terminal() {
            return Err(CoordinationError::InvalidTransition {
                task_id: task.id.clone(),
                status: task.status.to_string(),
            });
        }
        if task.status != TaskStatus::InProgress || task.assignee.as_deref() != Some(worker) {
            return Err(CoordinationError::NotAssignee {
                task_id: task.id.clone(),
                agent: worker.to_string(),
            });
        }
        Ok(())
    }

    /// Extend the lease held by `worker` on `task_id`.
    pub async fn renew_lease(
        &self,
        task_id: &str,
        worker: &str,
        now: u64,
    ) -> CoordinationResult<BeadsTask> {
        let lease_expires = now + self.config.lease_duration_ms;
        let who = worker.to_string();
        let task = self
            .task_log
            .update(
                task_id,
                Box::new(move |t: &mut BeadsTask| {
                    Self::check_assignee(t, &who)?;
                    t.lease_expires = Some(lease_expires);
                    t.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        tracing::debug!(task_id, worker, lease_expires, "Lease renewed");
        self.emit(LeadEvent::LeaseRenewed {
            task_id: task_id.to_string(),
            worker: worker.to_string(),
            lease_expires,
        });
        Ok(task)
    }

    /// Close a task. Closed tasks are never offered again.
    pub async fn complete_task(
        &self,
        task_id: &str,
        worker: &str,
        reason: Option<String>,
        now: u64,
    ) -> CoordinationResult<BeadsTask> {
        let who = worker.to_string();
        let task = self
            .task_log
            .update(
                task_id,
                Box::new(move |t: &mut BeadsTask| {
                    Self::check_assignee(t, &who)?;
                    t.status = TaskStatus::Closed;
                    t.closed_reason = reason;
                    t.lease_expires = None;
                    t.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(task_id, worker, "Task completed");
        self.emit(LeadEvent::TaskCompleted {
            task_id: task_id.to_string(),
            worker: worker.to_string(),
        });
        Ok(task)
    }

    /// Park a task as blocked. Blocked tasks are never offered again.
    pub async fn block_task(
        &self,
        task_id: &str,
        worker: &str,
        reason: &str,
        now: u64,
    ) -> CoordinationResult<BeadsTask> {
        let who = worker.to_string();
        let why = reason.to_string();
        let task = self
            .task_log
            .update(
                task_id,
                Box::new(move |t: &mut BeadsTask| {
                    Self::check_assignee(t, &who)?;
                    t.status = TaskStatus::Blocked;
                    t.blocked_reason = Some(why);
                    t.lease_expires = None;
                    t.updated_at = now;
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(task_id, worker, reason, "Task blocked");
        self.emit(LeadEvent::TaskBlocked {
            task_id: task_id.to_string(),
            worker: worker.to_string(),
            reason: reason.to_string(),
        });
        Ok(task)
    }

    /// Apply a report received from `from`.
    pub async fn handle_worker_report(
        &self,
        from: &str,
        report: WorkerReport,
        now: u64,
    ) -> CoordinationResult<BeadsTask> {
        match report {
            WorkerReport::TaskRenew { task_id } => self.renew_lease(&task_id, from, now).await,
            WorkerReport::TaskComplete { task_id, reason } => {
                self.complete_task(&task_id, from, reason, now).await
            }
            WorkerReport::TaskBlocked { task_id, reason } => {
                self.block_task(&task_id, from, &reason, now).await
            }
        }
    }

    /// Record liveness plus a summary of the leases currently held.
    pub async fn write_heartbeat(&self, now: u64) -> CoordinationResult<LeadHeartbeat> {
        let tasks = self.task_log.load().await?;
        let active: Vec<&BeadsTask> = tasks
            .iter()
            .filter(|t| {
                t.assignee
                    .as_deref()
                    .is_some_and(|a| t.is_leased_to(a, now))
            })
            .collect();
        let assigned_agents: BTreeSet<String> =
            active.iter().filter_map(|t| t.assignee.clone()).collect();

        let heartbeat = LeadHeartbeat {
            lead_name: self.config.lead_name.clone(),
            lead_id: self.config.lead_id.clone(),
            timestamp: now,
            active_task_count: active.len(),
            assigned_agents: assigned_agents.into_iter().collect(),
        };
        self.heartbeats.write(&heartbeat).await?;
        self.emit(LeadEvent::HeartbeatWritten {
            active_task_count: heartbeat.active_task_count,
        });
        Ok(heartbeat)
    }

    /// Start polling and heartbeating on independent intervals.
    pub async fn start(self: &Arc<Self>) -> CoordinationResult<()> {
        let this = Arc::clone(self);
        self.runner
            .launch("lead coordinator", move |mut shutdown| async move {
                tracing::info!(
                    lead = %this.config.lead_name,
                    lead_id = %this.config.lead_id,
                    "Lead coordinator started"
                );
                this.emit(LeadEvent::Started {
                    lead_id: this.config.lead_id.clone(),
                });
                let mut poll =
                    tokio::time::interval(Duration::from_millis(this.config.poll_interval_ms));
                let mut beat =
                    tokio::time::interval(Duration::from_millis(this.config.heartbeat_interval_ms));
                loop {
                    tokio::select! {
                        _ = beat.tick() => {
                            if let Err(e) = this.write_heartbeat(now_ms()).await {
                                tracing::warn!(error = %e, "Failed to write lead heartbeat");
                            }
                        }
                        _ = poll.tick() => {
                            if let Err(e) = this.tick(now_ms()).await {
                                tracing::warn!(error = %e, "Lead poll failed");
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })
            .await
    }

    /// Stop both timers. Outstanding leases are left to expire.
    pub async fn stop(&self) {
        if self.runner.stop().await {
            tracing::info!(lead_id = %self.config.lead_id, "Lead coordinator stopped");
            self.emit(LeadEvent::Stopped {
                lead_id: self.config.lead_id.clone(),
            });
        }
    }

    pub async fn is_running(&self) -> bool {
        self.runner.is_running().await
    }
}
