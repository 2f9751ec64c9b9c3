use std::sync::Arc;

use tokio::sync::mpsc;

use relay_coordination::{
    BeadsTask, CoordinationError, HeartbeatStore, JsonlTaskLog, LeadConfig, LeadEvent,
    MemoryHeartbeatStore, MemoryTaskLog, OutboundMessage, StatelessLeadCoordinator, StaticWorkers,
    TaskLog, TaskStatus, WorkerReport,
};

const LEASE: u64 = 60_000;

struct Harness {
    lead: Arc<StatelessLeadCoordinator>,
    heartbeats: Arc<MemoryHeartbeatStore>,
    outbox: mpsc::UnboundedReceiver<OutboundMessage>,
}

fn harness(log: Arc<dyn TaskLog>, workers: &[&str]) -> Harness {
    let (tx, outbox) = mpsc::unbounded_channel();
    let heartbeats = Arc::new(MemoryHeartbeatStore::new());
    let mut config = LeadConfig::new("Lead", "lead-1");
    config.lease_duration_ms = LEASE;
    let lead = Arc::new(StatelessLeadCoordinator::new(
        config,
        log,
        Arc::new(StaticWorkers(workers.iter().map(|w| w.to_string()).collect())),
        Arc::new(tx),
        heartbeats.clone(),
    ));
    Harness {
        lead,
        heartbeats,
        outbox,
    }
}

#[tokio::test]
async fn test_most_urgent_task_goes_to_single_worker() {
    let dir = tempfile::tempdir().unwrap();
    let log: Arc<dyn TaskLog> = Arc::new(JsonlTaskLog::new(dir.path().join("tasks.jsonl")));
    log.insert(BeadsTask::new("t-low", "Write docs", 2, 0)).await.unwrap();
    log.insert(BeadsTask::new("t-high", "Fix crash", 1, 0)).await.unwrap();

    let mut h = harness(log, &["W1"]);
    let now = 1_000_000;
    let assigned = h.lead.tick(now).await.unwrap();

    assert_eq!(assigned.len(), 1);
    assert_eq!(assigned[0].0.id, "t-high");
    assert_eq!(assigned[0].1, "W1");

    // The log itself reflects the lease.
    let reread = JsonlTaskLog::new(dir.path().join("tasks.jsonl"));
    let high = reread.get("t-high").await.unwrap().unwrap();
    assert_eq!(high.status, TaskStatus::InProgress);
    assert_eq!(high.assignee.as_deref(), Some("W1"));
    assert_eq!(high.lease_expires, Some(now + LEASE));
    let low = reread.get("t-low").await.unwrap().unwrap();
    assert_eq!(low.status, TaskStatus::Open);
    assert!(low.assignee.is_none());

    let sent = h.outbox.try_recv().unwrap();
    assert_eq!(sent.to, "W1");
    assert!(sent.body.starts_with("TASK t-high: Fix crash"));
    assert_eq!(sent.data.unwrap()["task"]["id"], "t-high");
    assert!(h.outbox.try_recv().is_err());
}

#[tokio::test]
async fn test_positional_pairing_and_busy_workers_skipped() {
    let log: Arc<dyn TaskLog> = Arc::new(MemoryTaskLog::new(vec![
        BeadsTask::new("a", "A", 1, 0),
        BeadsTask::new("b", "B", 2, 0),
        BeadsTask::new("c", "C", 3, 0),
    ]));
    let h = harness(log, &["W1", "W2"]);

    let first = h.lead.tick(100).await.unwrap();
    let pairs: Vec<(String, String)> = first.into_iter().map(|(t, w)| (t.id, w)).collect();
    assert_eq!(
        pairs,
        vec![("a".to_string(), "W1".to_string()), ("b".to_string(), "W2".to_string())]
    );

    // Both workers hold live leases; nothing left to hand out.
    assert!(h.lead.tick(200).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_lease_is_offered_again() {
    let log: Arc<dyn TaskLog> = Arc::new(MemoryTaskLog::new(vec![BeadsTask::new("a", "A", 1, 0)]));
    let h = harness(log.clone(), &["W1", "W2"]);

    h.lead.tick(0).await.unwrap();
    let leased = log.get("a").await.unwrap().unwrap();
    assert!(!leased.is_ready(LEASE - 1));
    assert!(leased.is_ready(LEASE));

    // W1 went silent; the task moves on once its lease runs out.
    let reassigned = h.lead.tick(LEASE + 1).await.unwrap();
    assert_eq!(reassigned.len(), 1);
    assert_eq!(reassigned[0].0.lease_expires, Some(LEASE + 1 + LEASE));
}

#[tokio::test]
async fn test_renew_complete_and_block_only_for_assignee() {
    let log: Arc<dyn TaskLog> = Arc::new(MemoryTaskLog::new(vec![
        BeadsTask::new("a", "A", 1, 0),
        BeadsTask::new("b", "B", 1, 1),
    ]));
    let h = harness(log.clone(), &["W1", "W2"]);
    let mut events = h.lead.subscribe();
    h.lead.tick(0).await.unwrap();

    let err = h.lead.renew_lease("a", "W2", 10).await.unwrap_err();
    assert!(matches!(err, CoordinationError::NotAssignee { .. }));

    let renewed = h.lead.renew_lease("a", "W1", 10).await.unwrap();
    assert_eq!(renewed.lease_expires, Some(10 + LEASE));

    let done = h
        .lead
        .handle_worker_report(
            "W1",
            WorkerReport::TaskComplete {
                task_id: "a".into(),
                reason: Some("merged".into()),
            },
            20,
        )
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Closed);
    assert_eq!(done.closed_reason.as_deref(), Some("merged"));

    let blocked = h.lead.block_task("b", "W2", "needs review", 30).await.unwrap();
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert_eq!(blocked.blocked_reason.as_deref(), Some("needs review"));

    // Terminal tasks stay terminal and are never re-offered.
    let err = h.lead.renew_lease("a", "W1", 40).await.unwrap_err();
    assert!(matches!(err, CoordinationError::InvalidTransition { .. }));
    assert!(h.lead.tick(u64::MAX / 2).await.unwrap().is_empty());

    let err = h.lead.complete_task("missing", "W1", None, 50).await.unwrap_err();
    assert!(matches!(err, CoordinationError::TaskNotFound(_)));

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(e, LeadEvent::LeaseRenewed { .. })));
    assert!(seen.iter().any(|e| matches!(e, LeadEvent::TaskCompleted { .. })));
    assert!(seen.iter().any(|e| matches!(e, LeadEvent::TaskBlocked { .. })));
}

#[tokio::test]
async fn test_heartbeat_summarizes_live_leases() {
    let log: Arc<dyn TaskLog> = Arc::new(MemoryTaskLog::new(vec![
        BeadsTask::new("a", "A", 1, 0),
        BeadsTask::new("b", "B", 2, 0),
    ]));
    let h = harness(log, &["W2", "W1"]);
    h.lead.tick(0).await.unwrap();

    let hb = h.lead.write_heartbeat(5).await.unwrap();
    assert_eq!(hb.lead_id, "lead-1");
    assert_eq!(hb.timestamp, 5);
    assert_eq!(hb.active_task_count, 2);
    assert_eq!(hb.assigned_agents, vec!["W1", "W2"]);
    assert_eq!(h.heartbeats.read().await.unwrap(), Some(hb));

    // After the leases lapse nothing is active.
    let later = h.lead.write_heartbeat(LEASE + 5).await.unwrap();
    assert_eq!(later.active_task_count, 0);
}

#[tokio::test]
async fn test_start_and_stop_emit_lifecycle_events() {
    let log: Arc<dyn TaskLog> = Arc::new(MemoryTaskLog::default());
    let h = harness(log, &[]);
    let mut events = h.lead.subscribe();

    h.lead.start().await.unwrap();
    assert!(h.lead.is_running().await);
    assert!(matches!(
        h.lead.start().await,
        Err(CoordinationError::AlreadyRunning(_))
    ));

    h.lead.stop().await;
    assert!(!h.lead.is_running().await);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(LeadEvent::Started { .. })));
    assert!(matches!(seen.last(), Some(LeadEvent::Stopped { .. })));
}

#[tokio::test]
async fn test_task_log_rewrite_leaves_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    let log = JsonlTaskLog::new(&path);
    log.insert(BeadsTask::new("a", "A", 1, 0)).await.unwrap();
    log.insert(BeadsTask::new("b", "B", 1, 0)).await.unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 2);
    assert!(!dir.path().join("tasks.jsonl.tmp").exists());
}
