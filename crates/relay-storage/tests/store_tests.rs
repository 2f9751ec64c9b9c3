use std::sync::Arc;

use relay_storage::{
    AgentSummary, ClosedBy, InMemoryStore, JsonlStore, MessageQuery, MessageStatus, MessageStore,
    SortOrder, SqliteStore, StoredMessage, StoredSession,
};

fn message(id: &str, from: &str, to: &str, ts: u64) -> StoredMessage {
    StoredMessage {
        id: id.into(),
        ts,
        from: from.into(),
        to: to.into(),
        topic: None,
        kind: "message".into(),
        body: format!("body of {id}"),
        data: None,
        thread: None,
        delivery_seq: None,
        delivery_session_id: None,
        session_id: None,
        status: MessageStatus::Unread,
        is_urgent: false,
        is_broadcast: false,
    }
}

fn session(id: &str, agent: &str, started_at: u64, token: &str) -> StoredSession {
    StoredSession {
        id: id.into(),
        agent_name: agent.into(),
        cli: Some("claude".into()),
        project_id: None,
        started_at,
        ended_at: None,
        message_count: 0,
        resume_token: Some(token.into()),
        closed_by: None,
    }
}

/// Behaviour every driver must share.
async fn exercise_contract(store: Arc<dyn MessageStore>) {
    store.init().await.unwrap();

    // Query filters and ordering.
    store.save_message(&message("m1", "alice", "bob", 10)).await.unwrap();
    store.save_message(&message("m2", "carol", "bob", 20)).await.unwrap();
    let mut urgent = message("m3", "alice", "dave", 30);
    urgent.is_urgent = true;
    urgent.topic = Some("builds".into());
    store.save_message(&urgent).await.unwrap();

    let to_bob = store
        .get_messages(&MessageQuery {
            to: Some("bob".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(to_bob.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(), vec!["m1", "m2"]);

    let newest = store
        .get_messages(&MessageQuery {
            order: SortOrder::Desc,
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(newest[0].id, "m3");

    let urgent_only = store
        .get_messages(&MessageQuery {
            urgent_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(urgent_only.len(), 1);

    let by_topic = store
        .get_messages(&MessageQuery {
            topic: Some("builds".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_topic[0].id, "m3");

    let default_topic = store
        .get_messages(&MessageQuery {
            topic: Some("default".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(default_topic.len(), 2);

    let since = store
        .get_messages(&MessageQuery {
            since_ts: Some(20),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(since.len(), 2);

    // Status updates.
    store.update_message_status("m1", MessageStatus::Acked).await.unwrap();
    let unread = store
        .get_messages(&MessageQuery {
            to: Some("bob".into()),
            unread_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].id, "m2");
    assert_eq!(
        store.get_message_by_id("m1").await.unwrap().unwrap().status,
        MessageStatus::Acked
    );

    // Reply counts are derived from threads.
    let mut reply = message("r1", "bob", "alice", 40);
    reply.thread = Some("m1".into());
    store.save_message(&reply).await.unwrap();
    assert_eq!(store.reply_count("m1").await.unwrap(), 1);
    assert_eq!(store.reply_count("m2").await.unwrap(), 0);

    // Sessions.
    store.start_session(&session("s1", "bob", 100, "tok-1")).await.unwrap();
    store.start_session(&session("s2", "carol", 200, "tok-2")).await.unwrap();
    store.increment_session_messages("s1").await.unwrap();
    store.increment_session_messages("s1").await.unwrap();
    store.end_session("s1", 150, ClosedBy::Agent).await.unwrap();

    let s1 = store.get_session_by_resume_token("tok-1").await.unwrap().unwrap();
    assert_eq!(s1.message_count, 2);
    assert_eq!(s1.ended_at, Some(150));
    assert_eq!(s1.closed_by, Some(ClosedBy::Agent));
    assert!(!s1.is_active());

    let recent = store.get_recent_sessions(1).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].id, "s2");
    assert!(recent[0].closed_by.is_none());

    // Agent summaries.
    let mut summary = AgentSummary::new("bob");
    summary.current_task = Some("task-7".into());
    summary.completed_tasks = vec!["task-1".into()];
    store.upsert_agent_summary(&summary).await.unwrap();
    let loaded = store.get_agent_summary("bob").await.unwrap().unwrap();
    assert_eq!(loaded.current_task.as_deref(), Some("task-7"));
    assert_eq!(loaded.completed_tasks, vec!["task-1".to_string()]);
    assert!(store.get_agent_summary("nobody").await.unwrap().is_none());
}

/// Pending replay and per-stream sequence bookkeeping.
async fn exercise_replay(store: Arc<dyn MessageStore>) {
    store.init().await.unwrap();

    let mut delivered_s1 = message("d1", "alice", "bob", 50);
    delivered_s1.delivery_seq = Some(2);
    delivered_s1.delivery_session_id = Some("s1".into());
    store.save_message(&delivered_s1).await.unwrap();

    let mut delivered_s1_first = message("d0", "alice", "bob", 60);
    delivered_s1_first.delivery_seq = Some(1);
    delivered_s1_first.delivery_session_id = Some("s1".into());
    store.save_message(&delivered_s1_first).await.unwrap();

    let mut delivered_old = message("old", "carol", "bob", 5);
    delivered_old.delivery_seq = Some(9);
    delivered_old.delivery_session_id = Some("s0".into());
    store.save_message(&delivered_old).await.unwrap();

    // Never delivered; seq missing sorts as zero.
    store.save_message(&message("queued", "carol", "bob", 70)).await.unwrap();

    let pending: Vec<String> = store
        .get_pending_messages_for_session("bob", Some("s1"))
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(pending, vec!["queued", "d0", "d1"]);

    let without_session: Vec<String> = store
        .get_pending_messages_for_session("bob", None)
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(without_session, vec!["queued"]);

    let streams = store.get_max_seq_by_stream("bob", None).await.unwrap();
    let alice = streams.iter().find(|s| s.peer == "alice").unwrap();
    assert_eq!(alice.max_seq, 2);
    assert_eq!(alice.topic, "default");
    let carol = streams.iter().find(|s| s.peer == "carol").unwrap();
    assert_eq!(carol.max_seq, 9);

    let s1_only = store.get_max_seq_by_stream("bob", Some("s1")).await.unwrap();
    assert_eq!(s1_only.len(), 1);
    assert_eq!(s1_only[0].peer, "alice");
}

#[tokio::test]
async fn test_memory_store_contract() {
    exercise_contract(Arc::new(InMemoryStore::new())).await;
    exercise_replay(Arc::new(InMemoryStore::new())).await;
}

#[tokio::test]
async fn test_sqlite_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    exercise_contract(Arc::new(SqliteStore::new(dir.path().join("a.db")))).await;
    exercise_replay(Arc::new(SqliteStore::new(dir.path().join("b.db")))).await;
}

#[tokio::test]
async fn test_jsonl_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    exercise_contract(Arc::new(JsonlStore::new(dir.path().join("a")))).await;
    exercise_replay(Arc::new(JsonlStore::new(dir.path().join("b")))).await;
}

#[tokio::test]
async fn test_memory_store_keeps_last_thousand() {
    let store = InMemoryStore::new();
    for i in 0..1005u64 {
        store
            .save_message(&message(&format!("m{i}"), "a", "b", i))
            .await
            .unwrap();
    }
    assert_eq!(store.message_count().await, 1000);
    assert!(store.get_message_by_id("m4").await.unwrap().is_none());
    assert!(store.get_message_by_id("m5").await.unwrap().is_some());

    let report = store.health_check().await;
    assert!(!report.persistent);
    assert_eq!(report.driver, "memory");
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    {
        let store = SqliteStore::new(&path);
        store.init().await.unwrap();
        store.save_message(&message("m1", "alice", "bob", 1)).await.unwrap();
        store.close().await.unwrap();
    }
    let store = SqliteStore::new(&path);
    store.init().await.unwrap();
    assert!(store.get_message_by_id("m1").await.unwrap().is_some());
    let report = store.health_check().await;
    assert!(report.persistent);
    assert!(report.can_write);
    assert_eq!(report.driver, "sqlite");
}

#[tokio::test]
async fn test_jsonl_later_records_supersede_on_reload() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = JsonlStore::new(dir.path());
        store.init().await.unwrap();
        store.save_message(&message("m1", "alice", "bob", 1)).await.unwrap();
        store.update_message_status("m1", MessageStatus::Read).await.unwrap();
        store.start_session(&session("s1", "bob", 10, "tok")).await.unwrap();
        store.end_session("s1", 20, ClosedBy::Disconnect).await.unwrap();
    }

    let lines = std::fs::read_to_string(dir.path().join("messages.jsonl")).unwrap();
    assert_eq!(lines.lines().count(), 2, "status change should append, not rewrite");

    let store = JsonlStore::new(dir.path());
    store.init().await.unwrap();
    let m1 = store.get_message_by_id("m1").await.unwrap().unwrap();
    assert_eq!(m1.status, MessageStatus::Read);
    let s1 = store.get_session_by_resume_token("tok").await.unwrap().unwrap();
    assert_eq!(s1.closed_by, Some(ClosedBy::Disconnect));
}

#[tokio::test]
async fn test_jsonl_skips_torn_trailing_line() {
    let dir = tempfile::tempdir().unwrap();
    let good = serde_json::to_string(&message("m1", "alice", "bob", 1)).unwrap();
    std::fs::write(
        dir.path().join("messages.jsonl"),
        format!("{good}\n{{\"id\":\"m2\",\"ts\""),
    )
    .unwrap();

    let store = JsonlStore::new(dir.path());
    store.init().await.unwrap();
    let all = store.get_messages(&MessageQuery::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_jsonl_requires_init() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlStore::new(dir.path());
    assert!(store.save_message(&message("m1", "a", "b", 1)).await.is_err());
}
