use std::sync::Arc;

use tokio::sync::mpsc;

use relay_coordination::{
    format_heartbeat, CandidateSource, GossipConfig, GossipEvent, GossipHeartbeat, GossipMonitor,
    OutboundMessage, WorkerSource,
};

const STALE_MS: u64 = 15_000;

fn monitor() -> (Arc<GossipMonitor>, mpsc::UnboundedReceiver<OutboundMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut config = GossipConfig::new("me", "me-id", 100);
    config.stale_after_ms = STALE_MS;
    (Arc::new(GossipMonitor::new(config, Arc::new(tx))), rx)
}

fn heartbeat(name: &str, healthy: bool, is_leader: bool, spawned_at: u64) -> GossipHeartbeat {
    GossipHeartbeat {
        name: name.into(),
        id: format!("{name}-id"),
        timestamp: 0,
        load: 0.1,
        healthy,
        is_leader,
        task_count: 0,
        spawned_at,
    }
}

#[tokio::test]
async fn test_first_sighting_then_updates() {
    let (gossip, _rx) = monitor();

    let events = gossip.handle_heartbeat(heartbeat("alice", true, false, 5), 1_000).await;
    assert_eq!(
        events,
        vec![GossipEvent::PeerDiscovered {
            name: "alice".into(),
            id: "alice-id".into()
        }]
    );

    // A routine heartbeat changes nothing observable.
    let events = gossip.handle_heartbeat(heartbeat("alice", true, false, 5), 2_000).await;
    assert!(events.is_empty());

    let peer = gossip.peer("alice").await.unwrap();
    assert_eq!(peer.first_seen, 1_000);
    assert_eq!(peer.last_heartbeat, 2_000);
    assert!(peer.healthy);
}

#[tokio::test]
async fn test_own_heartbeat_ignored() {
    let (gossip, _rx) = monitor();
    let events = gossip.handle_heartbeat(heartbeat("me", true, true, 1), 1).await;
    assert!(events.is_empty());
    assert!(gossip.peers().await.is_empty());
}

#[tokio::test]
async fn test_reported_health_transitions() {
    let (gossip, _rx) = monitor();
    gossip.handle_heartbeat(heartbeat("alice", true, false, 5), 1).await;

    let events = gossip.handle_heartbeat(heartbeat("alice", false, false, 5), 2).await;
    assert_eq!(events, vec![GossipEvent::PeerUnhealthy { name: "alice".into() }]);

    let events = gossip.handle_heartbeat(heartbeat("alice", true, false, 5), 3).await;
    assert_eq!(events, vec![GossipEvent::PeerRecovered { name: "alice".into() }]);
}

#[tokio::test]
async fn test_leader_flag_flip_announces_new_leader() {
    let (gossip, _rx) = monitor();
    gossip.handle_heartbeat(heartbeat("alice", true, false, 5), 1).await;

    let events = gossip.handle_heartbeat(heartbeat("alice", true, true, 5), 2).await;
    assert_eq!(
        events,
        vec![GossipEvent::NewLeader {
            name: "alice".into(),
            id: "alice-id".into()
        }]
    );
    assert_eq!(gossip.leader().await.as_deref(), Some("alice"));

    // Repeating the claim is not news.
    assert!(gossip.handle_heartbeat(heartbeat("alice", true, true, 5), 3).await.is_empty());
}

#[tokio::test]
async fn test_stale_peer_flips_once_per_transition() {
    let (gossip, _rx) = monitor();
    gossip.handle_heartbeat(heartbeat("alice", true, false, 5), 0).await;
    assert!(gossip.peer("alice").await.unwrap().healthy);

    // Within the threshold nothing happens.
    assert!(gossip.check_stale(STALE_MS).await.is_empty());

    let events = gossip.check_stale(STALE_MS + 1).await;
    assert_eq!(
        events,
        vec![GossipEvent::PeerStale {
            name: "alice".into(),
            last_heartbeat: 0
        }]
    );
    assert!(!gossip.peer("alice").await.unwrap().healthy);

    // Still silent: no second event.
    assert!(gossip.check_stale(STALE_MS * 10).await.is_empty());

    // Back again, then silent again: one more stale event.
    let events = gossip.handle_heartbeat(heartbeat("alice", true, false, 5), STALE_MS * 11).await;
    assert_eq!(events, vec![GossipEvent::PeerRecovered { name: "alice".into() }]);
    let events = gossip.check_stale(STALE_MS * 13).await;
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_unhealthy_peer_going_silent_is_not_reported_stale() {
    let (gossip, _rx) = monitor();
    gossip.handle_heartbeat(heartbeat("bob", true, false, 5), 0).await;
    let events = gossip.handle_heartbeat(heartbeat("bob", false, false, 5), 10).await;
    assert_eq!(events, vec![GossipEvent::PeerUnhealthy { name: "bob".into() }]);

    // Already unhealthy: silence adds nothing.
    assert!(gossip.check_stale(45_000).await.is_empty());
    assert!(!gossip.peer("bob").await.unwrap().stale);

    // Recovery still works after the silence.
    let events = gossip.handle_heartbeat(heartbeat("bob", true, false, 5), 46_000).await;
    assert_eq!(events, vec![GossipEvent::PeerRecovered { name: "bob".into() }]);
}

#[tokio::test]
async fn test_stale_leader_reports_leader_lost() {
    let (gossip, _rx) = monitor();
    gossip.handle_heartbeat(heartbeat("lead", true, true, 1), 0).await;

    let events = gossip.check_stale(STALE_MS + 1).await;
    assert!(events.contains(&GossipEvent::LeaderLost { name: "lead".into() }));
    assert!(gossip.leader().await.is_none());
}

#[tokio::test]
async fn test_handle_message_only_consumes_gossip() {
    let (gossip, _rx) = monitor();
    assert!(gossip.handle_message("just chatting", 1).await.is_none());

    let body = format_heartbeat(&heartbeat("bob", true, false, 7));
    let events = gossip.handle_message(&body, 1).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_broadcast_uses_broadcast_target() {
    let (gossip, mut rx) = monitor();
    gossip.set_leader(true).await;
    gossip.set_load(0.75, 3).await;
    gossip.broadcast_heartbeat(42).await.unwrap();

    let out = rx.try_recv().unwrap();
    assert_eq!(out.to, "*");
    let parsed = relay_coordination::parse_heartbeat(&out.body).unwrap();
    assert_eq!(parsed.name, "me");
    assert_eq!(parsed.timestamp, 42);
    assert!(parsed.is_leader);
    assert_eq!(parsed.task_count, 3);
    assert_eq!(parsed.spawned_at, 100);
}

#[tokio::test]
async fn test_candidates_and_workers_follow_health() {
    let (gossip, _rx) = monitor();
    gossip.handle_heartbeat(heartbeat("alice", true, false, 50), 0).await;
    gossip.handle_heartbeat(heartbeat("bob", false, false, 10), 0).await;
    gossip.handle_heartbeat(heartbeat("lead", true, true, 1), 0).await;

    let mut ids: Vec<String> = gossip.candidates().await.into_iter().map(|c| c.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["alice-id", "lead-id", "me-id"]);

    assert_eq!(gossip.available_workers().await, vec!["alice"]);
}

#[tokio::test]
async fn test_stop_emits_terminal_event() {
    let (gossip, _rx) = monitor();
    let mut events = gossip.subscribe();
    gossip.start().await.unwrap();
    gossip.stop().await;

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert_eq!(last, Some(GossipEvent::Stopped));
}
