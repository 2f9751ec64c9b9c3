use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use relay_coordination::{
    elect_leader, Candidate, HeartbeatStore, LeadHeartbeat, LeaderWatchdog, MemoryHeartbeatStore,
    StaticCandidates, WatchdogConfig, WatchdogDecision, WatchdogEvent,
};

const STALE_MS: u64 = 30_000;

fn candidate(id: &str, spawned_at: u64) -> Candidate {
    Candidate {
        id: id.into(),
        name: id.to_uppercase(),
        spawned_at,
    }
}

fn watchdog(
    id: &str,
    store: Arc<MemoryHeartbeatStore>,
    candidates: Vec<Candidate>,
    promotions: Arc<AtomicUsize>,
) -> LeaderWatchdog {
    let mut config = WatchdogConfig::new(id, id.to_uppercase());
    config.stale_after_ms = STALE_MS;
    LeaderWatchdog::new(config, store, Arc::new(StaticCandidates(candidates))).with_promotion(
        move || {
            promotions.fetch_add(1, Ordering::SeqCst);
        },
    )
}

fn watchdog_with_demotions(
    id: &str,
    store: Arc<MemoryHeartbeatStore>,
    candidates: Vec<Candidate>,
    promotions: Arc<AtomicUsize>,
    demotions: Arc<AtomicUsize>,
) -> LeaderWatchdog {
    watchdog(id, store, candidates, promotions).with_demotion(move || {
        demotions.fetch_add(1, Ordering::SeqCst);
    })
}

fn lead_heartbeat(lead_id: &str, timestamp: u64) -> LeadHeartbeat {
    LeadHeartbeat {
        lead_name: lead_id.to_uppercase(),
        lead_id: lead_id.into(),
        timestamp,
        active_task_count: 0,
        assigned_agents: vec![],
    }
}

#[test]
fn test_election_is_order_independent() {
    let a = candidate("a", 1);
    let b = candidate("b", 2);
    assert_eq!(elect_leader(&[a.clone(), b.clone()]).unwrap().id, "a");
    assert_eq!(elect_leader(&[b, a]).unwrap().id, "a");
}

#[tokio::test]
async fn test_absent_heartbeat_promotes_earliest_spawned_once() {
    let store = Arc::new(MemoryHeartbeatStore::new());
    let candidates = vec![candidate("c2", 300), candidate("c1", 100), candidate("c3", 200)];

    let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let dogs: Vec<LeaderWatchdog> = ["c1", "c2", "c3"]
        .iter()
        .zip(&counters)
        .map(|(id, counter)| watchdog(id, store.clone(), candidates.clone(), counter.clone()))
        .collect();

    // Several polls before the new leader's first heartbeat lands.
    for _ in 0..3 {
        for dog in &dogs {
            dog.check(1_000).await.unwrap();
        }
    }

    assert_eq!(counters[0].load(Ordering::SeqCst), 1);
    assert_eq!(counters[1].load(Ordering::SeqCst), 0);
    assert_eq!(counters[2].load(Ordering::SeqCst), 0);
    assert!(dogs[0].is_leader().await);
    assert!(!dogs[1].is_leader().await);
}

#[tokio::test]
async fn test_no_candidates_means_election_failed() {
    let store = Arc::new(MemoryHeartbeatStore::new());
    let promotions = Arc::new(AtomicUsize::new(0));
    let dog = watchdog("solo", store, vec![], promotions.clone());
    let mut events = dog.subscribe();

    assert_eq!(dog.check(0).await.unwrap(), WatchdogDecision::ElectionFailed);
    assert_eq!(events.try_recv().unwrap(), WatchdogEvent::ElectionFailed);
    assert!(!dog.is_leader().await);
    assert_eq!(promotions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_healthy_leader_detected_once_per_identity() {
    let store = Arc::new(MemoryHeartbeatStore::new());
    store.write(&lead_heartbeat("boss", 1_000)).await.unwrap();
    let dog = watchdog("me", store.clone(), vec![candidate("me", 0)], Arc::new(AtomicUsize::new(0)));
    let mut events = dog.subscribe();

    assert_eq!(
        dog.check(2_000).await.unwrap(),
        WatchdogDecision::HealthyLeader { lead_id: "boss".into() }
    );
    dog.check(3_000).await.unwrap();

    store.write(&lead_heartbeat("boss2", 3_500)).await.unwrap();
    dog.check(4_000).await.unwrap();

    let mut detected = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WatchdogEvent::LeaderDetected { lead_id, .. } = event {
            detected.push(lead_id);
        }
    }
    assert_eq!(detected, vec!["boss", "boss2"]);
    assert!(!dog.is_leader().await);
}

#[tokio::test]
async fn test_stale_leader_triggers_election() {
    let store = Arc::new(MemoryHeartbeatStore::new());
    store.write(&lead_heartbeat("dead", 0)).await.unwrap();
    let promotions = Arc::new(AtomicUsize::new(0));
    let dog = watchdog("me", store, vec![candidate("me", 5), candidate("other", 9)], promotions.clone());
    let mut events = dog.subscribe();

    let decision = dog.check(STALE_MS + 1).await.unwrap();
    assert_eq!(
        decision,
        WatchdogDecision::Elected {
            winner: candidate("me", 5),
            promoted: true
        }
    );
    assert_eq!(
        events.try_recv().unwrap(),
        WatchdogEvent::LeaderStale {
            lead_id: "dead".into(),
            age_ms: STALE_MS + 1
        }
    );
    assert_eq!(promotions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fresh_own_heartbeat_keeps_leader() {
    let store = Arc::new(MemoryHeartbeatStore::new());
    let promotions = Arc::new(AtomicUsize::new(0));
    let dog = watchdog("me", store.clone(), vec![candidate("me", 0)], promotions.clone());

    dog.check(0).await.unwrap();
    store.write(&lead_heartbeat("me", 100)).await.unwrap();

    assert_eq!(dog.check(1_000).await.unwrap(), WatchdogDecision::SelfLeader);
    assert!(dog.is_leader().await);
    assert_eq!(promotions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_own_heartbeat_steps_down_and_reelects() {
    let store = Arc::new(MemoryHeartbeatStore::new());
    let promotions = Arc::new(AtomicUsize::new(0));
    let demotions = Arc::new(AtomicUsize::new(0));
    let dog = watchdog_with_demotions(
        "me",
        store.clone(),
        vec![candidate("me", 0), candidate("other", 5)],
        promotions.clone(),
        demotions.clone(),
    );

    dog.check(0).await.unwrap();
    store.write(&lead_heartbeat("me", 0)).await.unwrap();
    assert_eq!(dog.check(1_000).await.unwrap(), WatchdogDecision::SelfLeader);

    // Our coordinator stopped writing: the old record no longer counts.
    let mut events = dog.subscribe();
    let decision = dog.check(STALE_MS + 1).await.unwrap();
    assert_eq!(
        decision,
        WatchdogDecision::Elected {
            winner: candidate("me", 0),
            promoted: true
        }
    );
    assert_eq!(demotions.load(Ordering::SeqCst), 1);
    assert_eq!(promotions.load(Ordering::SeqCst), 2);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&WatchdogEvent::Demoted { id: "me".into() }));
    assert!(seen.contains(&WatchdogEvent::Promoted { id: "me".into() }));
}

#[tokio::test]
async fn test_simultaneous_start_resolves_to_one_leader() {
    let store = Arc::new(MemoryHeartbeatStore::new());
    let promotions_a = Arc::new(AtomicUsize::new(0));
    let demotions_a = Arc::new(AtomicUsize::new(0));
    let demotions_b = Arc::new(AtomicUsize::new(0));
    // Neither has heard the other's gossip yet.
    let a = watchdog_with_demotions(
        "a",
        store.clone(),
        vec![candidate("a", 1)],
        promotions_a.clone(),
        demotions_a.clone(),
    );
    let b = watchdog_with_demotions(
        "b",
        store.clone(),
        vec![candidate("b", 2)],
        Arc::new(AtomicUsize::new(0)),
        demotions_b.clone(),
    );

    a.check(0).await.unwrap();
    b.check(0).await.unwrap();
    assert!(a.is_leader().await);
    assert!(b.is_leader().await);

    // Both coordinators write; b's record lands last.
    store.write(&lead_heartbeat("a", 100)).await.unwrap();
    store.write(&lead_heartbeat("b", 100)).await.unwrap();

    let mut events = a.subscribe();
    assert_eq!(
        a.check(200).await.unwrap(),
        WatchdogDecision::HealthyLeader { lead_id: "b".into() }
    );
    assert!(!a.is_leader().await);
    assert_eq!(demotions_a.load(Ordering::SeqCst), 1);
    assert_eq!(events.try_recv().unwrap(), WatchdogEvent::Demoted { id: "a".into() });

    assert_eq!(b.check(200).await.unwrap(), WatchdogDecision::SelfLeader);
    assert!(b.is_leader().await);
    assert_eq!(demotions_b.load(Ordering::SeqCst), 0);

    // Following polls change nothing.
    a.check(300).await.unwrap();
    assert_eq!(demotions_a.load(Ordering::SeqCst), 1);
    assert_eq!(promotions_a.load(Ordering::SeqCst), 1);
}
