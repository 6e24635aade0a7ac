//! Multi-instance scenarios: several reconcilers share one in-memory store
//! and are ticked explicitly on a paused clock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pkg_metrics::LeaseMetrics;
use pkg_state::{Entry, KeySpace, KvStore, MemoryStore};
use pkg_types::config::LeaseConfig;
use pkg_types::lease::{LeaseEventKind, LeaseRecord, LeaseState};
use pkg_types::node::Instance;
use pkg_types::session::Session;

use crate::coordinator::LeaseCoordinator;
use crate::reconciler::{Reconciler, TickOutcome};
use crate::registry::StaticRegistry;
use crate::test_support::{CountingPoller, StubbornPoller};

const TICK: Duration = Duration::from_secs(5);

struct Node {
    reconciler: Reconciler,
    poller: CountingPoller,
}

impl Node {
    fn id(&self) -> &str {
        &self.reconciler.instance.id
    }

    async fn state(&self, session_id: &str) -> LeaseState {
        self.reconciler
            .view
            .read()
            .await
            .sessions
            .get(session_id)
            .map(|l| l.state)
            .unwrap_or_default()
    }

    async fn owned(&self) -> Vec<String> {
        self.reconciler
            .view
            .read()
            .await
            .sessions
            .values()
            .filter(|l| l.is_owned())
            .map(|l| l.session_id.clone())
            .collect()
    }
}

fn config() -> LeaseConfig {
    LeaseConfig {
        warmup: Duration::ZERO,
        ..LeaseConfig::default()
    }
}

fn sessions(n: usize) -> Vec<Session> {
    (0..n)
        .map(|i| {
            Session::new(
                format!("session-{:03}", i),
                format!("http://10.0.0.{}:8080", i),
            )
        })
        .collect()
}

fn node(
    store: &MemoryStore,
    id: &str,
    registry: &Arc<StaticRegistry>,
    config: LeaseConfig,
) -> Node {
    let poller = CountingPoller::new();
    let reconciler = Reconciler::new(
        Instance::new(id),
        Arc::new(store.clone()),
        KeySpace::default(),
        registry.clone(),
        Arc::new(poller.clone()),
        config,
        LeaseMetrics::detached(),
    );
    Node { reconciler, poller }
}

async fn round(nodes: &[&Node]) {
    for n in nodes {
        assert_eq!(n.reconciler.tick().await, TickOutcome::Completed);
    }
}

async fn advance_and_round(nodes: &[&Node]) {
    tokio::time::advance(TICK).await;
    round(nodes).await;
}

/// Session -> owner according to the store.
async fn store_owners(store: &MemoryStore) -> BTreeMap<String, String> {
    store
        .scan_prefix("lease:")
        .await
        .unwrap()
        .into_iter()
        .map(|(k, e)| (k.trim_start_matches("lease:").to_string(), e.owner))
        .collect()
}

fn preferred(session_id: &str, live: &[&str]) -> String {
    pkg_assigner::preferred_owner(session_id, live)
        .unwrap()
        .to_string()
}

/// Let spawned poller tasks run until they block.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

async fn assert_steady_state(nodes: &[&Node], all: &[Session]) {
    settle().await;
    let live: Vec<&str> = nodes.iter().map(|n| n.id()).collect();
    for s in all {
        let want = preferred(&s.id, &live);
        let mut holders = Vec::new();
        for n in nodes {
            if n.reconciler.is_owned(&s.id).await {
                holders.push(n.id().to_string());
            }
        }
        assert_eq!(holders, vec![want.clone()], "owners of {}", s.id);
    }
    let polled: usize = nodes.iter().map(|n| n.poller.active()).sum();
    assert_eq!(polled, all.len());
}

#[tokio::test(start_paused = true)]
async fn test_steady_state_has_exactly_one_preferred_owner() {
    let store = MemoryStore::new();
    let all = sessions(10);
    let registry = Arc::new(StaticRegistry::new(all.clone()));
    let a = node(&store, "api-a", &registry, config());
    let b = node(&store, "api-b", &registry, config());
    let c = node(&store, "api-c", &registry, config());
    let nodes = [&a, &b, &c];

    round(&nodes).await;
    advance_and_round(&nodes).await;
    advance_and_round(&nodes).await;

    assert_steady_state(&nodes, &all).await;
    let owners = store_owners(&store).await;
    assert_eq!(owners.len(), all.len());
    for s in &all {
        assert_eq!(owners[&s.id], preferred(&s.id, &["api-a", "api-b", "api-c"]));
    }

    // Further ticks change nothing.
    let before = store_owners(&store).await;
    advance_and_round(&nodes).await;
    assert_eq!(store_owners(&store).await, before);
    assert_steady_state(&nodes, &all).await;
}

#[tokio::test(start_paused = true)]
async fn test_crashed_owner_sessions_move_within_ttl_and_tick() {
    let store = MemoryStore::new();
    let all = sessions(10);
    let registry = Arc::new(StaticRegistry::new(all.clone()));
    let a = node(&store, "api-a", &registry, config());
    let b = node(&store, "api-b", &registry, config());
    let c = node(&store, "api-c", &registry, config());

    round(&[&a, &b, &c]).await;
    advance_and_round(&[&a, &b, &c]).await;
    advance_and_round(&[&a, &b, &c]).await;
    let a_sessions = a.owned().await;
    assert!(!a_sessions.is_empty());

    // A stops ticking without releasing anything.
    let ttl = config().lease_ttl;
    let mut waited = Duration::ZERO;
    while waited < ttl + TICK {
        advance_and_round(&[&b, &c]).await;
        waited += TICK;
    }

    let owners = store_owners(&store).await;
    for sid in &a_sessions {
        let owner = &owners[sid];
        assert!(owner == "api-b" || owner == "api-c", "{} still on {}", sid, owner);
        assert_eq!(owner, &preferred(sid, &["api-b", "api-c"]));
    }
    for s in &all {
        for n in [&b, &c] {
            assert_ne!(n.state(&s.id).await, LeaseState::Unknown, "{} on {}", s.id, n.id());
        }
    }
    assert_steady_state(&[&b, &c], &all).await;
}

#[tokio::test(start_paused = true)]
async fn test_joining_instance_takes_about_a_quarter() {
    let store = MemoryStore::new();
    let all = sessions(100);
    let registry = Arc::new(StaticRegistry::new(all.clone()));
    let a = node(&store, "api-a", &registry, config());
    let b = node(&store, "api-b", &registry, config());
    let c = node(&store, "api-c", &registry, config());

    round(&[&a, &b, &c]).await;
    advance_and_round(&[&a, &b, &c]).await;
    advance_and_round(&[&a, &b, &c]).await;
    let before = store_owners(&store).await;

    let d = node(&store, "api-d", &registry, config());
    let nodes = [&a, &b, &c, &d];
    round(&nodes).await;
    advance_and_round(&nodes).await;
    advance_and_round(&nodes).await;

    let after = store_owners(&store).await;
    let moved: Vec<&String> = all
        .iter()
        .map(|s| &s.id)
        .filter(|sid| before[*sid] != after[*sid])
        .collect();
    assert!(
        (12..=40).contains(&moved.len()),
        "{} of 100 sessions moved",
        moved.len()
    );
    for sid in moved {
        assert_eq!(after[sid], "api-d", "{} moved to a non-joining instance", sid);
    }
    assert_steady_state(&nodes, &all).await;
}

#[tokio::test(start_paused = true)]
async fn test_graceful_shutdown_hands_over_before_ttl() {
    let store = MemoryStore::new();
    let all = sessions(10);
    let registry = Arc::new(StaticRegistry::new(all.clone()));
    let a = node(&store, "api-a", &registry, config());
    let b = node(&store, "api-b", &registry, config());

    round(&[&a, &b]).await;
    advance_and_round(&[&a, &b]).await;
    advance_and_round(&[&a, &b]).await;
    let mut a_sessions = a.owned().await;
    a_sessions.sort();
    assert!(!a_sessions.is_empty());

    let report = a.reconciler.shutdown(Duration::from_secs(10)).await;
    assert!(!report.timed_out);
    assert!(report.left_fleet);
    assert_eq!(report.released, a_sessions);
    assert_eq!(report.pollers_stopped, a_sessions.len());
    assert_eq!(a.poller.active(), 0);
    assert!(a.owned().await.is_empty());

    let owners = store_owners(&store).await;
    assert!(owners.values().all(|o| o == "api-b"));
    assert!(store.get("node:heartbeat:api-a").await.unwrap().is_none());

    // B picks everything up on its very next tick, long before any TTL.
    advance_and_round(&[&b]).await;
    assert_steady_state(&[&b], &all).await;

    assert_eq!(a.reconciler.tick().await, TickOutcome::Stopping);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_bounded_by_grace() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(sessions(3)));
    let a = node(&store, "api-a", &registry, config());
    round(&[&a]).await;

    store.set_latency(Some(Duration::from_secs(30))).await;
    let report = a.reconciler.shutdown(Duration::from_secs(3)).await;
    assert!(report.timed_out);
    assert!(!report.left_fleet);
    assert!(report.elapsed <= Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_renew_error_stops_poller_then_recovers() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(sessions(1)));
    let a = node(&store, "api-a", &registry, config());
    let sid = "session-000";

    round(&[&a]).await;
    a.poller.wait_active(1).await;
    assert_eq!(a.state(sid).await, LeaseState::Owned);

    store.set_unavailable(true);
    advance_and_round(&[&a]).await;
    assert_eq!(a.state(sid).await, LeaseState::Uncertain);
    assert_eq!(a.poller.active(), 0);
    assert_eq!(a.reconciler.metrics.renew_failed.get(), 1);

    store.set_unavailable(false);
    advance_and_round(&[&a]).await;
    a.poller.wait_active(1).await;
    assert_eq!(a.state(sid).await, LeaseState::Owned);

    let kinds: Vec<LeaseEventKind> = a
        .reconciler
        .events
        .events_since(0)
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            LeaseEventKind::Acquired,
            LeaseEventKind::RenewFailed,
            LeaseEventKind::Renewed
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_is_never_polled_while_uncertain() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(sessions(1)));
    let a = node(&store, "api-a", &registry, config());
    let sid = "session-000";
    round(&[&a]).await;
    a.poller.wait_active(1).await;

    // Another writer overwrites the lease; it has no heartbeat.
    let record = LeaseRecord::new("intruder");
    let entry = Entry::new("intruder", serde_json::to_string(&record).unwrap());
    store
        .put("lease:session-000", &entry, Some(Duration::from_secs(15)))
        .await
        .unwrap();

    advance_and_round(&[&a]).await;
    assert_eq!(a.poller.active(), 0);
    assert_eq!(a.state(sid).await, LeaseState::Uncertain);
    let kinds: Vec<LeaseEventKind> = a
        .reconciler
        .events
        .recent(10)
        .await
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert!(kinds.contains(&LeaseEventKind::TakenOver));

    // A is preferred but may only reclaim once the intruder's TTL lapses.
    advance_and_round(&[&a]).await;
    assert_eq!(a.poller.active(), 0);
    advance_and_round(&[&a]).await;
    advance_and_round(&[&a]).await;
    a.poller.wait_active(1).await;
    assert_eq!(a.state(sid).await, LeaseState::Owned);
    assert_eq!(store_owners(&store).await[sid], "api-a");
}

#[tokio::test(start_paused = true)]
async fn test_init_instance_waits_for_warmup() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(sessions(4)));
    let warm = LeaseConfig {
        warmup: Duration::from_secs(10),
        ..LeaseConfig::default()
    };
    let a = node(&store, "api-a", &registry, warm.clone());

    round(&[&a]).await;
    assert!(a.owned().await.is_empty());
    assert!(store_owners(&store).await.is_empty());
    assert_eq!(a.state("session-000").await, LeaseState::Uncertain);

    advance_and_round(&[&a]).await;
    assert!(a.owned().await.is_empty());

    advance_and_round(&[&a]).await;
    assert_eq!(a.owned().await.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_online_instance_stands_in_until_preferred_owner_is_online() {
    let store = MemoryStore::new();
    let all = sessions(20);
    let registry = Arc::new(StaticRegistry::new(all.clone()));
    let a = node(&store, "api-a", &registry, config());
    round(&[&a]).await;
    assert_eq!(a.owned().await.len(), 20);

    let warm = LeaseConfig {
        warmup: Duration::from_secs(10),
        ..LeaseConfig::default()
    };
    let b = node(&store, "api-b", &registry, warm);
    let b_preferred: Vec<String> = all
        .iter()
        .map(|s| s.id.clone())
        .filter(|sid| preferred(sid, &["api-a", "api-b"]) == "api-b")
        .collect();
    assert!(!b_preferred.is_empty());

    // B is still warming up: A keeps polling everything.
    round(&[&a, &b]).await;
    assert_eq!(a.owned().await.len(), 20);
    assert!(b.owned().await.is_empty());

    // B reports online from its third beat; A hands over on the tick after.
    advance_and_round(&[&a, &b]).await;
    advance_and_round(&[&a, &b]).await;
    advance_and_round(&[&a, &b]).await;
    advance_and_round(&[&a, &b]).await;

    let mut b_owned = b.owned().await;
    b_owned.sort();
    assert_eq!(b_owned, b_preferred);
    assert_steady_state(&[&a, &b], &all).await;
}

#[tokio::test(start_paused = true)]
async fn test_paused_and_removed_sessions_are_released() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(sessions(3)));
    let a = node(&store, "api-a", &registry, config());
    round(&[&a]).await;
    a.poller.wait_active(3).await;

    registry.set_paused("session-000", true).await;
    registry.remove("session-001").await;
    advance_and_round(&[&a]).await;

    assert_eq!(a.poller.active_sessions(), vec!["session-002"]);
    let owners = store_owners(&store).await;
    assert_eq!(owners.keys().collect::<Vec<_>>(), vec!["session-002"]);
    assert_eq!(a.state("session-000").await, LeaseState::Unknown);
    assert!(!a.reconciler.view.read().await.sessions.contains_key("session-001"));

    registry.set_paused("session-000", false).await;
    advance_and_round(&[&a]).await;
    a.poller.wait_active(2).await;
    assert!(a.reconciler.is_owned("session-000").await);
    assert!(a.reconciler.is_owned_strict("session-000").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_from_first_tick_skips() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(sessions(2)));
    let a = node(&store, "api-a", &registry, config());

    store.set_unavailable(true);
    assert_eq!(a.reconciler.tick().await, TickOutcome::Skipped);
    assert_eq!(a.poller.active(), 0);

    store.set_unavailable(false);
    tokio::time::advance(TICK).await;
    assert_eq!(a.reconciler.tick().await, TickOutcome::Completed);
    assert_eq!(a.owned().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session_ids_are_ignored() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(vec![
        Session::new("ok-1", "http://a"),
        Session::new("bad id", "http://b"),
        Session::new("", "http://c"),
    ]));
    let a = node(&store, "api-a", &registry, config());
    round(&[&a]).await;

    assert_eq!(a.owned().await, vec!["ok-1"]);
    assert_eq!(store_owners(&store).await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_lifecycle() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(sessions(3)));
    let a = node(&store, "api-a", &registry, config());
    let poller = a.poller.clone();
    let coordinator = LeaseCoordinator::new(a.reconciler);

    coordinator.start().await;
    coordinator.start().await;
    poller.wait_active(3).await;

    let status = coordinator.fleet_status().await;
    assert_eq!(status.this_instance_id, "api-a");
    assert!(!status.shutting_down);
    assert_eq!(status.sessions.len(), 3);
    assert!(status.sessions.iter().all(|s| s.state == LeaseState::Owned));
    assert_eq!(status.live_instances.len(), 1);
    assert!(status.live_instances[0].is_this_instance);
    assert_eq!(status.live_instances[0].owned_sessions.len(), 3);
    assert!(status.last_tick_at.is_some());

    let nodes = coordinator.nodes().await.unwrap();
    assert_eq!(nodes.live_nodes.len(), 1);
    assert_eq!(
        nodes.live_nodes[0].owned_sessions,
        vec!["session-000", "session-001", "session-002"]
    );

    let report = coordinator.stop().await;
    assert!(coordinator.is_shutting_down());
    assert_eq!(report.released.len(), 3);
    assert!(report.left_fleet);
    assert_eq!(poller.active(), 0);
    assert!(store_owners(&store).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_handoff_aborts_poller_before_release() {
    let store = MemoryStore::new();
    let handed_over = sessions(10)
        .into_iter()
        .find(|s| preferred(&s.id, &["api-a", "api-b"]) == "api-b")
        .unwrap();
    let sid = handed_over.id.clone();
    let registry = Arc::new(StaticRegistry::new(vec![handed_over]));

    let stubborn = StubbornPoller::new();
    let a = Reconciler::new(
        Instance::new("api-a"),
        Arc::new(store.clone()),
        KeySpace::default(),
        registry.clone(),
        Arc::new(stubborn.clone()),
        config(),
        LeaseMetrics::detached(),
    );
    let coordinator = LeaseCoordinator::new(a);
    coordinator.start().await;
    stubborn.wait_alive(1).await;
    assert_eq!(store_owners(&store).await[&sid], "api-a");

    let b = node(&store, "api-b", &registry, config());
    round(&[&b]).await;

    // A's next tick hands the session to B and blocks on the poller that
    // ignores cancellation.
    tokio::time::advance(TICK).await;
    settle().await;
    assert_eq!(stubborn.alive(), 1);

    coordinator.stop().await;
    stubborn.wait_alive(0).await;

    let releases = coordinator
        .reconciler()
        .events()
        .events_since(0)
        .await
        .into_iter()
        .filter(|e| e.kind == LeaseEventKind::Released && e.session_id == sid)
        .count();
    assert_eq!(releases, 1);
    assert!(store_owners(&store).await.get(&sid).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_uncertain_lease_is_not_reported_as_owned() {
    let store = MemoryStore::new();
    let registry = Arc::new(StaticRegistry::new(sessions(1)));
    let a = node(&store, "api-a", &registry, config());
    round(&[&a]).await;

    store.set_unavailable(true);
    advance_and_round(&[&a]).await;
    assert_eq!(a.state("session-000").await, LeaseState::Uncertain);

    let coordinator = LeaseCoordinator::new(a.reconciler);
    let status = coordinator.fleet_status().await;
    assert_eq!(status.sessions[0].owner_id.as_deref(), Some("api-a"));
    assert_eq!(status.live_instances.len(), 1);
    assert!(status.live_instances[0].owned_sessions.is_empty());
}
