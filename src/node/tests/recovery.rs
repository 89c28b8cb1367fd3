//! Bounded-backoff recovery behavior.

use crate::config::HealthConfig;
use crate::identity::{Identity, NodeId, PeerRecord};
use crate::monitor::{backoff_delay, EventKind, EventLog, HealthTable, LivenessMonitor};
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;

fn harness(
    config: HealthConfig,
) -> (Arc<LivenessMonitor>, Arc<HealthTable>, Arc<EventLog>) {
    let identity = Arc::new(Identity::generate());
    let events = Arc::new(EventLog::new());
    let health = Arc::new(HealthTable::new());
    let (inbound_tx, _inbound_rx) = mpsc::channel(8);
    let registry = Arc::new(ConnectionRegistry::new(
        identity,
        inbound_tx,
        events.clone(),
        health.clone(),
    ));
    let monitor = Arc::new(LivenessMonitor::new(
        config,
        registry,
        health.clone(),
        events.clone(),
    ));
    (monitor, health, events)
}

#[tokio::test]
async fn test_reconnection_bounded_at_five_attempts() {
    let config = HealthConfig {
        check_interval_secs: 1,
        metrics_interval_secs: 1,
        peer_timeout_secs: 0, // every peer is immediately unhealthy
        max_reconnect_attempts: 5,
        backoff_base_ms: 0, // every attempt is immediately due
    };
    let (monitor, health, events) = harness(config);

    // A peer nothing listens for: connects are refused instantly.
    let dead = PeerRecord::new(NodeId::from_bytes([3; 16]), "127.0.0.1", 9);
    health.on_authenticated(dead.clone(), 0);

    for _ in 0..8 {
        monitor.health_sweep().await;
    }

    assert_eq!(events.count(EventKind::RecoveryAttempted), 5);
    assert_eq!(events.count(EventKind::RecoveryFailed), 1);
    assert!(events.count(EventKind::PeerUnhealthy) >= 5);

    let record = health.get(&dead.peer_id).unwrap();
    assert_eq!(record.reconnection_attempts, 5);
    assert!(record.gave_up);
}

#[tokio::test]
async fn test_backoff_respected_between_attempts() {
    let config = HealthConfig {
        check_interval_secs: 1,
        metrics_interval_secs: 1,
        peer_timeout_secs: 0,
        max_reconnect_attempts: 5,
        backoff_base_ms: 60_000, // far beyond the test duration
    };
    let (monitor, health, events) = harness(config);

    let dead = PeerRecord::new(NodeId::from_bytes([4; 16]), "127.0.0.1", 9);
    health.on_authenticated(dead.clone(), 0);

    // First sweep dials once; further sweeps are inside the backoff.
    for _ in 0..4 {
        monitor.health_sweep().await;
    }

    assert_eq!(events.count(EventKind::RecoveryAttempted), 1);
    assert_eq!(health.get(&dead.peer_id).unwrap().reconnection_attempts, 1);
}

#[test]
fn test_backoff_schedule_matches_policy() {
    // 1000 * 2^attempts: 2s, 4s, 8s, 16s, 32s.
    let delays: Vec<u64> = (1..=5)
        .map(|n| backoff_delay(1000, n).as_secs())
        .collect();
    assert_eq!(delays, vec![2, 4, 8, 16, 32]);
}
