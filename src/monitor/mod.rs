//! Liveness supervision: health sweeps, bounded-backoff recovery,
//! event history, and metrics snapshots.
//!
//! The supervisor sweeps every known peer on a short interval. A peer with
//! no traffic inside the timeout window is unhealthy; recovery dials the
//! peer again with exponential backoff (`base * 2^attempts`) until either
//! the handshake succeeds (attempts reset) or the attempt budget is
//! exhausted (RecoveryFailed, no further dialing until the peer comes
//! back on its own).

mod event;
mod health;
mod stats;

pub use event::{EventKind, EventLog, NetworkEvent, EVENT_LOG_CAPACITY};
pub use health::{HealthTable, PeerHealth};
pub use stats::NetworkStats;

use crate::config::HealthConfig;
use crate::identity::NodeId;
use crate::registry::ConnectionRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backoff before reconnection attempt number `attempts`.
///
/// `base_ms * 2^attempts`, saturating.
pub fn backoff_delay(base_ms: u64, attempts: u32) -> Duration {
    let multiplier = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier))
}

/// Periodic health sweeps and recovery over the shared health table.
pub struct LivenessMonitor {
    config: HealthConfig,
    registry: Arc<ConnectionRegistry>,
    health: Arc<HealthTable>,
    events: Arc<EventLog>,
    stats: Mutex<NetworkStats>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl LivenessMonitor {
    /// Create a monitor over the shared health table and event log.
    pub fn new(
        config: HealthConfig,
        registry: Arc<ConnectionRegistry>,
        health: Arc<HealthTable>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            config,
            registry,
            health,
            events,
            stats: Mutex::new(NetworkStats::default()),
            tasks: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Start the health sweep and metrics sampling jobs.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        let monitor = self.clone();
        let check_interval = Duration::from_secs(self.config.check_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(check_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                monitor.health_sweep().await;
            }
        }));

        let monitor = self.clone();
        let metrics_interval = Duration::from_secs(self.config.metrics_interval_secs.max(1));
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(metrics_interval);
            loop {
                tick.tick().await;
                monitor.sample_metrics();
            }
        }));

        info!(
            check_interval_secs = self.config.check_interval_secs,
            "Liveness monitor started"
        );
    }

    /// One pass over every known peer.
    pub async fn health_sweep(&self) {
        let timeout = Duration::from_secs(self.config.peer_timeout_secs);
        let now = Instant::now();

        // Decide actions under the lock, dial after releasing it.
        let mut unhealthy: Vec<NodeId> = Vec::new();
        let mut to_recover: Vec<(NodeId, String, u16, u32)> = Vec::new();
        let mut failed: Vec<NodeId> = Vec::new();
        for peer in self.health.snapshot() {
            if peer.is_healthy(timeout) || peer.gave_up {
                continue;
            }
            let peer_id = peer.record.peer_id;
            unhealthy.push(peer_id);

            if now < peer.next_attempt_at {
                continue; // backing off
            }
            if peer.reconnection_attempts < self.config.max_reconnect_attempts {
                to_recover.push((
                    peer_id,
                    peer.record.host.clone(),
                    peer.record.port,
                    peer.reconnection_attempts,
                ));
            } else {
                failed.push(peer_id);
            }
        }

        for peer_id in &unhealthy {
            self.events
                .record(EventKind::PeerUnhealthy, *peer_id, "no recent traffic");
        }

        for peer_id in failed {
            warn!(peer = %peer_id.short(), "Recovery attempts exhausted, giving up");
            self.events.record(
                EventKind::RecoveryFailed,
                peer_id,
                format!("{} attempts exhausted", self.config.max_reconnect_attempts),
            );
            self.health.update(&peer_id, |h| h.gave_up = true);
        }

        for (peer_id, host, port, prior_attempts) in to_recover {
            let attempts = prior_attempts + 1;
            let delay = backoff_delay(self.config.backoff_base_ms, attempts);
            self.health.update(&peer_id, |h| {
                h.reconnection_attempts = attempts;
                h.next_attempt_at = now + delay;
            });

            info!(
                peer = %peer_id.short(),
                attempt = attempts,
                next_delay_ms = delay.as_millis() as u64,
                "Attempting peer recovery"
            );
            self.events.record(
                EventKind::RecoveryAttempted,
                peer_id,
                format!("attempt {}", attempts),
            );

            if let Err(e) = self.registry.connect(&host, port).await {
                debug!(peer = %peer_id.short(), error = %e, "Recovery connect failed");
            }
        }
    }

    /// Refresh the stats snapshot.
    fn sample_metrics(&self) {
        let snapshot = NetworkStats::compute(self.registry.peer_count(), &self.health.snapshot());
        *self.stats.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    /// Point-in-time statistics from the last sample.
    pub fn network_stats(&self) -> NetworkStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Retained event history, oldest first.
    pub fn recent_events(&self) -> Vec<NetworkEvent> {
        self.events.recent()
    }

    /// Stop the sweep and sampling jobs.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        debug!("Liveness monitor stopped");
    }
}
