//! Point-in-time network statistics.

use crate::monitor::health::PeerHealth;

/// Consistent snapshot of network performance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Peers with an authenticated session.
    pub active_peers: usize,
    /// Mean of the per-peer latency observations, milliseconds.
    pub average_latency_ms: u64,
    /// Total envelopes received across all peers.
    pub message_count: u64,
    /// Errors per hundred messages; zero when no messages were seen.
    pub error_rate: u64,
}

impl NetworkStats {
    /// Compute a snapshot from the health table contents.
    pub fn compute(active_peers: usize, health: &[PeerHealth]) -> Self {
        let samples: Vec<u64> = health
            .iter()
            .filter(|h| h.latency_ms > 0)
            .map(|h| h.latency_ms)
            .collect();
        let average_latency_ms = if samples.is_empty() {
            0
        } else {
            samples.iter().sum::<u64>() / samples.len() as u64
        };

        let message_count: u64 = health.iter().map(|h| h.message_count).sum();
        let error_count: u64 = health.iter().map(|h| h.error_count).sum();
        let error_rate = if message_count == 0 {
            0
        } else {
            error_count * 100 / message_count
        };

        Self {
            active_peers,
            average_latency_ms,
            message_count,
            error_rate,
        }
    }
}
