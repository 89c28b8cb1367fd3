//! Per-peer health records and the shared health table.

use crate::identity::{NodeId, PeerRecord};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Health bookkeeping for one known peer.
///
/// `last_seen` advances monotonically with inbound traffic;
/// `reconnection_attempts` resets to zero when the peer reauthenticates.
#[derive(Clone, Debug)]
pub struct PeerHealth {
    /// Dialable address for recovery.
    pub record: PeerRecord,
    /// Instant of the last inbound envelope or authentication.
    pub last_seen: Instant,
    /// Reconnection attempts since the peer was last healthy.
    pub reconnection_attempts: u32,
    /// Earliest instant for the next recovery attempt.
    pub next_attempt_at: Instant,
    /// Set once recovery is abandoned; cleared on reauthentication.
    pub gave_up: bool,
    /// Most recent latency observation, milliseconds.
    pub latency_ms: u64,
    /// Envelopes received from this peer.
    pub message_count: u64,
    /// Errors attributed to this peer.
    pub error_count: u64,
}

impl PeerHealth {
    fn new(record: PeerRecord) -> Self {
        let now = Instant::now();
        Self {
            record,
            last_seen: now,
            reconnection_attempts: 0,
            next_attempt_at: now,
            gave_up: false,
            latency_ms: 0,
            message_count: 0,
            error_count: 0,
        }
    }

    /// Healthy iff traffic was seen within the timeout window.
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }
}

/// Shared table of per-peer health, written by the registry and swept by
/// the liveness supervisor.
#[derive(Default)]
pub struct HealthTable {
    peers: Mutex<HashMap<NodeId, PeerHealth>>,
}

impl HealthTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful authentication. Returns true when this
    /// authentication recovered a peer that had failed attempts pending.
    pub fn on_authenticated(&self, record: PeerRecord, latency_ms: u64) -> bool {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = peers
            .entry(record.peer_id)
            .or_insert_with(|| PeerHealth::new(record.clone()));
        let recovered = entry.reconnection_attempts > 0;
        entry.record = record;
        entry.last_seen = Instant::now();
        entry.reconnection_attempts = 0;
        entry.next_attempt_at = Instant::now();
        entry.gave_up = false;
        if latency_ms > 0 {
            entry.latency_ms = latency_ms;
        }
        recovered
    }

    /// Note an inbound envelope from a peer.
    pub fn touch(&self, peer_id: &NodeId) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.last_seen = Instant::now();
            entry.message_count += 1;
        }
    }

    /// Attribute an error to a peer.
    pub fn record_error(&self, peer_id: &NodeId) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(peer_id) {
            entry.error_count += 1;
        }
    }

    /// Read one peer's health.
    pub fn get(&self, peer_id: &NodeId) -> Option<PeerHealth> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
    }

    /// Snapshot of all records.
    pub fn snapshot(&self) -> Vec<PeerHealth> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Apply a mutation to one record, if present.
    pub fn update<F: FnOnce(&mut PeerHealth)>(&self, peer_id: &NodeId, f: F) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(peer_id) {
            f(entry);
        }
    }

    /// Remove a peer's record.
    pub fn remove(&self, peer_id: &NodeId) -> Option<PeerHealth> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(byte: u8) -> PeerRecord {
        PeerRecord::new(NodeId::from_bytes([byte; 16]), "127.0.0.1", 9000 + byte as u16)
    }

    #[test]
    fn test_authenticated_resets_attempts() {
        let table = HealthTable::new();
        let rec = record(1);
        table.on_authenticated(rec.clone(), 12);

        table.update(&rec.peer_id, |h| {
            h.reconnection_attempts = 3;
            h.gave_up = true;
        });

        let recovered = table.on_authenticated(rec.clone(), 8);
        assert!(recovered);
        let health = table.get(&rec.peer_id).unwrap();
        assert_eq!(health.reconnection_attempts, 0);
        assert!(!health.gave_up);
        assert_eq!(health.latency_ms, 8);
    }

    #[test]
    fn test_first_authentication_is_not_recovery() {
        let table = HealthTable::new();
        assert!(!table.on_authenticated(record(2), 5));
    }

    #[test]
    fn test_touch_counts_messages() {
        let table = HealthTable::new();
        let rec = record(3);
        table.on_authenticated(rec.clone(), 0);
        table.touch(&rec.peer_id);
        table.touch(&rec.peer_id);
        assert_eq!(table.get(&rec.peer_id).unwrap().message_count, 2);
    }

    #[test]
    fn test_touch_unknown_peer_is_noop() {
        let table = HealthTable::new();
        table.touch(&NodeId::from_bytes([9; 16]));
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_healthy_window() {
        let table = HealthTable::new();
        let rec = record(4);
        table.on_authenticated(rec.clone(), 0);
        let health = table.get(&rec.peer_id).unwrap();
        assert!(health.is_healthy(Duration::from_secs(30)));
        assert!(!health.is_healthy(Duration::from_nanos(1)));
    }
}
