//! Ring-buffered network event log.

use crate::identity::NodeId;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

/// Maximum number of retained events; oldest are evicted on overflow.
pub const EVENT_LOG_CAPACITY: usize = 1000;

/// Kind of a recorded network event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    PeerConnected,
    PeerDisconnected,
    PeerUnhealthy,
    RouteDiscovered,
    RouteLost,
    RecoveryAttempted,
    RecoverySucceeded,
    RecoveryFailed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::PeerConnected => "peer-connected",
            EventKind::PeerDisconnected => "peer-disconnected",
            EventKind::PeerUnhealthy => "peer-unhealthy",
            EventKind::RouteDiscovered => "route-discovered",
            EventKind::RouteLost => "route-lost",
            EventKind::RecoveryAttempted => "recovery-attempted",
            EventKind::RecoverySucceeded => "recovery-succeeded",
            EventKind::RecoveryFailed => "recovery-failed",
        };
        write!(f, "{}", s)
    }
}

/// One entry in the event log.
#[derive(Clone, Debug)]
pub struct NetworkEvent {
    pub kind: EventKind,
    pub peer_id: NodeId,
    pub description: String,
    pub timestamp: SystemTime,
}

impl NetworkEvent {
    /// Create an event stamped with the current time.
    pub fn new(kind: EventKind, peer_id: NodeId, description: impl Into<String>) -> Self {
        Self {
            kind,
            peer_id,
            description: description.into(),
            timestamp: SystemTime::now(),
        }
    }
}

/// Append-only bounded event history, oldest-first.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<VecDeque<NetworkEvent>>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, evicting the oldest past capacity.
    pub fn record(&self, kind: EventKind, peer_id: NodeId, description: impl Into<String>) {
        let event = NetworkEvent::new(kind, peer_id, description);
        debug!(kind = %event.kind, peer = %peer_id.short(), "Network event");
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push_back(event);
        while events.len() > EVENT_LOG_CAPACITY {
            events.pop_front();
        }
    }

    /// Snapshot of the retained events in chronological order.
    pub fn recent(&self) -> Vec<NetworkEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count retained events of one kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 16])
    }

    #[test]
    fn test_record_and_read() {
        let log = EventLog::new();
        log.record(EventKind::PeerConnected, node_id(1), "handshake complete");
        log.record(EventKind::PeerDisconnected, node_id(1), "transport closed");

        let events = log.recent();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::PeerConnected);
        assert_eq!(events[1].kind, EventKind::PeerDisconnected);
    }

    #[test]
    fn test_capacity_bound() {
        let log = EventLog::new();
        for i in 0..(EVENT_LOG_CAPACITY + 250) {
            log.record(EventKind::RouteLost, node_id((i % 251) as u8), "x");
        }
        assert_eq!(log.len(), EVENT_LOG_CAPACITY);
    }

    #[test]
    fn test_eviction_keeps_newest() {
        let log = EventLog::new();
        log.record(EventKind::PeerConnected, node_id(1), "first");
        for _ in 0..EVENT_LOG_CAPACITY {
            log.record(EventKind::RouteLost, node_id(2), "later");
        }
        let events = log.recent();
        assert_eq!(events.len(), EVENT_LOG_CAPACITY);
        assert_eq!(events[0].kind, EventKind::RouteLost);
    }

    #[test]
    fn test_count_by_kind() {
        let log = EventLog::new();
        log.record(EventKind::RecoveryAttempted, node_id(1), "a");
        log.record(EventKind::RecoveryAttempted, node_id(1), "b");
        log.record(EventKind::RecoveryFailed, node_id(1), "c");
        assert_eq!(log.count(EventKind::RecoveryAttempted), 2);
        assert_eq!(log.count(EventKind::RecoveryFailed), 1);
        assert_eq!(log.count(EventKind::PeerConnected), 0);
    }
}
