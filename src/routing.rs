//! Overlay routing: next-hop table, loop suppression, path learning.
//!
//! Outbound payloads are wrapped in a routing envelope whose route records
//! every node traversed. Forwarded envelopes are deduplicated against a
//! cache of recently seen payload message ids, dropped past the hop limit,
//! delivered locally when the target matches, and otherwise forwarded per
//! the envelope's strategy:
//!
//! - **Direct**: one arbitrary next hop from the routing table.
//! - **Flood**: every authenticated peer not already on the route,
//!   excluding the peer the envelope arrived from.
//! - **Multipath**: up to three distinct next hops.
//! - **DiscoverRoute**: learn next hops from every adjacent pair on the
//!   observed route, then attempt direct forwarding.
//!
//! Forwarding failures evict the next hop and record RouteLost; retries are
//! the reliable-delivery layer's concern, not this one's.

use crate::identity::NodeId;
use crate::monitor::{EventKind, EventLog};
use crate::protocol::{EnvelopeBody, MessageEnvelope, MessageId, RoutingBody, RoutingStrategy};
use crate::registry::ConnectionRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Maximum hops a routing envelope may take.
pub const MAX_HOPS: usize = 10;

/// Maximum distinct paths used by multipath forwarding.
pub const MAX_PATHS: usize = 3;

/// Lifetime of entries in the recent-message cache.
pub const MESSAGE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Errors related to routing operations.
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("no route to {0}")]
    NoRoute(NodeId),
}

/// A payload addressed to this node, stripped of its routing wrapper.
#[derive(Debug)]
pub struct LocalDelivery {
    /// Originating sender of the payload envelope.
    pub from: NodeId,
    /// The payload itself.
    pub envelope: MessageEnvelope,
}

/// Routes envelopes through the overlay.
pub struct RoutingEngine {
    local_id: NodeId,
    registry: Arc<ConnectionRegistry>,
    /// target id -> candidate next hops.
    table: Mutex<HashMap<NodeId, HashSet<NodeId>>>,
    /// payload message id -> first seen. Suppresses loops and duplicate
    /// local delivery.
    recent: Mutex<HashMap<MessageId, Instant>>,
    deliver_tx: mpsc::Sender<LocalDelivery>,
    events: Arc<EventLog>,
}

impl RoutingEngine {
    /// Create an engine forwarding through `registry` and delivering local
    /// payloads into `deliver_tx`.
    pub fn new(
        local_id: NodeId,
        registry: Arc<ConnectionRegistry>,
        deliver_tx: mpsc::Sender<LocalDelivery>,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            local_id,
            registry,
            table: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
            deliver_tx,
            events,
        }
    }

    /// Local node id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// First-hop entry point for locally originated payloads.
    ///
    /// Strategy is chosen automatically: Direct when the table knows the
    /// target, Flood otherwise.
    pub async fn route(&self, target: NodeId, payload: MessageEnvelope) {
        let strategy = if self.has_route(&target) {
            RoutingStrategy::Direct
        } else {
            RoutingStrategy::Flood
        };
        self.route_with(target, payload, strategy).await;
    }

    /// First-hop entry point with an explicit strategy.
    pub async fn route_with(
        &self,
        target: NodeId,
        payload: MessageEnvelope,
        strategy: RoutingStrategy,
    ) {
        // Locally originated ids enter the cache too, so reflected copies
        // are dropped on return.
        if !self.note_seen(payload.message_id) {
            return;
        }

        if target == self.local_id {
            self.deliver_local(payload).await;
            return;
        }

        let body = RoutingBody::originate(self.local_id, target, strategy, payload);
        self.dispatch(body, None).await;
    }

    /// Handle a routing envelope arriving from a peer.
    pub async fn handle_routing(&self, mut body: RoutingBody, inbound_peer: Option<NodeId>) {
        if !self.note_seen(body.payload.message_id) {
            return; // duplicate
        }

        if body.hop_count() >= MAX_HOPS {
            warn!(
                payload = %body.payload.message_id,
                hops = body.hop_count(),
                "Hop limit exceeded, dropping"
            );
            return;
        }

        if body.target == self.local_id {
            self.deliver_local(body.payload).await;
            return;
        }

        if body.has_visited(&self.local_id) {
            // Already on the route; forwarding again would loop.
            return;
        }
        body.route.push(self.local_id);

        self.dispatch(body, inbound_peer).await;
    }

    /// Forward per the envelope's strategy.
    async fn dispatch(&self, body: RoutingBody, inbound_peer: Option<NodeId>) {
        match body.strategy {
            RoutingStrategy::Direct => self.forward_direct(body).await,
            RoutingStrategy::Flood => self.forward_flood(body, inbound_peer).await,
            RoutingStrategy::Multipath => self.forward_multipath(body).await,
            RoutingStrategy::DiscoverRoute => self.forward_discover(body).await,
        }
    }

    async fn forward_direct(&self, body: RoutingBody) {
        let next_hop = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .get(&body.target)
                .and_then(|hops| hops.iter().next().copied())
        };
        match next_hop {
            Some(hop) => self.forward(body, hop).await,
            None => {
                debug!(target = %body.target.short(), "No route to target, dropping");
            }
        }
    }

    async fn forward_flood(&self, body: RoutingBody, inbound_peer: Option<NodeId>) {
        let peers: Vec<NodeId> = self
            .registry
            .peer_ids()
            .into_iter()
            .filter(|id| !body.has_visited(id))
            .filter(|id| Some(*id) != inbound_peer)
            .collect();

        if peers.is_empty() {
            debug!(
                payload = %body.payload.message_id,
                "Flood has no eligible peers"
            );
            return;
        }

        for peer in peers {
            self.forward(body.clone(), peer).await;
        }
    }

    async fn forward_multipath(&self, body: RoutingBody) {
        let hops: Vec<NodeId> = {
            let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table
                .get(&body.target)
                .map(|set| set.iter().take(MAX_PATHS).copied().collect())
                .unwrap_or_default()
        };

        if hops.is_empty() {
            debug!(target = %body.target.short(), "No multipath next hops, dropping");
            return;
        }

        for hop in hops {
            self.forward(body.clone(), hop).await;
        }
    }

    /// Learn next hops from the observed route, then try direct forwarding.
    async fn forward_discover(&self, body: RoutingBody) {
        for pair in body.route.windows(2) {
            self.add_route(pair[0], pair[1]);
        }
        self.forward_direct(body).await;
    }

    /// Send to one next hop; evict the hop on failure.
    async fn forward(&self, body: RoutingBody, next_hop: NodeId) {
        let target = body.target;
        let payload_id = body.payload.message_id;
        let envelope = MessageEnvelope::new(self.local_id, EnvelopeBody::Routing(Box::new(body)));

        if let Err(e) = self.registry.send_to(&next_hop, &envelope).await {
            debug!(
                next_hop = %next_hop.short(),
                payload = %payload_id,
                error = %e,
                "Forward failed, evicting next hop"
            );
            self.remove_route(&target, &next_hop);
            self.events.record(
                EventKind::RouteLost,
                next_hop,
                format!("forward to {} failed", target.short()),
            );
        }
    }

    /// Hand a payload addressed to this node up the stack.
    async fn deliver_local(&self, envelope: MessageEnvelope) {
        let delivery = LocalDelivery {
            from: envelope.sender_id,
            envelope,
        };
        if self.deliver_tx.send(delivery).await.is_err() {
            debug!("Local delivery channel closed, dropping payload");
        }
    }

    /// Record a message id as seen. Returns false when it was already
    /// cached (duplicate). Expired entries are pruned opportunistically.
    fn note_seen(&self, message_id: MessageId) -> bool {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        recent.retain(|_, seen| now.duration_since(*seen) < MESSAGE_CACHE_TTL);
        match recent.entry(message_id) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(v) => {
                v.insert(now);
                true
            }
        }
    }

    /// Whether the table knows a next hop for the target.
    pub fn has_route(&self, target: &NodeId) -> bool {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .map(|hops| !hops.is_empty())
            .unwrap_or(false)
    }

    /// Add a next hop for a target.
    pub fn add_route(&self, target: NodeId, next_hop: NodeId) {
        if target == next_hop {
            return;
        }
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let inserted = table.entry(target).or_default().insert(next_hop);
        if inserted {
            info!(
                target = %target.short(),
                next_hop = %next_hop.short(),
                "Route learned"
            );
            self.events.record(
                EventKind::RouteDiscovered,
                target,
                format!("via {}", next_hop.short()),
            );
        }
    }

    /// Remove a next hop for a target, dropping empty entries.
    pub fn remove_route(&self, target: &NodeId, next_hop: &NodeId) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hops) = table.get_mut(target) {
            hops.remove(next_hop);
            if hops.is_empty() {
                table.remove(target);
            }
        }
    }

    /// Next hops known for a target.
    pub fn routes_to(&self, target: &NodeId) -> Vec<NodeId> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .map(|hops| hops.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of cached recent message ids (diagnostics).
    pub fn recent_cache_len(&self) -> usize {
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop routing state. New envelopes are still processed; call order
    /// with registry shutdown makes that moot in practice.
    pub fn shutdown(&self) {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!("Routing engine cleared");
    }
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("RoutingEngine")
            .field("local_id", &self.local_id)
            .field("targets", &table.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::monitor::HealthTable;
    use crate::protocol::{DataBody, DataState};

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 16])
    }

    fn make_engine() -> (Arc<RoutingEngine>, mpsc::Receiver<LocalDelivery>) {
        let identity = Arc::new(Identity::generate());
        let events = Arc::new(EventLog::new());
        let health = Arc::new(HealthTable::new());
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let registry = Arc::new(ConnectionRegistry::new(
            identity.clone(),
            inbound_tx,
            events.clone(),
            health,
        ));
        let (deliver_tx, deliver_rx) = mpsc::channel(16);
        let engine = Arc::new(RoutingEngine::new(
            identity.node_id(),
            registry,
            deliver_tx,
            events,
        ));
        (engine, deliver_rx)
    }

    fn payload(sender: NodeId) -> MessageEnvelope {
        MessageEnvelope::new(
            sender,
            EnvelopeBody::Data(DataBody::control(
                MessageId::generate(),
                1,
                0,
                DataState::Acknowledgment,
            )),
        )
    }

    #[test]
    fn test_route_table_add_remove() {
        let (engine, _rx) = make_engine();
        let target = node_id(1);
        engine.add_route(target, node_id(2));
        engine.add_route(target, node_id(3));
        assert!(engine.has_route(&target));
        assert_eq!(engine.routes_to(&target).len(), 2);

        engine.remove_route(&target, &node_id(2));
        assert_eq!(engine.routes_to(&target), vec![node_id(3)]);
        engine.remove_route(&target, &node_id(3));
        assert!(!engine.has_route(&target));
    }

    #[test]
    fn test_self_route_rejected() {
        let (engine, _rx) = make_engine();
        engine.add_route(node_id(1), node_id(1));
        assert!(!engine.has_route(&node_id(1)));
    }

    #[tokio::test]
    async fn test_local_target_delivered() {
        let (engine, mut rx) = make_engine();
        let local = engine.local_id();
        let env = payload(node_id(7));
        let id = env.message_id;

        engine.route(local, env).await;
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.envelope.message_id, id);
        assert_eq!(delivery.from, node_id(7));
    }

    #[tokio::test]
    async fn test_duplicate_suppressed() {
        let (engine, mut rx) = make_engine();
        let local = engine.local_id();
        let env = payload(node_id(7));

        engine.route(local, env.clone()).await;
        assert!(rx.recv().await.is_some());

        // Same message id again: delivered at most once.
        engine.route(local, env).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forwarded_duplicate_suppressed() {
        let (engine, mut rx) = make_engine();
        let local = engine.local_id();

        let inner = payload(node_id(7));
        let body = RoutingBody::originate(node_id(7), local, RoutingStrategy::Direct, inner);

        engine.handle_routing(body.clone(), Some(node_id(7))).await;
        assert!(rx.recv().await.is_some());

        engine.handle_routing(body, Some(node_id(7))).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hop_limit_drops() {
        let (engine, mut rx) = make_engine();
        let local = engine.local_id();

        let inner = payload(node_id(7));
        let mut body = RoutingBody::originate(node_id(1), local, RoutingStrategy::Direct, inner);
        for i in 2..=(MAX_HOPS as u8 + 1) {
            body.route.push(node_id(i));
        }
        assert!(body.hop_count() >= MAX_HOPS);

        engine.handle_routing(body, Some(node_id(2))).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_discover_route_learns_pairs() {
        let (engine, _rx) = make_engine();

        let inner = payload(node_id(1));
        let mut body =
            RoutingBody::originate(node_id(1), node_id(9), RoutingStrategy::DiscoverRoute, inner);
        body.route.push(node_id(2));
        body.route.push(node_id(3));

        engine.handle_routing(body, Some(node_id(3))).await;

        assert_eq!(engine.routes_to(&node_id(1)), vec![node_id(2)]);
        assert_eq!(engine.routes_to(&node_id(2)), vec![node_id(3)]);
    }

    #[tokio::test]
    async fn test_cache_expiry_keeps_fresh_entries() {
        let (engine, _rx) = make_engine();
        assert!(engine.note_seen(MessageId::generate()));
        assert!(engine.note_seen(MessageId::generate()));
        assert_eq!(engine.recent_cache_len(), 2);
    }
}
