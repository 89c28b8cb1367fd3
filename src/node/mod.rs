//! Node facade.
//!
//! Composes the signature service, connection registry, routing engine,
//! reliable delivery, discovery, and liveness monitor, and owns the tasks
//! wiring them together. `start` and `stop` are idempotent; `stop` is safe
//! to call before `start` completed.

#[cfg(test)]
mod tests;

use crate::config::{Config, ConfigError};
use crate::crypto::CryptoError;
use crate::delivery::{DeliveryError, MessageHandler, ReliableDelivery};
use crate::discovery::{DiscoveryError, DiscoveryService};
use crate::identity::{Identity, NodeId, PeerRecord};
use crate::monitor::{EventLog, HealthTable, LivenessMonitor, NetworkEvent, NetworkStats};
use crate::protocol::{EnvelopeBody, MessageId};
use crate::registry::{ConnectionRegistry, InboundEnvelope, RegistryError};
use crate::routing::{LocalDelivery, RoutingEngine};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Buffer sizes for the dispatch channels.
const CHANNEL_BUFFER: usize = 256;

/// Errors related to node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("node is not running")]
    NotRunning,
}

/// Node operational state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Created but not started.
    Created,
    /// Starting up.
    Starting,
    /// Fully operational.
    Running,
    /// Shutting down.
    Stopping,
    /// Stopped. Node instances are single-use; a stopped node stays
    /// stopped.
    Stopped,
}

impl NodeState {
    /// Check if the node is operational.
    pub fn is_running(&self) -> bool {
        matches!(self, NodeState::Running)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Created => "created",
            NodeState::Starting => "starting",
            NodeState::Running => "running",
            NodeState::Stopping => "stopping",
            NodeState::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

/// A mesh node instance.
pub struct Node {
    config: Config,
    identity: Arc<Identity>,
    state: Mutex<NodeState>,
    events: Arc<EventLog>,
    health: Arc<HealthTable>,
    registry: Arc<ConnectionRegistry>,
    routing: Arc<RoutingEngine>,
    delivery: Arc<ReliableDelivery>,
    discovery: Arc<DiscoveryService>,
    monitor: Arc<LivenessMonitor>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundEnvelope>>>,
    deliver_rx: Mutex<Option<mpsc::Receiver<LocalDelivery>>>,
    dispatch_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Create a node from configuration. The identity comes from the
    /// configured seed or a fresh keypair.
    pub fn new(config: Config) -> Result<Self, NodeError> {
        let identity = match config.identity_seed()? {
            Some(seed) => Identity::from_seed(&seed)?,
            None => Identity::generate(),
        };
        let identity = Arc::new(identity);
        let local_id = identity.node_id();

        let events = Arc::new(EventLog::new());
        let health = Arc::new(HealthTable::new());

        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_BUFFER);
        let (deliver_tx, deliver_rx) = mpsc::channel(CHANNEL_BUFFER);

        let registry = Arc::new(ConnectionRegistry::new(
            identity.clone(),
            inbound_tx,
            events.clone(),
            health.clone(),
        ));
        let routing = Arc::new(RoutingEngine::new(
            local_id,
            registry.clone(),
            deliver_tx,
            events.clone(),
        ));
        let delivery = Arc::new(ReliableDelivery::new(local_id, routing.clone()));
        let discovery = Arc::new(DiscoveryService::new(
            config.discovery.clone(),
            local_id,
            registry.clone(),
        ));
        let monitor = Arc::new(LivenessMonitor::new(
            config.health.clone(),
            registry.clone(),
            health.clone(),
            events.clone(),
        ));

        info!(node_id = %local_id, "Node created");

        Ok(Self {
            config,
            identity,
            state: Mutex::new(NodeState::Created),
            events,
            health,
            registry,
            routing,
            delivery,
            discovery,
            monitor,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            deliver_rx: Mutex::new(Some(deliver_rx)),
            dispatch_tasks: Mutex::new(Vec::new()),
        })
    }

    /// This node's id.
    pub fn local_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Current operational state.
    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bound TCP listen address, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.registry.local_addr()
    }

    /// Start the node. Idempotent: calling start on a running node is a
    /// no-op.
    pub async fn start(&self) -> Result<(), NodeError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                NodeState::Created => *state = NodeState::Starting,
                _ => {
                    debug!(state = %*state, "Start ignored");
                    return Ok(());
                }
            }
        }

        let local_addr = self
            .registry
            .start(&self.config.node.bind_addr, self.config.node.service_port)
            .await?;

        self.spawn_dispatchers();
        self.delivery.start();

        if self.config.discovery.enabled {
            self.discovery.start(local_addr.port()).await?;
        }
        self.monitor.start();

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = NodeState::Running;
        info!(
            node_id = %self.local_id().short(),
            local_addr = %local_addr,
            "Node started"
        );
        Ok(())
    }

    /// Wire the registry and routing output channels to their consumers.
    fn spawn_dispatchers(&self) {
        let mut tasks = self.dispatch_tasks.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(mut inbound_rx) = self
            .inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let routing = self.routing.clone();
            let delivery = self.delivery.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(InboundEnvelope { from, envelope }) = inbound_rx.recv().await {
                    match envelope.body {
                        EnvelopeBody::Routing(body) => {
                            routing.handle_routing(*body, Some(from)).await;
                        }
                        EnvelopeBody::Data(_) => {
                            delivery.on_data(envelope).await;
                        }
                        _ => {
                            debug!(kind = %envelope.kind(), "Unexpected inbound kind");
                        }
                    }
                }
            }));
        }

        if let Some(mut deliver_rx) = self
            .deliver_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let delivery = self.delivery.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(LocalDelivery { envelope, .. }) = deliver_rx.recv().await {
                    if matches!(envelope.body, EnvelopeBody::Data(_)) {
                        delivery.on_data(envelope).await;
                    } else {
                        debug!(kind = %envelope.kind(), "Undeliverable local payload");
                    }
                }
            }));
        }
    }

    /// Stop the node. Idempotent and safe to call before start completed.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match *state {
                NodeState::Running | NodeState::Starting => *state = NodeState::Stopping,
                _ => {
                    debug!(state = %*state, "Stop ignored");
                    return;
                }
            }
        }

        self.discovery.shutdown().await;
        self.monitor.shutdown().await;
        self.delivery.shutdown().await;
        self.registry.shutdown().await;
        self.routing.shutdown();

        let tasks: Vec<JoinHandle<()>> = self
            .dispatch_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = NodeState::Stopped;
        info!(node_id = %self.local_id().short(), "Node stopped");
    }

    /// Dial a peer by address and run the handshake.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), NodeError> {
        if !self.state().is_running() {
            return Err(NodeError::NotRunning);
        }
        self.registry.connect(host, port).await?;
        Ok(())
    }

    /// Send an application payload to a peer, fragmenting as needed.
    /// Returns the payload group id.
    pub async fn send(&self, target: NodeId, data: &[u8]) -> Result<MessageId, NodeError> {
        if !self.state().is_running() {
            return Err(NodeError::NotRunning);
        }
        Ok(self.delivery.send(target, data).await?)
    }

    /// Install the callback invoked with fully reassembled payloads.
    pub fn set_message_handler(&self, handler: MessageHandler) {
        self.delivery.set_handler(handler);
    }

    /// Snapshot of authenticated peers.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.all_peers()
    }

    /// Number of authenticated peers.
    pub fn peer_count(&self) -> usize {
        self.registry.peer_count()
    }

    /// Retained network events, oldest first.
    pub fn recent_events(&self) -> Vec<NetworkEvent> {
        self.events.recent()
    }

    /// Health record for one peer, if known.
    pub fn peer_health(&self, peer_id: &NodeId) -> Option<crate::monitor::PeerHealth> {
        self.health.get(peer_id)
    }

    /// Latest metrics snapshot.
    pub fn network_stats(&self) -> NetworkStats {
        self.monitor.network_stats()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.local_id())
            .field("state", &self.state())
            .field("peers", &self.peer_count())
            .finish()
    }
}
