//! UDP broadcast peer discovery.
//!
//! Two periodic jobs: a broadcast probe announcing this node to the local
//! network, and a sweep dropping peers not seen for a while. Responses and
//! peer-list exchanges feed candidate addresses into the connection
//! registry, which dials any peer without an authenticated session.
//!
//! Frames are bare discovery envelopes in datagrams of at most 8 KiB.
//! Self-broadcasts come back on the same socket and are ignored by sender
//! id. The discovery port is configurable (default 54321) so colocated
//! nodes can run isolated meshes.

use crate::config::DiscoveryConfig;
use crate::identity::{NodeId, PeerRecord};
use crate::protocol::{
    DiscoveryBody, DiscoveryKind, EnvelopeBody, MessageEnvelope, MAX_DATAGRAM_SIZE,
};
use crate::registry::ConnectionRegistry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Limited broadcast address for probes.
const BROADCAST_ADDR: &str = "255.255.255.255";

/// Errors related to the discovery service.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to bind discovery socket on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },
}

/// A peer learned via discovery.
#[derive(Clone, Debug)]
struct KnownPeer {
    record: PeerRecord,
    last_seen: Instant,
}

/// Broadcast discovery loop feeding the connection registry.
pub struct DiscoveryService {
    local_id: NodeId,
    config: DiscoveryConfig,
    registry: Arc<ConnectionRegistry>,
    known: Mutex<HashMap<NodeId, KnownPeer>>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl DiscoveryService {
    /// Create a discovery service.
    pub fn new(config: DiscoveryConfig, local_id: NodeId, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            local_id,
            config,
            registry,
            known: Mutex::new(HashMap::new()),
            socket: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Bind the discovery socket and start the broadcast, receive, and
    /// sweep jobs. `service_port` is the TCP port advertised to peers.
    pub async fn start(self: &Arc<Self>, service_port: u16) -> Result<(), DiscoveryError> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|source| DiscoveryError::Bind {
                port: self.config.port,
                source,
            })?;
        socket.set_broadcast(true).map_err(|source| DiscoveryError::Bind {
            port: self.config.port,
            source,
        })?;
        let socket = Arc::new(socket);
        *self.socket.lock().unwrap_or_else(|e| e.into_inner()) = Some(socket.clone());

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        // Receive loop.
        let service = self.clone();
        let recv_socket = socket.clone();
        tasks.push(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, src)) => {
                        service.handle_datagram(&buf[..len], src, service_port).await;
                    }
                    Err(e) => {
                        if service.shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "Discovery receive failed");
                    }
                }
            }
        }));

        // Broadcast probe.
        let service = self.clone();
        let probe_socket = socket.clone();
        let interval = Duration::from_secs(self.config.broadcast_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                service.broadcast_probe(&probe_socket, service_port).await;
            }
        }));

        // Stale peer sweep.
        let service = self.clone();
        let sweep_interval = Duration::from_secs(self.config.sweep_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(sweep_interval);
            tick.tick().await; // skip the immediate tick
            loop {
                tick.tick().await;
                service.sweep_stale(sweep_interval);
            }
        }));

        info!(port = self.config.port, "Discovery service started");
        Ok(())
    }

    /// Send one broadcast probe.
    async fn broadcast_probe(&self, socket: &UdpSocket, service_port: u16) {
        let body = DiscoveryBody::new(
            DiscoveryKind::Request,
            self.config.advertise_host.clone(),
            service_port,
        );
        let envelope = MessageEnvelope::new(self.local_id, EnvelopeBody::Discovery(body));
        let target = (BROADCAST_ADDR, self.config.port);
        match socket.send_to(&envelope.encode(), target).await {
            Ok(_) => debug!("Sent discovery broadcast"),
            Err(e) => debug!(error = %e, "Discovery broadcast failed"),
        }
    }

    /// Handle one inbound datagram.
    async fn handle_datagram(&self, data: &[u8], src: SocketAddr, service_port: u16) {
        let envelope = match MessageEnvelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(src = %src, error = %e, "Malformed discovery datagram");
                return;
            }
        };

        // Our own broadcasts come back to us.
        if envelope.sender_id == self.local_id {
            return;
        }

        let body = match &envelope.body {
            EnvelopeBody::Discovery(body) => body,
            _ => {
                debug!(src = %src, kind = %envelope.kind(), "Non-discovery envelope on discovery port");
                return;
            }
        };

        match body.kind {
            DiscoveryKind::Request => {
                let reply = DiscoveryBody::new(
                    DiscoveryKind::Response,
                    self.config.advertise_host.clone(),
                    service_port,
                );
                self.send_unicast(reply, src).await;
            }
            DiscoveryKind::Response => {
                // The datagram's source address is more trustworthy than
                // the advertised host for dialing back.
                let host = src.ip().to_string();
                let record = PeerRecord::new(envelope.sender_id, host, body.service_port);
                self.note_peer(record).await;
            }
            DiscoveryKind::PeerListRequest => {
                let peers = self.known_peers();
                let reply = DiscoveryBody::peer_list(
                    self.config.advertise_host.clone(),
                    service_port,
                    peers,
                );
                self.send_unicast(reply, src).await;
            }
            DiscoveryKind::PeerListResponse => {
                for record in body.peers.clone() {
                    self.note_peer(record).await;
                }
            }
        }
    }

    /// Record a discovered peer and dial it when no authenticated session
    /// exists.
    async fn note_peer(&self, record: PeerRecord) {
        if record.peer_id == self.local_id {
            return;
        }

        let newly_known = {
            let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
            let is_new = !known.contains_key(&record.peer_id);
            known.insert(
                record.peer_id,
                KnownPeer {
                    record: record.clone(),
                    last_seen: Instant::now(),
                },
            );
            is_new
        };

        if newly_known {
            info!(peer = %record, "Discovered peer");
        }

        if !self.registry.is_authenticated(&record.peer_id) {
            if let Err(e) = self.registry.connect(&record.host, record.port).await {
                debug!(peer = %record, error = %e, "Connect to discovered peer failed");
            }
        }
    }

    async fn send_unicast(&self, body: DiscoveryBody, dst: SocketAddr) {
        let socket = {
            let guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let Some(socket) = socket else { return };
        let envelope = MessageEnvelope::new(self.local_id, EnvelopeBody::Discovery(body));
        if let Err(e) = socket.send_to(&envelope.encode(), dst).await {
            debug!(dst = %dst, error = %e, "Discovery unicast failed");
        }
    }

    /// Drop peers not seen within the expiry window, unless a session to
    /// them is still authenticated.
    fn sweep_stale(&self, expiry: Duration) {
        let registry = &self.registry;
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.retain(|peer_id, peer| {
            peer.last_seen.elapsed() <= expiry || registry.is_authenticated(peer_id)
        });
    }

    /// Snapshot of known peers.
    pub fn known_peers(&self) -> Vec<PeerRecord> {
        self.known
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|peer| peer.record.clone())
            .collect()
    }

    /// Stop all discovery jobs and drop the socket.
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
        *self.socket.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.known.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!("Discovery service stopped");
    }
}
