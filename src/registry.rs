//! Connection registry: session ownership and inbound dispatch.
//!
//! The registry owns the TCP listener and every live session. Inbound
//! envelopes are dispatched by kind: handshake messages drive the session
//! state machine in place; routing and data envelopes are forwarded to the
//! overlay only once the session is authenticated. Unauthenticated peers
//! sending anything but handshake frames lose their session.
//!
//! ## Handshake races
//!
//! Two nodes may dial each other simultaneously. Both handshakes complete
//! independently and de-duplication happens at promotion: duplicates in
//! the same direction keep the earlier session, while cross-connections
//! keep the one initiated by the smaller node id, so both endpoints
//! settle on the same surviving connection.

use crate::handshake::HandshakeEngine;
use crate::identity::{Identity, NodeId, PeerRecord};
use crate::monitor::{EventKind, EventLog, HealthTable};
use crate::protocol::{EnvelopeBody, HandshakeBody, MessageEnvelope};
use crate::session::{
    read_frame, write_frame, Session, SessionDirection, SessionId, SessionState, TransportError,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Timeout for outbound TCP connects.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on waiting for session tasks at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors related to registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("registry is shut down")]
    ShutDown,

    #[error("no authenticated session for {0}")]
    NoRoute(NodeId),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// An authenticated inbound envelope handed up to the overlay.
#[derive(Debug)]
pub struct InboundEnvelope {
    /// Authenticated peer the envelope arrived from.
    pub from: NodeId,
    /// The envelope itself.
    pub envelope: MessageEnvelope,
}

/// Owns active transports and maps peer ids to sessions.
pub struct ConnectionRegistry {
    identity: Arc<Identity>,
    local_id: NodeId,
    engine: HandshakeEngine,
    /// TCP service port, set once the listener is bound.
    service_port: AtomicU16,
    /// All live sessions, including those still handshaking.
    sessions: Mutex<HashMap<SessionId, Arc<Session>>>,
    /// Authenticated sessions by verified peer id.
    peers: Mutex<HashMap<NodeId, Arc<Session>>>,
    /// I/O task handles per session, for shutdown.
    session_tasks: Mutex<HashMap<SessionId, Vec<JoinHandle<()>>>>,
    next_session_id: AtomicU64,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    events: Arc<EventLog>,
    health: Arc<HealthTable>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: AtomicBool,
}

impl ConnectionRegistry {
    /// Create a registry. Envelopes from authenticated peers flow out
    /// through `inbound_tx`.
    pub fn new(
        identity: Arc<Identity>,
        inbound_tx: mpsc::Sender<InboundEnvelope>,
        events: Arc<EventLog>,
        health: Arc<HealthTable>,
    ) -> Self {
        let local_id = identity.node_id();
        let engine = HandshakeEngine::new(identity.clone());
        Self {
            identity,
            local_id,
            engine,
            service_port: AtomicU16::new(0),
            sessions: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            session_tasks: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            inbound_tx,
            events,
            health,
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Local node id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Local public key (for diagnostics).
    pub fn public_key(&self) -> &[u8] {
        self.identity.public_key()
    }

    /// Bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advertised TCP service port.
    pub fn service_port(&self) -> u16 {
        self.service_port.load(Ordering::Relaxed)
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Port 0 selects a kernel-assigned port; the chosen port is returned
    /// and advertised via discovery.
    pub async fn start(self: &Arc<Self>, bind_addr: &str, port: u16) -> Result<SocketAddr, RegistryError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(RegistryError::ShutDown);
        }

        let addr = format!("{}:{}", bind_addr, port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| RegistryError::Bind {
            addr: addr.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| RegistryError::Bind {
            addr,
            source,
        })?;

        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);
        self.service_port.store(local_addr.port(), Ordering::Relaxed);

        let registry = self.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        if registry.shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        debug!(remote_addr = %remote_addr, "Inbound connection");
                        registry.accept(stream, remote_addr);
                    }
                    Err(e) => {
                        if registry.shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(accept_task);

        info!(local_addr = %local_addr, "Connection registry listening");
        Ok(local_addr)
    }

    /// Register an inbound connection and run its session.
    ///
    /// The first envelope is expected to be a handshake init.
    pub fn accept(self: &Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        self.spawn_session(stream, remote_addr, SessionDirection::Inbound);
    }

    /// Dial a peer and initiate the handshake.
    pub async fn connect(self: &Arc<Self>, host: &str, port: u16) -> Result<(), RegistryError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(RegistryError::ShutDown);
        }

        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                RegistryError::Transport(TransportError::ConnectFailed {
                    addr: addr.clone(),
                    reason: "timed out".into(),
                })
            })?
            .map_err(|e| {
                RegistryError::Transport(TransportError::ConnectFailed {
                    addr: addr.clone(),
                    reason: e.to_string(),
                })
            })?;
        let remote_addr = stream.peer_addr().map_err(|e| {
            RegistryError::Transport(TransportError::ConnectFailed {
                addr,
                reason: e.to_string(),
            })
        })?;

        let session = self.spawn_session(stream, remote_addr, SessionDirection::Outbound);

        let init = self.engine.create_initial(&session, self.service_port());
        session.set_state(SessionState::AwaitingResponse);
        session.send(&init).await?;

        debug!(
            session = %session.id(),
            remote_addr = %remote_addr,
            "Handshake initiated"
        );
        Ok(())
    }

    /// Create a session around a connected stream and spawn its I/O tasks.
    fn spawn_session(
        self: &Arc<Self>,
        stream: TcpStream,
        remote_addr: SocketAddr,
        direction: SessionDirection,
    ) -> Arc<Session> {
        let id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let (session, mut outbound_rx) = Session::new(id, direction, remote_addr);
        let session = Arc::new(session);

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, session.clone());

        let (mut read_half, mut write_half) = stream.into_split();

        // Reader: inbound envelopes are processed in arrival order.
        let registry = self.clone();
        let reader_session = session.clone();
        let reader = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = read_frame(&mut read_half) => match frame {
                        Ok(Some(envelope)) => {
                            registry.dispatch(envelope, &reader_session).await;
                        }
                        Ok(None) => break, // transport closed: normal terminal event
                        Err(e) => {
                            warn!(session = %reader_session.id(), error = %e, "Protocol violation on session");
                            break;
                        }
                    },
                    _ = reader_session.closed() => break,
                }
            }
            registry.finish_session(&reader_session);
        });

        // Writer: drains the outbound channel.
        let writer_session = session.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(bytes) => {
                            if let Err(e) = write_frame(&mut write_half, &bytes).await {
                                debug!(session = %writer_session.id(), error = %e, "Write failed");
                                writer_session.close();
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_session.closed() => break,
                }
            }
        });

        self.session_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, vec![reader, writer]);

        session
    }

    /// Dispatch one inbound envelope on its session.
    pub async fn dispatch(self: &Arc<Self>, envelope: MessageEnvelope, session: &Arc<Session>) {
        match &envelope.body {
            EnvelopeBody::HandshakeInit(body) => {
                self.on_handshake_init(envelope.sender_id, body, session).await;
            }
            EnvelopeBody::HandshakeResponse(body) => {
                self.on_handshake_response(envelope.sender_id, body, session).await;
            }
            EnvelopeBody::HandshakeConfirm(body) => {
                self.on_handshake_confirm(envelope.sender_id, body, session).await;
            }
            EnvelopeBody::Routing(_) | EnvelopeBody::Data(_) => {
                if !session.state().is_authenticated() {
                    warn!(
                        session = %session.id(),
                        kind = %envelope.kind(),
                        "Traffic from unauthenticated session"
                    );
                    self.close_session(session, Some(envelope.sender_id), "unauthenticated traffic");
                    return;
                }
                session.touch();
                let from = session
                    .peer()
                    .map(|p| p.peer_id)
                    .unwrap_or(envelope.sender_id);
                self.health.touch(&from);
                if self.inbound_tx.send(InboundEnvelope { from, envelope }).await.is_err() {
                    debug!("Inbound channel closed, dropping envelope");
                }
            }
            EnvelopeBody::Discovery(_) => {
                debug!(session = %session.id(), "Discovery envelope on TCP session, dropping");
            }
        }
    }

    async fn on_handshake_init(
        self: &Arc<Self>,
        sender_id: NodeId,
        body: &HandshakeBody,
        session: &Arc<Session>,
    ) {
        if session.state() != SessionState::Unauthenticated {
            self.close_session(session, Some(sender_id), "unexpected handshake init");
            return;
        }

        match self.engine.handle_init(sender_id, body, session, self.service_port()) {
            Ok(response) => {
                session.set_state(SessionState::AwaitingConfirm);
                if let Err(e) = session.send(&response).await {
                    debug!(session = %session.id(), error = %e, "Failed to send handshake response");
                    self.close_session(session, Some(sender_id), "transport error");
                }
            }
            Err(e) => {
                warn!(peer = %sender_id.short(), error = %e, "Handshake init rejected");
                self.close_session(session, Some(sender_id), "handshake failed");
            }
        }
    }

    async fn on_handshake_response(
        self: &Arc<Self>,
        sender_id: NodeId,
        body: &HandshakeBody,
        session: &Arc<Session>,
    ) {
        match session.state() {
            SessionState::AwaitingResponse => {}
            SessionState::Authenticated => {
                // Replay after completion: ignore rather than punish.
                debug!(session = %session.id(), "Handshake response on authenticated session");
                return;
            }
            _ => {
                self.close_session(session, Some(sender_id), "unexpected handshake response");
                return;
            }
        }

        match self.engine.handle_response(sender_id, body, session, self.service_port()) {
            Ok(Some(confirm)) => {
                if let Err(e) = session.send(&confirm).await {
                    debug!(session = %session.id(), error = %e, "Failed to send handshake confirm");
                    self.close_session(session, Some(sender_id), "transport error");
                    return;
                }
                self.promote(session, sender_id, body.service_port);
            }
            Ok(None) => {
                debug!(peer = %sender_id.short(), "Handshake response matched no pending challenge");
            }
            Err(e) => {
                warn!(peer = %sender_id.short(), error = %e, "Handshake response rejected");
                self.close_session(session, Some(sender_id), "handshake failed");
            }
        }
    }

    async fn on_handshake_confirm(
        self: &Arc<Self>,
        sender_id: NodeId,
        body: &HandshakeBody,
        session: &Arc<Session>,
    ) {
        match session.state() {
            SessionState::AwaitingConfirm => {}
            SessionState::Authenticated => {
                debug!(session = %session.id(), "Handshake confirm on authenticated session");
                return;
            }
            _ => {
                self.close_session(session, Some(sender_id), "unexpected handshake confirm");
                return;
            }
        }

        match self.engine.verify_confirm(sender_id, body, session) {
            Ok(true) => {
                self.promote(session, sender_id, body.service_port);
            }
            Ok(false) => {
                debug!(peer = %sender_id.short(), "Handshake confirm matched no pending challenge");
            }
            Err(e) => {
                warn!(peer = %sender_id.short(), error = %e, "Handshake confirm rejected");
                self.close_session(session, Some(sender_id), "handshake failed");
            }
        }
    }

    /// Promote a session to Authenticated, first-wins per peer id.
    fn promote(self: &Arc<Self>, session: &Arc<Session>, peer_id: NodeId, peer_service_port: u16) {
        if peer_id == self.local_id {
            debug!("Refusing session with our own id");
            self.close_session(session, None, "self connection");
            return;
        }

        let host = session.remote_addr().ip().to_string();
        let record = PeerRecord::new(peer_id, host, peer_service_port);
        session.set_peer(record.clone());

        if !session.set_state(SessionState::Authenticated) {
            return; // closed while handshaking
        }

        {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = peers.get(&peer_id).cloned() {
                if existing.state().is_authenticated() && !Arc::ptr_eq(&existing, session) {
                    // Cross-connection race: both sides must keep the same
                    // TCP connection, so the winner is decided by initiator
                    // id, not arrival order.
                    if self.wins_cross_connection(session, &existing, peer_id) {
                        peers.insert(peer_id, session.clone());
                        drop(peers);
                        debug!(peer = %peer_id.short(), "Replacing duplicate session");
                        existing.close();
                        return; // peer already reported connected
                    }
                    drop(peers);
                    debug!(peer = %peer_id.short(), "Duplicate session lost promotion race");
                    session.close();
                    return;
                }
            }
            peers.insert(peer_id, session.clone());
        }

        let latency_ms = match session.direction() {
            SessionDirection::Outbound => session.age().as_millis() as u64,
            SessionDirection::Inbound => 0,
        };
        let recovered = self.health.on_authenticated(record, latency_ms);

        self.events
            .record(EventKind::PeerConnected, peer_id, "handshake complete");
        if recovered {
            self.events
                .record(EventKind::RecoverySucceeded, peer_id, "peer reauthenticated");
        }

        info!(
            peer = %peer_id.short(),
            session = %session.id(),
            direction = ?session.direction(),
            "Peer authenticated"
        );
    }

    /// Decide which of two authenticated sessions to the same peer
    /// survives. The connection whose initiator has the smaller node id
    /// wins, so both endpoints independently keep the same connection.
    /// Same-direction duplicates keep the earlier session.
    fn wins_cross_connection(
        &self,
        challenger: &Arc<Session>,
        incumbent: &Arc<Session>,
        peer_id: NodeId,
    ) -> bool {
        let initiator = |session: &Arc<Session>| match session.direction() {
            SessionDirection::Outbound => self.local_id,
            SessionDirection::Inbound => peer_id,
        };
        initiator(challenger) < initiator(incumbent)
    }

    /// Send an envelope to an authenticated peer.
    pub async fn send_to(&self, peer_id: &NodeId, envelope: &MessageEnvelope) -> Result<(), RegistryError> {
        let session = {
            let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            peers
                .get(peer_id)
                .filter(|s| s.state().is_authenticated())
                .cloned()
        }
        .ok_or(RegistryError::NoRoute(*peer_id))?;

        if let Err(e) = session.send(envelope).await {
            self.health.record_error(peer_id);
            session.close();
            return Err(RegistryError::Transport(e));
        }
        Ok(())
    }

    /// Snapshot of authenticated peers.
    pub fn all_peers(&self) -> Vec<PeerRecord> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.state().is_authenticated())
            .filter_map(|s| s.peer())
            .collect()
    }

    /// Ids of authenticated peers.
    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, s)| s.state().is_authenticated())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether an authenticated session exists for the peer.
    pub fn is_authenticated(&self, peer_id: &NodeId) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .map(|s| s.state().is_authenticated())
            .unwrap_or(false)
    }

    /// Number of authenticated peers.
    pub fn peer_count(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| s.state().is_authenticated())
            .count()
    }

    /// Number of live sessions, including handshaking ones.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Close a session and record the disconnect.
    fn close_session(&self, session: &Arc<Session>, peer_hint: Option<NodeId>, reason: &str) {
        let peer_id = session.peer().map(|p| p.peer_id).or(peer_hint);
        if session.close() {
            if let Some(peer_id) = peer_id {
                self.events
                    .record(EventKind::PeerDisconnected, peer_id, reason.to_string());
            }
        }
    }

    /// Cleanup after a session's reader task exits.
    fn finish_session(&self, session: &Arc<Session>) {
        let was_authenticated = session.state().is_authenticated();
        let peer = session.peer();

        if session.close() && was_authenticated {
            if let Some(peer) = &peer {
                self.events
                    .record(EventKind::PeerDisconnected, peer.peer_id, "transport closed");
            }
        }

        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.id());

        if let Some(peer) = peer {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(current) = peers.get(&peer.peer_id) {
                if Arc::ptr_eq(current, session) {
                    peers.remove(&peer.peer_id);
                }
            }
        }

        self.session_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session.id());

        debug!(session = %session.id(), "Session finished");
    }

    /// Stop accepting, close every session, and wait for I/O tasks.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
            let _ = task.await;
        }

        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for session in &sessions {
            session.close();
        }

        let tasks: Vec<JoinHandle<()>> = self
            .session_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .flat_map(|(_, handles)| handles)
            .collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                debug!("Session task did not stop within grace period, aborting");
                abort.abort();
            }
        }

        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = None;

        info!("Connection registry stopped");
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("local_id", &self.local_id)
            .field("peers", &self.peer_count())
            .field("sessions", &self.session_count())
            .finish()
    }
}
