//! Peer sessions: transport-backed channels plus handshake state.
//!
//! A session is created for every TCP connection, inbound or outbound. It
//! starts unauthenticated and is promoted to authenticated when the
//! three-message handshake completes. Frames are length-prefixed envelope
//! bytes:
//!
//! ```text
//! [len:4 LE][envelope]
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! Unauthenticated --send init--> AwaitingResponse --valid response--> Authenticated
//! Unauthenticated --recv init--> AwaitingConfirm  --valid confirm---> Authenticated
//! any --signature failure / protocol violation / transport error--> Closed
//! ```
//!
//! Closed is terminal; no transitions leave it.

use crate::identity::PeerRecord;
use crate::protocol::{MessageEnvelope, MessageId, ProtocolError, MAX_FRAME_SIZE};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

/// Errors related to session transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {reason}")]
    ConnectFailed { addr: String, reason: String },

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("session closed")]
    Closed,
}

/// Unique identifier for a session instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a new session ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session:{}", self.0)
    }
}

/// Which side opened the connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionDirection {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

/// Handshake lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No handshake messages exchanged yet.
    Unauthenticated,
    /// Initiator sent init, waiting for the response.
    AwaitingResponse,
    /// Acceptor replied to init, waiting for the confirm.
    AwaitingConfirm,
    /// Mutual authentication complete.
    Authenticated,
    /// Terminal. Transport released.
    Closed,
}

impl SessionState {
    /// Whether the session may carry routing and data traffic.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated)
    }

    /// Whether the session has reached its terminal state.
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::AwaitingResponse => "awaiting-response",
            SessionState::AwaitingConfirm => "awaiting-confirm",
            SessionState::Authenticated => "authenticated",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// A transport-backed channel to one peer plus its handshake state.
///
/// The connection registry owns all sessions; other subsystems refer to
/// peers by node id only. Outbound frames flow through a channel consumed
/// by the session's I/O task; the task exits when the channel closes, the
/// socket errors, or `shutdown` is signalled.
pub struct Session {
    id: SessionId,
    direction: SessionDirection,
    remote_addr: SocketAddr,
    state: Mutex<SessionState>,
    /// Peer identity, None until the handshake completes.
    peer: Mutex<Option<PeerRecord>>,
    /// Challenges we issued, keyed by the message id that carried them.
    /// Each entry is consumed at most once.
    pending_challenges: Mutex<HashMap<MessageId, [u8; 32]>>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    last_activity: Mutex<Instant>,
    created_at: Instant,
    /// Flips to true exactly once; observed by the session's I/O tasks.
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Create a session around an established connection. Returns the
    /// session and the receiver its I/O task drains for outbound frames.
    pub fn new(
        id: SessionId,
        direction: SessionDirection,
        remote_addr: SocketAddr,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (closed_tx, _) = watch::channel(false);
        let session = Self {
            id,
            direction,
            remote_addr,
            state: Mutex::new(SessionState::Unauthenticated),
            peer: Mutex::new(None),
            pending_challenges: Mutex::new(HashMap::new()),
            outbound_tx,
            last_activity: Mutex::new(Instant::now()),
            created_at: Instant::now(),
            closed_tx,
        };
        (session, outbound_rx)
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Connection direction.
    pub fn direction(&self) -> SessionDirection {
        self.direction
    }

    /// Remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attempt a state transition. Returns false if the session is already
    /// closed; Closed is terminal.
    pub fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_closed() {
            return false;
        }
        *state = next;
        true
    }

    /// The authenticated peer record, if the handshake completed.
    pub fn peer(&self) -> Option<PeerRecord> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record the authenticated peer identity.
    pub fn set_peer(&self, record: PeerRecord) {
        *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(record);
    }

    /// Store an issued challenge under the message id that carried it.
    pub fn store_challenge(&self, message_id: MessageId, challenge: [u8; 32]) {
        self.pending_challenges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_id, challenge);
    }

    /// Consume the pending entry whose challenge matches the echoed bytes.
    ///
    /// Returns None when no entry matches (replayed or stale reply).
    pub fn take_challenge_by_echo(&self, echo: &[u8]) -> Option<[u8; 32]> {
        let mut pending = self
            .pending_challenges
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let key = pending
            .iter()
            .find(|(_, challenge)| challenge.as_slice() == echo)
            .map(|(id, _)| *id)?;
        pending.remove(&key)
    }

    /// Number of unconsumed challenges (for tests and diagnostics).
    pub fn pending_challenge_count(&self) -> usize {
        self.pending_challenges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Note inbound activity.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Instant of the last inbound envelope.
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Age of the session since creation.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Queue an envelope for transmission.
    pub async fn send(&self, envelope: &MessageEnvelope) -> Result<(), TransportError> {
        if self.state().is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(envelope);
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Move to Closed and signal the I/O task to release the transport.
    /// Returns true on the first close, false if already closed.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_closed() {
            return false;
        }
        *state = SessionState::Closed;
        drop(state);
        self.pending_challenges
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let _ = self.closed_tx.send(true);
        true
    }

    /// Await the close signal (used by the session's I/O tasks).
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .field("peer", &self.peer())
            .finish()
    }
}

/// Encode an envelope as a length-prefixed frame.
pub fn encode_frame(envelope: &MessageEnvelope) -> Vec<u8> {
    let body = envelope.encode();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Read one length-prefixed envelope frame from the stream.
///
/// Returns Ok(None) on clean EOF before a frame starts (normal peer
/// departure). Oversized frames are a protocol violation.
pub async fn read_frame(
    reader: &mut OwnedReadHalf,
) -> Result<Option<MessageEnvelope>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(_) => return Ok(None),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    if reader.read_exact(&mut payload).await.is_err() {
        return Ok(None);
    }

    MessageEnvelope::decode(&payload).map(Some)
}

/// Write raw frame bytes to the stream.
pub async fn write_frame(writer: &mut OwnedWriteHalf, frame: &[u8]) -> Result<(), TransportError> {
    writer
        .write_all(frame)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;

    fn test_session() -> (Session, mpsc::Receiver<Vec<u8>>) {
        Session::new(
            SessionId::new(1),
            SessionDirection::Outbound,
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    #[test]
    fn test_initial_state() {
        let (session, _rx) = test_session();
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(session.peer().is_none());
    }

    #[test]
    fn test_closed_is_terminal() {
        let (session, _rx) = test_session();
        assert!(session.close());
        assert!(!session.set_state(SessionState::Authenticated));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.close());
    }

    #[test]
    fn test_challenge_consumed_once() {
        let (session, _rx) = test_session();
        let id = MessageId::generate();
        let challenge = [0x5a; 32];
        session.store_challenge(id, challenge);

        assert_eq!(session.take_challenge_by_echo(&challenge), Some(challenge));
        assert_eq!(session.take_challenge_by_echo(&challenge), None);
        assert_eq!(session.pending_challenge_count(), 0);
    }

    #[test]
    fn test_challenge_echo_mismatch() {
        let (session, _rx) = test_session();
        session.store_challenge(MessageId::generate(), [1; 32]);
        assert_eq!(session.take_challenge_by_echo(&[2; 32]), None);
        assert_eq!(session.pending_challenge_count(), 1);
    }

    #[test]
    fn test_close_clears_pending_challenges() {
        let (session, _rx) = test_session();
        session.store_challenge(MessageId::generate(), [1; 32]);
        session.close();
        assert_eq!(session.pending_challenge_count(), 0);
    }

    #[test]
    fn test_peer_record_set_on_promotion() {
        let (session, _rx) = test_session();
        let record = PeerRecord::new(NodeId::from_bytes([9; 16]), "127.0.0.1", 9001);
        session.set_peer(record.clone());
        assert_eq!(session.peer(), Some(record));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (session, _rx) = test_session();
        session.close();
        let envelope = MessageEnvelope::new(
            NodeId::from_bytes([1; 16]),
            crate::protocol::EnvelopeBody::Data(crate::protocol::DataBody::control(
                MessageId::generate(),
                1,
                0,
                crate::protocol::DataState::Complete,
            )),
        );
        assert!(matches!(
            session.send(&envelope).await,
            Err(TransportError::Closed)
        ));
    }
}
