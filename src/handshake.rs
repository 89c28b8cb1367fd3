//! Three-message mutual authentication over lattice signatures.
//!
//! ```text
//! initiator                                acceptor
//!    | -- Init { pk, sign(id), challenge A } -->  |
//!    | <- Response { pk, sign(id || A),           |
//!    |               challenge B, echo A } ------ |
//!    | -- Confirm { pk, sign(B), echo B } ------> |
//! ```
//!
//! Each side proves possession of the private key matching its public key,
//! and the claimed node id must be the one derived from that public key.
//! Issued challenges are stored on the session keyed by the message id that
//! carried them; the peer's reply correlates to its entry by the echoed
//! challenge bytes and consumes it. A reply that matches no stored entry is
//! treated as a replay and ignored without error.

use crate::crypto::SignatureService;
use crate::identity::{Identity, NodeId};
use crate::protocol::{EnvelopeBody, HandshakeBody, MessageEnvelope, CHALLENGE_LEN};
use crate::session::Session;
use std::sync::Arc;
use thiserror::Error;

/// Handshake failures. All variants are fatal for the session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("signature verification failed for {0}")]
    AuthenticationFailed(NodeId),

    #[error("claimed id {claimed} does not match key-derived id {derived}")]
    IdentityMismatch { claimed: NodeId, derived: NodeId },

    #[error("handshake message missing required challenge")]
    MissingChallenge,
}

/// Drives the challenge/response exchange for the connection registry.
///
/// The engine itself is stateless across sessions; per-connection challenge
/// state lives on the [`Session`].
pub struct HandshakeEngine {
    identity: Arc<Identity>,
}

impl HandshakeEngine {
    /// Create an engine signing with the given identity.
    pub fn new(identity: Arc<Identity>) -> Self {
        Self { identity }
    }

    fn fresh_challenge() -> [u8; CHALLENGE_LEN] {
        use rand::RngCore;
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        challenge
    }

    /// The claimed sender id must be derivable from the carried public key.
    fn check_identity_binding(
        sender_id: NodeId,
        body: &HandshakeBody,
    ) -> Result<(), HandshakeError> {
        let derived = NodeId::from_public_key(&body.public_key);
        if derived != sender_id {
            return Err(HandshakeError::IdentityMismatch {
                claimed: sender_id,
                derived,
            });
        }
        Ok(())
    }

    /// Step 1: produce the initiation message and remember its challenge.
    pub fn create_initial(&self, session: &Session, service_port: u16) -> MessageEnvelope {
        let local_id = self.identity.node_id();
        let challenge = Self::fresh_challenge();
        let signature = self.identity.sign(local_id.as_bytes());

        let body = HandshakeBody {
            public_key: self.identity.public_key().to_vec(),
            signature,
            service_port,
            challenge: Some(challenge),
            challenge_response: None,
        };
        let envelope = MessageEnvelope::new(local_id, EnvelopeBody::HandshakeInit(body));
        session.store_challenge(envelope.message_id, challenge);
        envelope
    }

    /// Step 2: verify an initiation and produce the response.
    pub fn handle_init(
        &self,
        sender_id: NodeId,
        body: &HandshakeBody,
        session: &Session,
        service_port: u16,
    ) -> Result<MessageEnvelope, HandshakeError> {
        Self::check_identity_binding(sender_id, body)?;

        if !SignatureService::verify(sender_id.as_bytes(), &body.signature, &body.public_key) {
            return Err(HandshakeError::AuthenticationFailed(sender_id));
        }

        let peer_challenge = body.challenge.ok_or(HandshakeError::MissingChallenge)?;

        let local_id = self.identity.node_id();
        let own_challenge = Self::fresh_challenge();

        // Sign our id concatenated with their challenge.
        let mut to_sign = Vec::with_capacity(16 + CHALLENGE_LEN);
        to_sign.extend_from_slice(local_id.as_bytes());
        to_sign.extend_from_slice(&peer_challenge);
        let signature = self.identity.sign(&to_sign);

        let response = HandshakeBody {
            public_key: self.identity.public_key().to_vec(),
            signature,
            service_port,
            challenge: Some(own_challenge),
            challenge_response: Some(peer_challenge.to_vec()),
        };
        let envelope = MessageEnvelope::new(local_id, EnvelopeBody::HandshakeResponse(response));
        session.store_challenge(envelope.message_id, own_challenge);
        Ok(envelope)
    }

    /// Step 3: verify a response against our stored challenge and produce
    /// the confirmation. Returns Ok(None) when the response matches no
    /// pending challenge (replay); the caller should ignore it.
    pub fn handle_response(
        &self,
        sender_id: NodeId,
        body: &HandshakeBody,
        session: &Session,
        service_port: u16,
    ) -> Result<Option<MessageEnvelope>, HandshakeError> {
        Self::check_identity_binding(sender_id, body)?;

        let echo = match &body.challenge_response {
            Some(echo) => echo,
            None => return Ok(None),
        };
        let stored = match session.take_challenge_by_echo(echo) {
            Some(stored) => stored,
            None => return Ok(None),
        };

        // Their signature covers their id concatenated with our challenge.
        let mut expected = Vec::with_capacity(16 + CHALLENGE_LEN);
        expected.extend_from_slice(sender_id.as_bytes());
        expected.extend_from_slice(&stored);

        if !SignatureService::verify(&expected, &body.signature, &body.public_key) {
            return Err(HandshakeError::AuthenticationFailed(sender_id));
        }

        let peer_challenge = body.challenge.ok_or(HandshakeError::MissingChallenge)?;
        let signature = self.identity.sign(&peer_challenge);

        let confirm = HandshakeBody {
            public_key: self.identity.public_key().to_vec(),
            signature,
            service_port,
            challenge: None,
            challenge_response: Some(peer_challenge.to_vec()),
        };
        Ok(Some(MessageEnvelope::new(
            self.identity.node_id(),
            EnvelopeBody::HandshakeConfirm(confirm),
        )))
    }

    /// Final step: verify a confirmation against our stored challenge.
    ///
    /// Ok(true) means the handshake completed and the entry was erased.
    /// Ok(false) means no matching pending challenge existed (replay).
    pub fn verify_confirm(
        &self,
        sender_id: NodeId,
        body: &HandshakeBody,
        session: &Session,
    ) -> Result<bool, HandshakeError> {
        Self::check_identity_binding(sender_id, body)?;

        let echo = match &body.challenge_response {
            Some(echo) => echo,
            None => return Ok(false),
        };
        let stored = match session.take_challenge_by_echo(echo) {
            Some(stored) => stored,
            None => return Ok(false),
        };

        if !SignatureService::verify(&stored, &body.signature, &body.public_key) {
            return Err(HandshakeError::AuthenticationFailed(sender_id));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionDirection, SessionId};

    fn make_session(id: u64) -> Session {
        let (session, _rx) = Session::new(
            SessionId::new(id),
            SessionDirection::Outbound,
            "127.0.0.1:9000".parse().unwrap(),
        );
        session
    }

    fn unwrap_handshake(envelope: &MessageEnvelope) -> &HandshakeBody {
        match &envelope.body {
            EnvelopeBody::HandshakeInit(b)
            | EnvelopeBody::HandshakeResponse(b)
            | EnvelopeBody::HandshakeConfirm(b) => b,
            other => panic!("not a handshake body: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_full_exchange() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let engine_a = HandshakeEngine::new(alice.clone());
        let engine_b = HandshakeEngine::new(bob.clone());

        let session_a = make_session(1); // Alice's view of the link
        let session_b = make_session(2); // Bob's view

        // Alice -> Bob: init
        let init = engine_a.create_initial(&session_a, 9001);
        assert_eq!(session_a.pending_challenge_count(), 1);

        // Bob verifies and responds
        let response = engine_b
            .handle_init(init.sender_id, unwrap_handshake(&init), &session_b, 9002)
            .unwrap();
        assert_eq!(session_b.pending_challenge_count(), 1);

        // Alice verifies the response and confirms
        let confirm = engine_a
            .handle_response(
                response.sender_id,
                unwrap_handshake(&response),
                &session_a,
                9001,
            )
            .unwrap()
            .expect("response should match pending challenge");
        assert_eq!(session_a.pending_challenge_count(), 0);

        // Bob verifies the confirmation
        let ok = engine_b
            .verify_confirm(confirm.sender_id, unwrap_handshake(&confirm), &session_b)
            .unwrap();
        assert!(ok);
        assert_eq!(session_b.pending_challenge_count(), 0);
    }

    #[test]
    fn test_init_with_wrong_signature_rejected() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let engine_a = HandshakeEngine::new(alice);
        let engine_b = HandshakeEngine::new(bob);

        let session_a = make_session(1);
        let session_b = make_session(2);

        let init = engine_a.create_initial(&session_a, 9001);
        let mut body = unwrap_handshake(&init).clone();
        body.signature[0] ^= 0xff;

        assert!(matches!(
            engine_b.handle_init(init.sender_id, &body, &session_b, 9002),
            Err(HandshakeError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_claimed_id_must_match_key() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let engine_a = HandshakeEngine::new(alice);
        let engine_b = HandshakeEngine::new(bob);

        let session_a = make_session(1);
        let session_b = make_session(2);

        let init = engine_a.create_initial(&session_a, 9001);
        let forged_sender = NodeId::from_bytes([0xee; 16]);

        assert!(matches!(
            engine_b.handle_init(forged_sender, unwrap_handshake(&init), &session_b, 9002),
            Err(HandshakeError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_replayed_confirm_returns_false() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let engine_a = HandshakeEngine::new(alice);
        let engine_b = HandshakeEngine::new(bob);

        let session_a = make_session(1);
        let session_b = make_session(2);

        let init = engine_a.create_initial(&session_a, 9001);
        let response = engine_b
            .handle_init(init.sender_id, unwrap_handshake(&init), &session_b, 9002)
            .unwrap();
        let confirm = engine_a
            .handle_response(
                response.sender_id,
                unwrap_handshake(&response),
                &session_a,
                9001,
            )
            .unwrap()
            .unwrap();

        let first = engine_b
            .verify_confirm(confirm.sender_id, unwrap_handshake(&confirm), &session_b)
            .unwrap();
        assert!(first);

        // Entry consumed: replaying the identical confirm must not verify.
        let replay = engine_b
            .verify_confirm(confirm.sender_id, unwrap_handshake(&confirm), &session_b)
            .unwrap();
        assert!(!replay);
    }

    #[test]
    fn test_response_without_pending_challenge_ignored() {
        let alice = Arc::new(Identity::generate());
        let bob = Arc::new(Identity::generate());
        let engine_a = HandshakeEngine::new(alice);
        let engine_b = HandshakeEngine::new(bob);

        let session_a = make_session(1);
        let session_b = make_session(2);

        let init = engine_a.create_initial(&session_a, 9001);
        let response = engine_b
            .handle_init(init.sender_id, unwrap_handshake(&init), &session_b, 9002)
            .unwrap();

        // A session that never sent an init has nothing pending.
        let fresh = make_session(3);
        let result = engine_a
            .handle_response(response.sender_id, unwrap_handshake(&response), &fresh, 9001)
            .unwrap();
        assert!(result.is_none());
    }
}
