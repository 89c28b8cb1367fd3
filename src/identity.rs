//! Node identity and peer addressing.
//!
//! A node's identity is its ML-DSA keypair; the [`NodeId`] is derived from
//! the public key by SHA-256, truncated to 16 bytes. Deriving ids from keys
//! binds a claimed identity to key possession: a handshake peer must present
//! the public key that hashes to the id it claims.

use crate::crypto::{CryptoError, SignatureService};
use sha2::{Digest, Sha256};
use std::fmt;

/// Opaque, stable node identifier: first 16 bytes of SHA-256 of the node's
/// signature public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Construct from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive from an encoded signature public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public_key);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Short hex prefix for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.short())
    }
}

/// A node's own identity: signature service plus the derived id.
pub struct Identity {
    service: SignatureService,
    node_id: NodeId,
}

impl Identity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        let service = SignatureService::generate();
        let node_id = NodeId::from_public_key(service.public_key());
        Self { service, node_id }
    }

    /// Derive an identity from a fixed seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let service = SignatureService::from_seed(seed)?;
        let node_id = NodeId::from_public_key(service.public_key());
        Ok(Self { service, node_id })
    }

    /// This node's id.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The encoded public key.
    pub fn public_key(&self) -> &[u8] {
        self.service.public_key()
    }

    /// Sign a message with the node's private key.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.service.sign(message)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .finish()
    }
}

/// A known peer's id and dialable address. Immutable after construction;
/// two records are equal iff all three fields match.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    /// The peer's node id.
    pub peer_id: NodeId,
    /// Host to dial.
    pub host: String,
    /// TCP service port to dial.
    pub port: u16,
}

impl PeerRecord {
    /// Construct a record.
    pub fn new(peer_id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id,
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.peer_id.short(), self.host, self.port)
    }
}
