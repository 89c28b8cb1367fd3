//! QMesh: quantum-authenticated mesh networking node.
//!
//! A peer-to-peer overlay in which sessions are mutually authenticated
//! with lattice-based signatures (ML-DSA-65), payloads are fragmented and
//! delivered reliably with acknowledged chunks, and forwarding runs over
//! pluggable routing strategies with loop suppression and path learning.
//! Peers find each other by UDP broadcast; a liveness supervisor watches
//! peer health and reconnects with bounded exponential backoff.

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod discovery;
pub mod handshake;
pub mod identity;
pub mod monitor;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod session;

// Re-export identity types
pub use identity::{Identity, NodeId, PeerRecord};

// Re-export config types
pub use config::{Config, ConfigError, DiscoveryConfig, HealthConfig, NodeConfig};

// Re-export crypto types
pub use crypto::{CryptoError, SignatureService, PUBLIC_KEY_LEN, SEED_LEN, SIGNATURE_LEN};

// Re-export protocol types
pub use protocol::{
    DataBody, DataState, DiscoveryBody, DiscoveryKind, EnvelopeBody, HandshakeBody,
    MessageEnvelope, MessageId, MessageKind, ProtocolError, RoutingBody, RoutingStrategy,
};

// Re-export session types
pub use session::{Session, SessionDirection, SessionId, SessionState, TransportError};

// Re-export handshake types
pub use handshake::{HandshakeEngine, HandshakeError};

// Re-export registry types
pub use registry::{ConnectionRegistry, InboundEnvelope, RegistryError};

// Re-export routing types
pub use routing::{RoutingEngine, RoutingError, MAX_HOPS, MAX_PATHS};

// Re-export delivery types
pub use delivery::{
    DeliveryError, OutgoingTracker, ReassemblyBuffer, ReliableDelivery, MAX_CHUNK_SIZE,
};

// Re-export discovery types
pub use discovery::{DiscoveryError, DiscoveryService};

// Re-export monitoring types
pub use monitor::{
    EventKind, EventLog, HealthTable, LivenessMonitor, NetworkEvent, NetworkStats, PeerHealth,
};

// Re-export node types
pub use node::{Node, NodeError, NodeState};
