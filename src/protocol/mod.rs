//! Protocol messages and wire formats.
//!
//! Every message travelling between nodes is a [`MessageEnvelope`]: a fixed
//! common header (kind, message id, sender id, timestamp) followed by a
//! kind-specific body. Envelopes are self-describing byte frames; TCP
//! sessions carry them behind a 4-byte little-endian length prefix, UDP
//! discovery carries them bare in datagrams of at most 8 KiB.
//!
//! Handshake bodies authenticate sessions, data bodies carry chunked
//! payloads, routing bodies wrap other envelopes for multi-hop forwarding,
//! and discovery bodies drive the UDP peer exchange.

mod data;
mod discovery;
mod envelope;
mod error;
mod handshake;
mod routing;

pub use data::{DataBody, DataState, DATA_BODY_FIXED};
pub use discovery::{DiscoveryBody, DiscoveryKind};
pub use envelope::{
    unix_millis, EnvelopeBody, MessageEnvelope, MessageId, MessageKind, HEADER_SIZE,
    KIND_DATA, KIND_DISCOVERY, KIND_HANDSHAKE_CONFIRM, KIND_HANDSHAKE_INIT,
    KIND_HANDSHAKE_RESPONSE, KIND_ROUTING,
};
pub use error::ProtocolError;
pub use handshake::{HandshakeBody, CHALLENGE_LEN};
pub use routing::{RoutingBody, RoutingStrategy, ROUTING_BODY_FIXED};

/// Largest TCP frame a session will accept (header + body).
///
/// Bounds a 1 MiB data chunk plus routing and envelope overhead with
/// generous headroom.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Largest UDP discovery datagram.
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;
