//! Message envelope: common header plus kind-specific body.
//!
//! Every protocol message shares a fixed header followed by a body whose
//! layout depends on the kind byte:
//!
//! ```text
//! [kind:1][message_id:16 LE][sender_id:16][timestamp_ms:8 LE][body...]
//! ```
//!
//! | Kind | Type               | Body              |
//! |------|--------------------|-------------------|
//! | 0x01 | HandshakeInit      | `HandshakeBody`   |
//! | 0x02 | HandshakeResponse  | `HandshakeBody`   |
//! | 0x03 | HandshakeConfirm   | `HandshakeBody`   |
//! | 0x10 | Data               | `DataBody`        |
//! | 0x20 | Routing            | `RoutingBody`     |
//! | 0x30 | Discovery          | `DiscoveryBody`   |
//!
//! The message id is assigned at construction and never rewritten when a
//! message is forwarded through the overlay.

use crate::identity::NodeId;
use crate::protocol::data::DataBody;
use crate::protocol::discovery::DiscoveryBody;
use crate::protocol::handshake::HandshakeBody;
use crate::protocol::routing::RoutingBody;
use crate::protocol::ProtocolError;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the common envelope header in bytes.
pub const HEADER_SIZE: usize = 1 + 16 + 16 + 8;

/// Kind byte values.
pub const KIND_HANDSHAKE_INIT: u8 = 0x01;
pub const KIND_HANDSHAKE_RESPONSE: u8 = 0x02;
pub const KIND_HANDSHAKE_CONFIRM: u8 = 0x03;
pub const KIND_DATA: u8 = 0x10;
pub const KIND_ROUTING: u8 = 0x20;
pub const KIND_DISCOVERY: u8 = 0x30;

/// Globally unique message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u128);

impl MessageId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(u128::from_le_bytes(bytes))
    }

    /// Construct from raw little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    /// Raw little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg:{:.8}", format!("{:032x}", self.0))
    }
}

/// Message kind discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    HandshakeInit,
    HandshakeResponse,
    HandshakeConfirm,
    Data,
    Routing,
    Discovery,
}

impl MessageKind {
    /// The wire byte for this kind.
    pub fn as_byte(&self) -> u8 {
        match self {
            MessageKind::HandshakeInit => KIND_HANDSHAKE_INIT,
            MessageKind::HandshakeResponse => KIND_HANDSHAKE_RESPONSE,
            MessageKind::HandshakeConfirm => KIND_HANDSHAKE_CONFIRM,
            MessageKind::Data => KIND_DATA,
            MessageKind::Routing => KIND_ROUTING,
            MessageKind::Discovery => KIND_DISCOVERY,
        }
    }

    /// Whether this kind belongs to the handshake exchange.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageKind::HandshakeInit
                | MessageKind::HandshakeResponse
                | MessageKind::HandshakeConfirm
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::HandshakeInit => "handshake-init",
            MessageKind::HandshakeResponse => "handshake-response",
            MessageKind::HandshakeConfirm => "handshake-confirm",
            MessageKind::Data => "data",
            MessageKind::Routing => "routing",
            MessageKind::Discovery => "discovery",
        };
        write!(f, "{}", s)
    }
}

/// Kind-specific message body.
#[derive(Clone, Debug)]
pub enum EnvelopeBody {
    HandshakeInit(HandshakeBody),
    HandshakeResponse(HandshakeBody),
    HandshakeConfirm(HandshakeBody),
    Data(DataBody),
    Routing(Box<RoutingBody>),
    Discovery(DiscoveryBody),
}

impl EnvelopeBody {
    /// The message kind of this body.
    pub fn kind(&self) -> MessageKind {
        match self {
            EnvelopeBody::HandshakeInit(_) => MessageKind::HandshakeInit,
            EnvelopeBody::HandshakeResponse(_) => MessageKind::HandshakeResponse,
            EnvelopeBody::HandshakeConfirm(_) => MessageKind::HandshakeConfirm,
            EnvelopeBody::Data(_) => MessageKind::Data,
            EnvelopeBody::Routing(_) => MessageKind::Routing,
            EnvelopeBody::Discovery(_) => MessageKind::Discovery,
        }
    }
}

/// A framed protocol message: common header plus kind-specific body.
#[derive(Clone, Debug)]
pub struct MessageEnvelope {
    /// Globally unique id, assigned once at construction.
    pub message_id: MessageId,
    /// Originating node.
    pub sender_id: NodeId,
    /// Creation time, Unix milliseconds.
    pub timestamp_ms: u64,
    /// Kind-specific payload.
    pub body: EnvelopeBody,
}

impl MessageEnvelope {
    /// Create a new envelope with a fresh message id and current timestamp.
    pub fn new(sender_id: NodeId, body: EnvelopeBody) -> Self {
        Self {
            message_id: MessageId::generate(),
            sender_id,
            timestamp_ms: unix_millis(),
            body,
        }
    }

    /// The message kind.
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 64);
        buf.push(self.kind().as_byte());
        buf.extend_from_slice(&self.message_id.to_le_bytes());
        buf.extend_from_slice(self.sender_id.as_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        match &self.body {
            EnvelopeBody::HandshakeInit(b)
            | EnvelopeBody::HandshakeResponse(b)
            | EnvelopeBody::HandshakeConfirm(b) => b.encode_into(&mut buf),
            EnvelopeBody::Data(b) => b.encode_into(&mut buf),
            EnvelopeBody::Routing(b) => b.encode_into(&mut buf),
            EnvelopeBody::Discovery(b) => b.encode_into(&mut buf),
        }
        buf
    }

    /// Decode from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let kind = data[0];
        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&data[1..17]);
        let message_id = MessageId::from_le_bytes(id_bytes);

        let mut sender_bytes = [0u8; 16];
        sender_bytes.copy_from_slice(&data[17..33]);
        let sender_id = NodeId::from_bytes(sender_bytes);

        let timestamp_ms = u64::from_le_bytes(
            data[33..41]
                .try_into()
                .map_err(|_| ProtocolError::Malformed("bad timestamp".into()))?,
        );

        let payload = &data[HEADER_SIZE..];
        let body = match kind {
            KIND_HANDSHAKE_INIT => EnvelopeBody::HandshakeInit(HandshakeBody::decode(payload)?),
            KIND_HANDSHAKE_RESPONSE => {
                EnvelopeBody::HandshakeResponse(HandshakeBody::decode(payload)?)
            }
            KIND_HANDSHAKE_CONFIRM => {
                EnvelopeBody::HandshakeConfirm(HandshakeBody::decode(payload)?)
            }
            KIND_DATA => EnvelopeBody::Data(DataBody::decode(payload)?),
            KIND_ROUTING => EnvelopeBody::Routing(Box::new(RoutingBody::decode(payload)?)),
            KIND_DISCOVERY => EnvelopeBody::Discovery(DiscoveryBody::decode(payload)?),
            other => return Err(ProtocolError::UnknownKind(other)),
        };

        Ok(Self {
            message_id,
            sender_id,
            timestamp_ms,
            body,
        })
    }
}

/// Current Unix time in milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::data::{DataBody, DataState};

    fn node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 16])
    }

    #[test]
    fn test_message_id_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_header_roundtrip() {
        let body = EnvelopeBody::Data(DataBody {
            group_id: MessageId::generate(),
            total_chunks: 3,
            chunk_index: 1,
            state: DataState::Chunk,
            checksum: [0xab; 32],
            data: vec![1, 2, 3],
        });
        let env = MessageEnvelope::new(node_id(7), body);

        let bytes = env.encode();
        let decoded = MessageEnvelope::decode(&bytes).unwrap();

        assert_eq!(decoded.message_id, env.message_id);
        assert_eq!(decoded.sender_id, env.sender_id);
        assert_eq!(decoded.timestamp_ms, env.timestamp_ms);
        assert_eq!(decoded.kind(), MessageKind::Data);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(
            MessageEnvelope::decode(&[0u8; HEADER_SIZE - 1]),
            Err(ProtocolError::MessageTooShort { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut bytes = vec![0xffu8];
        bytes.extend_from_slice(&[0u8; HEADER_SIZE - 1]);
        assert!(matches!(
            MessageEnvelope::decode(&bytes),
            Err(ProtocolError::UnknownKind(0xff))
        ));
    }

    #[test]
    fn test_kind_bytes_distinct() {
        let kinds = [
            MessageKind::HandshakeInit,
            MessageKind::HandshakeResponse,
            MessageKind::HandshakeConfirm,
            MessageKind::Data,
            MessageKind::Routing,
            MessageKind::Discovery,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.as_byte(), b.as_byte());
            }
        }
    }

    #[test]
    fn test_handshake_kind_predicate() {
        assert!(MessageKind::HandshakeInit.is_handshake());
        assert!(MessageKind::HandshakeConfirm.is_handshake());
        assert!(!MessageKind::Data.is_handshake());
        assert!(!MessageKind::Routing.is_handshake());
    }
}
