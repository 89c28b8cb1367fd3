//! Discovery message body: UDP broadcast peer exchange.
//!
//! Wire format after the envelope header:
//!
//! ```text
//! [subkind:1][service_port:2 LE][host_len:2 LE][host utf8]
//! [peer_count:2 LE]([peer_id:16][host_len:2 LE][host][port:2 LE]) x n
//! ```
//!
//! The peer list is only populated for PeerListResponse; the other
//! sub-kinds carry `peer_count = 0`.

use crate::identity::{NodeId, PeerRecord};
use crate::protocol::ProtocolError;
use std::fmt;

/// Discovery exchange sub-kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// Broadcast probe for nearby nodes.
    Request,
    /// Unicast answer to a probe.
    Response,
    /// Ask a node for its known-peer snapshot.
    PeerListRequest,
    /// Known-peer snapshot.
    PeerListResponse,
}

impl DiscoveryKind {
    fn as_byte(self) -> u8 {
        match self {
            DiscoveryKind::Request => 0x00,
            DiscoveryKind::Response => 0x01,
            DiscoveryKind::PeerListRequest => 0x02,
            DiscoveryKind::PeerListResponse => 0x03,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(DiscoveryKind::Request),
            0x01 => Ok(DiscoveryKind::Response),
            0x02 => Ok(DiscoveryKind::PeerListRequest),
            0x03 => Ok(DiscoveryKind::PeerListResponse),
            other => Err(ProtocolError::UnknownDiscoveryKind(other)),
        }
    }
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscoveryKind::Request => "request",
            DiscoveryKind::Response => "response",
            DiscoveryKind::PeerListRequest => "peer-list-request",
            DiscoveryKind::PeerListResponse => "peer-list-response",
        };
        write!(f, "{}", s)
    }
}

/// Body of a discovery message.
#[derive(Clone, Debug)]
pub struct DiscoveryBody {
    /// Exchange sub-kind.
    pub kind: DiscoveryKind,
    /// Sender's advertised host.
    pub host: String,
    /// Sender's TCP service port.
    pub service_port: u16,
    /// Known peers (PeerListResponse only).
    pub peers: Vec<PeerRecord>,
}

impl DiscoveryBody {
    /// Build a body without a peer list.
    pub fn new(kind: DiscoveryKind, host: impl Into<String>, service_port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            service_port,
            peers: Vec::new(),
        }
    }

    /// Build a PeerListResponse carrying the given snapshot.
    pub fn peer_list(host: impl Into<String>, service_port: u16, peers: Vec<PeerRecord>) -> Self {
        Self {
            kind: DiscoveryKind::PeerListResponse,
            host: host.into(),
            service_port,
            peers,
        }
    }

    /// Encode into the given buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind.as_byte());
        buf.extend_from_slice(&self.service_port.to_le_bytes());
        let host = self.host.as_bytes();
        buf.extend_from_slice(&(host.len() as u16).to_le_bytes());
        buf.extend_from_slice(host);
        buf.extend_from_slice(&(self.peers.len() as u16).to_le_bytes());
        for peer in &self.peers {
            buf.extend_from_slice(peer.peer_id.as_bytes());
            let peer_host = peer.host.as_bytes();
            buf.extend_from_slice(&(peer_host.len() as u16).to_le_bytes());
            buf.extend_from_slice(peer_host);
            buf.extend_from_slice(&peer.port.to_le_bytes());
        }
    }

    /// Decode from the body bytes following the envelope header.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 7 {
            return Err(ProtocolError::MessageTooShort {
                expected: 7,
                got: payload.len(),
            });
        }

        let mut pos = 0;
        let kind = DiscoveryKind::from_byte(payload[pos])?;
        pos += 1;

        let service_port = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
        pos += 2;

        let host = read_string(payload, &mut pos)?;

        if payload.len() < pos + 2 {
            return Err(ProtocolError::MessageTooShort {
                expected: pos + 2,
                got: payload.len(),
            });
        }
        let peer_count = u16::from_le_bytes([payload[pos], payload[pos + 1]]) as usize;
        pos += 2;

        let mut peers = Vec::with_capacity(peer_count);
        for _ in 0..peer_count {
            if payload.len() < pos + 16 {
                return Err(ProtocolError::Malformed("truncated peer entry".into()));
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&payload[pos..pos + 16]);
            pos += 16;

            let peer_host = read_string(payload, &mut pos)?;

            if payload.len() < pos + 2 {
                return Err(ProtocolError::Malformed("truncated peer port".into()));
            }
            let port = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
            pos += 2;

            peers.push(PeerRecord::new(NodeId::from_bytes(id), peer_host, port));
        }

        Ok(Self {
            kind,
            host,
            service_port,
            peers,
        })
    }
}

/// Read a u16-length-prefixed UTF-8 string.
fn read_string(payload: &[u8], pos: &mut usize) -> Result<String, ProtocolError> {
    if payload.len() < *pos + 2 {
        return Err(ProtocolError::MessageTooShort {
            expected: *pos + 2,
            got: payload.len(),
        });
    }
    let len = u16::from_le_bytes([payload[*pos], payload[*pos + 1]]) as usize;
    *pos += 2;
    if payload.len() < *pos + len {
        return Err(ProtocolError::Malformed("truncated string".into()));
    }
    let s = std::str::from_utf8(&payload[*pos..*pos + len])
        .map_err(|_| ProtocolError::Malformed("invalid utf8 host".into()))?
        .to_string();
    *pos += len;
    Ok(s)
}
