//! Routing envelope body: overlay forwarding wrapper.
//!
//! Wraps another envelope for multi-hop delivery. Wire format after the
//! envelope header:
//!
//! ```text
//! [target:16][strategy:1][route_count:2 LE][route:16 x n]
//! [payload_len:4 LE][payload: encoded MessageEnvelope]
//! ```
//!
//! The route always begins with the originating node; every forwarder
//! appends its own id exactly once. No id may appear twice (loop freedom).

use crate::identity::NodeId;
use crate::protocol::envelope::MessageEnvelope;
use crate::protocol::ProtocolError;
use std::fmt;

/// Fixed portion of the routing body (everything but route and payload).
pub const ROUTING_BODY_FIXED: usize = 16 + 1 + 2 + 4;

/// Forwarding policy applied to a routing envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Single next hop from the routing table.
    Direct,
    /// Forward to every authenticated peer not already visited.
    Flood,
    /// Up to three distinct next hops for redundancy.
    Multipath,
    /// Learn next hops from the observed route, then forward direct.
    DiscoverRoute,
}

impl RoutingStrategy {
    fn as_byte(self) -> u8 {
        match self {
            RoutingStrategy::Direct => 0x00,
            RoutingStrategy::Flood => 0x01,
            RoutingStrategy::Multipath => 0x02,
            RoutingStrategy::DiscoverRoute => 0x03,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(RoutingStrategy::Direct),
            0x01 => Ok(RoutingStrategy::Flood),
            0x02 => Ok(RoutingStrategy::Multipath),
            0x03 => Ok(RoutingStrategy::DiscoverRoute),
            other => Err(ProtocolError::UnknownStrategy(other)),
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoutingStrategy::Direct => "direct",
            RoutingStrategy::Flood => "flood",
            RoutingStrategy::Multipath => "multipath",
            RoutingStrategy::DiscoverRoute => "discover-route",
        };
        write!(f, "{}", s)
    }
}

/// Body of a routing message.
#[derive(Clone, Debug)]
pub struct RoutingBody {
    /// Final destination node.
    pub target: NodeId,
    /// Forwarding policy.
    pub strategy: RoutingStrategy,
    /// Path taken so far, originator first.
    pub route: Vec<NodeId>,
    /// The wrapped message.
    pub payload: MessageEnvelope,
}

impl RoutingBody {
    /// Create a first-hop routing body originating at `origin`.
    pub fn originate(
        origin: NodeId,
        target: NodeId,
        strategy: RoutingStrategy,
        payload: MessageEnvelope,
    ) -> Self {
        Self {
            target,
            strategy,
            route: vec![origin],
            payload,
        }
    }

    /// Number of hops taken, excluding the originator.
    pub fn hop_count(&self) -> usize {
        self.route.len().saturating_sub(1)
    }

    /// Whether this envelope already passed through `node`.
    pub fn has_visited(&self, node: &NodeId) -> bool {
        self.route.contains(node)
    }

    /// The most recent node on the route.
    pub fn last_hop(&self) -> Option<&NodeId> {
        self.route.last()
    }

    /// Encode into the given buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.target.as_bytes());
        buf.push(self.strategy.as_byte());
        buf.extend_from_slice(&(self.route.len() as u16).to_le_bytes());
        for node in &self.route {
            buf.extend_from_slice(node.as_bytes());
        }
        let payload_bytes = self.payload.encode();
        buf.extend_from_slice(&(payload_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload_bytes);
    }

    /// Decode from the body bytes following the envelope header.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < ROUTING_BODY_FIXED {
            return Err(ProtocolError::MessageTooShort {
                expected: ROUTING_BODY_FIXED,
                got: payload.len(),
            });
        }

        let mut pos = 0;

        let mut target_bytes = [0u8; 16];
        target_bytes.copy_from_slice(&payload[pos..pos + 16]);
        let target = NodeId::from_bytes(target_bytes);
        pos += 16;

        let strategy = RoutingStrategy::from_byte(payload[pos])?;
        pos += 1;

        let route_count = u16::from_le_bytes([payload[pos], payload[pos + 1]]) as usize;
        pos += 2;

        if payload.len() < pos + route_count * 16 {
            return Err(ProtocolError::Malformed("truncated route".into()));
        }
        let mut route = Vec::with_capacity(route_count);
        for _ in 0..route_count {
            let mut id = [0u8; 16];
            id.copy_from_slice(&payload[pos..pos + 16]);
            route.push(NodeId::from_bytes(id));
            pos += 16;
        }

        if payload.len() < pos + 4 {
            return Err(ProtocolError::MessageTooShort {
                expected: pos + 4,
                got: payload.len(),
            });
        }
        let payload_len = u32::from_le_bytes(
            payload[pos..pos + 4]
                .try_into()
                .map_err(|_| ProtocolError::Malformed("bad payload length".into()))?,
        ) as usize;
        pos += 4;

        if payload.len() < pos + payload_len {
            return Err(ProtocolError::Malformed("truncated inner payload".into()));
        }
        let inner = MessageEnvelope::decode(&payload[pos..pos + payload_len])?;

        Ok(Self {
            target,
            strategy,
            route,
            payload: inner,
        })
    }
}
