//! Protocol error types.

use thiserror::Error;

/// Errors raised while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too short: expected at least {expected} bytes, got {got}")]
    MessageTooShort { expected: usize, got: usize },

    #[error("unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown data state: 0x{0:02x}")]
    UnknownDataState(u8),

    #[error("unknown routing strategy: 0x{0:02x}")]
    UnknownStrategy(u8),

    #[error("unknown discovery kind: 0x{0:02x}")]
    UnknownDiscoveryKind(u8),

    #[error("frame too large: {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),
}
