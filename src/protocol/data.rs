//! Data message body: chunks, acknowledgements, retransmit requests.
//!
//! Wire format after the envelope header:
//!
//! ```text
//! [group_id:16 LE][total_chunks:4 LE][chunk_index:4 LE][state:1]
//! [checksum:32][data_len:4 LE][data]
//! ```
//!
//! The checksum is SHA-256 over the chunk bytes; control states (ack,
//! retransmit request, complete) carry a zero checksum and no data.

use crate::protocol::envelope::MessageId;
use crate::protocol::ProtocolError;
use std::fmt;

/// Fixed portion of the data body (everything but the chunk bytes).
pub const DATA_BODY_FIXED: usize = 16 + 4 + 4 + 1 + 32 + 4;

/// State of a data message within its payload group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataState {
    /// A slice of the payload.
    Chunk,
    /// Receipt confirmation for one chunk index.
    Acknowledgment,
    /// Request to replay one chunk index.
    RetransmitRequest,
    /// The whole group was assembled by the receiver.
    Complete,
}

impl DataState {
    fn as_byte(self) -> u8 {
        match self {
            DataState::Chunk => 0x00,
            DataState::Acknowledgment => 0x01,
            DataState::RetransmitRequest => 0x02,
            DataState::Complete => 0x03,
        }
    }

    fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(DataState::Chunk),
            0x01 => Ok(DataState::Acknowledgment),
            0x02 => Ok(DataState::RetransmitRequest),
            0x03 => Ok(DataState::Complete),
            other => Err(ProtocolError::UnknownDataState(other)),
        }
    }
}

impl fmt::Display for DataState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataState::Chunk => "chunk",
            DataState::Acknowledgment => "ack",
            DataState::RetransmitRequest => "retransmit-request",
            DataState::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// Body of a data message.
#[derive(Clone, Debug)]
pub struct DataBody {
    /// Groups the chunks of one application payload.
    pub group_id: MessageId,
    /// Number of chunks in the complete payload.
    pub total_chunks: u32,
    /// Index of this chunk within the group.
    pub chunk_index: u32,
    /// Role of this message within the group exchange.
    pub state: DataState,
    /// SHA-256 over `data` (zero for control states).
    pub checksum: [u8; 32],
    /// Chunk bytes (empty for control states).
    pub data: Vec<u8>,
}

impl DataBody {
    /// Build a control-state body (ack, retransmit request, complete).
    pub fn control(group_id: MessageId, total_chunks: u32, chunk_index: u32, state: DataState) -> Self {
        Self {
            group_id,
            total_chunks,
            chunk_index,
            state,
            checksum: [0u8; 32],
            data: Vec::new(),
        }
    }

    /// Encode into the given buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.group_id.to_le_bytes());
        buf.extend_from_slice(&self.total_chunks.to_le_bytes());
        buf.extend_from_slice(&self.chunk_index.to_le_bytes());
        buf.push(self.state.as_byte());
        buf.extend_from_slice(&self.checksum);
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);
    }

    /// Decode from the body bytes following the envelope header.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < DATA_BODY_FIXED {
            return Err(ProtocolError::MessageTooShort {
                expected: DATA_BODY_FIXED,
                got: payload.len(),
            });
        }

        let mut pos = 0;

        let mut group_bytes = [0u8; 16];
        group_bytes.copy_from_slice(&payload[pos..pos + 16]);
        let group_id = MessageId::from_le_bytes(group_bytes);
        pos += 16;

        let total_chunks = u32::from_le_bytes(
            payload[pos..pos + 4]
                .try_into()
                .map_err(|_| ProtocolError::Malformed("bad total_chunks".into()))?,
        );
        pos += 4;

        let chunk_index = u32::from_le_bytes(
            payload[pos..pos + 4]
                .try_into()
                .map_err(|_| ProtocolError::Malformed("bad chunk_index".into()))?,
        );
        pos += 4;

        let state = DataState::from_byte(payload[pos])?;
        pos += 1;

        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(&payload[pos..pos + 32]);
        pos += 32;

        let data_len = u32::from_le_bytes(
            payload[pos..pos + 4]
                .try_into()
                .map_err(|_| ProtocolError::Malformed("bad data length".into()))?,
        ) as usize;
        pos += 4;

        if payload.len() < pos + data_len {
            return Err(ProtocolError::Malformed("truncated chunk data".into()));
        }
        let data = payload[pos..pos + data_len].to_vec();

        Ok(Self {
            group_id,
            total_chunks,
            chunk_index,
            state,
            checksum,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_roundtrip() {
        let body = DataBody {
            group_id: MessageId::generate(),
            total_chunks: 5,
            chunk_index: 2,
            state: DataState::Chunk,
            checksum: [0x5a; 32],
            data: vec![9; 1024],
        };
        let mut buf = Vec::new();
        body.encode_into(&mut buf);

        let decoded = DataBody::decode(&buf).unwrap();
        assert_eq!(decoded.group_id, body.group_id);
        assert_eq!(decoded.total_chunks, 5);
        assert_eq!(decoded.chunk_index, 2);
        assert_eq!(decoded.state, DataState::Chunk);
        assert_eq!(decoded.checksum, body.checksum);
        assert_eq!(decoded.data, body.data);
    }

    #[test]
    fn test_control_roundtrip() {
        let body = DataBody::control(MessageId::generate(), 3, 1, DataState::Acknowledgment);
        let mut buf = Vec::new();
        body.encode_into(&mut buf);

        let decoded = DataBody::decode(&buf).unwrap();
        assert_eq!(decoded.state, DataState::Acknowledgment);
        assert_eq!(decoded.checksum, [0u8; 32]);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn test_all_states_roundtrip() {
        for state in [
            DataState::Chunk,
            DataState::Acknowledgment,
            DataState::RetransmitRequest,
            DataState::Complete,
        ] {
            let byte = state.as_byte();
            assert_eq!(DataState::from_byte(byte).unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_state() {
        assert!(matches!(
            DataState::from_byte(0x09),
            Err(ProtocolError::UnknownDataState(0x09))
        ));
    }

    #[test]
    fn test_truncated_data() {
        let body = DataBody {
            group_id: MessageId::generate(),
            total_chunks: 1,
            chunk_index: 0,
            state: DataState::Chunk,
            checksum: [0; 32],
            data: vec![1; 64],
        };
        let mut buf = Vec::new();
        body.encode_into(&mut buf);
        buf.truncate(buf.len() - 10);
        assert!(DataBody::decode(&buf).is_err());
    }
}
