//! Handshake message body.
//!
//! Carried by the three handshake kinds (init, response, confirm). Wire
//! format after the envelope header:
//!
//! ```text
//! [pubkey_len:2 LE][pubkey][sig_len:2 LE][signature][service_port:2 LE]
//! [challenge_flag:1][challenge:32, if flag=1][response_len:2 LE][response]
//! ```
//!
//! The public key and signature fields are opaque blobs, bit-exact with the
//! signature primitive. `service_port` advertises the sender's TCP listen
//! port so the receiving side can record a dialable address for recovery.

use crate::protocol::ProtocolError;

/// Length of a handshake challenge in bytes.
pub const CHALLENGE_LEN: usize = 32;

/// Body of a handshake message.
#[derive(Clone, Debug)]
pub struct HandshakeBody {
    /// Sender's signature public key.
    pub public_key: Vec<u8>,
    /// Signature over the kind-specific payload.
    pub signature: Vec<u8>,
    /// Sender's TCP service port (for reconnection).
    pub service_port: u16,
    /// Fresh challenge for the peer to sign, if this step carries one.
    pub challenge: Option<[u8; CHALLENGE_LEN]>,
    /// Echo of the peer's previous challenge, if this step answers one.
    pub challenge_response: Option<Vec<u8>>,
}

impl HandshakeBody {
    /// Encode into the given buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.public_key.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&(self.signature.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&self.service_port.to_le_bytes());
        match &self.challenge {
            Some(challenge) => {
                buf.push(1);
                buf.extend_from_slice(challenge);
            }
            None => buf.push(0),
        }
        match &self.challenge_response {
            Some(resp) => {
                buf.extend_from_slice(&(resp.len() as u16).to_le_bytes());
                buf.extend_from_slice(resp);
            }
            None => buf.extend_from_slice(&0u16.to_le_bytes()),
        }
    }

    /// Decode from the body bytes following the envelope header.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;

        let public_key = read_block_u16(payload, &mut pos, "public key")?;
        let signature = read_block_u16(payload, &mut pos, "signature")?;

        if payload.len() < pos + 3 {
            return Err(ProtocolError::MessageTooShort {
                expected: pos + 3,
                got: payload.len(),
            });
        }
        let service_port = u16::from_le_bytes([payload[pos], payload[pos + 1]]);
        pos += 2;

        let flag = payload[pos];
        pos += 1;
        let challenge = match flag {
            0 => None,
            1 => {
                if payload.len() < pos + CHALLENGE_LEN {
                    return Err(ProtocolError::MessageTooShort {
                        expected: pos + CHALLENGE_LEN,
                        got: payload.len(),
                    });
                }
                let mut bytes = [0u8; CHALLENGE_LEN];
                bytes.copy_from_slice(&payload[pos..pos + CHALLENGE_LEN]);
                pos += CHALLENGE_LEN;
                Some(bytes)
            }
            other => {
                return Err(ProtocolError::Malformed(format!(
                    "bad challenge flag: {}",
                    other
                )))
            }
        };

        let resp = read_block_u16(payload, &mut pos, "challenge response")?;
        let challenge_response = if resp.is_empty() { None } else { Some(resp) };

        Ok(Self {
            public_key,
            signature,
            service_port,
            challenge,
            challenge_response,
        })
    }
}

/// Read a u16-length-prefixed block.
fn read_block_u16(
    payload: &[u8],
    pos: &mut usize,
    what: &str,
) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() < *pos + 2 {
        return Err(ProtocolError::MessageTooShort {
            expected: *pos + 2,
            got: payload.len(),
        });
    }
    let len = u16::from_le_bytes([payload[*pos], payload[*pos + 1]]) as usize;
    *pos += 2;
    if payload.len() < *pos + len {
        return Err(ProtocolError::Malformed(format!("truncated {}", what)));
    }
    let block = payload[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(block)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(body: &HandshakeBody) -> HandshakeBody {
        let mut buf = Vec::new();
        body.encode_into(&mut buf);
        HandshakeBody::decode(&buf).unwrap()
    }

    #[test]
    fn test_roundtrip_full() {
        let body = HandshakeBody {
            public_key: vec![0x11; 1952],
            signature: vec![0x22; 3309],
            service_port: 9001,
            challenge: Some([0x33; CHALLENGE_LEN]),
            challenge_response: Some(vec![0x44; CHALLENGE_LEN]),
        };
        let decoded = roundtrip(&body);
        assert_eq!(decoded.public_key, body.public_key);
        assert_eq!(decoded.signature, body.signature);
        assert_eq!(decoded.service_port, 9001);
        assert_eq!(decoded.challenge, body.challenge);
        assert_eq!(decoded.challenge_response, body.challenge_response);
    }

    #[test]
    fn test_roundtrip_confirm_shape() {
        // Confirm messages carry no fresh challenge.
        let body = HandshakeBody {
            public_key: vec![0xaa; 64],
            signature: vec![0xbb; 128],
            service_port: 0,
            challenge: None,
            challenge_response: Some(vec![0xcc; CHALLENGE_LEN]),
        };
        let decoded = roundtrip(&body);
        assert!(decoded.challenge.is_none());
        assert_eq!(decoded.challenge_response, body.challenge_response);
    }

    #[test]
    fn test_truncated_signature() {
        let body = HandshakeBody {
            public_key: vec![0x11; 16],
            signature: vec![0x22; 16],
            service_port: 1,
            challenge: None,
            challenge_response: None,
        };
        let mut buf = Vec::new();
        body.encode_into(&mut buf);
        buf.truncate(20);
        assert!(HandshakeBody::decode(&buf).is_err());
    }

    #[test]
    fn test_bad_challenge_flag() {
        let body = HandshakeBody {
            public_key: vec![],
            signature: vec![],
            service_port: 1,
            challenge: None,
            challenge_response: None,
        };
        let mut buf = Vec::new();
        body.encode_into(&mut buf);
        buf[6] = 7; // flag byte after two empty blocks + port
        assert!(HandshakeBody::decode(&buf).is_err());
    }
}
