//! Lattice-based signature service (ML-DSA-65, FIPS 204).
//!
//! Every node owns one [`SignatureService`] holding its ML-DSA-65 keypair.
//! Handshake messages are authenticated with detached signatures; key and
//! signature blobs travel the wire bit-exact.
//!
//! ## Sizes (FIPS 204, ML-DSA-65)
//!
//! - Public key: 1,952 bytes
//! - Signature:  3,309 bytes
//! - Seed:       32 bytes (compact private key form)

use ml_dsa::{Keypair, MlDsa65};
use thiserror::Error;
use zeroize::Zeroize;

/// Size of an ML-DSA-65 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 1952;

/// Size of an ML-DSA-65 signature in bytes.
pub const SIGNATURE_LEN: usize = 3309;

/// Size of the private key seed in bytes.
pub const SEED_LEN: usize = 32;

/// Errors from signature operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key: expected {PUBLIC_KEY_LEN} bytes, got {0}")]
    InvalidPublicKey(usize),

    #[error("invalid signature encoding: expected {SIGNATURE_LEN} bytes, got {0}")]
    InvalidSignature(usize),

    #[error("invalid seed: expected {SEED_LEN} bytes, got {0}")]
    InvalidSeed(usize),
}

/// Node-owned signing service backed by ML-DSA-65.
///
/// The private key is kept as its 32-byte seed and zeroized on drop. The
/// full signing key is re-derived per operation; ML-DSA key expansion is
/// deterministic from the seed.
pub struct SignatureService {
    seed: [u8; SEED_LEN],
    public_key: Vec<u8>,
}

impl SignatureService {
    /// Generate a new keypair from OS randomness.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed_array(seed)
    }

    /// Derive a keypair from a fixed 32-byte seed.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        if seed.len() != SEED_LEN {
            return Err(CryptoError::InvalidSeed(seed.len()));
        }
        let mut arr = [0u8; SEED_LEN];
        arr.copy_from_slice(seed);
        Ok(Self::from_seed_array(arr))
    }

    fn from_seed_array(seed: [u8; SEED_LEN]) -> Self {
        let sk = Self::signing_key(&seed);
        let encoded: ml_dsa::EncodedVerifyingKey<MlDsa65> = sk.verifying_key().encode();
        Self {
            seed,
            public_key: encoded.0.to_vec(),
        }
    }

    fn signing_key(seed: &[u8; SEED_LEN]) -> ml_dsa::SigningKey<MlDsa65> {
        let seed_arr = hybrid_array::Array::from(*seed);
        ml_dsa::SigningKey::<MlDsa65>::from_seed(&seed_arr)
    }

    /// The encoded public key.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Sign a message, returning the detached signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        use ml_dsa::signature::Signer;
        let sk = Self::signing_key(&self.seed);
        let sig = sk.sign(message);
        let encoded: ml_dsa::EncodedSignature<MlDsa65> = sig.encode();
        encoded.0.to_vec()
    }

    /// Verify a detached signature against a message and an encoded public
    /// key. Any malformed input verifies as false.
    pub fn verify(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        use ml_dsa::signature::Verifier;

        if public_key.len() != PUBLIC_KEY_LEN || signature.len() != SIGNATURE_LEN {
            return false;
        }

        let mut pk_arr = [0u8; PUBLIC_KEY_LEN];
        pk_arr.copy_from_slice(public_key);
        let pk_encoded = hybrid_array::Array::from(pk_arr);
        let vk = ml_dsa::VerifyingKey::<MlDsa65>::decode(&pk_encoded);

        let mut sig_arr = [0u8; SIGNATURE_LEN];
        sig_arr.copy_from_slice(signature);
        let sig_encoded = hybrid_array::Array::from(sig_arr);
        let sig = match ml_dsa::Signature::<MlDsa65>::decode(&sig_encoded) {
            Some(sig) => sig,
            None => return false,
        };

        vk.verify(message, &sig).is_ok()
    }
}

impl Drop for SignatureService {
    fn drop(&mut self) {
        self.seed.zeroize();
    }
}

impl std::fmt::Debug for SignatureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignatureService {{ seed: [REDACTED], public_key: {} bytes }}", self.public_key.len())
    }
}
