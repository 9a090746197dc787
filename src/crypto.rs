//! Signature algorithms and pinned trust roots.
//!
//! The wire protocol recognizes one real algorithm (Ed25519) plus a `none`
//! sentinel used by unsigned packets. Trust roots are compiled-in pinned
//! public-key sets: the hub checks an operator's signature against the
//! operator trust root, agents check the hub's certificate against the hub
//! trust root (§4.3).

use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// Highest `SigAlg` discriminant the wire format can carry (3-bit field, §4.1).
pub const MAX_SIG_ALG: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("unknown signature algorithm {0}")]
    BadAlgorithm(u8),
    #[error("signature size {got} does not match expected {expected} for algorithm {alg:?}")]
    BadSignatureSize {
        alg: SigAlg,
        expected: usize,
        got: usize,
    },
    #[error("malformed public key")]
    InvalidPublicKey,
    #[error("malformed signature")]
    InvalidSignature,
    #[error("signature did not verify against any pinned key")]
    Unverified,
    #[error("payload is unsigned but caller required a signature")]
    UnsignedButRequired,
}

/// Signature algorithm tag carried in the frame header flags (§4.1, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SigAlg {
    None = 0,
    Ed25519 = 1,
}

impl SigAlg {
    pub fn expected_size(self) -> usize {
        match self {
            SigAlg::None => 0,
            SigAlg::Ed25519 => ED25519_SIGNATURE_SIZE,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SigAlg {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SigAlg::None),
            1 => Ok(SigAlg::Ed25519),
            other => Err(CryptoError::BadAlgorithm(other)),
        }
    }
}

/// An Ed25519 identity capable of signing payloads.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    pub fn public_key(&self) -> [u8; ED25519_PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Raw secret seed, for callers that need to persist and later reload an
    /// identity via [`Keypair::from_secret_bytes`].
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Signs `payload` (the uncompressed message bytes, per §4.1).
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.signing_key.sign(payload).to_bytes().to_vec()
    }
}

/// Verifies a detached Ed25519 signature against a single public key.
pub fn verify_one(
    pubkey: &[u8; ED25519_PUBLIC_KEY_SIZE],
    payload: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    if signature.len() != ED25519_SIGNATURE_SIZE {
        return Err(CryptoError::BadSignatureSize {
            alg: SigAlg::Ed25519,
            expected: ED25519_SIGNATURE_SIZE,
            got: signature.len(),
        });
    }
    let verifying_key =
        VerifyingKey::from_bytes(pubkey).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = DalekSignature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    verifying_key
        .verify(payload, &sig)
        .map_err(|_| CryptoError::Unverified)
}

/// A compiled-in pinned set of public keys (§4.3): "hub trust root" on the
/// agent side, "operator trust root" on the hub side.
#[derive(Debug, Clone, Default)]
pub struct TrustRoot {
    pinned: Vec<[u8; ED25519_PUBLIC_KEY_SIZE]>,
}

impl TrustRoot {
    pub fn new(pinned: Vec<[u8; ED25519_PUBLIC_KEY_SIZE]>) -> Self {
        Self { pinned }
    }

    /// True iff `key` matches one of the pinned keys byte-for-byte.
    pub fn pins(&self, key: &[u8; ED25519_PUBLIC_KEY_SIZE]) -> bool {
        self.pinned.iter().any(|k| k == key)
    }

    /// Verifies `signature` over `payload` against every pinned key,
    /// succeeding as soon as one verifies (§4.3: "at least one pinned key").
    pub fn verify_any(&self, payload: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        for key in &self.pinned {
            if verify_one(key, payload, signature).is_ok() {
                return Ok(());
            }
        }
        Err(CryptoError::Unverified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trips() {
        let kp = Keypair::generate();
        let payload = b"a predicate compiled against facts";
        let sig = kp.sign(payload);
        assert!(verify_one(&kp.public_key(), payload, &sig).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"original");
        assert_eq!(
            verify_one(&kp.public_key(), b"tampered", &sig),
            Err(CryptoError::Unverified)
        );
    }

    #[test]
    fn trust_root_checks_every_pinned_key() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let root = TrustRoot::new(vec![a.public_key(), b.public_key()]);
        let sig = b.sign(b"hello");
        assert!(root.verify_any(b"hello", &sig).is_ok());
        assert!(root.pins(&a.public_key()));
        assert!(root.pins(&b.public_key()));

        let stranger = Keypair::generate();
        assert!(!root.pins(&stranger.public_key()));
    }

    #[test]
    fn sig_alg_rejects_unknown_values() {
        assert_eq!(SigAlg::try_from(0), Ok(SigAlg::None));
        assert_eq!(SigAlg::try_from(1), Ok(SigAlg::Ed25519));
        assert_eq!(SigAlg::try_from(2), Err(CryptoError::BadAlgorithm(2)));
    }
}
