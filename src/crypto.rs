//! # Record Signatures
//!
//! Stateless Ed25519 signing and verification. Nothing here keeps a shared
//! signature engine around: each call builds its own prefixed buffer and
//! verifying key, so concurrent verifications never contend.
//!
//! Every signed payload is prefixed with a domain tag so that a signature
//! produced for one purpose can never be replayed as another.

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::Keypair;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

// ============================================================================
// Signature Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature is not 64 bytes.
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
    /// Signed by a key other than the network's trusted publisher.
    UntrustedPublisher,
    /// The record does not belong to the key it was requested under.
    KeyMismatch,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
            SignatureError::UntrustedPublisher => write!(f, "publisher is not trusted"),
            SignatureError::KeyMismatch => write!(f, "record key does not match"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================

/// Domain separation prefix for stored key/value records.
pub const RECORD_SIGNATURE_DOMAIN: &[u8] = b"mojito-record-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

fn prefixed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(domain.len() + data.len());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(data);
    buf
}

/// Sign `data` under `domain`, returning the 64-byte signature.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    keypair.sign(&prefixed(domain, data)).to_bytes().to_vec()
}

/// Verify a signature produced by [`sign_with_domain`].
///
/// Uses `verify_strict`, which rejects small-order keys and malleable
/// signatures.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; SIGNATURE_LENGTH] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;

    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    verifying_key
        .verify_strict(&prefixed(domain, data), &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}
