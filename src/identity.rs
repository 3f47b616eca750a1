//! # Identifiers, Keys and Contacts
//!
//! - [`NodeId`]: 160-bit KUID naming a node or a record key
//! - [`MessageId`]: 160-bit KUID correlating a request with its response
//! - [`Distance`]: XOR distance between two node-space KUIDs
//! - [`Keypair`]: Ed25519 signing keypair used to publish records
//! - [`Contact`]: a node id bound to a UDP endpoint
//!
//! Node ids and message ids are separate types; the compiler rejects any
//! attempt to compare one with the other or to route on a message id.
//!
//! ## Invariants
//!
//! - `NodeId::from_slice(bytes)` succeeds only for exactly 20 bytes
//! - `a.xor_distance(&b) == b.xor_distance(&a)`
//! - `a.xor_distance(&a)` is zero and is the unique minimum over all `b`

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DhtError, Result};

/// Length of a KUID in bytes.
pub const KUID_LENGTH: usize = 20;

/// Length of a KUID in bits.
pub const KUID_BITS: usize = KUID_LENGTH * 8;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn copy_exact(bytes: &[u8]) -> Result<[u8; KUID_LENGTH]> {
    <[u8; KUID_LENGTH]>::try_from(bytes).map_err(|_| DhtError::MalformedIdentifier(bytes.len()))
}

fn random_bytes() -> [u8; KUID_LENGTH] {
    let mut bytes = [0u8; KUID_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// ============================================================================
// Node identifiers
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; KUID_LENGTH]);

/// Record keys live in the node id space so they can be compared by distance.
pub type Key = NodeId;

impl NodeId {
    pub const MIN: NodeId = NodeId([0u8; KUID_LENGTH]);

    #[inline]
    pub fn from_bytes(bytes: [u8; KUID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Construct from a byte slice; anything other than 20 bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        copy_exact(bytes).map(Self)
    }

    pub fn random() -> Self {
        Self(random_bytes())
    }

    /// Derive a node id from an Ed25519 public key: the first 20 bytes of its BLAKE3 hash.
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        let digest = blake3::hash(public_key);
        let mut bytes = [0u8; KUID_LENGTH];
        bytes.copy_from_slice(&digest.as_bytes()[..KUID_LENGTH]);
        Self(bytes)
    }

    /// Hash arbitrary application data into the key space.
    pub fn for_content(data: &[u8]) -> Self {
        Self::from_public_key(blake3::hash(data).as_bytes())
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; KUID_LENGTH] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; KUID_LENGTH];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Value of the bit at `index`, counted from the most significant bit.
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < KUID_BITS);
        (self.0[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    /// Copy of this id with the bit at `index` forced to `value`.
    pub fn with_bit(&self, index: usize, value: bool) -> Self {
        let mut bytes = self.0;
        let mask = 0x80u8 >> (index % 8);
        if value {
            bytes[index / 8] |= mask;
        } else {
            bytes[index / 8] &= !mask;
        }
        Self(bytes)
    }

    /// True when the first `depth` bits of both ids are equal.
    pub fn shares_prefix(&self, other: &NodeId, depth: usize) -> bool {
        let depth = depth.min(KUID_BITS);
        let full = depth / 8;
        if self.0[..full] != other.0[..full] {
            return false;
        }
        let rem = depth % 8;
        if rem == 0 {
            return true;
        }
        let mask = 0xFFu8 << (8 - rem);
        (self.0[full] & mask) == (other.0[full] & mask)
    }

    /// Random id whose first `depth` bits are taken from `prefix`.
    pub fn with_prefix(prefix: &NodeId, depth: usize) -> Self {
        let depth = depth.min(KUID_BITS);
        let mut bytes = random_bytes();
        let full = depth / 8;
        bytes[..full].copy_from_slice(&prefix.0[..full]);
        let rem = depth % 8;
        if rem > 0 {
            let mask = 0xFFu8 << (8 - rem);
            bytes[full] = (prefix.0[full] & mask) | (bytes[full] & !mask);
        }
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| DhtError::MalformedIdentifier(s.len() / 2))?;
        Self::from_slice(&bytes)
    }

    /// Short hex prefix for log fields.
    pub(crate) fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

/// Order `a` and `b` by their distance to `target`; equal distances fall back
/// to raw id order so results are deterministic.
pub fn compare_by_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> Ordering {
    a.xor_distance(target)
        .cmp(&b.xor_distance(target))
        .then_with(|| a.cmp(b))
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; KUID_LENGTH]> for NodeId {
    fn from(bytes: [u8; KUID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = DhtError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Self::from_slice(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// Distance
// ============================================================================

/// XOR distance, ordered as an unsigned big-endian 160-bit integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; KUID_LENGTH]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; KUID_LENGTH]);
    pub const MAX: Distance = Distance([0xFF; KUID_LENGTH]);

    pub fn as_bytes(&self) -> &[u8; KUID_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits; equals the shared prefix length of the two ids.
    pub fn leading_zeros(&self) -> usize {
        for (idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return idx * 8 + byte.leading_zeros() as usize;
            }
        }
        KUID_BITS
    }

    /// Lossy conversion used by the size estimator.
    pub fn as_f64(&self) -> f64 {
        self.0.iter().fold(0.0, |acc, b| acc * 256.0 + f64::from(*b))
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// Message identifiers
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; KUID_LENGTH]);

impl MessageId {
    pub fn random() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; KUID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        copy_exact(bytes).map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KUID_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Node id derived from this keypair's public key.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key.verifying_key().verify(message, signature).is_ok()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Contact
// ============================================================================

/// A peer as it travels on the wire: its node id and the UDP endpoint it was
/// reached at. The pair is the contact's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

impl Contact {
    pub fn new(node_id: NodeId, addr: SocketAddr) -> Self {
        Self { node_id, addr }
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({}@{})", self.node_id.short(), self.addr)
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.addr)
    }
}
