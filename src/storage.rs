//! # Signed Records and Local Storage
//!
//! A [`Record`] is the unit the DHT stores: `{key, value, publisher,
//! signature, timestamp}`. The signature covers every other field, so a record
//! can be relayed through untrusted nodes and verified by whoever receives it.
//!
//! [`Storage`] is the seam for the node's own key/value database. Each key
//! holds a small bag of records indexed by publisher: a record only ever
//! replaces an older record from the same publisher. The default
//! [`MemoryStorage`] is a bounded LRU over keys.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::crypto::{sign_with_domain, verify_with_domain, SignatureError, RECORD_SIGNATURE_DOMAIN};
use crate::identity::{now_ms, Key, Keypair};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    pub value: Vec<u8>,
    /// Ed25519 public key of the publisher.
    pub publisher: [u8; 32],
    pub signature: Vec<u8>,
    /// Publication time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Record {
    /// Sign a new record stamped with the current time.
    pub fn sign(keypair: &Keypair, key: Key, value: Vec<u8>) -> Self {
        Self::sign_at(keypair, key, value, now_ms())
    }

    pub fn sign_at(keypair: &Keypair, key: Key, value: Vec<u8>, timestamp: u64) -> Self {
        let publisher = keypair.public_key_bytes();
        let payload = Self::signed_payload(&key, &value, timestamp, &publisher);
        let signature = sign_with_domain(keypair, RECORD_SIGNATURE_DOMAIN, &payload);
        Self {
            key,
            value,
            publisher,
            signature,
            timestamp,
        }
    }

    /// Bytes covered by the signature (domain prefix excluded).
    ///
    /// Layout: `key || len(value) as u32 LE || value || timestamp as u64 LE || publisher`.
    pub fn signed_payload(key: &Key, value: &[u8], timestamp: u64, publisher: &[u8; 32]) -> Vec<u8> {
        let mut data = Vec::with_capacity(20 + 4 + value.len() + 8 + 32);
        data.extend_from_slice(key.as_bytes());
        data.extend_from_slice(&(value.len() as u32).to_le_bytes());
        data.extend_from_slice(value);
        data.extend_from_slice(&timestamp.to_le_bytes());
        data.extend_from_slice(publisher);
        data
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        let payload = Self::signed_payload(&self.key, &self.value, self.timestamp, &self.publisher);
        verify_with_domain(&self.publisher, RECORD_SIGNATURE_DOMAIN, &payload, &self.signature)
    }

    /// Verify the signature and, when a network master key is configured,
    /// that the record was published under it.
    pub fn verify_trusted(&self, trusted: Option<&[u8; 32]>) -> Result<(), SignatureError> {
        if let Some(master) = trusted {
            if &self.publisher != master {
                return Err(SignatureError::UntrustedPublisher);
            }
        }
        self.verify()
    }

    /// Age relative to `now` (milliseconds since the epoch); records from the
    /// future count as fresh.
    pub fn age(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.timestamp))
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("value_len", &self.value.len())
            .field("publisher", &hex::encode(&self.publisher[..8]))
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Most publishers kept under a single key.
pub const MAX_PUBLISHERS_PER_KEY: usize = 8;

/// What happened to a record handed to [`Storage::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// Replaced an older record from the same publisher.
    Replaced,
    /// An equal or newer record from the same publisher is already stored.
    Stale,
    /// The key already holds records from the maximum number of publishers.
    Full,
}

/// Local key/value database. Records round-trip unchanged.
pub trait Storage: Send + 'static {
    fn put(&mut self, record: Record) -> PutOutcome;
    /// All records under `key`, newest first.
    fn get(&mut self, key: &Key) -> Vec<Record>;
    fn remove(&mut self, key: &Key, publisher: &[u8; 32]) -> Option<Record>;
    fn key_count(&self) -> usize;
    fn record_count(&self) -> usize;
    fn keys(&self) -> Vec<Key>;
}

/// Order records newest first, ties broken by publisher key.
pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.publisher.cmp(&b.publisher))
    });
}

/// Bounded in-memory storage; the least recently used key is dropped at capacity.
pub struct MemoryStorage {
    records: LruCache<Key, BTreeMap<[u8; 32], Record>>,
}

impl MemoryStorage {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: LruCache::new(cap),
        }
    }
}

impl Storage for MemoryStorage {
    fn put(&mut self, record: Record) -> PutOutcome {
        if let Some(bag) = self.records.get_mut(&record.key) {
            return match bag.get(&record.publisher) {
                Some(existing) if existing.timestamp >= record.timestamp => PutOutcome::Stale,
                Some(_) => {
                    bag.insert(record.publisher, record);
                    PutOutcome::Replaced
                }
                None if bag.len() >= MAX_PUBLISHERS_PER_KEY => PutOutcome::Full,
                None => {
                    bag.insert(record.publisher, record);
                    PutOutcome::Inserted
                }
            };
        }
        let key = record.key;
        let mut bag = BTreeMap::new();
        bag.insert(record.publisher, record);
        self.records.put(key, bag);
        PutOutcome::Inserted
    }

    fn get(&mut self, key: &Key) -> Vec<Record> {
        let mut found: Vec<Record> = self
            .records
            .get(key)
            .map(|bag| bag.values().cloned().collect())
            .unwrap_or_default();
        sort_newest_first(&mut found);
        found
    }

    fn remove(&mut self, key: &Key, publisher: &[u8; 32]) -> Option<Record> {
        let bag = self.records.peek_mut(key)?;
        let removed = bag.remove(publisher);
        if bag.is_empty() {
            self.records.pop(key);
        }
        removed
    }

    fn key_count(&self) -> usize {
        self.records.len()
    }

    fn record_count(&self) -> usize {
        self.records.iter().map(|(_, bag)| bag.len()).sum()
    }

    fn keys(&self) -> Vec<Key> {
        self.records.iter().map(|(k, _)| *k).collect()
    }
}

/// Drop every record older than `max_age`. Returns how many were removed.
pub fn expire_records(storage: &mut dyn Storage, max_age: Duration, now: u64) -> usize {
    let mut removed = 0;
    for key in storage.keys() {
        for record in storage.get(&key) {
            if record.age(now) > max_age && storage.remove(&key, &record.publisher).is_some() {
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;

    #[test]
    fn signed_record_verifies() {
        let keypair = Keypair::generate();
        let record = Record::sign(&keypair, NodeId::random(), b"value".to_vec());
        assert!(record.verify().is_ok());
        assert!(record.verify_trusted(Some(&keypair.public_key_bytes())).is_ok());
    }

    #[test]
    fn tampered_record_fails() {
        let keypair = Keypair::generate();
        let record = Record::sign(&keypair, NodeId::random(), b"value".to_vec());

        let mut changed_value = record.clone();
        changed_value.value[0] ^= 0x01;
        assert_eq!(changed_value.verify(), Err(SignatureError::VerificationFailed));

        let mut changed_time = record.clone();
        changed_time.timestamp += 1;
        assert!(changed_time.verify().is_err());

        let mut changed_key = record.clone();
        changed_key.key = NodeId::random();
        assert!(changed_key.verify().is_err());

        let mut stolen = record;
        stolen.publisher = Keypair::generate().public_key_bytes();
        assert!(stolen.verify().is_err());
    }

    #[test]
    fn untrusted_publisher_rejected() {
        let keypair = Keypair::generate();
        let master = Keypair::generate();
        let record = Record::sign(&keypair, NodeId::random(), b"v".to_vec());
        assert_eq!(
            record.verify_trusted(Some(&master.public_key_bytes())),
            Err(SignatureError::UntrustedPublisher)
        );
    }

    #[test]
    fn memory_storage_put_get_remove() {
        let keypair = Keypair::generate();
        let mut storage = MemoryStorage::new(16);
        let record = Record::sign(&keypair, NodeId::random(), b"v1".to_vec());
        let key = record.key;

        assert_eq!(storage.put(record.clone()), PutOutcome::Inserted);
        assert_eq!(storage.key_count(), 1);
        assert_eq!(storage.get(&key), vec![record.clone()]);
        assert_eq!(storage.remove(&key, &record.publisher), Some(record));
        assert_eq!(storage.key_count(), 0);
        assert!(storage.get(&key).is_empty());
    }

    #[test]
    fn older_record_does_not_replace_newer() {
        let keypair = Keypair::generate();
        let key = NodeId::random();
        let mut storage = MemoryStorage::new(16);

        let newer = Record::sign_at(&keypair, key, b"new".to_vec(), 2_000);
        let older = Record::sign_at(&keypair, key, b"old".to_vec(), 1_000);
        assert_eq!(storage.put(newer.clone()), PutOutcome::Inserted);
        assert_eq!(storage.put(older), PutOutcome::Stale);
        assert_eq!(storage.put(newer), PutOutcome::Stale);
        assert_eq!(storage.get(&key)[0].value, b"new".to_vec());

        let republished = Record::sign_at(&keypair, key, b"new".to_vec(), 3_000);
        assert_eq!(storage.put(republished), PutOutcome::Replaced);
        let held = storage.get(&key);
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].timestamp, 3_000);
    }

    #[test]
    fn other_publisher_never_replaces_record() {
        let owner = Keypair::generate();
        let other = Keypair::generate();
        let key = NodeId::random();
        let mut storage = MemoryStorage::new(16);

        let original = Record::sign_at(&owner, key, b"owner".to_vec(), 1_000);
        let newer_foreign = Record::sign_at(&other, key, b"other".to_vec(), 5_000);
        assert_eq!(storage.put(original.clone()), PutOutcome::Inserted);
        assert_eq!(storage.put(newer_foreign.clone()), PutOutcome::Inserted);

        let held = storage.get(&key);
        assert_eq!(held, vec![newer_foreign, original.clone()]);
        assert_eq!(storage.key_count(), 1);
        assert_eq!(storage.record_count(), 2);

        assert!(storage.remove(&key, &other.public_key_bytes()).is_some());
        assert_eq!(storage.get(&key), vec![original]);
    }

    #[test]
    fn publisher_bag_is_bounded() {
        let key = NodeId::random();
        let mut storage = MemoryStorage::new(16);
        for _ in 0..MAX_PUBLISHERS_PER_KEY {
            let record = Record::sign(&Keypair::generate(), key, b"v".to_vec());
            assert_eq!(storage.put(record), PutOutcome::Inserted);
        }
        let extra = Record::sign(&Keypair::generate(), key, b"v".to_vec());
        assert_eq!(storage.put(extra), PutOutcome::Full);
        assert_eq!(storage.record_count(), MAX_PUBLISHERS_PER_KEY);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let keypair = Keypair::generate();
        let mut storage = MemoryStorage::new(2);
        let a = Record::sign(&keypair, NodeId::random(), b"a".to_vec());
        let b = Record::sign(&keypair, NodeId::random(), b"b".to_vec());
        let c = Record::sign(&keypair, NodeId::random(), b"c".to_vec());

        storage.put(a.clone());
        storage.put(b.clone());
        storage.get(&a.key);
        storage.put(c.clone());

        assert_eq!(storage.key_count(), 2);
        assert!(storage.get(&b.key).is_empty());
        assert!(!storage.get(&a.key).is_empty());
    }

    #[test]
    fn expire_removes_only_old_records() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let mut storage = MemoryStorage::new(16);
        let old = Record::sign_at(&keypair, NodeId::random(), b"old".to_vec(), 1_000);
        let fresh = Record::sign_at(&keypair, NodeId::random(), b"fresh".to_vec(), 100_000);
        let fresh_beside_old = Record::sign_at(&other, old.key, b"fresh".to_vec(), 100_000);
        storage.put(old.clone());
        storage.put(fresh.clone());
        storage.put(fresh_beside_old.clone());

        let removed = expire_records(&mut storage, Duration::from_secs(60), 110_000);
        assert_eq!(removed, 1);
        assert_eq!(storage.get(&old.key), vec![fresh_beside_old]);
        assert!(!storage.get(&fresh.key).is_empty());
    }
}
