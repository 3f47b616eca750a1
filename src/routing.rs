//! # Route Table
//!
//! A prefix-splitting Kademlia route table. The id space starts as one bucket
//! of depth 0 and splits on demand; at any time the buckets partition the
//! space, and each holds at most `k` live contacts plus a bounded replacement
//! cache.
//!
//! ## Splitting
//!
//! A full bucket splits when its depth is below 160 and one of these holds:
//!
//! 1. it covers the local node id
//! 2. it is the sibling produced by the most recent split of the local bucket
//!    (the "smallest subtree")
//! 3. its depth is not a multiple of `depth_limit`
//!
//! ## Full buckets
//!
//! A contact that lands in a full, unsplittable bucket goes to the replacement
//! cache and the caller receives the bucket's least-recently-seen live contact
//! as a probe target. The table never performs I/O: whoever owns it runs the
//! probe and reports back through [`RouteTable::record_success`] or
//! [`RouteTable::evict_unresponsive`].
//!
//! An `Alive` newcomer replaces a least-recently-seen contact that has never
//! answered us directly (`Unknown`) without waiting for a probe.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::config::DhtConfig;
use crate::identity::{compare_by_distance, Contact, NodeId, KUID_BITS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContactState {
    /// Answered one of our requests or sent us one.
    Alive,
    /// Learned second-hand, or failed recently.
    Unknown,
    Dead,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RttStats {
    pub last: Option<Duration>,
    /// Exponentially weighted average with a 1/8 gain.
    pub smoothed: Option<Duration>,
    pub samples: u32,
}

impl RttStats {
    pub fn record(&mut self, rtt: Duration) {
        self.last = Some(rtt);
        self.smoothed = Some(match self.smoothed {
            None => rtt,
            Some(smoothed) => (smoothed * 7 + rtt) / 8,
        });
        self.samples = self.samples.saturating_add(1);
    }
}

#[derive(Clone, Debug)]
pub struct ContactEntry {
    pub contact: Contact,
    pub state: ContactState,
    pub last_seen: Instant,
    pub failures: u32,
    pub rtt: RttStats,
}

impl ContactEntry {
    fn new(contact: Contact, state: ContactState) -> Self {
        Self {
            contact,
            state,
            last_seen: Instant::now(),
            failures: 0,
            rtt: RttStats::default(),
        }
    }

    fn node_id(&self) -> &NodeId {
        &self.contact.node_id
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectMode {
    /// Live contacts that are not dead. Used for lookups and FIND_NODE replies.
    Closest,
    /// Every live contact regardless of state.
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The local node id, never stored.
    Ignored,
    Inserted,
    Updated,
    /// An unverified contact gave way to the new one.
    Replaced { evicted: Contact },
    /// The bucket is full; the contact went to the replacement cache and
    /// `probe` should be pinged.
    Cached { probe: Contact },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Unknown contact, local id, or the table believes the local node is
    /// offline.
    Ignored,
    Counted { failures: u32 },
    Evicted {
        removed: Contact,
        promoted: Option<Contact>,
    },
}

// ============================================================================
// Bucket
// ============================================================================

#[derive(Clone, Debug)]
struct Bucket {
    prefix: NodeId,
    depth: usize,
    /// Least recently seen first.
    live: Vec<ContactEntry>,
    /// Oldest first.
    cache: VecDeque<ContactEntry>,
    last_touched: Instant,
}

impl Bucket {
    fn root() -> Self {
        Self {
            prefix: NodeId::MIN,
            depth: 0,
            live: Vec::new(),
            cache: VecDeque::new(),
            last_touched: Instant::now(),
        }
    }

    fn covers(&self, id: &NodeId) -> bool {
        id.shares_prefix(&self.prefix, self.depth)
    }

    fn is(&self, prefix: &NodeId, depth: usize) -> bool {
        self.depth == depth && self.prefix.shares_prefix(prefix, depth)
    }

    fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    fn live_position(&self, id: &NodeId) -> Option<usize> {
        self.live.iter().position(|e| e.node_id() == id)
    }

    fn cache_position(&self, id: &NodeId) -> Option<usize> {
        self.cache.iter().position(|e| e.node_id() == id)
    }

    fn push_cached(&mut self, entry: ContactEntry, cache_size: usize) {
        if cache_size == 0 {
            return;
        }
        self.cache.push_back(entry);
        while self.cache.len() > cache_size {
            self.cache.pop_front();
        }
    }

    /// Pull the cached entry for `contact`, refreshed when observed directly,
    /// or start a new one.
    fn take_for_insert(&mut self, contact: Contact, state: ContactState) -> ContactEntry {
        let cached = self
            .cache_position(&contact.node_id)
            .and_then(|pos| self.cache.remove(pos));
        match cached {
            Some(mut entry) if state == ContactState::Alive => {
                entry.contact = contact;
                entry.state = ContactState::Alive;
                entry.failures = 0;
                entry.last_seen = Instant::now();
                entry
            }
            Some(entry) => entry,
            None => ContactEntry::new(contact, state),
        }
    }

    /// Remove a live entry and fill the gap with the oldest cached contact.
    fn remove_live(&mut self, pos: usize) -> (Contact, Option<Contact>) {
        let removed = self.live.remove(pos).contact;
        let promoted = self.cache.pop_front().map(|mut entry| {
            entry.state = ContactState::Unknown;
            let contact = entry.contact;
            self.live.push(entry);
            contact
        });
        if promoted.is_some() {
            self.touch();
        }
        (removed, promoted)
    }

    fn split(self) -> (Bucket, Bucket) {
        let depth = self.depth;
        let mut left = Bucket {
            prefix: self.prefix.with_bit(depth, false),
            depth: depth + 1,
            live: Vec::new(),
            cache: VecDeque::new(),
            last_touched: self.last_touched,
        };
        let mut right = Bucket {
            prefix: self.prefix.with_bit(depth, true),
            ..left.clone()
        };
        for entry in self.live {
            if entry.node_id().bit(depth) {
                right.live.push(entry);
            } else {
                left.live.push(entry);
            }
        }
        for entry in self.cache {
            if entry.node_id().bit(depth) {
                right.cache.push_back(entry);
            } else {
                left.cache.push_back(entry);
            }
        }
        (left, right)
    }

    fn prefix_bits(&self) -> String {
        if self.depth == 0 {
            return "*".to_string();
        }
        (0..self.depth)
            .map(|i| if self.prefix.bit(i) { '1' } else { '0' })
            .collect()
    }
}

// ============================================================================
// Route table
// ============================================================================

#[derive(Debug)]
pub struct RouteTable {
    local_id: NodeId,
    k: usize,
    cache_size: usize,
    depth_limit: usize,
    max_node_failures: u32,
    max_consecutive_failures: u32,
    /// Ordered by prefix, so adjacent buckets cover adjacent ranges.
    buckets: Vec<Bucket>,
    smallest_subtree: Option<(NodeId, usize)>,
    consecutive_failures: u32,
}

impl RouteTable {
    pub fn new(local_id: NodeId, config: &DhtConfig) -> Self {
        Self {
            local_id,
            k: config.k,
            cache_size: config.cache_size,
            depth_limit: config.depth_limit.max(1),
            max_node_failures: config.max_node_failures.max(1),
            max_consecutive_failures: config.max_consecutive_failures,
            buckets: vec![Bucket::root()],
            smallest_subtree: None,
            consecutive_failures: 0,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        let idx = self.buckets.iter().position(|b| b.covers(id));
        debug_assert!(idx.is_some(), "buckets must partition the id space");
        idx.unwrap_or(0)
    }

    fn is_splittable(&self, idx: usize) -> bool {
        let bucket = &self.buckets[idx];
        if bucket.depth >= KUID_BITS {
            return false;
        }
        let smallest = self
            .smallest_subtree
            .map_or(false, |(prefix, depth)| bucket.is(&prefix, depth));
        bucket.covers(&self.local_id) || smallest || bucket.depth % self.depth_limit != 0
    }

    fn split(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let covered_local = bucket.covers(&self.local_id);
        let depth = bucket.depth;
        let (left, right) = bucket.split();
        if covered_local {
            let sibling = if left.covers(&self.local_id) { &right } else { &left };
            self.smallest_subtree = Some((sibling.prefix, sibling.depth));
        }
        trace!(
            depth,
            left = left.live.len(),
            right = right.live.len(),
            "split bucket"
        );
        self.buckets.insert(idx, right);
        self.buckets.insert(idx, left);
    }

    /// Add or refresh a contact.
    ///
    /// `Alive` means the contact talked to us directly; `Unknown` means we
    /// heard about it from someone else.
    pub fn insert(&mut self, contact: Contact, state: ContactState) -> InsertOutcome {
        if contact.node_id == self.local_id {
            return InsertOutcome::Ignored;
        }
        if state == ContactState::Alive {
            self.consecutive_failures = 0;
        }

        loop {
            let idx = self.bucket_index(&contact.node_id);
            let k = self.k;
            let cache_size = self.cache_size;
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.live_position(&contact.node_id) {
                if state != ContactState::Alive {
                    return InsertOutcome::Updated;
                }
                let mut entry = bucket.live.remove(pos);
                if entry.contact.addr != contact.addr {
                    debug!(
                        peer = %contact.node_id.short(),
                        old = %entry.contact.addr,
                        new = %contact.addr,
                        "contact address changed"
                    );
                    entry.contact.addr = contact.addr;
                }
                entry.state = ContactState::Alive;
                entry.failures = 0;
                entry.last_seen = Instant::now();
                bucket.live.push(entry);
                bucket.touch();
                return InsertOutcome::Updated;
            }

            if bucket.live.len() < k {
                let entry = bucket.take_for_insert(contact, state);
                bucket.live.push(entry);
                if state == ContactState::Alive {
                    bucket.touch();
                }
                return InsertOutcome::Inserted;
            }

            if self.is_splittable(idx) {
                self.split(idx);
                continue;
            }

            let bucket = &mut self.buckets[idx];
            let entry = bucket.take_for_insert(contact, state);
            if state == ContactState::Alive {
                if let Some(lrs) = bucket.live.first() {
                    if lrs.state == ContactState::Unknown {
                        let evicted = bucket.live.remove(0).contact;
                        bucket.live.push(entry);
                        bucket.touch();
                        debug!(
                            evicted = %evicted.node_id.short(),
                            peer = %contact.node_id.short(),
                            "replaced unverified contact"
                        );
                        return InsertOutcome::Replaced { evicted };
                    }
                }
            }

            bucket.push_cached(entry, cache_size);
            return match bucket.live.first() {
                Some(lrs) => {
                    trace!(peer = %contact.node_id.short(), "bucket full, contact cached");
                    InsertOutcome::Cached { probe: lrs.contact }
                }
                None => InsertOutcome::Ignored,
            };
        }
    }

    /// Live contact with this id.
    pub fn get(&self, node_id: &NodeId) -> Option<Contact> {
        let bucket = &self.buckets[self.bucket_index(node_id)];
        bucket
            .live_position(node_id)
            .map(|pos| bucket.live[pos].contact)
    }

    pub fn state_of(&self, node_id: &NodeId) -> Option<ContactState> {
        let bucket = &self.buckets[self.bucket_index(node_id)];
        bucket
            .live_position(node_id)
            .map(|pos| bucket.live[pos].state)
    }

    pub fn contains_cached(&self, node_id: &NodeId) -> bool {
        self.buckets[self.bucket_index(node_id)]
            .cache_position(node_id)
            .is_some()
    }

    /// Up to `count` live contacts ordered by ascending distance to `target`.
    pub fn select(&self, target: &NodeId, count: usize, mode: SelectMode) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }
        let mut contacts: Vec<Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.live.iter())
            .filter(|e| mode == SelectMode::All || e.state != ContactState::Dead)
            .map(|e| e.contact)
            .collect();
        contacts.sort_by(|a, b| compare_by_distance(target, &a.node_id, &b.node_id));
        contacts.truncate(count);
        contacts
    }

    /// One random id inside each bucket due for a refresh. The bucket
    /// covering the local id is skipped; the self-lookup keeps it fresh.
    pub fn refresh_ids(&self, force: bool, stale_after: Duration) -> Vec<NodeId> {
        self.buckets
            .iter()
            .filter(|b| !b.covers(&self.local_id))
            .filter(|b| force || b.last_touched.elapsed() >= stale_after)
            .map(|b| NodeId::with_prefix(&b.prefix, b.depth))
            .collect()
    }

    pub fn mark_refreshed(&mut self, id: &NodeId) {
        let idx = self.bucket_index(id);
        self.buckets[idx].touch();
    }

    /// A request to `node_id` succeeded. Returns false if the contact is not
    /// in the table.
    pub fn record_success(&mut self, node_id: &NodeId, rtt: Option<Duration>) -> bool {
        self.consecutive_failures = 0;
        let idx = self.bucket_index(node_id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.live_position(node_id) {
            let mut entry = bucket.live.remove(pos);
            entry.state = ContactState::Alive;
            entry.failures = 0;
            entry.last_seen = Instant::now();
            if let Some(rtt) = rtt {
                entry.rtt.record(rtt);
            }
            bucket.live.push(entry);
            bucket.touch();
            return true;
        }
        if let Some(pos) = bucket.cache_position(node_id) {
            if let Some(entry) = bucket.cache.get_mut(pos) {
                entry.state = ContactState::Alive;
                entry.failures = 0;
                entry.last_seen = Instant::now();
                if let Some(rtt) = rtt {
                    entry.rtt.record(rtt);
                }
            }
            return true;
        }
        false
    }

    /// A request to `node_id` failed.
    pub fn record_failure(&mut self, node_id: &NodeId) -> FailureOutcome {
        if *node_id == self.local_id {
            return FailureOutcome::Ignored;
        }
        let idx = self.bucket_index(node_id);
        let in_live = self.buckets[idx].live_position(node_id);
        let in_cache = self.buckets[idx].cache_position(node_id);
        if in_live.is_none() && in_cache.is_none() {
            return FailureOutcome::Ignored;
        }
        if self.consecutive_failures >= self.max_consecutive_failures {
            trace!(peer = %node_id.short(), "ignoring failure, local node appears disconnected");
            return FailureOutcome::Ignored;
        }
        self.consecutive_failures += 1;

        let max = self.max_node_failures;
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = in_live {
            let entry = &mut bucket.live[pos];
            entry.failures += 1;
            entry.state = ContactState::Unknown;
            if entry.failures < max {
                return FailureOutcome::Counted {
                    failures: entry.failures,
                };
            }
            entry.state = ContactState::Dead;
            let (removed, promoted) = bucket.remove_live(pos);
            debug!(
                peer = %removed.node_id.short(),
                promoted = ?promoted.map(|c| c.node_id.short()),
                "evicted dead contact"
            );
            return FailureOutcome::Evicted { removed, promoted };
        }

        if let Some(pos) = in_cache {
            if let Some(entry) = bucket.cache.get_mut(pos) {
                entry.failures += 1;
                entry.state = ContactState::Unknown;
                if entry.failures < max {
                    return FailureOutcome::Counted {
                        failures: entry.failures,
                    };
                }
            }
            if let Some(entry) = bucket.cache.remove(pos) {
                trace!(peer = %node_id.short(), "dropped dead cached contact");
                return FailureOutcome::Evicted {
                    removed: entry.contact,
                    promoted: None,
                };
            }
        }
        FailureOutcome::Ignored
    }

    /// An eviction probe went unanswered: drop the live contact right away.
    pub fn evict_unresponsive(&mut self, node_id: &NodeId) -> FailureOutcome {
        if self.consecutive_failures >= self.max_consecutive_failures {
            return FailureOutcome::Ignored;
        }
        let idx = self.bucket_index(node_id);
        let Some(pos) = self.buckets[idx].live_position(node_id) else {
            return FailureOutcome::Ignored;
        };
        self.consecutive_failures += 1;
        let (removed, promoted) = self.buckets[idx].remove_live(pos);
        debug!(
            peer = %removed.node_id.short(),
            promoted = ?promoted.map(|c| c.node_id.short()),
            "evicted unresponsive contact"
        );
        FailureOutcome::Evicted { removed, promoted }
    }

    /// The peer announced that it is leaving.
    pub fn remove_shutdown(&mut self, node_id: &NodeId) -> FailureOutcome {
        let idx = self.bucket_index(node_id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.live_position(node_id) {
            let (removed, promoted) = bucket.remove_live(pos);
            return FailureOutcome::Evicted { removed, promoted };
        }
        if let Some(entry) = bucket
            .cache_position(node_id)
            .and_then(|pos| bucket.cache.remove(pos))
        {
            return FailureOutcome::Evicted {
                removed: entry.contact,
                promoted: None,
            };
        }
        FailureOutcome::Ignored
    }

    /// Live contacts not heard from for `older_than`, oldest first.
    pub fn stale_contacts(&self, older_than: Duration, limit: usize) -> Vec<Contact> {
        let mut stale: Vec<&ContactEntry> = self
            .buckets
            .iter()
            .flat_map(|b| b.live.iter())
            .filter(|e| e.last_seen.elapsed() >= older_than)
            .collect();
        stale.sort_by_key(|e| e.last_seen);
        stale.into_iter().take(limit).map(|e| e.contact).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.live.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cached_len(&self) -> usize {
        self.buckets.iter().map(|b| b.cache.len()).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl fmt::Display for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "RouteTable local={} buckets={} live={} cached={}",
            self.local_id,
            self.buckets.len(),
            self.len(),
            self.cached_len()
        )?;
        for bucket in &self.buckets {
            if bucket.live.is_empty() && bucket.cache.is_empty() {
                continue;
            }
            writeln!(
                f,
                "  bucket {} depth={} live={} cached={} touched={}s ago{}",
                bucket.prefix_bits(),
                bucket.depth,
                bucket.live.len(),
                bucket.cache.len(),
                bucket.last_touched.elapsed().as_secs(),
                if bucket.covers(&self.local_id) { " (local)" } else { "" }
            )?;
            for entry in &bucket.live {
                writeln!(
                    f,
                    "    {:?} {:?} failures={} rtt={:?}",
                    entry.contact, entry.state, entry.failures, entry.rtt.smoothed
                )?;
            }
            for entry in &bucket.cache {
                writeln!(f, "    (cached) {:?} {:?}", entry.contact, entry.state)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn contact(id: NodeId, port: u16) -> Contact {
        Contact::new(id, addr(port))
    }

    fn table(local: NodeId, k: usize) -> RouteTable {
        let config = DhtConfig {
            k,
            cache_size: 4,
            ..DhtConfig::default()
        };
        RouteTable::new(local, &config)
    }

    /// Id whose first bit differs from `local`, so it lands far away.
    fn far_id(local: &NodeId) -> NodeId {
        let id = NodeId::random();
        id.with_bit(0, !local.bit(0))
    }

    fn assert_partition(table: &RouteTable, probes: &[NodeId]) {
        let coverage: f64 = table
            .buckets
            .iter()
            .map(|b| 2f64.powi(-(b.depth as i32)))
            .sum();
        assert!((coverage - 1.0).abs() < 1e-9, "buckets cover {coverage}");
        for id in probes {
            let covering = table.buckets.iter().filter(|b| b.covers(id)).count();
            assert_eq!(covering, 1, "{id:?} covered by {covering} buckets");
        }
        for bucket in &table.buckets {
            assert!(bucket.live.len() <= table.k);
            for entry in bucket.live.iter().chain(bucket.cache.iter()) {
                assert!(bucket.covers(entry.node_id()));
            }
        }
    }

    #[test]
    fn inserting_self_is_noop() {
        let local = NodeId::random();
        let mut t = table(local, 4);
        assert_eq!(t.insert(contact(local, 1), ContactState::Alive), InsertOutcome::Ignored);
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn splits_keep_ranges_partitioned_and_bounded() {
        let local = NodeId::random();
        let mut t = table(local, 4);
        let ids: Vec<NodeId> = (0..200).map(|_| NodeId::random()).collect();
        for (i, id) in ids.iter().enumerate() {
            t.insert(contact(*id, 1000 + i as u16), ContactState::Alive);
        }
        assert!(t.bucket_count() > 1);
        assert_partition(&t, &ids);

        let mut probes = ids.clone();
        probes.extend((0..100).map(|_| NodeId::random()));
        assert_partition(&t, &probes);
    }

    #[test]
    fn full_unsplittable_bucket_populates_cache() {
        let local = NodeId::from_bytes([0u8; 20]);
        let mut t = table(local, 2);

        // Fill the far half (first bit 1) until it stops splitting.
        let mut cached = Vec::new();
        for i in 0..64u16 {
            let id = far_id(&local);
            match t.insert(contact(id, 2000 + i), ContactState::Unknown) {
                InsertOutcome::Cached { probe } => {
                    assert!(t.get(&probe.node_id).is_some());
                    assert!(t.contains_cached(&id));
                    cached.push(id);
                }
                InsertOutcome::Inserted => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert!(!cached.is_empty());
        assert!(t.cached_len() > 0);
        assert_partition(&t, &cached);
    }

    #[test]
    fn alive_contact_replaces_unknown_lrs() {
        let local = NodeId::from_bytes([0u8; 20]);
        let config = DhtConfig {
            k: 1,
            depth_limit: 1,
            ..DhtConfig::default()
        };
        let mut t = RouteTable::new(local, &config);

        // depth_limit 1: the far sibling at depth 1 is the smallest subtree and
        // may split once more; deeper far buckets are fixed.
        let a = NodeId::from_bytes([0x80; 20]);
        let b = NodeId::from_bytes([0x81; 20]);
        assert_eq!(t.insert(contact(a, 1), ContactState::Unknown), InsertOutcome::Inserted);
        let outcome = t.insert(contact(b, 2), ContactState::Alive);
        assert_eq!(outcome, InsertOutcome::Replaced { evicted: contact(a, 1) });
        assert!(t.get(&a).is_none());
        assert_eq!(t.state_of(&b), Some(ContactState::Alive));

        let c = NodeId::from_bytes([0x82; 20]);
        assert_eq!(
            t.insert(contact(c, 3), ContactState::Alive),
            InsertOutcome::Cached { probe: contact(b, 2) }
        );
    }

    #[test]
    fn select_is_sorted_and_bounded() {
        let local = NodeId::random();
        let mut t = table(local, 20);
        for i in 0..50u16 {
            t.insert(contact(NodeId::random(), 3000 + i), ContactState::Alive);
        }
        let target = NodeId::random();
        let selected = t.select(&target, 10, SelectMode::Closest);
        assert_eq!(selected.len(), 10);
        for pair in selected.windows(2) {
            assert_eq!(
                compare_by_distance(&target, &pair[0].node_id, &pair[1].node_id),
                std::cmp::Ordering::Less
            );
        }
        let everything = t.select(&target, usize::MAX, SelectMode::All);
        assert_eq!(everything.len(), t.len());
        assert!(t.select(&target, 0, SelectMode::All).is_empty());
    }

    #[test]
    fn address_update_requires_direct_contact() {
        let local = NodeId::random();
        let mut t = table(local, 4);
        let id = far_id(&local);
        t.insert(contact(id, 1), ContactState::Alive);

        assert_eq!(t.insert(contact(id, 2), ContactState::Unknown), InsertOutcome::Updated);
        assert_eq!(t.get(&id), Some(contact(id, 1)));

        assert_eq!(t.insert(contact(id, 3), ContactState::Alive), InsertOutcome::Updated);
        assert_eq!(t.get(&id), Some(contact(id, 3)));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn repeated_failures_evict_and_promote_oldest_cached() {
        let local = NodeId::from_bytes([0u8; 20]);
        let config = DhtConfig {
            k: 1,
            depth_limit: 1,
            cache_size: 3,
            max_node_failures: 3,
            ..DhtConfig::default()
        };
        let mut t = RouteTable::new(local, &config);
        let live = NodeId::from_bytes([0x80; 20]);
        let first_cached = NodeId::from_bytes([0x81; 20]);
        let second_cached = NodeId::from_bytes([0x82; 20]);

        t.insert(contact(live, 1), ContactState::Alive);
        assert!(matches!(
            t.insert(contact(first_cached, 2), ContactState::Alive),
            InsertOutcome::Cached { .. }
        ));
        assert!(matches!(
            t.insert(contact(second_cached, 3), ContactState::Alive),
            InsertOutcome::Cached { .. }
        ));

        assert_eq!(t.record_failure(&live), FailureOutcome::Counted { failures: 1 });
        assert_eq!(t.record_failure(&live), FailureOutcome::Counted { failures: 2 });
        assert_eq!(
            t.record_failure(&live),
            FailureOutcome::Evicted {
                removed: contact(live, 1),
                promoted: Some(contact(first_cached, 2)),
            }
        );
        assert!(t.get(&live).is_none());
        assert_eq!(t.get(&first_cached), Some(contact(first_cached, 2)));
        assert!(t.contains_cached(&second_cached));
    }

    #[test]
    fn success_resets_failure_count() {
        let local = NodeId::random();
        let mut t = table(local, 4);
        let id = far_id(&local);
        t.insert(contact(id, 1), ContactState::Alive);

        t.record_failure(&id);
        t.record_failure(&id);
        assert_eq!(t.state_of(&id), Some(ContactState::Unknown));
        assert!(t.record_success(&id, Some(Duration::from_millis(20))));
        assert_eq!(t.state_of(&id), Some(ContactState::Alive));
        assert_eq!(t.record_failure(&id), FailureOutcome::Counted { failures: 1 });
    }

    #[test]
    fn consecutive_failure_guard_stops_evictions() {
        let local = NodeId::random();
        let config = DhtConfig {
            max_node_failures: 1,
            max_consecutive_failures: 2,
            ..DhtConfig::default()
        };
        let mut t = RouteTable::new(local, &config);
        let ids: Vec<NodeId> = (0..4).map(|_| far_id(&local)).collect();
        for (i, id) in ids.iter().enumerate() {
            t.insert(contact(*id, 100 + i as u16), ContactState::Unknown);
        }

        assert!(matches!(t.record_failure(&ids[0]), FailureOutcome::Evicted { .. }));
        assert!(matches!(t.record_failure(&ids[1]), FailureOutcome::Evicted { .. }));
        assert_eq!(t.record_failure(&ids[2]), FailureOutcome::Ignored);
        assert_eq!(t.len(), 2);

        t.insert(contact(NodeId::random(), 200), ContactState::Alive);
        assert!(matches!(t.record_failure(&ids[2]), FailureOutcome::Evicted { .. }));
    }

    #[test]
    fn refresh_ids_skip_local_bucket_and_respect_staleness() {
        let local = NodeId::random();
        let mut t = table(local, 2);
        for i in 0..40u16 {
            t.insert(contact(NodeId::random(), 4000 + i), ContactState::Alive);
        }
        let forced = t.refresh_ids(true, Duration::from_secs(3600));
        assert_eq!(forced.len(), t.bucket_count() - 1);
        for id in &forced {
            let idx = t.bucket_index(id);
            assert!(!t.buckets[idx].covers(&local));
        }
        assert!(t.refresh_ids(false, Duration::from_secs(3600)).is_empty());
        assert_eq!(t.refresh_ids(false, Duration::ZERO).len(), forced.len());
    }

    #[test]
    fn shutdown_removal_and_stale_contacts() {
        let local = NodeId::random();
        let mut t = table(local, 8);
        let a = far_id(&local);
        let b = far_id(&local);
        t.insert(contact(a, 1), ContactState::Alive);
        t.insert(contact(b, 2), ContactState::Alive);

        let stale = t.stale_contacts(Duration::ZERO, 10);
        assert_eq!(stale, vec![contact(a, 1), contact(b, 2)]);
        assert!(t.stale_contacts(Duration::from_secs(60), 10).is_empty());

        assert!(matches!(t.remove_shutdown(&a), FailureOutcome::Evicted { .. }));
        assert!(t.get(&a).is_none());
        assert_eq!(t.remove_shutdown(&a), FailureOutcome::Ignored);
        assert!(t.to_string().contains(&b.short()));
    }
}
