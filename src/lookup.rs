//! # Iterative Lookup
//!
//! Parallel Kademlia lookup shared by node lookups (FIND_NODE) and value
//! lookups (FIND_VALUE).
//!
//! The shortlist is kept sorted by distance to the target. Up to `alpha`
//! queries run at once; each new query goes to the closest candidate nobody
//! has asked yet, provided fewer than `k` nodes have answered or the candidate
//! is closer than the `k`-th closest responder. The lookup converges when no
//! candidate qualifies and nothing is in flight.
//!
//! When no response has arrived for `boost_timeout`, one query beyond `alpha`
//! is issued on the next `boost_interval` tick so a handful of black holes
//! cannot stall the lookup.
//!
//! The engine talks to the network through [`Querier`]; it does not touch the
//! route table. Reporting successes and failures is the querier's job.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::crypto::SignatureError;
use crate::error::{DhtError, Result};
use crate::identity::{Contact, Distance, NodeId};
use crate::storage::{sort_newest_first, Record};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    Node,
    Value,
}

#[derive(Clone, Debug)]
pub enum QueryReply {
    Nodes(Vec<Contact>),
    /// Every record the responder holds under the key.
    Value(Vec<Record>),
}

/// Sends one lookup step to a remote node.
#[async_trait]
pub trait Querier: Send + Sync {
    async fn query(&self, to: &Contact, target: NodeId, kind: LookupKind) -> Result<QueryReply>;
}

#[derive(Clone, Debug)]
pub struct LookupParams {
    pub local_id: NodeId,
    pub k: usize,
    pub alpha: usize,
    pub timeout: Duration,
    pub boost_interval: Duration,
    pub boost_timeout: Duration,
    pub trusted_publisher: Option<[u8; 32]>,
}

#[derive(Clone, Debug)]
pub struct LookupOutcome {
    pub target: NodeId,
    /// Up to `k` responders, closest first.
    pub closest: Vec<Contact>,
    /// Newest verified record from the holder.
    pub record: Option<Record>,
    /// All verified records from the holder, newest first.
    pub records: Vec<Record>,
    pub holder: Option<Contact>,
    /// Responders of a value lookup that did not have the value, closest first.
    pub non_holders: Vec<Contact>,
    /// Deepest referral chain that produced a response.
    pub hops: usize,
    pub queried: usize,
    pub timeouts: usize,
    pub invalid_values: usize,
    pub elapsed: Duration,
    pub timed_out: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Progress {
    Pending,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    contact: Contact,
    distance: Distance,
    hop: usize,
    progress: Progress,
}

struct Shortlist {
    target: NodeId,
    local_id: NodeId,
    k: usize,
    /// Sorted by distance, then id.
    candidates: Vec<Candidate>,
    seen: HashSet<NodeId>,
    /// Distances of responders, ascending.
    responded: Vec<Distance>,
}

impl Shortlist {
    fn new(target: NodeId, local_id: NodeId, k: usize) -> Self {
        Self {
            target,
            local_id,
            k,
            candidates: Vec::new(),
            seen: HashSet::new(),
            responded: Vec::new(),
        }
    }

    fn add(&mut self, contact: Contact, hop: usize) {
        if contact.node_id == self.local_id || !self.seen.insert(contact.node_id) {
            return;
        }
        let distance = contact.node_id.xor_distance(&self.target);
        let pos = self
            .candidates
            .partition_point(|c| (c.distance, c.contact.node_id) < (distance, contact.node_id));
        self.candidates.insert(
            pos,
            Candidate {
                contact,
                distance,
                hop,
                progress: Progress::Pending,
            },
        );
    }

    /// Closest pending candidate still worth asking.
    fn next(&mut self) -> Option<(Contact, usize)> {
        let kth = if self.responded.len() >= self.k {
            self.responded.get(self.k - 1).copied()
        } else {
            None
        };
        let candidate = self
            .candidates
            .iter_mut()
            .find(|c| c.progress == Progress::Pending)?;
        if let Some(kth) = kth {
            if candidate.distance >= kth {
                return None;
            }
        }
        candidate.progress = Progress::InFlight;
        Some((candidate.contact, candidate.hop))
    }

    fn mark(&mut self, node_id: &NodeId, progress: Progress) {
        if let Some(candidate) = self
            .candidates
            .iter_mut()
            .find(|c| c.contact.node_id == *node_id)
        {
            candidate.progress = progress;
            if progress == Progress::Responded {
                let pos = self.responded.partition_point(|d| *d < candidate.distance);
                self.responded.insert(pos, candidate.distance);
            }
        }
    }

    fn closest_responders(&self) -> Vec<Contact> {
        self.candidates
            .iter()
            .filter(|c| c.progress == Progress::Responded)
            .take(self.k)
            .map(|c| c.contact)
            .collect()
    }
}

/// Run one lookup from `seeds` (the local node's closest contacts).
pub async fn run<Q>(
    querier: &Q,
    seeds: Vec<Contact>,
    params: &LookupParams,
    target: NodeId,
    kind: LookupKind,
) -> Result<LookupOutcome>
where
    Q: Querier + ?Sized,
{
    let started = Instant::now();
    let k = params.k.max(1);
    let alpha = params.alpha.max(1);

    let mut shortlist = Shortlist::new(target, params.local_id, k);
    for seed in seeds.into_iter().take(k) {
        shortlist.add(seed, 1);
    }
    if shortlist.candidates.is_empty() {
        return Err(DhtError::LookupExhausted);
    }

    let query = move |contact: Contact, hop: usize| async move {
        let result = querier.query(&contact, target, kind).await;
        (contact, hop, result)
    };

    let mut in_flight = FuturesUnordered::new();
    let mut queried = 0usize;
    let mut timeouts = 0usize;
    let mut hops = 0usize;
    let mut records: Vec<Record> = Vec::new();
    let mut holder = None;
    let mut non_holders: Vec<Contact> = Vec::new();
    let mut invalid: Option<SignatureError> = None;
    let mut invalid_values = 0usize;
    let mut timed_out = false;
    let mut last_response = Instant::now();

    let deadline = tokio::time::sleep(params.timeout);
    tokio::pin!(deadline);
    let mut boost = tokio::time::interval(params.boost_interval.max(Duration::from_millis(1)));
    boost.set_missed_tick_behavior(MissedTickBehavior::Delay);
    boost.tick().await;

    'lookup: loop {
        while in_flight.len() < alpha {
            let Some((contact, hop)) = shortlist.next() else {
                break;
            };
            queried += 1;
            in_flight.push(query(contact, hop));
        }
        if in_flight.is_empty() {
            break;
        }

        tokio::select! {
            _ = &mut deadline => {
                timed_out = true;
                break;
            }
            _ = boost.tick() => {
                if last_response.elapsed() >= params.boost_timeout {
                    if let Some((contact, hop)) = shortlist.next() {
                        trace!(lookup = %target.short(), peer = %contact.node_id.short(), "boosting stalled lookup");
                        queried += 1;
                        in_flight.push(query(contact, hop));
                        last_response = Instant::now();
                    }
                }
            }
            Some((contact, hop, result)) = in_flight.next() => {
                match result {
                    Ok(QueryReply::Nodes(contacts)) => {
                        last_response = Instant::now();
                        hops = hops.max(hop);
                        shortlist.mark(&contact.node_id, Progress::Responded);
                        if kind == LookupKind::Value {
                            non_holders.push(contact);
                        }
                        for learned in contacts {
                            shortlist.add(learned, hop + 1);
                        }
                    }
                    Ok(QueryReply::Value(found)) => {
                        last_response = Instant::now();
                        let mut valid = Vec::with_capacity(found.len());
                        for candidate in found {
                            let verified = if candidate.key != target {
                                Err(SignatureError::KeyMismatch)
                            } else {
                                candidate.verify_trusted(params.trusted_publisher.as_ref())
                            };
                            match verified {
                                Ok(()) => valid.push(candidate),
                                Err(e) => {
                                    debug!(peer = %contact.node_id.short(), error = %e, "discarding invalid value");
                                    invalid_values += 1;
                                    invalid = Some(e);
                                }
                            }
                        }
                        if valid.is_empty() {
                            shortlist.mark(&contact.node_id, Progress::Failed);
                        } else {
                            hops = hops.max(hop);
                            shortlist.mark(&contact.node_id, Progress::Responded);
                            sort_newest_first(&mut valid);
                            records = valid;
                            holder = Some(contact);
                            break 'lookup;
                        }
                    }
                    Err(e) => {
                        if e.is_timeout() {
                            timeouts += 1;
                        }
                        trace!(peer = %contact.node_id.short(), error = %e, "lookup query failed");
                        shortlist.mark(&contact.node_id, Progress::Failed);
                    }
                }
            }
        }
    }
    drop(in_flight);

    let elapsed = started.elapsed();
    let closest = shortlist.closest_responders();
    debug!(
        lookup = %target.short(),
        ?kind,
        found = records.len(),
        responders = closest.len(),
        queried,
        hops,
        timed_out,
        elapsed_ms = elapsed.as_millis() as u64,
        "lookup finished"
    );

    if records.is_empty() {
        if let Some(e) = invalid {
            if kind == LookupKind::Value {
                return Err(DhtError::SignatureInvalid(e));
            }
        }
        if closest.is_empty() {
            return Err(DhtError::LookupExhausted);
        }
    }

    non_holders.sort_by_key(|c| c.node_id.xor_distance(&target));
    Ok(LookupOutcome {
        target,
        closest,
        record: records.first().cloned(),
        records,
        holder,
        non_holders,
        hops,
        queried,
        timeouts,
        invalid_values,
        elapsed,
        timed_out,
    })
}
