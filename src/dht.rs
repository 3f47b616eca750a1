//! # DHT Core
//!
//! [`DhtNode`] is a cheap-to-clone handle; a private actor owns the route
//! table, the record store and the size estimator and applies commands one at
//! a time. Nothing else mutates routing state, so a half-split bucket or a
//! half-applied eviction is never observable.
//!
//! ## Key Operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `ping(addr)` | Liveness check; learns the responder's id |
//! | `lookup(target, kind)` | Iterative node or value lookup |
//! | `get(key)` | Local store first, then a value lookup |
//! | `store(key, value)` | Sign, keep locally, replicate to the `k` closest |
//! | `bootstrap(seeds)` | Ping seeds, look up ourselves, refresh every bucket |
//!
//! ## Inbound requests
//!
//! The handle implements [`RequestHandler`]. Every request marks its sender
//! `Alive` in the route table, with one exception: a STORE is only honoured
//! when the sender was already known before the request arrived.
//!
//! ## Eviction probes
//!
//! When the table reports a full bucket, the actor spawns a ping to that
//! bucket's least-recently-seen contact and feeds the result back as a
//! command. A contact is probed at most once at a time.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::estimator::SizeEstimator;
use crate::identity::{now_ms, Contact, Key, Keypair, NodeId};
use crate::lookup::{self, LookupKind, LookupOutcome, LookupParams, Querier, QueryReply};
use crate::messages::{
    FindValueReply, MessageBody, MessageKind, StatsKind, StoreStatus, MAX_CONTACTS_PER_RESPONSE,
    MAX_RECORDS_PER_RESPONSE, MAX_VALUE_SIZE,
};
use crate::protocols::{DhtNodeRpc, Pong, RequestHandler};
use crate::routing::{ContactState, FailureOutcome, InsertOutcome, RouteTable, SelectMode};
use crate::storage::{expire_records, MemoryStorage, PutOutcome, Record, Storage};

const COMMAND_QUEUE: usize = 256;

/// A value found by [`DhtNode::get`].
#[derive(Clone, Debug)]
pub struct ValueEntity {
    /// Newest record among `records`.
    pub record: Record,
    /// Every verified record the holder returned, one per publisher, newest first.
    pub records: Vec<Record>,
    /// Node that served the value; the local contact for a local hit.
    pub holder: Contact,
    pub hops: usize,
    pub elapsed: Duration,
}

impl ValueEntity {
    /// The record published under `publisher`, if the holder had one.
    pub fn from_publisher(&self, publisher: &[u8; 32]) -> Option<&Record> {
        self.records.iter().find(|r| &r.publisher == publisher)
    }
}

#[derive(Clone, Debug)]
pub struct StoreResult {
    pub record: Record,
    pub stored_at: Vec<Contact>,
    pub failed: Vec<Contact>,
}

#[derive(Clone, Debug)]
pub struct BootstrapResult {
    /// Seeds that answered the initial ping.
    pub seeds: Vec<Contact>,
    /// Contacts returned by the self-lookup.
    pub closest: usize,
    /// Bucket refresh lookups that succeeded.
    pub refreshed: usize,
    pub elapsed: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    pub live_contacts: usize,
    pub cached_contacts: usize,
    pub buckets: usize,
    pub stored_records: usize,
    pub estimated_size: u64,
    pub stores_accepted: u64,
    pub stores_rejected: u64,
    pub requests_handled: u64,
    pub lookups: u64,
    pub lookups_failed: u64,
}

#[derive(Default)]
struct LookupCounters {
    lookups: AtomicU64,
    failed: AtomicU64,
}

pub struct DhtNode<N: DhtNodeRpc> {
    cmd_tx: mpsc::Sender<Command>,
    local: Contact,
    network: Arc<N>,
    config: Arc<DhtConfig>,
    keypair: Arc<Keypair>,
    external_addr: Arc<RwLock<Option<SocketAddr>>>,
    counters: Arc<LookupCounters>,
}

impl<N: DhtNodeRpc> Clone for DhtNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local,
            network: Arc::clone(&self.network),
            config: Arc::clone(&self.config),
            keypair: Arc::clone(&self.keypair),
            external_addr: Arc::clone(&self.external_addr),
            counters: Arc::clone(&self.counters),
        }
    }
}

struct DhtNodeActor<N: DhtNodeRpc> {
    routing: RouteTable,
    storage: Box<dyn Storage>,
    estimator: SizeEstimator,
    config: Arc<DhtConfig>,
    network: Arc<N>,
    local_id: NodeId,
    /// Contacts with an eviction probe in flight.
    probing: HashSet<NodeId>,
    stores_accepted: u64,
    stores_rejected: u64,
    requests_handled: u64,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
}

enum Command {
    // State updates
    Observe(Contact, ContactState),
    ObserveResponse(Contact, Duration),
    RecordFailure(NodeId),
    ProbeResult(NodeId, Option<Duration>),
    RemoveShutdown(Contact),
    MarkRefreshed(NodeId),
    RemoteEstimate(u64),

    // Queries
    Select(NodeId, usize, SelectMode, oneshot::Sender<Vec<Contact>>),
    GetContact(NodeId, oneshot::Sender<Option<Contact>>),
    RefreshIds(bool, oneshot::Sender<Vec<NodeId>>),
    StaleContacts(Duration, usize, oneshot::Sender<Vec<Contact>>),
    LocalGet(Key, oneshot::Sender<Vec<Record>>),
    LocalPut(Record, oneshot::Sender<PutOutcome>),
    EstimateSize(oneshot::Sender<u64>),
    Dump(StatsKind, oneshot::Sender<String>),
    Stats(oneshot::Sender<TableStats>),

    // RPC handlers
    HandleFindNode(Contact, NodeId, oneshot::Sender<Vec<Contact>>),
    HandleFindValue(Contact, Key, oneshot::Sender<FindValueReply>),
    HandleStore(Contact, Record, oneshot::Sender<StoreStatus>),

    // Maintenance
    Expire(oneshot::Sender<usize>),

    Quit,
}

impl<N: DhtNodeRpc> DhtNode<N> {
    pub fn new(keypair: Keypair, local: Contact, network: N, config: DhtConfig) -> Self {
        let storage = Box::new(MemoryStorage::new(config.max_records));
        Self::with_storage(keypair, local, network, config, storage)
    }

    pub fn with_storage(
        keypair: Keypair,
        local: Contact,
        network: N,
        config: DhtConfig,
        storage: Box<dyn Storage>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let network = Arc::new(network);
        let config = Arc::new(config);

        let actor = DhtNodeActor {
            routing: RouteTable::new(local.node_id, &config),
            storage,
            estimator: SizeEstimator::new(),
            config: Arc::clone(&config),
            network: Arc::clone(&network),
            local_id: local.node_id,
            probing: HashSet::new(),
            stores_accepted: 0,
            stores_rejected: 0,
            requests_handled: 0,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            local,
            network,
            config,
            keypair: Arc::new(keypair),
            external_addr: Arc::new(RwLock::new(None)),
            counters: Arc::new(LookupCounters::default()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.local.node_id
    }

    pub fn local_contact(&self) -> Contact {
        self.local
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Our address as last reported by a peer's `Pong`.
    pub fn external_addr(&self) -> Option<SocketAddr> {
        *self.external_addr.read()
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| DhtError::Shutdown)?;
        rx.await.map_err(|_| DhtError::Shutdown)
    }

    async fn send(&self, command: Command) {
        let _ = self.cmd_tx.send(command).await;
    }

    // ------------------------------------------------------------------------
    // Route table access
    // ------------------------------------------------------------------------

    pub async fn observe(&self, contact: Contact, state: ContactState) {
        self.send(Command::Observe(contact, state)).await;
    }

    pub async fn record_failure(&self, node_id: NodeId) {
        self.send(Command::RecordFailure(node_id)).await;
    }

    pub async fn select(&self, target: NodeId, count: usize, mode: SelectMode) -> Vec<Contact> {
        self.call(|tx| Command::Select(target, count, mode, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn get_contact(&self, node_id: NodeId) -> Option<Contact> {
        self.call(|tx| Command::GetContact(node_id, tx))
            .await
            .ok()
            .flatten()
    }

    pub async fn refresh_ids(&self, force: bool) -> Vec<NodeId> {
        self.call(|tx| Command::RefreshIds(force, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn stale_contacts(&self, older_than: Duration, limit: usize) -> Vec<Contact> {
        self.call(|tx| Command::StaleContacts(older_than, limit, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn mark_refreshed(&self, id: NodeId) {
        self.send(Command::MarkRefreshed(id)).await;
    }

    pub async fn estimated_size(&self) -> u64 {
        self.call(Command::EstimateSize).await.unwrap_or(0)
    }

    pub async fn dump(&self, kind: StatsKind) -> String {
        self.call(|tx| Command::Dump(kind, tx))
            .await
            .unwrap_or_default()
    }

    pub async fn stats(&self) -> TableStats {
        let mut stats = self.call(Command::Stats).await.unwrap_or_default();
        stats.lookups = self.counters.lookups.load(Ordering::Relaxed);
        stats.lookups_failed = self.counters.failed.load(Ordering::Relaxed);
        stats
    }

    // ------------------------------------------------------------------------
    // Local storage
    // ------------------------------------------------------------------------

    /// Records held locally under `key`, newest first.
    pub async fn local_get(&self, key: Key) -> Vec<Record> {
        self.call(|tx| Command::LocalGet(key, tx)).await.unwrap_or_default()
    }

    /// Put a record into the local store without verifying it.
    pub async fn local_put(&self, record: Record) -> Result<PutOutcome> {
        self.call(|tx| Command::LocalPut(record, tx)).await
    }

    /// Drop records older than `record_ttl`.
    pub async fn expire_records(&self) -> usize {
        self.call(Command::Expire).await.unwrap_or(0)
    }

    /// Periodically expire old records until the actor stops.
    pub fn spawn_cleaner(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(node.config.cleaner_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                if node.cmd_tx.is_closed() {
                    break;
                }
                let removed = node.expire_records().await;
                if removed > 0 {
                    debug!(removed, "expired stale records");
                }
            }
        })
    }

    // ------------------------------------------------------------------------
    // Network operations
    // ------------------------------------------------------------------------

    /// Ping an address and learn who answers.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Pong> {
        let started = Instant::now();
        let pong = self.network.ping(addr).await?;
        self.send(Command::ObserveResponse(pong.responder, started.elapsed()))
            .await;
        self.send(Command::RemoteEstimate(pong.estimated_size)).await;
        let previous = self.external_addr.write().replace(pong.external_addr);
        if previous != Some(pong.external_addr) {
            debug!(addr = %pong.external_addr, "learned external address");
        }
        Ok(pong)
    }

    /// Ping a known contact; a failure counts against it.
    pub async fn ping_contact(&self, contact: &Contact) -> Result<Pong> {
        match self.ping(contact.addr).await {
            Ok(pong) if pong.responder.node_id == contact.node_id => Ok(pong),
            Ok(pong) => {
                debug!(
                    expected = %contact.node_id.short(),
                    got = %pong.responder.node_id.short(),
                    "different node answered at contact address"
                );
                self.record_failure(contact.node_id).await;
                Err(DhtError::UnexpectedResponse(MessageKind::Pong))
            }
            Err(e) => {
                if e.is_timeout() {
                    self.record_failure(contact.node_id).await;
                }
                Err(e)
            }
        }
    }

    fn lookup_params(&self, timeout: Duration) -> LookupParams {
        LookupParams {
            local_id: self.local.node_id,
            k: self.config.k,
            alpha: self.config.alpha,
            timeout,
            boost_interval: self.config.boost_interval,
            boost_timeout: self.config.boost_timeout,
            trusted_publisher: self.config.trusted_publisher,
        }
    }

    pub async fn lookup(
        &self,
        target: NodeId,
        kind: LookupKind,
        timeout: Duration,
    ) -> Result<LookupOutcome> {
        let seeds = self.select(target, self.config.k, SelectMode::Closest).await;
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        let result = lookup::run(self, seeds, &self.lookup_params(timeout), target, kind).await;
        if result.is_err() {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Find a value, trying the local store before the network.
    pub async fn get(&self, key: Key, timeout: Duration) -> Result<Option<ValueEntity>> {
        let started = Instant::now();
        let trusted = self.config.trusted_publisher.as_ref();
        let local: Vec<Record> = self
            .local_get(key)
            .await
            .into_iter()
            .filter(|record| record.verify_trusted(trusted).is_ok())
            .collect();
        if let Some(record) = local.first().cloned() {
            return Ok(Some(ValueEntity {
                record,
                records: local,
                holder: self.local,
                hops: 0,
                elapsed: started.elapsed(),
            }));
        }

        let outcome = self.lookup(key, LookupKind::Value, timeout).await?;
        let (Some(record), Some(holder)) = (outcome.record, outcome.holder) else {
            return Ok(None);
        };

        if self.config.cache_at_nonholder {
            if let Some(target) = outcome.non_holders.first().copied() {
                let network = Arc::clone(&self.network);
                let cached = outcome.records.clone();
                tokio::spawn(async move {
                    for record in cached {
                        match network.store(&target, record).await {
                            Ok(status) => trace!(peer = %target.node_id.short(), ?status, "cached value at non-holder"),
                            Err(e) => {
                                trace!(peer = %target.node_id.short(), error = %e, "caching at non-holder failed");
                                break;
                            }
                        }
                    }
                });
            }
        }

        Ok(Some(ValueEntity {
            record,
            records: outcome.records,
            holder,
            hops: outcome.hops,
            elapsed: started.elapsed(),
        }))
    }

    /// Sign `value` under `key`, keep it locally and replicate it to the `k`
    /// closest nodes.
    pub async fn store(&self, key: Key, value: Vec<u8>) -> Result<StoreResult> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(DhtError::MessageFormat(format!(
                "value of {} bytes exceeds limit",
                value.len()
            )));
        }
        let record = Record::sign(&self.keypair, key, value);
        self.local_put(record.clone()).await?;

        let outcome = self
            .lookup(key, LookupKind::Node, self.config.lookup_timeout)
            .await?;
        let targets = outcome.closest;
        let attempts = targets
            .iter()
            .map(|contact| self.network.store(contact, record.clone()));
        let results = join_all(attempts).await;

        let mut stored_at = Vec::new();
        let mut failed = Vec::new();
        for (contact, result) in targets.iter().zip(results) {
            match result {
                Ok(StoreStatus::Stored) => stored_at.push(*contact),
                Ok(StoreStatus::Rejected) => failed.push(*contact),
                Err(e) => {
                    if e.is_timeout() {
                        self.record_failure(contact.node_id).await;
                    }
                    trace!(peer = %contact.node_id.short(), error = %e, "store rpc failed");
                    failed.push(*contact);
                }
            }
        }

        if stored_at.is_empty() {
            warn!(key = %key.short(), attempted = targets.len(), "no node acknowledged store");
            return Err(DhtError::StoreFailed {
                attempted: targets.len(),
            });
        }
        debug!(
            key = %key.short(),
            stored = stored_at.len(),
            failed = failed.len(),
            "record stored"
        );
        Ok(StoreResult {
            record,
            stored_at,
            failed,
        })
    }

    /// Join the network through `seeds`.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<BootstrapResult> {
        let started = Instant::now();
        let pings = seeds
            .iter()
            .filter(|addr| **addr != self.local.addr)
            .map(|addr| self.ping(*addr));
        let responders: Vec<Contact> = join_all(pings)
            .await
            .into_iter()
            .filter_map(|result| result.ok())
            .map(|pong| pong.responder)
            .filter(|contact| contact.node_id != self.local.node_id)
            .collect();
        if responders.is_empty() {
            warn!(seeds = seeds.len(), "no bootstrap seed responded");
            return Err(DhtError::BootstrapFailed);
        }

        let closest = match self
            .lookup(self.local.node_id, LookupKind::Node, self.config.lookup_timeout)
            .await
        {
            Ok(outcome) => outcome.closest.len(),
            Err(e) => {
                debug!(error = %e, "self lookup during bootstrap failed");
                0
            }
        };

        let mut refreshed = 0;
        for id in self.refresh_ids(true).await {
            if self
                .lookup(id, LookupKind::Node, self.config.lookup_timeout)
                .await
                .is_ok()
            {
                refreshed += 1;
            }
            self.mark_refreshed(id).await;
        }

        let elapsed = started.elapsed();
        info!(
            seeds = responders.len(),
            closest,
            refreshed,
            elapsed_ms = elapsed.as_millis() as u64,
            "bootstrap complete"
        );
        Ok(BootstrapResult {
            seeds: responders,
            closest,
            refreshed,
            elapsed,
        })
    }

    /// Tell up to `shutdown_multiplier * k` contacts that we are leaving.
    pub async fn announce_shutdown(&self) -> usize {
        let count = self.config.shutdown_multiplier * self.config.k;
        let contacts = self
            .select(self.local.node_id, count, SelectMode::All)
            .await;
        let notices = contacts
            .iter()
            .map(|contact| self.network.notify_shutdown(contact));
        let sent = join_all(notices)
            .await
            .into_iter()
            .filter(|result| result.is_ok())
            .count();
        debug!(sent, "sent shutdown notices");
        sent
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    /// Non-blocking `quit` for use from `Drop`.
    pub(crate) fn request_quit(&self) {
        let _ = self.cmd_tx.try_send(Command::Quit);
    }
}

#[async_trait]
impl<N: DhtNodeRpc> Querier for DhtNode<N> {
    async fn query(&self, to: &Contact, target: NodeId, kind: LookupKind) -> Result<QueryReply> {
        let started = Instant::now();
        let result = match kind {
            LookupKind::Node => self.network.find_node(to, target).await.map(QueryReply::Nodes),
            LookupKind::Value => self
                .network
                .find_value(to, target)
                .await
                .map(|reply| match reply {
                    FindValueReply::Found(records) => QueryReply::Value(records),
                    FindValueReply::NotFound(contacts) => QueryReply::Nodes(contacts),
                }),
        };

        match &result {
            Ok(reply) => {
                self.send(Command::ObserveResponse(*to, started.elapsed()))
                    .await;
                if let QueryReply::Nodes(contacts) = reply {
                    for contact in contacts.iter().take(MAX_CONTACTS_PER_RESPONSE) {
                        self.observe(*contact, ContactState::Unknown).await;
                    }
                }
            }
            Err(e) if e.is_timeout() => self.record_failure(to.node_id).await,
            Err(_) => {}
        }
        result
    }
}

#[async_trait]
impl<N: DhtNodeRpc> RequestHandler for DhtNode<N> {
    async fn handle_request(&self, from: Contact, body: MessageBody) -> Option<MessageBody> {
        match body {
            MessageBody::Ping { shutdown: true } => {
                self.send(Command::RemoveShutdown(from)).await;
                None
            }
            MessageBody::Ping { shutdown: false } => {
                self.observe(from, ContactState::Alive).await;
                Some(MessageBody::Pong {
                    external_addr: from.addr,
                    estimated_size: self.estimated_size().await,
                })
            }
            MessageBody::FindNode { target } => {
                let contacts = self
                    .call(|tx| Command::HandleFindNode(from, target, tx))
                    .await
                    .ok()?;
                Some(MessageBody::FindNodeResponse { contacts })
            }
            MessageBody::FindValue { key } => {
                let reply = self
                    .call(|tx| Command::HandleFindValue(from, key, tx))
                    .await
                    .ok()?;
                Some(MessageBody::FindValueResponse { reply })
            }
            MessageBody::Store { record } => {
                let status = self
                    .call(|tx| Command::HandleStore(from, record, tx))
                    .await
                    .ok()?;
                Some(MessageBody::StoreResponse { status })
            }
            MessageBody::Stats { kind } => {
                self.observe(from, ContactState::Alive).await;
                Some(MessageBody::StatsResponse {
                    text: self.dump(kind).await,
                })
            }
            other => {
                trace!(kind = ?other.kind(), "ignoring response passed as request");
                None
            }
        }
    }
}

impl<N: DhtNodeRpc> DhtNodeActor<N> {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Observe(contact, state) => {
                    self.observe(contact, state);
                }
                Command::ObserveResponse(contact, rtt) => {
                    self.observe(contact, ContactState::Alive);
                    self.routing.record_success(&contact.node_id, Some(rtt));
                }
                Command::RecordFailure(node_id) => {
                    if let FailureOutcome::Evicted { removed, promoted } =
                        self.routing.record_failure(&node_id)
                    {
                        trace!(peer = %removed.node_id.short(), promoted = promoted.is_some(), "contact failed out");
                    }
                }
                Command::ProbeResult(node_id, rtt) => {
                    self.probing.remove(&node_id);
                    match rtt {
                        Some(rtt) => {
                            self.routing.record_success(&node_id, Some(rtt));
                        }
                        None => {
                            self.routing.evict_unresponsive(&node_id);
                        }
                    }
                }
                Command::RemoveShutdown(contact) => {
                    if self.routing.get(&contact.node_id) == Some(contact)
                        || self.routing.contains_cached(&contact.node_id)
                    {
                        self.routing.remove_shutdown(&contact.node_id);
                        debug!(peer = %contact.node_id.short(), "peer announced shutdown");
                    }
                }
                Command::MarkRefreshed(id) => {
                    self.routing.mark_refreshed(&id);
                }
                Command::RemoteEstimate(size) => {
                    self.estimator.add_remote(size);
                }
                Command::Select(target, count, mode, reply) => {
                    let _ = reply.send(self.routing.select(&target, count, mode));
                }
                Command::GetContact(node_id, reply) => {
                    let _ = reply.send(self.routing.get(&node_id));
                }
                Command::RefreshIds(force, reply) => {
                    let ids = self
                        .routing
                        .refresh_ids(force, self.config.bucket_stale_after);
                    let _ = reply.send(ids);
                }
                Command::StaleContacts(older_than, limit, reply) => {
                    let _ = reply.send(self.routing.stale_contacts(older_than, limit));
                }
                Command::LocalGet(key, reply) => {
                    let _ = reply.send(self.storage.get(&key));
                }
                Command::LocalPut(record, reply) => {
                    let _ = reply.send(self.storage.put(record));
                }
                Command::EstimateSize(reply) => {
                    let _ = reply.send(self.estimate_size());
                }
                Command::Dump(kind, reply) => {
                    let _ = reply.send(self.dump(kind));
                }
                Command::Stats(reply) => {
                    let _ = reply.send(self.stats());
                }
                Command::HandleFindNode(from, target, reply) => {
                    self.requests_handled += 1;
                    self.observe(from, ContactState::Alive);
                    let _ = reply.send(self.closest_for_reply(&target));
                }
                Command::HandleFindValue(from, key, reply) => {
                    self.requests_handled += 1;
                    self.observe(from, ContactState::Alive);
                    let mut held = self.storage.get(&key);
                    held.truncate(MAX_RECORDS_PER_RESPONSE);
                    let found = if held.is_empty() {
                        FindValueReply::NotFound(self.closest_for_reply(&key))
                    } else {
                        FindValueReply::Found(held)
                    };
                    let _ = reply.send(found);
                }
                Command::HandleStore(from, record, reply) => {
                    self.requests_handled += 1;
                    let status = self.handle_store(from, record);
                    let _ = reply.send(status);
                }
                Command::Expire(reply) => {
                    let removed =
                        expire_records(self.storage.as_mut(), self.config.record_ttl, now_ms());
                    let _ = reply.send(removed);
                }
                Command::Quit => {
                    break;
                }
            }
        }
        debug!(node = %self.local_id.short(), "dht actor stopped");
    }

    fn observe(&mut self, contact: Contact, state: ContactState) {
        match self.routing.insert(contact, state) {
            InsertOutcome::Cached { probe } => self.spawn_probe(probe),
            InsertOutcome::Replaced { evicted } => {
                trace!(evicted = %evicted.node_id.short(), peer = %contact.node_id.short(), "replaced contact");
            }
            _ => {}
        }
    }

    fn spawn_probe(&mut self, probe: Contact) {
        if !self.probing.insert(probe.node_id) {
            return;
        }
        let network = Arc::clone(&self.network);
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let rtt = match network.ping(probe.addr).await {
                Ok(pong) if pong.responder.node_id == probe.node_id => Some(started.elapsed()),
                Ok(_) => None,
                Err(e) => {
                    trace!(peer = %probe.node_id.short(), error = %e, "eviction probe failed");
                    None
                }
            };
            let _ = tx.send(Command::ProbeResult(probe.node_id, rtt)).await;
        });
    }

    fn closest_for_reply(&self, target: &NodeId) -> Vec<Contact> {
        let count = self.config.k.min(MAX_CONTACTS_PER_RESPONSE);
        self.routing.select(target, count, SelectMode::Closest)
    }

    fn handle_store(&mut self, from: Contact, record: Record) -> StoreStatus {
        let known = self.routing.get(&from.node_id).is_some()
            || self.routing.contains_cached(&from.node_id);
        if !known {
            // A STORE never introduces its sender to the table.
            debug!(peer = %from.node_id.short(), "rejecting store from unknown sender");
            self.stores_rejected += 1;
            return StoreStatus::Rejected;
        }
        self.observe(from, ContactState::Alive);

        if let Err(e) = record.verify_trusted(self.config.trusted_publisher.as_ref()) {
            debug!(peer = %from.node_id.short(), key = %record.key.short(), error = %e, "rejecting invalid record");
            self.stores_rejected += 1;
            return StoreStatus::Rejected;
        }

        let key = record.key;
        let outcome = self.storage.put(record);
        trace!(peer = %from.node_id.short(), key = %key.short(), ?outcome, "store handled");
        if outcome == PutOutcome::Full {
            self.stores_rejected += 1;
            return StoreStatus::Rejected;
        }
        self.stores_accepted += 1;
        StoreStatus::Stored
    }

    fn estimate_size(&mut self) -> u64 {
        let closest = self
            .routing
            .select(&self.local_id, self.config.k, SelectMode::Closest);
        self.estimator.update_local(&self.local_id, &closest);
        self.estimator.estimate()
    }

    fn stats(&mut self) -> TableStats {
        TableStats {
            live_contacts: self.routing.len(),
            cached_contacts: self.routing.cached_len(),
            buckets: self.routing.bucket_count(),
            stored_records: self.storage.record_count(),
            estimated_size: self.estimate_size(),
            stores_accepted: self.stores_accepted,
            stores_rejected: self.stores_rejected,
            requests_handled: self.requests_handled,
            lookups: 0,
            lookups_failed: 0,
        }
    }

    fn dump(&mut self, kind: StatsKind) -> String {
        match kind {
            StatsKind::RouteTable => self.routing.to_string(),
            StatsKind::Database => {
                let now = now_ms();
                let mut out = format!(
                    "Database keys={} records={}\n",
                    self.storage.key_count(),
                    self.storage.record_count()
                );
                for key in self.storage.keys() {
                    for record in self.storage.get(&key) {
                        let _ = writeln!(
                            out,
                            "  {} len={} publisher={} age={}s",
                            key,
                            record.value.len(),
                            hex::encode(&record.publisher[..8]),
                            record.age(now).as_secs()
                        );
                    }
                }
                out
            }
            StatsKind::Statistics => {
                let stats = self.stats();
                format!(
                    "Statistics\n  live_contacts={}\n  cached_contacts={}\n  buckets={}\n  records={}\n  estimated_size={}\n  stores_accepted={}\n  stores_rejected={}\n  requests_handled={}\n",
                    stats.live_contacts,
                    stats.cached_contacts,
                    stats.buckets,
                    stats.stored_records,
                    stats.estimated_size,
                    stats.stores_accepted,
                    stats.stores_rejected,
                    stats.requests_handled,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use parking_lot::Mutex;
    use tokio::time::sleep;

    use crate::identity::KUID_LENGTH;

    #[derive(Clone)]
    struct TestNetwork {
        registry: Arc<NetworkRegistry>,
        local: Contact,
        failures: Arc<Mutex<HashSet<SocketAddr>>>,
        stores: Arc<Mutex<Vec<(Contact, Key)>>>,
        pings: Arc<Mutex<Vec<SocketAddr>>>,
    }

    impl TestNetwork {
        fn new(registry: Arc<NetworkRegistry>, local: Contact) -> Self {
            Self {
                registry,
                local,
                failures: Arc::new(Mutex::new(HashSet::new())),
                stores: Arc::new(Mutex::new(Vec::new())),
                pings: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn set_failure(&self, addr: SocketAddr, fail: bool) {
            let mut failures = self.failures.lock();
            if fail {
                failures.insert(addr);
            } else {
                failures.remove(&addr);
            }
        }

        fn store_calls(&self) -> Vec<(Contact, Key)> {
            self.stores.lock().clone()
        }

        fn ping_calls(&self) -> Vec<SocketAddr> {
            self.pings.lock().clone()
        }

        async fn deliver(&self, addr: SocketAddr, body: MessageBody) -> Result<MessageBody> {
            let unreachable = DhtError::RequestTimeout { addr, attempts: 2 };
            if self.failures.lock().contains(&addr) {
                return Err(unreachable);
            }
            let Some(peer) = self.registry.get(&addr) else {
                return Err(unreachable);
            };
            peer.handle_request(self.local, body).await.ok_or(unreachable)
        }
    }

    #[derive(Default)]
    struct NetworkRegistry {
        peers: parking_lot::RwLock<HashMap<SocketAddr, DhtNode<TestNetwork>>>,
    }

    impl NetworkRegistry {
        fn register(&self, node: &DhtNode<TestNetwork>) {
            self.peers.write().insert(node.local_contact().addr, node.clone());
        }

        fn get(&self, addr: &SocketAddr) -> Option<DhtNode<TestNetwork>> {
            self.peers.read().get(addr).cloned()
        }
    }

    #[async_trait]
    impl DhtNodeRpc for TestNetwork {
        async fn ping(&self, addr: SocketAddr) -> Result<Pong> {
            self.pings.lock().push(addr);
            match self.deliver(addr, MessageBody::Ping { shutdown: false }).await? {
                MessageBody::Pong {
                    external_addr,
                    estimated_size,
                } => {
                    let responder = self
                        .registry
                        .get(&addr)
                        .map(|peer| peer.local_contact())
                        .ok_or(DhtError::RequestTimeout { addr, attempts: 1 })?;
                    Ok(Pong {
                        responder,
                        external_addr,
                        estimated_size,
                    })
                }
                other => Err(DhtError::UnexpectedResponse(other.kind())),
            }
        }

        async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
            match self.deliver(to.addr, MessageBody::FindNode { target }).await? {
                MessageBody::FindNodeResponse { contacts } => Ok(contacts),
                other => Err(DhtError::UnexpectedResponse(other.kind())),
            }
        }

        async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply> {
            match self.deliver(to.addr, MessageBody::FindValue { key }).await? {
                MessageBody::FindValueResponse { reply } => Ok(reply),
                other => Err(DhtError::UnexpectedResponse(other.kind())),
            }
        }

        async fn store(&self, to: &Contact, record: Record) -> Result<StoreStatus> {
            self.stores.lock().push((*to, record.key));
            match self.deliver(to.addr, MessageBody::Store { record }).await? {
                MessageBody::StoreResponse { status } => Ok(status),
                other => Err(DhtError::UnexpectedResponse(other.kind())),
            }
        }

        async fn stats(&self, to: &Contact, kind: StatsKind) -> Result<String> {
            match self.deliver(to.addr, MessageBody::Stats { kind }).await? {
                MessageBody::StatsResponse { text } => Ok(text),
                other => Err(DhtError::UnexpectedResponse(other.kind())),
            }
        }

        async fn notify_shutdown(&self, to: &Contact) -> Result<()> {
            if let Some(peer) = self.registry.get(&to.addr) {
                peer.handle_request(self.local, MessageBody::Ping { shutdown: true })
                    .await;
            }
            Ok(())
        }
    }

    struct TestNode {
        node: DhtNode<TestNetwork>,
        network: TestNetwork,
    }

    impl TestNode {
        fn new(registry: &Arc<NetworkRegistry>, index: u16, node_id: NodeId, config: DhtConfig) -> Self {
            let contact = Contact::new(node_id, SocketAddr::from(([10, 0, 0, 1], 9000 + index)));
            let network = TestNetwork::new(Arc::clone(registry), contact);
            let node = DhtNode::new(Keypair::generate(), contact, network.clone(), config);
            registry.register(&node);
            Self { node, network }
        }

        fn random(registry: &Arc<NetworkRegistry>, index: u16) -> Self {
            Self::new(registry, index, NodeId::random(), test_config())
        }

        fn contact(&self) -> Contact {
            self.node.local_contact()
        }
    }

    fn test_config() -> DhtConfig {
        DhtConfig {
            k: 8,
            lookup_timeout: Duration::from_secs(5),
            ..DhtConfig::default()
        }
    }

    fn id_with_first_byte(byte: u8) -> NodeId {
        let mut bytes = [0u8; KUID_LENGTH];
        bytes[0] = byte;
        bytes[KUID_LENGTH - 1] = byte;
        NodeId::from_bytes(bytes)
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn joined_network(size: u16) -> (Arc<NetworkRegistry>, Vec<TestNode>) {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes: Vec<TestNode> = (0..size).map(|i| TestNode::random(&registry, i)).collect();
        let seed = nodes[0].contact().addr;
        for node in nodes.iter().skip(1) {
            node.node.bootstrap(&[seed]).await.unwrap();
        }
        (registry, nodes)
    }

    #[tokio::test]
    async fn ping_learns_responder_and_reports_external_addr() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let b = TestNode::random(&registry, 2);

        let pong = a.node.ping(b.contact().addr).await.unwrap();
        assert_eq!(pong.responder, b.contact());
        assert_eq!(a.node.external_addr(), Some(a.contact().addr));
        assert_eq!(a.node.get_contact(b.contact().node_id).await, Some(b.contact()));
        assert_eq!(b.node.get_contact(a.contact().node_id).await, Some(a.contact()));
    }

    #[tokio::test]
    async fn lookup_finds_closest_nodes() {
        let (_registry, nodes) = joined_network(24).await;
        let target = NodeId::random();

        let outcome = nodes[5]
            .node
            .lookup(target, LookupKind::Node, Duration::from_secs(5))
            .await
            .unwrap();

        let mut expected: Vec<NodeId> = nodes
            .iter()
            .map(|n| n.contact().node_id)
            .filter(|id| *id != nodes[5].contact().node_id)
            .collect();
        expected.sort_by_key(|id| id.xor_distance(&target));
        expected.truncate(8);
        let found: Vec<NodeId> = outcome.closest.iter().map(|c| c.node_id).collect();
        assert_eq!(found.len(), 8);
        assert_eq!(&found[..4], &expected[..4]);
    }

    #[tokio::test]
    async fn store_rejected_from_unknown_sender() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let b = TestNode::random(&registry, 2);
        let keypair = Keypair::generate();
        let record = Record::sign(&keypair, NodeId::random(), b"hello".to_vec());

        for _ in 0..2 {
            let status = a.network.store(&b.contact(), record.clone()).await.unwrap();
            assert_eq!(status, StoreStatus::Rejected);
        }
        assert!(b.node.local_get(record.key).await.is_empty());
        assert_eq!(b.node.get_contact(a.contact().node_id).await, None);
        assert_eq!(b.node.stats().await.stores_rejected, 2);

        a.node.ping(b.contact().addr).await.unwrap();
        let status = a.network.store(&b.contact(), record.clone()).await.unwrap();
        assert_eq!(status, StoreStatus::Stored);
        assert_eq!(b.node.local_get(record.key).await, vec![record]);
    }

    #[tokio::test]
    async fn store_from_other_publisher_keeps_existing_record() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let b = TestNode::random(&registry, 2);
        let owner = Keypair::generate();
        let intruder = Keypair::generate();
        let key = NodeId::random();

        let original = Record::sign_at(&owner, key, b"owner".to_vec(), now_ms() - 1_000);
        b.node.local_put(original.clone()).await.unwrap();

        a.node.ping(b.contact().addr).await.unwrap();
        let newer = Record::sign(&intruder, key, b"intruder".to_vec());
        let status = a.network.store(&b.contact(), newer.clone()).await.unwrap();
        assert_eq!(status, StoreStatus::Stored);

        let held = b.node.local_get(key).await;
        assert_eq!(held, vec![newer, original.clone()]);

        let found = a.node.get(key, Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(found.holder, b.contact());
        assert_eq!(found.records.len(), 2);
        assert_eq!(found.from_publisher(&owner.public_key_bytes()), Some(&original));
    }

    #[tokio::test]
    async fn replayed_older_record_keeps_newer() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let b = TestNode::random(&registry, 2);
        let publisher = Keypair::generate();
        let key = NodeId::random();
        let current = Record::sign(&publisher, key, b"current".to_vec());
        let replay = Record::sign_at(&publisher, key, b"replay".to_vec(), current.timestamp - 1);
        b.node.local_put(current.clone()).await.unwrap();

        a.node.ping(b.contact().addr).await.unwrap();
        let status = a.network.store(&b.contact(), replay).await.unwrap();
        assert_eq!(status, StoreStatus::Stored);
        assert_eq!(b.node.local_get(key).await, vec![current]);
    }

    #[tokio::test]
    async fn get_through_chain_reaches_unknown_publisher() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let b = TestNode::random(&registry, 2);
        let c = TestNode::random(&registry, 3);
        let key = NodeId::for_content(b"chain");

        a.node.ping(b.contact().addr).await.unwrap();
        let stored = a.node.store(key, b"via b".to_vec()).await.unwrap();
        assert_eq!(stored.stored_at, vec![b.contact()]);

        c.node.ping(b.contact().addr).await.unwrap();
        assert_eq!(c.node.get_contact(a.contact().node_id).await, None);
        assert!(c.node.local_get(key).await.is_empty());

        let found = c.node.get(key, Duration::from_secs(5)).await.unwrap().expect("value found");
        assert_eq!(found.record, stored.record);
        assert_eq!(found.holder, b.contact());
        assert_eq!(found.hops, 1);
    }

    #[tokio::test]
    async fn forged_store_rejected() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let b = TestNode::random(&registry, 2);
        a.node.ping(b.contact().addr).await.unwrap();

        let mut forged = Record::sign(&Keypair::generate(), NodeId::random(), b"real".to_vec());
        forged.value = b"fake".to_vec();
        let status = a.network.store(&b.contact(), forged.clone()).await.unwrap();
        assert_eq!(status, StoreStatus::Rejected);
        assert!(b.node.local_get(forged.key).await.is_empty());
        assert_eq!(b.node.stats().await.stores_rejected, 1);
    }

    #[tokio::test]
    async fn store_then_get_from_another_node() {
        let (_registry, nodes) = joined_network(12).await;
        let key = NodeId::for_content(b"greeting");

        let result = nodes[3].node.store(key, b"hello dht".to_vec()).await.unwrap();
        assert!(!result.stored_at.is_empty());
        assert_eq!(nodes[3].network.store_calls().len(), result.stored_at.len() + result.failed.len());

        let found = nodes[9]
            .node
            .get(key, Duration::from_secs(5))
            .await
            .unwrap()
            .expect("value found");
        assert_eq!(found.record.value, b"hello dht".to_vec());
        assert_eq!(found.record.signature, result.record.signature);
    }

    #[tokio::test]
    async fn get_prefers_local_store() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let record = Record::sign(&Keypair::generate(), NodeId::random(), b"mine".to_vec());
        a.node.local_put(record.clone()).await.unwrap();

        let found = a.node.get(record.key, Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(found.record, record);
        assert_eq!(found.holder, a.contact());
        assert_eq!(found.hops, 0);
    }

    #[tokio::test]
    async fn forged_value_yields_signature_invalid() {
        let (_registry, nodes) = joined_network(6).await;
        let key = NodeId::random();
        let mut forged = Record::sign(&Keypair::generate(), key, b"real".to_vec());
        forged.value = b"fake".to_vec();
        for node in nodes.iter().take(5) {
            node.node.local_put(forged.clone()).await.unwrap();
        }

        let err = nodes[5]
            .node
            .get(key, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn failed_probe_evicts_and_promotes_cached() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig {
            k: 1,
            depth_limit: 1,
            ..test_config()
        };
        let local = TestNode::new(&registry, 0, NodeId::MIN, config);
        let incumbent = TestNode::new(&registry, 1, id_with_first_byte(0x80), test_config());
        let newcomer = TestNode::new(&registry, 2, id_with_first_byte(0x81), test_config());

        local
            .node
            .handle_request(incumbent.contact(), MessageBody::Ping { shutdown: false })
            .await;
        assert_eq!(
            local.node.get_contact(incumbent.contact().node_id).await,
            Some(incumbent.contact())
        );

        local.network.set_failure(incumbent.contact().addr, true);
        local
            .node
            .handle_request(newcomer.contact(), MessageBody::Ping { shutdown: false })
            .await;

        let promoted = eventually(|| async {
            local.node.get_contact(newcomer.contact().node_id).await.is_some()
        })
        .await;
        assert!(promoted, "cached contact promoted after failed probe");
        assert!(local.node.get_contact(incumbent.contact().node_id).await.is_none());
        assert!(local.network.ping_calls().contains(&incumbent.contact().addr));
    }

    #[tokio::test]
    async fn answered_probe_keeps_incumbent() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig {
            k: 1,
            depth_limit: 1,
            ..test_config()
        };
        let local = TestNode::new(&registry, 0, NodeId::MIN, config);
        let incumbent = TestNode::new(&registry, 1, id_with_first_byte(0x80), test_config());
        let newcomer = TestNode::new(&registry, 2, id_with_first_byte(0x81), test_config());

        local
            .node
            .handle_request(incumbent.contact(), MessageBody::Ping { shutdown: false })
            .await;
        local
            .node
            .handle_request(newcomer.contact(), MessageBody::Ping { shutdown: false })
            .await;

        let probed = eventually(|| async {
            local.network.ping_calls().contains(&incumbent.contact().addr)
        })
        .await;
        assert!(probed);
        sleep(Duration::from_millis(50)).await;
        assert!(local.node.get_contact(incumbent.contact().node_id).await.is_some());
        assert!(local.node.get_contact(newcomer.contact().node_id).await.is_none());
    }

    #[tokio::test]
    async fn shutdown_notice_removes_sender() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let b = TestNode::random(&registry, 2);
        a.node.ping(b.contact().addr).await.unwrap();
        assert!(b.node.get_contact(a.contact().node_id).await.is_some());

        assert_eq!(a.node.announce_shutdown().await, 1);
        let removed = eventually(|| async {
            b.node.get_contact(a.contact().node_id).await.is_none()
        })
        .await;
        assert!(removed);
    }

    #[tokio::test]
    async fn bootstrap_without_reachable_seed_fails() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let nowhere = SocketAddr::from(([10, 9, 9, 9], 1));
        assert!(matches!(a.node.bootstrap(&[nowhere]).await, Err(DhtError::BootstrapFailed)));
        assert!(matches!(a.node.bootstrap(&[]).await, Err(DhtError::BootstrapFailed)));
    }

    #[tokio::test]
    async fn cleaner_expires_old_records() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig {
            record_ttl: Duration::from_secs(60),
            cleaner_interval: Duration::from_millis(20),
            ..test_config()
        };
        let a = TestNode::new(&registry, 1, NodeId::random(), config);
        let keypair = Keypair::generate();
        let old = Record::sign_at(&keypair, NodeId::random(), b"old".to_vec(), now_ms() - 120_000);
        let fresh = Record::sign(&keypair, NodeId::random(), b"fresh".to_vec());
        a.node.local_put(old.clone()).await.unwrap();
        a.node.local_put(fresh.clone()).await.unwrap();

        let cleaner = a.node.spawn_cleaner();
        let expired = eventually(|| async { a.node.local_get(old.key).await.is_empty() }).await;
        cleaner.abort();

        assert!(expired);
        assert!(!a.node.local_get(fresh.key).await.is_empty());
    }

    #[tokio::test]
    async fn stats_dumps_describe_state() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        let b = TestNode::random(&registry, 2);
        a.node.ping(b.contact().addr).await.unwrap();
        let record = Record::sign(&Keypair::generate(), NodeId::random(), b"v".to_vec());
        a.node.local_put(record.clone()).await.unwrap();

        let table = a.node.dump(StatsKind::RouteTable).await;
        assert!(table.contains("live=1"));
        let database = a.node.dump(StatsKind::Database).await;
        assert!(database.contains(&record.key.to_hex()));

        let remote = a.network.stats(&b.contact(), StatsKind::Statistics).await.unwrap();
        assert!(remote.contains("live_contacts=1"));

        let stats = a.node.stats().await;
        assert_eq!(stats.live_contacts, 1);
        assert_eq!(stats.stored_records, 1);
    }

    #[tokio::test]
    async fn quit_stops_actor() {
        let registry = Arc::new(NetworkRegistry::default());
        let a = TestNode::random(&registry, 1);
        a.node.quit().await;
        let record = Record::sign(&Keypair::generate(), NodeId::random(), Vec::new());
        let stopped =
            eventually(|| async { a.node.local_put(record.clone()).await.is_err() }).await;
        assert!(stopped);
        assert!(a.node.select(NodeId::random(), 4, SelectMode::All).await.is_empty());
    }
}
