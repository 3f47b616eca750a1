//! # High-Level Node API
//!
//! [`Mojito`] wires a [`Transport`] to the RPC layer and the DHT core and
//! owns the background tasks (listener, bucket refresher, record cleaner).
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Mojito::bind("0.0.0.0:0".parse()?, DhtConfig::default()).await?;
//! node.bootstrap(&["192.0.2.10:5000".parse()?]).await?;
//!
//! let key = NodeId::for_content(b"my-key");
//! node.store(key, b"hello".to_vec()).await?;
//! let found = node.get(key, Duration::from_secs(10)).await?;
//!
//! node.close().await;
//! ```
//!
//! ## Lifecycle
//!
//! `Init -> Booting -> Ready -> Closed`. Only one bootstrap runs at a time;
//! starting another aborts the first, which then returns
//! [`DhtError::Cancelled`]. The refresher starts after the first successful
//! bootstrap. `close()` is idempotent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::DhtConfig;
use crate::dht::{BootstrapResult, DhtNode, StoreResult, TableStats, ValueEntity};
use crate::error::{DhtError, Result};
use crate::identity::{Contact, Key, Keypair, NodeId};
use crate::lookup::LookupKind;
use crate::messages::StatsKind;
use crate::protocols::DhtNodeRpc;
use crate::refresher::BucketRefresher;
use crate::rpc::{RpcNode, RpcStats};
use crate::storage::{MemoryStorage, Storage};
use crate::transport::{Transport, UdpTransport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    Init = 0,
    Booting = 1,
    Ready = 2,
    Closed = 3,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeState::Init,
            1 => NodeState::Booting,
            2 => NodeState::Ready,
            _ => NodeState::Closed,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PingResult {
    pub contact: Contact,
    pub rtt: Duration,
    /// Our address as the responder saw it.
    pub external_addr: SocketAddr,
    pub estimated_size: u64,
}

#[derive(Clone, Debug)]
pub struct NodeEntity {
    pub target: NodeId,
    /// Up to `k` responders, closest first.
    pub closest: Vec<Contact>,
    pub hops: usize,
    pub elapsed: Duration,
    pub queried: usize,
    pub timed_out: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct DhtStats {
    pub table: TableStats,
    pub rpc: RpcStats,
    pub state: NodeState,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct Mojito<T: Transport> {
    contact: Contact,
    rpc: RpcNode<T>,
    dht: DhtNode<RpcNode<T>>,
    state: AtomicU8,
    refresher: Mutex<BucketRefresher<RpcNode<T>>>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
    bootstrap: Mutex<Option<(u64, AbortHandle)>>,
    boot_generation: AtomicU64,
}

impl Mojito<UdpTransport> {
    /// Bind a UDP socket and start a node with a fresh keypair.
    pub async fn bind(addr: SocketAddr, config: DhtConfig) -> Result<Self> {
        let transport = UdpTransport::bind(addr).await?;
        Self::with_transport(transport, Keypair::generate(), config)
    }
}

impl<T: Transport> Mojito<T> {
    pub fn with_transport(transport: T, keypair: Keypair, config: DhtConfig) -> Result<Self> {
        let storage = Box::new(MemoryStorage::new(config.max_records));
        Self::with_storage(transport, keypair, config, storage)
    }

    /// Start a node backed by a caller-supplied record store.
    pub fn with_storage(
        transport: T,
        keypair: Keypair,
        config: DhtConfig,
        storage: Box<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = config.node_id.unwrap_or_else(|| keypair.node_id());
        let rpc = RpcNode::new(transport, node_id, &config);
        let contact = Contact::new(node_id, rpc.local_addr()?);

        let dht = DhtNode::with_storage(keypair, contact, rpc.clone(), config, storage);
        rpc.start(Arc::new(dht.clone()))?;
        let cleaner = dht.spawn_cleaner();
        let refresher = BucketRefresher::new(dht.clone());

        info!(node = %node_id, addr = %contact.addr, "mojito node started");
        Ok(Self {
            contact,
            rpc,
            dht,
            state: AtomicU8::new(NodeState::Init as u8),
            refresher: Mutex::new(refresher),
            cleaner: Mutex::new(Some(cleaner)),
            bootstrap: Mutex::new(None),
            boot_generation: AtomicU64::new(0),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.contact.node_id
    }

    pub fn local_contact(&self) -> Contact {
        self.contact
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &DhtConfig {
        self.dht.config()
    }

    fn set_state(&self, state: NodeState) {
        // Closed is terminal.
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != NodeState::Closed as u8).then_some(state as u8)
            });
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state() == NodeState::Closed {
            return Err(DhtError::Shutdown);
        }
        Ok(())
    }

    /// Join the network through `seeds`. Aborts any bootstrap already running.
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<BootstrapResult> {
        self.ensure_open()?;
        let prior = self.state();
        let dht = self.dht.clone();
        let seeds = seeds.to_vec();
        let task = tokio::spawn(async move { dht.bootstrap(&seeds).await });
        let _abort = AbortOnDrop(task.abort_handle());

        let generation = self.boot_generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some((_, previous)) = self
            .bootstrap
            .lock()
            .replace((generation, task.abort_handle()))
        {
            debug!("aborting previous bootstrap");
            previous.abort();
        }
        self.set_state(NodeState::Booting);

        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                if !e.is_cancelled() {
                    warn!(error = %e, "bootstrap task failed");
                }
                return Err(DhtError::Cancelled);
            }
        };
        {
            let mut current = self.bootstrap.lock();
            if current.as_ref().map(|(g, _)| *g) == Some(generation) {
                current.take();
            }
        }
        self.ensure_open()?;

        match result {
            Ok(report) => {
                self.set_state(NodeState::Ready);
                let mut refresher = self.refresher.lock();
                if !refresher.is_started() {
                    refresher.start();
                }
                Ok(report)
            }
            Err(e) => {
                let fallback = if prior == NodeState::Ready {
                    NodeState::Ready
                } else {
                    NodeState::Init
                };
                self.set_state(fallback);
                Err(e)
            }
        }
    }

    pub async fn ping(&self, addr: SocketAddr, timeout: Duration) -> Result<PingResult> {
        self.ensure_open()?;
        let started = tokio::time::Instant::now();
        let pong = tokio::time::timeout(timeout, self.dht.ping(addr))
            .await
            .map_err(|_| DhtError::RequestTimeout { addr, attempts: 0 })??;
        Ok(PingResult {
            contact: pong.responder,
            rtt: started.elapsed(),
            external_addr: pong.external_addr,
            estimated_size: pong.estimated_size,
        })
    }

    /// Find the `k` nodes closest to `target`.
    pub async fn lookup(&self, target: NodeId, timeout: Duration) -> Result<NodeEntity> {
        self.ensure_open()?;
        let outcome = self.dht.lookup(target, LookupKind::Node, timeout).await?;
        Ok(NodeEntity {
            target,
            closest: outcome.closest,
            hops: outcome.hops,
            elapsed: outcome.elapsed,
            queried: outcome.queried,
            timed_out: outcome.timed_out,
        })
    }

    pub async fn get(&self, key: Key, timeout: Duration) -> Result<Option<ValueEntity>> {
        self.ensure_open()?;
        self.dht.get(key, timeout).await
    }

    pub async fn store(&self, key: Key, value: Vec<u8>) -> Result<StoreResult> {
        self.ensure_open()?;
        self.dht.store(key, value).await
    }

    /// Ask a remote node for one of its diagnostic dumps.
    pub async fn remote_stats(&self, contact: &Contact, kind: StatsKind) -> Result<String> {
        self.ensure_open()?;
        DhtNodeRpc::stats(&self.rpc, contact, kind).await
    }

    pub async fn dump_route_table(&self) -> String {
        self.dht.dump(StatsKind::RouteTable).await
    }

    pub async fn dump_stats(&self) -> String {
        let mut out = self.dht.dump(StatsKind::Statistics).await;
        let rpc = self.rpc.stats();
        out.push_str(&format!(
            "  rpc_sent={}\n  rpc_received={}\n  rpc_retries={}\n  rpc_timeouts={}\n  rpc_pending={}\n  state={:?}\n",
            rpc.sent,
            rpc.received,
            rpc.retries,
            rpc.timeouts,
            rpc.pending,
            self.state()
        ));
        out
    }

    pub async fn stats(&self) -> DhtStats {
        DhtStats {
            table: self.dht.stats().await,
            rpc: self.rpc.stats(),
            state: self.state(),
        }
    }

    /// Announce departure, stop background work and release the transport.
    pub async fn close(&self) {
        let previous = self.state.swap(NodeState::Closed as u8, Ordering::AcqRel);
        if previous == NodeState::Closed as u8 {
            return;
        }
        if let Some((_, boot)) = self.bootstrap.lock().take() {
            boot.abort();
        }
        self.refresher.lock().stop();
        if let Some(cleaner) = self.cleaner.lock().take() {
            cleaner.abort();
        }

        let notified = self.dht.announce_shutdown().await;
        self.rpc.shutdown();
        self.dht.quit().await;
        info!(node = %self.contact.node_id, notified, "mojito node closed");
    }
}

impl<T: Transport> Drop for Mojito<T> {
    fn drop(&mut self) {
        if self.state() != NodeState::Closed {
            self.rpc.shutdown();
            if let Some(cleaner) = self.cleaner.get_mut().take() {
                cleaner.abort();
            }
            if let Some((_, boot)) = self.bootstrap.get_mut().take() {
                boot.abort();
            }
            self.dht.request_quit();
        }
    }
}
