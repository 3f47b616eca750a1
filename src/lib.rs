//! # Mojito - Kademlia Distributed Hash Table
//!
//! Mojito is a Kademlia-style DHT over UDP:
//!
//! - **Identity**: 160-bit node ids derived from Ed25519 public keys, XOR metric
//! - **Routing**: prefix-split buckets with replacement caches and eviction probes
//! - **RPC**: request/response matching by message id with timeouts and resends
//! - **Lookup**: parallel iterative lookup with `alpha` in flight and boosting
//! - **Storage**: signed records replicated to the `k` closest nodes
//!
//! ## Architecture
//!
//! The DHT core follows the actor pattern: [`DhtNode`] is a cheap-to-clone
//! handle and a private actor owns the route table, the record store and the
//! size estimator. [`Mojito`] ties a [`Transport`] to the RPC layer and the
//! DHT core and runs the background tasks.
//!
//! ## Security Model
//!
//! - Records are signed by their publisher; unverifiable values are never
//!   returned and never stored
//! - STORE is only accepted from senders already in the route table
//! - Responses are matched on message id and, when known, on the sender id
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | `Mojito` facade: lifecycle, bootstrap, shutdown, diagnostics |
//! | `identity` | Node ids, distances, message ids, keypairs, contacts |
//! | `crypto` | Domain-separated record signatures |
//! | `routing` | Route table: buckets, replacement caches, failure accounting |
//! | `rpc` | Pending-request table, retries and the inbound listener |
//! | `lookup` | Iterative node and value lookup |
//! | `dht` | DHT actor: request handling, store, get, bootstrap |
//! | `refresher` | Periodic stale-contact pings and bucket refreshes |
//! | `estimator` | Network size estimation |
//! | `storage` | Signed records and the local record store |
//! | `transport` | UDP and in-memory datagram transports |
//! | `messages` | Wire format |

mod config;
mod crypto;
mod dht;
mod error;
mod estimator;
mod identity;
mod lookup;
mod messages;
mod node;
mod protocols;
mod refresher;
mod routing;
mod rpc;
mod storage;
mod transport;

pub use config::DhtConfig;
pub use crypto::SignatureError;
pub use dht::{BootstrapResult, DhtNode, StoreResult, TableStats, ValueEntity};
pub use error::{DhtError, Result};
pub use estimator::SizeEstimator;
pub use identity::{Contact, Distance, Key, Keypair, MessageId, NodeId, KUID_BITS, KUID_LENGTH};
pub use lookup::{LookupKind, LookupOutcome};
pub use messages::{FindValueReply, MessageBody, MessageKind, StatsKind, StoreStatus};
pub use node::{DhtStats, Mojito, NodeEntity, NodeState, PingResult};
pub use protocols::{DhtNodeRpc, Pong, RequestHandler};
pub use refresher::{BucketRefresher, RefreshReport};
pub use routing::{ContactState, RouteTable, SelectMode};
pub use rpc::{RpcNode, RpcStats};
pub use storage::{MemoryStorage, PutOutcome, Record, Storage};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};
