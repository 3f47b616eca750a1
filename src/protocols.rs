//! Protocol trait definitions.
//!
//! [`DhtNodeRpc`] is the outbound seam: the DHT core asks a remote node
//! something and awaits the answer. [`RequestHandler`] is the inbound seam:
//! the RPC listener hands a decoded request to whoever serves it.
//!
//! Keeping both as traits lets the lookup and maintenance logic run against an
//! in-memory network in tests and against [`crate::rpc::RpcNode`] in production.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::{Contact, Key, NodeId};
use crate::messages::{FindValueReply, MessageBody, StatsKind, StoreStatus};
use crate::storage::Record;

/// What a successful ping tells us about the responder and ourselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pong {
    pub responder: Contact,
    /// Our address as seen by the responder.
    pub external_addr: SocketAddr,
    pub estimated_size: u64,
}

/// Outbound DHT operations.
#[async_trait]
pub trait DhtNodeRpc: Send + Sync + 'static {
    /// Ping an address. The responder's node id is learned from the reply, so
    /// seeds can be pinged before their id is known.
    async fn ping(&self, addr: SocketAddr) -> Result<Pong>;

    /// Ask `to` for the contacts it knows closest to `target`.
    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>>;

    /// Ask `to` for the record under `key`, or its closest contacts.
    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply>;

    async fn store(&self, to: &Contact, record: Record) -> Result<StoreStatus>;

    /// Fetch a diagnostic dump from `to`.
    async fn stats(&self, to: &Contact, kind: StatsKind) -> Result<String>;

    /// Tell `to` that this node is leaving. No reply is awaited.
    async fn notify_shutdown(&self, to: &Contact) -> Result<()>;
}

/// Serves decoded inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Returns the response body, or `None` when no reply should be sent.
    async fn handle_request(&self, from: Contact, body: MessageBody) -> Option<MessageBody>;
}
