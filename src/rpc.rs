//! # RPC Layer
//!
//! Request/response correlation over an unreliable datagram [`Transport`].
//!
//! ## Pending requests
//!
//! Each outbound request registers a `PendingRequest` keyed by a fresh
//! [`MessageId`]. The awaiting task owns a drop guard for that entry, so the
//! entry disappears on every exit path: response, retry exhaustion, or the
//! caller dropping the future. A response is delivered by removing the entry
//! and firing its oneshot, which makes completion happen at most once. A
//! response whose id has no entry (unknown, late, or duplicate) is counted and
//! discarded.
//!
//! ## Inbound path
//!
//! A single listener task reads datagrams. Undecodable datagrams are dropped,
//! responses are handed to their waiters, and requests are served on spawned
//! tasks so a slow handler never stalls the socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};
use crate::identity::{Contact, Key, MessageId, NodeId};
use crate::messages::{
    decode, encode, FindValueReply, Header, Message, MessageBody, StatsKind, StoreStatus,
    MAX_MESSAGE_SIZE,
};
use crate::protocols::{DhtNodeRpc, Pong, RequestHandler};
use crate::storage::Record;
use crate::transport::Transport;

/// A response matched to its request.
#[derive(Debug)]
pub struct Response {
    pub header: Header,
    pub body: MessageBody,
    pub from: SocketAddr,
    pub rtt: Duration,
}

struct PendingRequest {
    destination: SocketAddr,
    /// Node id the response must come from, when known.
    expected: Option<NodeId>,
    sent_at: Instant,
    first_sent_at: Instant,
    retry_count: u32,
    reply: oneshot::Sender<Response>,
}

/// Removes a pending entry when the owning request future ends or is dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<MessageId, PendingRequest>>,
    message_id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.message_id);
    }
}

#[derive(Default)]
struct RpcCounters {
    sent: AtomicU64,
    received: AtomicU64,
    responses: AtomicU64,
    requests_served: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    dropped_unknown: AtomicU64,
    dropped_mismatch: AtomicU64,
    dropped_malformed: AtomicU64,
}

/// Point-in-time copy of the RPC counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcStats {
    pub sent: u64,
    pub received: u64,
    pub responses: u64,
    pub requests_served: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub dropped_unknown: u64,
    pub dropped_mismatch: u64,
    pub dropped_malformed: u64,
    pub pending: usize,
}

struct RpcInner<T: Transport> {
    local_id: NodeId,
    request_timeout: Duration,
    max_retries: u32,
    /// `None` once the node has shut down and released its binding.
    transport: RwLock<Option<Arc<T>>>,
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
    counters: RpcCounters,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

pub struct RpcNode<T: Transport> {
    inner: Arc<RpcInner<T>>,
}

impl<T: Transport> Clone for RpcNode<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> RpcNode<T> {
    pub fn new(transport: T, local_id: NodeId, config: &DhtConfig) -> Self {
        Self {
            inner: Arc::new(RpcInner {
                local_id,
                request_timeout: config.request_timeout,
                max_retries: config.max_retries,
                transport: RwLock::new(Some(Arc::new(transport))),
                pending: Mutex::new(HashMap::new()),
                counters: RpcCounters::default(),
                listener: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local_id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let transport = self.inner.transport().ok_or(DhtError::Shutdown)?;
        Ok(transport.local_addr()?)
    }

    /// Start the inbound listener. Calling it again replaces the previous one.
    pub fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let transport = self.inner.transport().ok_or(DhtError::Shutdown)?;
        let task = tokio::spawn(listen(Arc::clone(&self.inner), transport, handler));
        if let Some(previous) = self.inner.listener.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Send `body` to `addr` and wait for the matching response.
    ///
    /// The request is resent with the same message id up to `max_retries`
    /// times. Dropping the returned future cancels the request and releases its
    /// pending entry.
    pub async fn request(
        &self,
        addr: SocketAddr,
        expected: Option<NodeId>,
        body: MessageBody,
    ) -> Result<Response> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(DhtError::Shutdown);
        }
        let message_id = MessageId::random();
        let kind = body.kind();
        let bytes = encode(&Message::new(Header::new(self.inner.local_id, message_id), body))?;

        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();
        self.inner.register(
            message_id,
            PendingRequest {
                destination: addr,
                expected,
                sent_at: now,
                first_sent_at: now,
                retry_count: 0,
                reply: tx,
            },
        )?;
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            message_id,
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            self.inner.send_bytes(&bytes, addr).await?;

            match timeout(self.inner.request_timeout, &mut rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => return Err(DhtError::Cancelled),
                Err(_) => {
                    if attempts > self.inner.max_retries {
                        self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        debug!(%addr, ?kind, attempts, "request timed out");
                        return Err(DhtError::RequestTimeout { addr, attempts });
                    }
                    self.inner.counters.retries.fetch_add(1, Ordering::Relaxed);
                    self.inner.mark_retry(&message_id);
                    trace!(%addr, ?kind, attempt = attempts + 1, "resending request");
                }
            }
        }
    }

    /// Send a message that expects no response.
    pub async fn send_oneway(&self, addr: SocketAddr, body: MessageBody) -> Result<()> {
        let bytes = encode(&Message::new(
            Header::new(self.inner.local_id, MessageId::random()),
            body,
        ))?;
        self.inner.send_bytes(&bytes, addr).await
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn stats(&self) -> RpcStats {
        let c = &self.inner.counters;
        RpcStats {
            sent: c.sent.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            responses: c.responses.load(Ordering::Relaxed),
            requests_served: c.requests_served.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            dropped_unknown: c.dropped_unknown.load(Ordering::Relaxed),
            dropped_mismatch: c.dropped_mismatch.load(Ordering::Relaxed),
            dropped_malformed: c.dropped_malformed.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }

    /// Stop the listener, fail every waiter with `Cancelled`, and release the
    /// transport binding.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        self.inner.transport.write().take();
        let cancelled = {
            let mut pending = self.inner.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        debug!(node = %self.inner.local_id.short(), cancelled, "rpc layer shut down");
    }
}

impl<T: Transport> RpcInner<T> {
    fn transport(&self) -> Option<Arc<T>> {
        self.transport.read().clone()
    }

    fn register(&self, message_id: MessageId, request: PendingRequest) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&message_id) {
            return Err(DhtError::DuplicateMessageId);
        }
        pending.insert(message_id, request);
        Ok(())
    }

    fn mark_retry(&self, message_id: &MessageId) {
        if let Some(entry) = self.pending.lock().get_mut(message_id) {
            entry.retry_count += 1;
            entry.sent_at = Instant::now();
        }
    }

    async fn send_bytes(&self, bytes: &[u8], addr: SocketAddr) -> Result<()> {
        let transport = self.transport().ok_or(DhtError::Shutdown)?;
        transport.send_to(bytes, addr).await?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Hand a response to its waiter. Returns false when it was dropped.
    fn complete(&self, header: Header, body: MessageBody, from: SocketAddr) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            let sender_ok = pending
                .get(&header.message_id)
                .map(|entry| entry.expected.map_or(true, |id| id == header.sender));
            match sender_ok {
                None => {
                    self.counters.dropped_unknown.fetch_add(1, Ordering::Relaxed);
                    trace!(%from, id = ?header.message_id, "dropping response with unknown message id");
                    return false;
                }
                Some(false) => {
                    self.counters.dropped_mismatch.fetch_add(1, Ordering::Relaxed);
                    debug!(%from, sender = %header.sender.short(), "dropping response from unexpected node");
                    return false;
                }
                Some(true) => pending.remove(&header.message_id),
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        self.counters.responses.fetch_add(1, Ordering::Relaxed);
        trace!(
            destination = %entry.destination,
            retries = entry.retry_count,
            "response matched pending request"
        );
        let response = Response {
            header,
            body,
            from,
            rtt: entry.sent_at.elapsed().min(entry.first_sent_at.elapsed()),
        };
        entry.reply.send(response).is_ok()
    }
}

async fn listen<T: Transport>(
    inner: Arc<RpcInner<T>>,
    transport: Arc<T>,
    handler: Arc<dyn RequestHandler>,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, from) = match transport.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) if is_transient(&e) => {
                trace!(error = %e, "transient receive error");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "rpc listener stopped");
                break;
            }
        };
        inner.counters.received.fetch_add(1, Ordering::Relaxed);

        let message = match decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                inner.counters.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                debug!(%from, error = %e, "dropping undecodable datagram");
                continue;
            }
        };
        if message.header.sender == inner.local_id {
            trace!(%from, "ignoring message carrying our own node id");
            continue;
        }

        if message.body.kind().is_response() {
            inner.complete(message.header, message.body, from);
            continue;
        }

        let sender = Contact::new(message.header.sender, from);
        let message_id = message.header.message_id;
        let handler = Arc::clone(&handler);
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let Some(reply) = handler.handle_request(sender, message.body).await else {
                return;
            };
            inner.counters.requests_served.fetch_add(1, Ordering::Relaxed);
            let header = Header::new(inner.local_id, message_id);
            match encode(&Message::new(header, reply)) {
                Ok(bytes) => {
                    if let Err(e) = inner.send_bytes(&bytes, from).await {
                        debug!(%from, error = %e, "failed to send response");
                    }
                }
                Err(e) => warn!(%from, error = %e, "failed to encode response"),
            }
        });
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
    )
}

#[async_trait]
impl<T: Transport> DhtNodeRpc for RpcNode<T> {
    async fn ping(&self, addr: SocketAddr) -> Result<Pong> {
        let response = self.request(addr, None, MessageBody::Ping { shutdown: false }).await?;
        match response.body {
            MessageBody::Pong {
                external_addr,
                estimated_size,
            } => Ok(Pong {
                responder: Contact::new(response.header.sender, addr),
                external_addr,
                estimated_size,
            }),
            other => Err(DhtError::UnexpectedResponse(other.kind())),
        }
    }

    async fn find_node(&self, to: &Contact, target: NodeId) -> Result<Vec<Contact>> {
        let response = self
            .request(to.addr, Some(to.node_id), MessageBody::FindNode { target })
            .await?;
        match response.body {
            MessageBody::FindNodeResponse { contacts } => Ok(contacts),
            other => Err(DhtError::UnexpectedResponse(other.kind())),
        }
    }

    async fn find_value(&self, to: &Contact, key: Key) -> Result<FindValueReply> {
        let response = self
            .request(to.addr, Some(to.node_id), MessageBody::FindValue { key })
            .await?;
        match response.body {
            MessageBody::FindValueResponse { reply } => Ok(reply),
            other => Err(DhtError::UnexpectedResponse(other.kind())),
        }
    }

    async fn store(&self, to: &Contact, record: Record) -> Result<StoreStatus> {
        let response = self
            .request(to.addr, Some(to.node_id), MessageBody::Store { record })
            .await?;
        match response.body {
            MessageBody::StoreResponse { status } => Ok(status),
            other => Err(DhtError::UnexpectedResponse(other.kind())),
        }
    }

    async fn stats(&self, to: &Contact, kind: StatsKind) -> Result<String> {
        let response = self
            .request(to.addr, Some(to.node_id), MessageBody::Stats { kind })
            .await?;
        match response.body {
            MessageBody::StatsResponse { text } => Ok(text),
            other => Err(DhtError::UnexpectedResponse(other.kind())),
        }
    }

    async fn notify_shutdown(&self, to: &Contact) -> Result<()> {
        self.send_oneway(to.addr, MessageBody::Ping { shutdown: true }).await
    }
}
