//! # Datagram Transport
//!
//! The DHT core never touches sockets directly. It talks to a [`Transport`]:
//! send a datagram to an address, receive the next datagram. Binding and
//! unbinding belong to the transport; the core releases a binding by dropping
//! its last handle.
//!
//! Two implementations ship with the crate:
//!
//! - [`UdpTransport`]: a tokio `UdpSocket`
//! - [`MemoryNetwork`] / [`MemoryTransport`]: an in-process datagram network
//!   with per-address reachability switches, used to simulate many nodes in
//!   one process
//!
//! Both behave like UDP: sending to an address nobody listens on succeeds and
//! the datagram is silently lost.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()>;

    /// Wait for the next datagram, copying it into `buf`.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

// ============================================================================
// UDP
// ============================================================================

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.socket.send_to(bytes, addr).await.map(|_| ())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

// ============================================================================
// In-memory network
// ============================================================================

type Datagram = (SocketAddr, Vec<u8>);

/// Shared switchboard for [`MemoryTransport`] endpoints.
pub struct MemoryNetwork {
    endpoints: RwLock<HashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
    unreachable: RwLock<HashSet<SocketAddr>>,
    next_port: AtomicU16,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
            next_port: AtomicU16::new(10_000),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Attach a new endpoint on the next free loopback port.
    pub fn bind(self: &Arc<Self>) -> MemoryTransport {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            if let Ok(transport) = self.bind_addr(addr) {
                return transport;
            }
        }
    }

    pub fn bind_addr(self: &Arc<Self>, addr: SocketAddr) -> io::Result<MemoryTransport> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&addr) {
            return Err(io::Error::new(io::ErrorKind::AddrInUse, addr.to_string()));
        }
        endpoints.insert(addr, tx);
        Ok(MemoryTransport {
            addr,
            network: Arc::clone(self),
            inbox: Mutex::new(rx),
        })
    }

    /// Make an endpoint drop everything sent to or from it (or restore it).
    pub fn set_reachable(&self, addr: SocketAddr, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(&addr);
        } else {
            unreachable.insert(addr);
        }
    }

    pub fn is_bound(&self, addr: &SocketAddr) -> bool {
        self.endpoints.read().contains_key(addr)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, bytes: &[u8]) {
        {
            let unreachable = self.unreachable.read();
            if unreachable.contains(&from) || unreachable.contains(&to) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(%from, %to, "memory network dropped datagram: unreachable");
                return;
            }
        }
        let sent = self
            .endpoints
            .read()
            .get(&to)
            .map(|tx| tx.send((from, bytes.to_vec())).is_ok())
            .unwrap_or(false);
        if sent {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn unbind(&self, addr: &SocketAddr) {
        self.endpoints.write().remove(addr);
    }
}

pub struct MemoryTransport {
    addr: SocketAddr,
    network: Arc<MemoryNetwork>,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<()> {
        self.network.deliver(self.addr, addr, bytes);
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut inbox = self.inbox.lock().await;
        let (from, data) = inbox
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint unbound"))?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.unbind(&self.addr);
    }
}
