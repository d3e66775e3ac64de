//! # Best-effort multiplexer
//!
//! Presents one UDP port as a set of per-peer virtual channels, the way a TCP
//! listener presents accepted streams.
//!
//! One or more real sockets share the port (`SO_REUSEPORT` on unix, a single
//! socket elsewhere). Each socket runs a receive loop that routes every datagram
//! by source address into that peer's [`VirtualChannel`]. The first datagram
//! from an address creates the channel and surfaces it through
//! [`DatagramMux::accept`]. Closing a channel removes it from the table if it
//! is still the current entry for its address, so the next datagram from that
//! address creates and surfaces a fresh channel. A closed entry found by the
//! receive loop before removal is replaced the same way.
//!
//! Outbound datagrams for a peer always leave through the same socket, picked by
//! hashing the remote address.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::DATAGRAM_BUFFER_SIZE;
use crate::error::{ProtocolError, Result};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::RECV_RETRY_DELAY;

/// Binding options for [`DatagramMux::bind`]
#[derive(Debug, Clone)]
pub struct MuxOptions {
    /// Real sockets sharing the port. Forced to 1 without `SO_REUSEPORT`.
    pub sockets: usize,
    /// Receive buffer for a single datagram; longer datagrams are truncated
    pub buffer_size: usize,
    /// Per-channel inbox bound; newest datagrams are dropped once full
    pub queue_limit: Option<usize>,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            sockets: 1,
            buffer_size: DATAGRAM_BUFFER_SIZE,
            queue_limit: None,
        }
    }
}

struct MuxShared {
    sockets: Vec<Arc<UdpSocket>>,
    channels: DashMap<SocketAddr, Arc<VirtualChannel>>,
    queue_limit: Option<usize>,
    next_id: AtomicU64,
}

impl MuxShared {
    fn socket_for(&self, remote: &SocketAddr) -> &Arc<UdpSocket> {
        let mut hasher = DefaultHasher::new();
        remote.hash(&mut hasher);
        let index = (hasher.finish() % self.sockets.len() as u64) as usize;
        &self.sockets[index]
    }

    fn new_channel(self: &Arc<Self>, remote: SocketAddr) -> Arc<VirtualChannel> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        trace!(%remote, id, "Creating virtual channel");
        Arc::new(VirtualChannel {
            id,
            remote,
            inbox: Mutex::new(VecDeque::new()),
            queue_limit: self.queue_limit,
            open: AtomicBool::new(true),
            is_new: AtomicBool::new(true),
            notify: Notify::new(),
            mux: Arc::downgrade(self),
        })
    }

    /// Deliver one datagram, creating or replacing the sender's channel
    fn route(
        self: &Arc<Self>,
        from: SocketAddr,
        payload: Bytes,
        accept_tx: &mpsc::UnboundedSender<Arc<VirtualChannel>>,
    ) {
        let channel = {
            let mut entry = self
                .channels
                .entry(from)
                .or_insert_with(|| self.new_channel(from));
            if !entry.is_open() {
                *entry = self.new_channel(from);
            }
            Arc::clone(entry.value())
        };

        if !channel.push(payload) {
            global_metrics().datagram_dropped();
            trace!(%from, "Inbox full, datagram dropped");
        }

        if channel.take_is_new() && accept_tx.send(Arc::clone(&channel)).is_err() {
            channel.close();
        }
    }
}

/// A UDP port demultiplexed into per-peer channels
pub struct DatagramMux {
    shared: Arc<MuxShared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<VirtualChannel>>>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl DatagramMux {
    /// Bind the port and start one receive loop per socket
    #[instrument(skip(options), fields(sockets = options.sockets))]
    pub async fn bind(addr: SocketAddr, options: MuxOptions) -> Result<Self> {
        let wanted = options.sockets.max(1);
        let count = if reuse_port_supported() {
            wanted
        } else {
            if wanted > 1 {
                warn!(wanted, "SO_REUSEPORT unavailable, using a single socket");
            }
            1
        };
        let shared_port = count > 1;

        let first = bind_socket(addr, shared_port)?;
        let local_addr = first.local_addr()?;
        let mut sockets = vec![Arc::new(UdpSocket::from_std(first)?)];
        for _ in 1..count {
            let socket = bind_socket(local_addr, shared_port)?;
            sockets.push(Arc::new(UdpSocket::from_std(socket)?));
        }

        let shared = Arc::new(MuxShared {
            sockets,
            channels: DashMap::new(),
            queue_limit: options.queue_limit,
            next_id: AtomicU64::new(0),
        });
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        for socket in &shared.sockets {
            tokio::spawn(receive_loop(
                Arc::clone(&shared),
                Arc::clone(socket),
                accept_tx.clone(),
                options.buffer_size,
                cancel.clone(),
            ));
        }

        info!(%local_addr, sockets = count, "Best-effort port bound");
        Ok(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            local_addr,
            cancel,
        })
    }

    /// Wait for the next channel to receive its first datagram.
    ///
    /// Returns `None` once the mux has shut down.
    pub async fn accept(&self) -> Option<Arc<VirtualChannel>> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            channel = rx.recv() => channel,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn socket_count(&self) -> usize {
        self.shared.sockets.len()
    }

    /// Current table entry for `remote`, open or not
    pub fn channel(&self, remote: &SocketAddr) -> Option<Arc<VirtualChannel>> {
        self.shared
            .channels
            .get(remote)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Entries in the table, including closed ones not yet replaced
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Stop every receive loop and close all channels
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let channels: Vec<_> = self
            .shared
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in channels {
            channel.close();
        }
        debug!(local_addr = %self.local_addr, "Best-effort port closed");
    }
}

impl Drop for DatagramMux {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for DatagramMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramMux")
            .field("local_addr", &self.local_addr)
            .field("sockets", &self.shared.sockets.len())
            .field("channels", &self.shared.channels.len())
            .finish()
    }
}

/// One peer's view of the shared best-effort port
pub struct VirtualChannel {
    id: u64,
    remote: SocketAddr,
    inbox: Mutex<VecDeque<Bytes>>,
    queue_limit: Option<usize>,
    open: AtomicBool,
    is_new: AtomicBool,
    notify: Notify,
    mux: Weak<MuxShared>,
}

impl VirtualChannel {
    /// Unique for the lifetime of the mux
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Datagrams waiting to be read
    pub fn pending(&self) -> usize {
        self.lock_inbox().len()
    }

    /// Next inbound datagram, or `None` once closed
    pub async fn recv(&self) -> Option<Bytes> {
        loop {
            if !self.is_open() {
                return None;
            }
            if let Some(payload) = self.lock_inbox().pop_front() {
                return Some(payload);
            }
            self.notify.notified().await;
        }
    }

    /// Send one datagram to the peer
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let shared = self.mux.upgrade().ok_or(ProtocolError::ConnectionClosed)?;
        let socket = Arc::clone(shared.socket_for(&self.remote));
        socket.send_to(payload, self.remote).await?;
        Ok(())
    }

    /// Close the channel and remove it from the table if it is still the
    /// current entry for its address. Idempotent.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.mux.upgrade() {
            shared
                .channels
                .remove_if(&self.remote, |_, current| current.id == self.id);
        }
        self.lock_inbox().clear();
        self.notify.notify_one();
        trace!(remote = %self.remote, id = self.id, "Virtual channel closed");
    }

    fn push(&self, payload: Bytes) -> bool {
        {
            let mut inbox = self.lock_inbox();
            if matches!(self.queue_limit, Some(limit) if inbox.len() >= limit) {
                return false;
            }
            inbox.push_back(payload);
        }
        self.notify.notify_one();
        true
    }

    /// True exactly once, for whichever caller observes the channel first
    fn take_is_new(&self) -> bool {
        self.is_new
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock_inbox(&self) -> MutexGuard<'_, VecDeque<Bytes>> {
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

async fn receive_loop(
    shared: Arc<MuxShared>,
    socket: Arc<UdpSocket>,
    accept_tx: mpsc::UnboundedSender<Arc<VirtualChannel>>,
    buffer_size: usize,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, from)) => {
                let payload = Bytes::copy_from_slice(&buf[..len]);
                shared.route(from, payload, &accept_tx);
            }
            Err(e) => {
                warn!(error = %e, "UDP receive failed; retrying");
                tokio::time::sleep(RECV_RETRY_DELAY).await;
            }
        }
    }
}

fn bind_socket(addr: SocketAddr, reuse_port: bool) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if reuse_port {
        set_reuse_port(&socket)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn reuse_port_supported() -> bool {
    true
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn reuse_port_supported() -> bool {
    false
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn set_reuse_port(socket: &Socket) -> Result<()> {
    socket.set_reuse_port(true)?;
    Ok(())
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn set_reuse_port(_socket: &Socket) -> Result<()> {
    Ok(())
}
