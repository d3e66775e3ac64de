//! # Client
//!
//! Client half of the dual-channel handshake plus the reconnect and
//! outbound-cache state machine.
//!
//! The client counts as connected only while its reliable channel is open, the
//! best-effort channel has been opened for the issued token, and the server has
//! confirmed establishment. Failures never reconnect inline; they arm a
//! `needs_reconnect` flag that [`Client::tick`] (or the driver from
//! [`Client::spawn_driver`]) acts on.
//!
//! Messages sent while disconnected are handled by the configured
//! [`CacheMode`](crate::config::CacheMode): cached in FIFO order and drained
//! after the next successful connect, or dropped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::ReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::codec::RegistrarCodec;
use crate::core::message::{Envelope, HandshakeToken, Message, NetworkMessage, Transport};
use crate::core::schema::MessageSchema;
use crate::error::{ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::session::UserData;
use crate::transport::pipeline::{
    read_datagram, read_reliable, run_datagram_writer, run_reliable_writer, ConnectedDatagram,
};
use crate::transport::{tls, BoxedStream};
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::TOKEN_RESEND_INTERVAL;

/// What [`Client::send`] did with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued on a live channel
    Sent,
    /// Parked in the outbound cache until the next connect
    Cached,
    /// Discarded by the cache policy
    Dropped,
}

/// Cheaply cloneable handle; clones share one connection
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct Connection {
    generation: u64,
    reliable: mpsc::UnboundedSender<Message>,
    best_effort: Option<mpsc::UnboundedSender<Message>>,
    cancel: CancellationToken,
}

struct ClientInner {
    config: ClientConfig,
    transport: TransportConfig,
    schema: Arc<MessageSchema>,
    tls: Option<TlsConnector>,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    reliable_open: AtomicBool,
    handshake_complete: AtomicBool,
    pending_establish: AtomicBool,
    needs_reconnect: AtomicBool,
    disconnecting: AtomicBool,
    cache: Mutex<VecDeque<Message>>,
    established: Notify,
    connect_lock: tokio::sync::Mutex<()>,
    listeners: Dispatcher<Client>,
    user_data: UserData,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    pub fn new(config: ClientConfig, transport: TransportConfig, schema: MessageSchema) -> Result<Self> {
        let mut problems = config.validate();
        problems.extend(transport.validate());
        if !problems.is_empty() {
            return Err(ProtocolError::ConfigError(problems.join("; ")));
        }
        let tls = if config.tls {
            Some(tls::client_connector(&config)?)
        } else {
            None
        };

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                schema: Arc::new(schema),
                tls,
                connection: Mutex::new(None),
                generation: AtomicU64::new(0),
                reliable_open: AtomicBool::new(false),
                handshake_complete: AtomicBool::new(false),
                pending_establish: AtomicBool::new(false),
                needs_reconnect: AtomicBool::new(false),
                disconnecting: AtomicBool::new(false),
                cache: Mutex::new(VecDeque::new()),
                established: Notify::new(),
                connect_lock: tokio::sync::Mutex::new(()),
                listeners: Dispatcher::new(),
                user_data: UserData::default(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Message and connection listeners; callbacks receive this client
    pub fn listeners(&self) -> &Dispatcher<Client> {
        &self.inner.listeners
    }

    pub fn user_data(&self) -> &UserData {
        &self.inner.user_data
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn needs_reconnect(&self) -> bool {
        self.inner.needs_reconnect.load(Ordering::SeqCst)
    }

    /// Messages waiting in the outbound cache
    pub fn cached_len(&self) -> usize {
        lock(&self.inner.cache).len()
    }

    /// Open both channels and complete the handshake.
    ///
    /// Any previous connection is closed first. On success the outbound cache
    /// is drained; on failure the reconnect flag is armed.
    #[instrument(skip(self), fields(server = %self.inner.config.reliable_addr()))]
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.connect_lock.lock().await;
        let _timer = Timer::start("client_connect");
        inner.disconnecting.store(false, Ordering::SeqCst);
        if inner.detach(None) == Some(true) {
            inner.fire_disconnect();
        }

        let attempt = tokio::time::timeout(inner.config.connection_timeout, inner.establish()).await;
        let result = attempt.unwrap_or(Err(ProtocolError::ConnectionTimeout));

        match result {
            Ok(()) => {
                inner.needs_reconnect.store(false, Ordering::SeqCst);
                let drained = {
                    let mut cache = lock(&inner.cache);
                    let before = cache.len();
                    inner.drain(&mut cache);
                    before - cache.len()
                };
                info!(service = %inner.config.service, drained, "Connected");
                Ok(())
            }
            Err(e) => {
                inner.detach(None);
                inner.arm_reconnect();
                warn!(error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// Route `message` by its transport, or apply the cache policy when offline
    pub fn send(&self, message: Message) -> SendOutcome {
        let inner = &self.inner;
        let mut cache = lock(&inner.cache);
        if inner.is_connected() && inner.drain(&mut cache) {
            match inner.route(message) {
                Ok(()) => return SendOutcome::Sent,
                Err(message) => {
                    inner.arm_reconnect();
                    return inner.park(&mut cache, message);
                }
            }
        }
        inner.park(&mut cache, message)
    }

    /// Serialize and send a typed message
    pub fn send_message<M: NetworkMessage>(&self, message: &M) -> Result<SendOutcome> {
        Ok(self.send(Message::application(message)?))
    }

    /// One step of the reconnect driver
    pub async fn tick(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disconnecting.load(Ordering::SeqCst) {
            return Ok(());
        }
        if inner.needs_reconnect.load(Ordering::SeqCst) {
            global_metrics().reconnect_attempt();
            debug!("Reconnecting");
            self.connect().await?;
        }
        if inner.is_connected() {
            inner.drain(&mut lock(&inner.cache));
        }
        Ok(())
    }

    /// Run [`tick`](Self::tick) every `reconnect_interval` until the client is dropped
    pub fn spawn_driver(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.reconnect_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = (Client { inner }).tick().await {
                    debug!(error = %e, "Reconnect attempt failed");
                }
            }
        })
    }

    /// Close both channels without arming a reconnect
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.disconnecting.store(true, Ordering::SeqCst);
        inner.needs_reconnect.store(false, Ordering::SeqCst);
        if let Some(was_connected) = inner.detach(None) {
            info!("Disconnected");
            if was_connected {
                inner.fire_disconnect();
            }
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.inner.config.reliable_addr())
            .field("connected", &self.is_connected())
            .field("needs_reconnect", &self.needs_reconnect())
            .field("cached", &self.cached_len())
            .finish()
    }
}

impl ClientInner {
    fn handle(self: &Arc<Self>) -> Client {
        Client {
            inner: Arc::clone(self),
        }
    }

    fn codec(&self) -> RegistrarCodec {
        RegistrarCodec::new(Arc::clone(&self.schema)).with_max_frame_size(self.transport.max_frame_size)
    }

    /// Codec for the best-effort channel; frames must fit one receive buffer
    fn datagram_codec(&self) -> RegistrarCodec {
        RegistrarCodec::new(Arc::clone(&self.schema))
            .with_max_frame_size(self.transport.max_datagram_frame())
    }

    fn is_connected(&self) -> bool {
        self.reliable_open.load(Ordering::SeqCst)
            && self.handshake_complete.load(Ordering::SeqCst)
            && !self.pending_establish.load(Ordering::SeqCst)
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    fn arm_reconnect(&self) {
        if !self.disconnecting.load(Ordering::SeqCst) {
            self.needs_reconnect.store(true, Ordering::SeqCst);
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        let tcp = TcpStream::connect(self.config.reliable_addr()).await?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }
        let stream: BoxedStream = match &self.tls {
            Some(connector) => tls::connect(connector, &self.config.address, tcp).await?,
            None => Box::new(tcp),
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let reader = FramedRead::new(read_half, self.codec());
        let writer = FramedWrite::new(write_half, self.codec());

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let established = self.established.notified();
        tokio::pin!(established);
        established.as_mut().enable();

        *lock(&self.connection) = Some(Connection {
            generation,
            reliable: tx,
            best_effort: None,
            cancel: cancel.clone(),
        });
        self.handshake_complete.store(false, Ordering::SeqCst);
        self.pending_establish.store(true, Ordering::SeqCst);
        self.reliable_open.store(true, Ordering::SeqCst);

        let inner = Arc::clone(self);
        let write_idle = self.transport.write_idle_timeout;
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_reliable_writer(writer, rx, write_idle, writer_cancel).await {
                inner.connection_lost(generation, &e);
            }
        });
        tokio::spawn(Arc::clone(self).read_loop(reader, generation, cancel));

        established.await;
        if self.is_current(generation) && self.is_connected() {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed)
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: FramedRead<ReadHalf<BoxedStream>, RegistrarCodec>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let read_idle = self.transport.read_idle_timeout;
        let result = loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                message = read_reliable(&mut reader, read_idle) => message,
            };
            match message {
                Ok(Message::HandshakeToken(HandshakeToken {
                    token,
                    from_server: true,
                })) => {
                    if let Err(e) = self.open_best_effort(generation, token, &cancel).await {
                        break Err(e);
                    }
                }
                Ok(Message::ConnectionEstablished) => self.on_established(generation),
                Ok(Message::Application(envelope)) => self.dispatch(&envelope),
                Ok(other) => debug!(name = other.name(), "Ignoring unexpected control message"),
                Err(e) => break Err(e),
            }
        };
        match result {
            Ok(()) => trace!(generation, "Reliable reader stopped"),
            Err(e) => self.connection_lost(generation, &e),
        }
    }

    /// Open the datagram socket, start its loops and begin announcing `token`
    async fn open_best_effort(
        self: &Arc<Self>,
        generation: u64,
        token: String,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target = self.config.best_effort_addr();
        let remote = tokio::net::lookup_host(&target)
            .await?
            .next()
            .ok_or_else(|| ProtocolError::TransportError(format!("could not resolve {target}")))?;
        let link = Arc::new(ConnectedDatagram::connect(remote, self.transport.datagram_buffer_size).await?);

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut slot = lock(&self.connection);
            match slot.as_mut() {
                Some(connection) if connection.generation == generation => {
                    connection.best_effort = Some(tx.clone());
                }
                _ => return Ok(()),
            }
        }
        self.handshake_complete.store(true, Ordering::SeqCst);

        let inner = Arc::clone(self);
        let writer_link = Arc::clone(&link);
        let codec = self.datagram_codec();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_datagram_writer(writer_link, codec, rx, writer_cancel).await {
                inner.connection_lost(generation, &e);
            }
        });
        tokio::spawn(Arc::clone(self).datagram_read_loop(link, generation, cancel.clone()));
        tokio::spawn(Arc::clone(self).announce_token(tx, token, generation, cancel.clone()));

        debug!(%remote, "Best-effort channel open");
        Ok(())
    }

    /// Repeat the token on the best-effort channel until the server confirms
    async fn announce_token(
        self: Arc<Self>,
        outbound: mpsc::UnboundedSender<Message>,
        token: String,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let message = Message::HandshakeToken(HandshakeToken {
            token,
            from_server: false,
        });
        let mut interval = tokio::time::interval(TOKEN_RESEND_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            if !self.pending_establish.load(Ordering::SeqCst) || !self.is_current(generation) {
                return;
            }
            if outbound.send(message.clone()).is_err() {
                return;
            }
            trace!(generation, "Association token sent");
        }
    }

    async fn datagram_read_loop(
        self: Arc<Self>,
        link: Arc<ConnectedDatagram>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let mut codec = self.datagram_codec();
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return,
                message = read_datagram(link.as_ref(), &mut codec) => message,
            };
            match message {
                Ok(Message::Application(envelope)) => self.dispatch(&envelope),
                Ok(other) => debug!(name = other.name(), "Ignoring datagram control message"),
                Err(e) => {
                    if e.is_desync() {
                        global_metrics().protocol_error();
                    }
                    self.connection_lost(generation, &e);
                    return;
                }
            }
        }
    }

    fn on_established(self: &Arc<Self>, generation: u64) {
        if !self.is_current(generation) {
            return;
        }
        if self.pending_establish.swap(false, Ordering::SeqCst) {
            debug!(generation, "Server confirmed establishment");
            self.established.notify_waiters();
            if let Err(e) = self.listeners.fire_connect(&self.handle()) {
                warn!(error = %e, "Connect listeners failed");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: &Envelope) {
        if let Err(e) = self.listeners.dispatch(&self.handle(), envelope) {
            warn!(error = %e, "Client listener dispatch failed");
        }
    }

    fn fire_disconnect(self: &Arc<Self>) {
        if let Err(e) = self.listeners.fire_disconnect(&self.handle()) {
            warn!(error = %e, "Disconnect listeners failed");
        }
    }

    /// Take the live connection, or only the one with `generation` when given.
    ///
    /// Returns whether the detached connection was fully connected, or `None`
    /// when nothing was detached.
    fn detach(&self, generation: Option<u64>) -> Option<bool> {
        let connection = {
            let mut slot = lock(&self.connection);
            match (slot.as_ref(), generation) {
                (Some(current), Some(wanted)) if current.generation != wanted => return None,
                _ => slot.take()?,
            }
        };
        let was_connected = self.is_connected();
        connection.cancel.cancel();
        self.reliable_open.store(false, Ordering::SeqCst);
        self.handshake_complete.store(false, Ordering::SeqCst);
        self.pending_establish.store(false, Ordering::SeqCst);
        self.established.notify_waiters();
        Some(was_connected)
    }

    fn connection_lost(self: &Arc<Self>, generation: u64, reason: &ProtocolError) {
        let Some(was_connected) = self.detach(Some(generation)) else {
            return;
        };
        self.arm_reconnect();
        if reason.is_disconnect() {
            info!(error = %reason, "Connection lost");
        } else {
            warn!(error = %reason, "Connection failed");
        }
        if was_connected {
            self.fire_disconnect();
        }
    }

    /// Queue on the live channel for the message's transport; hands the message back on failure
    fn route(&self, message: Message) -> std::result::Result<(), Message> {
        let slot = lock(&self.connection);
        let Some(connection) = slot.as_ref() else {
            return Err(message);
        };
        let sender = match message.transport() {
            Transport::Reliable => &connection.reliable,
            Transport::BestEffort => match &connection.best_effort {
                Some(sender) => sender,
                None => return Err(message),
            },
        };
        sender.send(message).map_err(|e| e.0)
    }

    /// Send cached messages in order; false if any remain
    fn drain(&self, cache: &mut VecDeque<Message>) -> bool {
        while let Some(message) = cache.pop_front() {
            if !self.is_connected() {
                cache.push_front(message);
                return false;
            }
            if let Err(message) = self.route(message) {
                cache.push_front(message);
                self.arm_reconnect();
                return false;
            }
        }
        true
    }

    fn park(&self, cache: &mut VecDeque<Message>, message: Message) -> SendOutcome {
        if self.config.cache_mode.caches(message.transport()) {
            trace!(name = message.name(), "Caching message while offline");
            cache.push_back(message);
            global_metrics().message_cached();
            SendOutcome::Cached
        } else {
            debug!(name = message.name(), "Dropping message while offline");
            SendOutcome::Dropped
        }
    }
}
