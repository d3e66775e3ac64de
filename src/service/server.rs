//! # Server
//!
//! Accepts reliable connections, issues association tokens and binds each
//! session to its best-effort flow.
//!
//! ## Session lifecycle
//! 1. A TCP (optionally TLS) connection is admitted if the server is not
//!    blocking and a slot below `max_connections` is free.
//! 2. The session sends a one-time token over the reliable channel and waits in
//!    `AwaitingAssociation`.
//! 3. The first datagram of a new virtual channel must be a pending token. A
//!    match binds the channel to the session, fires connect listeners and sends
//!    connection-established; anything else closes just that virtual channel.
//! 4. Any failure, idle timeout, explicit disconnect or shutdown tears the
//!    session down and releases its slot.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ServerConfig, TransportConfig};
use crate::core::codec::RegistrarCodec;
use crate::core::message::{Envelope, HandshakeToken, Message, NetworkMessage};
use crate::core::schema::MessageSchema;
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{generate_token, PendingTokens};
use crate::protocol::session::{BestEffortBinding, Session, SessionId, SessionState};
use crate::transport::multiplex::{DatagramMux, MuxOptions, VirtualChannel};
use crate::transport::pipeline::{
    read_datagram, read_reliable, run_datagram_writer, run_reliable_writer,
};
use crate::transport::{tls, BoxedStream};
use crate::utils::metrics::global_metrics;
use crate::utils::timeout::{with_timeout_error, RECV_RETRY_DELAY};

pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: ServerConfig,
    transport: TransportConfig,
    schema: Arc<MessageSchema>,
    reliable_addr: SocketAddr,
    mux: DatagramMux,
    tls: Option<TlsAcceptor>,
    sessions: DashMap<SessionId, Arc<Session>>,
    best_effort: DashMap<SocketAddr, SessionId>,
    tokens: PendingTokens,
    admitted: AtomicUsize,
    blocking: AtomicBool,
    next_session: AtomicU64,
    listeners: Dispatcher<Session>,
    cancel: CancellationToken,
}

/// Reserved connection slot, released on drop
struct AdmissionSlot {
    inner: Arc<ServerInner>,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.inner.admitted.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Server {
    /// Bind both ports and start accepting
    #[instrument(skip_all, fields(service = %config.service))]
    pub async fn bind(
        config: ServerConfig,
        transport: TransportConfig,
        schema: MessageSchema,
    ) -> Result<Self> {
        let mut problems = config.validate_with(&transport);
        problems.extend(transport.validate());
        if !problems.is_empty() {
            return Err(ProtocolError::ConfigError(problems.join("; ")));
        }

        let tls = if config.tls {
            Some(tls::server_acceptor(&config)?)
        } else {
            None
        };

        let listener = TcpListener::bind(config.reliable_addr())
            .await
            .map_err(|e| ProtocolError::ListenerFailed(format!("{}: {e}", config.reliable_addr())))?;
        let reliable_addr = listener.local_addr()?;

        let best_effort_addr: SocketAddr = config
            .best_effort_addr()
            .parse()
            .map_err(|e| ProtocolError::ConfigError(format!("best-effort address: {e}")))?;
        let mux = DatagramMux::bind(
            best_effort_addr,
            MuxOptions {
                sockets: config.best_effort_sockets,
                buffer_size: transport.datagram_buffer_size,
                queue_limit: config.best_effort_queue_limit,
            },
        )
        .await?;

        let inner = Arc::new(ServerInner {
            tokens: PendingTokens::new(config.token_ttl),
            blocking: AtomicBool::new(config.blocking),
            config,
            transport,
            schema: Arc::new(schema),
            reliable_addr,
            mux,
            tls,
            sessions: DashMap::new(),
            best_effort: DashMap::new(),
            admitted: AtomicUsize::new(0),
            next_session: AtomicU64::new(1),
            listeners: Dispatcher::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        tokio::spawn(association_loop(Arc::clone(&inner)));
        tokio::spawn(token_cleanup_loop(Arc::clone(&inner)));

        info!(
            reliable = %reliable_addr,
            best_effort = %inner.mux.local_addr(),
            tls = inner.tls.is_some(),
            max_connections = inner.config.max_connections,
            "Server listening"
        );
        Ok(Self { inner })
    }

    /// Bound address of the reliable (TCP) listener
    pub fn reliable_addr(&self) -> SocketAddr {
        self.inner.reliable_addr
    }

    /// Bound address of the best-effort (UDP) port
    pub fn best_effort_addr(&self) -> SocketAddr {
        self.inner.mux.local_addr()
    }

    /// Server-wide listeners, invoked for every session
    pub fn listeners(&self) -> &Dispatcher<Session> {
        &self.inner.listeners
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.get(&id).map(|s| Arc::clone(s.value()))
    }

    /// Session bound to the best-effort flow from `addr`
    pub fn session_for_best_effort(&self, addr: &SocketAddr) -> Option<Arc<Session>> {
        let id = *self.inner.best_effort.get(addr)?.value();
        self.session(id)
    }

    /// Every live session, established or not
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner
            .sessions
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect()
    }

    /// Reliable connections holding an admission slot, established or not
    pub fn connection_count(&self) -> usize {
        self.inner.admitted.load(Ordering::Acquire)
    }

    pub fn established_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|s| s.is_established())
            .count()
    }

    pub fn send_to(&self, id: SessionId, message: Message) -> Result<()> {
        self.session(id)
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(message)
    }

    /// Queue `message` on every established session; returns how many accepted it
    pub fn broadcast(&self, message: &Message) -> usize {
        self.sessions()
            .iter()
            .filter(|s| s.is_established())
            .filter(|s| s.send(message.clone()).is_ok())
            .count()
    }

    pub fn broadcast_message<M: NetworkMessage>(&self, message: &M) -> Result<usize> {
        Ok(self.broadcast(&Message::application(message)?))
    }

    /// While blocking, every new reliable connection is refused
    pub fn set_blocking(&self, blocking: bool) {
        self.inner.blocking.store(blocking, Ordering::Release);
        info!(blocking, "Blocking mode changed");
    }

    pub fn is_blocking(&self) -> bool {
        self.inner.blocking.load(Ordering::Acquire)
    }

    /// Stop accepting, close every session and the best-effort port
    pub fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        for session in self.sessions() {
            session.disconnect();
        }
        self.inner.mux.shutdown();
        info!("Server shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ServerInner {
    fn try_admit(self: &Arc<Self>) -> Result<AdmissionSlot> {
        if self.blocking.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionRejected(
                constants::ERR_SERVER_BLOCKING.into(),
            ));
        }
        let max = self.config.max_connections;
        self.admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .map_err(|_| ProtocolError::ConnectionRejected(constants::ERR_SERVER_FULL.into()))?;
        Ok(AdmissionSlot {
            inner: Arc::clone(self),
        })
    }

    #[instrument(skip(self, tcp, slot), fields(%peer))]
    async fn run_session(self: Arc<Self>, tcp: TcpStream, peer: SocketAddr, slot: AdmissionSlot) {
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }
        let stream: BoxedStream = match &self.tls {
            Some(acceptor) => {
                let handshake = tls::accept(acceptor, tcp);
                match with_timeout_error(handshake, self.config.connection_timeout).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "TLS handshake failed");
                        return;
                    }
                }
            }
            None => Box::new(tcp),
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let codec = RegistrarCodec::new(Arc::clone(&self.schema))
            .with_max_frame_size(self.transport.max_frame_size);
        let reader = FramedRead::new(read_half, codec.clone());
        let writer = FramedWrite::new(write_half, codec);

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(id, peer, tx, cancel.clone()));
        self.sessions.insert(id, Arc::clone(&session));
        global_metrics().session_accepted();
        info!(session = id, "Session accepted");

        let write_idle = self.transport.write_idle_timeout;
        let writer_cancel = cancel.clone();
        let writer_task = tokio::spawn(async move {
            if let Err(e) = run_reliable_writer(writer, rx, write_idle, writer_cancel.clone()).await {
                debug!(session = id, error = %e, "Reliable writer stopped");
                writer_cancel.cancel();
            }
        });

        let token = generate_token(self.config.token_length);
        self.tokens.insert(token.clone(), id);
        session.set_token(token.clone());
        session.transition(SessionState::Accepted, SessionState::AwaitingAssociation);
        let issued = session.send(Message::HandshakeToken(HandshakeToken {
            token,
            from_server: true,
        }));
        let result = match issued {
            Ok(()) => self.read_loop(&session, reader).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => debug!(session = id, "Session ended"),
            Err(ProtocolError::ConnectionTimeout) => info!(session = id, "Session idle, closing"),
            Err(e) if e.is_disconnect() => debug!(session = id, error = %e, "Peer disconnected"),
            Err(e) => {
                if e.is_desync() {
                    global_metrics().protocol_error();
                }
                warn!(session = id, error = %e, "Session failed")
            }
        }

        self.teardown(&session);
        if let Err(e) = writer_task.await {
            error!(session = id, error = %e, "Writer task panicked");
        }
        drop(slot);
    }

    async fn read_loop(
        &self,
        session: &Arc<Session>,
        mut reader: FramedRead<tokio::io::ReadHalf<BoxedStream>, RegistrarCodec>,
    ) -> Result<()> {
        let cancel = session.cancel_token();
        let read_idle = self.transport.read_idle_timeout;
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                message = read_reliable(&mut reader, read_idle) => message?,
            };
            match message {
                Message::Application(envelope) if session.is_established() => {
                    self.dispatch(session, &envelope)
                }
                Message::Application(envelope) => debug!(
                    session = session.id(),
                    name = envelope.name(),
                    "Dropping message received before establishment"
                ),
                other => debug!(
                    session = session.id(),
                    name = other.name(),
                    "Ignoring control message from client"
                ),
            }
        }
    }

    fn dispatch(&self, session: &Session, envelope: &Envelope) {
        if let Err(e) = self.listeners.dispatch(session, envelope) {
            warn!(error = %e, "Server listener dispatch failed");
        }
        if let Err(e) = session.listeners().dispatch(session, envelope) {
            warn!(error = %e, "Session listener dispatch failed");
        }
    }

    /// Handle a newly surfaced virtual channel whose first datagram must be a token
    #[instrument(skip(self, channel), fields(remote = %channel.remote_addr()))]
    async fn associate(self: Arc<Self>, channel: Arc<VirtualChannel>) {
        let mut inbound = RegistrarCodec::new(Arc::clone(&self.schema))
            .with_max_frame_size(self.transport.max_datagram_frame());

        let session = match self.redeem(&channel, &mut inbound).await {
            Ok(session) => session,
            Err(e) => {
                global_metrics().association_failed();
                debug!(error = %e, "Association rejected");
                channel.close();
                return;
            }
        };

        let id = session.id();
        let cancel = session.cancel_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let bound = session.bind_best_effort(BestEffortBinding {
            channel: Arc::clone(&channel),
            outbound: tx,
        });
        if let Err(e) = bound {
            debug!(session = id, error = %e, "Association rejected");
            channel.close();
            return;
        }
        let remote = channel.remote_addr();
        self.best_effort.insert(remote, id);

        if !session.transition(SessionState::AwaitingAssociation, SessionState::Established) {
            debug!(session = id, state = ?session.state(), "Session left handshake before binding");
            self.best_effort.remove_if(&remote, |_, owner| *owner == id);
            channel.close();
            return;
        }
        session.take_token();
        global_metrics().association_success();
        info!(session = id, "Session established");

        let outbound = RegistrarCodec::new(Arc::clone(&self.schema))
            .with_max_frame_size(self.transport.max_datagram_frame());
        let writer_cancel = cancel.clone();
        let writer_link = Arc::clone(&channel);
        tokio::spawn(async move {
            if let Err(e) = run_datagram_writer(writer_link, outbound, rx, writer_cancel.clone()).await {
                debug!(session = id, error = %e, "Best-effort writer stopped");
                writer_cancel.cancel();
            }
        });

        if let Err(e) = self.listeners.fire_connect(&session) {
            warn!(error = %e, "Connect listeners failed");
        }
        if let Err(e) = session.listeners().fire_connect(&session) {
            warn!(error = %e, "Connect listeners failed");
        }
        if let Err(e) = session.send(Message::ConnectionEstablished) {
            debug!(session = id, error = %e, "Could not confirm establishment");
        }

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = read_datagram(channel.as_ref(), &mut inbound) => message,
            };
            match message {
                Ok(Message::Application(envelope)) => self.dispatch(&session, &envelope),
                Ok(other) => debug!(session = id, name = other.name(), "Ignoring datagram control message"),
                Err(ProtocolError::ConnectionClosed) => break,
                Err(e) => {
                    if e.is_desync() {
                        global_metrics().protocol_error();
                    }
                    warn!(session = id, error = %e, "Best-effort channel failed");
                    session.disconnect();
                    break;
                }
            }
        }
        channel.close();
    }

    /// Read the first datagram and redeem it as a token
    async fn redeem(
        &self,
        channel: &VirtualChannel,
        inbound: &mut RegistrarCodec,
    ) -> Result<Arc<Session>> {
        let token = match read_datagram(channel, inbound).await? {
            Message::HandshakeToken(HandshakeToken {
                token,
                from_server: false,
            }) => token,
            _ => {
                return Err(ProtocolError::HandshakeRejected(
                    constants::ERR_NOT_A_TOKEN.into(),
                ))
            }
        };
        let id = self
            .tokens
            .take(&token)
            .ok_or_else(|| ProtocolError::HandshakeRejected(constants::ERR_UNKNOWN_TOKEN.into()))?;
        self.sessions
            .get(&id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| ProtocolError::HandshakeRejected(constants::ERR_SESSION_GONE.into()))
    }

    fn teardown(&self, session: &Session) {
        let previous = session.close();
        if previous == SessionState::Closed {
            return;
        }
        let id = session.id();
        if let Some(token) = session.take_token() {
            self.tokens.remove(&token);
        }
        self.sessions.remove(&id);
        if let Some(addr) = session.best_effort_addr() {
            self.best_effort.remove_if(&addr, |_, owner| *owner == id);
        }

        if previous == SessionState::Established {
            if let Err(e) = self.listeners.fire_disconnect(session) {
                warn!(error = %e, "Disconnect listeners failed");
            }
            if let Err(e) = session.listeners().fire_disconnect(session) {
                warn!(error = %e, "Disconnect listeners failed");
            }
        }
        global_metrics().session_closed();
        info!(session = id, "Session closed");
    }
}

async fn accept_loop(inner: Arc<ServerInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Accept failed; retrying");
                tokio::time::sleep(RECV_RETRY_DELAY).await;
                continue;
            }
        };

        match inner.try_admit() {
            Ok(slot) => {
                tokio::spawn(Arc::clone(&inner).run_session(tcp, peer, slot));
            }
            Err(e) => {
                global_metrics().session_rejected();
                info!(%peer, reason = %e, "Connection rejected");
                drop(tcp);
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn association_loop(inner: Arc<ServerInner>) {
    while let Some(channel) = inner.mux.accept().await {
        tokio::spawn(Arc::clone(&inner).associate(channel));
    }
    debug!("Association loop stopped");
}

async fn token_cleanup_loop(inner: Arc<ServerInner>) {
    let mut interval = tokio::time::interval(inner.config.token_ttl);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = interval.tick() => {
                for id in inner.tokens.cleanup() {
                    let Some(session) = inner.sessions.get(&id).map(|s| Arc::clone(s.value())) else {
                        continue;
                    };
                    // A session whose token lapsed can never associate.
                    if session.state() == SessionState::AwaitingAssociation {
                        info!(session = id, "Association token expired, closing session");
                        session.disconnect();
                    }
                }
            }
        }
    }
}
