//! Server-side session state.
//!
//! A [`Session`] is created for every admitted reliable connection. Its
//! reliable outbound queue exists from the start; the best-effort binding is set
//! exactly once, when the client redeems its association token.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::message::{Message, NetworkMessage, Transport};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::transport::multiplex::VirtualChannel;

pub type SessionId = u64;

/// Lifecycle of a session as seen by the server
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reliable connection admitted, token not yet sent
    Accepted = 0,
    /// Token sent, waiting for it on the best-effort port
    AwaitingAssociation = 1,
    /// Both channels bound
    Established = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Accepted,
            1 => SessionState::AwaitingAssociation,
            2 => SessionState::Established,
            _ => SessionState::Closed,
        }
    }
}

/// String-keyed values attached to a session or client by the application
#[derive(Default)]
pub struct UserData {
    values: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl UserData {
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        if let Ok(mut values) = self.values.write() {
            values.insert(key.into(), Arc::new(value));
        }
    }

    /// Value under `key`, if present and of type `T`
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.values.read().ok()?.get(key).cloned()?;
        value.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.values
            .write()
            .map(|mut values| values.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values
            .read()
            .map(|values| values.contains_key(key))
            .unwrap_or(false)
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .values
            .read()
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("UserData").field("keys", &keys).finish()
    }
}

pub(crate) struct BestEffortBinding {
    pub(crate) channel: Arc<VirtualChannel>,
    pub(crate) outbound: mpsc::UnboundedSender<Message>,
}

pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    state: AtomicU8,
    reliable: mpsc::UnboundedSender<Message>,
    best_effort: OnceLock<BestEffortBinding>,
    token: Mutex<Option<String>>,
    user_data: UserData,
    listeners: Dispatcher<Session>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        peer: SocketAddr,
        reliable: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            state: AtomicU8::new(SessionState::Accepted as u8),
            reliable,
            best_effort: OnceLock::new(),
            token: Mutex::new(None),
            user_data: UserData::default(),
            listeners: Dispatcher::new(),
            cancel,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Remote address of the reliable connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Remote address of the bound best-effort flow
    pub fn best_effort_addr(&self) -> Option<SocketAddr> {
        self.best_effort.get().map(|b| b.channel.remote_addr())
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Queue `message` on the channel its transport names
    pub fn send(&self, message: Message) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        match message.transport() {
            Transport::Reliable => self
                .reliable
                .send(message)
                .map_err(|_| ProtocolError::ConnectionClosed),
            Transport::BestEffort => self
                .best_effort
                .get()
                .ok_or_else(|| ProtocolError::TransportError(constants::ERR_NO_BEST_EFFORT.into()))?
                .outbound
                .send(message)
                .map_err(|_| ProtocolError::ConnectionClosed),
        }
    }

    /// Serialize and send a typed message
    pub fn send_message<M: NetworkMessage>(&self, message: &M) -> Result<()> {
        self.send(Message::application(message)?)
    }

    /// Per-session listeners, consulted after the server-wide ones
    pub fn listeners(&self) -> &Dispatcher<Session> {
        &self.listeners
    }

    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    /// Request teardown; the session's owning task completes it
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Compare-and-swap state change; false if the session was not in `from`
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark closed and cancel every task; returns the state before closing
    pub(crate) fn close(&self) -> SessionState {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        self.cancel.cancel();
        if let Some(binding) = self.best_effort.get() {
            binding.channel.close();
        }
        SessionState::from_u8(previous)
    }

    pub(crate) fn bind_best_effort(&self, binding: BestEffortBinding) -> Result<()> {
        self.best_effort
            .set(binding)
            .map_err(|_| ProtocolError::HandshakeRejected(constants::ERR_ALREADY_BOUND.into()))
    }

    pub(crate) fn set_token(&self, token: String) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token);
        }
    }

    pub(crate) fn take_token(&self) -> Option<String> {
        self.token.lock().ok()?.take()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("best_effort", &self.best_effort_addr())
            .finish()
    }
}
