use crate::core::message::{Envelope, NetworkMessage};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::metrics::global_metrics;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Handle returned on registration, used to unregister
pub type ListenerId = u64;

/// Receives application messages for a context `C` (a server session or a client).
pub trait MessageListener<C: ?Sized>: Send + Sync + 'static {
    /// Whether this listener wants messages of type `name`
    fn accepts(&self, name: &str) -> bool;

    fn on_message(&self, ctx: &C, message: &Envelope) -> Result<()>;
}

/// Connect and disconnect callbacks for a context `C`
pub trait ConnectionListener<C: ?Sized>: Send + Sync + 'static {
    fn on_connect(&self, _ctx: &C) -> Result<()> {
        Ok(())
    }

    fn on_disconnect(&self, _ctx: &C) -> Result<()> {
        Ok(())
    }
}

type Registry<T> = RwLock<Vec<(ListenerId, Arc<T>)>>;

/// Listener registries with per-callback failure isolation.
///
/// Dispatch runs over a snapshot of the registry, so listeners may register or
/// unregister from inside a callback. A listener that errors or panics is
/// logged and skipped; the remaining listeners still run.
pub struct Dispatcher<C: ?Sized + 'static> {
    messages: Registry<dyn MessageListener<C>>,
    connections: Registry<dyn ConnectionListener<C>>,
    next_id: AtomicU64,
}

impl<C: ?Sized + 'static> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized + 'static> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            connections: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener<C>>) -> Result<ListenerId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.messages
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LISTENER_WRITE_LOCK.into()))?
            .push((id, listener));
        Ok(id)
    }

    /// Returns whether a listener was removed
    pub fn remove_message_listener(&self, id: ListenerId) -> Result<bool> {
        let mut listeners = self
            .messages
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LISTENER_WRITE_LOCK.into()))?;
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        Ok(listeners.len() != before)
    }

    pub fn add_connection_listener(
        &self,
        listener: Arc<dyn ConnectionListener<C>>,
    ) -> Result<ListenerId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LISTENER_WRITE_LOCK.into()))?
            .push((id, listener));
        Ok(id)
    }

    pub fn remove_connection_listener(&self, id: ListenerId) -> Result<bool> {
        let mut listeners = self
            .connections
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LISTENER_WRITE_LOCK.into()))?;
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        Ok(listeners.len() != before)
    }

    /// Register a closure for one message type
    pub fn on<M, F>(&self, handler: F) -> Result<ListenerId>
    where
        M: NetworkMessage,
        F: Fn(&C, M) -> Result<()> + Send + Sync + 'static,
    {
        self.add_message_listener(Arc::new(TypedListener {
            handler,
            _marker: PhantomData,
        }))
    }

    pub fn on_connect<F>(&self, callback: F) -> Result<ListenerId>
    where
        F: Fn(&C) -> Result<()> + Send + Sync + 'static,
    {
        self.add_connection_listener(Arc::new(ConnectFn(callback)))
    }

    pub fn on_disconnect<F>(&self, callback: F) -> Result<ListenerId>
    where
        F: Fn(&C) -> Result<()> + Send + Sync + 'static,
    {
        self.add_connection_listener(Arc::new(DisconnectFn(callback)))
    }

    /// Deliver `message` to every accepting listener; returns how many accepted
    pub fn dispatch(&self, ctx: &C, message: &Envelope) -> Result<usize> {
        let snapshot: Vec<_> = self
            .messages
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LISTENER_READ_LOCK.into()))?
            .iter()
            .filter(|(_, listener)| listener.accepts(message.name()))
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in &snapshot {
            isolate(*id, message.name(), || listener.on_message(ctx, message));
        }
        Ok(snapshot.len())
    }

    pub fn fire_connect(&self, ctx: &C) -> Result<()> {
        for (id, listener) in self.connection_snapshot()? {
            isolate(id, "connect", || listener.on_connect(ctx));
        }
        Ok(())
    }

    pub fn fire_disconnect(&self, ctx: &C) -> Result<()> {
        for (id, listener) in self.connection_snapshot()? {
            isolate(id, "disconnect", || listener.on_disconnect(ctx));
        }
        Ok(())
    }

    pub fn message_listener_count(&self) -> usize {
        self.messages.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn connection_listener_count(&self) -> usize {
        self.connections.read().map(|l| l.len()).unwrap_or(0)
    }

    fn connection_snapshot(&self) -> Result<Vec<(ListenerId, Arc<dyn ConnectionListener<C>>)>> {
        Ok(self
            .connections
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LISTENER_READ_LOCK.into()))?
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect())
    }
}

fn isolate<F>(id: ListenerId, event: &str, callback: F)
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            global_metrics().listener_failure();
            warn!(listener = id, event, error = %e, "Listener failed");
        }
        Err(payload) => {
            global_metrics().listener_failure();
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            let error = ProtocolError::ListenerFailed(reason);
            warn!(listener = id, event, %error, "Listener panicked");
        }
    }
}

struct TypedListener<C: ?Sized, M, F> {
    handler: F,
    _marker: PhantomData<fn(&C, M)>,
}

impl<C, M, F> MessageListener<C> for TypedListener<C, M, F>
where
    C: ?Sized + 'static,
    M: NetworkMessage,
    F: Fn(&C, M) -> Result<()> + Send + Sync + 'static,
{
    fn accepts(&self, name: &str) -> bool {
        name == M::NAME
    }

    fn on_message(&self, ctx: &C, message: &Envelope) -> Result<()> {
        (self.handler)(ctx, message.decode::<M>()?)
    }
}

struct ConnectFn<F>(F);

impl<C, F> ConnectionListener<C> for ConnectFn<F>
where
    C: ?Sized + 'static,
    F: Fn(&C) -> Result<()> + Send + Sync + 'static,
{
    fn on_connect(&self, ctx: &C) -> Result<()> {
        (self.0)(ctx)
    }
}

struct DisconnectFn<F>(F);

impl<C, F> ConnectionListener<C> for DisconnectFn<F>
where
    C: ?Sized + 'static,
    F: Fn(&C) -> Result<()> + Send + Sync + 'static,
{
    fn on_disconnect(&self, ctx: &C) -> Result<()> {
        (self.0)(ctx)
    }
}
