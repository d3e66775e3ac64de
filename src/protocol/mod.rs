//! # Protocol Layer
//!
//! Session state, the association handshake and listener dispatch.

pub mod dispatcher;
pub mod handshake;
pub mod session;

pub use dispatcher::{ConnectionListener, Dispatcher, ListenerId, MessageListener};
pub use session::{Session, SessionId, SessionState, UserData};
