//! # Service Layer
//!
//! The two ends of a dual-channel session.
//!
//! - [`server`]: admits reliable connections, issues association tokens and
//!   binds each session to its best-effort flow.
//! - [`client`]: performs the client half of the handshake and owns the
//!   reconnect and outbound-cache logic.

pub mod client;
pub mod server;

pub use client::{Client, SendOutcome};
pub use server::Server;
