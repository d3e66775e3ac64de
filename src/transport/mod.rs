//! # Transport Layer
//!
//! Socket-level plumbing under a session.
//!
//! - [`multiplex`]: one UDP port presented as per-peer virtual channels
//! - [`pipeline`]: framed read/write loops with idle detection
//! - [`tls`]: optional TLS wrapping of the reliable stream

use tokio::io::{AsyncRead, AsyncWrite};

pub mod multiplex;
pub mod pipeline;
pub mod tls;

/// Byte stream carrying the reliable channel, plain TCP or TLS
pub trait ReliableStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ReliableStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn ReliableStream>;

pub use multiplex::{DatagramMux, MuxOptions, VirtualChannel};
pub use pipeline::{ConnectedDatagram, DatagramLink};
