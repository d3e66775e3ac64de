//! # Error Types
//!
//! Error handling for the dual-channel session transport.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side is
//! [`ProtocolError`]. Variants are grouped by how the caller is expected to react:
//!
//! ## Error Categories
//! - **Desync**: unknown class id, bad stream version, unknown message type.
//!   Fatal for the channel that produced it; the channel is closed.
//! - **Handshake**: unknown, expired or replayed association token. Only the
//!   offending virtual channel is closed.
//! - **Rejection**: the server refused a connection (capacity or blocking mode).
//! - **Transport**: socket failures. Clients arm their reconnect flag, servers tear
//!   the session down.
//!
//! ## Example Usage
//! ```rust
//! use dualnet::error::{ProtocolError, Result};
//! use tracing::{debug, error};
//!
//! fn check_version(version: u8) -> Result<()> {
//!     if version != dualnet::config::STREAM_VERSION {
//!         return Err(ProtocolError::UnsupportedVersion(version));
//!     }
//!     Ok(())
//! }
//!
//! match check_version(9) {
//!     Ok(()) => debug!("version accepted"),
//!     Err(e) if e.is_desync() => error!(error = %e, "closing channel"),
//!     Err(e) => error!(error = %e, "unexpected failure"),
//! }
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Listener registry errors
    pub const ERR_LISTENER_WRITE_LOCK: &str = "Failed to acquire write lock on listener registry";
    pub const ERR_LISTENER_READ_LOCK: &str = "Failed to acquire read lock on listener registry";

    /// Frame validation errors
    pub const ERR_TRUNCATED_FRAME: &str = "Frame ended before its declared length";
    pub const ERR_TRAILING_BYTES: &str = "Datagram carries bytes past the end of its frame";
    pub const ERR_INVALID_UTF: &str = "Descriptor name is not valid UTF-8";
    pub const ERR_NAME_TOO_LONG: &str = "Descriptor name exceeds 65535 bytes";

    /// Connection errors
    pub const ERR_NO_BEST_EFFORT: &str = "Session has no best-effort channel bound";

    /// Rejection reasons
    pub const ERR_SERVER_BLOCKING: &str = "Server is in blocking mode";
    pub const ERR_SERVER_FULL: &str = "Server reached its connection limit";

    /// Handshake errors
    pub const ERR_UNKNOWN_TOKEN: &str = "Unknown, expired or already used association token";
    pub const ERR_NOT_A_TOKEN: &str = "First datagram on a new channel was not an association token";
    pub const ERR_ALREADY_BOUND: &str = "Session already owns a best-effort channel";
    pub const ERR_SESSION_GONE: &str = "Session closed before association completed";

    /// Schema errors
    pub const ERR_RESERVED_NAME: &str = "Message type name collides with a control message";
}

/// ProtocolError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// The decoder cannot make sense of the stream any more.
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Unsupported stream version: {0}")]
    UnsupportedVersion(u8),

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected message type: {0}")]
    UnexpectedMessage(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Connection timed out (no activity)")]
    ConnectionTimeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Listener failed: {0}")]
    ListenerFailed(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Errors after which the decoding side of a channel can not continue.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            ProtocolError::ProtocolDesync(_)
                | ProtocolError::UnknownMessageType(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::Serialization(_)
        )
    }

    /// Ordinary peer-went-away failures that should not be logged at error level.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        let reset = ProtocolError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(reset.is_disconnect());
        assert!(ProtocolError::ConnectionClosed.is_disconnect());

        let refused = ProtocolError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(!refused.is_disconnect());
        assert!(!ProtocolError::Timeout.is_disconnect());
    }

    #[test]
    fn test_desync_classification() {
        assert!(ProtocolError::ProtocolDesync("id 7".into()).is_desync());
        assert!(ProtocolError::UnsupportedVersion(9).is_desync());
        assert!(ProtocolError::UnknownMessageType("x".into()).is_desync());
        assert!(!ProtocolError::HandshakeRejected("x".into()).is_desync());
    }
}
