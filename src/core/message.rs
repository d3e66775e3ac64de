//! # Messages
//!
//! The closed message contract carried by both transports.
//!
//! Application payloads implement [`NetworkMessage`]: a stable type name, the
//! transport they travel on, and serde derive for the body. In transit they are
//! carried as an [`Envelope`] holding the already serialized body, so the codec
//! and dispatch layers never need to know the concrete type.
//!
//! Three control messages are built in and never reach application listeners:
//! the association token, the connection-established notice and the keepalive
//! ping.

use crate::error::{ProtocolError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Type names reserved for control messages.
pub mod names {
    pub const HANDSHAKE_TOKEN: &str = "dualnet.handshake-token";
    pub const CONNECTION_ESTABLISHED: &str = "dualnet.connection-established";
    pub const PING: &str = "dualnet.ping";

    /// Whether `name` belongs to a control message
    pub fn is_reserved(name: &str) -> bool {
        matches!(name, HANDSHAKE_TOKEN | CONNECTION_ESTABLISHED | PING)
    }
}

/// Which channel of a session a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    /// Ordered TCP stream
    Reliable,
    /// Unordered UDP datagrams
    BestEffort,
}

/// A typed application message.
///
/// `NAME` is the class identity compacted by the registrar, so it must be unique
/// within a schema and identical on both peers. Types with `COMPACT = false` are
/// always sent with their full descriptor.
pub trait NetworkMessage: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;
    const TRANSPORT: Transport;
    const COMPACT: bool = true;
}

/// An application message with its body already serialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    name: String,
    transport: Transport,
    compact: bool,
    body: Bytes,
}

impl Envelope {
    /// Serialize `message` into an envelope
    pub fn new<M: NetworkMessage>(message: &M) -> Result<Self> {
        let body = bincode::serialize(message)?;
        Ok(Self {
            name: M::NAME.to_string(),
            transport: M::TRANSPORT,
            compact: M::COMPACT,
            body: Bytes::from(body),
        })
    }

    pub(crate) fn from_parts(name: &str, transport: Transport, compact: bool, body: Bytes) -> Self {
        Self {
            name: name.to_string(),
            transport,
            compact,
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_compact(&self) -> bool {
        self.compact
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether this envelope carries an `M`
    pub fn is<M: NetworkMessage>(&self) -> bool {
        self.name == M::NAME
    }

    /// Deserialize the body as `M`
    pub fn decode<M: NetworkMessage>(&self) -> Result<M> {
        if !self.is::<M>() {
            return Err(ProtocolError::UnexpectedMessage(self.name.clone()));
        }
        Ok(bincode::deserialize(&self.body)?)
    }
}

/// One-time secret that binds a best-effort flow to its reliable session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeToken {
    pub token: String,
    /// Set on the server→client leg (reliable), clear on the client→server leg
    pub from_server: bool,
}

/// Everything that can be framed on either transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeToken(HandshakeToken),
    ConnectionEstablished,
    Ping,
    Application(Envelope),
}

impl Message {
    /// Wrap a typed application message
    pub fn application<M: NetworkMessage>(message: &M) -> Result<Self> {
        Envelope::new(message).map(Message::Application)
    }

    pub fn name(&self) -> &str {
        match self {
            Message::HandshakeToken(_) => names::HANDSHAKE_TOKEN,
            Message::ConnectionEstablished => names::CONNECTION_ESTABLISHED,
            Message::Ping => names::PING,
            Message::Application(envelope) => envelope.name(),
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Message::HandshakeToken(token) if token.from_server => Transport::Reliable,
            Message::HandshakeToken(_) => Transport::BestEffort,
            Message::ConnectionEstablished | Message::Ping => Transport::Reliable,
            Message::Application(envelope) => envelope.transport(),
        }
    }

    /// Whether the codec may send this message as NEW/THIN.
    ///
    /// Tokens always travel FAT: the first datagram of a virtual channel is
    /// decoded with an empty registry, and a client may repeat its token.
    pub fn is_compact(&self) -> bool {
        match self {
            Message::Application(envelope) => envelope.is_compact(),
            Message::HandshakeToken(_) => false,
            Message::ConnectionEstablished | Message::Ping => true,
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Message::Application(_))
    }

    /// Append the serialized object body to `dst`
    pub(crate) fn write_body(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Message::HandshakeToken(token) => {
                bincode::serialize_into(dst.writer(), token)?;
            }
            Message::ConnectionEstablished | Message::Ping => {}
            Message::Application(envelope) => dst.extend_from_slice(envelope.body()),
        }
        Ok(())
    }
}

impl From<Envelope> for Message {
    fn from(envelope: Envelope) -> Self {
        Message::Application(envelope)
    }
}
