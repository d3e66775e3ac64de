//! Closed set of message types a peer understands.
//!
//! Both peers must register the same application types. A name the schema does
//! not know is a fatal decode error, the same as an unregistered class id.

use crate::core::message::{names, Envelope, HandshakeToken, Message, NetworkMessage, Transport};
use crate::error::{constants, ProtocolError, Result};
use bytes::Bytes;
use std::collections::HashMap;

/// Declared properties of one application message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaEntry {
    pub transport: Transport,
    pub compact: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MessageSchema {
    entries: HashMap<String, SchemaEntry>,
}

impl MessageSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `M` to the schema. Registering the same type twice is a no-op.
    pub fn register<M: NetworkMessage>(&mut self) -> Result<&mut Self> {
        if names::is_reserved(M::NAME) {
            return Err(ProtocolError::ConfigError(format!(
                "{}: {}",
                constants::ERR_RESERVED_NAME,
                M::NAME
            )));
        }
        self.entries.insert(
            M::NAME.to_string(),
            SchemaEntry {
                transport: M::TRANSPORT,
                compact: M::COMPACT,
            },
        );
        Ok(self)
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<M: NetworkMessage>(mut self) -> Result<Self> {
        self.register::<M>()?;
        Ok(self)
    }

    pub fn entry(&self, name: &str) -> Option<SchemaEntry> {
        self.entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        names::is_reserved(name) || self.entries.contains_key(name)
    }

    /// Number of application types
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Turn a decoded type name and object body into a [`Message`]
    pub(crate) fn resolve(&self, name: &str, body: Bytes) -> Result<Message> {
        match name {
            names::HANDSHAKE_TOKEN => {
                let token: HandshakeToken = bincode::deserialize(&body)?;
                Ok(Message::HandshakeToken(token))
            }
            names::CONNECTION_ESTABLISHED => Ok(Message::ConnectionEstablished),
            names::PING => Ok(Message::Ping),
            other => {
                let entry = self
                    .entries
                    .get(other)
                    .ok_or_else(|| ProtocolError::UnknownMessageType(other.to_string()))?;
                Ok(Message::Application(Envelope::from_parts(
                    other,
                    entry.transport,
                    entry.compact,
                    body,
                )))
            }
        }
    }
}
