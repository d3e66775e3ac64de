//! # dualnet
//!
//! Session transport giving every peer two channels: a reliable, ordered
//! TCP channel (optionally TLS) and a best-effort UDP channel. On the server all
//! best-effort peers share one UDP port, presented as per-peer virtual channels.
//!
//! ## Handshake
//! 1. The client opens the reliable channel.
//! 2. The server replies with a one-time token.
//! 3. The client sends the token as its first datagram to the best-effort port.
//! 4. The server binds that datagram flow to the session and confirms with
//!    connection-established. Both sides are now connected.
//!
//! ## Wire format
//! Every frame is `[u32 len][u8 version][u8 tag][descriptor][body]`. Message
//! types are announced once per connection and direction (NEW) and then
//! referenced by a 4-byte id (THIN). See [`core::codec`].
//!
//! ## Example
//! ```rust,no_run
//! use dualnet::config::{ClientConfig, ServerConfig, TransportConfig};
//! use dualnet::core::{MessageSchema, NetworkMessage, Transport};
//! use dualnet::service::{Client, Server};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Chat(String);
//!
//! impl NetworkMessage for Chat {
//!     const NAME: &'static str = "app.chat";
//!     const TRANSPORT: Transport = Transport::Reliable;
//! }
//!
//! # async fn run() -> dualnet::error::Result<()> {
//! let schema = || MessageSchema::new().with::<Chat>();
//! let server = Server::bind(ServerConfig::default(), TransportConfig::default(), schema()?).await?;
//! server.listeners().on(|session, chat: Chat| {
//!     tracing::info!(session = session.id(), text = %chat.0, "chat");
//!     Ok(())
//! })?;
//!
//! let client = Client::new(ClientConfig::default(), TransportConfig::default(), schema()?)?;
//! client.connect().await?;
//! client.send_message(&Chat("hello".into()))?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
