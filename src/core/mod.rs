//! Wire-level building blocks shared by both transports.

pub mod codec;
pub mod message;
pub mod registry;
pub mod schema;

pub use codec::RegistrarCodec;
pub use message::{Envelope, Message, NetworkMessage, Transport};
pub use schema::MessageSchema;
