//! # Registrar Codec
//!
//! Length-prefixed frame codec with compact class descriptors.
//!
//! ## Frame layout
//!
//! ```text
//! ┌──────────────┬──────────┬─────┬────────────────────┬──────────────┐
//! │ len (u32 BE) │ version  │ tag │ descriptor         │ object body  │
//! │ 4 bytes      │ 1 byte   │ 1 B │ see below          │ bincode      │
//! └──────────────┴──────────┴─────┴────────────────────┴──────────────┘
//!
//! FAT  (0): u16 name length + UTF-8 name
//! THIN (1): u32 class id
//! NEW  (2): u16 name length + UTF-8 name + u32 class id
//! ```
//!
//! `len` counts everything after itself. The first compact send of a type emits
//! NEW and later sends emit THIN. Non-compact types always emit FAT.
//!
//! A codec instance carries one registry per direction, so it belongs to
//! exactly one connection. On a best-effort channel every datagram holds
//! exactly one frame.

use crate::config::{MAX_FRAME_SIZE, STREAM_VERSION};
use crate::core::message::Message;
use crate::core::registry::ClassRegistry;
use crate::core::schema::MessageSchema;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::metrics::global_metrics;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

pub const TAG_FAT: u8 = 0;
pub const TAG_THIN: u8 = 1;
pub const TAG_NEW: u8 = 2;

const LENGTH_PREFIX: usize = 4;
/// version + tag
const HEADER_LEN: usize = 2;

#[derive(Debug, Clone)]
pub struct RegistrarCodec {
    outgoing: ClassRegistry,
    incoming: ClassRegistry,
    schema: Arc<MessageSchema>,
    max_frame_size: usize,
}

impl RegistrarCodec {
    pub fn new(schema: Arc<MessageSchema>) -> Self {
        Self {
            outgoing: ClassRegistry::new(),
            incoming: ClassRegistry::new(),
            schema,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Ids this side has assigned
    pub fn outgoing(&self) -> &ClassRegistry {
        &self.outgoing
    }

    /// Ids the peer has assigned
    pub fn incoming(&self) -> &ClassRegistry {
        &self.incoming
    }

    /// Encode `message` as a single datagram payload
    pub fn encode_datagram(&mut self, message: &Message) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_message(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a datagram that must contain exactly one frame
    pub fn decode_datagram(&mut self, datagram: &[u8]) -> Result<Message> {
        let mut src = BytesMut::from(datagram);
        match self.decode(&mut src)? {
            Some(message) if src.is_empty() => Ok(message),
            Some(_) => Err(ProtocolError::ProtocolDesync(
                constants::ERR_TRAILING_BYTES.into(),
            )),
            None => Err(ProtocolError::ProtocolDesync(
                constants::ERR_TRUNCATED_FRAME.into(),
            )),
        }
    }

    fn encode_message(&mut self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        dst.put_u32(0);
        dst.put_u8(STREAM_VERSION);

        let name = message.name();
        let mut assigned = false;
        if !message.is_compact() {
            dst.put_u8(TAG_FAT);
            if let Err(e) = put_utf(dst, name) {
                dst.truncate(start);
                return Err(e);
            }
        } else {
            let (id, fresh) = self.outgoing.assign(name)?;
            assigned = fresh;
            if fresh {
                dst.put_u8(TAG_NEW);
                if let Err(e) = put_utf(dst, name) {
                    self.outgoing.remove(name);
                    dst.truncate(start);
                    return Err(e);
                }
                dst.put_u32(id);
            } else {
                dst.put_u8(TAG_THIN);
                dst.put_u32(id);
            }
        }

        let body = message.write_body(dst);
        let len = dst.len() - start - LENGTH_PREFIX;
        if body.is_err() || len > self.max_frame_size {
            // The peer never saw this NEW, so the name must be announced again.
            if assigned {
                self.outgoing.remove(name);
            }
            dst.truncate(start);
            body?;
            return Err(ProtocolError::OversizedPacket(len));
        }

        let prefix = (len as u32).to_be_bytes();
        dst[start..start + LENGTH_PREFIX].copy_from_slice(&prefix);
        trace!(name, len, "Encoded frame");
        global_metrics().message_sent((LENGTH_PREFIX + len) as u64);
        Ok(())
    }

    fn decode_frame(&mut self, mut frame: Bytes) -> Result<Message> {
        let version = frame.get_u8();
        if version != STREAM_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let name = match frame.get_u8() {
            TAG_FAT => read_utf(&mut frame)?,
            TAG_THIN => {
                let id = read_u32(&mut frame)?;
                self.incoming
                    .name_of(id)
                    .map(str::to_owned)
                    .ok_or_else(|| {
                        ProtocolError::ProtocolDesync(format!("unregistered class id {id}"))
                    })?
            }
            TAG_NEW => {
                let name = read_utf(&mut frame)?;
                let id = read_u32(&mut frame)?;
                self.incoming.register(&name, id);
                name
            }
            tag => {
                return Err(ProtocolError::ProtocolDesync(format!(
                    "unknown descriptor tag {tag}"
                )))
            }
        };

        self.schema.resolve(&name, frame)
    }
}

impl Encoder<Message> for RegistrarCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        self.encode_message(&item, dst)
    }
}

impl Decoder for RegistrarCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        if len < HEADER_LEN {
            return Err(ProtocolError::ProtocolDesync(
                constants::ERR_TRUNCATED_FRAME.into(),
            ));
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let frame = src.split_to(len).freeze();
        global_metrics().message_received((LENGTH_PREFIX + len) as u64);
        self.decode_frame(frame).map(Some)
    }
}

fn put_utf(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| ProtocolError::Custom(constants::ERR_NAME_TOO_LONG.into()))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn read_utf(src: &mut Bytes) -> Result<String> {
    if src.remaining() < 2 {
        return Err(ProtocolError::ProtocolDesync(
            constants::ERR_TRUNCATED_FRAME.into(),
        ));
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(ProtocolError::ProtocolDesync(
            constants::ERR_TRUNCATED_FRAME.into(),
        ));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::ProtocolDesync(constants::ERR_INVALID_UTF.into()))
}

fn read_u32(src: &mut Bytes) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(ProtocolError::ProtocolDesync(
            constants::ERR_TRUNCATED_FRAME.into(),
        ));
    }
    Ok(src.get_u32())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::core::message::{HandshakeToken, NetworkMessage, Transport};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Move {
        dx: i32,
        dy: i32,
    }

    impl NetworkMessage for Move {
        const NAME: &'static str = "test.move";
        const TRANSPORT: Transport = Transport::BestEffort;
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Notice(String);

    impl NetworkMessage for Notice {
        const NAME: &'static str = "test.notice";
        const TRANSPORT: Transport = Transport::Reliable;
        const COMPACT: bool = false;
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Blob(Vec<u8>);

    impl NetworkMessage for Blob {
        const NAME: &'static str = "test.blob";
        const TRANSPORT: Transport = Transport::Reliable;
    }

    fn schema() -> Arc<MessageSchema> {
        let mut schema = MessageSchema::new();
        schema
            .register::<Move>()
            .and_then(|s| s.register::<Notice>())
            .and_then(|s| s.register::<Blob>())
            .expect("schema");
        Arc::new(schema)
    }

    fn pair() -> (RegistrarCodec, RegistrarCodec) {
        let schema = schema();
        (RegistrarCodec::new(schema.clone()), RegistrarCodec::new(schema))
    }

    fn tag_of(frame: &[u8]) -> u8 {
        frame[LENGTH_PREFIX + 1]
    }

    #[test]
    fn test_first_compact_send_is_new_then_thin() {
        let (mut tx, mut rx) = pair();
        let msg = Message::application(&Move { dx: 1, dy: 2 }).unwrap();

        let first = tx.encode_datagram(&msg).unwrap();
        let second = tx.encode_datagram(&msg).unwrap();
        assert_eq!(tag_of(&first), TAG_NEW);
        assert_eq!(tag_of(&second), TAG_THIN);
        assert!(second.len() < first.len());

        assert_eq!(rx.decode_datagram(&first).unwrap(), msg);
        assert_eq!(rx.decode_datagram(&second).unwrap(), msg);
        assert_eq!(rx.incoming().id_of("test.move"), Some(0));
    }

    #[test]
    fn test_non_compact_type_is_always_fat() {
        let (mut tx, mut rx) = pair();
        let msg = Message::application(&Notice("hello".into())).unwrap();
        for _ in 0..3 {
            let frame = tx.encode_datagram(&msg).unwrap();
            assert_eq!(tag_of(&frame), TAG_FAT);
            assert_eq!(rx.decode_datagram(&frame).unwrap(), msg);
        }
        assert!(tx.outgoing().is_empty());
    }

    #[test]
    fn test_thin_without_prior_new_is_desync() {
        let (mut tx, _) = pair();
        let msg = Message::application(&Move { dx: 0, dy: 0 }).unwrap();
        tx.encode_datagram(&msg).unwrap();
        let thin = tx.encode_datagram(&msg).unwrap();

        let (_, mut fresh_rx) = pair();
        let result = fresh_rx.decode_datagram(&thin);
        assert!(matches!(result, Err(ProtocolError::ProtocolDesync(_))));
    }

    #[test]
    fn test_directions_are_independent() {
        let (mut a, mut b) = pair();
        let ping = Message::Ping;
        let mv = Message::application(&Move { dx: 3, dy: 4 }).unwrap();

        // a assigns Ping=0, Move=1; b assigns Move=0 on its own side.
        let a1 = a.encode_datagram(&ping).unwrap();
        let a2 = a.encode_datagram(&mv).unwrap();
        let b1 = b.encode_datagram(&mv).unwrap();

        b.decode_datagram(&a1).unwrap();
        b.decode_datagram(&a2).unwrap();
        a.decode_datagram(&b1).unwrap();

        assert_eq!(a.outgoing().id_of("test.move"), Some(1));
        assert_eq!(a.incoming().id_of("test.move"), Some(0));
        assert_eq!(b.incoming().id_of("test.move"), Some(1));
    }

    #[test]
    fn test_stream_decode_waits_for_full_frame() {
        let (mut tx, mut rx) = pair();
        let mut wire = BytesMut::new();
        let token = Message::HandshakeToken(HandshakeToken {
            token: "x".repeat(128),
            from_server: true,
        });
        tx.encode(token.clone(), &mut wire).unwrap();
        tx.encode(Message::Ping, &mut wire).unwrap();

        let mut partial = wire.split_to(10);
        assert!(rx.decode(&mut partial).unwrap().is_none());
        partial.unsplit(wire);

        assert_eq!(rx.decode(&mut partial).unwrap(), Some(token));
        assert_eq!(rx.decode(&mut partial).unwrap(), Some(Message::Ping));
        assert!(rx.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_repeated_token_decodes_on_fresh_codec() {
        let (mut tx, _) = pair();
        let token = Message::HandshakeToken(HandshakeToken {
            token: "t".repeat(16),
            from_server: false,
        });
        tx.encode_datagram(&token).unwrap();
        let again = tx.encode_datagram(&token).unwrap();
        assert_eq!(tag_of(&again), TAG_FAT);

        let (_, mut fresh_rx) = pair();
        assert_eq!(fresh_rx.decode_datagram(&again).unwrap(), token);
    }

    #[test]
    fn test_trailing_bytes_in_datagram_rejected() {
        let (mut tx, mut rx) = pair();
        let mut frame = BytesMut::from(&tx.encode_datagram(&Message::Ping).unwrap()[..]);
        frame.put_u8(0xff);
        let result = rx.decode_datagram(&frame);
        assert!(matches!(result, Err(ProtocolError::ProtocolDesync(_))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let (mut tx, mut rx) = pair();
        let mut frame = BytesMut::from(&tx.encode_datagram(&Message::Ping).unwrap()[..]);
        frame[LENGTH_PREFIX] = STREAM_VERSION + 1;
        let result = rx.decode_datagram(&frame);
        assert!(matches!(result, Err(ProtocolError::UnsupportedVersion(_))));
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        let (_, rx) = pair();
        let mut rx = rx.with_max_frame_size(64);
        let mut src = BytesMut::new();
        src.put_u32(65);
        assert!(matches!(
            rx.decode(&mut src),
            Err(ProtocolError::OversizedPacket(65))
        ));
    }

    #[test]
    fn test_oversized_encode_does_not_consume_id() {
        let schema = schema();
        let mut tx = RegistrarCodec::new(schema.clone()).with_max_frame_size(32);
        let mut rx = RegistrarCodec::new(schema);

        let big = Message::application(&Blob(vec![0; 64])).unwrap();
        assert!(matches!(
            tx.encode_datagram(&big),
            Err(ProtocolError::OversizedPacket(_))
        ));
        assert_eq!(tx.outgoing().id_of("test.blob"), None);

        let small = Message::application(&Blob(vec![1; 4])).unwrap();
        let frame = tx.encode_datagram(&small).unwrap();
        assert_eq!(tag_of(&frame), TAG_NEW);
        assert_eq!(rx.decode_datagram(&frame).unwrap(), small);
    }

    #[test]
    fn test_unknown_type_name_rejected() {
        let mut tx = RegistrarCodec::new(Arc::new(
            MessageSchema::new().with::<Move>().unwrap(),
        ));
        let mut rx = RegistrarCodec::new(Arc::new(MessageSchema::new()));
        let frame = tx
            .encode_datagram(&Message::application(&Move { dx: 1, dy: 1 }).unwrap())
            .unwrap();
        assert!(matches!(
            rx.decode_datagram(&frame),
            Err(ProtocolError::UnknownMessageType(_))
        ));
    }
}
