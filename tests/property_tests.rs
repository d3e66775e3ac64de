//! Property-based tests using proptest
//!
//! These tests check registrar and framing invariants across randomly
//! generated message sequences.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::BytesMut;
use dualnet::core::codec::{TAG_NEW, TAG_THIN};
use dualnet::core::message::{Message, NetworkMessage, Transport};
use dualnet::core::{MessageSchema, RegistrarCodec};
use dualnet::error::ProtocolError;
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

macro_rules! message_types {
    ($($ty:ident => $name:literal),* $(,)?) => {
        $(
            #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
            struct $ty(Vec<u8>);

            impl NetworkMessage for $ty {
                const NAME: &'static str = $name;
                const TRANSPORT: Transport = Transport::Reliable;
            }
        )*

        fn schema() -> Arc<MessageSchema> {
            let mut schema = MessageSchema::new();
            $( schema.register::<$ty>().unwrap(); )*
            Arc::new(schema)
        }
    };
}

message_types! {
    Alpha => "prop.alpha",
    Beta => "prop.beta",
    Gamma => "prop.gamma",
    Delta => "prop.delta",
    Epsilon => "prop.epsilon",
}

fn build(kind: usize, body: Vec<u8>) -> Message {
    match kind % 5 {
        0 => Message::application(&Alpha(body)),
        1 => Message::application(&Beta(body)),
        2 => Message::application(&Gamma(body)),
        3 => Message::application(&Delta(body)),
        _ => Message::application(&Epsilon(body)),
    }
    .unwrap()
}

fn sequence() -> impl Strategy<Value = Vec<(usize, Vec<u8>)>> {
    prop::collection::vec((0usize..5, prop::collection::vec(any::<u8>(), 0..64)), 1..64)
}

// Property: a matched registrar pair decodes every frame to what was sent, and
// each class is announced with NEW exactly once.
proptest! {
    #[test]
    fn prop_registrar_pair_preserves_messages(seq in sequence()) {
        let schema = schema();
        let mut tx = RegistrarCodec::new(schema.clone());
        let mut rx = RegistrarCodec::new(schema);
        let mut announced = HashSet::new();

        for (kind, body) in seq {
            let message = build(kind, body);
            let frame = tx.encode_datagram(&message).unwrap();
            let tag = frame[5];
            if announced.insert(message.name().to_owned()) {
                prop_assert_eq!(tag, TAG_NEW);
            } else {
                prop_assert_eq!(tag, TAG_THIN);
            }
            prop_assert_eq!(rx.decode_datagram(&frame).unwrap(), message);
        }

        prop_assert_eq!(tx.outgoing().len(), announced.len());
        for name in &announced {
            prop_assert_eq!(tx.outgoing().id_of(name), rx.incoming().id_of(name));
        }
    }
}

// Property: the stream decoder reassembles frames no matter how the bytes are split.
proptest! {
    #[test]
    fn prop_stream_decode_independent_of_chunking(
        seq in sequence(),
        chunk in 1usize..97,
    ) {
        let schema = schema();
        let mut tx = RegistrarCodec::new(schema.clone());
        let mut rx = RegistrarCodec::new(schema);

        let mut wire = BytesMut::new();
        let mut sent = Vec::new();
        for (kind, body) in seq {
            let message = build(kind, body);
            tx.encode(message.clone(), &mut wire).unwrap();
            sent.push(message);
        }

        let mut buffer = BytesMut::new();
        let mut received = Vec::new();
        for piece in wire.chunks(chunk) {
            buffer.extend_from_slice(piece);
            while let Some(message) = rx.decode(&mut buffer).unwrap() {
                received.push(message);
            }
        }
        prop_assert!(buffer.is_empty());
        prop_assert_eq!(received, sent);
    }
}

// Property: a THIN id the receiver never saw announced is a desync, never a message.
proptest! {
    #[test]
    fn prop_unannounced_thin_id_is_desync(id in any::<u32>()) {
        let mut frame = BytesMut::new();
        frame.extend_from_slice(&6u32.to_be_bytes());
        frame.extend_from_slice(&[dualnet::config::STREAM_VERSION, TAG_THIN]);
        frame.extend_from_slice(&id.to_be_bytes());

        let mut rx = RegistrarCodec::new(schema());
        let result = rx.decode_datagram(&frame);
        prop_assert!(matches!(result, Err(ProtocolError::ProtocolDesync(_))));
    }
}

// Property: arbitrary bytes never panic the decoder.
proptest! {
    #[test]
    fn prop_decoder_survives_garbage(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut rx = RegistrarCodec::new(schema()).with_max_frame_size(4096);
        let _ = rx.decode_datagram(&data);
        let mut buffer = BytesMut::from(&data[..]);
        let _ = rx.decode(&mut buffer);
    }
}
