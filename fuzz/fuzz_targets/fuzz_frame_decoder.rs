#![no_main]

use std::sync::Arc;

use bytes::BytesMut;
use dualnet::core::message::{NetworkMessage, Transport};
use dualnet::core::{MessageSchema, RegistrarCodec};
use libfuzzer_sys::fuzz_target;
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

#[derive(Serialize, Deserialize)]
struct Probe(Vec<u8>);

impl NetworkMessage for Probe {
    const NAME: &'static str = "fuzz.probe";
    const TRANSPORT: Transport = Transport::Reliable;
}

fuzz_target!(|data: &[u8]| {
    let mut schema = MessageSchema::new();
    if schema.register::<Probe>().is_err() {
        return;
    }
    let schema = Arc::new(schema);

    // Datagram path: exactly one frame or an error.
    let mut codec = RegistrarCodec::new(schema.clone()).with_max_frame_size(64 * 1024);
    let _ = codec.decode_datagram(data);

    // Stream path: keep decoding until the buffer runs dry or errors.
    let mut codec = RegistrarCodec::new(schema).with_max_frame_size(64 * 1024);
    let mut buffer = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buffer) {}
});
