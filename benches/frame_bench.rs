use std::sync::Arc;

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use dualnet::core::message::{Message, NetworkMessage, Transport};
use dualnet::core::{MessageSchema, RegistrarCodec};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Clone, Serialize, Deserialize)]
struct Payload(Vec<u8>);

impl NetworkMessage for Payload {
    const NAME: &'static str = "bench.payload-with-a-fairly-long-type-name";
    const TRANSPORT: Transport = Transport::BestEffort;
}

#[derive(Clone, Serialize, Deserialize)]
struct FatPayload(Vec<u8>);

impl NetworkMessage for FatPayload {
    const NAME: &'static str = "bench.fat-payload-with-a-fairly-long-type-name";
    const TRANSPORT: Transport = Transport::BestEffort;
    const COMPACT: bool = false;
}

#[allow(clippy::unwrap_used)]
fn schema() -> Arc<MessageSchema> {
    Arc::new(
        MessageSchema::new()
            .with::<Payload>()
            .unwrap()
            .with::<FatPayload>()
            .unwrap(),
    )
}

#[allow(clippy::unwrap_used)]
fn bench_thin_vs_fat(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");
    let sizes = [16usize, 256, 1024];

    for &size in &sizes {
        let thin = Message::application(&Payload(vec![7; size])).unwrap();
        let fat = Message::application(&FatPayload(vec![7; size])).unwrap();
        group.throughput(Throughput::Bytes(size as u64));

        // Warm codec: the type is already announced, so every frame is THIN.
        let mut warm = RegistrarCodec::new(schema());
        warm.encode_datagram(&thin).unwrap();
        group.bench_function(format!("thin_{size}b"), |b| {
            b.iter(|| warm.encode_datagram(&thin).unwrap())
        });

        let mut codec = RegistrarCodec::new(schema());
        group.bench_function(format!("fat_{size}b"), |b| {
            b.iter(|| codec.encode_datagram(&fat).unwrap())
        });
    }
    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_stream_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");
    let frames = 1000usize;

    let mut tx = RegistrarCodec::new(schema());
    let mut wire = BytesMut::new();
    for i in 0..frames {
        let message = Message::application(&Payload(vec![(i & 0xff) as u8; 128])).unwrap();
        tx.encode(message, &mut wire).unwrap();
    }
    let wire = wire.freeze();
    group.throughput(Throughput::Bytes(wire.len() as u64));

    group.bench_function("stream_1000x128b", |b| {
        b.iter_batched(
            || (RegistrarCodec::new(schema()), BytesMut::from(&wire[..])),
            |(mut rx, mut buffer)| {
                let mut count = 0;
                while rx.decode(&mut buffer).unwrap().is_some() {
                    count += 1;
                }
                assert_eq!(count, frames);
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_thin_vs_fat, bench_stream_decode);
criterion_main!(benches);
