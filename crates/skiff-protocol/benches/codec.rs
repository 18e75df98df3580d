//! Codec benchmarks for skiff-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use skiff_protocol::{codec, Message};

fn bench_encode_ascii(c: &mut Criterion) {
    let payload = vec![0u8; 64];

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("ascii_64B", |b| b.iter(|| Message::data(black_box(&payload))));
    group.finish();
}

fn bench_decode_modes(c: &mut Criterion) {
    let small = codec::encode(&Message::data(vec![0u8; 64]));
    let large = codec::encode(&Message::data(vec![0u8; 128 * 1024]));

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(small.len() as u64));
    group.bench_function("ascii_64B", |b| b.iter(|| codec::decode(black_box(&small))));
    group.throughput(Throughput::Bytes(large.len() as u64));
    group.bench_function("binary_128KiB", |b| {
        b.iter(|| codec::decode(black_box(&large)))
    });
    group.finish();
}

fn bench_streaming(c: &mut Criterion) {
    let mut stream = BytesMut::new();
    for _ in 0..100 {
        codec::encode_into(&Message::data(vec![0u8; 256]), &mut stream);
    }
    let stream = stream.freeze();

    c.bench_function("stream_100x256B", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&stream[..]);
            let mut count = 0;
            while let Ok(Some(message)) = codec::decode_from(&mut buf) {
                black_box(message);
                count += 1;
            }
            count
        })
    });
}

criterion_group!(
    benches,
    bench_encode_ascii,
    bench_decode_modes,
    bench_streaming
);
criterion_main!(benches);
