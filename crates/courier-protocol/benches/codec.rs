//! Codec benchmarks for courier-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use courier_protocol::{codec, MessageKind};

fn bench_encode_small(c: &mut Criterion) {
    let payload = "A".repeat(64);

    let mut group = c.benchmark_group("encode_server");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::encode_server(MessageKind::Message, black_box("u2"), black_box(&payload)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let raw = format!(r#"{{"type":"message","to":"u1","payload":"{}"}}"#, "A".repeat(64));

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(raw.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(raw.as_bytes())))
    });
    group.finish();
}

fn bench_error_frame(c: &mut Criterion) {
    c.bench_function("encode_error", |b| {
        b.iter(|| codec::encode_error(black_box("PARSE_ERROR"), black_box("Invalid message format")))
    });
}

criterion_group!(benches, bench_encode_small, bench_decode_small, bench_error_frame);
criterion_main!(benches);
