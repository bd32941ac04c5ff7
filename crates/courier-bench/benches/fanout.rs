//! Hub fan-out benchmarks for Courier.
//!
//! These benchmarks measure relay cost through the hub event loop.

use courier_bench::{message, register_devices, spawn_hub};
use courier_core::{ClientHandle, RelayEnvelope};
use courier_protocol::{codec, MessageKind};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Instant;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Benchmark relay through the hub to a user with N devices.
fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fanout");

    for devices in [1usize, 4, 16] {
        let hub = rt.block_on(async {
            let hub = spawn_hub();
            register_devices(&hub, "u1", devices).await;
            hub
        });

        group.throughput(Throughput::Elements(devices as u64));
        group.bench_with_input(BenchmarkId::from_parameter(devices), &devices, |b, _| {
            b.to_async(&rt).iter_custom(|iters| {
                let hub = hub.clone();
                async move {
                    let start = Instant::now();
                    for _ in 0..iters {
                        hub.relay(message("u1", 256)).await.unwrap();
                    }
                    hub.flush().await.unwrap();
                    start.elapsed()
                }
            });
        });
    }

    group.finish();
}

/// Benchmark the per-relay encode the hub performs once per fan-out.
fn bench_relay_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("relay_encode");

    for size in [64usize, 1024, 65536] {
        let envelope: RelayEnvelope = message("u1", size).with_message_id("bench-id");
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &envelope, |b, env| {
            b.iter(|| black_box(env).encode().unwrap())
        });
    }

    group.finish();
}

/// Benchmark the non-blocking enqueue used by every delivery.
fn bench_enqueue(c: &mut Criterion) {
    let frame = codec::encode_server(MessageKind::Message, "u2", "payload").unwrap();

    c.bench_function("enqueue", |b| {
        b.iter_custom(|iters| {
            let (handle, mut outbound) = ClientHandle::new("u1", "d1", iters as usize + 1);
            let start = Instant::now();
            for _ in 0..iters {
                handle.enqueue(black_box(frame.clone()));
            }
            let elapsed = start.elapsed();
            while outbound.try_recv().is_ok() {}
            elapsed
        });
    });
}

criterion_group!(benches, bench_fanout, bench_relay_encode, bench_enqueue);
criterion_main!(benches);
