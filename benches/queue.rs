// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// FifoQueue enqueue/dequeue hot-path benchmarks.
//
// Run with:
//   cargo bench --bench queue
//
// Groups:
//   enqueue_dequeue — paired round trip at three record sizes
//   drain_full      — repeated dequeue against a pre-filled queue

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use udprelay::FifoQueue;

const SIZES: &[(&str, usize)] = &[("ack_2", 2), ("packet_256", 256), ("payload_max_251", 251)];

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_dequeue");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let q = FifoQueue::create(32, 256).unwrap();
            let item = vec![0xABu8; sz];
            let mut out = vec![0u8; 256];
            b.iter(|| {
                q.enqueue(&item).unwrap();
                let n = q.dequeue(&mut out).unwrap();
                black_box(n)
            });
        });
    }

    group.finish();
}

fn bench_drain_full(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain_full");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Elements(32));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let item = vec![0xABu8; sz];
            let mut out = vec![0u8; 256];
            b.iter(|| {
                let q = FifoQueue::create(32, 256).unwrap();
                for _ in 0..32 {
                    q.enqueue(&item).unwrap();
                }
                for _ in 0..32 {
                    black_box(q.dequeue(&mut out).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_drain_full);
criterion_main!(benches);
