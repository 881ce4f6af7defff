// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Benchmarks for the persistent queue.
//!
//! Measures:
//! - Single enqueue latency
//! - Enqueue and dequeue throughput at different payload sizes
//! - Enqueue-to-dequeue round trip through an async waiter
//! - Garbage collection after a drained batch

use std::{hint::black_box, sync::Arc, thread};

use bigqueue::{BigQueue, QueueBuilder, config::MINIMUM_DATA_PAGE_SIZE};
use bytes::Bytes;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tempfile::TempDir;

/// Payload sizes to benchmark (bytes)
const PAYLOAD_SIZES: &[usize] = &[64, 256, 1024, 4096, 16384];

/// Number of items for throughput tests
const BATCH_SIZE: usize = 10_000;

fn create_queue(temp_dir: &TempDir) -> BigQueue {
    QueueBuilder::new(temp_dir.path(), "bench")
        .data_page_size(MINIMUM_DATA_PAGE_SIZE)
        .build()
        .expect("Failed to create queue")
}

fn generate_payload(size: usize) -> Bytes { Bytes::from(vec![0xABu8; size]) }

fn fill(queue: &BigQueue, payload: &Bytes, count: usize) {
    for _ in 0..count {
        queue.enqueue(payload).unwrap();
    }
}

// =============================================================================
// Single Enqueue Latency
// =============================================================================

fn bench_enqueue_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_latency");

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let queue = create_queue(&temp_dir);
            let payload = generate_payload(size);

            b.iter(|| {
                queue.enqueue(black_box(&payload)).unwrap();
            });

            queue.close().unwrap();
        });
    }

    group.finish();
}

// =============================================================================
// Throughput
// =============================================================================

fn bench_enqueue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("enqueue_throughput");
    group.sample_size(20);

    for &size in PAYLOAD_SIZES {
        group.throughput(Throughput::Bytes((size * BATCH_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let queue = create_queue(&temp_dir);
                    (temp_dir, queue, generate_payload(size))
                },
                |(temp_dir, queue, payload)| {
                    fill(&queue, black_box(&payload), BATCH_SIZE);
                    queue.close().unwrap();
                    drop(temp_dir);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

fn bench_dequeue_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("dequeue_throughput");
    group.sample_size(20);

    for &size in &[256, 1024, 4096] {
        group.throughput(Throughput::Bytes((size * BATCH_SIZE) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let queue = create_queue(&temp_dir);
                    fill(&queue, &generate_payload(size), BATCH_SIZE);
                    (temp_dir, queue)
                },
                |(temp_dir, queue)| {
                    while let Some(payload) = queue.dequeue().unwrap() {
                        black_box(payload);
                    }
                    queue.close().unwrap();
                    drop(temp_dir);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

fn bench_concurrent_enqueue_dequeue(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_enqueue_dequeue");
    group.sample_size(10);

    let size = 256;
    group.throughput(Throughput::Bytes((size * BATCH_SIZE) as u64));
    group.bench_function(BenchmarkId::from_parameter(size), |b| {
        b.iter_batched(
            || {
                let temp_dir = TempDir::new().unwrap();
                let queue = Arc::new(create_queue(&temp_dir));
                (temp_dir, queue, generate_payload(size))
            },
            |(temp_dir, queue, payload)| {
                let producer = {
                    let queue = queue.clone();
                    thread::spawn(move || fill(&queue, &payload, BATCH_SIZE))
                };

                let mut received = 0;
                while received < BATCH_SIZE {
                    if let Some(payload) = queue.dequeue().unwrap() {
                        black_box(payload);
                        received += 1;
                    } else {
                        thread::yield_now();
                    }
                }

                producer.join().unwrap();
                queue.close().unwrap();
                drop(temp_dir);
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// =============================================================================
// Async Waiter Round Trip
// =============================================================================

/// Register a dequeue waiter on an empty queue, enqueue, and wait for the
/// waiter to complete.
fn bench_waiter_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("waiter_round_trip");

    for &size in &[64, 256, 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let temp_dir = TempDir::new().unwrap();
            let queue = create_queue(&temp_dir);
            let payload = generate_payload(size);

            b.iter(|| {
                let waiter = queue.dequeue_async().unwrap();
                queue.enqueue(&payload).unwrap();
                black_box(waiter.wait().unwrap());
            });

            queue.close().unwrap();
        });
    }

    group.finish();
}

// =============================================================================
// Garbage Collection
// =============================================================================

fn bench_gc_after_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("gc_after_drain");
    group.sample_size(10);

    let size = 4096;
    group.bench_function(BenchmarkId::from_parameter(BATCH_SIZE), |b| {
        b.iter_batched(
            || {
                let temp_dir = TempDir::new().unwrap();
                let queue = create_queue(&temp_dir);
                fill(&queue, &generate_payload(size), BATCH_SIZE);
                while queue.dequeue().unwrap().is_some() {}
                (temp_dir, queue)
            },
            |(temp_dir, queue)| {
                queue.gc().unwrap();
                queue.close().unwrap();
                drop(temp_dir);
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

// =============================================================================
// Criterion Configuration
// =============================================================================

criterion_group!(
    benches,
    bench_enqueue_latency,
    bench_enqueue_throughput,
    bench_dequeue_throughput,
    bench_concurrent_enqueue_dequeue,
    bench_waiter_round_trip,
    bench_gc_after_drain,
);

criterion_main!(benches);
