//! Criterion benchmarks for the token bucket's hot `request()` path.
//!
//! The bucket's `request()` is called once per ingest operation to decide
//! the pacing delay; it takes a single spinlock-style `parking_lot::Mutex`
//! and does a handful of `u128` multiplications, so the interesting
//! question is how that scales under concurrent callers, not whether any
//! single call is slow.
//!
//! Run with: cargo bench --bench token_bucket_bench

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use c1_ingest::TokenBucket;

fn request_uncontended(c: &mut Criterion) {
    let bucket = TokenBucket::new(1_000_000, 1_000_000);
    c.bench_function("request_uncontended", |b| {
        b.iter(|| black_box(bucket.request(black_box(10))));
    });
}

fn request_in_debt(c: &mut Criterion) {
    let bucket = TokenBucket::new(1000, 1000);
    // Push the bucket into a steady debt so every call exercises the
    // debt-to-delay multiplication, not just the credit-withdrawal path.
    bucket.request(5000);
    c.bench_function("request_in_debt", |b| {
        b.iter(|| black_box(bucket.request(black_box(1))));
    });
}

fn request_under_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_contended");
    for threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let bucket = Arc::new(TokenBucket::new(1_000_000, 1_000_000));
            b.iter(|| {
                thread::scope(|scope| {
                    for _ in 0..threads {
                        let bucket = bucket.clone();
                        scope.spawn(move || {
                            for _ in 0..100 {
                                black_box(bucket.request(black_box(5)));
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, request_uncontended, request_in_debt, request_under_contention);
criterion_main!(benches);
