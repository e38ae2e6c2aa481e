//! Concurrent Cache Benchmarks
//!
//! Benchmarks for measuring cache throughput under contention, across eviction
//! policies, segment counts and read-through stampedes.

use cache_flight::{Cache, CacheConfig, EvictionPolicy, LoadError};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CACHE_SIZE: usize = 10_000;
const OPS_PER_THREAD: usize = 1_000;
const THREADS: usize = 8;

const POLICIES: [(EvictionPolicy, &str); 4] = [
    (EvictionPolicy::Lru, "LRU"),
    (EvictionPolicy::Lfu, "LFU"),
    (EvictionPolicy::Fifo, "FIFO"),
    (EvictionPolicy::Random, "Random"),
];

fn make_cache(policy: EvictionPolicy, segments: usize) -> Arc<Cache<usize, usize>> {
    let config = CacheConfig::new(NonZeroUsize::new(CACHE_SIZE).unwrap())
        .with_default_ttl(Duration::from_secs(3600))
        .with_eviction_policy(policy)
        .with_segments(segments);
    Arc::new(Cache::new(config).unwrap())
}

/// Benchmark concurrent read operations across eviction policies
fn concurrent_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("Concurrent Reads");
    group.throughput(Throughput::Elements((THREADS * OPS_PER_THREAD) as u64));

    for (policy, name) in POLICIES {
        let cache = make_cache(policy, 16);
        for i in 0..CACHE_SIZE {
            cache.put(i, i);
        }
        group.bench_function(name, |b| {
            b.iter(|| run_concurrent(Arc::clone(&cache), THREADS, OPS_PER_THREAD, 0));
        });
    }

    group.finish();
}

/// Benchmark concurrent mixed operations (75% reads, 25% writes)
fn concurrent_mixed(c: &mut Criterion) {
    let mut group = c.benchmark_group("Concurrent Mixed");
    group.throughput(Throughput::Elements((THREADS * OPS_PER_THREAD) as u64));

    for (policy, name) in POLICIES {
        let cache = make_cache(policy, 16);
        group.bench_function(name, |b| {
            b.iter(|| run_concurrent(Arc::clone(&cache), THREADS, OPS_PER_THREAD, 4));
        });
    }

    group.finish();
}

/// Compare lock striping widths for the same workload
fn segment_count_comparison(c: &mut Criterion) {
    let mut group = c.benchmark_group("Segment Count");
    group.throughput(Throughput::Elements((THREADS * OPS_PER_THREAD) as u64));

    for segments in [1, 4, 16, 64] {
        let cache = make_cache(EvictionPolicy::Lru, segments);
        group.bench_with_input(BenchmarkId::from_parameter(segments), &segments, |b, _| {
            b.iter(|| run_concurrent(Arc::clone(&cache), THREADS, OPS_PER_THREAD, 4));
        });
    }

    group.finish();
}

/// Many threads missing the same small key set at once
fn read_through_stampede(c: &mut Criterion) {
    let mut group = c.benchmark_group("Read-Through Stampede");
    group.throughput(Throughput::Elements((THREADS * OPS_PER_THREAD) as u64));

    for hot_keys in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(hot_keys), &hot_keys, |b, &hot| {
            b.iter(|| {
                let cache = make_cache(EvictionPolicy::Lru, 16);
                let handles: Vec<_> = (0..THREADS)
                    .map(|t| {
                        let cache = Arc::clone(&cache);
                        thread::spawn(move || {
                            for i in 0..OPS_PER_THREAD {
                                let key = (t + i) % hot;
                                black_box(
                                    cache
                                        .get_or_load(key, |k| Ok::<_, LoadError>(Some(k * 2)))
                                        .ok(),
                                );
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Runs `threads` workers; every `write_every`-th op is a put (0 means reads only).
fn run_concurrent(
    cache: Arc<Cache<usize, usize>>,
    threads: usize,
    ops: usize,
    write_every: usize,
) {
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..ops {
                    let key = (t * ops + i) % (CACHE_SIZE * 2);
                    if write_every != 0 && i % write_every == 0 {
                        cache.put(key, i);
                    } else {
                        black_box(cache.get(&key));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

criterion_group!(
    benches,
    concurrent_reads,
    concurrent_mixed,
    segment_count_comparison,
    read_through_stampede
);
criterion_main!(benches);
