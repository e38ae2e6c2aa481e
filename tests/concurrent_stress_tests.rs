//! Stress Tests for the Cache
//!
//! These tests verify thread safety and the capacity bound under high
//! contention. Worker threads borrow the cache from the test's stack through a
//! scoped thread pool.

use cache_flight::{Cache, CacheConfig, EvictionPolicy, LoadError};
use scoped_threadpool::Pool;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const NUM_THREADS: usize = 16;
const OPS_PER_THREAD: usize = 10_000;

const ALL_POLICIES: [EvictionPolicy; 4] = [
    EvictionPolicy::Lru,
    EvictionPolicy::Lfu,
    EvictionPolicy::Fifo,
    EvictionPolicy::Random,
];

fn stress_config(capacity: usize, policy: EvictionPolicy) -> CacheConfig {
    CacheConfig::new(NonZeroUsize::new(capacity).unwrap())
        .with_default_ttl(Duration::from_secs(60))
        .with_negative_ttl(Duration::from_secs(1))
        .with_eviction_policy(policy)
}

fn make_cache(capacity: usize, policy: EvictionPolicy) -> Cache<usize, usize> {
    Cache::new(stress_config(capacity, policy)).unwrap()
}

#[test]
fn test_capacity_bound_under_contention() {
    let capacity = 1_000;
    for policy in ALL_POLICIES {
        let cache = make_cache(capacity, policy);
        let mut pool = Pool::new(NUM_THREADS as u32);

        pool.scoped(|scope| {
            for t in 0..NUM_THREADS {
                let cache = &cache;
                scope.execute(move || {
                    for i in 0..OPS_PER_THREAD {
                        let key = t * OPS_PER_THREAD + i;
                        cache.put(key, i);
                        if i % 3 == 0 {
                            cache.get(&(key / 2));
                        }
                    }
                });
            }
        });

        assert!(
            cache.len() <= capacity,
            "{policy:?}: {} entries exceed capacity {capacity}",
            cache.len()
        );
        let stats = cache.stats();
        assert_eq!(
            stats.evictions as usize + cache.len(),
            NUM_THREADS * OPS_PER_THREAD,
            "{policy:?}: every distinct put is either resident or evicted"
        );
    }
}

#[test]
fn test_mixed_operations() {
    let cache = make_cache(500, EvictionPolicy::Lru);
    let mut pool = Pool::new(NUM_THREADS as u32);

    pool.scoped(|scope| {
        for t in 0..NUM_THREADS {
            let cache = &cache;
            scope.execute(move || {
                for i in 0..OPS_PER_THREAD {
                    let key = (t * 7 + i) % 2_000;
                    match i % 5 {
                        0 => cache.put(key, i),
                        1 => cache.invalidate(&key),
                        2 => cache.mark_absent(key),
                        _ => {
                            let _ = cache.get_or_load(key, |k| Ok::<_, LoadError>(Some(*k)));
                        }
                    }
                }
            });
        }
    });

    assert!(cache.len() <= 500);
    assert!(cache.negative_len() <= cache.config().negative_max_entries.get());
    assert_eq!(cache.in_flight_count(), 0);
}

#[test]
fn test_single_flight_across_many_keys() {
    const KEYS: usize = 64;
    let cache = make_cache(10_000, EvictionPolicy::Lru);
    let calls: Vec<AtomicUsize> = (0..KEYS).map(|_| AtomicUsize::new(0)).collect();
    let mut pool = Pool::new(NUM_THREADS as u32);

    pool.scoped(|scope| {
        for t in 0..NUM_THREADS {
            let cache = &cache;
            let calls = &calls;
            scope.execute(move || {
                for i in 0..KEYS * 4 {
                    let key = (t + i) % KEYS;
                    let value = cache
                        .get_or_load(key, |k| {
                            calls[*k].fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(1));
                            Ok::<_, LoadError>(Some(k * 10))
                        })
                        .unwrap();
                    assert_eq!(value, Some(key * 10));
                }
            });
        }
    });

    for (key, count) in calls.iter().enumerate() {
        assert_eq!(
            count.load(Ordering::SeqCst),
            1,
            "key {key} loaded more than once"
        );
    }
    assert_eq!(cache.stats().load_count, KEYS as u64);
}

#[test]
fn test_failing_loads_under_contention() {
    let cache = make_cache(1_000, EvictionPolicy::Fifo);
    let attempts = AtomicUsize::new(0);
    let mut pool = Pool::new(NUM_THREADS as u32);

    pool.scoped(|scope| {
        for _ in 0..NUM_THREADS {
            let cache = &cache;
            let attempts = &attempts;
            scope.execute(move || {
                for i in 0..1_000 {
                    let _ = cache.get_or_load(i % 50, |_| {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err::<Option<usize>, _>(LoadError::msg("unavailable"))
                    });
                }
            });
        }
    });

    assert!(cache.is_empty(), "failures are never stored");
    assert_eq!(cache.negative_len(), 0, "failures are never marked absent");
    let stats = cache.stats();
    assert_eq!(stats.load_errors, stats.load_count);
    assert_eq!(stats.load_count as usize, attempts.load(Ordering::SeqCst));
}

#[test]
fn test_concurrent_invalidate_all() {
    let cache = make_cache(2_000, EvictionPolicy::Lfu);
    let mut pool = Pool::new(NUM_THREADS as u32);

    pool.scoped(|scope| {
        for t in 0..NUM_THREADS {
            let cache = &cache;
            scope.execute(move || {
                for i in 0..OPS_PER_THREAD / 10 {
                    if t == 0 && i % 100 == 0 {
                        cache.invalidate_all();
                    } else {
                        cache.put(t * OPS_PER_THREAD + i, i);
                        cache.get(&(t * OPS_PER_THREAD + i));
                    }
                }
            });
        }
    });

    assert!(cache.len() <= 2_000);
    cache.invalidate_all();
    assert!(cache.is_empty());
}
