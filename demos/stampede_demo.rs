//! Stampede Demo
//!
//! Fires a burst of concurrent lookups at a handful of keys backed by a slow
//! "database", then prints how many queries actually reached it.
//!
//! ```sh
//! RUST_LOG=cache_flight=debug cargo run --example stampede_demo
//! ```

use cache_flight::{Cache, CacheConfig, CacheMetrics, LoadError};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const CALLERS: usize = 64;
const KEYS: usize = 4;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let queries = Arc::new(AtomicUsize::new(0));
    let config = CacheConfig::new(NonZeroUsize::new(1_000).unwrap())
        .with_default_ttl(Duration::from_secs(2))
        .with_negative_ttl(Duration::from_millis(500))
        .with_refresh_ahead_fraction(0.7)
        .with_refresh_interval(Duration::from_millis(50));

    let cache: Arc<Cache<u64, String>> = {
        let queries = Arc::clone(&queries);
        Arc::new(
            Cache::builder(config)
                .loader(move |id: &u64| -> Result<Option<String>, LoadError> {
                    queries.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    // Odd ids do not exist in the "database".
                    Ok((id % 2 == 0).then(|| format!("row-{id}")))
                })
                .build()
                .expect("valid cache config"),
        )
    };

    let started = Instant::now();
    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.load((i % KEYS) as u64))
        })
        .collect();
    for handle in handles {
        if let Err(err) = handle.join().expect("caller panicked") {
            eprintln!("load failed: {err}");
        }
    }

    println!(
        "{CALLERS} callers over {KEYS} keys took {:?} and issued {} queries",
        started.elapsed(),
        queries.load(Ordering::SeqCst)
    );

    // Keep key 0 hot long enough for background refresh to kick in.
    let until = Instant::now() + Duration::from_secs(3);
    while Instant::now() < until {
        let _ = cache.get(&0);
        thread::sleep(Duration::from_millis(10));
    }
    cache.shutdown();

    let stats = cache.stats();
    println!(
        "hit rate {:.1}%, negative hits {}, coalesced waits {}, refreshes {}",
        stats.hit_rate() * 100.0,
        stats.negative_hits,
        stats.coalesced_waits,
        stats.refreshes
    );
    for (name, value) in cache.metrics() {
        println!("  {name:<20} {value}");
    }
}
