//! Cache Metrics
//!
//! Two layers of counters feed [`CacheStats`]:
//!
//! - [`StoreMetrics`] lives inside each store segment and is updated under the
//!   segment lock (evictions, expirations, insertions, replacements).
//! - [`Counters`] holds the request-path counters (hits, misses, loads) as
//!   relaxed atomics shared by the facade, the coordinator and the refresh
//!   scheduler.
//!
//! [`CacheStats`] is a point-in-time snapshot of both. Counters are read one
//! at a time, so a snapshot taken under load is not a single atomic cut.
//!
//! [`CacheMetrics`] reports the same numbers as a `BTreeMap` so output order
//! is deterministic across runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-segment store counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreMetrics {
    /// Entries removed to make room for a new key.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// New keys stored.
    pub insertions: u64,
    /// Existing keys whose value was replaced.
    pub replacements: u64,
}

impl StoreMetrics {
    pub(crate) fn merge(&mut self, other: &StoreMetrics) {
        self.evictions += other.evictions;
        self.expirations += other.expirations;
        self.insertions += other.insertions;
        self.replacements += other.replacements;
    }
}

/// Request-path counters shared across components.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) negative_hits: AtomicU64,
    pub(crate) load_count: AtomicU64,
    pub(crate) load_errors: AtomicU64,
    pub(crate) coalesced_waits: AtomicU64,
    pub(crate) refreshes: AtomicU64,
    pub(crate) refresh_errors: AtomicU64,
}

impl Counters {
    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, store: StoreMetrics) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.hits),
            misses: load(&self.misses),
            evictions: store.evictions,
            negative_hits: load(&self.negative_hits),
            load_count: load(&self.load_count),
            load_errors: load(&self.load_errors),
            expirations: store.expirations,
            coalesced_waits: load(&self.coalesced_waits),
            refreshes: load(&self.refreshes),
            refresh_errors: load(&self.refresh_errors),
        }
    }
}

/// Snapshot of cache activity since construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the store.
    pub hits: u64,
    /// Lookups that found no live entry.
    pub misses: u64,
    /// Entries removed to respect `max_entries`.
    pub evictions: u64,
    /// Loading lookups short-circuited by a negative marker.
    pub negative_hits: u64,
    /// Loader invocations, foreground and background.
    pub load_count: u64,
    /// Loader invocations that failed.
    pub load_errors: u64,
    /// Entries found expired and removed.
    pub expirations: u64,
    /// Callers that attached to another caller's in-flight load.
    pub coalesced_waits: u64,
    /// Background refreshes whose reloaded value was stored.
    pub refreshes: u64,
    /// Background refreshes that failed.
    pub refresh_errors: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let requests = self.hits + self.misses;
        if requests > 0 {
            self.hits as f64 / requests as f64
        } else {
            0.0
        }
    }

    /// Fraction of lookups that missed, or 0.0 before any lookup.
    pub fn miss_rate(&self) -> f64 {
        let requests = self.hits + self.misses;
        if requests > 0 {
            self.misses as f64 / requests as f64
        } else {
            0.0
        }
    }

    /// Converts the snapshot to a sorted metric map.
    pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();

        metrics.insert("cache_hits".to_string(), self.hits as f64);
        metrics.insert("cache_misses".to_string(), self.misses as f64);
        metrics.insert("coalesced_waits".to_string(), self.coalesced_waits as f64);
        metrics.insert("evictions".to_string(), self.evictions as f64);
        metrics.insert("expirations".to_string(), self.expirations as f64);
        metrics.insert("load_count".to_string(), self.load_count as f64);
        metrics.insert("load_errors".to_string(), self.load_errors as f64);
        metrics.insert("negative_hits".to_string(), self.negative_hits as f64);
        metrics.insert("refresh_errors".to_string(), self.refresh_errors as f64);
        metrics.insert("refreshes".to_string(), self.refreshes as f64);
        metrics.insert("requests".to_string(), (self.hits + self.misses) as f64);

        metrics.insert("hit_rate".to_string(), self.hit_rate());
        metrics.insert("miss_rate".to_string(), self.miss_rate());

        if self.load_count > 0 {
            metrics.insert(
                "load_error_rate".to_string(),
                self.load_errors as f64 / self.load_count as f64,
            );
        }

        metrics
    }
}

/// Uniform metrics reporting.
///
/// Keys of the returned map are sorted, which keeps logs and benchmark
/// comparisons stable between runs.
pub trait CacheMetrics {
    /// Returns all metrics as name/value pairs.
    fn metrics(&self) -> BTreeMap<String, f64>;

    /// Short name of the eviction algorithm in use (e.g. "LRU").
    fn algorithm_name(&self) -> &'static str;
}
