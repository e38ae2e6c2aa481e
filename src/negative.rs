//! Negative Cache
//!
//! Remembers keys the loader confirmed absent so repeated lookups for them do
//! not reach the source again. Markers live in their own namespace, separate
//! from positive entries, so "absent" is never confused with "present".
//!
//! Markers are distrusted sooner than values: their TTL is configured
//! separately and must be strictly shorter than the positive TTL.
//!
//! The marker set is bounded by `negative_max_entries` and evicts in FIFO
//! order. Recency or frequency bookkeeping buys nothing for a set that is
//! already TTL-gated, and a flood of distinct missing keys simply cycles
//! through it.

use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::policy::{EvictionPolicy, EvictionTracker};
use crate::store::{effective_segments, segment_capacities};

#[cfg(feature = "hashbrown")]
use hashbrown::{DefaultHashBuilder, HashMap};

#[cfg(not(feature = "hashbrown"))]
use std::collections::{hash_map::RandomState as DefaultHashBuilder, HashMap};

/// "This key had no value as of `marked_at`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegativeMarker {
    /// When the absence was recorded.
    pub marked_at: Instant,
    /// How long the absence is trusted.
    pub ttl: Duration,
}

impl NegativeMarker {
    /// Returns `true` once `now` has reached `marked_at + ttl`.
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.marked_at.checked_add(self.ttl) {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

struct NegativeSegment<K, S> {
    map: HashMap<K, NegativeMarker, S>,
    order: EvictionTracker<K>,
    cap: usize,
    evictions: u64,
}

impl<K, S> NegativeSegment<K, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    fn is_marked<Q>(&mut self, key: &Q, now: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let Some(marker) = self.map.get(key) else {
            return false;
        };
        if marker.is_expired(now) {
            self.map.remove(key);
            self.order.record_remove(key);
            trace!("removed expired negative marker");
            return false;
        }
        true
    }

    fn mark(&mut self, key: K, marker: NegativeMarker) {
        if let Some(existing) = self.map.get_mut(&key) {
            *existing = marker;
            self.order.record_update(&key);
            return;
        }
        if self.map.len() >= self.cap {
            match self.order.select_victim() {
                Ok(victim) => {
                    self.map.remove(&victim);
                    self.evictions += 1;
                    trace!("evicted negative marker");
                }
                Err(err) => panic!("negative cache segment: {err}"),
            }
        }
        self.map.insert(key.clone(), marker);
        self.order.record_insert(key);
    }

    fn clear_key<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.map.remove(key).is_some() {
            self.order.record_remove(key);
            true
        } else {
            false
        }
    }
}

/// Bounded, sharded set of [`NegativeMarker`]s with lazy expiry.
pub struct NegativeCache<K, S = DefaultHashBuilder> {
    segments: Box<[Mutex<NegativeSegment<K, S>>]>,
    hash_builder: S,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl<K> NegativeCache<K, DefaultHashBuilder>
where
    K: Hash + Eq + Clone,
{
    /// Creates a negative cache sized by `config.negative_max_entries`.
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_hasher(config, clock, DefaultHashBuilder::default())
    }
}

impl<K, S> NegativeCache<K, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone,
{
    /// Creates a negative cache with a custom hash builder.
    pub fn with_hasher(config: &CacheConfig, clock: Arc<dyn Clock>, hash_builder: S) -> Self {
        let total = config.negative_max_entries.get();
        let count = effective_segments(total, config.segments);
        let segments: Vec<_> = segment_capacities(total, count)
            .map(|cap| {
                Mutex::new(NegativeSegment {
                    map: HashMap::with_hasher(hash_builder.clone()),
                    order: EvictionPolicy::Fifo.tracker(),
                    cap,
                    evictions: 0,
                })
            })
            .collect();

        Self {
            segments: segments.into_boxed_slice(),
            hash_builder,
            clock,
            default_ttl: config.negative_ttl,
        }
    }

    #[inline]
    fn segment_index<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash,
    {
        (self.hash_builder.hash_one(key) as usize) % self.segments.len()
    }

    /// Records that `key` is absent for `ttl`.
    ///
    /// Re-marking an already marked key restarts its lifetime.
    pub fn mark_absent(&self, key: K, ttl: Duration) {
        let marker = NegativeMarker {
            marked_at: self.clock.now(),
            ttl,
        };
        let idx = self.segment_index(&key);
        self.segments[idx].lock().mark(key, marker);
    }

    /// Records that `key` is absent for the configured negative TTL.
    pub fn mark_absent_default(&self, key: K) {
        self.mark_absent(key, self.default_ttl);
    }

    /// Returns `true` if an unexpired marker exists. Expired markers are
    /// removed on sight.
    pub fn is_marked_absent<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let now = self.clock.now();
        let idx = self.segment_index(key);
        self.segments[idx].lock().is_marked(key, now)
    }

    /// Returns the unexpired marker for `key` without removing anything.
    pub fn marker<Q>(&self, key: &Q) -> Option<NegativeMarker>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let now = self.clock.now();
        let idx = self.segment_index(key);
        let segment = self.segments[idx].lock();
        segment
            .map
            .get(key)
            .copied()
            .filter(|marker| !marker.is_expired(now))
    }

    /// Forgets the marker for `key`. Returns whether one existed.
    pub fn clear<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let idx = self.segment_index(key);
        self.segments[idx].lock().clear_key(key)
    }

    /// Forgets every marker.
    pub fn clear_all(&self) {
        for segment in self.segments.iter() {
            let mut segment = segment.lock();
            segment.map.clear();
            segment.order.clear();
        }
    }

    /// Number of stored markers, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.lock().map.len()).sum()
    }

    /// Returns `true` if no markers are stored.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.lock().map.is_empty())
    }

    /// Maximum number of markers, equal to `negative_max_entries`.
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(|s| s.lock().cap).sum()
    }

    /// Markers dropped to stay within capacity.
    pub fn evictions(&self) -> u64 {
        self.segments.iter().map(|s| s.lock().evictions).sum()
    }

    /// The TTL used by [`mark_absent_default`](Self::mark_absent_default).
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl<K, S> fmt::Debug for NegativeCache<K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegativeCache")
            .field("segments", &self.segments.len())
            .field("default_ttl", &self.default_ttl)
            .finish_non_exhaustive()
    }
}
