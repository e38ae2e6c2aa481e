//! Bounded Sharded Store
//!
//! The store owns every positive [`CacheEntry`]. Keys are partitioned across
//! independent segments, each behind its own lock, so operations on different
//! keys rarely contend.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Store                                 │
//! │                                                                  │
//! │  hash(key) % N  ──▶  Segment Selection                           │
//! │                                                                  │
//! │  ┌─────────────────┐ ┌─────────────────┐     ┌─────────────────┐ │
//! │  │   Segment 0     │ │   Segment 1     │ ... │   Segment N-1   │ │
//! │  │  Mutex {        │ │  Mutex {        │     │  Mutex {        │ │
//! │  │   map: K→Entry  │ │   map: K→Entry  │     │   map: K→Entry  │ │
//! │  │   tracker       │ │   tracker       │     │   tracker       │ │
//! │  │   cap, metrics  │ │   cap, metrics  │     │   cap, metrics  │ │
//! │  │  }              │ │  }              │     │  }              │ │
//! │  └─────────────────┘ └─────────────────┘     └─────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Segment Count
//!
//! Eviction order is exact within a segment and approximate across them.
//! Small stores therefore use fewer segments than requested: one segment per
//! 32 entries of capacity, up to the configured count. A store with
//! `max_entries <= 63` is a single segment with exact policy order.
//!
//! Per-segment capacities sum to exactly `max_entries`, so the global bound
//! holds whichever segments fill up first.
//!
//! ## Expiry
//!
//! Expiry is lazy. A read that finds an expired entry removes it and reports
//! absence; nothing runs in the background unless [`Store::purge_expired`]
//! is called. Expiry is always checked before access bookkeeping, so reading
//! an expired entry never makes it look recent.

use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::Error;
use crate::metrics::StoreMetrics;
use crate::policy::{EvictionPolicy, EvictionTracker};

#[cfg(feature = "hashbrown")]
use hashbrown::{DefaultHashBuilder, HashMap};

#[cfg(not(feature = "hashbrown"))]
use std::collections::{hash_map::RandomState as DefaultHashBuilder, HashMap};

/// Capacity each segment should cover before another segment is added.
const ENTRIES_PER_SEGMENT: usize = 32;

/// Number of segments actually used for `max_entries` and a requested count.
pub(crate) fn effective_segments(max_entries: usize, requested: usize) -> usize {
    requested
        .min((max_entries / ENTRIES_PER_SEGMENT).max(1))
        .max(1)
}

/// Splits `total` across `segments` so the parts sum to `total` exactly.
pub(crate) fn segment_capacities(total: usize, segments: usize) -> impl Iterator<Item = usize> {
    let base = total / segments;
    let extra = total % segments;
    (0..segments).map(move |i| if i < extra { base + 1 } else { base })
}

struct StoreSegment<K, V, S> {
    map: HashMap<K, CacheEntry<V>, S>,
    tracker: EvictionTracker<K>,
    cap: usize,
    metrics: StoreMetrics,
}

impl<K, V, S> StoreSegment<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    fn new(cap: usize, policy: EvictionPolicy, hash_builder: S) -> Self {
        Self {
            map: HashMap::with_hasher(hash_builder),
            tracker: policy.tracker(),
            cap,
            metrics: StoreMetrics::default(),
        }
    }

    /// Looks up a live entry, recording the access.
    fn get<Q>(&mut self, key: &Q, now: Instant) -> Option<&CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let live = self.map.get_mut(key)?.record_access(now);
        if !live {
            self.expire(key);
            return None;
        }
        self.tracker.record_access(key);
        self.map.get(key)
    }

    /// Looks up a live entry without touching any bookkeeping.
    fn peek<Q>(&self, key: &Q, now: Instant) -> Option<&CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.map.get(key).filter(|entry| !entry.is_expired(now))
    }

    fn expire<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.map.remove(key).is_some() {
            self.tracker.record_remove(key);
            self.metrics.expirations += 1;
            trace!("removed expired entry");
        }
    }

    /// Inserts or replaces. Returns the evicted entry when a new key displaced one.
    fn put(
        &mut self,
        key: K,
        value: V,
        now: Instant,
        ttl: Option<Duration>,
    ) -> Result<Option<(K, V)>, Error> {
        if let Some(entry) = self.map.get_mut(&key) {
            entry.replace(value, now, ttl);
            self.tracker.record_update(&key);
            self.metrics.replacements += 1;
            return Ok(None);
        }

        let mut evicted = None;
        if self.map.len() >= self.cap {
            let victim = self.tracker.select_victim()?;
            if let Some(entry) = self.map.remove(&victim) {
                self.metrics.evictions += 1;
                trace!(policy = self.tracker.policy().name(), "evicted entry");
                evicted = Some((victim, entry.value));
            }
        }

        self.map
            .insert(key.clone(), CacheEntry::new(value, now, ttl));
        self.tracker.record_insert(key);
        self.metrics.insertions += 1;
        debug_assert_eq!(self.tracker.len(), self.map.len());
        Ok(evicted)
    }

    fn remove<Q>(&mut self, key: &Q) -> Option<CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let entry = self.map.remove(key)?;
        self.tracker.record_remove(key);
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<K> = self
            .map
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.expire(key);
        }
        expired.len()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.tracker.clear();
    }
}

/// An entry inside the refresh-ahead window, as seen by [`Store::expiring`].
#[derive(Debug, Clone)]
pub struct ExpiringKey<K> {
    /// The entry's key.
    pub key: K,
    /// When the current value was stored.
    pub inserted_at: Instant,
    /// The TTL the current value was stored with.
    pub ttl: Duration,
    /// Lifetime read count of the key.
    pub access_count: u64,
    /// Fraction of `ttl` elapsed at scan time, in `[fraction, 1)`.
    pub elapsed_fraction: f64,
}

/// Lazy iterator over entries inside the refresh-ahead window.
///
/// Each time the internal buffer runs dry, exactly one segment is locked and
/// its matching entries are copied out, so a scan never holds a lock across
/// segments or across calls to `next`. Entries may change between the snapshot
/// and the moment they are yielded.
///
/// Dropping the iterator and calling [`Store::expiring`] again starts a fresh
/// scan.
pub struct ExpiringKeys<'a, K, V, S = DefaultHashBuilder> {
    store: &'a Store<K, V, S>,
    fraction: f64,
    now: Instant,
    start: usize,
    visited: usize,
    buffer: VecDeque<ExpiringKey<K>>,
}

impl<K, V, S> ExpiringKeys<'_, K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    fn fill(&mut self, idx: usize) {
        let segment = self.store.segments[idx].lock();
        for (key, entry) in segment.map.iter() {
            if entry.is_expired(self.now) {
                continue;
            }
            let (Some(ttl), Some(elapsed_fraction)) =
                (entry.ttl(), entry.elapsed_fraction(self.now))
            else {
                continue;
            };
            if elapsed_fraction >= self.fraction {
                self.buffer.push_back(ExpiringKey {
                    key: key.clone(),
                    inserted_at: entry.inserted_at(),
                    ttl,
                    access_count: entry.access_count(),
                    elapsed_fraction,
                });
            }
        }
    }

    /// Number of segments scanned so far.
    pub fn segments_visited(&self) -> usize {
        self.visited
    }
}

impl<K, V, S> Iterator for ExpiringKeys<'_, K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    type Item = ExpiringKey<K>;

    fn next(&mut self) -> Option<Self::Item> {
        let segments = self.store.segments.len();
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.visited == segments {
                return None;
            }
            let idx = (self.start + self.visited) % segments;
            self.visited += 1;
            self.fill(idx);
        }
    }
}

/// A thread-safe, capacity-bounded map from key to [`CacheEntry`].
///
/// Values are cloned out on read so no lock is held by the caller.
///
/// # Example
///
/// ```
/// use cache_flight::clock::ManualClock;
/// use cache_flight::config::CacheConfig;
/// use cache_flight::store::Store;
/// use core::num::NonZeroUsize;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// let config = CacheConfig::new(NonZeroUsize::new(2).unwrap());
/// let store: Store<&str, u32> = Store::new(&config, Arc::new(clock.clone()));
///
/// store.put("a", 1, Some(Duration::from_secs(1)));
/// assert_eq!(store.get(&"a"), Some(1));
///
/// clock.advance(Duration::from_secs(1));
/// assert_eq!(store.get(&"a"), None);
/// ```
pub struct Store<K, V, S = DefaultHashBuilder> {
    segments: Box<[Mutex<StoreSegment<K, V, S>>]>,
    hash_builder: S,
    clock: Arc<dyn Clock>,
}

impl<K, V> Store<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Clone,
{
    /// Creates a store sized by `config.max_entries` and `config.segments`.
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_hasher(config, clock, DefaultHashBuilder::default())
    }
}

impl<K, V, S> Store<K, V, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone,
{
    /// Creates a store with a custom hash builder, cloned into each segment.
    pub fn with_hasher(config: &CacheConfig, clock: Arc<dyn Clock>, hash_builder: S) -> Self {
        let total = config.max_entries.get();
        let count = effective_segments(total, config.segments);
        let segments: Vec<_> = segment_capacities(total, count)
            .map(|cap| {
                Mutex::new(StoreSegment::new(
                    cap,
                    config.eviction_policy,
                    hash_builder.clone(),
                ))
            })
            .collect();

        Self {
            segments: segments.into_boxed_slice(),
            hash_builder,
            clock,
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

    /// Returns the value for `key` if present and not expired.
    ///
    /// An expired entry is removed and reported absent. A live entry has its
    /// access time and count updated.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let now = self.clock.now();
        let idx = self.segment_index(key);
        let mut segment = self.segments[idx].lock();
        segment.get(key, now).map(|entry| entry.value.clone())
    }

    /// Like [`get`](Self::get) but returns the whole entry with its metadata.
    pub fn get_entry<Q>(&self, key: &Q) -> Option<CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let now = self.clock.now();
        let idx = self.segment_index(key);
        let mut segment = self.segments[idx].lock();
        segment.get(key, now).cloned()
    }

    /// Returns a live entry without recording an access or removing anything.
    pub fn peek<Q>(&self, key: &Q) -> Option<CacheEntry<V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
        V: Clone,
    {
        let now = self.clock.now();
        let idx = self.segment_index(key);
        let segment = self.segments[idx].lock();
        segment.peek(key, now).cloned()
    }

    /// Returns `true` if a live entry exists. Does not record an access.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let now = self.clock.now();
        let idx = self.segment_index(key);
        self.segments[idx].lock().peek(key, now).is_some()
    }

    /// Inserts or replaces the value for `key`.
    ///
    /// `ttl = None` stores an entry that never expires. Replacing an existing
    /// key never evicts. Inserting a new key into a full segment evicts one
    /// entry chosen by the eviction policy first; the evicted pair is returned.
    ///
    /// # Panics
    ///
    /// Panics if the segment is full but its eviction bookkeeping is empty,
    /// which means the store's internal state is corrupt.
    pub fn put(&self, key: K, value: V, ttl: Option<Duration>) -> Option<(K, V)> {
        let now = self.clock.now();
        let idx = self.segment_index(&key);
        let mut segment = self.segments[idx].lock();
        match segment.put(key, value, now, ttl) {
            Ok(evicted) => evicted,
            Err(err) => panic!("store segment {idx}: {err}"),
        }
    }

    /// Removes `key`, returning its value if it was present.
    ///
    /// Removing an absent key is a no-op. An expired entry is removed but not
    /// returned.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let now = self.clock.now();
        let idx = self.segment_index(key);
        let entry = self.segments[idx].lock().remove(key)?;
        (!entry.is_expired(now)).then_some(entry.value)
    }

    /// Scans for entries whose elapsed TTL fraction is at least `fraction`
    /// and which have not yet expired at `now`.
    pub fn expiring(&self, fraction: f64, now: Instant) -> ExpiringKeys<'_, K, V, S> {
        self.expiring_from(0, fraction, now)
    }

    /// Like [`expiring`](Self::expiring) but starts at segment
    /// `start % segment_count()` and wraps around.
    pub fn expiring_from(
        &self,
        start: usize,
        fraction: f64,
        now: Instant,
    ) -> ExpiringKeys<'_, K, V, S> {
        ExpiringKeys {
            store: self,
            fraction,
            now,
            start: start % self.segments.len(),
            visited: 0,
            buffer: VecDeque::new(),
        }
    }

    /// Removes every expired entry, one segment at a time. Returns how many
    /// were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.segments
            .iter()
            .map(|segment| segment.lock().purge_expired(now))
            .sum()
    }

    /// Removes all entries. Metrics are kept.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.lock().clear();
        }
    }

    /// Number of stored entries, including expired ones not yet removed.
    ///
    /// Segments are locked one after another, so the result may be stale
    /// under concurrent writes.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.lock().map.len()).sum()
    }

    /// Returns `true` if no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.lock().map.is_empty())
    }

    /// Total capacity across all segments, equal to `max_entries`.
    pub fn capacity(&self) -> usize {
        self.segments.iter().map(|s| s.lock().cap).sum()
    }

    /// Number of segments in use.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Sum of all segment counters.
    pub fn metrics(&self) -> StoreMetrics {
        let mut total = StoreMetrics::default();
        for segment in self.segments.iter() {
            total.merge(&segment.lock().metrics);
        }
        total
    }

    /// The eviction policy in use.
    pub fn policy(&self) -> EvictionPolicy {
        self.segments[0].lock().tracker.policy()
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }
}

impl<K, V, S> fmt::Debug for Store<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("segments", &self.segments.len())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
