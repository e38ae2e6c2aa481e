//! Cache Facade
//!
//! [`Cache`] ties the store, negative cache, load coordinator and refresh
//! scheduler together behind one long-lived, explicitly constructed object.
//!
//! # Read Path
//!
//! ```text
//! get_or_load(key, loader)
//!   │
//!   ├─ store hit ───────────────────────────────▶ Ok(Some(value))
//!   ├─ negative marker ─────────────────────────▶ Ok(None)
//!   └─ coordinator.load(key, loader)
//!        ├─ leader: loader(key) ─▶ publish ─▶ settle
//!        └─ waiter: wait for the leader's outcome
//! ```
//!
//! Only [`get_or_load`](Cache::get_or_load) and its variants ever block, and
//! only while waiting for another caller's load of the same key.
//!
//! # Lifecycle
//!
//! A cache built with a bound loader runs a background refresh thread. It is
//! stopped by [`Cache::shutdown`] or when the cache is dropped. Share a cache
//! between threads with `Arc<Cache<..>>`.

use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::coordinator::LoadCoordinator;
use crate::entry::EntryState;
use crate::error::Error;
use crate::loader::{LoadError, Loader};
use crate::metrics::{CacheMetrics, CacheStats, Counters};
use crate::negative::NegativeCache;
use crate::refresh::{RefreshScheduler, RefreshTickReport, Refresher};
use crate::store::Store;

#[cfg(feature = "hashbrown")]
use hashbrown::DefaultHashBuilder;

#[cfg(not(feature = "hashbrown"))]
use std::collections::hash_map::RandomState as DefaultHashBuilder;

/// Builder for a [`Cache`] with a custom clock, bound loader or hasher.
///
/// ```
/// use cache_flight::{Cache, CacheConfig, LoadError};
///
/// let cache: Cache<u64, String> = Cache::builder(CacheConfig::default())
///     .loader(|id: &u64| -> Result<Option<String>, LoadError> { Ok(Some(format!("user-{id}"))) })
///     .background_refresh(false)
///     .build()
///     .unwrap();
/// assert_eq!(cache.load(7).unwrap(), Some("user-7".to_string()));
/// ```
pub struct CacheBuilder<K, V, S = DefaultHashBuilder> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    loader: Option<Arc<dyn Loader<K, V>>>,
    hash_builder: S,
    background_refresh: bool,
}

impl<K, V> CacheBuilder<K, V, DefaultHashBuilder> {
    fn new(config: CacheConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            loader: None,
            hash_builder: DefaultHashBuilder::default(),
            background_refresh: true,
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S> {
    /// Uses `clock` for every TTL decision.
    #[must_use]
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        self.clock = clock;
        self
    }

    /// Binds a loader for [`Cache::load`] and background refresh.
    #[must_use]
    pub fn loader(mut self, loader: impl Loader<K, V> + 'static) -> Self {
        let loader: Arc<dyn Loader<K, V>> = Arc::new(loader);
        self.loader = Some(loader);
        self
    }

    /// Enables or disables the background refresh thread (enabled by default).
    ///
    /// With it disabled, refresh-ahead only happens through
    /// [`Cache::refresh_tick`].
    #[must_use]
    pub fn background_refresh(mut self, enabled: bool) -> Self {
        self.background_refresh = enabled;
        self
    }

    /// Uses a custom hash builder for every internal map.
    #[must_use]
    pub fn hasher<S2>(self, hash_builder: S2) -> CacheBuilder<K, V, S2> {
        CacheBuilder {
            config: self.config,
            clock: self.clock,
            loader: self.loader,
            hash_builder,
            background_refresh: self.background_refresh,
        }
    }
}

impl<K, V, S> CacheBuilder<K, V, S>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    S: BuildHasher + Clone + Send + Sync + 'static,
{
    /// Validates the config and assembles the cache.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid config, [`Error::SchedulerSpawn`] if the
    /// refresh thread cannot be started.
    pub fn build(self) -> Result<Cache<K, V, S>, Error> {
        let config = self.config;
        config.validate()?;

        let counters = Arc::new(Counters::default());
        let store = Arc::new(Store::with_hasher(
            &config,
            Arc::clone(&self.clock),
            self.hash_builder.clone(),
        ));
        let negative = Arc::new(NegativeCache::with_hasher(
            &config,
            Arc::clone(&self.clock),
            self.hash_builder.clone(),
        ));
        let coordinator = Arc::new(LoadCoordinator::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&negative),
            Arc::clone(&counters),
            Arc::clone(&self.clock),
            self.hash_builder,
        ));

        let refresher = self.loader.as_ref().map(|loader| {
            Arc::new(Refresher::new(
                &config,
                Arc::clone(&store),
                Arc::clone(&coordinator),
                Arc::clone(loader),
                Arc::clone(&counters),
            ))
        });
        let scheduler = match &refresher {
            Some(refresher) if self.background_refresh => Some(RefreshScheduler::spawn(
                Arc::clone(refresher),
                config.refresh_interval,
            )?),
            _ => None,
        };

        debug!(
            max_entries = config.max_entries.get(),
            segments = store.segment_count(),
            policy = config.eviction_policy.name(),
            refresh = scheduler.is_some(),
            "cache built"
        );

        Ok(Cache {
            config,
            store,
            negative,
            coordinator,
            counters,
            loader: self.loader,
            refresher,
            scheduler: Mutex::new(scheduler),
        })
    }
}

/// An in-process cache with single-flight loading, negative caching and
/// probabilistic refresh-ahead.
///
/// # Type Parameters
///
/// - `K`: Key type. Must implement `Hash + Eq + Clone`.
/// - `V`: Value type. Must implement `Clone`; reads return clones.
/// - `S`: Hash builder type. Defaults to `DefaultHashBuilder`.
///
/// # Example
///
/// ```
/// use cache_flight::{Cache, CacheConfig, LoadError};
///
/// let cache: Cache<String, u32> = Cache::new(CacheConfig::default()).unwrap();
///
/// let value = cache.get_or_load("answer".to_string(), |_| Ok::<_, LoadError>(Some(42)));
/// assert_eq!(value.unwrap(), Some(42));
/// assert_eq!(cache.get("answer"), Some(42));
/// ```
pub struct Cache<K, V, S = DefaultHashBuilder> {
    config: CacheConfig,
    store: Arc<Store<K, V, S>>,
    negative: Arc<NegativeCache<K, S>>,
    coordinator: Arc<LoadCoordinator<K, V, S>>,
    counters: Arc<Counters>,
    loader: Option<Arc<dyn Loader<K, V>>>,
    refresher: Option<Arc<Refresher<K, V, S>>>,
    scheduler: Mutex<Option<RefreshScheduler>>,
}

impl<K, V> Cache<K, V, DefaultHashBuilder>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache with the system clock and no bound loader.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `config` fails validation.
    pub fn new(config: CacheConfig) -> Result<Self, Error> {
        Self::builder(config).build()
    }

    /// Starts building a cache from `config`.
    pub fn builder(config: CacheConfig) -> CacheBuilder<K, V, DefaultHashBuilder> {
        CacheBuilder::new(config)
    }
}

impl<K, V, S> Cache<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    /// Returns the cached value, never loading.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let value = self.store.get(key);
        if value.is_some() {
            Counters::incr(&self.counters.hits);
        } else {
            Counters::incr(&self.counters.misses);
        }
        value
    }

    /// Returns the cached value, loading it through `loader` on a miss.
    ///
    /// `Ok(None)` means the key is confirmed absent, either now by `loader`
    /// or earlier by a still-valid negative marker. Concurrent callers for the
    /// same key share one `loader` invocation and its outcome.
    ///
    /// # Errors
    ///
    /// [`Error::Load`] if the load this call joined failed. Failures are never
    /// cached; the next call loads again.
    pub fn get_or_load<F, E>(&self, key: K, loader: F) -> Result<Option<V>, Error>
    where
        F: FnOnce(&K) -> Result<Option<V>, E>,
        E: Into<LoadError>,
    {
        self.read_through(key, loader, None)
    }

    /// Like [`get_or_load`](Self::get_or_load), but gives up waiting on
    /// another caller's load after `timeout`.
    ///
    /// A caller that leads the load itself is not bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::WaitTimeout`] if the wait was abandoned. The load carries on
    /// and still populates the cache.
    pub fn get_or_load_timeout<F, E>(
        &self,
        key: K,
        loader: F,
        timeout: Duration,
    ) -> Result<Option<V>, Error>
    where
        F: FnOnce(&K) -> Result<Option<V>, E>,
        E: Into<LoadError>,
    {
        self.read_through(key, loader, Instant::now().checked_add(timeout))
    }

    /// [`get_or_load`](Self::get_or_load) with the loader bound at construction.
    ///
    /// # Errors
    ///
    /// [`Error::NoLoader`] if none was bound, otherwise as `get_or_load`.
    pub fn load(&self, key: K) -> Result<Option<V>, Error> {
        let loader = self.loader.as_ref().ok_or(Error::NoLoader)?;
        self.read_through(key, |k| loader.load(k), None)
    }

    /// [`get_or_load_timeout`](Self::get_or_load_timeout) with the bound loader.
    ///
    /// # Errors
    ///
    /// [`Error::NoLoader`] if none was bound, otherwise as
    /// `get_or_load_timeout`.
    pub fn load_timeout(&self, key: K, timeout: Duration) -> Result<Option<V>, Error> {
        let loader = self.loader.as_ref().ok_or(Error::NoLoader)?;
        self.read_through(key, |k| loader.load(k), Instant::now().checked_add(timeout))
    }

    fn read_through<F, E>(
        &self,
        key: K,
        loader: F,
        deadline: Option<Instant>,
    ) -> Result<Option<V>, Error>
    where
        F: FnOnce(&K) -> Result<Option<V>, E>,
        E: Into<LoadError>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(Some(value));
        }
        if self.negative.is_marked_absent(&key) {
            Counters::incr(&self.counters.negative_hits);
            return Ok(None);
        }
        self.coordinator
            .load(key, |k| loader(k).map_err(Into::into), deadline)
    }

    /// Stores `value` with the default TTL.
    pub fn put(&self, key: K, value: V) {
        self.put_with_ttl(key, value, Some(self.config.default_ttl));
    }

    /// Stores `value` with an explicit TTL; `None` never expires.
    ///
    /// A manual write supersedes any load of the same key still in flight,
    /// and clears a negative marker for the key.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) {
        self.coordinator.invalidate(&key);
        self.negative.clear(&key);
        self.store.put(key, value, ttl);
    }

    /// Removes `key` from the store and negative cache and invalidates any
    /// load in flight for it, so that load's result is never published. A new
    /// load of `key` starts only once the invalidated loader has returned.
    ///
    /// Invalidating an absent key is a no-op.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.coordinator.invalidate(key);
        self.store.remove(key);
        self.negative.clear(key);
    }

    /// Empties the cache. Statistics are kept.
    pub fn invalidate_all(&self) {
        self.coordinator.invalidate_all();
        self.store.clear();
        self.negative.clear_all();
    }

    /// Records `key` as absent for the configured negative TTL, dropping any
    /// cached value.
    pub fn mark_absent(&self, key: K) {
        self.coordinator.invalidate(&key);
        self.store.remove(&key);
        self.negative.mark_absent_default(key);
    }

    /// Returns `true` if a live value is cached. Not counted as a lookup.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.store.contains_key(key)
    }

    /// Where `key` sits in its lifecycle, or `None` if the cache knows nothing
    /// about it.
    pub fn state<Q>(&self, key: &Q) -> Option<EntryState>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        if self.store.contains_key(key) {
            Some(EntryState::Present)
        } else if self.coordinator.is_loading(key) {
            Some(EntryState::Loading)
        } else if self.negative.marker(key).is_some() {
            Some(EntryState::Negative)
        } else {
            None
        }
    }

    /// Removes every expired positive entry now rather than on next read.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    /// Runs one refresh-ahead pass on the calling thread.
    ///
    /// Returns `None` for a cache without a bound loader.
    pub fn refresh_tick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<RefreshTickReport> {
        self.refresher.as_ref().map(|refresher| refresher.tick(rng))
    }

    /// Number of stored positive entries.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Returns `true` if no positive entries are stored.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Maximum number of positive entries.
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// Number of stored negative markers.
    pub fn negative_len(&self) -> usize {
        self.negative.len()
    }

    /// Number of loader calls currently running, including invalidated ones
    /// that have not yet returned.
    pub fn in_flight_count(&self) -> usize {
        self.coordinator.in_flight_count()
    }

    /// Number of callers waiting on the load in flight for `key`, or `None`
    /// if no live load is running for it.
    pub fn waiters<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.coordinator.waiters(key)
    }

    /// Failed loads of `key` in a row since its last successful one.
    ///
    /// Reset by a successful load, a confirmed absence or an invalidation.
    pub fn consecutive_failures<Q>(&self, key: &Q) -> u32
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.coordinator.consecutive_failures(key)
    }

    /// Snapshot of activity counters.
    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot(self.store.metrics())
    }

    /// The configuration the cache was built with.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns `true` while the background refresh thread is running.
    pub fn is_refreshing(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .is_some_and(RefreshScheduler::is_running)
    }

    /// Stops background refresh and waits for the thread to exit.
    ///
    /// The cache stays usable for reads and writes. Idempotent; dropping the
    /// cache does the same.
    pub fn shutdown(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(mut scheduler) = scheduler {
            scheduler.shutdown();
        }
    }
}

impl<K, V, S> CacheMetrics for Cache<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn metrics(&self) -> BTreeMap<String, f64> {
        let mut metrics = self.stats().to_btreemap();
        metrics.insert("capacity".to_string(), self.capacity() as f64);
        metrics.insert("entries".to_string(), self.len() as f64);
        metrics.insert("in_flight".to_string(), self.in_flight_count() as f64);
        metrics.insert("negative_entries".to_string(), self.negative_len() as f64);
        metrics.insert(
            "negative_evictions".to_string(),
            self.negative.evictions() as f64,
        );
        metrics
    }

    fn algorithm_name(&self) -> &'static str {
        self.config.eviction_policy.name()
    }
}

impl<K, V, S> fmt::Debug for Cache<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("config", &self.config)
            .field("store", &self.store)
            .field("has_loader", &self.loader.is_some())
            .finish_non_exhaustive()
    }
}
