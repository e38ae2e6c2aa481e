//! Single-Flight Load Coordinator
//!
//! Guarantees at most one concurrent loader invocation per key and hands its
//! outcome to every caller that asked for the key while it ran.
//!
//! ```text
//!   caller ──▶ shard lock ──┬── no flight: register ──────────▶ LEADER
//!                           ├── live flight: attach ──────────▶ WAITER
//!                           └── invalidated flight: wait for it
//!                               to settle, then register again
//!
//!   LEADER:  loader(key)
//!            ├─ publish  (store / negative cache, under the shard lock)
//!            ├─ settle   (fill the shared slot, notify_all)
//!            └─ retire   (remove the flight if it is still ours)
//!
//!   WAITER:  sleep on the flight's condvar until settled or deadline
//! ```
//!
//! # Ordering
//!
//! A flight stays registered until after its result has been published and
//! settled. A caller arriving in between attaches to the settled flight and
//! returns immediately; it can never see "no flight and no entry" and start a
//! second load.
//!
//! # Invalidation
//!
//! [`LoadCoordinator::invalidate`] marks an in-flight load as invalidated under
//! the same lock its leader publishes under. An invalidated load skips
//! publication, so a value loaded before an invalidation can never reappear
//! after it. Callers already attached still receive the loaded value.
//!
//! The invalidated flight stays registered until its loader returns. Callers
//! arriving in the meantime neither attach to it nor start a second loader:
//! they wait for it to settle and then register a fresh load. The loader is
//! never running twice for one key.
//!
//! # Cancellation
//!
//! Waiters with a deadline detach when it passes and get
//! [`Error::WaitTimeout`]. The leader is unaffected and runs to completion even
//! if no waiter remains, so its result still populates the cache.
//!
//! # Panics
//!
//! A loader that panics settles its flight with a [`LoadError`] on the way out,
//! so waiters are released instead of sleeping forever. The panic continues in
//! the leader's thread.

use core::borrow::Borrow;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::Error;
use crate::loader::LoadError;
use crate::metrics::Counters;
use crate::negative::NegativeCache;
use crate::store::Store;

#[cfg(feature = "hashbrown")]
use hashbrown::{DefaultHashBuilder, HashMap};

#[cfg(not(feature = "hashbrown"))]
use std::collections::{hash_map::RandomState as DefaultHashBuilder, HashMap};

/// Consecutive-failure counts kept per shard before new keys stop being tracked.
const MAX_TRACKED_FAILURES: usize = 1024;

type Outcome<V> = Result<Option<V>, LoadError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadMode {
    /// Foreground miss: re-check the cache before invoking the loader.
    Fill,
    /// Background refresh: always invoke the loader.
    Refresh,
}

/// One load in progress, shared by its leader and all waiters.
struct InFlightLoad<V> {
    started_at: Instant,
    attempt: u32,
    waiters: AtomicUsize,
    invalidated: AtomicBool,
    slot: Mutex<Option<Outcome<V>>>,
    cond: Condvar,
}

impl<V: Clone> InFlightLoad<V> {
    fn new(started_at: Instant, attempt: u32) -> Self {
        Self {
            started_at,
            attempt,
            waiters: AtomicUsize::new(0),
            invalidated: AtomicBool::new(false),
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Fills the slot once and wakes every waiter.
    fn settle(&self, outcome: Outcome<V>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        drop(slot);
        self.cond.notify_all();
    }

    fn is_settled(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Sleeps until the flight settles without taking its outcome.
    ///
    /// Returns `false` if `deadline` passed first.
    fn wait_settled(&self, deadline: Option<Instant>) -> bool {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            match deadline {
                None => self.cond.wait(&mut slot),
                Some(deadline) => {
                    if self.cond.wait_until(&mut slot, deadline).timed_out() {
                        return slot.is_some();
                    }
                }
            }
        }
        true
    }

    fn wait(&self, deadline: Option<Instant>) -> Result<Option<V>, Error> {
        let waiting_since = Instant::now();
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                self.waiters.fetch_sub(1, Ordering::AcqRel);
                return outcome.clone().map_err(Error::Load);
            }
            match deadline {
                None => self.cond.wait(&mut slot),
                Some(deadline) => {
                    if self.cond.wait_until(&mut slot, deadline).timed_out() && slot.is_none() {
                        self.waiters.fetch_sub(1, Ordering::AcqRel);
                        let waited = deadline.saturating_duration_since(waiting_since);
                        trace!(waited_ms = waited.as_millis() as u64, "waiter detached");
                        return Err(Error::WaitTimeout(waited));
                    }
                }
            }
        }
    }
}

struct FlightShard<K, V, S> {
    loads: HashMap<K, Arc<InFlightLoad<V>>, S>,
    failures: HashMap<K, u32, S>,
}

/// Settles and retires the flight if the leader unwinds before doing so.
struct LeaderGuard<'a, K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    coordinator: &'a LoadCoordinator<K, V, S>,
    idx: usize,
    key: &'a K,
    flight: &'a Arc<InFlightLoad<V>>,
    armed: bool,
}

impl<K, V, S> Drop for LeaderGuard<'_, K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        error!(attempt = self.flight.attempt, "loader panicked");
        Counters::incr(&self.coordinator.counters.load_errors);
        self.flight
            .settle(Err(LoadError::msg("loader panicked")));
        self.coordinator.retire(self.idx, self.key, self.flight);
    }
}

/// What a leader did with its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Publication {
    /// The foreground recheck found the key settled; the loader never ran.
    Cached,
    /// The loaded value was stored.
    Stored,
    /// The key was confirmed absent and marked negative.
    MarkedAbsent,
    /// The load was invalidated while it ran and its result dropped.
    Discarded,
    /// The loader failed; nothing was written.
    Failed,
}

/// Tracks in-flight loads, sharded by key hash.
pub(crate) struct LoadCoordinator<K, V, S = DefaultHashBuilder> {
    shards: Box<[Mutex<FlightShard<K, V, S>>]>,
    hash_builder: S,
    store: Arc<Store<K, V, S>>,
    negative: Arc<NegativeCache<K, S>>,
    counters: Arc<Counters>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl<K, V, S> LoadCoordinator<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    pub(crate) fn new(
        config: &CacheConfig,
        store: Arc<Store<K, V, S>>,
        negative: Arc<NegativeCache<K, S>>,
        counters: Arc<Counters>,
        clock: Arc<dyn Clock>,
        hash_builder: S,
    ) -> Self {
        let shards: Vec<_> = (0..config.segments.max(1))
            .map(|_| {
                Mutex::new(FlightShard {
                    loads: HashMap::with_hasher(hash_builder.clone()),
                    failures: HashMap::with_hasher(hash_builder.clone()),
                })
            })
            .collect();

        Self {
            shards: shards.into_boxed_slice(),
            hash_builder,
            store,
            negative,
            counters,
            clock,
            ttl: config.default_ttl,
        }
    }

    #[inline]
    fn shard_index<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash,
    {
        (self.hash_builder.hash_one(key) as usize) % self.shards.len()
    }

    /// Loads `key` through `loader` unless another caller already is.
    ///
    /// The first caller becomes the leader: it re-checks the store and
    /// negative cache, and only if both still miss invokes `loader` exactly
    /// once, publishing the outcome. Every other caller waits for the leader's
    /// outcome until `deadline` (forever if `None`).
    ///
    /// # Errors
    ///
    /// - [`Error::Load`] with the very same failure for the leader and every
    ///   waiter.
    /// - [`Error::WaitTimeout`] for a waiter whose deadline passed, including
    ///   while it waited out an invalidated load.
    pub(crate) fn load<F>(
        &self,
        key: K,
        loader: F,
        deadline: Option<Instant>,
    ) -> Result<Option<V>, Error>
    where
        F: FnOnce(&K) -> Result<Option<V>, LoadError>,
    {
        let idx = self.shard_index(&key);
        let waiting_since = Instant::now();
        loop {
            match self.register(idx, &key) {
                Registration::Leader(flight) => {
                    return self.lead(idx, &key, &flight, loader, LoadMode::Fill).0;
                }
                Registration::Waiter(flight) => {
                    Counters::incr(&self.counters.coalesced_waits);
                    trace!(
                        attempt = flight.attempt,
                        waiters = flight.waiters.load(Ordering::Relaxed),
                        "attached to in-flight load"
                    );
                    return flight.wait(deadline);
                }
                Registration::Superseded(stale) => {
                    trace!(attempt = stale.attempt, "waiting out invalidated load");
                    if !stale.wait_settled(deadline) {
                        let waited = deadline.map_or(Duration::ZERO, |deadline| {
                            deadline.saturating_duration_since(waiting_since)
                        });
                        return Err(Error::WaitTimeout(waited));
                    }
                }
            }
        }
    }

    /// Reloads `key` unconditionally, unless a load for it is already running.
    ///
    /// Returns `None` without waiting if another load is in flight, live or
    /// invalidated. A confirmed absence removes the positive entry and records
    /// a negative marker. A failure leaves the cache untouched.
    pub(crate) fn refresh<F>(&self, key: K, loader: F) -> Option<Result<Publication, Error>>
    where
        F: FnOnce(&K) -> Result<Option<V>, LoadError>,
    {
        let idx = self.shard_index(&key);
        match self.register(idx, &key) {
            Registration::Leader(flight) => {
                let (result, publication) =
                    self.lead(idx, &key, &flight, loader, LoadMode::Refresh);
                Some(result.map(|_| publication))
            }
            Registration::Waiter(flight) => {
                flight.waiters.fetch_sub(1, Ordering::AcqRel);
                None
            }
            Registration::Superseded(_) => None,
        }
    }

    fn register(&self, idx: usize, key: &K) -> Registration<V> {
        let mut shard = self.shards[idx].lock();
        if let Some(existing) = shard.loads.get(key) {
            if !existing.invalidated.load(Ordering::Acquire) {
                existing.waiters.fetch_add(1, Ordering::AcqRel);
                return Registration::Waiter(Arc::clone(existing));
            }
            // An invalidated flight whose loader already returned is only
            // waiting to be retired and may be replaced.
            if !existing.is_settled() {
                return Registration::Superseded(Arc::clone(existing));
            }
        }
        let attempt = shard.failures.get(key).map_or(1, |n| n.saturating_add(1));
        let flight = Arc::new(InFlightLoad::new(self.clock.now(), attempt));
        shard.loads.insert(key.clone(), Arc::clone(&flight));
        Registration::Leader(flight)
    }

    fn lead<F>(
        &self,
        idx: usize,
        key: &K,
        flight: &Arc<InFlightLoad<V>>,
        loader: F,
        mode: LoadMode,
    ) -> (Result<Option<V>, Error>, Publication)
    where
        F: FnOnce(&K) -> Result<Option<V>, LoadError>,
    {
        let mut guard = LeaderGuard {
            coordinator: self,
            idx,
            key,
            flight,
            armed: true,
        };

        let (outcome, publication) = match self.recheck(key, mode) {
            Some(cached) => (Ok(cached), Publication::Cached),
            None => {
                Counters::incr(&self.counters.load_count);
                debug!(attempt = flight.attempt, ?mode, "load started");
                let outcome = loader(key);
                let publication = self.publish(idx, key, flight, &outcome, mode);

                let elapsed = self.clock.now().saturating_duration_since(flight.started_at);
                match &outcome {
                    Ok(found) => debug!(
                        attempt = flight.attempt,
                        waiters = flight.waiters.load(Ordering::Relaxed),
                        elapsed_ms = elapsed.as_millis() as u64,
                        found = found.is_some(),
                        "load settled"
                    ),
                    Err(err) => {
                        Counters::incr(&self.counters.load_errors);
                        warn!(
                            attempt = flight.attempt,
                            waiters = flight.waiters.load(Ordering::Relaxed),
                            elapsed_ms = elapsed.as_millis() as u64,
                            error = %err,
                            "load failed"
                        );
                    }
                }
                (outcome, publication)
            }
        };

        flight.settle(outcome.clone());
        self.retire(idx, key, flight);
        guard.armed = false;
        (outcome.map_err(Error::Load), publication)
    }

    /// Returns what a foreground caller would now find in the cache.
    fn recheck(&self, key: &K, mode: LoadMode) -> Option<Option<V>> {
        if mode == LoadMode::Refresh {
            return None;
        }
        if let Some(value) = self.store.get(key) {
            return Some(Some(value));
        }
        if self.negative.is_marked_absent(key) {
            return Some(None);
        }
        None
    }

    /// Writes a successful outcome to the store or negative cache, unless the
    /// flight was invalidated meanwhile.
    fn publish(
        &self,
        idx: usize,
        key: &K,
        flight: &Arc<InFlightLoad<V>>,
        outcome: &Outcome<V>,
        mode: LoadMode,
    ) -> Publication {
        let mut shard = self.shards[idx].lock();
        let current = shard
            .loads
            .get(key)
            .is_some_and(|registered| Arc::ptr_eq(registered, flight));
        if !current || flight.invalidated.load(Ordering::Acquire) {
            trace!(attempt = flight.attempt, "load invalidated, not publishing");
            return if outcome.is_err() {
                Publication::Failed
            } else {
                Publication::Discarded
            };
        }

        match outcome {
            Ok(Some(value)) => {
                self.negative.clear(key);
                self.store.put(key.clone(), value.clone(), Some(self.ttl));
                shard.failures.remove(key);
                Publication::Stored
            }
            Ok(None) => {
                if mode == LoadMode::Refresh {
                    self.store.remove(key);
                }
                self.negative.mark_absent_default(key.clone());
                shard.failures.remove(key);
                Publication::MarkedAbsent
            }
            Err(_) => {
                if let Some(count) = shard.failures.get_mut(key) {
                    *count = count.saturating_add(1);
                } else if shard.failures.len() < MAX_TRACKED_FAILURES {
                    shard.failures.insert(key.clone(), 1);
                }
                Publication::Failed
            }
        }
    }

    /// Removes the flight from its shard if it is still the registered one.
    fn retire(&self, idx: usize, key: &K, flight: &Arc<InFlightLoad<V>>) {
        let mut shard = self.shards[idx].lock();
        let current = shard
            .loads
            .get(key)
            .is_some_and(|registered| Arc::ptr_eq(registered, flight));
        if current {
            shard.loads.remove(key);
        }
    }

    /// Marks any in-flight load for `key` as invalidated so it will not
    /// publish.
    ///
    /// Returns `true` if a live load was invalidated. Callers already waiting
    /// on it still receive its outcome. The flight stays registered until its
    /// loader returns, holding back new loads of `key` until then.
    pub(crate) fn invalidate<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let idx = self.shard_index(key);
        let mut shard = self.shards[idx].lock();
        shard.failures.remove(key);
        match shard.loads.get(key) {
            Some(flight) if !flight.invalidated.swap(true, Ordering::AcqRel) => {
                debug!(attempt = flight.attempt, "in-flight load invalidated");
                true
            }
            _ => false,
        }
    }

    /// Invalidates every in-flight load.
    pub(crate) fn invalidate_all(&self) {
        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            for flight in shard.loads.values() {
                flight.invalidated.store(true, Ordering::Release);
            }
            shard.failures.clear();
        }
    }

    /// Returns `true` if a load for `key` is in flight and not invalidated.
    pub(crate) fn is_loading<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let idx = self.shard_index(key);
        self.shards[idx]
            .lock()
            .loads
            .get(key)
            .is_some_and(|flight| !flight.invalidated.load(Ordering::Acquire))
    }

    /// Number of callers currently waiting on the live load for `key`.
    pub(crate) fn waiters<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let idx = self.shard_index(key);
        let shard = self.shards[idx].lock();
        shard
            .loads
            .get(key)
            .filter(|flight| !flight.invalidated.load(Ordering::Acquire))
            .map(|flight| flight.waiters.load(Ordering::Acquire))
    }

    /// Consecutive failed loads for `key` since its last successful one.
    pub(crate) fn consecutive_failures<Q>(&self, key: &Q) -> u32
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let idx = self.shard_index(key);
        self.shards[idx]
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Total number of loader calls still running across all shards,
    /// invalidated ones included.
    pub(crate) fn in_flight_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().loads.len()).sum()
    }
}

enum Registration<V> {
    Leader(Arc<InFlightLoad<V>>),
    Waiter(Arc<InFlightLoad<V>>),
    /// An invalidated load is still running; wait for it, then retry.
    Superseded(Arc<InFlightLoad<V>>),
}

impl<K, V, S> fmt::Debug for LoadCoordinator<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("shards", &self.shards.len())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use core::num::NonZeroUsize;
    use std::sync::atomic::AtomicU32;
    use std::sync::Barrier;
    use std::thread;

    type TestCoordinator = LoadCoordinator<String, String>;

    fn coordinator() -> Arc<TestCoordinator> {
        let config = CacheConfig::new(NonZeroUsize::new(64).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(Store::new(&config, Arc::clone(&clock)));
        let negative = Arc::new(NegativeCache::new(&config, Arc::clone(&clock)));
        Arc::new(LoadCoordinator::new(
            &config,
            store,
            negative,
            Arc::new(Counters::default()),
            clock,
            DefaultHashBuilder::default(),
        ))
    }

    #[test]
    fn test_leader_publishes_value() {
        let coord = coordinator();
        let result = coord.load("k".to_string(), |_| Ok(Some("v".to_string())), None);
        assert_eq!(result.unwrap(), Some("v".to_string()));
        assert_eq!(coord.store.get("k"), Some("v".to_string()));
        assert_eq!(coord.in_flight_count(), 0);
    }

    #[test]
    fn test_absent_publishes_negative() {
        let coord = coordinator();
        let result = coord.load("k".to_string(), |_| Ok(None), None);
        assert_eq!(result.unwrap(), None);
        assert!(coord.negative.is_marked_absent("k"));
        assert!(coord.store.get("k").is_none());
    }

    #[test]
    fn test_error_publishes_nothing() {
        let coord = coordinator();
        let result = coord.load("k".to_string(), |_| Err(LoadError::msg("down")), None);
        assert!(matches!(result, Err(Error::Load(_))));
        assert!(coord.store.get("k").is_none());
        assert!(!coord.negative.is_marked_absent("k"));
        assert_eq!(coord.consecutive_failures("k"), 1);

        coord
            .load("k".to_string(), |_| Ok(Some("v".to_string())), None)
            .unwrap();
        assert_eq!(coord.consecutive_failures("k"), 0);
    }

    #[test]
    fn test_fill_rechecks_store() {
        let coord = coordinator();
        coord
            .store
            .put("k".to_string(), "cached".to_string(), None);
        let result = coord.load(
            "k".to_string(),
            |_| panic!("loader must not run"),
            None,
        );
        assert_eq!(result.unwrap(), Some("cached".to_string()));
    }

    #[test]
    fn test_refresh_replaces_value() {
        let coord = coordinator();
        coord.store.put("k".to_string(), "old".to_string(), None);
        let result = coord.refresh("k".to_string(), |_| Ok(Some("new".to_string())));
        assert_eq!(result.unwrap().unwrap(), Publication::Stored);
        assert_eq!(coord.store.get("k"), Some("new".to_string()));
    }

    #[test]
    fn test_refresh_absent_removes_entry() {
        let coord = coordinator();
        coord.store.put("k".to_string(), "old".to_string(), None);
        let result = coord.refresh("k".to_string(), |_| Ok(None));
        assert_eq!(result.unwrap().unwrap(), Publication::MarkedAbsent);
        assert!(coord.store.get("k").is_none());
        assert!(coord.negative.is_marked_absent("k"));
    }

    #[test]
    fn test_single_flight_and_shared_error() {
        let coord = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let coord = Arc::clone(&coord);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    coord.load(
                        "k".to_string(),
                        |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(50));
                            Err(LoadError::msg("boom"))
                        },
                        None,
                    )
                })
            })
            .collect();

        let errors: Vec<LoadError> = handles
            .into_iter()
            .map(|h| match h.join().expect("Thread panicked") {
                Err(Error::Load(err)) => err,
                other => panic!("unexpected outcome: {other:?}"),
            })
            .collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(errors.iter().all(|e| e.same_failure(&errors[0])));
    }

    #[test]
    fn test_refresh_skips_when_loading() {
        let coord = coordinator();
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let leader = {
            let coord = Arc::clone(&coord);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                coord.load(
                    "k".to_string(),
                    |_| {
                        started.wait();
                        release.wait();
                        Ok(Some("v".to_string()))
                    },
                    None,
                )
            })
        };

        started.wait();
        assert!(coord.is_loading("k"));
        assert!(coord
            .refresh("k".to_string(), |_| panic!("must not run"))
            .is_none());
        assert_eq!(coord.waiters("k"), Some(0));
        release.wait();
        assert_eq!(
            leader.join().expect("Thread panicked").unwrap(),
            Some("v".to_string())
        );
    }

    #[test]
    fn test_waiter_timeout_detaches() {
        let coord = coordinator();
        let started = Arc::new(Barrier::new(2));

        let leader = {
            let coord = Arc::clone(&coord);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                coord.load(
                    "k".to_string(),
                    |_| {
                        started.wait();
                        thread::sleep(Duration::from_millis(200));
                        Ok(Some("late".to_string()))
                    },
                    None,
                )
            })
        };

        started.wait();
        let deadline = Instant::now() + Duration::from_millis(20);
        let result = coord.load("k".to_string(), |_| panic!("must not run"), Some(deadline));
        assert!(matches!(result, Err(Error::WaitTimeout(_))));

        // the leader still completes and publishes
        assert_eq!(
            leader.join().expect("Thread panicked").unwrap(),
            Some("late".to_string())
        );
        assert_eq!(coord.store.get("k"), Some("late".to_string()));
    }

    #[test]
    fn test_invalidate_prevents_publication() {
        let coord = coordinator();
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let leader = {
            let coord = Arc::clone(&coord);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                coord.load(
                    "k".to_string(),
                    |_| {
                        started.wait();
                        release.wait();
                        Ok(Some("stale".to_string()))
                    },
                    None,
                )
            })
        };

        started.wait();
        assert!(coord.invalidate("k"));
        assert!(!coord.is_loading("k"));
        release.wait();

        assert_eq!(
            leader.join().expect("Thread panicked").unwrap(),
            Some("stale".to_string())
        );
        assert!(coord.store.get("k").is_none());
    }

    #[test]
    fn test_reload_after_invalidate_waits_for_detached_loader() {
        let coord = coordinator();
        let running = Arc::new(AtomicU32::new(0));
        let max_running = Arc::new(AtomicU32::new(0));
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(AtomicBool::new(false));

        let track = {
            let running = Arc::clone(&running);
            let max_running = Arc::clone(&max_running);
            move |value: &str| -> Result<Option<String>, LoadError> {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                max_running.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(Some(value.to_string()))
            }
        };

        let detached = {
            let coord = Arc::clone(&coord);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            let track = track.clone();
            thread::spawn(move || {
                coord.load(
                    "k".to_string(),
                    |_| {
                        started.wait();
                        while !release.load(Ordering::SeqCst) {
                            thread::yield_now();
                        }
                        track("old")
                    },
                    None,
                )
            })
        };

        started.wait();
        assert!(coord.invalidate("k"));
        assert!(!coord.invalidate("k"), "already invalidated");
        assert_eq!(coord.in_flight_count(), 1);

        let reload = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || coord.load("k".to_string(), |_| track("new"), None))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!reload.is_finished(), "reload must wait out the detached load");
        release.store(true, Ordering::SeqCst);

        assert_eq!(
            detached.join().expect("Thread panicked").unwrap(),
            Some("old".to_string())
        );
        assert_eq!(
            reload.join().expect("Thread panicked").unwrap(),
            Some("new".to_string())
        );
        assert_eq!(max_running.load(Ordering::SeqCst), 1);
        assert_eq!(coord.store.get("k"), Some("new".to_string()));
        assert_eq!(coord.in_flight_count(), 0);
    }

    #[test]
    fn test_refresh_skips_invalidated_load() {
        let coord = coordinator();
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let leader = {
            let coord = Arc::clone(&coord);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                coord.load(
                    "k".to_string(),
                    |_| {
                        started.wait();
                        release.wait();
                        Ok(Some("stale".to_string()))
                    },
                    None,
                )
            })
        };

        started.wait();
        coord.invalidate("k");
        assert!(coord
            .refresh("k".to_string(), |_| panic!("must not run"))
            .is_none());

        // a waiter with a deadline gives up on the detached load like any other
        let deadline = Instant::now() + Duration::from_millis(10);
        let result = coord.load("k".to_string(), |_| panic!("must not run"), Some(deadline));
        assert!(matches!(result, Err(Error::WaitTimeout(_))));

        release.wait();
        leader.join().expect("Thread panicked").unwrap();
        assert!(coord.store.get("k").is_none());
    }

    #[test]
    fn test_discarded_refresh_is_reported() {
        let coord = coordinator();
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let refresh = {
            let coord = Arc::clone(&coord);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                coord.refresh("k".to_string(), |_| {
                    started.wait();
                    release.wait();
                    Ok(Some("stale".to_string()))
                })
            })
        };

        started.wait();
        coord.invalidate("k");
        release.wait();

        let result = refresh.join().expect("Thread panicked");
        assert_eq!(result.unwrap().unwrap(), Publication::Discarded);
        assert!(coord.store.get("k").is_none());
    }

    #[test]
    fn test_panicking_loader_releases_waiters() {
        let coord = coordinator();
        let started = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let leader = {
            let coord = Arc::clone(&coord);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                coord.load(
                    "k".to_string(),
                    |_| -> Result<Option<String>, LoadError> {
                        started.wait();
                        release.wait();
                        panic!("loader bug");
                    },
                    None,
                )
            })
        };

        started.wait();
        let waiter = {
            let coord = Arc::clone(&coord);
            thread::spawn(move || coord.load("k".to_string(), |_| Ok(None), None))
        };
        while coord.waiters("k") != Some(1) {
            thread::yield_now();
        }
        release.wait();

        assert!(leader.join().is_err());
        let result = waiter.join().expect("Thread panicked");
        assert!(matches!(result, Err(Error::Load(_))));
        assert_eq!(coord.in_flight_count(), 0);
    }
}
