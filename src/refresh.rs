//! Probabilistic Refresh-Ahead
//!
//! A background thread periodically looks for hot entries that are close to
//! expiry and reloads some of them before they expire, so readers of hot keys
//! rarely hit a synchronous miss.
//!
//! # Refresh Probability
//!
//! With refresh-ahead fraction `r` and an entry whose elapsed TTL fraction is
//! `e`, the chance of refreshing it on a tick is
//!
//! ```text
//! p(e) = 0                       if e < r
//!      = (e - r) / (1 - r)       if r <= e < 1
//! ```
//!
//! so it ramps linearly from 0 at the threshold to 1 at expiry. Spreading
//! refreshes over the window keeps many keys stored at the same moment from
//! being reloaded in the same tick.
//!
//! # Failure Handling
//!
//! Refreshes go through the load coordinator, so a reader that misses while a
//! refresh runs coalesces onto it. A failed refresh leaves the cached
//! value alone; it keeps serving until it expires naturally.

use core::fmt;
use core::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::coordinator::{LoadCoordinator, Publication};
use crate::error::Error;
use crate::loader::Loader;
use crate::metrics::Counters;
use crate::store::Store;

/// Name of the background refresh thread.
pub const THREAD_NAME: &str = "cache-flight-refresh";

/// Chance of refreshing an entry at `elapsed_fraction` of its TTL.
///
/// ```
/// use cache_flight::refresh::refresh_probability;
///
/// assert_eq!(refresh_probability(0.5, 0.9), 0.0);
/// assert!((refresh_probability(0.95, 0.9) - 0.5).abs() < 1e-9);
/// assert_eq!(refresh_probability(1.0, 0.9), 1.0);
/// ```
pub fn refresh_probability(elapsed_fraction: f64, refresh_ahead_fraction: f64) -> f64 {
    if elapsed_fraction < refresh_ahead_fraction {
        return 0.0;
    }
    let window = 1.0 - refresh_ahead_fraction;
    if window <= 0.0 {
        return 1.0;
    }
    ((elapsed_fraction - refresh_ahead_fraction) / window).clamp(0.0, 1.0)
}

/// What one refresh tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTickReport {
    /// Hot entries inside the refresh window that were examined.
    pub scanned: usize,
    /// Entries whose probability draw selected them.
    pub triggered: usize,
    /// Selected entries whose reloaded value was stored.
    pub refreshed: usize,
    /// Selected entries the source reported gone; they were removed and
    /// marked absent.
    pub removed: usize,
    /// Selected entries whose reload was invalidated while it ran and whose
    /// result was dropped.
    pub discarded: usize,
    /// Selected entries skipped because a load was already in flight.
    pub skipped: usize,
    /// Selected entries whose reload failed.
    pub failed: usize,
}

/// The work a tick does, shared with the background thread.
pub(crate) struct Refresher<K, V, S> {
    store: Arc<Store<K, V, S>>,
    coordinator: Arc<LoadCoordinator<K, V, S>>,
    loader: Arc<dyn Loader<K, V>>,
    counters: Arc<Counters>,
    fraction: f64,
    batch_size: usize,
    min_hits: u64,
    cursor: AtomicUsize,
}

impl<K, V, S> Refresher<K, V, S>
where
    K: Hash + Eq + Clone,
    V: Clone,
    S: BuildHasher + Clone,
{
    pub(crate) fn new(
        config: &CacheConfig,
        store: Arc<Store<K, V, S>>,
        coordinator: Arc<LoadCoordinator<K, V, S>>,
        loader: Arc<dyn Loader<K, V>>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            store,
            coordinator,
            loader,
            counters,
            fraction: config.refresh_ahead_fraction,
            batch_size: config.refresh_batch_size,
            min_hits: config.refresh_min_hits,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Examines up to one batch of hot, near-expiry entries and reloads the
    /// ones the probability draw selects.
    ///
    /// Each tick starts its scan one segment further along, so with a small
    /// batch size every segment still gets its turn.
    pub(crate) fn tick<R: Rng + ?Sized>(&self, rng: &mut R) -> RefreshTickReport {
        let now = self.store.now();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let candidates: Vec<_> = self
            .store
            .expiring_from(start, self.fraction, now)
            .filter(|candidate| candidate.access_count >= self.min_hits)
            .take(self.batch_size)
            .collect();

        let mut report = RefreshTickReport {
            scanned: candidates.len(),
            ..Default::default()
        };

        for candidate in candidates {
            let probability = refresh_probability(candidate.elapsed_fraction, self.fraction);
            if rng.gen::<f64>() >= probability {
                continue;
            }
            report.triggered += 1;

            let loader = Arc::clone(&self.loader);
            match self
                .coordinator
                .refresh(candidate.key, move |key| loader.load(key))
            {
                None => report.skipped += 1,
                Some(Ok(Publication::Stored)) => {
                    report.refreshed += 1;
                    Counters::incr(&self.counters.refreshes);
                }
                Some(Ok(Publication::MarkedAbsent)) => report.removed += 1,
                Some(Ok(_)) => report.discarded += 1,
                Some(Err(err)) => {
                    report.failed += 1;
                    Counters::incr(&self.counters.refresh_errors);
                    warn!(
                        elapsed_fraction = candidate.elapsed_fraction,
                        error = %err,
                        "background refresh failed, keeping current value"
                    );
                }
            }
        }

        report
    }
}

/// Handle to the background refresh thread.
///
/// The thread stops when [`shutdown`](Self::shutdown) is called or the
/// handle is dropped; both wait for an in-progress tick to finish.
pub(crate) struct RefreshScheduler {
    handle: Option<JoinHandle<()>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    interval: Duration,
}

impl RefreshScheduler {
    pub(crate) fn spawn<K, V, S>(
        refresher: Arc<Refresher<K, V, S>>,
        interval: Duration,
    ) -> Result<Self, Error>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
        S: BuildHasher + Clone + Send + Sync + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let mut rng = StdRng::from_entropy();
                let (lock, cond) = &*signal;
                debug!(interval_ms = interval.as_millis() as u64, "refresh scheduler started");
                loop {
                    {
                        let mut stopped = lock.lock();
                        if !*stopped {
                            cond.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    let report = refresher.tick(&mut rng);
                    if report.triggered > 0 {
                        debug!(
                            scanned = report.scanned,
                            triggered = report.triggered,
                            refreshed = report.refreshed,
                            removed = report.removed,
                            discarded = report.discarded,
                            skipped = report.skipped,
                            failed = report.failed,
                            "refresh tick"
                        );
                    }
                }
                debug!("refresh scheduler stopped");
            })
            .map_err(|err| Error::SchedulerSpawn(err.to_string()))?;

        Ok(Self {
            handle: Some(handle),
            stop,
            interval,
        })
    }

    /// Stops the thread and waits for it to exit. Idempotent.
    pub(crate) fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        {
            let (lock, cond) = &*self.stop;
            *lock.lock() = true;
            cond.notify_all();
        }
        if handle.join().is_err() {
            warn!("refresh thread panicked");
        }
    }

    /// Returns `true` until the scheduler has been shut down.
    pub(crate) fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("running", &self.is_running())
            .field("interval", &self.interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::loader::LoadError;
    use crate::negative::NegativeCache;
    use core::num::NonZeroUsize;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::AtomicU32;

    #[cfg(feature = "hashbrown")]
    use hashbrown::DefaultHashBuilder;

    #[cfg(not(feature = "hashbrown"))]
    use std::collections::hash_map::RandomState as DefaultHashBuilder;

    struct Fixture {
        clock: ManualClock,
        store: Arc<Store<String, u32>>,
        refresher: Refresher<String, u32, DefaultHashBuilder>,
        calls: Arc<AtomicU32>,
    }

    fn fixture(min_hits: u64, fail: bool) -> Fixture {
        let clock = ManualClock::new();
        let dyn_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let config = CacheConfig::new(NonZeroUsize::new(64).unwrap())
            .with_default_ttl(Duration::from_millis(100))
            .with_negative_ttl(Duration::from_millis(10))
            .with_refresh_min_hits(min_hits);
        let counters = Arc::new(Counters::default());
        let store = Arc::new(Store::new(&config, Arc::clone(&dyn_clock)));
        let negative = Arc::new(NegativeCache::new(&config, Arc::clone(&dyn_clock)));
        let coordinator = Arc::new(LoadCoordinator::new(
            &config,
            Arc::clone(&store),
            negative,
            Arc::clone(&counters),
            dyn_clock,
            DefaultHashBuilder::default(),
        ));

        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let loader = move |_: &String| -> Result<Option<u32>, LoadError> {
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if fail {
                Err(LoadError::msg("source down"))
            } else {
                Ok(Some(100 + n))
            }
        };

        let refresher = Refresher::new(
            &config,
            Arc::clone(&store),
            coordinator,
            Arc::new(loader),
            counters,
        );
        Fixture {
            clock,
            store,
            refresher,
            calls,
        }
    }

    #[test]
    fn test_probability_ramp() {
        assert_eq!(refresh_probability(0.0, 0.9), 0.0);
        assert_eq!(refresh_probability(0.9, 0.9), 0.0);
        assert!((refresh_probability(0.99, 0.9) - 0.9).abs() < 1e-9);
        assert_eq!(refresh_probability(1.5, 0.9), 1.0);
        assert!(refresh_probability(0.97, 0.9) > refresh_probability(0.93, 0.9));
    }

    #[test]
    fn test_tick_refreshes_hot_entry() {
        let f = fixture(1, false);
        f.store
            .put("hot".to_string(), 1, Some(Duration::from_millis(100)));
        f.store.get("hot");

        f.clock.advance(Duration::from_millis(50));
        let report = f.refresher.tick(&mut StepRng::new(0, 0));
        assert_eq!(report, RefreshTickReport::default());

        f.clock.advance(Duration::from_millis(45));
        let report = f.refresher.tick(&mut StepRng::new(0, 0));
        assert_eq!(report.scanned, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);

        // reloaded value restarts the TTL and keeps the read count
        let entry = f.store.peek("hot").unwrap();
        assert_eq!(entry.value, 101);
        assert_eq!(entry.inserted_at(), f.clock.now());
        assert_eq!(entry.access_count(), 1);
    }

    #[test]
    fn test_cold_entries_are_not_refreshed() {
        let f = fixture(2, false);
        f.store
            .put("cold".to_string(), 1, Some(Duration::from_millis(100)));
        f.store.get("cold");
        f.clock.advance(Duration::from_millis(99));
        let report = f.refresher.tick(&mut StepRng::new(0, 0));
        assert_eq!(report.scanned, 0);
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_refresh_keeps_value() {
        let f = fixture(0, true);
        f.store
            .put("k".to_string(), 7, Some(Duration::from_millis(100)));
        f.clock.advance(Duration::from_millis(95));
        let report = f.refresher.tick(&mut StepRng::new(0, 0));
        assert_eq!(report.failed, 1);
        assert_eq!(f.store.get("k"), Some(7));
        assert_eq!(
            f.refresher.counters.refresh_errors.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_absent_refresh_is_not_counted_as_refreshed() {
        let f = fixture(0, false);
        f.store
            .put("gone".to_string(), 7, Some(Duration::from_millis(100)));
        f.clock.advance(Duration::from_millis(95));
        let vanishing = Refresher {
            loader: Arc::new(|_: &String| -> Result<Option<u32>, LoadError> { Ok(None) }),
            ..f.refresher
        };

        let report = vanishing.tick(&mut StepRng::new(0, 0));
        assert_eq!((report.triggered, report.removed), (1, 1));
        assert_eq!(report.refreshed, 0);
        assert_eq!(vanishing.counters.refreshes.load(Ordering::Relaxed), 0);
        assert!(f.store.get("gone").is_none());
    }

    #[test]
    fn test_draw_above_probability_skips() {
        let f = fixture(0, false);
        f.store
            .put("k".to_string(), 7, Some(Duration::from_millis(100)));
        f.clock.advance(Duration::from_millis(95));
        // a draw of ~1.0 is never below a probability of 0.5
        let report = f.refresher.tick(&mut StepRng::new(u64::MAX, 0));
        assert_eq!(report.scanned, 1);
        assert_eq!(report.triggered, 0);
    }

    #[test]
    fn test_batch_size_limits_scan() {
        let f = fixture(0, false);
        for i in 0..10 {
            f.store
                .put(format!("k{i}"), i, Some(Duration::from_millis(100)));
        }
        f.clock.advance(Duration::from_millis(95));
        let limited = Refresher {
            batch_size: 3,
            ..f.refresher
        };
        let report = limited.tick(&mut StepRng::new(u64::MAX, 0));
        assert_eq!(report.scanned, 3);
    }

    #[test]
    fn test_scheduler_shutdown_joins() {
        let f = fixture(0, false);
        let mut scheduler =
            RefreshScheduler::spawn(Arc::new(f.refresher), Duration::from_millis(5)).unwrap();
        assert!(scheduler.is_running());
        std::thread::sleep(Duration::from_millis(20));
        scheduler.shutdown();
        assert!(!scheduler.is_running());
        scheduler.shutdown();
    }
}
