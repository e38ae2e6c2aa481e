//! Cache Entry Type
//!
//! [`CacheEntry`] is the record the store keeps for every present key: the
//! value plus the timestamps and counters that expiry, eviction and
//! refresh-ahead decisions read.
//!
//! # Memory Layout
//!
//! - `value: V` - User's value type
//! - `inserted_at: Instant` - 16 bytes (TTL origin, reset on replacement)
//! - `last_accessed: Instant` - 16 bytes (recency)
//! - `access_count: u64` - 8 bytes (frequency, never reset)
//! - `expires_at: Option<Instant>` - 16 bytes
//!
//! The key lives in the owning map and is not duplicated here.
//!
//! # Expiry Before Bookkeeping
//!
//! [`CacheEntry::record_access`] refuses to touch an expired entry. An entry at
//! or past `expires_at` is logically absent, so reading it must not make it
//! look recent or popular.

use core::fmt;
use std::time::{Duration, Instant};

/// Where a key currently sits in the cache's per-key state machine.
///
/// ```text
///   [absent] --first caller--> [Loading] --value--> [Present]
///   [absent] --first caller--> [Loading] --absent--> [Negative]
///   [Present | Negative] --expiry / invalidate--> [absent]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// A live value is stored.
    Present,
    /// A load is in flight and no live value is stored.
    Loading,
    /// The key is known to be absent from the source.
    Negative,
}

/// A stored value with its access metadata.
///
/// Entries are created and replaced by the store; callers only ever see
/// clones.
///
/// # Examples
///
/// ```
/// use cache_flight::entry::CacheEntry;
/// use std::time::{Duration, Instant};
///
/// let now = Instant::now();
/// let entry = CacheEntry::new("v", now, Some(Duration::from_secs(10)));
/// assert!(!entry.is_expired(now));
/// assert!(entry.is_expired(now + Duration::from_secs(10)));
/// ```
#[derive(Clone)]
pub struct CacheEntry<V> {
    /// The cached value.
    pub value: V,
    inserted_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    /// Creates an entry inserted at `now`.
    ///
    /// `ttl = None` means the entry never expires and only capacity eviction can
    /// remove it. A TTL too large to represent is treated the same way.
    pub fn new(value: V, now: Instant, ttl: Option<Duration>) -> Self {
        Self {
            value,
            inserted_at: now,
            last_accessed: now,
            access_count: 0,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        }
    }

    /// Replaces the value in place, restarting the TTL.
    ///
    /// The access count carries over: replacement is a refresh of the same
    /// key, not a new key.
    pub fn replace(&mut self, value: V, now: Instant, ttl: Option<Duration>) -> V {
        self.inserted_at = now;
        self.last_accessed = now;
        self.expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
        core::mem::replace(&mut self.value, value)
    }

    /// Returns `true` once `now` has reached `expires_at`.
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }

    /// Records a read. Returns `false` and leaves the entry untouched if it has
    /// already expired.
    #[inline]
    pub fn record_access(&mut self, now: Instant) -> bool {
        if self.is_expired(now) {
            return false;
        }
        self.last_accessed = now;
        self.access_count = self.access_count.saturating_add(1);
        true
    }

    /// Instant the current value was stored.
    #[inline]
    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    /// Instant of the last successful read or write.
    #[inline]
    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    /// Number of successful reads over the key's lifetime in the store.
    #[inline]
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    /// Absolute expiry, if the entry has a TTL.
    #[inline]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// The TTL the current value was stored with.
    pub fn ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|deadline| deadline.saturating_duration_since(self.inserted_at))
    }

    /// Fraction of the TTL that has elapsed at `now`, or `None` without a TTL.
    ///
    /// A zero TTL counts as fully elapsed.
    pub fn elapsed_fraction(&self, now: Instant) -> Option<f64> {
        let ttl = self.ttl()?;
        if ttl.is_zero() {
            return Some(1.0);
        }
        let elapsed = now.saturating_duration_since(self.inserted_at);
        Some(elapsed.as_secs_f64() / ttl.as_secs_f64())
    }
}

impl<V: fmt::Debug> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("value", &self.value)
            .field("inserted_at", &self.inserted_at)
            .field("last_accessed", &self.last_accessed)
            .field("access_count", &self.access_count)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry() {
        let now = Instant::now();
        let entry = CacheEntry::new(42, now, Some(Duration::from_secs(5)));
        assert_eq!(entry.value, 42);
        assert_eq!(entry.access_count(), 0);
        assert_eq!(entry.inserted_at(), now);
        assert_eq!(entry.ttl(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_no_ttl_never_expires() {
        let now = Instant::now();
        let entry = CacheEntry::new("v", now, None);
        assert!(!entry.is_expired(now + Duration::from_secs(86_400 * 365)));
        assert_eq!(entry.elapsed_fraction(now), None);
    }

    #[test]
    fn test_zero_ttl_expired_immediately() {
        let now = Instant::now();
        let entry = CacheEntry::new("v", now, Some(Duration::ZERO));
        assert!(entry.is_expired(now));
        assert_eq!(entry.elapsed_fraction(now), Some(1.0));
    }

    #[test]
    fn test_expired_entry_is_not_touched() {
        let now = Instant::now();
        let mut entry = CacheEntry::new("v", now, Some(Duration::from_millis(10)));
        assert!(entry.record_access(now + Duration::from_millis(5)));
        assert_eq!(entry.access_count(), 1);

        let later = now + Duration::from_millis(10);
        assert!(!entry.record_access(later));
        assert_eq!(entry.access_count(), 1);
        assert_eq!(entry.last_accessed(), now + Duration::from_millis(5));
    }

    #[test]
    fn test_replace_restarts_ttl_keeps_count() {
        let now = Instant::now();
        let mut entry = CacheEntry::new(1, now, Some(Duration::from_secs(1)));
        entry.record_access(now);
        entry.record_access(now);

        let later = now + Duration::from_millis(900);
        let old = entry.replace(2, later, Some(Duration::from_secs(1)));
        assert_eq!(old, 1);
        assert_eq!(entry.value, 2);
        assert_eq!(entry.access_count(), 2);
        assert_eq!(entry.inserted_at(), later);
        assert!(!entry.is_expired(now + Duration::from_millis(1500)));
    }

    #[test]
    fn test_elapsed_fraction() {
        let now = Instant::now();
        let entry = CacheEntry::new((), now, Some(Duration::from_millis(100)));
        let fraction = entry
            .elapsed_fraction(now + Duration::from_millis(90))
            .unwrap();
        assert!((fraction - 0.9).abs() < 1e-9);
    }
}
