//! Cache Configuration
//!
//! [`CacheConfig`] is the single input a [`Cache`](crate::Cache) is built
//! from. All fields are public so a config can be written as a struct
//! literal, and every field has a chainable `with_*` method for building
//! from [`CacheConfig::default`] or [`CacheConfig::new`].
//!
//! Configs are validated once, when the cache is built. A rejected config
//! never produces a usable cache.
//!
//! # Sizing
//!
//! | Field | Default | Notes |
//! |-------|---------|-------|
//! | `max_entries` | 10 000 | hard bound on positive entries |
//! | `default_ttl` | 5 min | used by `put` and loads |
//! | `negative_ttl` | 30 s | must be `> 0` and `< default_ttl` |
//! | `negative_max_entries` | 10 000 | bound on absence markers (FIFO) |
//! | `refresh_ahead_fraction` | 0.9 | refresh window opens at 90% of TTL |
//! | `refresh_interval` | 1 s | background tick period |
//! | `refresh_batch_size` | 256 | max candidates examined per tick |
//! | `refresh_min_hits` | 1 | reads needed before an entry is refreshed |
//! | `eviction_policy` | LRU | see [`EvictionPolicy`] |
//! | `segments` | 16 | lock stripes; fewer are used for small caches |
//!
//! # Examples
//!
//! ```
//! use cache_flight::config::CacheConfig;
//! use cache_flight::policy::EvictionPolicy;
//! use core::num::NonZeroUsize;
//! use std::time::Duration;
//!
//! let config = CacheConfig::new(NonZeroUsize::new(50_000).unwrap())
//!     .with_default_ttl(Duration::from_secs(60))
//!     .with_negative_ttl(Duration::from_secs(5))
//!     .with_eviction_policy(EvictionPolicy::Lfu);
//! assert!(config.validate().is_ok());
//! ```
//!
//! With the `serde` feature, configs deserialize from any serde format with
//! human-readable durations:
//!
//! ```ignore
//! let config: CacheConfig = serde_json::from_str(r#"{
//!     "max_entries": 1000,
//!     "default_ttl": "2m",
//!     "negative_ttl": "10s",
//!     "eviction_policy": "fifo"
//! }"#)?;
//! ```

use core::fmt;
use core::num::NonZeroUsize;
use std::time::Duration;

use crate::error::ConfigError;
use crate::policy::EvictionPolicy;

const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_SEGMENTS: usize = 16;

/// Configuration for a [`Cache`](crate::Cache).
#[derive(Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct CacheConfig {
    /// Maximum number of positive entries held at any quiescent point.
    pub max_entries: NonZeroUsize,

    /// TTL applied by `put` and by successful loads.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub default_ttl: Duration,

    /// Lifetime of a negative marker. Strictly shorter than `default_ttl`.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub negative_ttl: Duration,

    /// Maximum number of negative markers.
    pub negative_max_entries: NonZeroUsize,

    /// Fraction of the TTL after which an entry becomes a refresh candidate.
    pub refresh_ahead_fraction: f64,

    /// Period of the background refresh tick.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub refresh_interval: Duration,

    /// Maximum number of candidates examined per tick.
    pub refresh_batch_size: usize,

    /// Minimum read count before an entry is considered hot enough to refresh.
    pub refresh_min_hits: u64,

    /// Victim selection for the positive store.
    pub eviction_policy: EvictionPolicy,

    /// Requested number of lock stripes.
    pub segments: usize,
}

impl CacheConfig {
    /// Creates a config with the given capacity and defaults elsewhere.
    #[must_use]
    pub fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            max_entries,
            ..Self::default()
        }
    }

    /// Sets the maximum number of positive entries.
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: NonZeroUsize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets the positive TTL.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Sets the negative marker TTL.
    #[must_use]
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    /// Sets the maximum number of negative markers.
    #[must_use]
    pub fn with_negative_max_entries(mut self, max_entries: NonZeroUsize) -> Self {
        self.negative_max_entries = max_entries;
        self
    }

    /// Sets the refresh-ahead threshold, a fraction of the TTL in `(0, 1)`.
    #[must_use]
    pub fn with_refresh_ahead_fraction(mut self, fraction: f64) -> Self {
        self.refresh_ahead_fraction = fraction;
        self
    }

    /// Sets the background refresh period.
    #[must_use]
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets how many candidates one refresh tick examines.
    #[must_use]
    pub fn with_refresh_batch_size(mut self, batch_size: usize) -> Self {
        self.refresh_batch_size = batch_size;
        self
    }

    /// Sets the read count an entry needs before it is refreshed.
    #[must_use]
    pub fn with_refresh_min_hits(mut self, min_hits: u64) -> Self {
        self.refresh_min_hits = min_hits;
        self
    }

    /// Sets the eviction policy.
    #[must_use]
    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    /// Sets the requested number of lock stripes.
    #[must_use]
    pub fn with_segments(mut self, segments: usize) -> Self {
        self.segments = segments;
        self
    }

    /// Checks every cross-field constraint.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segments == 0 {
            return Err(ConfigError::ZeroSegments);
        }
        if self.negative_ttl.is_zero() {
            return Err(ConfigError::ZeroNegativeTtl);
        }
        if self.negative_ttl >= self.default_ttl {
            return Err(ConfigError::NegativeTtlNotShorter {
                negative: self.negative_ttl,
                default: self.default_ttl,
            });
        }
        let fraction = self.refresh_ahead_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(ConfigError::InvalidRefreshFraction(fraction));
        }
        if self.refresh_interval.is_zero() {
            return Err(ConfigError::ZeroRefreshInterval);
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: NonZeroUsize::new(DEFAULT_MAX_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            default_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
            negative_max_entries: NonZeroUsize::new(DEFAULT_MAX_ENTRIES)
                .unwrap_or(NonZeroUsize::MIN),
            refresh_ahead_fraction: 0.9,
            refresh_interval: Duration::from_secs(1),
            refresh_batch_size: 256,
            refresh_min_hits: 1,
            eviction_policy: EvictionPolicy::default(),
            segments: DEFAULT_SEGMENTS,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("max_entries", &self.max_entries)
            .field("default_ttl", &self.default_ttl)
            .field("negative_ttl", &self.negative_ttl)
            .field("negative_max_entries", &self.negative_max_entries)
            .field("refresh_ahead_fraction", &self.refresh_ahead_fraction)
            .field("refresh_interval", &self.refresh_interval)
            .field("eviction_policy", &self.eviction_policy)
            .field("segments", &self.segments)
            .finish_non_exhaustive()
    }
}
