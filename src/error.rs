//! Error Taxonomy
//!
//! A confirmed absence is **not** an error: every loading operation returns
//! `Result<Option<V>, Error>` and `Ok(None)` means the loader reported that the
//! key does not exist. The variants here are the genuine failures.
//!
//! | Variant | Raised by | Meaning |
//! |---------|-----------|---------|
//! | [`Error::Load`] | loader | Backing source failed; shared verbatim with every waiter |
//! | [`Error::WaitTimeout`] | waiter | Caller's deadline elapsed; the load keeps running |
//! | [`Error::Config`] | construction | Invalid [`CacheConfig`](crate::config::CacheConfig) |
//! | [`Error::CapacityViolation`] | eviction | Store/policy bookkeeping bug (assertion) |
//! | [`Error::NoLoader`] | `load` | No loader was bound at construction |
//! | [`Error::SchedulerSpawn`] | construction | Refresh thread could not be started |

use std::time::Duration;

use crate::loader::LoadError;

/// Errors surfaced by the cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The loader failed. Never cached, positively or negatively.
    #[error("loader failed: {0}")]
    Load(#[from] LoadError),

    /// The caller stopped waiting on an in-flight load.
    #[error("gave up waiting for in-flight load after {0:?}")]
    WaitTimeout(Duration),

    /// The configuration was rejected at construction time.
    #[error("invalid cache configuration: {0}")]
    Config(#[from] ConfigError),

    /// Eviction was requested from an empty tracker.
    ///
    /// The store only evicts when it is at capacity, so seeing this means the
    /// store and its eviction bookkeeping disagree.
    #[error("eviction requested but no entries are tracked")]
    CapacityViolation,

    /// A bound-loader operation was called on a cache built without a loader.
    #[error("no loader was bound to this cache")]
    NoLoader,

    /// The background refresh thread could not be spawned.
    #[error("failed to spawn refresh thread: {0}")]
    SchedulerSpawn(String),
}

/// Validation failures for [`CacheConfig`](crate::config::CacheConfig).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// At least one segment is required.
    #[error("segments must be greater than zero")]
    ZeroSegments,

    /// Negative markers need a lifetime.
    #[error("negative_ttl must be greater than zero")]
    ZeroNegativeTtl,

    /// Absence must be distrusted sooner than presence.
    #[error("negative_ttl ({negative:?}) must be shorter than default_ttl ({default:?})")]
    NegativeTtlNotShorter {
        /// Configured negative TTL.
        negative: Duration,
        /// Configured positive TTL.
        default: Duration,
    },

    /// The refresh-ahead threshold must lie in `(0, 1)`.
    #[error("refresh_ahead_fraction must be within (0, 1), got {0}")]
    InvalidRefreshFraction(f64),

    /// The scheduler tick cannot be zero.
    #[error("refresh_interval must be greater than zero")]
    ZeroRefreshInterval,
}
