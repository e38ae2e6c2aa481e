#![doc = include_str!("../README.md")]
//!
//! ---
//!
//! # Code Reference
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                                Cache                                   │
//! │                                                                        │
//! │  get ───────────────▶ ┌──────────────┐                                 │
//! │                       │    Store     │  sharded, bounded, lazy expiry  │
//! │  put ───────────────▶ │  (segments)  │◀──── EvictionPolicy             │
//! │                       └──────▲───────┘      LRU | LFU | FIFO | Random  │
//! │                              │ publish                                 │
//! │  get_or_load ──▶ hit? ──▶ ┌──┴───────────────┐                         │
//! │                 negative? │ LoadCoordinator  │ one loader call per key │
//! │                     │     │ (in-flight map)  │ waiters share outcome   │
//! │                     ▼     └──┬───────────▲───┘                         │
//! │               ┌───────────────▼┐         │ refresh                     │
//! │               │ NegativeCache  │   ┌─────┴────────────┐                │
//! │               │ (FIFO, TTL)    │   │ RefreshScheduler │ background     │
//! │               └────────────────┘   └──────────────────┘ thread         │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Choosing an Eviction Policy
//!
//! | Policy | Victim | Bookkeeping | Best Use Case |
//! |--------|--------|-------------|---------------|
//! | [`EvictionPolicy::Lru`] | least recently used | list move per read | General purpose |
//! | [`EvictionPolicy::Lfu`] | least frequently used | bucket move per read | Stable, skewed popularity |
//! | [`EvictionPolicy::Fifo`] | oldest insertion | none per read | Uniform access, cheap |
//! | [`EvictionPolicy::Random`] | uniformly random | none | Very large, flat key spaces |
//!
//! ## Read-Through With Stampede Protection
//!
//! ```rust
//! use cache_flight::{Cache, CacheConfig, LoadError};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::thread;
//!
//! let cache: Arc<Cache<String, String>> = Arc::new(Cache::new(CacheConfig::default()).unwrap());
//! let calls = Arc::new(AtomicUsize::new(0));
//!
//! let handles: Vec<_> = (0..8)
//!     .map(|_| {
//!         let cache = Arc::clone(&cache);
//!         let calls = Arc::clone(&calls);
//!         thread::spawn(move || {
//!             cache.get_or_load("config".to_string(), |key| {
//!                 calls.fetch_add(1, Ordering::SeqCst);
//!                 Ok::<_, LoadError>(Some(format!("{key}-from-db")))
//!             })
//!         })
//!     })
//!     .collect();
//!
//! for handle in handles {
//!     assert_eq!(handle.join().unwrap().unwrap(), Some("config-from-db".to_string()));
//! }
//! assert!(calls.load(Ordering::SeqCst) >= 1);
//! ```
//!
//! ## Negative Caching
//!
//! ```rust
//! use cache_flight::{Cache, CacheConfig, LoadError};
//!
//! let cache: Cache<u64, String> = Cache::new(CacheConfig::default()).unwrap();
//!
//! // The source says the key does not exist...
//! assert_eq!(cache.get_or_load(404, |_| Ok::<_, LoadError>(None)).unwrap(), None);
//!
//! // ...so for `negative_ttl` the source is not asked again.
//! let again = cache.get_or_load(404, |_| -> Result<Option<String>, LoadError> {
//!     unreachable!("negative marker short-circuits the load")
//! });
//! assert_eq!(again.unwrap(), None);
//! assert_eq!(cache.stats().negative_hits, 1);
//! ```
//!
//! ## Errors Are Never Cached
//!
//! ```rust
//! use cache_flight::{Cache, CacheConfig, Error, LoadError};
//!
//! let cache: Cache<&str, u32> = Cache::new(CacheConfig::default()).unwrap();
//!
//! let first = cache.get_or_load("flaky", |_| Err(LoadError::msg("timeout")));
//! assert!(matches!(first, Err(Error::Load(_))));
//!
//! let second = cache.get_or_load("flaky", |_| Ok::<_, LoadError>(Some(1)));
//! assert_eq!(second.unwrap(), Some(1));
//! ```
//!
//! ## Modules
//!
//! - [`cache`]: the [`Cache`] facade and its builder
//! - [`store`]: sharded bounded store with lazy expiry
//! - [`policy`]: eviction policies
//! - [`negative`]: negative markers
//! - [`refresh`]: probabilistic refresh-ahead
//! - [`config`]: [`CacheConfig`] and validation
//! - [`metrics`]: statistics and metric reporting
//! - [`clock`]: time sources
//! - [`entry`]: stored entry and lifecycle state
//! - [`loader`]: the loader contract
//! - [`error`]: error types

/// The cache facade.
///
/// Combines the store, negative cache, load coordinator and refresh scheduler
/// behind `get`, `get_or_load`, `put` and `invalidate`.
pub mod cache;

/// Time sources. [`ManualClock`] makes TTL behaviour deterministic in tests.
pub mod clock;

/// Cache configuration and validation.
pub mod config;

/// Single-flight load coordination.
///
/// Guarantees at most one concurrent loader call per key and broadcasts its
/// outcome to every caller waiting on it. Reached through [`Cache`].
pub(crate) mod coordinator;

/// Stored entry type and per-key lifecycle state.
pub mod entry;

/// Error types.
pub mod error;

/// Doubly linked list used by the eviction bookkeeping.
///
/// **Note**: This module is internal infrastructure. It exposes unsafe raw
/// pointer operations that require careful invariant maintenance.
pub(crate) mod list;

/// The loader contract and its error type.
pub mod loader;

/// Statistics snapshot and metric reporting.
pub mod metrics;

/// Bounded store of confirmed absences.
pub mod negative;

/// Eviction policies and their per-segment bookkeeping.
pub mod policy;

/// Background probabilistic refresh-ahead.
pub mod refresh;

/// Thread-safe bounded store with lazy expiry.
pub mod store;

pub use cache::{Cache, CacheBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use entry::{CacheEntry, EntryState};
pub use error::{ConfigError, Error};
pub use loader::{LoadError, Loader};
pub use metrics::{CacheMetrics, CacheStats};
pub use policy::EvictionPolicy;
pub use refresh::RefreshTickReport;
