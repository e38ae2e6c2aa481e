//! Loader Contract
//!
//! The cache consumes exactly one collaborator: a function that fetches the
//! authoritative value for a key. It has three outcomes:
//!
//! - `Ok(Some(value))`: the key exists; the value is published to the store.
//! - `Ok(None)`: the key is confirmed absent; a negative marker is recorded.
//! - `Err(LoadError)`: the source failed; nothing is cached.
//!
//! A loader is never invoked concurrently for the same key, but it must be safe
//! to call concurrently for different keys.
//!
//! Loaders can be supplied per call (any `FnOnce(&K) -> Result<Option<V>, E>`
//! with `E: Into<LoadError>`) or bound once at construction through the
//! [`Loader`] trait, which is also what background refresh uses.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// A failure reported by a loader.
///
/// Cloning is cheap (the underlying error is reference counted) so the same
/// failure can be handed to every caller coalesced onto one load.
#[derive(Clone)]
pub struct LoadError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl LoadError {
    /// Wraps any error type.
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(err),
        }
    }

    /// Creates an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Message(message.into())),
        }
    }

    /// Returns the wrapped error.
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }

    /// Returns `true` if both handles refer to the same underlying failure.
    pub fn same_failure(&self, other: &LoadError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LoadError").field(&self.inner).finish()
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl StdError for LoadError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

impl From<Box<dyn StdError + Send + Sync + 'static>> for LoadError {
    fn from(err: Box<dyn StdError + Send + Sync + 'static>) -> Self {
        Self { inner: err.into() }
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err)
    }
}

impl From<String> for LoadError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<&str> for LoadError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

/// A loader bound to a cache at construction time.
///
/// Implemented for every `Fn(&K) -> Result<Option<V>, LoadError>` closure that
/// is `Send + Sync`, so most callers never implement it by hand.
pub trait Loader<K, V>: Send + Sync {
    /// Fetches the authoritative value for `key`.
    fn load(&self, key: &K) -> Result<Option<V>, LoadError>;
}

impl<K, V, F> Loader<K, V> for F
where
    F: Fn(&K) -> Result<Option<V>, LoadError> + Send + Sync,
{
    fn load(&self, key: &K) -> Result<Option<V>, LoadError> {
        self(key)
    }
}
