//! Error types for the cache.

use thiserror::Error;

/// Cache error type.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An empty cache key was passed to the store.
    #[error("cache key cannot be empty")]
    EmptyKey,

    /// The request cannot be mapped to a cache key.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unexpected filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cache entry failed to deserialize. Treated as a miss by callers.
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}

impl CacheError {
    /// Returns true for entries that failed codec validation.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, CacheError::Corrupt(_))
    }
}
