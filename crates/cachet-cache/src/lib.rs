//! Cachet Cache - disk-backed HTTP response cache.
//!
//! Three small layers:
//!
//! - [`store`]: TTL-checked byte blobs under string keys rooted at a
//!   directory. Eviction is lazy, on read.
//! - [`codec`]: serializes a full HTTP response (status line, headers,
//!   body) to a magic-prefixed HTTP/1.1 wire-format file and back. The
//!   cache stays human-readable and portable.
//! - [`key`]: derives the stable filesystem key for a request from its
//!   host, path, method and query string.
//!
//! [`HttpCache`] ties the three together for the proxy engine.

pub mod codec;
pub mod error;
pub mod http_cache;
pub mod key;
pub mod store;

pub use error::CacheError;
pub use http_cache::HttpCache;
pub use store::DiskStore;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
