//! HTTP-level cache facade.
//!
//! Wraps the byte store with the response codec and key derivation. The
//! key is derived once and reused across both phases of a request, so
//! derivation lives here as an explicit step rather than being folded
//! into `get`/`set`.

use bytes::Bytes;
use http::Response;

use crate::error::CacheError;
use crate::store::DiskStore;
use crate::{codec, key};

/// Disk-backed cache of whole HTTP responses.
#[derive(Debug, Clone)]
pub struct HttpCache {
    store: DiskStore,
}

impl HttpCache {
    /// Creates a cache over the given store.
    pub fn new(store: DiskStore) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &DiskStore {
        &self.store
    }

    /// Derives the cache key for a request. Pure.
    pub fn derive_key(&self, url: &str, method: &str) -> Result<String, CacheError> {
        key::derive(url, method)
    }

    /// Looks up a response. `None` means miss (absent or expired); a
    /// [`CacheError::Corrupt`] means the entry exists but failed
    /// validation, which callers downgrade to a miss.
    pub fn get(&self, key: &str) -> Result<Option<Response<Bytes>>, CacheError> {
        match self.store.get(key)? {
            Some(data) => Ok(Some(codec::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Stores a response under the given key.
    pub fn set(&self, key: &str, resp: &Response<Bytes>) -> Result<(), CacheError> {
        self.store.set(key, &codec::encode(resp))
    }
}
