//! Cache key derivation.
//!
//! A request maps to the relative path
//! `<host>/<path-segments>/<METHOD>[_q<hash>].bin`, where `<hash>` is the
//! first 8 hex characters of the SHA-256 of the raw query string, present
//! only when the query is non-empty. The derivation is pure: it depends
//! on nothing but the URL and method, so syntactically identical requests
//! always land on the same file.

use std::fmt::Write;

use http::Uri;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// Number of hex characters of the query hash kept in the filename.
const QUERY_HASH_LEN: usize = 8;

/// Derives the cache key for an absolute request URL and method.
///
/// The host is lowercased and a default `:80`/`:443` port is stripped;
/// empty path segments are dropped; the method is stored upper-case.
pub fn derive(url: &str, method: &str) -> Result<String, CacheError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| CacheError::InvalidRequest(format!("failed to parse URL '{url}': {e}")))?;

    let host = uri
        .host()
        .ok_or_else(|| CacheError::InvalidRequest(format!("URL '{url}' has no host")))?;
    let mut key = host.to_ascii_lowercase();
    if let Some(port) = uri.port_u16() {
        if port != 80 && port != 443 {
            let _ = write!(key, ":{port}");
        }
    }

    for segment in uri.path().split('/') {
        if !segment.is_empty() {
            key.push('/');
            key.push_str(segment);
        }
    }

    key.push('/');
    key.push_str(&method.to_ascii_uppercase());
    if let Some(query) = uri.query() {
        if !query.is_empty() {
            key.push_str("_q");
            key.push_str(&query_hash(query));
        }
    }
    key.push_str(".bin");

    Ok(key)
}

/// Returns the first [`QUERY_HASH_LEN`] hex characters of
/// `SHA-256(query)`.
fn query_hash(query: &str) -> String {
    let digest = Sha256::digest(query.as_bytes());
    let mut hex = String::with_capacity(QUERY_HASH_LEN);
    for byte in &digest[..QUERY_HASH_LEN / 2] {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
