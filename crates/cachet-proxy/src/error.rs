//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] cachet_core::ConfigError),

    /// Cache error.
    #[error("cache error: {0}")]
    Cache(#[from] cachet_cache::CacheError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Upstream fetch failure (timeout, DNS, connect, TLS to origin).
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Failure to establish a blind tunnel to the requested authority.
    #[error("tunnel failure: {0}")]
    Tunnel(String),

    /// Malformed client request.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to generate a certificate.
    #[error("failed to generate certificate: {0}")]
    Generation(String),

    /// Failed to read CA material.
    #[error("failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA material.
    #[error("failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA material.
    #[error("failed to write CA: {0}")]
    Write(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
