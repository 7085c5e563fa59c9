//! Cachet Core - configuration and caching rules.
//!
//! This crate holds the pieces shared between the proxy and the binary:
//! the validated configuration record loaded from a TOML file, and the
//! ordered ruleset that decides whether a request/response pair is cached.

pub mod config;
pub mod rules;

pub use config::{
    CacheConfig, Config, ConfigError, HttpConfig, HttpsConfig, LogConfig, ServerConfig,
    TransparentConfig,
};
pub use rules::{status_matches, CacheRule, RuleMode, RuleSet};

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
