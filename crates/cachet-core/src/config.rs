//! Application configuration.
//!
//! The configuration is loaded from a TOML file merged over built-in
//! defaults: any field absent from the file keeps its default value.
//! `Config::validate` is called once at startup; the rest of the code
//! assumes a valid record.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rules::RuleSet;

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(String),

    /// The configuration is structurally valid but semantically wrong.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub rules: RuleSet,
    pub log: LogConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http: HttpConfig,
    pub https: HttpsConfig,
}

/// Plaintext proxy endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address the proxy endpoint listens on.
    pub address: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// TLS interception configuration.
///
/// When `enabled`, every CONNECT is intercepted with a leaf certificate
/// signed by the configured CA. When the CA file paths are empty, a CA is
/// generated under the user data directory on first run and reused after.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsConfig {
    pub enabled: bool,
    pub ca_cert_file: String,
    pub ca_key_file: String,
    pub transparent: TransparentConfig,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_cert_file: String::new(),
            ca_key_file: String::new(),
            transparent: TransparentConfig::default(),
        }
    }
}

/// Transparent HTTPS listener configuration.
///
/// An empty address disables the listener.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransparentConfig {
    pub address: String,
}

/// Cache storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live for cache entries, e.g. `"1h"`, `"90s"`, `"1h30m"`.
    /// `"0"` means entries never expire.
    pub ttl: String,
    /// Root directory of the on-disk cache.
    pub folder: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: "1h".to_string(),
            folder: PathBuf::from("./cache"),
        }
    }
}

impl CacheConfig {
    /// Parses the configured TTL string.
    pub fn parse_ttl(&self) -> Result<Duration, ConfigError> {
        parse_ttl(&self.ttl)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// When true, the configured level also applies to third-party crates.
    pub third_party: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            third_party: false,
        }
    }
}

const VALID_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error"];

impl Config {
    /// Loads configuration from a TOML file merged over defaults.
    ///
    /// A missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            tracing::debug!("no config file at {}, using defaults", path.display());
            return Ok(Config::default());
        }

        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.http.address.is_empty() {
            return Err(ConfigError::Invalid("server.http.address is empty".into()));
        }

        self.cache.parse_ttl()?;

        let https = &self.server.https;
        if https.ca_cert_file.is_empty() != https.ca_key_file.is_empty() {
            return Err(ConfigError::Invalid(
                "ca_cert_file and ca_key_file must be set together".into(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log level must be one of 'debug', 'info', 'warn', 'error', got: {}",
                self.log.level
            )));
        }

        for rule in &self.rules.rules {
            if rule.base_uri.is_empty() {
                return Err(ConfigError::Invalid("rule with empty base_uri".into()));
            }
        }

        Ok(())
    }
}

/// Parses a TTL string of the form `<int><unit>[...]` with units
/// `s`, `m`, `h`, `d`, e.g. `"90s"` or `"1h30m"`. `"0"` means forever.
pub fn parse_ttl(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(ConfigError::Invalid("empty TTL".into()));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut saw_component = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(ConfigError::Invalid(format!("invalid TTL '{s}'")));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid TTL '{s}'")))?;
        let unit_secs = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(ConfigError::Invalid(format!("unknown TTL unit '{ch}' in '{s}'"))),
        };
        total += Duration::from_secs(value * unit_secs);
        digits.clear();
        saw_component = true;
    }

    if !digits.is_empty() || !saw_component {
        return Err(ConfigError::Invalid(format!(
            "TTL '{s}' has a number without a unit"
        )));
    }

    Ok(total)
}
