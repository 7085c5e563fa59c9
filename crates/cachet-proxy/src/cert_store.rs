//! Process-wide leaf certificate store.
//!
//! Minting a leaf and building its rustls config costs a key generation
//! per host, so results are memoized for the process lifetime. Writes are
//! atomic per key; two tasks racing on a cold host both mint and the
//! second insert wins, which is harmless - both leaves are valid.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::ServerConfig;

use crate::ca::CaManager;
use crate::error::CaError;

/// Host name to minted server configuration mapping.
#[derive(Debug, Default)]
pub struct CertStore {
    certs: RwLock<HashMap<String, Arc<ServerConfig>>>,
}

impl CertStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached config for `host`, or mints one with `mint` and
    /// caches it.
    pub fn fetch<F>(&self, host: &str, mint: F) -> Result<Arc<ServerConfig>, CaError>
    where
        F: FnOnce() -> Result<Arc<ServerConfig>, CaError>,
    {
        if let Some(config) = self.certs.read().get(host) {
            return Ok(config.clone());
        }

        let config = mint()?;
        self.certs
            .write()
            .insert(host.to_string(), config.clone());
        Ok(config)
    }

    /// Number of hosts with a minted leaf.
    pub fn len(&self) -> usize {
        self.certs.read().len()
    }

    /// Returns true when no leaf has been minted yet.
    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }
}

/// The CA plus its memoized leaves - everything TLS interception needs.
#[derive(Debug)]
pub struct TlsInterceptor {
    ca: CaManager,
    store: CertStore,
}

impl TlsInterceptor {
    /// Creates an interceptor over the given CA.
    pub fn new(ca: CaManager) -> Self {
        Self {
            ca,
            store: CertStore::new(),
        }
    }

    /// Returns the server configuration presented to clients connecting
    /// to `host`, minting the leaf on first use.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        self.store.fetch(host, || self.ca.mint_server_config(host))
    }

    /// Returns the CA certificate PEM, for installing into trust stores.
    pub fn ca_cert_pem(&self) -> &str {
        self.ca.cert_pem()
    }

    /// Returns the leaf store.
    pub fn store(&self) -> &CertStore {
        &self.store
    }
}
