//! Certificate Authority management for MITM interception.
//!
//! Loads the root CA configured by the user, or generates and persists
//! one under the user data directory, and signs per-host leaf
//! certificates with it on the fly.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::error::CaError;

/// CA certificate and key file names used for a generated CA.
const CA_CERT_FILENAME: &str = "cachet-ca.crt";
const CA_KEY_FILENAME: &str = "cachet-ca.key";

/// Holds the root CA and signs leaf certificates for intercepted hosts.
pub struct CaManager {
    issuer: Issuer<'static, KeyPair>,
    cert_pem: String,
}

impl std::fmt::Debug for CaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaManager").finish_non_exhaustive()
    }
}

impl CaManager {
    /// Loads a CA from existing certificate and key PEM files.
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;
        let manager = Self::from_pem(&cert_pem, &key_pem)?;
        tracing::debug!("loaded CA certificate from {}", cert_path.display());
        Ok(manager)
    }

    /// Builds a CA from PEM strings.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, CaError> {
        let key_pair = KeyPair::from_pem(key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            issuer,
            cert_pem: cert_pem.to_string(),
        })
    }

    /// Loads the CA from `ca_dir`, generating and persisting a new one if
    /// the files are missing.
    pub fn load_or_generate(ca_dir: &Path) -> Result<Self, CaError> {
        let cert_path = ca_dir.join(CA_CERT_FILENAME);
        let key_path = ca_dir.join(CA_KEY_FILENAME);

        if cert_path.exists() && key_path.exists() {
            return Self::from_files(&cert_path, &key_path);
        }
        Self::generate_into(ca_dir)
    }

    /// Loads or generates the CA under the default user data directory.
    pub fn with_default_dir() -> Result<Self, CaError> {
        let dirs = directories::ProjectDirs::from("dev", "cachet", "cachet")
            .ok_or_else(|| CaError::Generation("failed to resolve user data directory".into()))?;
        Self::load_or_generate(&dirs.data_dir().join("ca"))
    }

    /// Generates a fresh root CA and writes it into `ca_dir`.
    fn generate_into(ca_dir: &Path) -> Result<Self, CaError> {
        fs::create_dir_all(ca_dir)?;

        let key_pair = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(vec!["Cachet Root CA".to_string()])
            .map_err(|e| CaError::Generation(e.to_string()))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let cert_pem = cert.pem();
        let key_pem = key_pair.serialize_pem();
        fs::write(ca_dir.join(CA_CERT_FILENAME), &cert_pem)
            .map_err(|e| CaError::Write(e.to_string()))?;
        fs::write(ca_dir.join(CA_KEY_FILENAME), &key_pem)
            .map_err(|e| CaError::Write(e.to_string()))?;

        tracing::info!(
            "generated new CA certificate at {}",
            ca_dir.join(CA_CERT_FILENAME).display()
        );

        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Returns the CA certificate PEM, for installing into trust stores.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Mints a leaf certificate for `host` signed by this CA and wraps it
    /// in a rustls server configuration ready for the TLS handshake.
    pub fn mint_server_config(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        let leaf_key = KeyPair::generate().map_err(|e| CaError::Generation(e.to_string()))?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .map_err(|e| CaError::Generation(e.to_string()))?;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| CaError::Generation(e.to_string()))?;

        let chain = vec![cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| CaError::Generation(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| CaError::Generation(e.to_string()))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        tracing::debug!("minted leaf certificate for {host}");
        Ok(Arc::new(config))
    }

    /// Returns the on-disk file names a generated CA uses.
    pub fn file_names() -> (&'static str, &'static str) {
        (CA_CERT_FILENAME, CA_KEY_FILENAME)
    }
}
