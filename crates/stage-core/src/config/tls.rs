//! Transport security configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which secure channel implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsBackend {
    /// rustls, available on every platform
    #[default]
    Rustls,
    /// The platform TLS library (OpenSSL, Schannel, Security.framework);
    /// requires the `native-tls` feature of the connector crate
    NativeTls,
    /// No encryption, for loopback development servers only
    Plaintext,
}

/// TLS trust configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Secure channel implementation
    pub backend: TlsBackend,

    /// Additional PEM files with trusted CA certificates
    pub ca_certificates: Vec<PathBuf>,

    /// Trust the bundled public web PKI roots (rustls backend)
    pub use_webpki_roots: bool,

    /// Hex SHA-256 of the expected server leaf certificate (DER)
    pub pinned_sha256: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            backend: TlsBackend::Rustls,
            ca_certificates: Vec::new(),
            use_webpki_roots: true,
            pinned_sha256: None,
        }
    }
}
