//! Secure channel backends
//!
//! A [`SecureChannel`] turns a connected TCP stream into an encrypted byte
//! stream. The transport never looks at certificates or cipher suites itself;
//! everything TLS-specific lives behind this trait so backends can be swapped
//! from configuration.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use stage_core::config::{TlsBackend, TlsConfig};
use stage_core::{ConfigError, ConnectError};

/// Byte stream produced by a secure channel
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased stream handed to the transport
pub type BoxedStream = Box<dyn AsyncStream>;

/// Establishes the encrypted layer on top of a TCP connection
#[async_trait]
pub trait SecureChannel: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &'static str;

    /// Run the secure handshake over `stream`, verifying the server as
    /// `server_name`.
    async fn handshake(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<BoxedStream, ConnectError>;
}

/// Build the channel selected by `config.backend`
pub fn channel_from_config(config: &TlsConfig) -> Result<Arc<dyn SecureChannel>, ConfigError> {
    match config.backend {
        TlsBackend::Rustls => Ok(Arc::new(RustlsChannel::from_config(config)?)),
        #[cfg(feature = "native-tls")]
        TlsBackend::NativeTls => Ok(Arc::new(NativeTlsChannel::from_config(config)?)),
        #[cfg(not(feature = "native-tls"))]
        TlsBackend::NativeTls => Err(ConfigError::Invalid(
            "the native-tls backend is not compiled in (enable the `native-tls` feature)".into(),
        )),
        TlsBackend::Plaintext => {
            tracing::warn!("TLS disabled - traffic to the server is not encrypted");
            Ok(Arc::new(PlainChannel))
        }
    }
}

/// Unencrypted channel for loopback development servers and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainChannel;

#[async_trait]
impl SecureChannel for PlainChannel {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        _server_name: &str,
    ) -> Result<BoxedStream, ConnectError> {
        Ok(Box::new(stream))
    }
}

/// TLS via rustls (ring provider)
pub struct RustlsChannel {
    connector: tokio_rustls::TlsConnector,
    pinned: Option<Vec<u8>>,
}

impl RustlsChannel {
    /// Build the client configuration from trust settings
    pub fn from_config(config: &TlsConfig) -> Result<Self, ConfigError> {
        let mut roots = rustls::RootCertStore::empty();
        if config.use_webpki_roots {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        for path in &config.ca_certificates {
            for cert in load_pem_certificates(path)? {
                roots.add(cert).map_err(|e| {
                    ConfigError::Invalid(format!("Bad CA certificate in {:?}: {}", path, e))
                })?;
            }
        }
        if roots.is_empty() {
            return Err(ConfigError::Invalid(
                "no trusted root certificates configured".into(),
            ));
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigError::Invalid(format!("TLS setup failed: {}", e)))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client_config)),
            pinned: parse_pin(config.pinned_sha256.as_deref())?,
        })
    }
}

#[async_trait]
impl SecureChannel for RustlsChannel {
    fn name(&self) -> &'static str {
        "rustls"
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<BoxedStream, ConnectError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|_| ConnectError::InvalidServerName(server_name.to_string()))?;

        let stream = self
            .connector
            .connect(name, stream)
            .await
            .map_err(|e| ConnectError::Tls(e.to_string()))?;

        if let Some(pin) = &self.pinned {
            let (_, session) = stream.get_ref();
            let leaf = session
                .peer_certificates()
                .and_then(|chain| chain.first())
                .ok_or_else(|| ConnectError::Tls("server presented no certificate".into()))?;
            verify_pin(leaf.as_ref(), pin)?;
        }

        Ok(Box::new(stream))
    }
}

/// TLS via the platform library
#[cfg(feature = "native-tls")]
pub struct NativeTlsChannel {
    connector: tokio_native_tls::TlsConnector,
    pinned: Option<Vec<u8>>,
}

#[cfg(feature = "native-tls")]
impl NativeTlsChannel {
    /// Build the connector from trust settings; system roots are always trusted
    pub fn from_config(config: &TlsConfig) -> Result<Self, ConfigError> {
        use tokio_native_tls::native_tls;

        let mut builder = native_tls::TlsConnector::builder();
        for path in &config.ca_certificates {
            let pem = std::fs::read(path)
                .map_err(|e| ConfigError::Invalid(format!("Failed to read {:?}: {}", path, e)))?;
            let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| {
                ConfigError::Invalid(format!("Bad CA certificate in {:?}: {}", path, e))
            })?;
            builder.add_root_certificate(cert);
        }
        let connector = builder
            .build()
            .map_err(|e| ConfigError::Invalid(format!("TLS setup failed: {}", e)))?;

        Ok(Self {
            connector: tokio_native_tls::TlsConnector::from(connector),
            pinned: parse_pin(config.pinned_sha256.as_deref())?,
        })
    }
}

#[cfg(feature = "native-tls")]
#[async_trait]
impl SecureChannel for NativeTlsChannel {
    fn name(&self) -> &'static str {
        "native-tls"
    }

    async fn handshake(
        &self,
        stream: TcpStream,
        server_name: &str,
    ) -> Result<BoxedStream, ConnectError> {
        let stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ConnectError::Tls(e.to_string()))?;

        if let Some(pin) = &self.pinned {
            let leaf = stream
                .get_ref()
                .peer_certificate()
                .map_err(|e| ConnectError::Tls(e.to_string()))?
                .ok_or_else(|| ConnectError::Tls("server presented no certificate".into()))?;
            let der = leaf.to_der().map_err(|e| ConnectError::Tls(e.to_string()))?;
            verify_pin(&der, pin)?;
        }

        Ok(Box::new(stream))
    }
}

fn load_pem_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let file = File::open(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to open {:?}: {}", path, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Invalid(format!("Failed to parse {:?}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "No certificates found in {:?}",
            path
        )));
    }
    Ok(certs)
}

/// Parse a hex SHA-256 fingerprint; `:` separators and case are ignored
fn parse_pin(pin: Option<&str>) -> Result<Option<Vec<u8>>, ConfigError> {
    let Some(pin) = pin else {
        return Ok(None);
    };
    let cleaned: String = pin.chars().filter(|c| *c != ':').collect();
    let digest = hex::decode(cleaned.to_ascii_lowercase())
        .map_err(|e| ConfigError::Invalid(format!("pinned_sha256 is not hex: {}", e)))?;
    if digest.len() != 32 {
        return Err(ConfigError::Invalid(format!(
            "pinned_sha256 must be 32 bytes, got {}",
            digest.len()
        )));
    }
    Ok(Some(digest))
}

fn verify_pin(der: &[u8], pin: &[u8]) -> Result<(), ConnectError> {
    let actual = Sha256::digest(der);
    if actual.as_slice() != pin {
        return Err(ConnectError::Tls(format!(
            "certificate fingerprint mismatch (got {})",
            hex::encode(actual)
        )));
    }
    Ok(())
}
