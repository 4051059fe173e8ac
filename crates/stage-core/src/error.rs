//! Core error types for the stage connector

use stage_protocol::CodecError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the stage connector ecosystem
#[derive(Error, Debug)]
pub enum StageError {
    /// Codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Connection establishment error
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Established transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while establishing a transport (before any frame is exchanged)
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Endpoint could not be resolved to an address
    #[error("Failed to resolve {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Dialing or the TLS handshake did not finish in time
    #[error("Connection to {endpoint} timed out")]
    Timeout { endpoint: String },

    /// TLS negotiation or certificate verification failed
    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// The host cannot be used as a TLS server name
    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    /// Socket-level failure (refused, unreachable, ...)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors on an established transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed the stream, or the transport was closed locally
    #[error("Connection closed")]
    Closed,

    /// The peer reset the connection
    #[error("Connection reset by peer")]
    ResetByPeer,

    /// The protocol handshake failed or was rejected
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Stream framing is broken
    #[error("Corrupt stream: {0}")]
    Corrupt(CodecError),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::ResetByPeer,
            io::ErrorKind::UnexpectedEof => TransportError::Closed,
            _ => TransportError::Io(err),
        }
    }
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(io) => io.into(),
            other => TransportError::Corrupt(other),
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
