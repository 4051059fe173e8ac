//! Errors returned by the connector API

use thiserror::Error;

use stage_core::ConfigError;

/// Coarse classification of connector failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The session is not active and buffering is disabled
    NotConnected,
    /// A buffered message was discarded to make room
    BackpressureDropped,
    /// `connect` was called while a session is already running
    AlreadyRunning,
    /// The message cannot be sent by the application
    InvalidMessage,
    /// Bad configuration
    Config,
    /// A frame or payload could not be decoded
    Codec,
}

/// Errors returned synchronously by [`Connector`](crate::Connector) methods
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Not active and no send buffer configured
    #[error("Not connected")]
    NotConnected,

    /// A session task is already running
    #[error("Connector is already running")]
    AlreadyRunning,

    /// Protocol messages (hello, ping, ...) are sent by the connector itself
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ConnectorError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::NotConnected => ErrorKind::NotConnected,
            ConnectorError::AlreadyRunning => ErrorKind::AlreadyRunning,
            ConnectorError::InvalidMessage(_) => ErrorKind::InvalidMessage,
            ConnectorError::Config(_) => ErrorKind::Config,
        }
    }
}
