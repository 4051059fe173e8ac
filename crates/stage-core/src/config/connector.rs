//! Connector configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::serde_utils::duration_millis;
use super::tls::TlsConfig;
use crate::error::ConfigError;
use crate::types::Endpoint;

/// Largest accepted backoff multiplier
const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// Configuration for one connector instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Server endpoint as `host:port`
    pub endpoint: String,

    /// TLS server name, if it differs from the endpoint host
    pub server_name: Option<String>,

    /// Transport security
    pub tls: TlsConfig,

    /// Offer compressed frames during the handshake
    pub compression: bool,

    /// Reconnect attempts after a lost connection before giving up.
    /// Absent means retry forever (delays stay capped by the backoff).
    pub max_reconnect_attempts: Option<u32>,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,

    /// Messages kept while not connected; 0 makes such sends fail immediately
    pub send_buffer_size: usize,

    /// Limit for dialing plus TLS negotiation
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Limit for receiving the hello acknowledgment
    #[serde(with = "duration_millis")]
    pub handshake_timeout: Duration,

    /// Send a ping after this much inbound silence (0 disables)
    #[serde(with = "duration_millis")]
    pub keepalive_interval: Duration,

    /// Drop the connection after this much inbound silence (0 disables)
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,

    /// Events a subscriber may fall behind before it starts skipping
    pub event_capacity: usize,

    /// Bearer token sent in the hello message
    pub token: Option<String>,

    /// Device description sent in the hello message
    pub device: Option<Value>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost:4443".to_string(),
            server_name: None,
            tls: TlsConfig::default(),
            compression: true,
            max_reconnect_attempts: None,
            backoff: BackoffConfig::default(),
            send_buffer_size: 0,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
            event_capacity: 1024,
            token: None,
            device: None,
        }
    }
}

impl ConnectorConfig {
    /// Parsed server endpoint
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        self.endpoint.parse()
    }

    /// Name to verify the server certificate against
    pub fn server_name(&self) -> Result<String, ConfigError> {
        match &self.server_name {
            Some(name) => Ok(name.clone()),
            None => Ok(self.endpoint()?.host),
        }
    }

    /// Check values that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint()?;

        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.backoff.multiplier) {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier {} must be between 1.0 and {}",
                self.backoff.multiplier, MAX_BACKOFF_MULTIPLIER
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff jitter {} must be between 0.0 and 1.0",
                self.backoff.jitter
            )));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(ConfigError::Invalid(
                "backoff initial delay exceeds its maximum".to_string(),
            ));
        }

        Ok(())
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
