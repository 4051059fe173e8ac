//! stage-core: Core abstractions and configuration for the stage connector
//!
//! This crate provides the configuration model, shared domain types and the
//! error taxonomy used by the connector runtime and its command-line front end.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use error::{ConfigError, ConnectError, StageError, TransportError};
pub use types::{Capabilities, ConnectionState, Endpoint};
