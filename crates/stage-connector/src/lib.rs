//! stage-connector: client connector for the stage collaboration platform
//!
//! The connector keeps one logical session with the central collaboration
//! server alive: it dials over TLS, negotiates capabilities, reconnects with
//! backoff when the link drops, and fans incoming messages and lifecycle
//! changes out to subscribers registered per [`EventCategory`].
//!
//! ```no_run
//! use stage_connector::{Connector, EventCategory};
//! use stage_core::config::ConnectorConfig;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let connector = Connector::new(ConnectorConfig::default())?;
//! let _deltas = connector.on(EventCategory::StateDelta, |event| {
//!     println!("{event:?}");
//!     Ok(())
//! });
//! connector.connect()?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod connector;
pub mod error;
pub mod event;
pub mod session;
pub mod transport;

pub use bus::{EventBus, ScopedSubscription, Subscription, SubscriptionId};
pub use connector::Connector;
pub use error::{ConnectorError, ErrorKind};
pub use event::{Diagnostic, DisconnectReason, Event, EventCategory, LifecycleEvent};
pub use session::{BackoffPolicy, ExponentialBackoff, FixedBackoff};
pub use transport::{PlainChannel, SecureChannel};
