//! Connector facade
//!
//! [`Connector`] is the application-facing handle: it starts and stops the
//! session task, routes outgoing messages and registers subscribers. Several
//! connectors can run side by side; they share nothing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stage_core::config::ConnectorConfig;
use stage_core::{ConnectionState, Endpoint};
use stage_protocol::Message;

use crate::bus::{EventBus, Subscription};
use crate::error::ConnectorError;
use crate::event::{DisconnectReason, EventCategory, Event, LifecycleEvent};
use crate::session::driver::{Driver, Shared};
use crate::session::{BackoffPolicy, ExponentialBackoff, Session};
use crate::transport::{channel_from_config, SecureChannel};

/// How long `close` waits for the session task before aborting it
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type BackoffFactory = Arc<dyn Fn() -> Box<dyn BackoffPolicy> + Send + Sync>;

struct DriverHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Client connection to a stage collaboration server
pub struct Connector {
    config: Arc<ConnectorConfig>,
    endpoint: Endpoint,
    server_name: String,
    channel: Arc<dyn SecureChannel>,
    backoff: BackoffFactory,
    shared: Arc<Shared>,
    driver: Mutex<Option<DriverHandle>>,
}

impl Connector {
    /// Create a connector using the secure channel named in `config.tls`
    pub fn new(config: ConnectorConfig) -> Result<Self, ConnectorError> {
        let channel = channel_from_config(&config.tls)?;
        Self::with_channel(config, channel)
    }

    /// Create a connector with an explicit secure channel
    pub fn with_channel(
        config: ConnectorConfig,
        channel: Arc<dyn SecureChannel>,
    ) -> Result<Self, ConnectorError> {
        config.validate()?;
        let endpoint = config.endpoint()?;
        let server_name = config.server_name()?;

        let backoff_config = config.backoff.clone();
        let backoff: BackoffFactory = Arc::new(move || -> Box<dyn BackoffPolicy> {
            Box::new(ExponentialBackoff::from_config(&backoff_config))
        });
        let bus = EventBus::new(config.event_capacity);
        let shared = Arc::new(Shared::new(config.send_buffer_size, bus));

        Ok(Self {
            config: Arc::new(config),
            endpoint,
            server_name,
            channel,
            backoff,
            shared,
            driver: Mutex::new(None),
        })
    }

    /// Replace the reconnect delay policy. `factory` is called once per
    /// `connect`.
    pub fn with_backoff<F, B>(mut self, factory: F) -> Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: BackoffPolicy + 'static,
    {
        self.backoff = Arc::new(move || -> Box<dyn BackoffPolicy> { Box::new(factory()) });
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// The event bus, for subscribing and for tests
    pub fn events(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Start the session task. Returns immediately; progress is reported
    /// through lifecycle events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<(), ConnectorError> {
        let mut driver = self.lock_driver();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let previous = {
            let mut outbox = self.shared.lock();
            // A task that reported Failed is only winding down
            let running = driver.as_ref().is_some_and(|handle| !handle.task.is_finished());
            if running && outbox.state != ConnectionState::Failed {
                return Err(ConnectorError::AlreadyRunning);
            }
            outbox.outbound = Some(outbound_tx);
            outbox.state
        };

        let cancel = CancellationToken::new();
        let session = Session::resume(
            self.endpoint.clone(),
            self.config.max_reconnect_attempts,
            previous,
        );
        let task = Driver::new(
            Arc::clone(&self.config),
            session,
            self.server_name.clone(),
            Arc::clone(&self.channel),
            (self.backoff)(),
            Arc::clone(&self.shared),
            outbound_rx,
            cancel.clone(),
        );

        info!("Starting session to {}", self.endpoint);
        *driver = Some(DriverHandle {
            cancel,
            task: tokio::spawn(task.run()),
        });
        Ok(())
    }

    /// Send a message to the server.
    ///
    /// While active the message is queued for the session task. Otherwise it
    /// goes to the send buffer, or fails with
    /// [`ConnectorError::NotConnected`] when buffering is disabled. Outgoing
    /// state deltas get their sequence number when they are written.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), ConnectorError> {
        let mut message = message.into();
        if message.is_protocol() {
            return Err(ConnectorError::InvalidMessage(format!(
                "{} messages are sent by the connector itself",
                message.kind_name()
            )));
        }

        let mut outbox = self.shared.lock();
        if outbox.state == ConnectionState::Active {
            if let Some(outbound) = &outbox.outbound {
                match outbound.send(message) {
                    Ok(()) => return Ok(()),
                    Err(returned) => message = returned.0,
                }
            }
        }

        outbox
            .hold(message, &self.shared.bus)
            .map_err(|_| ConnectorError::NotConnected)
    }

    /// Subscribe to one category of events
    ///
    /// Must be called from within a tokio runtime.
    pub fn on<F>(&self, category: EventCategory, callback: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(category, callback)
    }

    /// Remove a subscription. Unknown or already removed subscriptions are
    /// ignored.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.shared.bus.unsubscribe(subscription);
    }

    /// Stop the session and close the connection. Buffered messages are kept
    /// for a later `connect`. Safe to call more than once.
    pub async fn close(&self) {
        let handle = self.lock_driver().take();
        if let Some(DriverHandle { cancel, mut task }) = handle {
            cancel.cancel();
            match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Session task ended abnormally: {}", e),
                Err(_) => {
                    warn!("Session task did not stop within {:?}, aborting", CLOSE_TIMEOUT);
                    task.abort();
                }
            }
        }

        // Covers a task that had already failed or was aborted
        let from = {
            let mut outbox = self.shared.lock();
            outbox.outbound = None;
            std::mem::replace(&mut outbox.state, ConnectionState::Disconnected)
        };
        if from != ConnectionState::Disconnected {
            debug!("Settling {} session as disconnected", from);
            self.shared.bus.publish(LifecycleEvent::StateChanged {
                from,
                to: ConnectionState::Disconnected,
            });
            self.shared.bus.publish(LifecycleEvent::Disconnected {
                reason: DisconnectReason::ClosedByCaller,
            });
        }
    }

    fn lock_driver(&self) -> MutexGuard<'_, Option<DriverHandle>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let driver = self.driver.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = driver.take() {
            handle.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("endpoint", &self.endpoint)
            .field("channel", &self.channel.name())
            .field("state", &self.state())
            .finish()
    }
}
