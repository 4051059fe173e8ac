//! Session driver task
//!
//! One task per running connector owns the transport and the [`Session`].
//! Reads, writes, keepalives and reconnects are all serialized through its
//! loop; the facade only talks to it through the outbound channel, the
//! shared outbox and the cancellation token.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use stage_core::config::ConnectorConfig;
use stage_core::time::{current_time_millis, elapsed_millis};
use stage_core::{Capabilities, ConnectionState, TransportError};
use stage_protocol::{decode, encode, Frame, Hello, Message, PROTOCOL_VERSION};

use super::backoff::BackoffPolicy;
use super::buffer::SendBuffer;
use super::machine::{InvalidTransition, Session, Transition};
use crate::bus::EventBus;
use crate::event::{Diagnostic, DisconnectReason, Event, LifecycleEvent};
use crate::transport::{SecureChannel, Transport, TransportWriter};

/// State visible to callers of `send`, guarded together so a message is
/// either handed to the driver while active or buffered, never lost in
/// between.
#[derive(Debug)]
pub(crate) struct Outbox {
    pub(crate) state: ConnectionState,
    pub(crate) buffer: SendBuffer,
    /// Queue into the running driver
    pub(crate) outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl Outbox {
    /// Buffer a message for the next active connection. Gives the message
    /// back when buffering is disabled.
    pub(crate) fn hold(&mut self, message: Message, bus: &EventBus) -> Result<(), Message> {
        if !self.buffer.is_enabled() {
            return Err(message);
        }
        if let Some(evicted) = self.buffer.push(message) {
            warn!(
                "Send buffer full ({}), dropped oldest {} message",
                self.buffer.capacity(),
                evicted.kind_name()
            );
            bus.publish(Diagnostic::BackpressureDropped {
                kind: evicted.kind_name().to_string(),
                capacity: self.buffer.capacity(),
            });
        }
        Ok(())
    }
}

/// Shared between the facade and the driver
#[derive(Debug)]
pub(crate) struct Shared {
    outbox: Mutex<Outbox>,
    pub(crate) bus: EventBus,
}

impl Shared {
    pub(crate) fn new(send_buffer_size: usize, bus: EventBus) -> Self {
        Self {
            outbox: Mutex::new(Outbox {
                state: ConnectionState::Disconnected,
                buffer: SendBuffer::new(send_buffer_size),
                outbound: None,
            }),
            bus,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum AttemptError {
    /// The server refused the session; not retried
    Rejected(String),
    /// Anything else that went wrong before the session became active
    Failed(String),
}

enum LinkEnd {
    /// Cancelled by the facade
    Closed,
    /// The connection broke
    Lost(DisconnectReason),
}

/// Runs one connector's session until it is closed or fails for good
pub(crate) struct Driver {
    config: Arc<ConnectorConfig>,
    server_name: String,
    channel: Arc<dyn SecureChannel>,
    session: Session,
    backoff: Box<dyn BackoffPolicy>,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
}

impl Driver {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<ConnectorConfig>,
        session: Session,
        server_name: String,
        channel: Arc<dyn SecureChannel>,
        backoff: Box<dyn BackoffPolicy>,
        shared: Arc<Shared>,
        outbound: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            server_name,
            channel,
            session,
            backoff,
            shared,
            outbound,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let started = self.session.connect();
        self.commit(started);
        let cancel = self.cancel.clone();

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.establish() => attempt,
            };

            match attempt {
                Ok((transport, capabilities)) => {
                    match self.run_active(transport, capabilities).await {
                        LinkEnd::Closed => break,
                        LinkEnd::Lost(reason) => {
                            warn!("Connection to {} lost: {}", self.session.endpoint(), reason);
                            let lost = self.session.connection_lost();
                            self.commit(lost);
                            self.publish(LifecycleEvent::Disconnected { reason });
                        }
                    }
                }
                Err(AttemptError::Rejected(reason)) => {
                    let reason = TransportError::HandshakeFailed(reason).to_string();
                    error!("Session rejected by {}: {}", self.session.endpoint(), reason);
                    let rejected = self.session.handshake_rejected();
                    self.commit(rejected);
                    self.publish(LifecycleEvent::Failed { reason });
                    return;
                }
                Err(AttemptError::Failed(error)) => {
                    let attempt = self.session.attempt();
                    warn!(
                        attempt,
                        "Connection attempt to {} failed: {}",
                        self.session.endpoint(),
                        error
                    );
                    let failed = self.session.attempt_failed();
                    self.commit(failed);
                    self.publish(LifecycleEvent::ReconnectFailed {
                        attempt,
                        error: error.clone(),
                    });

                    if self.session.state() == ConnectionState::Failed {
                        let reason =
                            format!("Giving up after {} reconnect attempts: {}", attempt, error);
                        error!("{}", reason);
                        self.publish(LifecycleEvent::Failed { reason });
                        return;
                    }
                }
            }

            let delay = self.backoff.next_delay();
            info!("Reconnecting to {} in {:?}", self.session.endpoint(), delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            let next = self.session.begin_reconnect();
            self.commit(next);
        }

        let closed = self.session.close();
        if closed.from != ConnectionState::Disconnected {
            info!("Session to {} closed", self.session.endpoint());
            self.commit(Ok(closed));
            self.publish(LifecycleEvent::Disconnected {
                reason: DisconnectReason::ClosedByCaller,
            });
        }
    }

    /// Apply a session transition: mirror the state for the facade, move
    /// queued messages between the outbound channel and the buffer, and
    /// publish the change. Returns the buffered messages when the session
    /// just became active.
    fn commit(&mut self, result: Result<Transition, InvalidTransition>) -> Vec<Message> {
        let transition = match result {
            Ok(transition) => transition,
            Err(e) => {
                error!("Session state error: {}", e);
                return Vec::new();
            }
        };

        let mut flushed = Vec::new();
        {
            let mut outbox = self.shared.lock();
            outbox.state = transition.to;
            if transition.to == ConnectionState::Active {
                flushed = outbox.buffer.drain();
            } else if transition.from == ConnectionState::Active {
                // Sent while active but never written
                while let Ok(message) = self.outbound.try_recv() {
                    if let Err(message) = outbox.hold(message, &self.shared.bus) {
                        self.shared.bus.publish(Diagnostic::Undelivered {
                            kind: message.kind_name().to_string(),
                            reason: "connection lost before the message was written".into(),
                        });
                    }
                }
            }
        }

        self.publish(LifecycleEvent::StateChanged {
            from: transition.from,
            to: transition.to,
        });
        flushed
    }

    fn publish(&self, event: impl Into<Event>) {
        self.shared.bus.publish(event);
    }

    /// Dial, secure and handshake one connection
    async fn establish(&mut self) -> Result<(Transport, Capabilities), AttemptError> {
        let endpoint = self.session.endpoint().clone();
        info!("Connecting to {} ({})", endpoint, self.channel.name());

        let mut transport = Transport::connect(
            &endpoint,
            &self.server_name,
            self.channel.as_ref(),
            self.config.connect_timeout,
        )
        .await
        .map_err(|e| AttemptError::Failed(e.to_string()))?;

        let established = self.session.transport_established();
        self.commit(established);

        let timeout = self.config.handshake_timeout;
        match tokio::time::timeout(timeout, self.handshake(&mut transport)).await {
            Ok(Ok(capabilities)) => Ok((transport, capabilities)),
            Ok(Err(e)) => {
                transport.close().await;
                Err(e)
            }
            Err(_) => {
                transport.close().await;
                Err(AttemptError::Failed(format!(
                    "no hello-ack within {:?}",
                    timeout
                )))
            }
        }
    }

    async fn handshake(&self, transport: &mut Transport) -> Result<Capabilities, AttemptError> {
        let failed = |e: TransportError| AttemptError::Failed(e.to_string());

        let mut hello = Hello::new(self.config.compression);
        hello.token = self.config.token.clone();
        hello.device = self.config.device.clone();
        let frame = encode(&Message::Hello(hello), false)
            .map_err(|e| AttemptError::Failed(e.to_string()))?;
        transport.write(frame).await.map_err(failed)?;

        loop {
            let frame = transport.read().await.map_err(failed)?;
            match decode(&frame) {
                Ok(Message::HelloAck(ack)) if !ack.accepted => {
                    return Err(AttemptError::Rejected(
                        ack.reason.unwrap_or_else(|| "no reason given".to_string()),
                    ));
                }
                Ok(Message::HelloAck(ack)) => {
                    let protocol_version = ack.protocol_version.unwrap_or(PROTOCOL_VERSION);
                    if protocol_version > PROTOCOL_VERSION {
                        return Err(AttemptError::Rejected(format!(
                            "server requires protocol version {}, this connector speaks {}",
                            protocol_version, PROTOCOL_VERSION
                        )));
                    }
                    return Ok(Capabilities {
                        protocol_version,
                        compression: self.config.compression && ack.compression.unwrap_or(false),
                    });
                }
                Ok(Message::Ping { timestamp }) => {
                    let pong = encode(&Message::Pong { timestamp }, false)
                        .map_err(|e| AttemptError::Failed(e.to_string()))?;
                    transport.write(pong).await.map_err(failed)?;
                }
                Ok(other) => {
                    return Err(AttemptError::Failed(format!(
                        "expected hello-ack, got {}",
                        other.kind_name()
                    )));
                }
                Err(e) => {
                    return Err(AttemptError::Failed(format!(
                        "invalid handshake response: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Serve an active connection until it breaks or the driver is cancelled
    async fn run_active(&mut self, transport: Transport, capabilities: Capabilities) -> LinkEnd {
        let (mut reader, mut writer) = transport.into_split();

        let reconnected = self.session.has_been_active();
        let accepted = self.session.handshake_accepted(capabilities);
        let pending = self.commit(accepted);
        self.backoff.reset();

        let endpoint = self.session.endpoint().clone();
        info!(
            compression = capabilities.compression,
            "Session active on {}", endpoint
        );
        self.publish(LifecycleEvent::Connected {
            endpoint,
            capabilities,
            reconnected,
        });

        if !pending.is_empty() {
            debug!("Flushing {} buffered messages", pending.len());
        }
        let mut pending = pending.into_iter();
        while let Some(message) = pending.next() {
            if let Err(reason) = self.write_message(&mut writer, message).await {
                // Still active in the outbox, so these land ahead of anything
                // reclaimed from the channel
                let mut outbox = self.shared.lock();
                for message in pending {
                    let _ = outbox.hold(message, &self.shared.bus);
                }
                return LinkEnd::Lost(reason);
            }
        }

        let cancel = self.cancel.clone();
        let mut housekeeping = self.housekeeping_interval();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    writer.close().await;
                    return LinkEnd::Closed;
                }
                frame = reader.read() => {
                    let handled = match frame {
                        Ok(frame) => {
                            self.session.touch();
                            self.handle_frame(frame, &mut writer).await
                        }
                        Err(e) => Err(disconnect_reason(e)),
                    };
                    if let Err(reason) = handled {
                        return LinkEnd::Lost(reason);
                    }
                }
                message = self.outbound.recv() => {
                    let Some(message) = message else {
                        // Replaced by a newer session task
                        writer.close().await;
                        return LinkEnd::Closed;
                    };
                    if let Err(reason) = self.write_message(&mut writer, message).await {
                        return LinkEnd::Lost(reason);
                    }
                }
                _ = next_tick(&mut housekeeping) => {
                    if let Err(reason) = self.keepalive(&mut writer).await {
                        return LinkEnd::Lost(reason);
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        writer: &mut TransportWriter,
    ) -> Result<(), DisconnectReason> {
        let message = match decode(&frame) {
            Ok(message) => message,
            Err(e) if e.is_fatal() => return Err(DisconnectReason::Corrupt(e.to_string())),
            Err(e) => {
                warn!("Skipping malformed message: {}", e);
                self.publish(Diagnostic::MalformedMessage {
                    error: e.to_string(),
                });
                return Ok(());
            }
        };

        match message {
            Message::Ping { timestamp } => {
                trace!("Ping received, sending pong");
                self.write_message(writer, Message::Pong { timestamp }).await
            }
            Message::Pong { timestamp } => {
                trace!("Pong received, round trip {}ms", elapsed_millis(timestamp));
                Ok(())
            }
            Message::Hello(_) | Message::HelloAck(_) => {
                debug!("Ignoring unexpected {} on an active session", message.kind_name());
                Ok(())
            }
            Message::StateDelta(mut delta) => {
                if let Some(gap) = self.session.accept_inbound(&mut delta) {
                    warn!(
                        "State delta sequence gap: expected {}, received {}",
                        gap.expected, gap.received
                    );
                    self.publish(Diagnostic::SequenceGap {
                        expected: gap.expected,
                        received: gap.received,
                    });
                }
                self.publish(Message::StateDelta(delta));
                Ok(())
            }
            message => {
                self.publish(message);
                Ok(())
            }
        }
    }

    /// Encode and write one message. A message that cannot be encoded is
    /// reported and skipped; only transport failures end the connection, and
    /// the application message being written when that happens is reported
    /// as undelivered.
    async fn write_message(
        &mut self,
        writer: &mut TransportWriter,
        mut message: Message,
    ) -> Result<(), DisconnectReason> {
        let is_delta = if let Message::StateDelta(delta) = &mut message {
            self.session.stamp_outbound(delta);
            true
        } else {
            false
        };

        let compress = self
            .session
            .capabilities()
            .is_some_and(|capabilities| capabilities.compression);
        let frame = match encode(&message, compress) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping outbound {} message: {}", message.kind_name(), e);
                self.publish(Diagnostic::Undelivered {
                    kind: message.kind_name().to_string(),
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        if let Err(e) = writer.write(frame).await {
            let reason = disconnect_reason(e);
            // Only application messages are reported
            if !message.is_protocol() {
                warn!("Outbound {} message lost: {}", message.kind_name(), reason);
                self.publish(Diagnostic::Undelivered {
                    kind: message.kind_name().to_string(),
                    reason: format!("write failed: {}", reason),
                });
            }
            return Err(reason);
        }
        if is_delta {
            self.session.commit_outbound();
        }
        Ok(())
    }

    /// Periodic liveness check: ping a quiet server, drop a silent one
    async fn keepalive(&mut self, writer: &mut TransportWriter) -> Result<(), DisconnectReason> {
        let idle = self.session.idle_for();

        let idle_timeout = self.config.idle_timeout;
        if !idle_timeout.is_zero() && idle >= idle_timeout {
            return Err(DisconnectReason::IdleTimeout);
        }

        let interval = self.config.keepalive_interval;
        if !interval.is_zero() && idle >= interval {
            trace!("No traffic for {:?}, sending ping", idle);
            self.write_message(
                writer,
                Message::Ping {
                    timestamp: current_time_millis(),
                },
            )
            .await?;
        }
        Ok(())
    }

    fn housekeeping_interval(&self) -> Option<Interval> {
        let period = [self.config.keepalive_interval, self.config.idle_timeout]
            .into_iter()
            .filter(|d| !d.is_zero())
            .min()?;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn disconnect_reason(err: TransportError) -> DisconnectReason {
    match err {
        TransportError::Corrupt(e) => DisconnectReason::Corrupt(e.to_string()),
        other => DisconnectReason::ConnectionLost(other.to_string()),
    }
}
