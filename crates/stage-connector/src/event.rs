//! Events delivered to subscribers

use std::fmt;

use stage_core::{Capabilities, ConnectionState, Endpoint};
use stage_protocol::Message;

use crate::bus::SubscriptionId;
use crate::error::ErrorKind;

/// What a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Application signaling messages
    Control,
    /// Sequenced state deltas
    StateDelta,
    /// Binary messages of unknown kind
    Unrecognized,
    /// Connection lifecycle
    Lifecycle,
    /// Non-fatal problems (dropped messages, failing subscribers, ...)
    Diagnostic,
}

impl EventCategory {
    /// Every category
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Control,
        EventCategory::StateDelta,
        EventCategory::Unrecognized,
        EventCategory::Lifecycle,
        EventCategory::Diagnostic,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventCategory::Control => write!(f, "control"),
            EventCategory::StateDelta => write!(f, "state-delta"),
            EventCategory::Unrecognized => write!(f, "unrecognized"),
            EventCategory::Lifecycle => write!(f, "lifecycle"),
            EventCategory::Diagnostic => write!(f, "diagnostic"),
        }
    }
}

/// Anything published on the event bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A message received from the server
    Message(Message),
    /// Connection lifecycle change
    Lifecycle(LifecycleEvent),
    /// Something went wrong without ending the session
    Diagnostic(Diagnostic),
}

impl Event {
    /// Category used to route the event to subscribers
    pub fn category(&self) -> EventCategory {
        match self {
            Event::Message(Message::StateDelta(_)) => EventCategory::StateDelta,
            Event::Message(Message::Unrecognized { .. }) => EventCategory::Unrecognized,
            Event::Message(_) => EventCategory::Control,
            Event::Lifecycle(_) => EventCategory::Lifecycle,
            Event::Diagnostic(_) => EventCategory::Diagnostic,
        }
    }
}

impl From<Message> for Event {
    fn from(message: Message) -> Self {
        Event::Message(message)
    }
}

impl From<LifecycleEvent> for Event {
    fn from(event: LifecycleEvent) -> Self {
        Event::Lifecycle(event)
    }
}

impl From<Diagnostic> for Event {
    fn from(diagnostic: Diagnostic) -> Self {
        Event::Diagnostic(diagnostic)
    }
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// Every state change, in order
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The session became active
    Connected {
        endpoint: Endpoint,
        capabilities: Capabilities,
        /// Whether this follows an earlier active connection
        reconnected: bool,
    },
    /// An active connection ended
    Disconnected { reason: DisconnectReason },
    /// A connection attempt failed; `attempt` 0 is the initial connection
    ReconnectFailed { attempt: u32, error: String },
    /// No further attempts will be made
    Failed { reason: String },
}

/// Why an active connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close` was called
    ClosedByCaller,
    /// The server closed or reset the connection, or an I/O error occurred
    ConnectionLost(String),
    /// The byte stream could not be framed or decoded
    Corrupt(String),
    /// Nothing was received for longer than the idle timeout
    IdleTimeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClosedByCaller => write!(f, "closed by caller"),
            DisconnectReason::ConnectionLost(e) => write!(f, "connection lost: {}", e),
            DisconnectReason::Corrupt(e) => write!(f, "corrupt stream: {}", e),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// Non-fatal conditions reported to diagnostic subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The send buffer was full and its oldest message was discarded
    BackpressureDropped {
        /// Kind of the discarded message
        kind: String,
        /// Buffer capacity
        capacity: usize,
    },
    /// A queued message could not be delivered and was discarded
    Undelivered { kind: String, reason: String },
    /// A subscriber callback returned an error or panicked
    SubscriberFailed {
        subscription: SubscriptionId,
        category: EventCategory,
        error: String,
    },
    /// A subscriber fell behind and missed events
    SubscriberLagged {
        subscription: SubscriptionId,
        skipped: u64,
    },
    /// An inbound delta did not follow its predecessor
    SequenceGap { expected: u64, received: u64 },
    /// An inbound frame was well-formed but its content was not; it was
    /// skipped
    MalformedMessage { error: String },
}

impl Diagnostic {
    /// Error kind for conditions that correspond to one
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Diagnostic::BackpressureDropped { .. } => Some(ErrorKind::BackpressureDropped),
            Diagnostic::MalformedMessage { .. } => Some(ErrorKind::Codec),
            _ => None,
        }
    }
}
