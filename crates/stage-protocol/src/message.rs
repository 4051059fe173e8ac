//! Message types for the stage protocol
//!
//! This module defines the messages exchanged between the connector and the
//! collaboration server. Messages are turned into frames by the functions in
//! `codec.rs`.
//!
//! # Encodings
//!
//! Control traffic is JSON, internally tagged by a `"type"` string. The types
//! `hello`, `hello-ack`, `ping` and `pong` are reserved by the protocol; any
//! other type is an application signaling message and decodes to
//! [`Message::Control`].
//!
//! State deltas are binary: a one byte kind tag followed by a bincode body.
//! Binary kinds this peer does not know decode to [`Message::Unrecognized`] so
//! newer servers can introduce kinds without breaking older connectors.
//!
//! # Message Flow
//!
//! 1. Connector sends `hello` with its protocol version and capabilities
//! 2. Server responds with `hello-ack` (accepted or rejected with a reason)
//! 3. Either side may send `ping`; the peer echoes the timestamp in `pong`
//! 4. Application traffic: `Control` and `StateDelta` flow bidirectionally

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version, sent in `hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// JSON `type` strings reserved for protocol messages
pub(crate) const RESERVED_TYPES: [&str; 4] = ["hello", "hello-ack", "ping", "pong"];

/// Binary kind tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BinaryKind {
    /// Sequenced state delta
    StateDelta = 0x01,
}

impl BinaryKind {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::StateDelta),
            _ => None,
        }
    }
}

/// Capability announcement sent by the connector right after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Protocol version spoken by the connector
    pub protocol_version: u32,
    /// Whether the connector can send and receive compressed frames
    pub supports_compression: bool,
    /// Bearer token identifying the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Free-form description of the local device (uuid, type, audio
    /// capabilities, ...). An explicit `null` is kept apart from an absent
    /// field.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub device: Option<Value>,
}

/// Deserialize a field that is present, `null` included, as `Some`
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Hello {
    /// Hello for the current protocol version
    pub fn new(supports_compression: bool) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            supports_compression,
            token: None,
            device: None,
        }
    }
}

/// Server answer to [`Hello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloAck {
    /// Whether the session was accepted
    pub accepted: bool,
    /// Reason if not accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Whether the server agrees to compressed traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<bool>,
    /// Protocol version chosen by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
}

impl HelloAck {
    /// Accepting acknowledgment without capability details
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
            compression: None,
            protocol_version: None,
        }
    }

    /// Rejecting acknowledgment
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            compression: None,
            protocol_version: None,
        }
    }
}

/// A sequenced change to shared stage state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDelta {
    /// Per-connection sequence number, starting at 0 after every (re)connect
    pub sequence: u64,
    /// The receiver must treat this delta as the complete state
    pub baseline: bool,
    /// Entity the delta applies to (stage, device, track, ...)
    pub entity: String,
    /// Opaque delta body
    pub data: Bytes,
}

impl StateDelta {
    /// Create an outbound delta; the sequence is assigned when it is sent
    pub fn new(entity: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            sequence: 0,
            baseline: false,
            entity: entity.into(),
            data: data.into(),
        }
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Capability negotiation request
    Hello(Hello),

    /// Capability negotiation response
    HelloAck(HelloAck),

    /// Keepalive probe
    Ping {
        /// Sender clock in milliseconds, echoed in the pong
        timestamp: u64,
    },

    /// Keepalive answer
    Pong {
        /// Echo of the ping timestamp
        timestamp: u64,
    },

    /// Application signaling message
    Control {
        /// Message type string
        kind: String,
        /// JSON payload (`Null` when absent)
        payload: Value,
    },

    /// Binary state delta
    StateDelta(StateDelta),

    /// Binary message of a kind this peer does not understand
    Unrecognized {
        /// Raw kind tag
        kind: u8,
        /// Body following the kind tag
        payload: Bytes,
    },
}

impl Message {
    /// Create an application signaling message
    pub fn control(kind: impl Into<String>, payload: Value) -> Self {
        Message::Control {
            kind: kind.into(),
            payload,
        }
    }

    /// Short name of the message kind, for logs
    pub fn kind_name(&self) -> &str {
        match self {
            Message::Hello(_) => "hello",
            Message::HelloAck(_) => "hello-ack",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Control { kind, .. } => kind,
            Message::StateDelta(_) => "state-delta",
            Message::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Whether the message travels in a binary frame
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::StateDelta(_) | Message::Unrecognized { .. })
    }

    /// Whether the message belongs to the protocol itself rather than the
    /// application (handshake and keepalive)
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Message::Hello(_) | Message::HelloAck(_) | Message::Ping { .. } | Message::Pong { .. }
        )
    }
}

impl From<StateDelta> for Message {
    fn from(delta: StateDelta) -> Self {
        Message::StateDelta(delta)
    }
}
