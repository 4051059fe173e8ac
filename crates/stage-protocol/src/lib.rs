//! stage-protocol: Wire protocol for the stage collaboration connector
//!
//! This crate defines the framing, message model and payload encodings
//! exchanged between a connector and the central collaboration server.
//! Control messages travel as JSON text, state deltas as a compact binary
//! layout, and either may be DEFLATE-compressed inside its frame.

pub mod codec;
pub mod compression;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{decode, encode, FrameCodec};
pub use error::CodecError;
pub use frame::{Frame, FrameFlags, FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{Hello, HelloAck, Message, StateDelta, PROTOCOL_VERSION};
