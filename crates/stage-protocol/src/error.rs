//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing, encoding or decoding messages
#[derive(Error, Debug)]
pub enum CodecError {
    /// Frame integrity can no longer be trusted (length mismatch, reserved
    /// flag bits, failed decompression)
    #[error("Corrupt frame: {0}")]
    Corrupt(String),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// The payload is well framed but does not have the shape its kind requires
    #[error("Schema mismatch: {0}")]
    Schema(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    Binary(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt(reason.into())
    }

    pub(crate) fn schema(reason: impl Into<String>) -> Self {
        Self::Schema(reason.into())
    }

    /// Whether the error breaks stream framing, making the connection unusable.
    ///
    /// Schema mismatches only affect a single frame and can be skipped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::Schema(_))
    }
}
