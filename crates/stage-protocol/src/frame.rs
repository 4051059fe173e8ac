//! Frame header encoding/decoding
//!
//! The frame format uses a 5-byte header:
//! - payload_length: 4 bytes (u32, big-endian), size of the payload as stored
//!   on the wire (after compression, if any)
//! - flags: 1 byte
//!   - bit 0: payload is DEFLATE-compressed
//!   - bit 1: payload is binary (clear means JSON text)
//!   - bits 2-7: reserved, must be zero

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (16 MiB), applied both on the wire and after
/// decompression
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Flag byte describing how a payload must be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is DEFLATE-compressed
    pub const COMPRESSED: u8 = 0b0000_0001;
    /// Payload is binary rather than JSON
    pub const BINARY: u8 = 0b0000_0010;

    const RESERVED: u8 = !(Self::COMPRESSED | Self::BINARY);

    /// Build flags from their two meaningful bits
    pub fn new(compressed: bool, binary: bool) -> Self {
        let mut bits = 0;
        if compressed {
            bits |= Self::COMPRESSED;
        }
        if binary {
            bits |= Self::BINARY;
        }
        Self(bits)
    }

    /// Parse a raw flag byte, rejecting reserved bits
    pub fn from_bits(bits: u8) -> Result<Self, CodecError> {
        if bits & Self::RESERVED != 0 {
            return Err(CodecError::corrupt(format!(
                "reserved flag bits set: {bits:#010b}"
            )));
        }
        Ok(Self(bits))
    }

    /// Raw flag byte
    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn is_binary(self) -> bool {
        self.0 & Self::BINARY != 0
    }
}

/// Frame header containing length and encoding information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the payload in bytes
    pub payload_length: u32,
    /// How the payload is encoded
    pub flags: FrameFlags,
}

impl FrameHeader {
    /// Create a new frame header
    pub fn new(payload_length: u32, flags: FrameFlags) -> Self {
        Self {
            payload_length,
            flags,
        }
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u32(self.payload_length);
        dst.put_u8(self.flags.bits());
    }

    /// Decode a header from a byte buffer
    ///
    /// Returns None if there aren't enough bytes in the buffer.
    /// Returns Err if the flag byte has reserved bits set.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Self>, CodecError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Validate the flags before consuming anything
        let flags = FrameFlags::from_bits(src[4])?;

        let payload_length = src.get_u32();
        let _ = src.get_u8();

        Ok(Some(Self {
            payload_length,
            flags,
        }))
    }
}

/// One wire-level unit: flags plus the payload exactly as transmitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Encoding flags
    pub flags: FrameFlags,
    /// Payload bytes (compressed if the flags say so)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(flags: FrameFlags, payload: Bytes) -> Self {
        Self { flags, payload }
    }

    /// Header describing this frame
    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(self.payload.len() as u32, self.flags)
    }

    /// Append the encoded frame to a buffer
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        let size = self.payload.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        self.header().encode(dst);
        dst.extend_from_slice(&self.payload);
        Ok(())
    }

    /// Encode the frame into a standalone buffer
    pub fn to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Parse exactly one frame from a complete buffer.
    ///
    /// Unlike the streaming [`crate::FrameCodec`], the buffer must contain the
    /// header and precisely `payload_length` bytes; anything else is corrupt.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::corrupt(format!(
                "frame of {} bytes is shorter than its header",
                bytes.len()
            )));
        }

        let declared = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let flags = FrameFlags::from_bits(bytes[4])?;
        let actual = bytes.len() - HEADER_SIZE;

        if declared != actual {
            return Err(CodecError::corrupt(format!(
                "declared payload length {declared} but {actual} bytes present"
            )));
        }
        if declared > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge {
                size: declared,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            flags,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }
}
