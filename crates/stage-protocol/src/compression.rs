//! Raw DEFLATE payload compression

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::CodecError;

/// Compress a serialized payload.
///
/// Uses the fastest level: payloads are produced at state-update rate and the
/// link is usually not the bottleneck.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a payload, refusing to inflate beyond `limit` bytes.
///
/// Any failure means the frame cannot be trusted and is reported as corrupt.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    DeflateDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::corrupt(format!("decompression failed: {e}")))?;

    if out.len() > limit {
        return Err(CodecError::corrupt(format!(
            "decompressed payload exceeds {limit} bytes"
        )));
    }

    Ok(out)
}
