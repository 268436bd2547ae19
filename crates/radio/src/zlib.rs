//! Standard zlib compression for forwarder payloads.
//!
//! The peer decompresses with a stock zlib library, so output must be a
//! full zlib stream (`78 9C` header at the default level), never raw
//! deflate.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::RadioError;

pub fn compress(data: &[u8]) -> Result<Vec<u8>, RadioError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|_| RadioError::CompressionFailed)?;
    encoder.finish().map_err(|_| RadioError::CompressionFailed)
}

/// Inflate a zlib stream. Accepts any `78 xx` header; the output buffer
/// grows as needed. Callers treat failure as soft and fall back to raw
/// UTF-8.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, RadioError> {
    if data.first() != Some(&0x78) {
        return Err(RadioError::DecodeFailed);
    }
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 4);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| RadioError::DecodeFailed)?;
    Ok(out)
}
