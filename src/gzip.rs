//! One-shot gzip codec over a fixed-size scratch buffer.

use std::io::Read;

use flate2::read::{GzDecoder, GzEncoder};
use flate2::Compression;

/// Scratch output chunk; both directions drain the stream through it.
const CHUNK: usize = 16 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("corrupt gzip stream: {0}")]
    Decode(#[source] std::io::Error),
}

/// Gzip-wrap `input` at `level` (flate2 default when unset). The input is
/// in memory and trusted, so compression cannot hit a data error.
pub fn compress(input: &[u8], level: Option<u32>) -> Vec<u8> {
    let level = level.map(Compression::new).unwrap_or_default();
    let mut encoder = GzEncoder::new(input, level);
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    let mut chunk = [0u8; CHUNK];
    loop {
        match encoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            // A slice source cannot fail mid-stream.
            Err(_) => break,
        }
    }
    out
}

/// Inflate a complete gzip stream. Data, dictionary, and memory errors all
/// surface as `Decode`.
pub fn decompress(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(input);
    let mut out = Vec::with_capacity(input.len().saturating_mul(3));
    let mut chunk = [0u8; CHUNK];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(err) => return Err(CodecError::Decode(err)),
        }
    }
    Ok(out)
}
