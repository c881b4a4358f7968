//! Optional payload compression used by sessions and the HTTP response path.
//!
//! The pipeline never emits output larger than its input: when the selected
//! codec would grow the payload (or fails), the original bytes are returned
//! unchanged. Decompression is strictly bounded.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

use crate::error::{ErrorCode, NetError, NetResult};

/// Largest original size accepted when decoding an LZ4 frame.
const MAX_LZ4_DECODED_SIZE: usize = 100 * 1024 * 1024;

/// Chunk size used while stream-decoding gzip/deflate input.
const INFLATE_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Gzip,
    Deflate,
}

impl CompressionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Deflate => "deflate",
        }
    }
}

/// Compress/decompress over byte slices with a size threshold.
///
/// Inputs below the threshold skip compression entirely. The threshold is
/// mutable at runtime; the algorithm is fixed per pipeline.
pub struct CompressionPipeline {
    algorithm: CompressionAlgorithm,
    threshold: AtomicUsize,
}

impl CompressionPipeline {
    pub fn new(algorithm: CompressionAlgorithm, threshold: usize) -> Self {
        Self {
            algorithm,
            threshold: AtomicUsize::new(threshold),
        }
    }

    /// A pipeline that passes payloads through untouched.
    pub fn passthrough() -> Self {
        Self::new(CompressionAlgorithm::None, 0)
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    pub fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    pub fn set_threshold(&self, bytes: usize) {
        self.threshold.store(bytes, Ordering::Relaxed);
    }

    pub fn compress(&self, input: &[u8]) -> NetResult<Vec<u8>> {
        if input.len() < self.threshold() || self.algorithm == CompressionAlgorithm::None {
            return Ok(input.to_vec());
        }

        let compressed = match self.algorithm {
            CompressionAlgorithm::None => unreachable!(),
            CompressionAlgorithm::Lz4 => Some(compress_lz4(input)),
            CompressionAlgorithm::Gzip => compress_gzip(input),
            CompressionAlgorithm::Deflate => compress_deflate(input),
        };

        match compressed {
            Some(out) if out.len() < input.len() => Ok(out),
            Some(_) => Ok(input.to_vec()),
            None => {
                log::warn!(
                    "{} compression failed, sending payload uncompressed",
                    self.algorithm.as_str()
                );
                Ok(input.to_vec())
            }
        }
    }

    pub fn decompress(&self, input: &[u8]) -> NetResult<Vec<u8>> {
        if input.is_empty() {
            return Err(NetError::new(
                ErrorCode::InvalidArgument,
                "input data is empty",
                "compression::decompress",
            ));
        }

        match self.algorithm {
            CompressionAlgorithm::None => Ok(input.to_vec()),
            CompressionAlgorithm::Lz4 => decompress_lz4(input),
            CompressionAlgorithm::Gzip => decompress_stream(GzDecoder::new(input)),
            CompressionAlgorithm::Deflate => decompress_stream(DeflateDecoder::new(input)),
        }
    }
}

/// LZ4 frames carry the original size as a 4-byte little-endian prefix so the
/// decoder can allocate exactly once.
fn compress_lz4(input: &[u8]) -> Vec<u8> {
    let block = lz4_flex::block::compress(input);
    let mut out = Vec::with_capacity(block.len() + 4);
    out.extend_from_slice(&(input.len() as u32).to_le_bytes());
    out.extend_from_slice(&block);
    out
}

fn decompress_lz4(input: &[u8]) -> NetResult<Vec<u8>> {
    if input.len() < 4 {
        return Err(NetError::new(
            ErrorCode::InvalidArgument,
            "compressed data too small",
            "compression::decompress",
        ));
    }

    let original_size = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
    if original_size > MAX_LZ4_DECODED_SIZE {
        return Err(NetError::new(
            ErrorCode::InvalidArgument,
            format!("decompressed size too large: {original_size}"),
            "compression::decompress",
        ));
    }

    let decoded = lz4_flex::block::decompress(&input[4..], original_size).map_err(|e| {
        NetError::new(
            ErrorCode::InternalError,
            format!("lz4 decompression failed: {e}"),
            "compression::decompress",
        )
    })?;

    if decoded.len() != original_size {
        return Err(NetError::new(
            ErrorCode::InternalError,
            "decompressed size mismatch",
            "compression::decompress",
        ));
    }

    Ok(decoded)
}

fn compress_gzip(input: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input).ok()?;
    encoder.finish().ok()
}

fn compress_deflate(input: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(input).ok()?;
    encoder.finish().ok()
}

fn decompress_stream(mut decoder: impl Read) -> NetResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; INFLATE_CHUNK_SIZE];
    loop {
        match decoder.read(&mut chunk) {
            Ok(0) => return Ok(out),
            Ok(n) => out.extend_from_slice(&chunk[..n]),
            Err(e) => {
                return Err(NetError::new(
                    ErrorCode::InternalError,
                    format!("decompression failed: {e}"),
                    "compression::decompress",
                ));
            }
        }
    }
}
