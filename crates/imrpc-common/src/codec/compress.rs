use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::protocol::error::{ImrpcError, Result};

/// A payload compression plugin.
///
/// `code()` is the byte carried in the frame preamble. Code 0 is reserved for
/// [`Identity`], which every registry carries.
pub trait Compressor: Send + Sync + 'static {
    fn code(&self) -> u8;

    fn name(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor, code 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Compressor for Identity {
    fn code(&self) -> u8 {
        0
    }

    fn name(&self) -> &'static str {
        "none"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Gzip compressor, code 1.
#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: Compression,
}

impl Gzip {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Uses the given level, 0 (store) through 9 (best).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Gzip {
    fn code(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(data)
            .map_err(|e| ImrpcError::Compression(format!("gzip write failed: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| ImrpcError::Compression(format!("gzip finish failed: {}", e)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ImrpcError::Compression(format!("gzip read failed: {}", e)))?;
        Ok(out)
    }
}
