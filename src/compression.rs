//! Pluggable compression backend for async buffers.
//!
//! Each algorithm is identified by a [`CompressionKind`], which is the value stored in the
//! buffer table. Compression is a leaf concern: the buffer code only asks for
//! "compress these bytes" / "decompress into N bytes".

use std::borrow::Cow;

use serde::Serialize;

use crate::error::{GraphPackError, Result};

/// Interface for compression algorithms.
pub trait Compressor: Send + Sync + std::fmt::Debug {
    /// The kind stored in the buffer table for data produced by this compressor.
    fn kind(&self) -> CompressionKind;

    /// Compresses the data.
    ///
    /// May borrow the input when no transformation is performed.
    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>>;

    /// Decompresses the data into exactly `uncompressed_size` bytes.
    fn decompress<'a>(&self, data: &'a [u8], uncompressed_size: usize) -> Result<Cow<'a, [u8]>>;
}

/// Compression algorithm of a stored buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CompressionKind {
    /// Stored as-is.
    None,
    /// LZ4 block format, without size prefix.
    Lz4,
}

impl CompressionKind {
    /// Value stored in the buffer table.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
        }
    }

    /// Decodes a buffer table value.
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            other => Err(GraphPackError::Compression(format!(
                "Compression kind {other} is not known"
            ))),
        }
    }

    /// Returns the implementation for this kind.
    ///
    /// # Errors
    /// Returns `GraphPackError::Compression` if the algorithm was compiled out.
    pub fn compressor(self) -> Result<&'static dyn Compressor> {
        match self {
            Self::None => Ok(&NoCompression),
            #[cfg(feature = "lz4_flex")]
            Self::Lz4 => Ok(&Lz4Compressor),
            #[cfg(not(feature = "lz4_flex"))]
            Self::Lz4 => Err(GraphPackError::Compression(
                "LZ4 support is not compiled in (feature `lz4_flex`)".into(),
            )),
        }
    }

    /// The compressor used when saving buffers.
    pub fn preferred() -> Self {
        if cfg!(feature = "lz4_flex") {
            Self::Lz4
        } else {
            Self::None
        }
    }
}

// --- No Compression (Pass-through) ---

/// A compressor that performs no compression.
#[derive(Debug, Clone, Copy)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn kind(&self) -> CompressionKind {
        CompressionKind::None
    }

    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Borrowed(data))
    }

    fn decompress<'a>(&self, data: &'a [u8], uncompressed_size: usize) -> Result<Cow<'a, [u8]>> {
        if data.len() != uncompressed_size {
            return Err(GraphPackError::Compression(format!(
                "Stored size {} does not match expected size {}",
                data.len(),
                uncompressed_size
            )));
        }
        Ok(Cow::Borrowed(data))
    }
}

// --- LZ4 Implementation ---

#[cfg(feature = "lz4_flex")]
/// A compressor using the LZ4 block format.
#[derive(Debug, Clone, Copy)]
pub struct Lz4Compressor;

#[cfg(feature = "lz4_flex")]
impl Compressor for Lz4Compressor {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lz4
    }

    fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        Ok(Cow::Owned(lz4_flex::block::compress(data)))
    }

    fn decompress<'a>(&self, data: &'a [u8], uncompressed_size: usize) -> Result<Cow<'a, [u8]>> {
        let out = lz4_flex::block::decompress(data, uncompressed_size)
            .map_err(|e| GraphPackError::Compression(e.to_string()))?;
        if out.len() != uncompressed_size {
            return Err(GraphPackError::Compression(format!(
                "Decompressed {} bytes, expected {}",
                out.len(),
                uncompressed_size
            )));
        }
        Ok(Cow::Owned(out))
    }
}
