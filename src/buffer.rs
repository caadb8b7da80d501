//! Lazily materialized, content-addressed binary payloads.
//!
//! An [`AsyncBuffer`] is identified by the XXH64 hash of its uncompressed content: two
//! buffers with the same hash are the same buffer and are stored once per file. Its data
//! lives in one of three places:
//!
//! ```text
//! ResidentUncompressed --extract()--> compressed cache (computed once)
//! ResidentCompressed   --load()-----> uncompressed cache (computed once)
//! OnDiskCompressed     --extract()--> compressed cache (read once) --load()--> uncompressed cache
//! ```
//!
//! Caches are write-once: they are filled under a lock the first time they are needed and
//! never change afterwards, so a buffer can be shared freely between threads.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use twox_hash::XxHash64;

use crate::compression::CompressionKind;
use crate::constants::COMPRESSION_PROFIT_PERCENT;
use crate::error::{GraphPackError, Result};
use crate::io::DataSource;

/// Hash used as the identity of buffer content.
pub fn content_hash(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// Where the authoritative copy of a buffer's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Uncompressed bytes are in memory.
    ResidentUncompressed,
    /// Compressed bytes are in memory.
    ResidentCompressed,
    /// Compressed bytes are in a file and are read on demand.
    OnDiskCompressed,
}

enum BufferOrigin {
    ResidentUncompressed(Arc<[u8]>),
    ResidentCompressed {
        data: Arc<[u8]>,
        kind: CompressionKind,
    },
    OnDiskCompressed {
        source: Arc<DataSource>,
        offset: u64,
        stored_size: u64,
        kind: CompressionKind,
    },
}

struct BufferInner {
    crc: u64,
    size: u64,
    origin: BufferOrigin,
    compressed: OnceCell<(Arc<[u8]>, CompressionKind)>,
    uncompressed: OnceCell<Arc<[u8]>>,
}

/// A shared handle to a large payload. Cloning is cheap.
#[derive(Clone)]
pub struct AsyncBuffer {
    inner: Arc<BufferInner>,
}

impl AsyncBuffer {
    /// Wraps uncompressed data.
    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data: Arc<[u8]> = Arc::from(data.into());
        Self::new(
            content_hash(&data),
            data.len() as u64,
            BufferOrigin::ResidentUncompressed(data),
        )
    }

    /// Wraps already compressed data.
    ///
    /// `size` and `crc` describe the uncompressed content; they are verified when the
    /// buffer is first loaded.
    pub fn from_compressed(data: impl Into<Vec<u8>>, kind: CompressionKind, size: u64, crc: u64) -> Self {
        Self::new(
            crc,
            size,
            BufferOrigin::ResidentCompressed {
                data: Arc::from(data.into()),
                kind,
            },
        )
    }

    pub(crate) fn on_disk(
        source: Arc<DataSource>,
        offset: u64,
        stored_size: u64,
        size: u64,
        kind: CompressionKind,
        crc: u64,
    ) -> Self {
        Self::new(
            crc,
            size,
            BufferOrigin::OnDiskCompressed {
                source,
                offset,
                stored_size,
                kind,
            },
        )
    }

    fn new(crc: u64, size: u64, origin: BufferOrigin) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                crc,
                size,
                origin,
                compressed: OnceCell::new(),
                uncompressed: OnceCell::new(),
            }),
        }
    }

    /// Uncompressed size in bytes.
    pub fn size(&self) -> u64 {
        self.inner.size
    }

    /// Content hash of the uncompressed data.
    pub fn content_crc(&self) -> u64 {
        self.inner.crc
    }

    /// Where the buffer's data originally lives.
    pub fn state(&self) -> BufferState {
        match self.inner.origin {
            BufferOrigin::ResidentUncompressed(_) => BufferState::ResidentUncompressed,
            BufferOrigin::ResidentCompressed { .. } => BufferState::ResidentCompressed,
            BufferOrigin::OnDiskCompressed { .. } => BufferState::OnDiskCompressed,
        }
    }

    /// Returns true if the data can be produced without touching a file.
    pub fn is_resident(&self) -> bool {
        match self.inner.origin {
            BufferOrigin::OnDiskCompressed { .. } => {
                self.inner.compressed.get().is_some() || self.inner.uncompressed.get().is_some()
            }
            _ => true,
        }
    }

    /// Returns the data in its storable form and the compression used.
    ///
    /// Uncompressed data is compressed on the first call, unless that would save less
    /// than 10% of the size, in which case the data is stored as-is.
    pub fn extract(&self) -> Result<(Arc<[u8]>, CompressionKind)> {
        let inner = &self.inner;
        match &inner.origin {
            BufferOrigin::ResidentUncompressed(data) => inner
                .compressed
                .get_or_try_init(|| compress_if_profitable(data))
                .cloned(),
            BufferOrigin::ResidentCompressed { data, kind } => Ok((data.clone(), *kind)),
            BufferOrigin::OnDiskCompressed {
                source,
                offset,
                stored_size,
                kind,
            } => inner
                .compressed
                .get_or_try_init(|| {
                    let bytes = source.slice(*offset, *stored_size)?;
                    Ok::<_, GraphPackError>((Arc::from(bytes), *kind))
                })
                .cloned(),
        }
    }

    /// Returns the uncompressed data, decompressing it on the first call.
    pub fn load(&self) -> Result<Arc<[u8]>> {
        if let BufferOrigin::ResidentUncompressed(data) = &self.inner.origin {
            return Ok(data.clone());
        }

        self.inner
            .uncompressed
            .get_or_try_init(|| {
                let (stored, kind) = self.extract()?;
                let size = usize::try_from(self.inner.size).map_err(|_| {
                    GraphPackError::Compression(format!("Buffer of {} bytes is too large", self.inner.size))
                })?;
                // Fail on an oversized claim instead of aborting inside the decompressor.
                Vec::<u8>::new().try_reserve_exact(size).map_err(|e| {
                    GraphPackError::Compression(format!("Cannot allocate {size} bytes for buffer: {e}"))
                })?;
                let data = kind.compressor()?.decompress(&stored, size)?;

                let crc = content_hash(&data);
                if crc != self.inner.crc {
                    return Err(GraphPackError::Integrity(format!(
                        "Buffer content hash {crc:016X} does not match recorded {:016X}",
                        self.inner.crc
                    )));
                }
                Ok(Arc::from(data.into_owned()))
            })
            .cloned()
    }

    /// Copies `dst.len()` bytes of uncompressed data starting at `offset`.
    pub fn load_into(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.load()?;
        let range = usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(dst.len())?))
            .and_then(|range| data.get(range))
            .ok_or_else(|| {
                GraphPackError::Format(format!(
                    "Range {offset}+{} is outside buffer of {} bytes",
                    dst.len(),
                    data.len()
                ))
            })?;
        dst.copy_from_slice(range);
        Ok(())
    }
}

fn compress_if_profitable(data: &[u8]) -> Result<(Arc<[u8]>, CompressionKind)> {
    let kind = CompressionKind::preferred();
    if data.is_empty() || kind == CompressionKind::None {
        return Ok((Arc::from(data), CompressionKind::None));
    }

    let compressed = kind.compressor()?.compress(data)?;
    let limit = data.len() as u64 * COMPRESSION_PROFIT_PERCENT / 100;
    if compressed.len() as u64 > limit {
        return Ok((Arc::from(data), CompressionKind::None));
    }
    Ok((Arc::from(&*compressed), kind))
}

impl PartialEq for AsyncBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.crc == other.inner.crc
    }
}

impl fmt::Debug for AsyncBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBuffer")
            .field("crc", &format_args!("{:016X}", self.inner.crc))
            .field("size", &self.inner.size)
            .field("state", &self.state())
            .finish()
    }
}

/// Supplies buffers that were extracted out-of-band when the file was saved.
pub trait BufferStore: Send + Sync {
    /// Finds a buffer by content hash.
    fn find_buffer(&self, crc: u64) -> Option<AsyncBuffer>;
}

/// A [`BufferStore`] holding buffers in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryBufferStore {
    buffers: HashMap<u64, AsyncBuffer>,
}

impl MemoryBufferStore {
    /// Creates a store from buffers, typically the ones returned by a save.
    pub fn new(buffers: impl IntoIterator<Item = AsyncBuffer>) -> Self {
        Self {
            buffers: buffers.into_iter().map(|b| (b.content_crc(), b)).collect(),
        }
    }
}

impl BufferStore for MemoryBufferStore {
    fn find_buffer(&self, crc: u64) -> Option<AsyncBuffer> {
        self.buffers.get(&crc).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_means_equal_identity() {
        let a = AsyncBuffer::from_bytes(vec![1, 2, 3]);
        let b = AsyncBuffer::from_bytes(vec![1, 2, 3]);
        assert_eq!(a, b);
        assert_ne!(a, AsyncBuffer::from_bytes(vec![3, 2, 1]));
    }

    #[cfg(all(feature = "lz4_flex", target_pointer_width = "64"))]
    #[test]
    fn oversized_claims_fail_without_allocating() {
        let buffer = AsyncBuffer::from_compressed(vec![0x10, 0x41], CompressionKind::Lz4, 1 << 62, 0);
        assert!(matches!(buffer.load(), Err(GraphPackError::Compression(_))));
    }

    #[test]
    fn incompressible_data_is_stored_raw() -> Result<()> {
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 32) as u8
            })
            .collect();
        let buffer = AsyncBuffer::from_bytes(data.clone());
        let (stored, kind) = buffer.extract()?;
        assert_eq!(kind, CompressionKind::None);
        assert_eq!(&*stored, &data[..]);
        Ok(())
    }

    #[cfg(feature = "lz4_flex")]
    #[test]
    fn compressed_buffer_loads_once_and_caches() -> Result<()> {
        let data = vec![42u8; 64 * 1024];
        let original = AsyncBuffer::from_bytes(data.clone());
        let (stored, kind) = original.extract()?;
        assert_eq!(kind, CompressionKind::Lz4);
        assert!(stored.len() < data.len());

        let copy = AsyncBuffer::from_compressed(stored.to_vec(), kind, original.size(), original.content_crc());
        assert_eq!(copy.state(), BufferState::ResidentCompressed);
        let first = copy.load()?;
        let second = copy.load()?;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(&*first, &data[..]);
        Ok(())
    }

    #[test]
    fn wrong_content_hash_is_detected() {
        let buffer = AsyncBuffer::from_compressed(vec![1, 2, 3], CompressionKind::None, 3, 0xDEAD);
        assert!(matches!(buffer.load(), Err(GraphPackError::Integrity(_))));
    }

    #[test]
    fn on_disk_buffer_reads_lazily() -> Result<()> {
        let mut file = vec![0u8; 16];
        file.extend_from_slice(b"payload");
        let source = Arc::new(DataSource::from_bytes(file));
        let buffer = AsyncBuffer::on_disk(source, 16, 7, 7, CompressionKind::None, content_hash(b"payload"));

        assert!(!buffer.is_resident());
        let mut dst = [0u8; 4];
        buffer.load_into(3, &mut dst)?;
        assert_eq!(&dst, b"load");
        assert!(buffer.is_resident());
        assert!(buffer.load_into(5, &mut dst).is_err());
        Ok(())
    }
}
