//! Low-level I/O: the save-side output cursor and the load-side data source.
//!
//! The save operation owns its output exclusively; [`SeqWriter`] tracks the write cursor
//! and supports patching an already written region (the file header). Loads read through
//! a [`DataSource`], which is either an in-memory buffer or a memory-mapped file, and is
//! shared (`Arc`) with async buffers that re-read their payload on demand.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{GraphPackError, Result};

/// A writer that appends data and tracks the current offset.
#[derive(Debug)]
pub struct SeqWriter<W: Write + Seek> {
    writer: W,
    base_offset: u64,
    current_offset: u64,
}

impl<W: Write + Seek> SeqWriter<W> {
    /// Wraps a writer. Its current position becomes the base offset of the file.
    pub fn new(mut writer: W) -> Result<Self> {
        let base_offset = writer.stream_position()?;
        Ok(Self {
            writer,
            base_offset,
            current_offset: base_offset,
        })
    }

    /// Writes a complete buffer. Returns the absolute offset where writing started.
    pub fn write_all(&mut self, buffer: &[u8]) -> Result<u64> {
        let start_offset = self.current_offset;
        self.writer.write_all(buffer)?;
        self.current_offset += buffer.len() as u64;
        Ok(start_offset)
    }

    /// Overwrites previously written bytes at `offset`, then returns to the end.
    pub fn patch_at(&mut self, offset: u64, buffer: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(buffer.len() as u64)
            .ok_or_else(|| GraphPackError::Internal("Patch range overflows".into()))?;
        if offset < self.base_offset || end > self.current_offset {
            return Err(GraphPackError::Internal(format!(
                "Patch range {offset}..{end} is outside the written region"
            )));
        }

        self.writer.seek(SeekFrom::Start(offset))?;
        self.writer.write_all(buffer)?;
        self.writer.seek(SeekFrom::Start(self.current_offset))?;
        Ok(())
    }

    /// Offset where this file starts inside the underlying writer.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Absolute cursor position.
    pub fn current_offset(&self) -> u64 {
        self.current_offset
    }

    /// Cursor position relative to the base offset.
    pub fn relative_offset(&self) -> u64 {
        self.current_offset - self.base_offset
    }

    /// Flushes the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Where a file is read from.
#[derive(Debug)]
pub enum DataSource {
    /// An owned in-memory buffer.
    Memory(Vec<u8>),
    /// A memory-mapped file.
    Mapped(Mmap),
}

impl DataSource {
    /// Wraps an in-memory buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::Memory(bytes)
    }

    /// Memory-maps a file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(Self::Memory(Vec::new()));
        }

        // Safety: the mapping is read-only; concurrent modification of the file by
        // another process is outside what the loader can guard against.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self::Mapped(mmap))
    }

    fn bytes(&self) -> &[u8] {
        match self {
            Self::Memory(v) => v,
            Self::Mapped(m) => m,
        }
    }

    /// Total size in bytes.
    pub fn len(&self) -> u64 {
        self.bytes().len() as u64
    }

    /// Returns true if the source holds no data.
    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    /// Copies up to `dst.len()` bytes starting at `offset`. Returns the number of bytes
    /// copied, which is short when the source ends first.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> usize {
        let bytes = self.bytes();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let Some(available) = bytes.get(start..) else {
            return 0;
        };
        let n = available.len().min(dst.len());
        dst[..n].copy_from_slice(&available[..n]);
        n
    }

    /// Borrows `len` bytes at `offset`.
    ///
    /// # Errors
    /// Returns `GraphPackError::Format` if the range is not inside the source.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let out_of_bounds =
            || GraphPackError::Format(format!("Range {offset}+{len} is outside the data source"));
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let len = usize::try_from(len).map_err(|_| out_of_bounds())?;
        let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
        self.bytes().get(start..end).ok_or_else(out_of_bounds)
    }
}
