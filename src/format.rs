//! Defines the physical binary layout of GraphPack files.
//!
//! # Layout
//! All offsets are relative to the base offset of the file and all integers are
//! little-endian.
//!
//! ```text
//! [Header (152 B)] [Chunk tables...] | [Object data...] | [Buffer data...]
//!                                    ^ headers_end      ^ objects_end      ^ buffers_end
//! ```
//!
//! The header holds seven chunk records (offset, size, count, CRC32), one per table, in
//! [`ChunkKind`] order. Names and types have an empty sentinel at index 0; the other
//! tables are dense and are referenced 1-based, with 0 meaning null.
//!
//! Nothing in a table is trusted before [`FileTables::parse`] has checked it.

use uuid::Uuid;

use crate::error::{GraphPackError, Result};

/// Magic number identifying the file format: "GRPK".
pub const MAGIC: u32 = u32::from_le_bytes(*b"GRPK");

/// Oldest version this build can read.
pub const MIN_VERSION: u32 = 1;

/// Version written by this build, also the newest it can read.
pub const CURRENT_VERSION: u32 = 1;

/// Size of the fixed part of the header.
const HEADER_FIXED_SIZE: usize = 40;

/// Offset of the header CRC field.
const HEADER_CRC_OFFSET: usize = 36;

/// Number of chunk records.
pub const CHUNK_COUNT: usize = 7;

/// Total size of the header, chunk records included.
pub const HEADER_SIZE: usize = HEADER_FIXED_SIZE + CHUNK_COUNT * ChunkRecord::SIZE;

/// Header flag: opcode tags and per-object CRCs are present.
pub const FLAG_PROTECTED: u32 = 1 << 0;

/// Header flag: buffers were returned to the caller instead of being stored in the file.
pub const FLAG_BUFFERS_EXTRACTED: u32 = 1 << 1;

/// Import flag: load the resource together with the file.
pub const IMPORT_LOAD_EAGERLY: u32 = 1 << 0;

/// The seven tables, in header order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Nul-terminated UTF-8 strings.
    Strings = 0,
    /// [`NameEntry`] table.
    Names = 1,
    /// [`TypeEntry`] table.
    Types = 2,
    /// [`PropertyEntry`] table.
    Properties = 3,
    /// [`ImportEntry`] table.
    Imports = 4,
    /// [`ExportEntry`] table.
    Exports = 5,
    /// [`BufferEntry`] table.
    Buffers = 6,
}

impl ChunkKind {
    /// All chunks in header order.
    pub const ALL: [Self; CHUNK_COUNT] = [
        Self::Strings,
        Self::Names,
        Self::Types,
        Self::Properties,
        Self::Imports,
        Self::Exports,
        Self::Buffers,
    ];

    /// Bytes per entry; strings count bytes.
    pub fn entry_size(self) -> usize {
        match self {
            Self::Strings => 1,
            Self::Names => NameEntry::SIZE,
            Self::Types => TypeEntry::SIZE,
            Self::Properties => PropertyEntry::SIZE,
            Self::Imports => ImportEntry::SIZE,
            Self::Exports => ExportEntry::SIZE,
            Self::Buffers => BufferEntry::SIZE,
        }
    }
}

/// Location and checksum of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Offset of the table.
    pub offset: u32,
    /// Size of the table in bytes.
    pub size: u32,
    /// Number of entries.
    pub count: u32,
    /// CRC32 of the table bytes.
    pub crc: u32,
}

impl ChunkRecord {
    /// The size in bytes of a serialized record.
    pub const SIZE: usize = 16;

    /// Serializes to a fixed-size byte array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.offset.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.count.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    /// Deserializes from at least [`ChunkRecord::SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, Self::SIZE, "ChunkRecord")?;
        Ok(Self {
            offset: u32_at(bytes, 0),
            size: u32_at(bytes, 4),
            count: u32_at(bytes, 8),
            crc: u32_at(bytes, 12),
        })
    }

    fn end(&self) -> u64 {
        u64::from(self.offset) + u64::from(self.size)
    }
}

/// The file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Always [`MAGIC`].
    pub magic: u32,
    /// Format version.
    pub version: u32,
    /// `FLAG_*` bits.
    pub flags: u32,
    /// End of the table region, start of the object region.
    pub headers_end: u64,
    /// End of the object region, start of the buffer region.
    pub objects_end: u64,
    /// End of the buffer region and of the file.
    pub buffers_end: u64,
    /// CRC32 of the header with this field zeroed.
    pub crc: u32,
    /// Table locations, indexed by [`ChunkKind`].
    pub chunks: [ChunkRecord; CHUNK_COUNT],
}

impl Header {
    /// A header for the current version with every offset still zero.
    pub fn new(flags: u32) -> Self {
        Self {
            magic: MAGIC,
            version: CURRENT_VERSION,
            flags,
            headers_end: 0,
            objects_end: 0,
            buffers_end: 0,
            crc: 0,
            chunks: [ChunkRecord::default(); CHUNK_COUNT],
        }
    }

    /// Record of one table.
    pub fn chunk(&self, kind: ChunkKind) -> &ChunkRecord {
        &self.chunks[kind as usize]
    }

    /// Returns true if the file uses the protected encoding.
    pub fn is_protected(&self) -> bool {
        self.flags & FLAG_PROTECTED != 0
    }

    /// Returns true if buffers were extracted when the file was saved.
    pub fn buffers_extracted(&self) -> bool {
        self.flags & FLAG_BUFFERS_EXTRACTED != 0
    }

    /// Serializes the header, computing its CRC.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.headers_end.to_le_bytes());
        buf[20..28].copy_from_slice(&self.objects_end.to_le_bytes());
        buf[28..36].copy_from_slice(&self.buffers_end.to_le_bytes());
        for (i, chunk) in self.chunks.iter().enumerate() {
            let at = HEADER_FIXED_SIZE + i * ChunkRecord::SIZE;
            buf[at..at + ChunkRecord::SIZE].copy_from_slice(&chunk.to_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf[HEADER_CRC_OFFSET..HEADER_FIXED_SIZE].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Deserializes the header without validating it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_len(bytes, HEADER_SIZE, "Header")?;
        let mut chunks = [ChunkRecord::default(); CHUNK_COUNT];
        for (i, chunk) in chunks.iter_mut().enumerate() {
            *chunk = ChunkRecord::from_bytes(&bytes[HEADER_FIXED_SIZE + i * ChunkRecord::SIZE..])?;
        }
        Ok(Self {
            magic: u32_at(bytes, 0),
            version: u32_at(bytes, 4),
            flags: u32_at(bytes, 8),
            headers_end: u64_at(bytes, 12),
            objects_end: u64_at(bytes, 20),
            buffers_end: u64_at(bytes, 28),
            crc: u32_at(bytes, HEADER_CRC_OFFSET),
            chunks,
        })
    }

    /// CRC32 of serialized header bytes, with the CRC field taken as zero.
    pub fn compute_crc(bytes: &[u8]) -> Result<u32> {
        check_len(bytes, HEADER_SIZE, "Header")?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..HEADER_CRC_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&bytes[HEADER_FIXED_SIZE..HEADER_SIZE]);
        Ok(hasher.finalize())
    }
}

/// Names table entry: offset of the text in the strings table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameEntry {
    /// Offset into the strings chunk.
    pub string_offset: u32,
}

/// Types table entry: index of the type name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TypeEntry {
    /// Index into the names table.
    pub name: u32,
}

/// Properties table entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropertyEntry {
    /// Index of the owning class in the types table.
    pub class_type: u32,
    /// Index of the property name in the names table.
    pub name: u32,
}

/// Imports table entry: an external resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportEntry {
    /// Resource id.
    pub id: Uuid,
    /// Index of the resource class in the types table.
    pub class_type: u32,
    /// `IMPORT_*` bits.
    pub flags: u32,
}

impl ImportEntry {
    /// Returns true if the resource must be loaded together with the file.
    pub fn load_eagerly(&self) -> bool {
        self.flags & IMPORT_LOAD_EAGERLY != 0
    }
}

/// Exports table entry: one saved object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportEntry {
    /// Index of the object class in the types table.
    pub class_type: u32,
    /// 1-based export index of the parent, or 0.
    pub parent: u32,
    /// Offset of the object data.
    pub offset: u64,
    /// Size of the object data.
    pub size: u32,
    /// CRC32 of the object data.
    pub crc: u32,
}

/// Buffers table entry: one async buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferEntry {
    /// Content hash of the uncompressed data.
    pub hash: u64,
    /// Offset of the stored data; 0 when extracted.
    pub offset: u64,
    /// Stored (possibly compressed) size; 0 when extracted.
    pub stored_size: u64,
    /// Uncompressed size.
    pub size: u64,
    /// Compression kind of the stored data.
    pub compression: u32,
}

/// Fixed-size table entries.
pub trait TableEntry: Sized {
    /// The size in bytes of a serialized entry.
    const SIZE: usize;

    /// Appends the serialized entry.
    fn write_to(&self, out: &mut Vec<u8>);

    /// Deserializes from exactly [`TableEntry::SIZE`] bytes.
    fn read_from(bytes: &[u8]) -> Self;
}

impl TableEntry for NameEntry {
    const SIZE: usize = 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.string_offset.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            string_offset: u32_at(bytes, 0),
        }
    }
}

impl TableEntry for TypeEntry {
    const SIZE: usize = 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.name.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            name: u32_at(bytes, 0),
        }
    }
}

impl TableEntry for PropertyEntry {
    const SIZE: usize = 8;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.class_type.to_le_bytes());
        out.extend_from_slice(&self.name.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            class_type: u32_at(bytes, 0),
            name: u32_at(bytes, 4),
        }
    }
}

impl TableEntry for ImportEntry {
    const SIZE: usize = 24;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.id.as_bytes());
        out.extend_from_slice(&self.class_type.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        let id = bytes
            .get(0..16)
            .and_then(|b| Uuid::from_slice(b).ok())
            .unwrap_or_default();
        Self {
            id,
            class_type: u32_at(bytes, 16),
            flags: u32_at(bytes, 20),
        }
    }
}

impl TableEntry for ExportEntry {
    const SIZE: usize = 24;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.class_type.to_le_bytes());
        out.extend_from_slice(&self.parent.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.crc.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            class_type: u32_at(bytes, 0),
            parent: u32_at(bytes, 4),
            offset: u64_at(bytes, 8),
            size: u32_at(bytes, 16),
            crc: u32_at(bytes, 20),
        }
    }
}

impl TableEntry for BufferEntry {
    const SIZE: usize = 40;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.hash.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
        out.extend_from_slice(&self.stored_size.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
        out.extend_from_slice(&self.compression.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            hash: u64_at(bytes, 0),
            offset: u64_at(bytes, 8),
            stored_size: u64_at(bytes, 16),
            size: u64_at(bytes, 24),
            compression: u32_at(bytes, 32),
        }
    }
}

/// Validation stages of [`FileTables::parse`], in order. The first failing stage aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Magic, version and minimum length.
    HeaderRead,
    /// Whole-header CRC.
    HeaderCrc,
    /// Every chunk lies inside the table region and has a consistent size.
    ChunkBounds,
    /// Per-chunk CRCs (optional).
    ChunkCrc,
    /// Every index points at an existing, earlier entry.
    CrossReference,
}

fn fail(stage: Stage, msg: impl Into<String>) -> GraphPackError {
    GraphPackError::Format(format!("{stage:?} check failed: {}", msg.into()))
}

/// The validated tables of a file.
#[derive(Debug, Clone)]
pub struct FileTables {
    /// The header.
    pub header: Header,
    /// Raw strings chunk.
    pub strings: Vec<u8>,
    /// Names table, sentinel included.
    pub names: Vec<NameEntry>,
    /// Types table, sentinel included.
    pub types: Vec<TypeEntry>,
    /// Properties table.
    pub properties: Vec<PropertyEntry>,
    /// Imports table.
    pub imports: Vec<ImportEntry>,
    /// Exports table.
    pub exports: Vec<ExportEntry>,
    /// Buffers table, sorted by hash.
    pub buffers: Vec<BufferEntry>,
}

impl FileTables {
    /// Reads and validates the header and tables from the start of `bytes`.
    ///
    /// `bytes` may be truncated or adversarial: every offset and size is checked against
    /// its length before anything is sliced.
    pub fn parse(bytes: &[u8], verify_chunk_crc: bool) -> Result<Self> {
        let header = Self::read_header(bytes)?;
        Self::check_header_crc(bytes, &header)?;
        Self::check_chunk_bounds(bytes, &header)?;
        if verify_chunk_crc {
            Self::check_chunk_crcs(bytes, &header)?;
        }

        let chunk = |kind: ChunkKind| -> &[u8] {
            let record = header.chunk(kind);
            let start = record.offset as usize;
            &bytes[start..start + record.size as usize]
        };

        let tables = Self {
            strings: chunk(ChunkKind::Strings).to_vec(),
            names: read_table(chunk(ChunkKind::Names)),
            types: read_table(chunk(ChunkKind::Types)),
            properties: read_table(chunk(ChunkKind::Properties)),
            imports: read_table(chunk(ChunkKind::Imports)),
            exports: read_table(chunk(ChunkKind::Exports)),
            buffers: read_table(chunk(ChunkKind::Buffers)),
            header,
        };
        tables.check_cross_references()?;
        Ok(tables)
    }

    /// Reads only the fixed header, checking magic and version. Used to learn how many
    /// bytes the table region spans before reading it.
    pub fn read_header(bytes: &[u8]) -> Result<Header> {
        if bytes.len() < HEADER_SIZE {
            return Err(fail(
                Stage::HeaderRead,
                format!("{} bytes is shorter than the {HEADER_SIZE} byte header", bytes.len()),
            ));
        }
        let header = Header::from_bytes(bytes)?;
        if header.magic != MAGIC {
            return Err(fail(
                Stage::HeaderRead,
                format!("bad magic 0x{:08X}", header.magic),
            ));
        }
        if !(MIN_VERSION..=CURRENT_VERSION).contains(&header.version) {
            return Err(fail(
                Stage::HeaderRead,
                format!(
                    "version {} outside supported range {MIN_VERSION}..={CURRENT_VERSION}",
                    header.version
                ),
            ));
        }
        Ok(header)
    }

    fn check_header_crc(bytes: &[u8], header: &Header) -> Result<()> {
        let crc = Header::compute_crc(bytes)?;
        if crc != header.crc {
            return Err(fail(
                Stage::HeaderCrc,
                format!("computed 0x{crc:08X}, stored 0x{:08X}", header.crc),
            ));
        }
        Ok(())
    }

    fn check_chunk_bounds(bytes: &[u8], header: &Header) -> Result<()> {
        let stage = Stage::ChunkBounds;
        if header.headers_end < HEADER_SIZE as u64
            || header.headers_end > bytes.len() as u64
            || header.headers_end > header.objects_end
            || header.objects_end > header.buffers_end
        {
            return Err(fail(
                stage,
                format!(
                    "region ends {}/{}/{} are inconsistent with {} available bytes",
                    header.headers_end,
                    header.objects_end,
                    header.buffers_end,
                    bytes.len()
                ),
            ));
        }

        for kind in ChunkKind::ALL {
            let record = header.chunk(kind);
            if u64::from(record.offset) < HEADER_SIZE as u64 || record.end() > header.headers_end {
                return Err(fail(
                    stage,
                    format!(
                        "{kind:?} chunk {}+{} lies outside the table region",
                        record.offset, record.size
                    ),
                ));
            }
            if u64::from(record.count) * kind.entry_size() as u64 != u64::from(record.size) {
                return Err(fail(
                    stage,
                    format!(
                        "{kind:?} chunk holds {} bytes for {} entries",
                        record.size, record.count
                    ),
                ));
            }
        }

        let sentinel_missing = [ChunkKind::Strings, ChunkKind::Names, ChunkKind::Types]
            .into_iter()
            .find(|kind| header.chunk(*kind).count == 0);
        if let Some(kind) = sentinel_missing {
            return Err(fail(stage, format!("{kind:?} chunk lacks its empty sentinel")));
        }
        Ok(())
    }

    fn check_chunk_crcs(bytes: &[u8], header: &Header) -> Result<()> {
        for kind in ChunkKind::ALL {
            let record = header.chunk(kind);
            let start = record.offset as usize;
            let crc = crc32fast::hash(&bytes[start..start + record.size as usize]);
            if crc != record.crc {
                return Err(fail(
                    Stage::ChunkCrc,
                    format!("{kind:?} chunk computed 0x{crc:08X}, stored 0x{:08X}", record.crc),
                ));
            }
        }
        Ok(())
    }

    fn check_cross_references(&self) -> Result<()> {
        let stage = Stage::CrossReference;
        let names = self.names.len() as u32;
        let types = self.types.len() as u32;

        if self.strings.first() != Some(&0) {
            return Err(fail(stage, "strings chunk does not start with the empty string"));
        }
        if self.strings.last() != Some(&0) {
            return Err(fail(stage, "strings chunk is not nul-terminated"));
        }
        for (i, name) in self.names.iter().enumerate() {
            if name.string_offset as usize >= self.strings.len() {
                return Err(fail(stage, format!("name {i} points past the strings chunk")));
            }
            if i == 0 && name.string_offset != 0 {
                return Err(fail(stage, "name sentinel is not the empty string"));
            }
        }
        for (i, ty) in self.types.iter().enumerate() {
            if ty.name >= names || (i == 0) != (ty.name == 0) {
                return Err(fail(stage, format!("type {i} has invalid name index {}", ty.name)));
            }
        }
        for (i, property) in self.properties.iter().enumerate() {
            if property.class_type == 0 || property.class_type >= types {
                return Err(fail(
                    stage,
                    format!("property {i} has invalid class index {}", property.class_type),
                ));
            }
            if property.name == 0 || property.name >= names {
                return Err(fail(
                    stage,
                    format!("property {i} has invalid name index {}", property.name),
                ));
            }
        }
        for (i, import) in self.imports.iter().enumerate() {
            if import.class_type == 0 || import.class_type >= types {
                return Err(fail(
                    stage,
                    format!("import {i} has invalid class index {}", import.class_type),
                ));
            }
        }

        let header = &self.header;
        for (i, export) in self.exports.iter().enumerate() {
            if export.class_type == 0 || export.class_type >= types {
                return Err(fail(
                    stage,
                    format!("export {i} has invalid class index {}", export.class_type),
                ));
            }
            if export.parent as usize > i {
                return Err(fail(
                    stage,
                    format!("export {i} has parent {} that does not precede it", export.parent),
                ));
            }
            let end = export.offset.checked_add(u64::from(export.size));
            if export.offset < header.headers_end || end.is_none_or(|end| end > header.objects_end) {
                return Err(fail(
                    stage,
                    format!("export {i} data {}+{} lies outside the object region", export.offset, export.size),
                ));
            }
        }

        for (i, buffer) in self.buffers.iter().enumerate() {
            if i > 0 && self.buffers[i - 1].hash >= buffer.hash {
                return Err(fail(stage, format!("buffer {i} is not sorted by hash")));
            }
            if header.buffers_extracted() {
                continue;
            }
            let end = buffer.offset.checked_add(buffer.stored_size);
            if buffer.offset < header.objects_end || end.is_none_or(|end| end > header.buffers_end) {
                return Err(fail(
                    stage,
                    format!("buffer {i} data lies outside the buffer region"),
                ));
            }
            let size_fits = match buffer.compression {
                0 => buffer.size == buffer.stored_size,
                // LZ4 expands a block by at most 255x plus the trailing literals.
                1 => buffer
                    .stored_size
                    .checked_mul(255)
                    .and_then(|max| max.checked_add(16))
                    .is_some_and(|max| buffer.size <= max),
                _ => true,
            };
            if !size_fits {
                return Err(fail(
                    stage,
                    format!(
                        "buffer {i} claims {} bytes from {} stored bytes",
                        buffer.size, buffer.stored_size
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Text of the name at `index`.
    pub fn name(&self, index: u32) -> Result<&str> {
        let entry = self
            .names
            .get(index as usize)
            .ok_or_else(|| fail(Stage::CrossReference, format!("name {index} out of range")))?;
        self.string_at(entry.string_offset)
    }

    /// Name of the type at `index`.
    pub fn type_name(&self, index: u32) -> Result<&str> {
        let entry = self
            .types
            .get(index as usize)
            .ok_or_else(|| fail(Stage::CrossReference, format!("type {index} out of range")))?;
        self.name(entry.name)
    }

    fn string_at(&self, offset: u32) -> Result<&str> {
        let tail = self
            .strings
            .get(offset as usize..)
            .ok_or_else(|| fail(Stage::CrossReference, format!("string {offset} out of range")))?;
        let len = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..len])
            .map_err(|e| GraphPackError::Format(format!("String at {offset} is not UTF-8: {e}")))
    }
}

fn read_table<T: TableEntry>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::SIZE).map(T::read_from).collect()
}

/// Serializes a table.
pub fn write_table<T: TableEntry>(entries: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * T::SIZE);
    for entry in entries {
        entry.write_to(&mut out);
    }
    out
}

fn check_len(bytes: &[u8], needed: usize, what: &str) -> Result<()> {
    if bytes.len() < needed {
        return Err(GraphPackError::Format(format!(
            "Buffer too small for {what}: {} < {needed}",
            bytes.len()
        )));
    }
    Ok(())
}

fn u32_at(bytes: &[u8], at: usize) -> u32 {
    let raw = bytes.get(at..at + 4).and_then(|b| b.try_into().ok());
    u32::from_le_bytes(raw.unwrap_or([0; 4]))
}

fn u64_at(bytes: &[u8], at: usize) -> u64 {
    let raw = bytes.get(at..at + 8).and_then(|b| b.try_into().ok());
    u64::from_le_bytes(raw.unwrap_or([0; 8]))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal valid file: sentinels, one class name and one export without data.
    fn minimal() -> Vec<u8> {
        let strings = vec![0u8, b'N', 0];
        let names = write_table(&[NameEntry { string_offset: 0 }, NameEntry { string_offset: 1 }]);
        let types = write_table(&[TypeEntry { name: 0 }, TypeEntry { name: 1 }]);
        let end = (HEADER_SIZE + strings.len() + names.len() + types.len() + ExportEntry::SIZE) as u64;
        let exports = write_table(&[ExportEntry {
            class_type: 1,
            parent: 0,
            offset: end,
            size: 0,
            crc: 0,
        }]);

        let tables = [
            (ChunkKind::Strings, strings, 3),
            (ChunkKind::Names, names, 2),
            (ChunkKind::Types, types, 2),
            (ChunkKind::Exports, exports, 1),
        ];
        let mut header = Header::new(FLAG_PROTECTED);
        let mut body = Vec::new();
        for kind in ChunkKind::ALL {
            let (bytes, count) = tables
                .iter()
                .find(|(k, _, _)| *k == kind)
                .map(|(_, b, c)| (b.clone(), *c))
                .unwrap_or_default();
            header.chunks[kind as usize] = ChunkRecord {
                offset: (HEADER_SIZE + body.len()) as u32,
                size: bytes.len() as u32,
                count,
                crc: crc32fast::hash(&bytes),
            };
            body.extend_from_slice(&bytes);
        }
        header.headers_end = end;
        header.objects_end = end;
        header.buffers_end = end;

        let mut file = header.to_bytes().to_vec();
        file.extend_from_slice(&body);
        file
    }

    #[test]
    fn minimal_file_is_valid() -> Result<()> {
        let tables = FileTables::parse(&minimal(), true)?;
        assert!(tables.header.is_protected());
        assert_eq!(tables.type_name(1)?, "N");
        assert_eq!(tables.exports.len(), 1);
        Ok(())
    }

    #[test]
    fn every_truncation_is_rejected() {
        let file = minimal();
        for len in 0..file.len() {
            assert!(FileTables::parse(&file[..len], true).is_err(), "len {len}");
        }
    }

    #[test]
    fn header_crc_catches_flipped_bits() {
        let mut file = minimal();
        file[14] ^= 0x40;
        let err = FileTables::parse(&file, true).map(|_| ());
        assert!(matches!(err, Err(GraphPackError::Format(msg)) if msg.contains("HeaderCrc")));
    }

    #[test]
    fn chunk_crc_is_optional() {
        let mut file = minimal();
        let last = file.len() - 1;
        file[last] ^= 0x01;
        assert!(FileTables::parse(&file, true).is_err());
        // Without the chunk CRC the flip lands in the export CRC field and goes unnoticed.
        assert!(FileTables::parse(&file, false).is_ok());
    }

    #[test]
    fn bad_magic_and_version_fail_first() {
        let mut file = minimal();
        file[0] = b'X';
        assert!(matches!(FileTables::read_header(&file), Err(GraphPackError::Format(m)) if m.contains("magic")));

        let mut file = minimal();
        file[4] = 9;
        assert!(matches!(FileTables::read_header(&file), Err(GraphPackError::Format(m)) if m.contains("version")));
    }

    fn with_buffer(size: u64, stored_size: u64, compression: u32) -> Result<FileTables> {
        let mut tables = FileTables::parse(&minimal(), true)?;
        tables.header.buffers_end = tables.header.objects_end + stored_size;
        tables.buffers.push(BufferEntry {
            hash: 1,
            offset: tables.header.objects_end,
            stored_size,
            size,
            compression,
        });
        Ok(tables)
    }

    #[test]
    fn impossible_buffer_sizes_are_rejected() -> Result<()> {
        assert!(with_buffer(100, 100, 0)?.check_cross_references().is_ok());
        assert!(with_buffer(101, 100, 0)?.check_cross_references().is_err());
        assert!(with_buffer(64 * 1024, 300, 1)?.check_cross_references().is_ok());
        assert!(with_buffer(1 << 62, 300, 1)?.check_cross_references().is_err());
        Ok(())
    }

    #[test]
    fn later_parent_is_rejected() -> Result<()> {
        let mut tables = FileTables::parse(&minimal(), true)?;
        tables.exports[0].parent = 1;
        assert!(tables.check_cross_references().is_err());
        Ok(())
    }
}
