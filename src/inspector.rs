//! Tools for inspecting the physical structure of GraphPack files.
//! Useful for debugging layouts and checking integrity without a type registry.

use std::path::Path;

use serde::Serialize;

use crate::compression::CompressionKind;
use crate::error::{GraphPackError, Result};
use crate::format::{FileTables, HEADER_SIZE};
use crate::io::DataSource;

/// A structural report of a GraphPack file.
#[derive(Debug, Serialize)]
pub struct InspectionReport {
    /// Size of the inspected data.
    pub file_size: u64,
    /// Format version.
    pub version: u32,
    /// Whether opcode tags and object CRCs are present.
    pub protected: bool,
    /// Whether buffers were extracted at save time.
    pub buffers_extracted: bool,
    /// End of the table region.
    pub headers_end: u64,
    /// End of the object region.
    pub objects_end: u64,
    /// End of the buffer region.
    pub buffers_end: u64,
    /// Distinct identifiers, sentinel excluded.
    pub name_count: usize,
    /// Distinct types, sentinel excluded.
    pub type_count: usize,
    /// Distinct properties.
    pub property_count: usize,
    /// External resources.
    pub imports: Vec<ImportInfo>,
    /// Saved objects, in export order.
    pub exports: Vec<ExportInfo>,
    /// Async buffers, in hash order.
    pub buffers: Vec<BufferInfo>,
}

/// One import.
#[derive(Debug, Serialize)]
pub struct ImportInfo {
    /// Resource id.
    pub id: String,
    /// Resource class name.
    pub class: String,
    /// Flagged for eager loading.
    pub load_eagerly: bool,
}

/// One saved object.
#[derive(Debug, Serialize)]
pub struct ExportInfo {
    /// 1-based export index.
    pub index: u32,
    /// Class name.
    pub class: String,
    /// 1-based export index of the parent, or 0.
    pub parent: u32,
    /// Offset of the object data.
    pub offset: u64,
    /// Size of the object data.
    pub size: u32,
    /// `Some(matches)` for protected files, `None` when the file carries no object CRCs
    /// or the data is out of reach.
    pub crc_ok: Option<bool>,
}

/// One async buffer.
#[derive(Debug, Serialize)]
pub struct BufferInfo {
    /// Content hash.
    pub hash: String,
    /// Uncompressed size.
    pub size: u64,
    /// Stored size, 0 when extracted.
    pub stored_size: u64,
    /// Compression of the stored data.
    pub compression: String,
}

/// The GraphPack inspector tool.
#[derive(Debug)]
pub struct GraphInspector;

impl GraphInspector {
    /// Analyzes a file and returns a structural report.
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<InspectionReport> {
        Self::inspect_source(&DataSource::open(path)?)
    }

    /// Analyzes an in-memory file.
    pub fn inspect_bytes(bytes: Vec<u8>) -> Result<InspectionReport> {
        Self::inspect_source(&DataSource::from_bytes(bytes))
    }

    fn inspect_source(source: &DataSource) -> Result<InspectionReport> {
        let header = FileTables::read_header(source.slice(0, (HEADER_SIZE as u64).min(source.len()))?)?;
        let tables = FileTables::parse(source.slice(0, header.headers_end.min(source.len()))?, true)?;
        let header = &tables.header;

        let type_name = |index: u32| tables.type_name(index).unwrap_or("<invalid>").to_string();

        let exports = tables
            .exports
            .iter()
            .enumerate()
            .map(|(i, export)| {
                let crc_ok = header.is_protected().then(|| {
                    source
                        .slice(export.offset, u64::from(export.size))
                        .ok()
                        .map(|data| crc32fast::hash(data) == export.crc)
                });
                ExportInfo {
                    index: i as u32 + 1,
                    class: type_name(export.class_type),
                    parent: export.parent,
                    offset: export.offset,
                    size: export.size,
                    crc_ok: crc_ok.flatten(),
                }
            })
            .collect();

        let imports = tables
            .imports
            .iter()
            .map(|import| ImportInfo {
                id: import.id.to_string(),
                class: type_name(import.class_type),
                load_eagerly: import.load_eagerly(),
            })
            .collect();

        let buffers = tables
            .buffers
            .iter()
            .map(|buffer| BufferInfo {
                hash: format!("{:016x}", buffer.hash),
                size: buffer.size,
                stored_size: buffer.stored_size,
                compression: match CompressionKind::from_u32(buffer.compression) {
                    Ok(kind) => format!("{kind:?}"),
                    Err(_) => format!("Unknown({})", buffer.compression),
                },
            })
            .collect();

        Ok(InspectionReport {
            file_size: source.len(),
            version: header.version,
            protected: header.is_protected(),
            buffers_extracted: header.buffers_extracted(),
            headers_end: header.headers_end,
            objects_end: header.objects_end,
            buffers_end: header.buffers_end,
            name_count: tables.names.len().saturating_sub(1),
            type_count: tables.types.len().saturating_sub(1),
            property_count: tables.properties.len(),
            imports,
            exports,
            buffers,
        })
    }
}

impl InspectionReport {
    /// Renders the report as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| GraphPackError::Internal(format!("Report serialization failed: {e}")))
    }

    fn fmt_object(&self, f: &mut std::fmt::Formatter<'_>, index: u32, prefix: &str, is_last: bool) -> std::fmt::Result {
        let Some(export) = self.exports.get(index as usize - 1) else {
            return Ok(());
        };
        let connector = if is_last { "└── " } else { "├── " };
        let child_prefix = if is_last { "    " } else { "│   " };
        let crc = match export.crc_ok {
            Some(true) => " | CRC ok",
            Some(false) => " | CRC MISMATCH",
            None => "",
        };
        writeln!(
            f,
            "{prefix}{connector}#{} {} | Size: {}b @ {}{crc}",
            export.index, export.class, export.size, export.offset
        )?;

        let children: Vec<u32> = self
            .exports
            .iter()
            .filter(|e| e.parent == index)
            .map(|e| e.index)
            .collect();
        for (i, child) in children.iter().enumerate() {
            self.fmt_object(f, *child, &format!("{prefix}{child_prefix}"), i == children.len() - 1)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for InspectionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== GRAPHPACK INSPECTOR REPORT ===")?;
        writeln!(
            f,
            "Version: {} | Protected: {} | Buffers extracted: {}",
            self.version, self.protected, self.buffers_extracted
        )?;
        writeln!(
            f,
            "Regions: tables 0..{} | objects ..{} | buffers ..{} | file {}",
            self.headers_end, self.objects_end, self.buffers_end, self.file_size
        )?;
        writeln!(
            f,
            "Tables: {} names | {} types | {} properties | {} imports | {} exports | {} buffers",
            self.name_count,
            self.type_count,
            self.property_count,
            self.imports.len(),
            self.exports.len(),
            self.buffers.len()
        )?;

        writeln!(f, "\n[OBJECTS]")?;
        let roots: Vec<u32> = self.exports.iter().filter(|e| e.parent == 0).map(|e| e.index).collect();
        for (i, root) in roots.iter().enumerate() {
            self.fmt_object(f, *root, "", i == roots.len() - 1)?;
        }

        if !self.imports.is_empty() {
            writeln!(f, "\n[IMPORTS]")?;
            for import in &self.imports {
                let eager = if import.load_eagerly { " (eager)" } else { "" };
                writeln!(f, "  {} {}{eager}", import.class, import.id)?;
            }
        }
        if !self.buffers.is_empty() {
            writeln!(f, "\n[BUFFERS]")?;
            for buffer in &self.buffers {
                writeln!(
                    f,
                    "  {} | {}b -> {}b | {}",
                    buffer.hash, buffer.size, buffer.stored_size, buffer.compression
                )?;
            }
        }
        Ok(())
    }
}
