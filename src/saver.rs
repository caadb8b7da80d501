//! Save orchestration.
//!
//! ```text
//! roots --collect--> ordered objects + opcode streams
//!       --tables---> deduplicated tables, export and buffer indices
//!       --write----> [placeholder tables] [objects] [buffers]
//!       --patch----> header + tables over the placeholder
//! ```
//!
//! The output is owned by the save for its whole duration. The only back-patch is the
//! header region, written last once every offset and CRC is known.

use std::io::{Seek, Write};
use std::time::Instant;

use indexmap::IndexMap;
use tracing::{debug, info};

use crate::api::CancellationFlag;
use crate::buffer::AsyncBuffer;
use crate::error::{GraphPackError, Result};
use crate::format::{FLAG_BUFFERS_EXTRACTED, FLAG_PROTECTED};
use crate::graph::{ObjectCollection, collect_objects};
use crate::io::SeqWriter;
use crate::object::ObjectPtr;
use crate::resource::ResourceKey;
use crate::stream::{Binarizer, OpcodeFileWriter};
use crate::tables::TableBuilder;
use crate::xml;

/// Physical encoding of a saved file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SaveFormat {
    /// Tagged opcodes with per-object CRCs, verified on load.
    #[default]
    Protected,
    /// Compact encoding without tags or CRC verification.
    Unprotected,
    /// Text rendition for inspection. Cannot be loaded.
    Xml,
}

/// Configuration for a save.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Output encoding.
    pub format: SaveFormat,
    /// Return async buffers to the caller instead of storing them in the file.
    pub extract_buffers: bool,
    /// Cooperative cancellation, polled once per object.
    pub cancel: Option<CancellationFlag>,
}

impl SaveOptions {
    /// Default options: protected format, buffers stored in the file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the output encoding.
    pub fn format(mut self, format: SaveFormat) -> Self {
        self.format = format;
        self
    }

    /// Chooses whether async buffers are extracted.
    pub fn extract_buffers(mut self, extract: bool) -> Self {
        self.extract_buffers = extract;
        self
    }

    /// Attaches a cancellation flag.
    pub fn cancel_with(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationFlag::is_cancelled)
    }
}

/// Outcome of a successful save.
#[derive(Debug, Clone, Default)]
pub struct SaveResult {
    /// Number of objects written.
    pub objects: usize,
    /// Bytes written, from the base offset.
    pub bytes_written: u64,
    /// Buffers that were not stored in the file, in content-hash order.
    pub extracted_buffers: Vec<AsyncBuffer>,
}

/// Saves the graph reachable from `roots` into `writer`, starting at its current position.
pub fn save_to<W: Write + Seek>(writer: W, roots: &[ObjectPtr], options: &SaveOptions) -> Result<SaveResult> {
    let started = Instant::now();
    let collection = collect_objects(roots, options.cancel.as_ref())?;
    let mut out = SeqWriter::new(writer)?;

    let result = match options.format {
        SaveFormat::Xml => {
            let mut tables = TableBuilder::new();
            for node in collection.nodes() {
                tables.add_references(&node.references);
            }
            tables.seal_buffers();
            xml::write_xml(&mut out, &collection)?;
            SaveResult {
                objects: collection.len(),
                bytes_written: out.relative_offset(),
                extracted_buffers: tables.buffers().cloned().collect(),
            }
        }
        SaveFormat::Protected | SaveFormat::Unprotected => write_binary(&mut out, &collection, options)?,
    };
    out.flush()?;

    info!(
        "Saved {} objects ({} bytes, {:?}) in {:?}",
        result.objects,
        result.bytes_written,
        options.format,
        started.elapsed()
    );
    Ok(result)
}

fn write_binary<W: Write + Seek>(
    out: &mut SeqWriter<W>,
    collection: &ObjectCollection,
    options: &SaveOptions,
) -> Result<SaveResult> {
    let protected = options.format == SaveFormat::Protected;

    let mut tables = TableBuilder::new();
    for node in collection.nodes() {
        tables.add_references(&node.references);
    }
    tables.assign_exports(&collection.objects())?;
    tables.seal_buffers();

    let headers_end = tables.headers_end();
    out.write_all(&vec![0u8; headers_end as usize])?;

    let mut spans = Vec::with_capacity(collection.len());
    {
        let binarizer = Binarizer::new(&tables, protected);
        let mut file = OpcodeFileWriter::new(out);
        for node in collection.nodes() {
            if options.is_cancelled() {
                return Err(GraphPackError::Cancelled);
            }
            spans.push(binarizer.write_object(&node.stream, &mut file)?);
        }
        file.flush()?;
    }
    for (index, span) in spans.into_iter().enumerate() {
        tables.set_export_span(index, span)?;
    }
    let objects_end = out.relative_offset();
    debug!("Object region: {} bytes", objects_end - headers_end);

    let mut flags = if protected { FLAG_PROTECTED } else { 0 };
    let mut extracted_buffers = Vec::new();
    if options.extract_buffers {
        flags |= FLAG_BUFFERS_EXTRACTED;
        extracted_buffers = tables.buffers().cloned().collect();
    } else {
        let mut stored = Vec::new();
        for buffer in tables.buffers() {
            let (data, kind) = buffer.extract()?;
            let offset = out.relative_offset();
            out.write_all(&data)?;
            stored.push((offset, data.len() as u64, kind));
        }
        for (index, (offset, size, kind)) in stored.into_iter().enumerate() {
            tables.set_buffer_data(index, offset, size, kind)?;
        }
    }
    let buffers_end = out.relative_offset();

    let header = tables.encode(flags, objects_end, buffers_end)?;
    if header.len() as u64 != headers_end {
        return Err(GraphPackError::Internal(format!(
            "Table region changed size from {headers_end} to {} bytes",
            header.len()
        )));
    }
    out.patch_at(out.base_offset(), &header)?;

    Ok(SaveResult {
        objects: collection.len(),
        bytes_written: buffers_end,
        extracted_buffers,
    })
}

/// Runs collection and table building without writing anything, and counts how many
/// saved objects reference each resource.
pub fn extract_used_resources(roots: &[ObjectPtr]) -> Result<IndexMap<ResourceKey, usize>> {
    let collection = collect_objects(roots, None)?;
    let mut tables = TableBuilder::new();
    for node in collection.nodes() {
        tables.add_references(&node.references);
    }

    let mut counts: IndexMap<ResourceKey, usize> =
        tables.imports().map(|(key, _)| (key.clone(), 0)).collect();
    for node in collection.nodes() {
        let mut seen = std::collections::HashSet::new();
        let resources = node
            .references
            .sync_resources()
            .chain(node.references.async_resources());
        for resource in resources {
            let key = resource.key();
            if seen.insert(key.clone())
                && let Some(count) = counts.get_mut(&key)
            {
                *count += 1;
            }
        }
    }
    Ok(counts)
}
