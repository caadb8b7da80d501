//! Load orchestration.
//!
//! A load runs in stages, each depending on the previous one:
//!
//! 1. **Header and tables**: the fixed header is read first to learn the size of the table
//!    region, which is then read and validated as a whole by [`FileTables::parse`].
//! 2. **Resolution**: names, types and properties are matched against the [`TypeRegistry`].
//!    Imports flagged for eager loading are handed to the [`ResourceLoader`] in parallel.
//!    Buffers become lazy handles on the data source or are looked up in a [`BufferStore`].
//! 3. **Blank objects**: one per export, parented as recorded. Exports whose class is
//!    unknown or abstract are skipped, and so is everything below them.
//! 4. **Object data**: read in large block-aligned batches, CRC-checked when the file is
//!    protected, and decoded through a [`Reader`].
//! 5. **Post-load**: every object's post-load hook runs once, in export order.
//!
//! Only malformed data and I/O failures abort a load. Unknown types, missing properties and
//! failed imports are logged and degrade to null values.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{AsyncBuffer, BufferStore};
use crate::compression::CompressionKind;
use crate::constants::{BLOCK_SIZE, DEFAULT_LOAD_BUFFER_SIZE, MAX_TABLES_SIZE};
use crate::error::{GraphPackError, Result};
use crate::format::{ExportEntry, FileTables, HEADER_SIZE, Header};
use crate::io::DataSource;
use crate::object::{Name, Object, ObjectPtr, TypeRegistry};
use crate::resource::{ResourceHandle, ResourceLoader, ResourceRef};
use crate::stream::{Reader, ResolvedProperty, ResolvedReferences, ResolvedType};
use crate::xml;

/// Configuration for a load.
#[derive(Clone)]
pub struct LoadOptions {
    /// Load imports flagged for eager loading through [`LoadOptions::resource_loader`].
    pub load_imports: bool,
    /// Recorded as the load path of the first export.
    pub resource_path: Option<String>,
    /// Position of the file inside the data source.
    pub base_offset: u64,
    /// Check the CRC32 of every table chunk.
    pub verify_chunk_crc: bool,
    /// Loads eager imports.
    pub resource_loader: Option<Arc<dyn ResourceLoader>>,
    /// Supplies buffers of files saved with extracted buffers.
    pub buffer_store: Option<Arc<dyn BufferStore>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            load_imports: true,
            resource_path: None,
            base_offset: 0,
            verify_chunk_crc: true,
            resource_loader: None,
            buffer_store: None,
        }
    }
}

impl fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("load_imports", &self.load_imports)
            .field("resource_path", &self.resource_path)
            .field("base_offset", &self.base_offset)
            .field("verify_chunk_crc", &self.verify_chunk_crc)
            .field("resource_loader", &self.resource_loader.is_some())
            .field("buffer_store", &self.buffer_store.is_some())
            .finish()
    }
}

impl LoadOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables eager import loading.
    pub fn load_imports(mut self, enabled: bool) -> Self {
        self.load_imports = enabled;
        self
    }

    /// Sets the resource path recorded on the first export.
    pub fn resource_path(mut self, path: impl Into<String>) -> Self {
        self.resource_path = Some(path.into());
        self
    }

    /// Sets the position of the file inside the data source.
    pub fn base_offset(mut self, offset: u64) -> Self {
        self.base_offset = offset;
        self
    }

    /// Enables or disables chunk CRC verification.
    pub fn verify_chunk_crc(mut self, enabled: bool) -> Self {
        self.verify_chunk_crc = enabled;
        self
    }

    /// Sets the loader for eager imports.
    pub fn resource_loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.resource_loader = Some(loader);
        self
    }

    /// Sets the store consulted for extracted buffers.
    pub fn buffer_store(mut self, store: Arc<dyn BufferStore>) -> Self {
        self.buffer_store = Some(store);
        self
    }
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Default)]
pub struct LoadResult {
    /// Loaded exports without a parent, in export order.
    pub roots: Vec<ObjectPtr>,
    /// Every loaded export, in export order.
    pub objects: Vec<ObjectPtr>,
    /// Number of exports skipped because their class could not be instantiated.
    pub skipped: usize,
}

/// An import as listed by [`load_dependencies`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Resource id.
    pub id: Uuid,
    /// Resource class name.
    pub class: Name,
    /// True if the resource is flagged for loading together with the file.
    pub load_eagerly: bool,
    /// True if the class name resolves in the registry.
    pub class_known: bool,
}

/// Loads the file stored in `source` at `options.base_offset`.
pub fn load(source: &Arc<DataSource>, registry: &TypeRegistry, options: &LoadOptions) -> Result<LoadResult> {
    let started = Instant::now();
    let tables = read_tables(source, options)?;
    let header = &tables.header;

    let available = source.len().saturating_sub(options.base_offset);
    let needed = if header.buffers_extracted() {
        header.objects_end
    } else {
        header.buffers_end
    };
    if needed > available {
        return Err(GraphPackError::Format(format!(
            "File is truncated: {needed} bytes expected, {available} available"
        )));
    }

    let mut refs = ResolvedReferences {
        names: resolve_names(&tables)?,
        ..Default::default()
    };
    refs.types = resolve_types(&tables, &refs.names, registry);
    refs.properties = resolve_properties(&tables, &refs.names, &refs.types);
    refs.imports = resolve_imports(&tables, &refs.names, options);
    refs.buffers = resolve_buffers(&tables, source, options)?;

    let (objects, skipped) = create_objects(&tables, &refs.types);
    refs.objects = objects;

    read_objects(&tables, source, options.base_offset, &refs)?;

    if let Some(path) = &options.resource_path
        && let Some(Some(main)) = refs.objects.first()
    {
        main.set_load_path(path);
    }
    let loaded: Vec<ObjectPtr> = refs.objects.iter().flatten().cloned().collect();
    for object in &loaded {
        object.on_post_load();
    }

    let roots = tables
        .exports
        .iter()
        .zip(&refs.objects)
        .filter(|(export, _)| export.parent == 0)
        .filter_map(|(_, object)| object.clone())
        .collect();

    info!(
        "Loaded {} of {} objects ({} skipped) in {:?}",
        loaded.len(),
        tables.exports.len(),
        skipped,
        started.elapsed()
    );
    Ok(LoadResult {
        roots,
        objects: loaded,
        skipped,
    })
}

/// Lists the imports of the file without creating any object.
pub fn load_dependencies(
    source: &DataSource,
    registry: &TypeRegistry,
    options: &LoadOptions,
) -> Result<Vec<Dependency>> {
    let tables = read_tables(source, options)?;
    let names = resolve_names(&tables)?;
    let types = resolve_types(&tables, &names, registry);

    tables
        .imports
        .iter()
        .map(|import| {
            let class = types
                .get(import.class_type as usize)
                .ok_or_else(|| GraphPackError::Format(format!("Import type {} out of range", import.class_type)))?;
            Ok(Dependency {
                id: import.id,
                class: class.name.clone(),
                load_eagerly: import.load_eagerly(),
                class_known: class.ty.is_some(),
            })
        })
        .collect()
}

fn read_tables(source: &DataSource, options: &LoadOptions) -> Result<FileTables> {
    let base = options.base_offset;

    let mut header_bytes = vec![0u8; HEADER_SIZE];
    let n = source.read_at(base, &mut header_bytes);
    header_bytes.truncate(n);
    if xml::is_xml(&header_bytes) {
        return Err(GraphPackError::Format(
            "XML renditions cannot be loaded, save in a binary format instead".into(),
        ));
    }

    let header: Header = FileTables::read_header(&header_bytes)?;
    if header.headers_end > MAX_TABLES_SIZE {
        return Err(GraphPackError::Format(format!(
            "Table region of {} bytes exceeds the {MAX_TABLES_SIZE} byte limit",
            header.headers_end
        )));
    }

    let mut table_bytes = vec![0u8; header.headers_end as usize];
    let n = source.read_at(base, &mut table_bytes);
    table_bytes.truncate(n);
    let tables = FileTables::parse(&table_bytes, options.verify_chunk_crc)?;
    debug!(
        "Tables: {} names, {} types, {} properties, {} imports, {} exports, {} buffers",
        tables.names.len(),
        tables.types.len(),
        tables.properties.len(),
        tables.imports.len(),
        tables.exports.len(),
        tables.buffers.len()
    );
    Ok(tables)
}

fn resolve_names(tables: &FileTables) -> Result<Vec<Name>> {
    (0..tables.names.len() as u32)
        .map(|i| tables.name(i).map(Name::from))
        .collect()
}

fn resolve_types(tables: &FileTables, names: &[Name], registry: &TypeRegistry) -> Vec<ResolvedType> {
    tables
        .types
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let name = names.get(entry.name as usize).cloned().unwrap_or_default();
            let ty = if i == 0 { None } else { registry.find_type(name.as_str()) };
            if i != 0 && ty.is_none() {
                warn!("Type '{name}' is not registered; data of this type is skipped");
            }
            ResolvedType { ty, name }
        })
        .collect()
}

fn resolve_properties(tables: &FileTables, names: &[Name], types: &[ResolvedType]) -> Vec<ResolvedProperty> {
    tables
        .properties
        .iter()
        .map(|entry| {
            let owner = types.get(entry.class_type as usize);
            let name = names.get(entry.name as usize).cloned().unwrap_or_default();
            let property = owner
                .and_then(|t| t.ty.as_ref())
                .and_then(|t| t.as_class())
                .and_then(|class| class.find_property(name.as_str()))
                .cloned();
            ResolvedProperty {
                property,
                owner: owner.map(|t| t.name.clone()).unwrap_or_default(),
                name,
            }
        })
        .collect()
}

/// Builds the import references, loading eager imports in parallel when enabled.
///
/// A failed eager import is logged and resolves to null.
fn resolve_imports(tables: &FileTables, names: &[Name], options: &LoadOptions) -> Vec<Option<ResourceRef>> {
    let class_of = |class_type: u32| -> Name {
        tables
            .types
            .get(class_type as usize)
            .and_then(|t| names.get(t.name as usize))
            .cloned()
            .unwrap_or_default()
    };

    let loader = options.resource_loader.as_deref().filter(|_| options.load_imports);
    let handles: Vec<OnceCell<ResourceHandle>> = tables.imports.iter().map(|_| OnceCell::new()).collect();

    if let Some(loader) = loader {
        rayon::scope(|s| {
            for (import, slot) in tables.imports.iter().zip(&handles) {
                if !import.load_eagerly() {
                    continue;
                }
                let class = class_of(import.class_type);
                s.spawn(move |_| match loader.load_resource(&import.id, &class) {
                    Ok(handle) => {
                        let _ = slot.set(handle);
                    }
                    Err(e) => warn!("Import {} ({class}) failed to load: {e}", import.id),
                });
            }
        });
    }

    tables
        .imports
        .iter()
        .zip(handles)
        .map(|(import, handle)| {
            let reference = ResourceRef::new(import.id, class_of(import.class_type));
            match handle.into_inner() {
                Some(handle) => Some(reference.with_handle(handle)),
                None if loader.is_some() && import.load_eagerly() => None,
                None => Some(reference),
            }
        })
        .collect()
}

fn resolve_buffers(
    tables: &FileTables,
    source: &Arc<DataSource>,
    options: &LoadOptions,
) -> Result<Vec<Option<AsyncBuffer>>> {
    if tables.header.buffers_extracted() {
        return Ok(tables
            .buffers
            .iter()
            .map(|entry| {
                let found = options
                    .buffer_store
                    .as_ref()
                    .and_then(|store| store.find_buffer(entry.hash));
                if found.is_none() {
                    warn!("Buffer {:016x} is not in the buffer store", entry.hash);
                }
                found
            })
            .collect());
    }

    tables
        .buffers
        .iter()
        .map(|entry| {
            Ok(Some(AsyncBuffer::on_disk(
                source.clone(),
                options.base_offset + entry.offset,
                entry.stored_size,
                entry.size,
                CompressionKind::from_u32(entry.compression)?,
                entry.hash,
            )))
        })
        .collect()
}

/// Creates one blank object per export. Returns the objects in export order, `None` for
/// skipped exports, and the number skipped.
fn create_objects(tables: &FileTables, types: &[ResolvedType]) -> (Vec<Option<ObjectPtr>>, usize) {
    let mut objects: Vec<Option<ObjectPtr>> = Vec::with_capacity(tables.exports.len());
    let mut skipped = 0;

    for export in &tables.exports {
        let resolved = types.get(export.class_type as usize);
        let class = resolved.and_then(|t| t.ty.as_ref()).and_then(|t| t.as_class());
        let type_name = resolved.map(|t| t.name.as_str()).unwrap_or_default();

        let object = match class {
            None => {
                warn!("Export of unknown class '{type_name}' is skipped");
                None
            }
            Some(class) if class.is_abstract() => {
                warn!("Export of abstract class '{type_name}' is skipped");
                None
            }
            Some(class) if export.parent == 0 => Some(Object::new(class)),
            Some(class) => match objects.get(export.parent as usize - 1) {
                Some(Some(parent)) => Some(Object::new_child(class, parent)),
                _ => {
                    debug!("Export of class '{type_name}' is skipped with its parent");
                    None
                }
            },
        };
        if object.is_none() {
            skipped += 1;
        }
        objects.push(object);
    }
    (objects, skipped)
}

/// Size of the reusable read buffer for an object region.
fn batch_capacity(region: u64, largest: u64) -> u64 {
    let capacity = if region <= DEFAULT_LOAD_BUFFER_SIZE {
        region + BLOCK_SIZE
    } else {
        (largest + BLOCK_SIZE).max(DEFAULT_LOAD_BUFFER_SIZE)
    };
    capacity.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

fn read_objects(tables: &FileTables, source: &DataSource, base: u64, refs: &ResolvedReferences) -> Result<()> {
    let header = &tables.header;
    let protected = header.is_protected();

    let pending: Vec<(&ExportEntry, &ObjectPtr)> = tables
        .exports
        .iter()
        .zip(&refs.objects)
        .filter_map(|(export, object)| object.as_ref().map(|o| (export, o)))
        .collect();
    if pending.is_empty() {
        return Ok(());
    }

    let largest = pending.iter().map(|(e, _)| u64::from(e.size)).max().unwrap_or(0);
    let capacity = batch_capacity(header.objects_end.saturating_sub(header.headers_end), largest);
    let mut batch = vec![0u8; capacity as usize];
    let mut batch_start = 0u64;
    let mut batch_len = 0u64;
    let mut batches = 0usize;

    for (export, object) in pending {
        let end = export.offset + u64::from(export.size);
        if export.offset < batch_start || end > batch_start + batch_len {
            batch_start = export.offset - export.offset % BLOCK_SIZE;
            batch_len = capacity.min(header.objects_end.saturating_sub(batch_start));
            let n = source.read_at(base + batch_start, &mut batch[..batch_len as usize]);
            if (n as u64) < batch_len {
                return Err(GraphPackError::Format(format!(
                    "Object region is truncated at {}",
                    batch_start + n as u64
                )));
            }
            batches += 1;
        }

        let start = (export.offset - batch_start) as usize;
        let data = batch
            .get(start..start + export.size as usize)
            .ok_or_else(|| GraphPackError::Format(format!("{object:?} lies outside the object region")))?;
        if protected {
            let crc = crc32fast::hash(data);
            if crc != export.crc {
                return Err(GraphPackError::Integrity(format!(
                    "{object:?} at {} has CRC 0x{crc:08X}, expected 0x{:08X}",
                    export.offset, export.crc
                )));
            }
        }

        let mut reader = Reader::new(data, refs, protected);
        object.read_binary(&mut reader)?;
        reader.finish()?;
    }

    debug!("Read object region in {batches} batches of up to {capacity} bytes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_cover_small_regions_in_one_read() {
        assert_eq!(batch_capacity(100, 100), BLOCK_SIZE * 2);
        assert_eq!(batch_capacity(DEFAULT_LOAD_BUFFER_SIZE, 10), DEFAULT_LOAD_BUFFER_SIZE + BLOCK_SIZE);
    }

    #[test]
    fn large_objects_grow_the_batch() {
        let region = DEFAULT_LOAD_BUFFER_SIZE * 4;
        assert_eq!(batch_capacity(region, 1), DEFAULT_LOAD_BUFFER_SIZE);
        let big = DEFAULT_LOAD_BUFFER_SIZE * 2 + 1;
        let capacity = batch_capacity(region, big);
        assert!(capacity >= big + BLOCK_SIZE);
        assert_eq!(capacity % BLOCK_SIZE, 0);
    }
}
