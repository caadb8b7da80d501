//! Write-side file tables.
//!
//! The [`TableBuilder`] merges the reference collectors of every saved object into one set
//! of deduplicated tables. Merge order is fixed (objects in export order; per object:
//! names, types, properties, sync imports, async imports), so an unchanged graph always
//! maps to the same indices and the same bytes.

use std::collections::{BTreeMap, HashMap};

use indexmap::IndexMap;
use indexmap::map::Entry;
use tracing::debug;

use crate::buffer::AsyncBuffer;
use crate::compression::CompressionKind;
use crate::error::{GraphPackError, Result};
use crate::format::{
    BufferEntry, ChunkKind, ChunkRecord, ExportEntry, HEADER_SIZE, Header, IMPORT_LOAD_EAGERLY,
    ImportEntry, NameEntry, PropertyEntry, TableEntry, TypeEntry, write_table,
};
use crate::object::{Name, ObjectKey, ObjectPtr, Property, PropertyKey, Type};
use crate::resource::{ResourceKey, ResourceRef};
use crate::stream::{ObjectSpan, ReferenceCollector, ReferenceMapping};

/// Deduplicating builder of the seven file tables.
#[derive(Debug)]
pub struct TableBuilder {
    strings: Vec<u8>,
    string_offsets: HashMap<Name, u32>,
    names: IndexMap<Name, NameEntry>,
    types: IndexMap<Name, TypeEntry>,
    properties: IndexMap<PropertyKey, PropertyEntry>,
    imports: IndexMap<ResourceKey, ImportEntry>,
    exports: Vec<ExportEntry>,
    export_index: HashMap<ObjectKey, u32>,
    pending_buffers: BTreeMap<u64, AsyncBuffer>,
    buffers: Vec<(BufferEntry, AsyncBuffer)>,
    buffer_index: HashMap<u64, u32>,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Creates a builder holding only the sentinels.
    pub fn new() -> Self {
        let empty = Name::empty();
        Self {
            strings: vec![0],
            string_offsets: HashMap::from([(empty.clone(), 0)]),
            names: IndexMap::from([(empty.clone(), NameEntry { string_offset: 0 })]),
            types: IndexMap::from([(empty, TypeEntry { name: 0 })]),
            properties: IndexMap::new(),
            imports: IndexMap::new(),
            exports: Vec::new(),
            export_index: HashMap::new(),
            pending_buffers: BTreeMap::new(),
            buffers: Vec::new(),
            buffer_index: HashMap::new(),
        }
    }

    /// Offset of `text` in the strings table.
    pub fn map_string(&mut self, text: &Name) -> u32 {
        if let Some(offset) = self.string_offsets.get(text) {
            return *offset;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(text.as_str().as_bytes());
        self.strings.push(0);
        self.string_offsets.insert(text.clone(), offset);
        offset
    }

    /// Index of `name` in the names table; 0 for the empty name.
    pub fn map_name(&mut self, name: &Name) -> u32 {
        if let Some(index) = self.names.get_index_of(name) {
            return index as u32;
        }
        let string_offset = self.map_string(name);
        let (index, _) = self
            .names
            .insert_full(name.clone(), NameEntry { string_offset });
        index as u32
    }

    /// Index of the type named `name`; 0 for the empty name.
    pub fn map_type_name(&mut self, name: &Name) -> u32 {
        if let Some(index) = self.types.get_index_of(name) {
            return index as u32;
        }
        let entry = TypeEntry {
            name: self.map_name(name),
        };
        let (index, _) = self.types.insert_full(name.clone(), entry);
        index as u32
    }

    /// Index of `ty` in the types table.
    pub fn map_type(&mut self, ty: &Type) -> u32 {
        self.map_type_name(&ty.name())
    }

    /// 1-based index of `property`.
    pub fn map_property(&mut self, property: &Property) -> u32 {
        let key = property.key();
        if let Some(index) = self.properties.get_index_of(&key) {
            return index as u32 + 1;
        }
        let entry = PropertyEntry {
            class_type: self.map_type_name(property.owner()),
            name: self.map_name(property.name()),
        };
        let (index, _) = self.properties.insert_full(key, entry);
        index as u32 + 1
    }

    /// 1-based index of `resource`. A resource mapped eagerly at least once keeps the
    /// load-eagerly flag.
    pub fn map_import(&mut self, resource: &ResourceRef, eager: bool) -> u32 {
        let flags = if eager { IMPORT_LOAD_EAGERLY } else { 0 };
        let index = match self.imports.entry(resource.key()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().flags |= flags;
                entry.index()
            }
            Entry::Vacant(entry) => {
                let index = entry.index();
                entry.insert(ImportEntry {
                    id: *resource.id(),
                    class_type: 0,
                    flags,
                });
                index
            }
        };
        let class_type = self.map_type_name(resource.class());
        if let Some((_, entry)) = self.imports.get_index_mut(index) {
            entry.class_type = class_type;
        }
        index as u32 + 1
    }

    /// Merges one object's references.
    pub fn add_references(&mut self, references: &ReferenceCollector) {
        for name in references.names() {
            self.map_name(name);
        }
        for ty in references.types() {
            self.map_type(ty);
        }
        for property in references.properties() {
            self.map_property(property);
        }
        for resource in references.sync_resources() {
            self.map_import(resource, true);
        }
        for resource in references.async_resources() {
            self.map_import(resource, false);
        }
        for buffer in references.buffers() {
            self.pending_buffers
                .entry(buffer.content_crc())
                .or_insert_with(|| buffer.clone());
        }
    }

    /// Assigns export indices in `objects` order and resolves parent indices.
    ///
    /// Parents must precede their children in `objects`.
    pub fn assign_exports(&mut self, objects: &[ObjectPtr]) -> Result<()> {
        for object in objects {
            let class_type = self.map_type_name(object.class().name());
            let parent = object
                .parent()
                .and_then(|p| self.export_index.get(&ObjectKey::of(&p)).copied())
                .unwrap_or(0);

            self.exports.push(ExportEntry {
                class_type,
                parent,
                ..ExportEntry::default()
            });
            let index = self.exports.len() as u32;
            if self.export_index.insert(ObjectKey::of(object), index).is_some() {
                return Err(GraphPackError::Internal(format!(
                    "Object {object:?} appears twice in the export list"
                )));
            }
        }
        Ok(())
    }

    /// Records where export `index` (0-based) was written.
    pub fn set_export_span(&mut self, index: usize, span: ObjectSpan) -> Result<()> {
        let entry = self
            .exports
            .get_mut(index)
            .ok_or_else(|| GraphPackError::Internal(format!("Export {index} does not exist")))?;
        entry.offset = span.offset;
        entry.size = span.size;
        entry.crc = span.crc;
        Ok(())
    }

    /// Assigns buffer indices in content-hash order. Call after every object's references
    /// were added.
    pub fn seal_buffers(&mut self) {
        for (hash, buffer) in std::mem::take(&mut self.pending_buffers) {
            self.buffers.push((
                BufferEntry {
                    hash,
                    size: buffer.size(),
                    ..BufferEntry::default()
                },
                buffer,
            ));
            self.buffer_index.insert(hash, self.buffers.len() as u32);
        }
    }

    /// Records where buffer `index` (0-based) was written.
    pub fn set_buffer_data(
        &mut self,
        index: usize,
        offset: u64,
        stored_size: u64,
        kind: CompressionKind,
    ) -> Result<()> {
        let (entry, _) = self
            .buffers
            .get_mut(index)
            .ok_or_else(|| GraphPackError::Internal(format!("Buffer {index} does not exist")))?;
        entry.offset = offset;
        entry.stored_size = stored_size;
        entry.compression = kind.as_u32();
        Ok(())
    }

    /// Buffers in table order.
    pub fn buffers(&self) -> impl Iterator<Item = &AsyncBuffer> {
        self.buffers.iter().map(|(_, buffer)| buffer)
    }

    /// Imports in table order.
    pub fn imports(&self) -> impl Iterator<Item = (&ResourceKey, &ImportEntry)> {
        self.imports.iter()
    }

    /// Number of exports.
    pub fn export_count(&self) -> usize {
        self.exports.len()
    }

    /// Size of the header plus all tables, which is where object data starts.
    pub fn headers_end(&self) -> u64 {
        (HEADER_SIZE
            + self.strings.len()
            + self.names.len() * NameEntry::SIZE
            + self.types.len() * TypeEntry::SIZE
            + self.properties.len() * PropertyEntry::SIZE
            + self.imports.len() * ImportEntry::SIZE
            + self.exports.len() * ExportEntry::SIZE
            + self.buffers.len() * BufferEntry::SIZE) as u64
    }

    /// Serializes the header and the tables.
    pub fn encode(&self, flags: u32, objects_end: u64, buffers_end: u64) -> Result<Vec<u8>> {
        let names: Vec<NameEntry> = self.names.values().copied().collect();
        let types: Vec<TypeEntry> = self.types.values().copied().collect();
        let properties: Vec<PropertyEntry> = self.properties.values().copied().collect();
        let imports: Vec<ImportEntry> = self.imports.values().copied().collect();
        let buffers: Vec<BufferEntry> = self.buffers.iter().map(|(entry, _)| *entry).collect();

        let tables: [(Vec<u8>, usize); 7] = [
            (self.strings.clone(), self.strings.len()),
            (write_table(&names), names.len()),
            (write_table(&types), types.len()),
            (write_table(&properties), properties.len()),
            (write_table(&imports), imports.len()),
            (write_table(&self.exports), self.exports.len()),
            (write_table(&buffers), buffers.len()),
        ];

        let mut header = Header::new(flags);
        let mut body = Vec::new();
        for (kind, (bytes, count)) in ChunkKind::ALL.into_iter().zip(tables.iter()) {
            let offset = u32::try_from(HEADER_SIZE + body.len())
                .map_err(|_| GraphPackError::Internal("File tables exceed 4 GiB".into()))?;
            header.chunks[kind as usize] = ChunkRecord {
                offset,
                size: bytes.len() as u32,
                count: *count as u32,
                crc: crc32fast::hash(bytes),
            };
            debug!("{kind:?} table: {count} entries, {} bytes", bytes.len());
            body.extend_from_slice(bytes);
        }

        header.headers_end = (HEADER_SIZE + body.len()) as u64;
        header.objects_end = objects_end;
        header.buffers_end = buffers_end;

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl ReferenceMapping for TableBuilder {
    fn name_index(&self, name: &Name) -> Result<u32> {
        self.names
            .get_index_of(name)
            .map(|i| i as u32)
            .ok_or_else(|| missing("name", name))
    }

    fn type_index(&self, ty: &Type) -> Result<u32> {
        let name = ty.name();
        self.types
            .get_index_of(&name)
            .map(|i| i as u32)
            .ok_or_else(|| missing("type", &name))
    }

    fn property_index(&self, property: &Property) -> Result<u32> {
        self.properties
            .get_index_of(&property.key())
            .map(|i| i as u32 + 1)
            .ok_or_else(|| missing("property", property.name()))
    }

    fn object_index(&self, object: &ObjectPtr) -> u32 {
        self.export_index
            .get(&ObjectKey::of(object))
            .copied()
            .unwrap_or(0)
    }

    fn import_index(&self, resource: &ResourceRef) -> Result<u32> {
        self.imports
            .get_index_of(&resource.key())
            .map(|i| i as u32 + 1)
            .ok_or_else(|| missing("import", &Name::from(resource.id().to_string())))
    }

    fn buffer_index(&self, buffer: &AsyncBuffer) -> Result<u32> {
        self.buffer_index
            .get(&buffer.content_crc())
            .copied()
            .ok_or_else(|| {
                missing(
                    "buffer",
                    &Name::from(format!("{:016X}", buffer.content_crc())),
                )
            })
    }
}

fn missing(what: &str, key: &Name) -> GraphPackError {
    GraphPackError::Internal(format!("No {what} mapping for '{key}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FileTables;
    use crate::object::{ClassType, Object, ValueKind};
    use uuid::Uuid;

    #[test]
    fn sentinels_and_dedup() {
        let mut tables = TableBuilder::new();
        assert_eq!(tables.map_name(&Name::empty()), 0);
        assert_eq!(tables.map_type_name(&Name::empty()), 0);

        let a = tables.map_name(&Name::new("a"));
        assert_eq!(tables.map_name(&Name::new("a")), a);
        assert_eq!(a, 1);

        // A type shares the name entry and string of an identical identifier.
        assert_eq!(tables.map_type_name(&Name::new("a")), 1);
        assert_eq!(tables.names.len(), 2);
        assert_eq!(tables.strings, b"\0a\0".to_vec());
    }

    #[test]
    fn properties_map_their_owner_first() {
        let class = ClassType::builder("Mesh").property("lod", ValueKind::Int).build();
        let mut tables = TableBuilder::new();
        let Some(lod) = class.find_property("lod") else {
            return;
        };
        assert_eq!(tables.map_property(lod), 1);
        assert_eq!(tables.map_property(lod), 1);

        let entry = tables.properties[0];
        assert_eq!(tables.types.get_index_of("Mesh"), Some(entry.class_type as usize));
        assert_eq!(tables.names.get_index_of("lod"), Some(entry.name as usize));
    }

    #[test]
    fn sync_reference_upgrades_async_import() {
        let texture = ResourceRef::new(Uuid::from_u128(7), "Texture");
        let mut tables = TableBuilder::new();
        assert_eq!(tables.map_import(&texture, false), 1);
        assert_eq!(tables.map_import(&texture, true), 1);
        assert_eq!(tables.map_import(&texture, false), 1);

        let entry = tables.imports().next().map(|(_, e)| *e).unwrap_or_default();
        assert!(entry.load_eagerly());
        assert_eq!(tables.imports().count(), 1);
    }

    #[test]
    fn parents_resolve_to_earlier_exports() -> Result<()> {
        let class = ClassType::builder("Node").build();
        let outside = Object::new(&class);
        let root = Object::new_child(&class, &outside);
        let child = Object::new_child(&class, &root);

        let mut tables = TableBuilder::new();
        tables.assign_exports(&[root.clone(), child.clone()])?;
        assert_eq!(tables.exports[0].parent, 0);
        assert_eq!(tables.exports[1].parent, 1);
        assert_eq!(tables.object_index(&child), 2);
        assert_eq!(tables.object_index(&outside), 0);
        assert!(tables.assign_exports(&[root]).is_err());
        Ok(())
    }

    #[test]
    fn buffers_are_sorted_by_hash() {
        let mut refs = ReferenceCollector::new();
        let buffers: Vec<AsyncBuffer> = (0u8..5).map(|i| AsyncBuffer::from_bytes(vec![i; 8])).collect();
        for buffer in &buffers {
            refs.add_buffer(buffer);
        }
        let mut tables = TableBuilder::new();
        tables.add_references(&refs);
        tables.add_references(&refs);
        tables.seal_buffers();

        let hashes: Vec<u64> = tables.buffers().map(AsyncBuffer::content_crc).collect();
        assert_eq!(hashes.len(), 5);
        assert!(hashes.windows(2).all(|w| w[0] < w[1]));
        for buffer in &buffers {
            let index = tables.buffer_index(buffer).unwrap_or(0);
            assert_eq!(hashes[index as usize - 1], buffer.content_crc());
        }
    }

    #[test]
    fn encoded_tables_validate() -> Result<()> {
        let class = ClassType::builder("Node").build();
        let root = Object::new(&class);
        let mut tables = TableBuilder::new();
        tables.assign_exports(&[root])?;
        let end = tables.headers_end();
        tables.set_export_span(
            0,
            ObjectSpan {
                offset: end,
                size: 0,
                crc: 0,
            },
        )?;

        let bytes = tables.encode(0, end, end)?;
        assert_eq!(bytes.len() as u64, end);
        let parsed = FileTables::parse(&bytes, true)?;
        assert_eq!(parsed.type_name(parsed.exports[0].class_type)?, "Node");
        Ok(())
    }
}
