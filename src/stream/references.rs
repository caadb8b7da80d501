//! Per-object reference sets gathered while writing.

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use crate::buffer::AsyncBuffer;
use crate::object::{Name, ObjectKey, ObjectPtr, Property, PropertyKey, Type};
use crate::resource::{ResourceKey, ResourceRef};

/// Distinct entities referenced while writing one object.
///
/// Every set keeps the first occurrence and iterates in insertion order, which is what
/// makes the merged file tables deterministic.
#[derive(Debug, Default)]
pub struct ReferenceCollector {
    names: IndexSet<Name>,
    types: IndexMap<Name, Type>,
    properties: IndexMap<PropertyKey, Arc<Property>>,
    objects: IndexMap<ObjectKey, ObjectPtr>,
    sync_resources: IndexMap<ResourceKey, ResourceRef>,
    async_resources: IndexMap<ResourceKey, ResourceRef>,
    buffers: IndexMap<u64, AsyncBuffer>,
}

impl ReferenceCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_name(&mut self, name: &Name) {
        if !self.names.contains(name) {
            self.names.insert(name.clone());
        }
    }

    pub(crate) fn add_type(&mut self, ty: &Type) {
        self.types.entry(ty.name()).or_insert_with(|| ty.clone());
    }

    pub(crate) fn add_property(&mut self, property: &Arc<Property>) {
        self.properties
            .entry(property.key())
            .or_insert_with(|| property.clone());
    }

    pub(crate) fn add_object(&mut self, object: &ObjectPtr) {
        self.objects
            .entry(ObjectKey::of(object))
            .or_insert_with(|| object.clone());
    }

    pub(crate) fn add_resource(&mut self, resource: &ResourceRef, is_async: bool) {
        let set = if is_async {
            &mut self.async_resources
        } else {
            &mut self.sync_resources
        };
        set.entry(resource.key()).or_insert_with(|| resource.clone());
    }

    pub(crate) fn add_buffer(&mut self, buffer: &AsyncBuffer) {
        self.buffers
            .entry(buffer.content_crc())
            .or_insert_with(|| buffer.clone());
    }

    /// Identifiers written with `write_string_id`.
    pub fn names(&self) -> impl Iterator<Item = &Name> {
        self.names.iter()
    }

    /// Types written with `write_type` or as compound types.
    pub fn types(&self) -> impl Iterator<Item = &Type> {
        self.types.values()
    }

    /// Properties written with `write_property`.
    pub fn properties(&self) -> impl Iterator<Item = &Arc<Property>> {
        self.properties.values()
    }

    /// Non-null object pointers.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectPtr> {
        self.objects.values()
    }

    /// Resources that must be loaded together with the file.
    pub fn sync_resources(&self) -> impl Iterator<Item = &ResourceRef> {
        self.sync_resources.values()
    }

    /// Resources that may be loaded later.
    pub fn async_resources(&self) -> impl Iterator<Item = &ResourceRef> {
        self.async_resources.values()
    }

    /// Async buffers, keyed by content hash.
    pub fn buffers(&self) -> impl Iterator<Item = &AsyncBuffer> {
        self.buffers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn first_seen_wins_and_order_is_kept() {
        let mut refs = ReferenceCollector::new();
        refs.add_name(&Name::new("b"));
        refs.add_name(&Name::new("a"));
        refs.add_name(&Name::new("b"));
        let names: Vec<&str> = refs.names().map(Name::as_str).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn resources_are_split_by_loading_mode() {
        let mut refs = ReferenceCollector::new();
        let texture = ResourceRef::new(Uuid::from_u128(1), "Texture");
        refs.add_resource(&texture, false);
        refs.add_resource(&texture, true);
        refs.add_resource(&texture, false);
        assert_eq!(refs.sync_resources().count(), 1);
        assert_eq!(refs.async_resources().count(), 1);
    }

    #[test]
    fn buffers_dedup_by_content() {
        let mut refs = ReferenceCollector::new();
        refs.add_buffer(&AsyncBuffer::from_bytes(vec![1, 2, 3]));
        refs.add_buffer(&AsyncBuffer::from_bytes(vec![1, 2, 3]));
        refs.add_buffer(&AsyncBuffer::from_bytes(vec![4]));
        assert_eq!(refs.buffers().count(), 2);
    }
}
