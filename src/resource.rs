//! References to resources living outside the file being saved (imports).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::object::Name;

/// A loaded external resource, as produced by a [`ResourceLoader`].
pub type ResourceHandle = Arc<dyn Any + Send + Sync>;

/// A reference to an external resource: its id and the name of its class.
///
/// After a load with `load_imports` enabled, references to eagerly loaded imports also
/// carry the loaded [`ResourceHandle`]. Equality ignores the handle.
#[derive(Clone)]
pub struct ResourceRef {
    id: Uuid,
    class: Name,
    handle: Option<ResourceHandle>,
}

impl ResourceRef {
    /// Creates an unloaded reference.
    pub fn new(id: Uuid, class: impl Into<Name>) -> Self {
        Self {
            id,
            class: class.into(),
            handle: None,
        }
    }

    /// Attaches a loaded resource.
    pub fn with_handle(mut self, handle: ResourceHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Resource id.
    pub fn id(&self) -> &Uuid {
        &self.id
    }

    /// Resource class name.
    pub fn class(&self) -> &Name {
        &self.class
    }

    /// The loaded resource, if it was resolved during load.
    pub fn handle(&self) -> Option<&ResourceHandle> {
        self.handle.as_ref()
    }

    /// Returns true if a loaded resource is attached.
    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    /// Dedup key of this reference.
    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            id: self.id,
            class: self.class.clone(),
        }
    }
}

impl PartialEq for ResourceRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.class == other.class
    }
}

impl fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRef")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Identity of an import: resource id plus class name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// Resource id.
    pub id: Uuid,
    /// Resource class name.
    pub class: Name,
}

/// Resolves imports flagged for eager loading.
///
/// Called concurrently from the loader's import stage, one call per import.
pub trait ResourceLoader: Send + Sync {
    /// Loads the resource `id` of class `class`.
    fn load_resource(&self, id: &Uuid, class: &Name) -> Result<ResourceHandle>;
}
