//! Load-side tables that stream indices resolve against.

use std::sync::Arc;

use crate::buffer::AsyncBuffer;
use crate::error::{GraphPackError, Result};
use crate::object::{Name, ObjectPtr, Property, Type};
use crate::resource::ResourceRef;

/// A type table entry after resolution against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedType {
    /// The live type, or `None` if the name is unknown to this process.
    pub ty: Option<Type>,
    /// The stored type name.
    pub name: Name,
}

/// A property table entry after resolution against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedProperty {
    /// The live property, or `None` if its class or the property itself is unknown.
    pub property: Option<Arc<Property>>,
    /// Stored owning class name.
    pub owner: Name,
    /// Stored property name.
    pub name: Name,
}

/// The file tables of one load turned into live values, indexed the way streams refer
/// to them.
#[derive(Debug, Default)]
pub struct ResolvedReferences {
    pub(crate) names: Vec<Name>,
    pub(crate) types: Vec<ResolvedType>,
    pub(crate) properties: Vec<ResolvedProperty>,
    pub(crate) objects: Vec<Option<ObjectPtr>>,
    pub(crate) imports: Vec<Option<ResourceRef>>,
    pub(crate) buffers: Vec<Option<AsyncBuffer>>,
}

impl ResolvedReferences {
    /// Identifier at `index`; 0 is the empty name.
    pub fn name(&self, index: u32) -> Result<&Name> {
        self.names.get(index as usize).ok_or_else(|| out_of_range("name", index))
    }

    /// Type at `index`; 0 is the none sentinel.
    pub fn ty(&self, index: u32) -> Result<&ResolvedType> {
        self.types.get(index as usize).ok_or_else(|| out_of_range("type", index))
    }

    /// Property at 1-based `index`.
    pub fn property(&self, index: u32) -> Result<&ResolvedProperty> {
        one_based(&self.properties, index, "property")?.ok_or_else(|| out_of_range("property", 0))
    }

    /// Object at 1-based `index`; 0 and skipped exports are null.
    pub fn object(&self, index: u32) -> Result<Option<ObjectPtr>> {
        Ok(one_based(&self.objects, index, "object")?.and_then(Clone::clone))
    }

    /// Import at 1-based `index`; 0 and unresolved imports are null.
    pub fn import(&self, index: u32) -> Result<Option<ResourceRef>> {
        Ok(one_based(&self.imports, index, "import")?.and_then(Clone::clone))
    }

    /// Buffer at 1-based `index`; 0 and missing buffers are null.
    pub fn buffer(&self, index: u32) -> Result<Option<AsyncBuffer>> {
        Ok(one_based(&self.buffers, index, "buffer")?.and_then(Clone::clone))
    }
}

fn one_based<'t, T>(table: &'t [T], index: u32, what: &str) -> Result<Option<&'t T>> {
    match index {
        0 => Ok(None),
        i => table
            .get(i as usize - 1)
            .map(Some)
            .ok_or_else(|| out_of_range(what, index)),
    }
}

fn out_of_range(what: &str, index: u32) -> GraphPackError {
    GraphPackError::Format(format!("Stream references {what} {index}, which is out of range"))
}
