//! The dynamic object model: names, classes, values and live objects.
//!
//! Classes are declared at runtime and registered in a [`TypeRegistry`], which every load
//! receives explicitly. Objects carry their class, so saving needs no registry.

mod name;
#[allow(clippy::module_inception)]
mod object;
mod registry;
mod types;
mod value;

pub use name::Name;
pub use object::{Object, ObjectKey, ObjectPtr};
pub use registry::TypeRegistry;
pub use types::{ClassBuilder, ClassType, MAX_ARRAY_DEPTH, PostLoadHook, Property, PropertyKey, Type, ValueKind};
pub use value::Value;
