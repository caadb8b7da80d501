//! Live objects of the graph.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{GraphPackError, Result};
use crate::stream::{Reader, Writer};

use super::types::{ClassType, Type};
use super::value::Value;

/// Shared handle to an object. Pointers between objects are `ObjectPtr`s, parent links
/// are weak.
pub type ObjectPtr = Arc<Object>;

/// Identity of a live object, valid while a strong reference to it is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(usize);

impl ObjectKey {
    /// Key of `object`.
    pub fn of(object: &ObjectPtr) -> Self {
        Self(Arc::as_ptr(object) as usize)
    }
}

/// An instance of a [`ClassType`]: one value per declared property plus a parent link.
pub struct Object {
    class: Arc<ClassType>,
    parent: RwLock<Weak<Object>>,
    values: RwLock<Vec<Value>>,
    load_path: RwLock<Option<String>>,
    post_loaded: AtomicBool,
}

impl Object {
    /// Creates a parentless object with default property values.
    pub fn new(class: &Arc<ClassType>) -> ObjectPtr {
        Arc::new(Self {
            class: class.clone(),
            parent: RwLock::new(Weak::new()),
            values: RwLock::new(
                class
                    .properties()
                    .iter()
                    .map(|p| Value::default_for(p.kind()))
                    .collect(),
            ),
            load_path: RwLock::new(None),
            post_loaded: AtomicBool::new(false),
        })
    }

    /// Creates an object parented to `parent`.
    pub fn new_child(class: &Arc<ClassType>, parent: &ObjectPtr) -> ObjectPtr {
        let object = Self::new(class);
        object.set_parent(Some(parent));
        object
    }

    /// The object's class.
    pub fn class(&self) -> &Arc<ClassType> {
        &self.class
    }

    /// The parent, if it is still alive.
    pub fn parent(&self) -> Option<ObjectPtr> {
        self.parent.read().upgrade()
    }

    /// Re-parents the object.
    pub fn set_parent(&self, parent: Option<&ObjectPtr>) {
        *self.parent.write() = parent.map(Arc::downgrade).unwrap_or_default();
    }

    /// Returns true if `ancestor` is this object or one of its ancestors.
    pub fn is_descendant_of(self: &Arc<Self>, ancestor: &ObjectPtr) -> bool {
        let mut current = Some(self.clone());
        while let Some(object) = current {
            if Arc::ptr_eq(&object, ancestor) {
                return true;
            }
            current = object.parent();
        }
        false
    }

    /// Reads a property value.
    pub fn get(&self, property: &str) -> Option<Value> {
        let index = self.class.find_property(property)?.index();
        self.values.read().get(index).cloned()
    }

    /// Assigns a property value.
    ///
    /// # Errors
    /// Returns `GraphPackError::Internal` if the class has no such property or the value
    /// does not fit its kind.
    pub fn set(&self, property: &str, value: Value) -> Result<()> {
        let property = self.class.find_property(property).ok_or_else(|| {
            GraphPackError::Internal(format!(
                "Class '{}' has no property '{property}'",
                self.class.name()
            ))
        })?;
        if !value.matches(property.kind()) {
            return Err(GraphPackError::Internal(format!(
                "Value {value:?} does not fit property '{}' of kind '{}'",
                property.name(),
                property.kind().type_name()
            )));
        }

        if let Some(slot) = self.values.write().get_mut(property.index()) {
            *slot = value;
        }
        Ok(())
    }

    /// Resource path this object was loaded from, if it is the main export of a file.
    pub fn load_path(&self) -> Option<String> {
        self.load_path.read().clone()
    }

    pub(crate) fn set_load_path(&self, path: &str) {
        *self.load_path.write() = Some(path.to_owned());
    }

    /// Returns true once the post-load pass has visited this object.
    pub fn is_post_loaded(&self) -> bool {
        self.post_loaded.load(Ordering::Acquire)
    }

    /// Runs the class's post-load hook, at most once per object.
    pub(crate) fn on_post_load(&self) {
        if self.post_loaded.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hook) = self.class.post_load_hook() {
            hook(self);
        }
    }

    /// Writes the object as a compound of one skip block per property:
    /// `{PropertyRef, TypeRef(kind), value}`.
    pub(crate) fn write_binary(&self, writer: &mut Writer<'_>) -> Result<()> {
        writer.begin_compound(&Type::Class(self.class.clone()));
        let values = self.values.read();
        for (property, value) in self.class.properties().iter().zip(values.iter()) {
            writer.begin_skip_block();
            writer.write_property(property);
            writer.write_type(&Type::Value(property.kind().clone()));
            value.write(property.kind(), writer)?;
            writer.end_skip_block()?;
        }
        writer.end_compound()
    }

    /// Restores property values written by [`Object::write_binary`].
    ///
    /// Properties that no longer exist or whose kind changed are skipped with a warning;
    /// they keep their default value.
    pub(crate) fn read_binary(&self, reader: &mut Reader<'_>) -> Result<()> {
        let (stored_class, members) = reader.enter_compound()?;
        if stored_class.name != *self.class.name() {
            return Err(GraphPackError::Format(format!(
                "Object data of class '{}' found for an export of class '{}'",
                stored_class.name,
                self.class.name()
            )));
        }

        for _ in 0..members {
            reader.enter_skip_block()?;
            let stored = reader.read_property()?;
            let stored_kind = reader.read_type()?;

            let Some(property) = stored.property.filter(|p| p.owner() == self.class.name()) else {
                warn!(
                    "Property '{}::{}' no longer exists, skipping its data",
                    stored.owner, stored.name
                );
                reader.skip_block()?;
                continue;
            };
            let Some(kind) = stored_kind
                .ty
                .as_ref()
                .and_then(Type::as_value)
                .filter(|k| *k == property.kind())
            else {
                warn!(
                    "Property '{}::{}' changed type from '{}' to '{}', skipping its data",
                    self.class.name(),
                    property.name(),
                    stored_kind.name,
                    property.kind().type_name()
                );
                reader.skip_block()?;
                continue;
            };

            let value = Value::read(kind, reader)?;
            if let Some(slot) = self.values.write().get_mut(property.index()) {
                *slot = value;
            }
            reader.leave_skip_block()?;
        }

        reader.leave_compound()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("class", self.class.name())
            .field("at", &format_args!("{:p}", self))
            .field("has_parent", &self.parent().is_some())
            .finish()
    }
}
