use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use super::Name;
use super::types::{ClassType, Type, ValueKind};

/// The set of classes known to this process.
///
/// Built once at startup and passed explicitly to every load. Saving does not need it:
/// objects carry their own class.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    classes: IndexMap<Name, Arc<ClassType>>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a class, replacing any previous class of the same name.
    pub fn register(&mut self, class: Arc<ClassType>) -> Arc<ClassType> {
        if ValueKind::parse(class.name().as_str()).is_some() {
            warn!(
                "Class '{}' shadows a builtin value type name and will never be resolved",
                class.name()
            );
        }
        self.classes.insert(class.name().clone(), class.clone());
        class
    }

    /// Finds a class by name.
    pub fn find_class(&self, name: &str) -> Option<&Arc<ClassType>> {
        self.classes.get(name)
    }

    /// Resolves a type name: builtin value kinds first, then classes.
    pub fn find_type(&self, name: &str) -> Option<Type> {
        if let Some(kind) = ValueKind::parse(name) {
            return Some(Type::Value(kind));
        }
        self.find_class(name).map(|class| Type::Class(class.clone()))
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns true if no class is registered.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtins_and_classes() {
        let mut registry = TypeRegistry::new();
        registry.register(ClassType::builder("Mesh").property("lod", ValueKind::Int).build());

        assert!(matches!(registry.find_type("int"), Some(Type::Value(ValueKind::Int))));
        assert!(matches!(registry.find_type("array<text>"), Some(Type::Value(ValueKind::Array(_)))));
        assert!(registry.find_type("Mesh").and_then(|t| t.as_class().cloned()).is_some());
        assert!(registry.find_type("Texture").is_none());
    }
}
