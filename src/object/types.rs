//! Type metadata: value kinds, classes and their properties.
//!
//! This is the minimal reflection layer the serializer needs: every class has a name and
//! an ordered list of named, typed properties. Type identity is the type *name*, which is
//! what ends up in the file tables.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::Name;
use super::object::Object;

/// The kind of value a property holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// `bool`
    Bool,
    /// `i64`
    Int,
    /// `f64`
    Float,
    /// UTF-8 text.
    Text,
    /// An identifier stored through the name table.
    Name,
    /// Opaque bytes stored inline.
    Bytes,
    /// A pointer to another object of the graph.
    Object,
    /// A reference to an external resource loaded together with the file.
    Resource,
    /// A reference to an external resource that may be loaded later.
    AsyncResource,
    /// A large payload stored through the buffer table.
    Buffer,
    /// A homogeneous array.
    Array(Box<ValueKind>),
}

/// Deepest array nesting accepted in a type name.
pub const MAX_ARRAY_DEPTH: usize = 64;

impl ValueKind {
    /// The name of this kind as written to the type table.
    pub fn type_name(&self) -> String {
        match self {
            Self::Bool => "bool".into(),
            Self::Int => "int".into(),
            Self::Float => "float".into(),
            Self::Text => "text".into(),
            Self::Name => "name".into(),
            Self::Bytes => "bytes".into(),
            Self::Object => "ptr".into(),
            Self::Resource => "resource".into(),
            Self::AsyncResource => "async_resource".into(),
            Self::Buffer => "buffer".into(),
            Self::Array(inner) => format!("array<{}>", inner.type_name()),
        }
    }

    /// Parses a type name produced by [`ValueKind::type_name`].
    ///
    /// Arrays nest at most [`MAX_ARRAY_DEPTH`] levels deep.
    pub fn parse(name: &str) -> Option<Self> {
        let mut inner = name;
        let mut depth = 0;
        while let Some(rest) = inner.strip_prefix("array<") {
            depth += 1;
            if depth > MAX_ARRAY_DEPTH {
                return None;
            }
            inner = rest.strip_suffix('>')?;
        }

        let leaf = Self::parse_leaf(inner)?;
        Some((0..depth).fold(leaf, |kind, _| Self::Array(Box::new(kind))))
    }

    fn parse_leaf(name: &str) -> Option<Self> {
        Some(match name {
            "bool" => Self::Bool,
            "int" => Self::Int,
            "float" => Self::Float,
            "text" => Self::Text,
            "name" => Self::Name,
            "bytes" => Self::Bytes,
            "ptr" => Self::Object,
            "resource" => Self::Resource,
            "async_resource" => Self::AsyncResource,
            "buffer" => Self::Buffer,
            _ => return None,
        })
    }
}

/// A named, typed property of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    owner: Name,
    name: Name,
    kind: ValueKind,
    index: usize,
}

impl Property {
    /// Name of the class declaring this property.
    pub fn owner(&self) -> &Name {
        &self.owner
    }

    /// Property name.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Value kind.
    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    /// Position of the property inside its class.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identity of the property across processes: `(class name, property name)`.
    pub fn key(&self) -> PropertyKey {
        PropertyKey {
            owner: self.owner.clone(),
            name: self.name.clone(),
        }
    }
}

/// Identity of a property: owning class name plus property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyKey {
    /// Owning class name.
    pub owner: Name,
    /// Property name.
    pub name: Name,
}

/// Callback invoked once per loaded object after the whole graph has been populated.
pub type PostLoadHook = Arc<dyn Fn(&Object) + Send + Sync>;

/// A class: a named list of properties, optionally abstract.
pub struct ClassType {
    name: Name,
    properties: Vec<Arc<Property>>,
    is_abstract: bool,
    post_load: Option<PostLoadHook>,
}

impl ClassType {
    /// Starts declaring a class.
    pub fn builder(name: &str) -> ClassBuilder {
        ClassBuilder {
            name: Name::new(name),
            properties: Vec::new(),
            is_abstract: false,
            post_load: None,
        }
    }

    /// Class name.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Properties in declaration order.
    pub fn properties(&self) -> &[Arc<Property>] {
        &self.properties
    }

    /// Finds a property by name.
    pub fn find_property(&self, name: &str) -> Option<&Arc<Property>> {
        self.properties.iter().find(|p| p.name.as_str() == name)
    }

    /// Abstract classes cannot be instantiated by the loader.
    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub(crate) fn post_load_hook(&self) -> Option<&PostLoadHook> {
        self.post_load.as_ref()
    }
}

impl fmt::Debug for ClassType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassType")
            .field("name", &self.name)
            .field("properties", &self.properties.len())
            .field("is_abstract", &self.is_abstract)
            .finish()
    }
}

/// Builder returned by [`ClassType::builder`].
pub struct ClassBuilder {
    name: Name,
    properties: Vec<Arc<Property>>,
    is_abstract: bool,
    post_load: Option<PostLoadHook>,
}

impl ClassBuilder {
    /// Declares a property. Redeclaring a name replaces its kind.
    pub fn property(mut self, name: &str, kind: ValueKind) -> Self {
        if let Some(existing) = self.properties.iter_mut().find(|p| p.name.as_str() == name) {
            *existing = Arc::new(Property {
                owner: self.name.clone(),
                name: Name::new(name),
                kind,
                index: existing.index,
            });
            return self;
        }

        let index = self.properties.len();
        self.properties.push(Arc::new(Property {
            owner: self.name.clone(),
            name: Name::new(name),
            kind,
            index,
        }));
        self
    }

    /// Marks the class abstract.
    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Installs a hook run by the loader's post-load pass.
    pub fn on_post_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Object) + Send + Sync + 'static,
    {
        self.post_load = Some(Arc::new(hook));
        self
    }

    /// Finishes the declaration.
    pub fn build(self) -> Arc<ClassType> {
        Arc::new(ClassType {
            name: self.name,
            properties: self.properties,
            is_abstract: self.is_abstract,
            post_load: self.post_load,
        })
    }
}

/// A runtime type: either a value kind or a class.
///
/// Two types are equal when their names are equal.
#[derive(Debug, Clone)]
pub enum Type {
    /// A property value kind.
    Value(ValueKind),
    /// An object class.
    Class(Arc<ClassType>),
}

impl Type {
    /// The name written to the type table.
    pub fn name(&self) -> Name {
        match self {
            Self::Value(kind) => Name::from(kind.type_name()),
            Self::Class(class) => class.name().clone(),
        }
    }

    /// Returns the class, if this is a class type.
    pub fn as_class(&self) -> Option<&Arc<ClassType>> {
        match self {
            Self::Class(class) => Some(class),
            Self::Value(_) => None,
        }
    }

    /// Returns the value kind, if this is a value type.
    pub fn as_value(&self) -> Option<&ValueKind> {
        match self {
            Self::Value(kind) => Some(kind),
            Self::Class(_) => None,
        }
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for Type {}

impl Hash for Type {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_kind_names_parse_back() {
        let kind = ValueKind::Array(Box::new(ValueKind::Array(Box::new(ValueKind::Object))));
        assert_eq!(kind.type_name(), "array<array<ptr>>");
        assert_eq!(ValueKind::parse(&kind.type_name()), Some(kind));
        assert_eq!(ValueKind::parse("array<"), None);
        assert_eq!(ValueKind::parse("Mesh"), None);
    }

    #[test]
    fn array_nesting_is_capped() {
        let nested = |depth: usize| format!("{}int{}", "array<".repeat(depth), ">".repeat(depth));
        assert!(ValueKind::parse(&nested(MAX_ARRAY_DEPTH)).is_some());
        assert_eq!(ValueKind::parse(&nested(MAX_ARRAY_DEPTH + 1)), None);
        assert_eq!(ValueKind::parse(&nested(200_000)), None);
        assert_eq!(ValueKind::parse("array<int>>"), None);
    }

    #[test]
    fn redeclared_property_keeps_its_slot() {
        let class = ClassType::builder("Node")
            .property("a", ValueKind::Int)
            .property("b", ValueKind::Text)
            .property("a", ValueKind::Float)
            .build();

        assert_eq!(class.properties().len(), 2);
        let a = class.find_property("a").map(|p| (p.index(), p.kind().clone()));
        assert_eq!(a, Some((0, ValueKind::Float)));
        assert_eq!(class.find_property("b").map(|p| p.owner().as_str()), Some("Node"));
    }

    #[test]
    fn types_compare_by_name() {
        let class = ClassType::builder("int").build();
        assert_eq!(Type::Class(class), Type::Value(ValueKind::Int));
    }
}
