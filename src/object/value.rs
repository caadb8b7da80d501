//! Property values and their leaf codecs.
//!
//! Each codec turns one value into primitive writer calls and back. Scalars become raw
//! little-endian bytes; names, pointers, resources and buffers go through the reference
//! opcodes so they end up in the file tables.

use std::sync::Arc;

use crate::buffer::AsyncBuffer;
use crate::error::{GraphPackError, Result};
use crate::resource::ResourceRef;
use crate::stream::{Reader, Writer};

use super::Name;
use super::object::ObjectPtr;
use super::types::ValueKind;

/// A property value.
#[derive(Debug, Clone)]
pub enum Value {
    /// `bool`
    Bool(bool),
    /// `i64`
    Int(i64),
    /// `f64`
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Identifier.
    Name(Name),
    /// Inline bytes.
    Bytes(Vec<u8>),
    /// Pointer to another object, or null.
    Object(Option<ObjectPtr>),
    /// Resource that must be loaded together with the file.
    Resource(Option<ResourceRef>),
    /// Resource that may be loaded later.
    AsyncResource(Option<ResourceRef>),
    /// Large payload.
    Buffer(Option<AsyncBuffer>),
    /// Homogeneous array; the element kind comes from the property.
    Array(Vec<Value>),
}

impl Value {
    /// The value a fresh object holds for a property of `kind`.
    pub fn default_for(kind: &ValueKind) -> Self {
        match kind {
            ValueKind::Bool => Self::Bool(false),
            ValueKind::Int => Self::Int(0),
            ValueKind::Float => Self::Float(0.0),
            ValueKind::Text => Self::Text(String::new()),
            ValueKind::Name => Self::Name(Name::empty()),
            ValueKind::Bytes => Self::Bytes(Vec::new()),
            ValueKind::Object => Self::Object(None),
            ValueKind::Resource => Self::Resource(None),
            ValueKind::AsyncResource => Self::AsyncResource(None),
            ValueKind::Buffer => Self::Buffer(None),
            ValueKind::Array(_) => Self::Array(Vec::new()),
        }
    }

    /// Returns true if this value can be stored in a property of `kind`.
    pub fn matches(&self, kind: &ValueKind) -> bool {
        match (self, kind) {
            (Self::Bool(_), ValueKind::Bool)
            | (Self::Int(_), ValueKind::Int)
            | (Self::Float(_), ValueKind::Float)
            | (Self::Text(_), ValueKind::Text)
            | (Self::Name(_), ValueKind::Name)
            | (Self::Bytes(_), ValueKind::Bytes)
            | (Self::Object(_), ValueKind::Object)
            | (Self::Resource(_), ValueKind::Resource)
            | (Self::AsyncResource(_), ValueKind::AsyncResource)
            | (Self::Buffer(_), ValueKind::Buffer) => true,
            (Self::Array(items), ValueKind::Array(inner)) => items.iter().all(|v| v.matches(inner)),
            _ => false,
        }
    }

    /// Writes this value as a `kind`.
    pub(crate) fn write(&self, kind: &ValueKind, writer: &mut Writer<'_>) -> Result<()> {
        match (self, kind) {
            (Self::Bool(v), ValueKind::Bool) => writer.write_raw(&[u8::from(*v)]),
            (Self::Int(v), ValueKind::Int) => writer.write_raw(&v.to_le_bytes()),
            (Self::Float(v), ValueKind::Float) => writer.write_raw(&v.to_bits().to_le_bytes()),
            (Self::Text(v), ValueKind::Text) => write_sized(writer, v.as_bytes())?,
            (Self::Bytes(v), ValueKind::Bytes) => write_sized(writer, v)?,
            (Self::Name(v), ValueKind::Name) => writer.write_string_id(v),
            (Self::Object(v), ValueKind::Object) => writer.write_object_pointer(v.as_ref()),
            (Self::Resource(v), ValueKind::Resource) => writer.write_resource_ref(v.as_ref(), false),
            (Self::AsyncResource(v), ValueKind::AsyncResource) => {
                writer.write_resource_ref(v.as_ref(), true)
            }
            (Self::Buffer(v), ValueKind::Buffer) => writer.write_buffer(v.as_ref()),
            (Self::Array(items), ValueKind::Array(inner)) => {
                let count = u32::try_from(items.len())
                    .map_err(|_| GraphPackError::Internal("Array has more than u32::MAX items".into()))?;
                writer.begin_array(count);
                for item in items {
                    item.write(inner, writer)?;
                }
                writer.end_array()?;
            }
            _ => {
                return Err(GraphPackError::Internal(format!(
                    "Value {self:?} cannot be written as '{}'",
                    kind.type_name()
                )));
            }
        }
        Ok(())
    }

    /// Reads a value of `kind`.
    pub(crate) fn read(kind: &ValueKind, reader: &mut Reader<'_>) -> Result<Self> {
        Ok(match kind {
            ValueKind::Bool => Self::Bool(reader.read_raw(1)?.first().is_some_and(|b| *b != 0)),
            ValueKind::Int => Self::Int(i64::from_le_bytes(read_fixed(reader)?)),
            ValueKind::Float => Self::Float(f64::from_bits(u64::from_le_bytes(read_fixed(reader)?))),
            ValueKind::Text => {
                let bytes = read_sized(reader)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| GraphPackError::Format(format!("Invalid UTF-8 text value: {e}")))?;
                Self::Text(text.to_owned())
            }
            ValueKind::Bytes => Self::Bytes(read_sized(reader)?.to_vec()),
            ValueKind::Name => Self::Name(reader.read_string_id()?),
            ValueKind::Object => Self::Object(reader.read_object_pointer()?),
            ValueKind::Resource => Self::Resource(reader.read_resource_ref()?),
            ValueKind::AsyncResource => Self::AsyncResource(reader.read_resource_ref()?),
            ValueKind::Buffer => Self::Buffer(reader.read_buffer()?),
            ValueKind::Array(inner) => {
                let count = reader.enter_array()?;
                let mut items = Vec::with_capacity((count as usize).min(reader.remaining()));
                for _ in 0..count {
                    items.push(Self::read(inner, reader)?);
                }
                reader.leave_array()?;
                Self::Array(items)
            }
        })
    }
}

fn write_sized(writer: &mut Writer<'_>, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| GraphPackError::Internal("Inline value larger than 4 GiB".into()))?;
    writer.write_raw(&len.to_le_bytes());
    writer.write_raw(bytes);
    Ok(())
}

fn read_sized<'a>(reader: &mut Reader<'a>) -> Result<&'a [u8]> {
    let len = u32::from_le_bytes(read_fixed(reader)?);
    reader.read_raw(len as usize)
}

fn read_fixed<const N: usize>(reader: &mut Reader<'_>) -> Result<[u8; N]> {
    reader
        .read_raw(N)?
        .try_into()
        .map_err(|_| GraphPackError::Format(format!("Expected {N} bytes of raw data")))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Name(a), Self::Name(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => match (a, b) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            },
            (Self::Resource(a), Self::Resource(b)) => a == b,
            (Self::AsyncResource(a), Self::AsyncResource(b)) => a == b,
            (Self::Buffer(a), Self::Buffer(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            _ => false,
        }
    }
}
