//! The scope-checked write protocol values emit opcodes through.

use std::sync::Arc;

use crate::buffer::AsyncBuffer;
use crate::error::{GraphPackError, Result};
use crate::object::{Name, ObjectPtr, Property, Type};
use crate::resource::ResourceRef;

use super::opcode::{Opcode, OpcodeStream};
use super::references::ReferenceCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Compound,
    Array,
    Skip,
}

/// Cursor over an [`OpcodeStream`]; the only way values emit opcodes.
///
/// Every reference-producing call also registers the referenced entity in the
/// [`ReferenceCollector`]. Begin/end calls must balance: an end call that does not match
/// the innermost open scope is an error, and [`Writer::finish`] fails if a scope is left
/// open.
#[derive(Debug)]
pub struct Writer<'a> {
    stream: &'a mut OpcodeStream,
    references: &'a mut ReferenceCollector,
    scopes: Vec<Scope>,
}

impl<'a> Writer<'a> {
    /// Creates a writer appending to `stream`.
    pub fn new(stream: &'a mut OpcodeStream, references: &'a mut ReferenceCollector) -> Self {
        Self {
            stream,
            references,
            scopes: Vec::new(),
        }
    }

    /// Writes uninterpreted bytes.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.push_raw(bytes);
    }

    /// Opens a compound value of type `ty`.
    pub fn begin_compound(&mut self, ty: &Type) {
        self.references.add_type(ty);
        self.stream.push(Opcode::CompoundBegin(ty.clone()));
        self.scopes.push(Scope::Compound);
    }

    /// Closes the innermost compound.
    pub fn end_compound(&mut self) -> Result<()> {
        self.close(Scope::Compound)?;
        self.stream.push(Opcode::CompoundEnd);
        Ok(())
    }

    /// Opens an array of `count` elements.
    pub fn begin_array(&mut self, count: u32) {
        self.stream.push(Opcode::ArrayBegin(count));
        self.scopes.push(Scope::Array);
    }

    /// Closes the innermost array.
    pub fn end_array(&mut self) -> Result<()> {
        self.close(Scope::Array)?;
        self.stream.push(Opcode::ArrayEnd);
        Ok(())
    }

    /// Opens a block that readers can jump over.
    pub fn begin_skip_block(&mut self) {
        self.stream.push(Opcode::SkipBegin);
        self.scopes.push(Scope::Skip);
    }

    /// Closes the innermost skip block.
    pub fn end_skip_block(&mut self) -> Result<()> {
        self.close(Scope::Skip)?;
        self.stream.push(Opcode::SkipEnd);
        Ok(())
    }

    /// Writes an identifier through the name table.
    pub fn write_string_id(&mut self, name: &Name) {
        self.references.add_name(name);
        self.stream.push(Opcode::NameRef(name.clone()));
    }

    /// Writes a type reference.
    pub fn write_type(&mut self, ty: &Type) {
        self.references.add_type(ty);
        self.stream.push(Opcode::TypeRef(ty.clone()));
    }

    /// Writes a property reference.
    pub fn write_property(&mut self, property: &Arc<Property>) {
        self.references.add_property(property);
        self.stream.push(Opcode::PropertyRef(property.clone()));
    }

    /// Writes a pointer to another object.
    pub fn write_object_pointer(&mut self, object: Option<&ObjectPtr>) {
        if let Some(object) = object {
            self.references.add_object(object);
        }
        self.stream.push(Opcode::ObjectPointerRef(object.cloned()));
    }

    /// Writes a reference to an external resource.
    pub fn write_resource_ref(&mut self, resource: Option<&ResourceRef>, is_async: bool) {
        if let Some(resource) = resource {
            self.references.add_resource(resource, is_async);
        }
        self.stream.push(Opcode::ResourceRef {
            resource: resource.cloned(),
            is_async,
        });
    }

    /// Writes a reference to an async buffer.
    pub fn write_buffer(&mut self, buffer: Option<&AsyncBuffer>) {
        if let Some(buffer) = buffer {
            self.references.add_buffer(buffer);
        }
        self.stream.push(Opcode::InlineBuffer(buffer.cloned()));
    }

    /// Checks that every scope was closed and that the stream is intact.
    pub fn finish(self) -> Result<()> {
        if let Some(open) = self.scopes.last() {
            return Err(GraphPackError::Internal(format!(
                "Writer finished with {} open scope(s), innermost {open:?}",
                self.scopes.len()
            )));
        }
        if self.stream.is_corrupted() {
            return Err(GraphPackError::Internal(
                "Allocation failed while staging an object".into(),
            ));
        }
        Ok(())
    }

    fn close(&mut self, expected: Scope) -> Result<()> {
        match self.scopes.pop() {
            Some(scope) if scope == expected => Ok(()),
            Some(scope) => Err(GraphPackError::Internal(format!(
                "Cannot close {expected:?}: innermost open scope is {scope:?}"
            ))),
            None => Err(GraphPackError::Internal(format!(
                "Cannot close {expected:?}: no scope is open"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ValueKind;

    #[test]
    fn balanced_scopes_finish() -> Result<()> {
        let mut stream = OpcodeStream::new();
        let mut refs = ReferenceCollector::new();
        let mut writer = Writer::new(&mut stream, &mut refs);
        writer.begin_compound(&Type::Value(ValueKind::Int));
        writer.begin_skip_block();
        writer.begin_array(1);
        writer.write_raw(&[1]);
        writer.end_array()?;
        writer.end_skip_block()?;
        writer.end_compound()?;
        writer.finish()?;

        assert_eq!(stream.len(), 7);
        assert_eq!(refs.types().count(), 1);
        Ok(())
    }

    #[test]
    fn mismatched_end_is_rejected() {
        let mut stream = OpcodeStream::new();
        let mut refs = ReferenceCollector::new();
        let mut writer = Writer::new(&mut stream, &mut refs);
        writer.begin_array(0);
        assert!(matches!(writer.end_compound(), Err(GraphPackError::Internal(_))));
        assert!(writer.end_skip_block().is_err());
    }

    #[test]
    fn open_scope_fails_finish() {
        let mut stream = OpcodeStream::new();
        let mut refs = ReferenceCollector::new();
        let mut writer = Writer::new(&mut stream, &mut refs);
        writer.begin_skip_block();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn null_references_are_not_collected() {
        let mut stream = OpcodeStream::new();
        let mut refs = ReferenceCollector::new();
        let mut writer = Writer::new(&mut stream, &mut refs);
        writer.write_object_pointer(None);
        writer.write_resource_ref(None, true);
        writer.write_buffer(None);

        assert_eq!(stream.len(), 3);
        assert_eq!(refs.objects().count(), 0);
        assert_eq!(refs.async_resources().count(), 0);
        assert_eq!(refs.buffers().count(), 0);
    }
}
