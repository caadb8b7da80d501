//! Replays encoded object data back into values.

use crate::buffer::AsyncBuffer;
use crate::error::{GraphPackError, Result};
use crate::object::{Name, ObjectPtr};
use crate::resource::ResourceRef;

use super::opcode::tags;
use super::resolved::{ResolvedProperty, ResolvedReferences, ResolvedType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Compound,
    Array,
    Skip { end: usize },
}

/// Replays one object's encoded bytes.
///
/// The reader mirrors [`Writer`](super::Writer): every `enter_*`/`leave_*` pair and every
/// `read_*` call consumes exactly what the corresponding write produced. In protected
/// files each step also checks the opcode tag and raw lengths, so a mismatch surfaces at
/// the first wrong byte. All reads are bounds-checked in both encodings.
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    protected: bool,
    references: &'a ResolvedReferences,
    scopes: Vec<Scope>,
}

impl<'a> Reader<'a> {
    /// Creates a reader over one object's bytes.
    pub fn new(data: &'a [u8], references: &'a ResolvedReferences, protected: bool) -> Self {
        Self {
            data,
            pos: 0,
            protected,
            references,
            scopes: Vec::new(),
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Reads `len` uninterpreted bytes.
    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.protected {
            self.expect_tag(tags::RAW_DATA)?;
            let stored = self.u32()? as usize;
            if stored != len {
                return Err(self.malformed(&format!("raw data of {stored} bytes, expected {len}")));
            }
        }
        self.take(len)
    }

    /// Enters a compound. Returns its type and the number of member skip blocks.
    pub fn enter_compound(&mut self) -> Result<(ResolvedType, u32)> {
        self.expect_tag(tags::COMPOUND_BEGIN)?;
        let ty = self.references.ty(self.u32()?)?.clone();
        let members = self.u32()?;
        self.scopes.push(Scope::Compound);
        Ok((ty, members))
    }

    /// Leaves the innermost compound.
    pub fn leave_compound(&mut self) -> Result<()> {
        self.close(Scope::Compound)?;
        self.expect_tag(tags::COMPOUND_END)
    }

    /// Enters an array. Returns its element count.
    pub fn enter_array(&mut self) -> Result<u32> {
        self.expect_tag(tags::ARRAY_BEGIN)?;
        let count = self.u32()?;
        self.scopes.push(Scope::Array);
        Ok(count)
    }

    /// Leaves the innermost array.
    pub fn leave_array(&mut self) -> Result<()> {
        self.close(Scope::Array)?;
        self.expect_tag(tags::ARRAY_END)
    }

    /// Enters a skip block.
    pub fn enter_skip_block(&mut self) -> Result<()> {
        self.expect_tag(tags::SKIP_BEGIN)?;
        let length = self.u32()? as usize;
        let end = self
            .pos
            .checked_add(length)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| self.malformed(&format!("skip block of {length} bytes overruns the object")))?;
        self.scopes.push(Scope::Skip { end });
        Ok(())
    }

    /// Leaves the innermost skip block after reading all of it.
    pub fn leave_skip_block(&mut self) -> Result<()> {
        self.expect_tag(tags::SKIP_END)?;
        match self.scopes.pop() {
            Some(Scope::Skip { end }) if end == self.pos => Ok(()),
            Some(Scope::Skip { end }) => Err(self.malformed(&format!(
                "skip block ends at {end} but its content ended at {}",
                self.pos
            ))),
            other => Err(self.malformed(&format!("leaving skip block inside {other:?}"))),
        }
    }

    /// Jumps to the end of the innermost skip block, abandoning any scope opened in it.
    pub fn skip_block(&mut self) -> Result<()> {
        while let Some(scope) = self.scopes.pop() {
            if let Scope::Skip { end } = scope {
                self.pos = end;
                return Ok(());
            }
        }
        Err(self.malformed("skip requested outside of a skip block"))
    }

    /// Reads an identifier.
    pub fn read_string_id(&mut self) -> Result<Name> {
        self.expect_tag(tags::NAME_REF)?;
        let index = self.u32()?;
        self.references.name(index).cloned()
    }

    /// Reads a type reference.
    pub fn read_type(&mut self) -> Result<ResolvedType> {
        self.expect_tag(tags::TYPE_REF)?;
        let index = self.u32()?;
        self.references.ty(index).cloned()
    }

    /// Reads a property reference.
    pub fn read_property(&mut self) -> Result<ResolvedProperty> {
        self.expect_tag(tags::PROPERTY_REF)?;
        let index = self.u32()?;
        self.references.property(index).cloned()
    }

    /// Reads an object pointer. Pointers to objects that were not saved or not loaded
    /// come back as `None`.
    pub fn read_object_pointer(&mut self) -> Result<Option<ObjectPtr>> {
        self.expect_tag(tags::OBJECT_REF)?;
        let index = self.u32()?;
        self.references.object(index)
    }

    /// Reads a resource reference.
    pub fn read_resource_ref(&mut self) -> Result<Option<ResourceRef>> {
        self.expect_tag(tags::RESOURCE_REF)?;
        let index = self.u32()?;
        self.references.import(index)
    }

    /// Reads an async buffer reference.
    pub fn read_buffer(&mut self) -> Result<Option<AsyncBuffer>> {
        self.expect_tag(tags::BUFFER_REF)?;
        let index = self.u32()?;
        self.references.buffer(index)
    }

    /// Checks that the object was consumed exactly.
    pub fn finish(&self) -> Result<()> {
        if !self.scopes.is_empty() {
            return Err(self.malformed(&format!("{} scope(s) left open", self.scopes.len())));
        }
        if self.pos != self.data.len() {
            return Err(self.malformed(&format!("{} trailing bytes", self.remaining())));
        }
        Ok(())
    }

    fn close(&mut self, expected: Scope) -> Result<()> {
        match self.scopes.pop() {
            Some(scope) if scope == expected => Ok(()),
            other => Err(self.malformed(&format!("closing {expected:?} inside {other:?}"))),
        }
    }

    fn expect_tag(&mut self, expected: u8) -> Result<()> {
        if !self.protected {
            return Ok(());
        }
        let found = self.take(1)?[0];
        if found != expected {
            return Err(self.malformed(&format!(
                "expected {} but found {} (0x{found:02X})",
                tags::name(expected),
                tags::name(found)
            )));
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| self.malformed("short u32"))?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let slice = self
            .pos
            .checked_add(len)
            .and_then(|end| self.data.get(self.pos..end))
            .ok_or_else(|| {
                self.malformed(&format!("read of {len} bytes past the end of the object"))
            })?;
        self.pos += len;
        Ok(slice)
    }

    fn malformed(&self, what: &str) -> GraphPackError {
        GraphPackError::Format(format!("Malformed object data at byte {}: {what}", self.pos))
    }
}
