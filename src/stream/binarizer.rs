//! Opcode stream to on-disk bytes.
//!
//! ```text
//! opcode            protected                         unprotected
//! CompoundBegin     tag  type:u32  members:u32        type:u32  members:u32
//! CompoundEnd       tag                               -
//! ArrayBegin        tag  count:u32                    count:u32
//! ArrayEnd          tag                               -
//! SkipBegin         tag  length:u32                   length:u32
//! SkipEnd           tag                               -
//! RawData           tag  len:u32  bytes               bytes
//! *Ref / Buffer     tag  index:u32                    index:u32
//! ```
//!
//! `members` is the number of skip blocks directly inside the compound and `length` is the
//! byte length of the skip block's body including its end tag. Both are computed in a
//! measuring pass before anything is written, so bytes stream straight to the output.

use std::io::{Seek, Write};

use crate::buffer::AsyncBuffer;
use crate::constants::STAGING_BUFFER_SIZE;
use crate::error::{GraphPackError, Result};
use crate::io::SeqWriter;
use crate::object::{Name, ObjectPtr, Property, Type};
use crate::resource::ResourceRef;

use super::opcode::{Opcode, OpcodeStream};

/// File-wide indices of referenced entities, as assigned by the table builder.
///
/// Name and type indices address tables whose entry 0 is the empty sentinel. Object,
/// import and buffer indices are 1-based; 0 encodes null.
pub trait ReferenceMapping {
    /// Index of an identifier.
    fn name_index(&self, name: &Name) -> Result<u32>;
    /// Index of a type.
    fn type_index(&self, ty: &Type) -> Result<u32>;
    /// 1-based index of a property.
    fn property_index(&self, property: &Property) -> Result<u32>;
    /// 1-based export index, or 0 if the object is not saved.
    fn object_index(&self, object: &ObjectPtr) -> u32;
    /// 1-based import index.
    fn import_index(&self, resource: &ResourceRef) -> Result<u32>;
    /// 1-based buffer index.
    fn buffer_index(&self, buffer: &AsyncBuffer) -> Result<u32>;
}

/// Position and checksum of one encoded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectSpan {
    /// Offset relative to the start of the file.
    pub offset: u64,
    /// Encoded size in bytes.
    pub size: u32,
    /// CRC32 of the encoded bytes.
    pub crc: u32,
}

/// Encodes opcode streams using one of the two physical layouts.
#[derive(Debug)]
pub struct Binarizer<'m, M: ReferenceMapping> {
    mapping: &'m M,
    protected: bool,
}

impl<'m, M: ReferenceMapping> Binarizer<'m, M> {
    /// Creates a binarizer resolving references through `mapping`.
    pub fn new(mapping: &'m M, protected: bool) -> Self {
        Self { mapping, protected }
    }

    /// Encodes one object's stream into `out`.
    pub fn write_object<W: Write + Seek>(
        &self,
        stream: &OpcodeStream,
        out: &mut OpcodeFileWriter<'_, W>,
    ) -> Result<ObjectSpan> {
        let mut patches = self.measure(stream)?.into_iter();
        let mut next_patch = || {
            patches
                .next()
                .ok_or_else(|| GraphPackError::Internal("Scope sizes out of step with stream".into()))
        };

        out.begin_object();
        for op in stream.iter() {
            if self.protected {
                out.put(&[op.tag()])?;
            }
            match op {
                Opcode::CompoundBegin(ty) => {
                    out.put_u32(self.mapping.type_index(ty)?)?;
                    out.put_u32(next_patch()?)?;
                }
                Opcode::ArrayBegin(count) => out.put_u32(*count)?,
                Opcode::SkipBegin => out.put_u32(next_patch()?)?,
                Opcode::CompoundEnd | Opcode::ArrayEnd | Opcode::SkipEnd => {}
                Opcode::RawData(span) => {
                    let bytes = stream.raw(*span);
                    if self.protected {
                        out.put_u32(len_u32(bytes.len())?)?;
                    }
                    out.put(bytes)?;
                }
                other => out.put_u32(self.reference_index(other)?)?,
            }
        }
        out.end_object()
    }

    /// Computes, in stream order, the member count of every compound and the body length
    /// of every skip block.
    fn measure(&self, stream: &OpcodeStream) -> Result<Vec<u32>> {
        enum Open {
            Compound { slot: usize },
            Array,
            Skip { slot: usize, body_start: u64 },
        }

        let tag = u64::from(self.protected);
        let mut patches = Vec::new();
        let mut open: Vec<Open> = Vec::new();
        let mut size = 0u64;

        for op in stream.iter() {
            size += tag;
            match op {
                Opcode::CompoundBegin(_) => {
                    size += 8;
                    open.push(Open::Compound { slot: patches.len() });
                    patches.push(0);
                }
                Opcode::ArrayBegin(_) => {
                    size += 4;
                    open.push(Open::Array);
                }
                Opcode::SkipBegin => {
                    if let Some(Open::Compound { slot }) = open.last()
                        && let Some(members) = patches.get_mut(*slot)
                    {
                        *members += 1;
                    }
                    size += 4;
                    open.push(Open::Skip {
                        slot: patches.len(),
                        body_start: size,
                    });
                    patches.push(0);
                }
                Opcode::CompoundEnd | Opcode::ArrayEnd => {
                    open.pop();
                }
                Opcode::SkipEnd => {
                    if let Some(Open::Skip { slot, body_start }) = open.pop()
                        && let Some(length) = patches.get_mut(slot)
                    {
                        *length = u32::try_from(size - body_start).map_err(|_| {
                            GraphPackError::Internal("Skip block larger than 4 GiB".into())
                        })?;
                    }
                }
                Opcode::RawData(span) => size += span.len() as u64 + 4 * tag,
                _ => size += 4,
            }
        }

        if !open.is_empty() {
            return Err(GraphPackError::Internal("Opcode stream has unclosed scopes".into()));
        }
        Ok(patches)
    }

    fn reference_index(&self, op: &Opcode) -> Result<u32> {
        match op {
            Opcode::NameRef(name) => self.mapping.name_index(name),
            Opcode::TypeRef(ty) => self.mapping.type_index(ty),
            Opcode::PropertyRef(property) => self.mapping.property_index(property),
            Opcode::ObjectPointerRef(object) => Ok(object.as_ref().map_or(0, |o| self.mapping.object_index(o))),
            Opcode::ResourceRef { resource, .. } => resource.as_ref().map_or(Ok(0), |r| self.mapping.import_index(r)),
            Opcode::InlineBuffer(buffer) => buffer.as_ref().map_or(Ok(0), |b| self.mapping.buffer_index(b)),
            other => Err(GraphPackError::Internal(format!("{other:?} is not a reference"))),
        }
    }
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| GraphPackError::Internal("Raw write larger than 4 GiB".into()))
}

/// Streams encoded objects to the output through a fixed staging buffer, accumulating
/// each object's CRC32.
pub struct OpcodeFileWriter<'w, W: Write + Seek> {
    out: &'w mut SeqWriter<W>,
    staging: Vec<u8>,
    crc: crc32fast::Hasher,
    start: u64,
    size: u64,
}

impl<'w, W: Write + Seek> OpcodeFileWriter<'w, W> {
    /// Wraps the file cursor.
    pub fn new(out: &'w mut SeqWriter<W>) -> Self {
        Self {
            out,
            staging: Vec::with_capacity(STAGING_BUFFER_SIZE),
            crc: crc32fast::Hasher::new(),
            start: 0,
            size: 0,
        }
    }

    fn begin_object(&mut self) {
        self.crc = crc32fast::Hasher::new();
        self.start = self.out.relative_offset() + self.staging.len() as u64;
        self.size = 0;
    }

    fn put_u32(&mut self, value: u32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.crc.update(bytes);
        self.size += bytes.len() as u64;

        if self.staging.len() + bytes.len() > STAGING_BUFFER_SIZE {
            self.flush()?;
        }
        if bytes.len() >= STAGING_BUFFER_SIZE {
            self.out.write_all(bytes)?;
        } else {
            self.staging.extend_from_slice(bytes);
        }
        Ok(())
    }

    fn end_object(&mut self) -> Result<ObjectSpan> {
        self.flush()?;
        let crc = std::mem::replace(&mut self.crc, crc32fast::Hasher::new()).finalize();
        Ok(ObjectSpan {
            offset: self.start,
            size: u32::try_from(self.size)
                .map_err(|_| GraphPackError::Internal("Object larger than 4 GiB".into()))?,
            crc,
        })
    }

    /// Writes out the staging buffer.
    pub fn flush(&mut self) -> Result<()> {
        if !self.staging.is_empty() {
            self.out.write_all(&self.staging)?;
            self.staging.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ValueKind;
    use crate::stream::{ReferenceCollector, Writer};
    use std::io::Cursor;

    struct Fixed;

    impl ReferenceMapping for Fixed {
        fn name_index(&self, _: &Name) -> Result<u32> {
            Ok(1)
        }
        fn type_index(&self, _: &Type) -> Result<u32> {
            Ok(2)
        }
        fn property_index(&self, _: &Property) -> Result<u32> {
            Ok(3)
        }
        fn object_index(&self, _: &ObjectPtr) -> u32 {
            4
        }
        fn import_index(&self, _: &ResourceRef) -> Result<u32> {
            Ok(5)
        }
        fn buffer_index(&self, _: &AsyncBuffer) -> Result<u32> {
            Ok(6)
        }
    }

    fn sample() -> Result<OpcodeStream> {
        let mut stream = OpcodeStream::new();
        let mut refs = ReferenceCollector::new();
        let mut writer = Writer::new(&mut stream, &mut refs);
        writer.begin_compound(&Type::Value(ValueKind::Int));
        writer.begin_skip_block();
        writer.write_string_id(&Name::new("x"));
        writer.write_raw(&[0xAA, 0xBB]);
        writer.end_skip_block()?;
        writer.begin_skip_block();
        writer.write_object_pointer(None);
        writer.end_skip_block()?;
        writer.end_compound()?;
        writer.finish()?;
        Ok(stream)
    }

    fn encode(protected: bool) -> Result<(Vec<u8>, ObjectSpan)> {
        let stream = sample()?;
        let mut out = SeqWriter::new(Cursor::new(Vec::new()))?;
        let span = {
            let mut file = OpcodeFileWriter::new(&mut out);
            Binarizer::new(&Fixed, protected).write_object(&stream, &mut file)?
        };
        Ok((out.into_inner().into_inner(), span))
    }

    #[test]
    fn unprotected_layout_is_compact() -> Result<()> {
        let (bytes, span) = encode(false)?;
        #[rustfmt::skip]
        let expected = [
            2, 0, 0, 0,  2, 0, 0, 0,    // compound: type 2, two members
            6, 0, 0, 0,                 // skip: 6 byte body
            1, 0, 0, 0,  0xAA, 0xBB,    // name 1, raw
            4, 0, 0, 0,                 // skip: 4 byte body
            0, 0, 0, 0,                 // null pointer
        ];
        assert_eq!(bytes, expected);
        assert_eq!(span.size as usize, expected.len());
        assert_eq!(span.crc, crc32fast::hash(&expected));
        Ok(())
    }

    #[test]
    fn protected_layout_tags_everything() -> Result<()> {
        let (bytes, span) = encode(true)?;
        assert_eq!(bytes.first(), Some(&super::super::opcode::tags::COMPOUND_BEGIN));
        assert_eq!(bytes.last(), Some(&super::super::opcode::tags::COMPOUND_END));
        // First skip body: name (5) + raw (1 + 4 + 2) + end tag (1).
        assert_eq!(&bytes[10..14], &13u32.to_le_bytes());
        assert_eq!(span.offset, 0);
        assert_eq!(span.size as usize, bytes.len());
        Ok(())
    }
}
