//! The opcode stream: an append-only record of one object's serialization events.
//!
//! Opcodes are stored in fixed-capacity pages so that growing a stream never moves the
//! opcodes already written. Raw bytes live in a separate arena and opcodes refer to them
//! by span. Allocation failures do not abort the writer immediately: the stream is flagged
//! as corrupted and the save of that object fails when the writer is finished.

use crate::buffer::AsyncBuffer;
use crate::constants::OPCODE_PAGE_SIZE;
use crate::object::{Name, ObjectPtr, Property, Type};
use crate::resource::ResourceRef;

use std::sync::Arc;

/// A range of the raw-data arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSpan {
    start: usize,
    len: usize,
}

impl RawSpan {
    /// Number of bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true for an empty write.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// One serialization event.
#[derive(Debug, Clone)]
pub enum Opcode {
    /// Start of a structured value of the given type.
    CompoundBegin(Type),
    /// End of the innermost compound.
    CompoundEnd,
    /// Start of an array of `count` elements.
    ArrayBegin(u32),
    /// End of the innermost array.
    ArrayEnd,
    /// Start of a block a reader may jump over.
    SkipBegin,
    /// End of the innermost skip block.
    SkipEnd,
    /// Uninterpreted bytes.
    RawData(RawSpan),
    /// Reference to an identifier.
    NameRef(Name),
    /// Reference to a type.
    TypeRef(Type),
    /// Reference to a class property.
    PropertyRef(Arc<Property>),
    /// Pointer to another object, or null.
    ObjectPointerRef(Option<ObjectPtr>),
    /// Reference to an external resource, or null.
    ResourceRef {
        /// The referenced resource.
        resource: Option<ResourceRef>,
        /// True if the resource may be loaded after the file.
        is_async: bool,
    },
    /// Reference to an async buffer, or null.
    InlineBuffer(Option<AsyncBuffer>),
}

impl Opcode {
    /// Tag byte written before the opcode in protected files.
    pub fn tag(&self) -> u8 {
        match self {
            Self::CompoundBegin(_) => tags::COMPOUND_BEGIN,
            Self::CompoundEnd => tags::COMPOUND_END,
            Self::ArrayBegin(_) => tags::ARRAY_BEGIN,
            Self::ArrayEnd => tags::ARRAY_END,
            Self::SkipBegin => tags::SKIP_BEGIN,
            Self::SkipEnd => tags::SKIP_END,
            Self::RawData(_) => tags::RAW_DATA,
            Self::NameRef(_) => tags::NAME_REF,
            Self::TypeRef(_) => tags::TYPE_REF,
            Self::PropertyRef(_) => tags::PROPERTY_REF,
            Self::ObjectPointerRef(_) => tags::OBJECT_REF,
            Self::ResourceRef { .. } => tags::RESOURCE_REF,
            Self::InlineBuffer(_) => tags::BUFFER_REF,
        }
    }
}

/// Tag bytes of the protected encoding.
pub mod tags {
    /// `CompoundBegin`
    pub const COMPOUND_BEGIN: u8 = 0x01;
    /// `CompoundEnd`
    pub const COMPOUND_END: u8 = 0x02;
    /// `ArrayBegin`
    pub const ARRAY_BEGIN: u8 = 0x03;
    /// `ArrayEnd`
    pub const ARRAY_END: u8 = 0x04;
    /// `SkipBegin`
    pub const SKIP_BEGIN: u8 = 0x05;
    /// `SkipEnd`
    pub const SKIP_END: u8 = 0x06;
    /// `RawData`
    pub const RAW_DATA: u8 = 0x07;
    /// `NameRef`
    pub const NAME_REF: u8 = 0x08;
    /// `TypeRef`
    pub const TYPE_REF: u8 = 0x09;
    /// `PropertyRef`
    pub const PROPERTY_REF: u8 = 0x0A;
    /// `ObjectPointerRef`
    pub const OBJECT_REF: u8 = 0x0B;
    /// `ResourceRef`
    pub const RESOURCE_REF: u8 = 0x0C;
    /// `InlineBuffer`
    pub const BUFFER_REF: u8 = 0x0D;

    /// Human-readable tag name, for error messages.
    pub fn name(tag: u8) -> &'static str {
        match tag {
            COMPOUND_BEGIN => "CompoundBegin",
            COMPOUND_END => "CompoundEnd",
            ARRAY_BEGIN => "ArrayBegin",
            ARRAY_END => "ArrayEnd",
            SKIP_BEGIN => "SkipBegin",
            SKIP_END => "SkipEnd",
            RAW_DATA => "RawData",
            NAME_REF => "NameRef",
            TYPE_REF => "TypeRef",
            PROPERTY_REF => "PropertyRef",
            OBJECT_REF => "ObjectPointerRef",
            RESOURCE_REF => "ResourceRef",
            BUFFER_REF => "InlineBuffer",
            _ => "<unknown>",
        }
    }
}

/// Append-only, page-allocated sequence of opcodes.
#[derive(Debug, Default)]
pub struct OpcodeStream {
    pages: Vec<Vec<Opcode>>,
    raw: Vec<u8>,
    len: usize,
    corrupted: bool,
}

impl OpcodeStream {
    /// Creates an empty stream. Nothing is allocated until the first push.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an opcode.
    pub fn push(&mut self, opcode: Opcode) {
        if self.corrupted {
            return;
        }

        let needs_page = self.pages.last().is_none_or(|p| p.len() == p.capacity());
        if needs_page {
            let mut page = Vec::new();
            if page.try_reserve_exact(OPCODE_PAGE_SIZE).is_err() {
                self.corrupted = true;
                return;
            }
            self.pages.push(page);
        }
        if let Some(page) = self.pages.last_mut() {
            page.push(opcode);
            self.len += 1;
        }
    }

    /// Appends a raw-data opcode holding a copy of `bytes`.
    pub fn push_raw(&mut self, bytes: &[u8]) {
        if self.corrupted {
            return;
        }
        if self.raw.try_reserve(bytes.len()).is_err() {
            self.corrupted = true;
            return;
        }

        let span = RawSpan {
            start: self.raw.len(),
            len: bytes.len(),
        };
        self.raw.extend_from_slice(bytes);
        self.push(Opcode::RawData(span));
    }

    /// Bytes of a raw-data opcode.
    pub fn raw(&self, span: RawSpan) -> &[u8] {
        self.raw.get(span.start..span.start + span.len).unwrap_or_default()
    }

    /// Opcodes in write order.
    pub fn iter(&self) -> impl Iterator<Item = &Opcode> {
        self.pages.iter().flatten()
    }

    /// Number of opcodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns true if an allocation failed while writing.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }
}
