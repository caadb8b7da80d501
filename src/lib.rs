//! # GraphPack
//!
//! Binary persistence for graphs of reflected objects: objects with a class, typed
//! properties, a parent link, and pointers to each other, to external resources and to
//! large lazily-loaded buffers.
//!
//! ## Overview
//!
//! Saving walks the graph from a set of root objects. Each object is written as a stream of
//! abstract opcodes; everything those opcodes reference (identifiers, types, properties,
//! other objects, external resources, buffers) is collected and deduplicated into
//! file-wide tables. Opcode streams are then encoded with table indices in place of live
//! references.
//!
//! ### Key Features
//!
//! *   **Deduplicated tables:** every identifier, type and property is stored once per file.
//! *   **Schema evolution:** each property value sits in a length-prefixed skip block, so
//!     data for removed or retyped properties is skipped with a warning.
//! *   **Two encodings:** *protected* files tag every opcode and carry per-object CRC32s;
//!     *unprotected* files drop both for size and speed.
//! *   **Lazy buffers:** [`AsyncBuffer`] payloads are deduplicated by content hash, stored
//!     compressed when that pays off, and decompressed on first access.
//! *   **Parallel imports:** external resources flagged for eager loading are loaded
//!     concurrently through a [`ResourceLoader`].
//!
//! ### File Format
//!
//! ```text
//! [Header] [Strings|Names|Types|Properties|Imports|Exports|Buffers] [Objects...] [Buffers...]
//! ```
//!
//! See [`format`] for the exact layout.
//!
//! ## Usage
//!
//! ```rust
//! use graphpack::{ClassType, GraphPack, LoadOptions, Object, SaveOptions, TypeRegistry, Value, ValueKind};
//!
//! # fn main() -> graphpack::Result<()> {
//! let node = ClassType::builder("Node")
//!     .property("value", ValueKind::Int)
//!     .property("label", ValueKind::Text)
//!     .build();
//!
//! let root = Object::new(&node);
//! root.set("value", Value::Int(42))?;
//! let child = Object::new_child(&node, &root);
//! child.set("label", Value::Text("hello".into()))?;
//!
//! let mut bytes = Vec::new();
//! GraphPack::write(&mut bytes, &[root, child], &SaveOptions::default())?;
//!
//! let mut registry = TypeRegistry::new();
//! registry.register(node);
//! let loaded = GraphPack::load_bytes(bytes, &registry, &LoadOptions::default())?;
//! assert_eq!(loaded.objects.len(), 2);
//! assert_eq!(loaded.roots[0].get("value"), Some(Value::Int(42)));
//! # Ok(())
//! # }
//! ```
//!
//! ### Safety and Error Handling
//!
//! * **Encapsulated Unsafe:** the only `unsafe` block maps files read-only in [`io`].
//! * **No Panics:** no `unwrap()` or `panic!()` in the library (enforced by clippy lints).
//! * **Untrusted Input:** every offset and index read from a file is validated before use;
//!   all failures map to a [`GraphPackError`].

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// --- PUBLIC API MODULES ---
pub mod api;
pub mod buffer;
pub mod compression;
pub mod error;
pub mod format;
pub mod inspector;
pub mod loader;
pub mod object;
pub mod resource;
pub mod saver;

// --- INTERNAL IMPLEMENTATION MODULES (Hidden from Docs) ---
#[doc(hidden)]
pub mod graph;
#[doc(hidden)]
pub mod io;
#[doc(hidden)]
pub mod stream;
#[doc(hidden)]
pub mod tables;
#[doc(hidden)]
pub mod xml;

// --- RE-EXPORTS ---

#[cfg(feature = "lz4_flex")]
pub use compression::Lz4Compressor;
pub use compression::{CompressionKind, Compressor, NoCompression};

pub use api::{CancellationFlag, GraphPack};
pub use buffer::{AsyncBuffer, BufferState, BufferStore, MemoryBufferStore};
pub use error::{GraphPackError, Result};
pub use inspector::{GraphInspector, InspectionReport};
pub use loader::{Dependency, LoadOptions, LoadResult};
pub use object::{ClassType, Name, Object, ObjectPtr, Property, Type, TypeRegistry, Value, ValueKind};
pub use resource::{ResourceHandle, ResourceKey, ResourceLoader, ResourceRef};
pub use saver::{SaveFormat, SaveOptions, SaveResult};

/// Constants used throughout the library.
pub mod constants {
    /// Size of the staging buffer between the binarizer and the output.
    pub const STAGING_BUFFER_SIZE: usize = 4 * 1024;

    /// Read size for object data when the object region is larger than this.
    pub const DEFAULT_LOAD_BUFFER_SIZE: u64 = 8 * 1024 * 1024;

    /// Alignment of object data reads.
    pub const BLOCK_SIZE: u64 = 4 * 1024;

    /// Upper bound on the table region a loader accepts.
    pub const MAX_TABLES_SIZE: u64 = 64 * 1024 * 1024;

    /// Opcodes per opcode stream page.
    pub const OPCODE_PAGE_SIZE: usize = 256;

    /// A buffer is stored compressed only when the compressed size is at most this
    /// percentage of the original.
    pub const COMPRESSION_PROFIT_PERCENT: u64 = 90;
}
