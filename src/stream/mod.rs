//! The abstract write/read protocol.
//!
//! Values never produce bytes directly. They emit opcodes through a [`Writer`] into an
//! [`OpcodeStream`], and the [`Binarizer`] turns a finished stream into one of the two
//! physical encodings once the file tables are known. The [`Reader`] replays those bytes
//! against the [`ResolvedReferences`] of a load.

pub mod binarizer;
pub mod opcode;
pub mod reader;
pub mod references;
pub mod resolved;
pub mod writer;

pub use binarizer::{Binarizer, ObjectSpan, OpcodeFileWriter, ReferenceMapping};
pub use opcode::{Opcode, OpcodeStream, RawSpan};
pub use reader::Reader;
pub use references::ReferenceCollector;
pub use resolved::{ResolvedProperty, ResolvedReferences, ResolvedType};
pub use writer::Writer;
