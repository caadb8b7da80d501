//! Centralized error handling for GraphPack.
//!
//! All failure conditions are propagated through [`Result`]; the library never panics.
//!
//! ## Error Categories
//!
//! Errors are split by how much of an operation they abort:
//!
//! - **Fatal for the whole operation:** [`GraphPackError::Io`], [`GraphPackError::Format`],
//!   [`GraphPackError::Integrity`], [`GraphPackError::Compression`],
//!   [`GraphPackError::Cancelled`] and [`GraphPackError::Internal`].
//! - **Recoverable per entity:** unknown types, missing properties, lost pointers or imports
//!   that fail to load are *not* errors. They are reported through `tracing::warn!` and the
//!   affected entity degrades to an empty or null value while the rest of the graph loads.
//!
//! ## Usage
//!
//! ```rust
//! use graphpack::{GraphPack, GraphPackError, LoadOptions, TypeRegistry};
//!
//! let registry = TypeRegistry::new();
//! match GraphPack::load_bytes(vec![0u8; 4], &registry, &LoadOptions::default()) {
//!     Err(GraphPackError::Format(msg)) => println!("not a graph file: {msg}"),
//!     Err(e) => println!("other error: {e}"),
//!     Ok(_) => unreachable!(),
//! }
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for GraphPack operations.
pub type Result<T> = std::result::Result<T, GraphPackError>;

/// The master error enum covering all failure domains in GraphPack.
///
/// The type is `Clone` so a failure captured inside a parallel import task or a
/// memoized buffer load can be handed out more than once. I/O errors are wrapped in
/// `Arc` for that reason.
#[derive(Debug, Clone)]
pub enum GraphPackError {
    /// Low-level I/O failure (file not found, disk full, short read...).
    Io(Arc<io::Error>),

    /// The file (or a region of it) does not follow the binary layout.
    ///
    /// Raised for wrong magic, unsupported version, header or chunk CRC mismatch,
    /// chunk bounds violations, dangling table indices and malformed opcode data.
    Format(String),

    /// Data was structurally valid but failed a checksum.
    ///
    /// Raised for per-object CRC mismatches in protected files and for async buffers
    /// whose decompressed content does not hash to the recorded value.
    Integrity(String),

    /// Compression or decompression failure, or an unknown compression kind.
    Compression(String),

    /// The save was cancelled through its [`CancellationFlag`](crate::api::CancellationFlag).
    Cancelled,

    /// Logic error: unbalanced writer scopes, opcode stream allocation failure,
    /// missing mappings. Indicates a bug in the calling code or in the library.
    Internal(String),
}

impl fmt::Display for GraphPackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::Format(s) => write!(f, "Format Error: {s}"),
            Self::Integrity(s) => write!(f, "Integrity Error: {s}"),
            Self::Compression(s) => write!(f, "Compression Error: {s}"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Internal(s) => write!(f, "Internal Logic Error: {s}"),
        }
    }
}

impl std::error::Error for GraphPackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GraphPackError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<tempfile::PersistError> for GraphPackError {
    fn from(err: tempfile::PersistError) -> Self {
        Self::Io(Arc::new(err.error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn io_errors_keep_their_source() {
        let err: GraphPackError = io::Error::new(io::ErrorKind::UnexpectedEof, "short").into();
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("I/O Error"));
    }

    #[test]
    fn format_errors_have_no_source() {
        let err = GraphPackError::Format("bad magic".into());
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "Format Error: bad magic");
    }
}
