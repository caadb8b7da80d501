//! High-level entry points: the [`GraphPack`] façade and [`CancellationFlag`].

use std::io::{Cursor, Seek, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use tracing::warn;

use crate::error::Result;
use crate::io::DataSource;
use crate::loader::{self, Dependency, LoadOptions, LoadResult};
use crate::object::{ObjectPtr, TypeRegistry};
use crate::resource::ResourceKey;
use crate::saver::{self, SaveOptions, SaveResult};

/// Cooperative cancellation for long saves.
///
/// Cloning shares the flag. The save polls it once per object and fails with
/// [`GraphPackError::Cancelled`](crate::GraphPackError::Cancelled).
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates a flag that is not yet set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The main entry point for saving and loading object graphs.
#[derive(Debug)]
pub struct GraphPack;

impl GraphPack {
    /// Saves the graph reachable from `roots` to a file.
    ///
    /// The data is written to a temporary file in the destination directory and moved into
    /// place once complete, so a failed save never leaves a partial file at `path`.
    pub fn save<P: AsRef<Path>>(path: P, roots: &[ObjectPtr], options: &SaveOptions) -> Result<SaveResult> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        let result = saver::save_to(file.as_file_mut(), roots, options)?;
        file.as_file().sync_all()?;
        file.persist(path)?;
        Ok(result)
    }

    /// Appends a saved graph to `out`. On failure `out` is restored to its previous length.
    pub fn write(out: &mut Vec<u8>, roots: &[ObjectPtr], options: &SaveOptions) -> Result<SaveResult> {
        let start = out.len();
        let mut cursor = Cursor::new(&mut *out);
        cursor.set_position(start as u64);
        match saver::save_to(&mut cursor, roots, options) {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!("Save failed, discarding {} partial bytes: {e}", out.len() - start);
                out.truncate(start);
                Err(e)
            }
        }
    }

    /// Saves into any seekable writer, starting at its current position.
    pub fn serialize<W: Write + Seek>(writer: W, roots: &[ObjectPtr], options: &SaveOptions) -> Result<SaveResult> {
        saver::save_to(writer, roots, options)
    }

    /// Loads a file through a read-only memory map.
    pub fn load<P: AsRef<Path>>(path: P, registry: &TypeRegistry, options: &LoadOptions) -> Result<LoadResult> {
        let source = Arc::new(DataSource::open(path)?);
        loader::load(&source, registry, options)
    }

    /// Loads from an in-memory buffer.
    pub fn load_bytes(bytes: Vec<u8>, registry: &TypeRegistry, options: &LoadOptions) -> Result<LoadResult> {
        let source = Arc::new(DataSource::from_bytes(bytes));
        loader::load(&source, registry, options)
    }

    /// Lists the imports of a file without loading its objects.
    pub fn load_dependencies<P: AsRef<Path>>(
        path: P,
        registry: &TypeRegistry,
        options: &LoadOptions,
    ) -> Result<Vec<Dependency>> {
        loader::load_dependencies(&DataSource::open(path)?, registry, options)
    }

    /// Lists the imports of an in-memory file.
    pub fn load_dependencies_bytes(
        bytes: Vec<u8>,
        registry: &TypeRegistry,
        options: &LoadOptions,
    ) -> Result<Vec<Dependency>> {
        loader::load_dependencies(&DataSource::from_bytes(bytes), registry, options)
    }

    /// Counts, per referenced resource, how many objects of the graph reference it.
    /// Nothing is written.
    pub fn extract_used_resources(roots: &[ObjectPtr]) -> Result<IndexMap<ResourceKey, usize>> {
        saver::extract_used_resources(roots)
    }
}
