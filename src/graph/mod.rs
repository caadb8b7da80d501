//! Save-side graph collection.
//!
//! This module decides which objects are saved and in which order: a breadth-first walk
//! from the declared roots over the pointers each object writes, followed by an ordering
//! pass that puts every parent before its children.

/// Defines the `ObjectCollection` arena.
pub mod core;
/// Defines the `NodeId` type.
pub mod id;
/// Defines the reachability walk.
pub mod collector;

pub use collector::collect_objects;
pub use core::{CollectedObject, ObjectCollection};
pub use id::NodeId;
