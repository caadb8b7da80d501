use std::collections::{HashSet, VecDeque};

use tracing::{trace, warn};

use super::core::{CollectedObject, ObjectCollection};
use super::id::NodeId;
use crate::api::CancellationFlag;
use crate::error::{GraphPackError, Result};
use crate::object::{ObjectKey, ObjectPtr};
use crate::stream::{OpcodeStream, ReferenceCollector, Writer};

/// Collects every object reachable from `roots` and orders the result parent-first.
///
/// Each dequeued object is written into its own opcode stream. Pointers it writes are
/// followed when the target descends from one of the roots; other pointers are logged and
/// will be saved as null. Ancestors of a followed object are collected with it, so the
/// parent chain of every saved object is saved up to the roots.
pub fn collect_objects(roots: &[ObjectPtr], cancel: Option<&CancellationFlag>) -> Result<ObjectCollection> {
    let mut collection = ObjectCollection::new();
    let mut visited: HashSet<ObjectKey> = HashSet::new();
    let mut queue: VecDeque<ObjectPtr> = VecDeque::new();

    for root in roots {
        if visited.insert(ObjectKey::of(root)) {
            queue.push_back(root.clone());
        }
    }

    while let Some(object) = queue.pop_front() {
        if cancel.is_some_and(CancellationFlag::is_cancelled) {
            return Err(GraphPackError::Cancelled);
        }

        let mut stream = OpcodeStream::new();
        let mut references = ReferenceCollector::new();
        let mut writer = Writer::new(&mut stream, &mut references);
        object.write_binary(&mut writer)?;
        writer.finish()?;
        trace!("Collected {object:?}: {} opcodes", stream.len());

        for pointee in references.objects() {
            if !should_save(pointee, roots) {
                warn!(
                    "{object:?} points to {pointee:?}, which is outside the saved roots; the pointer is saved as null"
                );
                continue;
            }
            for ancestor in saved_chain(pointee, roots) {
                if visited.insert(ObjectKey::of(&ancestor)) {
                    queue.push_back(ancestor);
                }
            }
        }

        collection.add(CollectedObject {
            object,
            stream,
            references,
        })?;
    }

    let order = parent_first_order(&collection, roots);
    collection.reorder(&order)?;
    Ok(collection)
}

/// Returns true if `object` is one of the roots or descends from one.
fn should_save(object: &ObjectPtr, roots: &[ObjectPtr]) -> bool {
    roots.iter().any(|root| object.is_descendant_of(root))
}

/// `object` and its ancestors that are saved too, outermost first.
fn saved_chain(object: &ObjectPtr, roots: &[ObjectPtr]) -> Vec<ObjectPtr> {
    let mut chain = vec![object.clone()];
    let mut current = object.parent();
    while let Some(parent) = current {
        if !should_save(&parent, roots) {
            break;
        }
        current = parent.parent();
        chain.push(parent);
    }
    chain.reverse();
    chain
}

/// Orders nodes so that every collected ancestor precedes its descendants, keeping
/// discovery order otherwise.
fn parent_first_order(collection: &ObjectCollection, roots: &[ObjectPtr]) -> Vec<NodeId> {
    let mut placed: HashSet<NodeId> = HashSet::new();
    let mut order = Vec::with_capacity(collection.len());

    for node in collection.nodes() {
        for object in saved_chain(&node.object, roots) {
            if let Some(id) = collection.find(&object)
                && placed.insert(id)
            {
                order.push(id);
            }
        }
    }
    order
}
