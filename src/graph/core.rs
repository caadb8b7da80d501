use std::collections::HashMap;

use super::id::NodeId;
use crate::error::{GraphPackError, Result};
use crate::object::{ObjectKey, ObjectPtr};
use crate::stream::{OpcodeStream, ReferenceCollector};

/// One object after it was written through a [`Writer`](crate::stream::Writer): its opcode
/// stream and everything that stream references.
#[derive(Debug)]
pub struct CollectedObject {
    /// The live object.
    pub object: ObjectPtr,
    /// The opcodes it wrote.
    pub stream: OpcodeStream,
    /// The entities those opcodes reference.
    pub references: ReferenceCollector,
}

/// Arena of collected objects.
///
/// Nodes are stored in discovery order and addressed by [`NodeId`]; the arena drops them
/// all at once at the end of the save.
#[derive(Debug, Default)]
pub struct ObjectCollection {
    nodes: Vec<CollectedObject>,
    index: HashMap<ObjectKey, NodeId>,
}

impl ObjectCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object.
    ///
    /// Returns the `NodeId` of the newly added node.
    pub fn add(&mut self, node: CollectedObject) -> Result<NodeId> {
        let id = NodeId::new(
            u32::try_from(self.nodes.len())
                .map_err(|_| GraphPackError::Internal("More than u32::MAX objects".into()))?,
        );
        if self.index.insert(ObjectKey::of(&node.object), id).is_some() {
            return Err(GraphPackError::Internal(format!(
                "Object {:?} was collected twice",
                node.object
            )));
        }
        self.nodes.push(node);
        Ok(id)
    }

    /// Finds the node of a live object.
    pub fn find(&self, object: &ObjectPtr) -> Option<NodeId> {
        self.index.get(&ObjectKey::of(object)).copied()
    }

    /// Retrieves a node by its ID.
    pub fn get(&self, id: NodeId) -> Option<&CollectedObject> {
        self.nodes.get(id.index())
    }

    /// Reorders the arena. `order` must be a permutation of the current ids.
    pub(crate) fn reorder(&mut self, order: &[NodeId]) -> Result<()> {
        if order.len() != self.nodes.len() {
            return Err(GraphPackError::Internal(format!(
                "Ordering lists {} of {} objects",
                order.len(),
                self.nodes.len()
            )));
        }

        let mut slots: Vec<Option<CollectedObject>> = self.nodes.drain(..).map(Some).collect();
        for id in order {
            let node = slots
                .get_mut(id.index())
                .and_then(Option::take)
                .ok_or_else(|| GraphPackError::Internal(format!("Object {id} ordered twice")))?;
            self.nodes.push(node);
        }

        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (ObjectKey::of(&node.object), NodeId::new(i as u32)))
            .collect();
        Ok(())
    }

    /// Returns true if the collection has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// All nodes, in order.
    pub fn nodes(&self) -> &[CollectedObject] {
        &self.nodes
    }

    /// The live objects, in order.
    pub fn objects(&self) -> Vec<ObjectPtr> {
        self.nodes.iter().map(|n| n.object.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ClassType, Object};

    fn node(object: &ObjectPtr) -> CollectedObject {
        CollectedObject {
            object: object.clone(),
            stream: OpcodeStream::new(),
            references: ReferenceCollector::new(),
        }
    }

    #[test]
    fn reorder_permutes_and_reindexes() -> Result<()> {
        let class = ClassType::builder("Node").build();
        let a = Object::new(&class);
        let b = Object::new(&class);

        let mut collection = ObjectCollection::new();
        let ia = collection.add(node(&a))?;
        let ib = collection.add(node(&b))?;
        assert!(collection.add(node(&a)).is_err());

        collection.reorder(&[ib, ia])?;
        assert_eq!(collection.find(&b).map(|id| id.as_u32()), Some(0));
        assert_eq!(collection.find(&a).map(|id| id.as_u32()), Some(1));
        assert!(collection.reorder(&[ia, ia]).is_err());
        Ok(())
    }
}
