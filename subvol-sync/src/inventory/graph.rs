//! Parent/child relationships between subvolumes of one filesystem.
//!
//! The listing is flat; each node only names its parent's uuid. Edges are
//! kept as uuid values, so a parent that has expired (retention) simply does
//! not resolve and the child becomes an orphan.

use super::{NodeState, SubvolumeNode};
use crate::utils::PlanningError;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
pub struct RelationshipGraph {
    /// Nodes in enumeration order
    nodes: Vec<SubvolumeNode>,
    by_uuid: HashMap<Uuid, usize>,
    by_path: HashMap<String, usize>,
    /// received uuid -> committed nodes carrying it
    by_received: HashMap<Uuid, Vec<usize>>,
    /// child uuid -> parent uuid, as recorded (resolved or not)
    edges: HashMap<Uuid, Uuid>,
}

impl RelationshipGraph {
    pub fn new(nodes: Vec<SubvolumeNode>) -> Self {
        let mut graph = Self {
            by_uuid: HashMap::with_capacity(nodes.len()),
            by_path: HashMap::with_capacity(nodes.len()),
            ..Self::default()
        };
        for (idx, node) in nodes.iter().enumerate() {
            graph.by_uuid.insert(node.uuid, idx);
            graph.by_path.insert(node.path.clone(), idx);
            if let Some(parent) = node.parent_uuid {
                graph.edges.insert(node.uuid, parent);
            }
            if let (Some(received), NodeState::Committed) = (node.received_uuid, node.state()) {
                graph.by_received.entry(received).or_default().push(idx);
            }
        }
        graph.nodes = nodes;
        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in enumeration order
    pub fn nodes(&self) -> &[SubvolumeNode] {
        &self.nodes
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&SubvolumeNode> {
        self.by_uuid.get(uuid).map(|&idx| &self.nodes[idx])
    }

    pub fn by_path(&self, path: &str) -> Option<&SubvolumeNode> {
        self.by_path.get(path).map(|&idx| &self.nodes[idx])
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.by_path.contains_key(path)
    }

    /// Committed nodes whose received uuid is `identity`
    pub fn received_from(&self, identity: &Uuid) -> impl Iterator<Item = &SubvolumeNode> {
        self.by_received
            .get(identity)
            .into_iter()
            .flatten()
            .map(|&idx| &self.nodes[idx])
    }

    /// Resolved parent of `uuid`
    pub fn parent(&self, uuid: &Uuid) -> Option<&SubvolumeNode> {
        self.edges.get(uuid).and_then(|parent| self.get(parent))
    }

    /// Node names a parent that is not part of this filesystem's set
    pub fn is_orphan(&self, node: &SubvolumeNode) -> bool {
        node.parent_uuid.is_some_and(|p| !self.by_uuid.contains_key(&p))
    }

    /// Nodes that record a parent, resolved or not
    pub fn parent_count(&self) -> usize {
        self.edges.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.nodes.iter().filter(|n| self.is_orphan(n)).count()
    }

    /// Ancestors of `uuid`, nearest first, up to the earliest tracked one.
    /// A parent reference that does not resolve ends the chain.
    pub fn ancestors(&self, uuid: &Uuid) -> Result<Vec<&SubvolumeNode>, PlanningError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::from([*uuid]);
        let mut current = *uuid;

        while let Some(parent) = self.parent(&current) {
            if !visited.insert(parent.uuid) {
                let path = self
                    .get(uuid)
                    .map(|n| n.path.clone())
                    .unwrap_or_else(|| uuid.to_string());
                return Err(PlanningError::Cycle { path });
            }
            chain.push(parent);
            current = parent.uuid;
        }
        Ok(chain)
    }

    /// Earliest tracked ancestor, `None` for a root or an orphan
    pub fn earliest_ancestor(&self, uuid: &Uuid) -> Result<Option<&SubvolumeNode>, PlanningError> {
        Ok(self.ancestors(uuid)?.last().copied())
    }
}
