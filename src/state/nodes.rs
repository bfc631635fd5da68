//! Discovery nodes and the node set delta used to drive transport reconnect.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a single node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Generates a fresh node identity.
    ///
    /// Per spec §6/§4.7, this is never persisted across restarts: a
    /// restarted process is a *new* node as far as peer fault detectors are
    /// concerned.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single member of the cluster's node set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub name: String,
    pub address: SocketAddr,
    pub attributes: BTreeMap<String, String>,
    /// Monotonic build/version tag, used only for diagnostics.
    pub version_tag: String,
}

impl DiscoveryNode {
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            id: NodeId::generate(),
            name: name.into(),
            address,
            attributes: BTreeMap::new(),
            version_tag: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The outcome of comparing two node sets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodesDelta {
    pub added: Vec<DiscoveryNode>,
    pub removed: Vec<DiscoveryNode>,
}

impl NodesDelta {
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// The ordered set of nodes known to the cluster, plus the designated
/// local node and (optionally) the current master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSet {
    nodes: BTreeMap<NodeId, Arc<DiscoveryNode>>,
    local_node_id: NodeId,
    master_node_id: Option<NodeId>,
}

impl NodeSet {
    /// Builds a node set containing only the local node.
    pub fn with_local_node(local: DiscoveryNode) -> Self {
        let id = local.id;
        let mut nodes = BTreeMap::new();
        nodes.insert(id, Arc::new(local));
        Self {
            nodes,
            local_node_id: id,
            master_node_id: None,
        }
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn master_node_id(&self) -> Option<NodeId> {
        self.master_node_id
    }

    pub fn local_node_is_master(&self) -> bool {
        self.master_node_id == Some(self.local_node_id)
    }

    pub fn set_master(&mut self, id: Option<NodeId>) {
        self.master_node_id = id;
    }

    pub fn get(&self, id: NodeId) -> Option<&Arc<DiscoveryNode>> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DiscoveryNode>> {
        self.nodes.values()
    }

    /// Returns a copy of this node set with `node` added (or replaced).
    pub fn with_added(&self, node: DiscoveryNode) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.insert(node.id, Arc::new(node));
        Self {
            nodes,
            local_node_id: self.local_node_id,
            master_node_id: self.master_node_id,
        }
    }

    /// Returns a copy of this node set with `id` removed.
    pub fn with_removed(&self, id: NodeId) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.remove(&id);
        let master_node_id = if self.master_node_id == Some(id) {
            None
        } else {
            self.master_node_id
        };
        Self {
            nodes,
            local_node_id: self.local_node_id,
            master_node_id,
        }
    }

    /// Computes the set of nodes added/removed going from `prev` to `next`.
    pub fn delta(prev: &NodeSet, next: &NodeSet) -> NodesDelta {
        let added = next
            .nodes
            .iter()
            .filter(|(id, _)| !prev.nodes.contains_key(id))
            .map(|(_, n)| n.as_ref().clone())
            .collect();
        let removed = prev
            .nodes
            .iter()
            .filter(|(id, _)| !next.nodes.contains_key(id))
            .map(|(_, n)| n.as_ref().clone())
            .collect();
        NodesDelta { added, removed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> DiscoveryNode {
        DiscoveryNode::new(name, "127.0.0.1:9300".parse().unwrap())
    }

    #[test]
    fn delta_detects_added_and_removed() {
        let a = node("a");
        let b = node("b");
        let prev = NodeSet::with_local_node(a.clone()).with_added(b.clone());
        let next = NodeSet::with_local_node(a).with_added(node("c"));

        let delta = NodeSet::delta(&prev, &next);
        assert!(delta.has_changes());
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].name, "b");
    }

    #[test]
    fn delta_empty_when_unchanged() {
        let a = node("a");
        let set = NodeSet::with_local_node(a);
        let delta = NodeSet::delta(&set, &set);
        assert!(!delta.has_changes());
    }

    #[test]
    fn removing_master_clears_master_id() {
        let a = node("a");
        let id = a.id;
        let mut set = NodeSet::with_local_node(a);
        set.set_master(Some(id));
        let next = set.with_removed(id);
        assert_eq!(next.master_node_id(), None);
    }
}
