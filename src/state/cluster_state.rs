//! The immutable, versioned cluster-state snapshot (spec §3).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::blocks::BlockSet;
use super::metadata::MetaData;
use super::nodes::{DiscoveryNode, NodeSet};

/// Lifecycle status of a cluster-state instance as it moves through the
/// Update Executor's apply pipeline (spec §4.5 steps 5/11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStateStatus {
    Received,
    BeingApplied,
    Applied,
}

/// An immutable cluster-state value. Never mutated after construction; the
/// Update Executor builds a new instance and replaces the old one in the
/// Snapshot Store (spec §4.1, §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub state_uuid: String,
    pub nodes: NodeSet,
    pub blocks: BlockSet,
    pub metadata: MetaData,
    pub status: ClusterStateStatus,
}

impl ClusterState {
    /// Builds the very first state for a freshly started node.
    pub fn initial(local_node: DiscoveryNode, cluster_uuid: impl Into<String>) -> Self {
        Self {
            version: 0,
            state_uuid: Uuid::new_v4().to_string(),
            nodes: NodeSet::with_local_node(local_node),
            blocks: BlockSet::with_initial_blocks(),
            metadata: MetaData::new(cluster_uuid),
            status: ClusterStateStatus::Received,
        }
    }

    /// Returns a copy of this state with a strictly greater `version` and a
    /// fresh `state_uuid`, otherwise identical. Used by `UpdateTask::execute`
    /// implementations to build the candidate "next" state.
    pub fn next_version(&self) -> Self {
        Self {
            version: self.version + 1,
            state_uuid: Uuid::new_v4().to_string(),
            nodes: self.nodes.clone(),
            blocks: self.blocks.clone(),
            metadata: self.metadata.clone(),
            status: ClusterStateStatus::Received,
        }
    }

    pub fn with_nodes(mut self, nodes: NodeSet) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_blocks(mut self, blocks: BlockSet) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn with_metadata(mut self, metadata: MetaData) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_status(mut self, status: ClusterStateStatus) -> Self {
        self.status = status;
        self
    }
}

/// Pointer-identity comparison between two snapshots, standing in for the
/// source's reference-identity check on `prev == next` (spec §3 invariants,
/// §4.5 step 4): a task that returns its input unchanged must be detected
/// without relying on structural equality over possibly-large metadata.
pub fn is_same_instance(a: &Arc<ClusterState>, b: &Arc<ClusterState>) -> bool {
    Arc::ptr_eq(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn local_node() -> DiscoveryNode {
        DiscoveryNode::new("local", "127.0.0.1:9300".parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn initial_state_has_version_zero_and_no_ring_block() {
        let state = ClusterState::initial(local_node(), "uuid-1");
        assert_eq!(state.version, 0);
        assert!(state.blocks.disables_metadata_persistence());
        assert_eq!(state.status, ClusterStateStatus::Received);
    }

    #[test]
    fn next_version_strictly_increases_and_changes_uuid() {
        let state = Arc::new(ClusterState::initial(local_node(), "uuid-1"));
        let next = state.next_version();
        assert_eq!(next.version, state.version + 1);
        assert_ne!(next.state_uuid, state.state_uuid);
    }

    #[test]
    fn same_instance_detects_pointer_identity() {
        let a = Arc::new(ClusterState::initial(local_node(), "uuid-1"));
        let b = a.clone();
        let c = Arc::new(ClusterState::initial(local_node(), "uuid-1"));
        assert!(is_same_instance(&a, &b));
        assert!(!is_same_instance(&a, &c));
    }
}
