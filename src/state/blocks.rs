//! Cluster-wide blocks that gate operations (spec §3 / §6).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A single cluster-wide block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterBlock {
    pub id: u32,
    pub description: &'static str,
    pub retryable: bool,
}

/// The block installed at startup that gates metadata persistence until the
/// storage ring signals readiness (spec §6).
pub const NO_RING_BLOCK: ClusterBlock = ClusterBlock {
    id: 1,
    description: "no ring storage endpoint available yet",
    retryable: true,
};

/// A block gating write-type tasks when the cluster is read-only.
pub const READ_ONLY_BLOCK: ClusterBlock = ClusterBlock {
    id: 2,
    description: "cluster is read-only",
    retryable: false,
};

/// A set of active cluster blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockSet {
    blocks: BTreeSet<ClusterBlock>,
}

impl BlockSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_initial_blocks() -> Self {
        let mut blocks = BTreeSet::new();
        blocks.insert(NO_RING_BLOCK);
        Self { blocks }
    }

    pub fn add(&self, block: ClusterBlock) -> Self {
        let mut blocks = self.blocks.clone();
        blocks.insert(block);
        Self { blocks }
    }

    pub fn remove(&self, block: &ClusterBlock) -> Self {
        let mut blocks = self.blocks.clone();
        blocks.remove(block);
        Self { blocks }
    }

    pub fn has(&self, block: &ClusterBlock) -> bool {
        self.blocks.contains(block)
    }

    /// Whether metadata persistence is disabled by any currently-installed
    /// block. `doPersistMetaData` gating on the task is cumulative with this
    /// (spec §9 Open Questions): either one disables persistence.
    pub fn disables_metadata_persistence(&self) -> bool {
        self.has(&NO_RING_BLOCK)
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
