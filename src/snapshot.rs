//! The Snapshot Store (spec §4.1): a single atomically-replaceable
//! reference to the current `ClusterState`.

use std::sync::{Arc, RwLock};

use crate::state::ClusterState;

/// Holds the current cluster-state snapshot.
///
/// Reads are lock-free in the sense that they never block a concurrent
/// `store()` for longer than an `Arc` clone; writes happen only from the
/// Update Executor task (spec §4.1, §5).
pub struct SnapshotStore {
    current: RwLock<Arc<ClusterState>>,
}

impl SnapshotStore {
    pub fn new(initial: ClusterState) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Loads the most recently installed snapshot.
    pub fn load(&self) -> Arc<ClusterState> {
        self.current.read().expect("snapshot store lock poisoned").clone()
    }

    /// Installs a new snapshot. Must only be called from the Update
    /// Executor task.
    pub fn store(&self, next: Arc<ClusterState>) {
        *self.current.write().expect("snapshot store lock poisoned") = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DiscoveryNode;

    fn local_node() -> DiscoveryNode {
        DiscoveryNode::new("local", "127.0.0.1:9300".parse().unwrap())
    }

    #[test]
    fn load_reflects_most_recent_store() {
        let initial = ClusterState::initial(local_node(), "uuid-1");
        let store = SnapshotStore::new(initial);
        let first = store.load();
        assert_eq!(first.version, 0);

        let next = Arc::new(first.next_version());
        store.store(next.clone());

        let loaded = store.load();
        assert_eq!(loaded.version, 1);
        assert!(Arc::ptr_eq(&loaded, &next));
    }
}
