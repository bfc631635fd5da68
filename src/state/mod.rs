//! The cluster data model (spec §3): `ClusterState`, `MetaData`, `NodeSet`,
//! `DiscoveryNode` and `BlockSet`.

pub mod blocks;
pub mod cluster_state;
pub mod metadata;
pub mod nodes;

pub use blocks::{BlockSet, ClusterBlock, NO_RING_BLOCK, READ_ONLY_BLOCK};
pub use cluster_state::{is_same_instance, ClusterState, ClusterStateStatus};
pub use metadata::{IndexMetaData, IndexState, MetaData};
pub use nodes::{DiscoveryNode, NodeId, NodeSet, NodesDelta};
