//! External collaborators consumed by the core, specified only by the
//! operations called on them (spec §4.8, §6). None of these are
//! implemented by this crate in production — the ring storage engine,
//! transport layer and gossip protocol live elsewhere. `Noop*` fakes are
//! provided so the crate is runnable standalone and so tests exercise the
//! real executor pipeline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::RingError;
use crate::state::{ClusterState, DiscoveryNode, MetaData, NodeId};

/// CAS-style metadata persistence through the ring storage engine.
pub trait RingStore: Send + Sync {
    /// Best-effort initialisation of the backing keyspace/storage, run once
    /// at service start. Failures are logged and otherwise ignored — the
    /// `NO_RING_BLOCK` stays installed until a metadata persist actually
    /// succeeds (spec §4.7 `start`).
    fn init_keyspace(&self) -> impl std::future::Future<Output = Result<(), RingError>> + Send {
        async { Ok(()) }
    }

    /// Persists `next` iff the currently stored metadata matches `prev`
    /// (spec §4.5 step 3b, §7). Fails with
    /// [`RingError::ConcurrentMetaDataUpdate`] on a CAS mismatch.
    fn persist_metadata(
        &self,
        prev: &MetaData,
        next: &MetaData,
        source: &str,
    ) -> impl std::future::Future<Output = Result<(), RingError>> + Send;
}

/// Gossip-based state publication and metadata-version acknowledgement.
pub trait Discovery: Send + Sync {
    /// Fire-and-forget publication of a newly-installed state.
    fn publish(&self, state: &ClusterState);

    /// Blocks (cooperatively) up to `timeout` until gossip observes
    /// `version` acknowledged by all reachable peers.
    fn await_metadata_version(
        &self,
        version: u64,
        timeout: Duration,
    ) -> impl std::future::Future<Output = bool> + Send;
}

/// Point-to-point transport connection management.
pub trait Transport: Send + Sync {
    fn connect_to_node(&self, node: &DiscoveryNode) -> impl std::future::Future<Output = Result<(), RingError>> + Send;
    fn disconnect_from_node(&self, node: &DiscoveryNode) -> impl std::future::Future<Output = Result<(), RingError>> + Send;
    fn node_connected(&self, node: NodeId) -> bool;
}

/// An in-memory `RingStore` that always succeeds, for tests and standalone
/// runs. Tracks the last persisted metadata to honour the CAS contract.
#[derive(Default)]
pub struct NoopRingStore {
    stored: Mutex<Option<MetaData>>,
}

impl RingStore for NoopRingStore {
    async fn persist_metadata(&self, prev: &MetaData, next: &MetaData, _source: &str) -> Result<(), RingError> {
        let mut stored = self.stored.lock().expect("noop ring store lock poisoned");
        if let Some(current) = stored.as_ref() {
            if current.cluster_uuid != prev.cluster_uuid || current.version != prev.version {
                return Err(RingError::ConcurrentMetaDataUpdate);
            }
        }
        *stored = Some(next.clone());
        Ok(())
    }
}

/// An in-memory `Discovery` that publishes into a log and always reports
/// the target version as acknowledged.
#[derive(Default)]
pub struct NoopDiscovery {
    published: Mutex<Vec<ClusterState>>,
}

impl NoopDiscovery {
    pub fn published_count(&self) -> usize {
        self.published.lock().expect("noop discovery lock poisoned").len()
    }
}

impl Discovery for NoopDiscovery {
    fn publish(&self, state: &ClusterState) {
        self.published.lock().expect("noop discovery lock poisoned").push(state.clone());
    }

    async fn await_metadata_version(&self, _version: u64, _timeout: Duration) -> bool {
        true
    }
}

/// An in-memory `Transport` whose connect/disconnect calls always succeed
/// and record connectivity per node.
#[derive(Default)]
pub struct NoopTransport {
    connected: Mutex<HashMap<NodeId, bool>>,
}

impl Transport for NoopTransport {
    async fn connect_to_node(&self, node: &DiscoveryNode) -> Result<(), RingError> {
        self.connected.lock().expect("noop transport lock poisoned").insert(node.id, true);
        Ok(())
    }

    async fn disconnect_from_node(&self, node: &DiscoveryNode) -> Result<(), RingError> {
        self.connected.lock().expect("noop transport lock poisoned").insert(node.id, false);
        Ok(())
    }

    fn node_connected(&self, node: NodeId) -> bool {
        self.connected
            .lock()
            .expect("noop transport lock poisoned")
            .get(&node)
            .copied()
            .unwrap_or(false)
    }
}
