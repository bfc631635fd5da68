//! The Reconnect Loop (spec §4.6): a periodic task that reconciles live
//! transport connections against the current snapshot's node set.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::adapters::Transport;
use crate::lifecycle::{LifecycleFlag, ServiceState};
use crate::snapshot::SnapshotStore;
use crate::state::NodeId;

/// How many consecutive failures to connect to the same node are allowed
/// before logging a warning (and resetting the counter) again.
const FAILURE_LOG_INTERVAL: u32 = 6;

/// Periodically walks the current snapshot's node set and makes sure the
/// transport layer holds a connection to every member other than the local
/// node, retrying nodes that previously failed and dropping connections to
/// nodes no longer present.
///
/// The per-node failure counters are owned solely by this loop's task — no
/// other task reads or writes them, so no locking is needed around them
/// (spec §4.6, §5).
pub struct ReconnectLoop<T> {
    state: Arc<LifecycleFlag>,
    snapshot: Arc<SnapshotStore>,
    transport: Arc<T>,
    interval: std::time::Duration,
}

impl<T> ReconnectLoop<T>
where
    T: Transport + Send + Sync + 'static,
{
    pub fn new(state: Arc<LifecycleFlag>, snapshot: Arc<SnapshotStore>, transport: Arc<T>, interval: std::time::Duration) -> Self {
        Self { state, snapshot, transport, interval }
    }

    /// Spawns the loop onto `runtime`. Returns a handle the caller aborts on
    /// shutdown.
    pub fn spawn(self, runtime: &tokio::runtime::Handle) -> tokio::task::JoinHandle<()> {
        runtime.spawn(self.run())
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so the loop's first
        // real reconciliation pass happens one full interval after start.
        ticker.tick().await;

        let mut failures: HashMap<NodeId, u32> = HashMap::new();

        loop {
            ticker.tick().await;
            if !self.state.is_started() {
                if matches!(self.state.get(), ServiceState::Stopped | ServiceState::Closed) {
                    break;
                }
                continue;
            }
            self.reconcile_once(&mut failures).await;
        }
    }

    async fn reconcile_once(&self, failures: &mut HashMap<NodeId, u32>) {
        let state = self.snapshot.load();
        let local_id = state.nodes.local_node_id();

        failures.retain(|id, _| state.nodes.contains(*id));

        for node in state.nodes.iter() {
            if node.id == local_id {
                continue;
            }
            if self.transport.node_connected(node.id) {
                failures.remove(&node.id);
                continue;
            }
            match self.transport.connect_to_node(node).await {
                Ok(()) => {
                    failures.remove(&node.id);
                }
                Err(err) => {
                    let count = failures.entry(node.id).or_insert(0);
                    *count += 1;
                    if *count % FAILURE_LOG_INTERVAL == 0 {
                        warn!(
                            node = %node.id,
                            address = %node.address,
                            consecutive_failures = *count,
                            error = %err,
                            "repeated reconnect failure"
                        );
                    }
                }
            }
        }
    }
}
