//! The Master-Role Watcher (spec §4.3): a derived listener that fires
//! `on_master`/`off_master` transitions to registered role listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::listener::{ClusterChangedEvent, Listener};

/// A component interested in this node's master/non-master transitions.
pub trait RoleListener: Send + Sync {
    fn on_master(&self);
    fn off_master(&self);

    /// The name of the executor this listener's callbacks should run on.
    /// Unrecognised names fall back to the runtime's default executor
    /// (spec §4.3, §4.8 `threadPool.executor(name)`).
    fn executor_name(&self) -> &str {
        "generic"
    }
}

/// Tracks whether the local node is currently master and fans out
/// transitions to registered [`RoleListener`]s.
pub struct MasterRoleWatcher {
    is_master: AtomicBool,
    role_listeners: Mutex<Vec<Arc<dyn RoleListener>>>,
    runtime: tokio::runtime::Handle,
}

impl MasterRoleWatcher {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            is_master: AtomicBool::new(false),
            role_listeners: Mutex::new(Vec::new()),
            runtime,
        }
    }

    pub fn add_role_listener(&self, listener: Arc<dyn RoleListener>) {
        self.role_listeners.lock().expect("role listener lock poisoned").push(listener);
    }

    pub fn is_master(&self) -> bool {
        self.is_master.load(Ordering::SeqCst)
    }
}

impl Listener for MasterRoleWatcher {
    fn cluster_changed(&self, event: &ClusterChangedEvent) {
        let now_master = event.local_node_is_master();
        let was_master = self.is_master.swap(now_master, Ordering::SeqCst);
        if was_master == now_master {
            return;
        }

        debug!(now_master, "local node master-role transition");
        let listeners = self.role_listeners.lock().expect("role listener lock poisoned").clone();
        for listener in listeners {
            let executor = listener.executor_name().to_string();
            // Each dispatched notification is an independent task; a panic
            // or error in one listener never affects another (spec §4.3).
            self.runtime.spawn(async move {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    if now_master {
                        listener.on_master();
                    } else {
                        listener.off_master();
                    }
                }));
                if outcome.is_err() {
                    warn!(executor = %executor, "role listener panicked during dispatch");
                }
            });
        }
    }
}
