//! `UpdateTask` and the priority scheme that orders the Update Executor's
//! queue (spec §3, §5).

use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RingError;
use crate::state::{ClusterState, DiscoveryNode};

/// Submission priority. Ordered so that `Immediate` sorts highest;
/// `#[derive(Ord)]`'s declaration order gives us that for free as long as
/// the executor's heap compares "higher priority first".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Languid,
    Low,
    Normal,
    High,
    Urgent,
    Immediate,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The strategy a submitted task uses to learn that all required nodes
/// have acknowledged its installed state (spec §9 Open Questions: the
/// `AckCoordinator` and gossip-driven `awaitMetaDataVersion` are both
/// preserved; a task picks one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckWaitStrategy {
    /// Use the in-process `AckCoordinator` (per-node `onNodeAck` callbacks).
    Coordinator,
    /// Block on `Discovery::await_metadata_version` (gossip-driven).
    Gossip,
}

/// Flags carried by an `UpdateTask`, mirroring spec §3's `UpdateTask.flags`.
#[derive(Debug, Clone, Copy)]
pub struct TaskFlags {
    /// Whether the submitter wants an ack-completion callback.
    pub acked: bool,
    /// Whether the submitter wants a `cluster_state_processed` callback.
    pub processed: bool,
    /// Whether a metadata change, if any, must be durably persisted before
    /// the new state is installed.
    pub must_apply_metadata: bool,
    /// Gate on whether this task is allowed to persist metadata at all
    /// (named `doPresistMetaData` in the source, sic, per spec §9).
    pub do_persist_metadata: bool,
    /// Deadline for `on_all_nodes_acked`/`on_ack_timeout`.
    pub ack_timeout: Duration,
    /// Deadline for the task itself to be dequeued and begin executing.
    pub task_timeout: Option<Duration>,
    /// Which mechanism to use when waiting for acks.
    pub ack_wait_strategy: AckWaitStrategy,
}

impl Default for TaskFlags {
    fn default() -> Self {
        Self {
            acked: false,
            processed: true,
            must_apply_metadata: true,
            do_persist_metadata: true,
            ack_timeout: Duration::from_secs(30),
            task_timeout: None,
            ack_wait_strategy: AckWaitStrategy::Gossip,
        }
    }
}

/// A failure raised while running `UpdateTask::execute`.
#[derive(Debug, Clone)]
pub struct TaskError(pub String);

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TaskError {}

/// A unit of cluster-state mutation submitted to the Update Executor.
///
/// One-shot: a given `UpdateTask` instance is run by `execute` at most once,
/// except for the single CAS-conflict replay described in spec §4.5 step 3c,
/// which resubmits the *same* task value at `Priority::Urgent`.
pub trait UpdateTask: Send + Sync {
    /// A short, human-readable description used in logs and in
    /// `pending_tasks()` output.
    fn source(&self) -> &str;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    fn flags(&self) -> TaskFlags {
        TaskFlags::default()
    }

    /// Computes the candidate next state from the current snapshot. Return
    /// `Ok(prev.clone())` (same `Arc`) to signal "no change" and take the
    /// fast path (spec §4.5 step 4).
    fn execute(&self, prev: &Arc<ClusterState>) -> Result<Arc<ClusterState>, TaskError>;

    /// Called when `execute` fails, or when persistence fails for a reason
    /// other than CAS conflict.
    fn on_failure(&self, source: &str, error: &TaskError) {
        let _ = (source, error);
    }

    /// Called once the snapshot has been installed and (if applicable)
    /// pre-applied listener notification has completed.
    fn cluster_state_processed(&self, source: &str, prev: &Arc<ClusterState>, next: &Arc<ClusterState>) {
        let _ = (source, prev, next);
    }

    /// Whether acknowledgement from `node` is required for this task's
    /// ack countdown. The master's ack is always awaited regardless of
    /// this return value (spec §4.4).
    fn must_ack(&self, node: &DiscoveryNode) -> bool {
        let _ = node;
        true
    }

    /// Terminal callback: fires exactly once, either when the ack
    /// countdown reaches zero or never (no-change fast path and non-acked
    /// tasks call this inline with `None`).
    fn on_all_nodes_acked(&self, last_error: Option<RingError>) {
        let _ = last_error;
    }

    /// Terminal callback: fires exactly once if the ack deadline elapses
    /// before the countdown reaches zero.
    fn on_ack_timeout(&self) {}
}

/// A point-in-time description of a queued or executing task, returned by
/// `pending_tasks()` (spec §6).
#[derive(Debug, Clone)]
pub struct PendingTaskInfo {
    pub insertion_order: u64,
    pub priority: Priority,
    pub source: String,
    pub age: Duration,
    pub executing: bool,
}

/// Produces the `"unknown[<typename>]"` fallback source label for a task
/// that did not provide a descriptive `source()` (spec §6).
pub fn fallback_source<T: ?Sized>() -> String {
    format!("unknown[{}]", type_name::<T>())
}
