//! The Update Executor (spec §4.5): a single-threaded priority scheduler
//! that runs submitted `UpdateTask`s to completion, one at a time, driving
//! the full apply pipeline.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::ack::AckCoordinator;
use crate::adapters::{Discovery, RingStore, Transport};
use crate::config::RefreshableSettings;
use crate::error::RingError;
use crate::lifecycle::{LifecycleFlag, ServiceState};
use crate::listener::{ClusterChangedEvent, Listener, ListenerRegistry};
use crate::snapshot::SnapshotStore;
use crate::state::{is_same_instance, ClusterStateStatus, NodeSet};
use crate::task::{fallback_source, AckWaitStrategy, PendingTaskInfo, Priority, TaskError, UpdateTask};

tokio::task_local! {
    static ON_UPDATE_WORKER: ();
}

/// Diagnostic predicate: true only when called from inside the Update
/// Executor's worker task (spec §6's thread-identity assertion).
pub fn thread_is_update_worker() -> bool {
    ON_UPDATE_WORKER.try_with(|_| ()).is_ok()
}

/// A queue entry: either a caller-submitted task, or an internal action the
/// core itself schedules onto the worker (e.g. `addWithTimeout`'s
/// on-update-thread insertion). Modeling this as a sum type avoids the
/// structural downcasts the pending-task introspection would otherwise need
/// (spec §9 Design Notes).
enum QueueEntry {
    User {
        task: Arc<dyn UpdateTask>,
        /// Claimed exactly once, either by the worker dequeuing it or by
        /// its per-task timeout firing first — whichever wins runs; the
        /// other becomes a no-op (spec §4.5, §5).
        claimed: Arc<AtomicBool>,
    },
    Internal {
        action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    },
}

struct QueuedItem {
    priority: Priority,
    insertion_order: u64,
    source: String,
    enqueued_at: Instant,
    entry: QueueEntry,
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.insertion_order == other.insertion_order
    }
}

impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: higher priority must compare greater.
        // Within equal priority, the earlier insertion must compare
        // greater too, so ties break FIFO.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.insertion_order.cmp(&self.insertion_order))
    }
}

/// The single-threaded priority-queue scheduler described in spec §4.5.
pub struct UpdateExecutor<R, D, T> {
    queue: Mutex<BinaryHeap<QueuedItem>>,
    notify: Notify,
    next_insertion_order: AtomicU64,
    executing: Mutex<Option<(String, Priority, u64, Instant)>>,
    /// Live [`AckCoordinator`]s keyed by the metadata version they're
    /// counting down, so inbound ack messages from the transport layer can
    /// be routed back in via [`Self::deliver_node_ack`] (spec §4.4).
    ack_coordinators: Mutex<HashMap<u64, Arc<AckCoordinator>>>,
    state: Arc<LifecycleFlag>,
    snapshot: Arc<SnapshotStore>,
    registry: Arc<ListenerRegistry>,
    ring: Arc<R>,
    discovery: Arc<D>,
    transport: Arc<T>,
    settings: RefreshableSettings,
    runtime: tokio::runtime::Handle,
}

impl<R, D, T> UpdateExecutor<R, D, T>
where
    R: RingStore + Send + Sync + 'static,
    D: Discovery + Send + Sync + 'static,
    T: Transport + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<LifecycleFlag>,
        snapshot: Arc<SnapshotStore>,
        registry: Arc<ListenerRegistry>,
        ring: Arc<R>,
        discovery: Arc<D>,
        transport: Arc<T>,
        settings: RefreshableSettings,
        runtime: tokio::runtime::Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_insertion_order: AtomicU64::new(0),
            executing: Mutex::new(None),
            ack_coordinators: Mutex::new(HashMap::new()),
            state,
            snapshot,
            registry,
            ring,
            discovery,
            transport,
            settings,
            runtime,
        })
    }

    /// Spawns the dedicated worker task. Only one must ever be spawned per
    /// executor — the single-writer invariant depends on it (spec §5).
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        self.runtime.spawn(async move { Self::run(this).await })
    }

    /// Wakes the worker so it re-checks lifecycle state (used by `stop`).
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Submits a task at its own declared priority.
    pub fn submit_task(&self, task: Arc<dyn UpdateTask>) -> crate::error::Result<()> {
        self.submit_task_with_priority(task, None)
    }

    fn submit_task_with_priority(&self, task: Arc<dyn UpdateTask>, priority_override: Option<Priority>) -> crate::error::Result<()> {
        if matches!(self.state.get(), ServiceState::Stopped | ServiceState::Closed) {
            debug!("update task submission silently dropped: executor is not started");
            return Ok(());
        }

        let raw_source = task.source();
        let source = if raw_source.is_empty() {
            fallback_source::<dyn UpdateTask>()
        } else {
            raw_source.to_string()
        };
        let priority = priority_override.unwrap_or_else(|| task.priority());
        let flags = task.flags();
        let claimed = Arc::new(AtomicBool::new(false));
        let insertion_order = self.next_insertion_order.fetch_add(1, Ordering::SeqCst);

        if let Some(timeout) = flags.task_timeout {
            let claimed_for_timeout = claimed.clone();
            let task_for_timeout = task.clone();
            let source_for_timeout = source.clone();
            self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if claimed_for_timeout
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    let err = TaskError("update task timed out waiting to be scheduled".to_string());
                    task_for_timeout.on_failure(&source_for_timeout, &err);
                }
            });
        }

        let item = QueuedItem {
            priority,
            insertion_order,
            source,
            enqueued_at: Instant::now(),
            entry: QueueEntry::User { task, claimed },
        };
        self.queue.lock().expect("executor queue lock poisoned").push(item);
        self.notify.notify_one();
        Ok(())
    }

    /// Submits an internal, HIGH-priority action that runs on the update
    /// worker (used by `addWithTimeout`'s on-thread insertion, spec §4.2).
    pub fn submit_internal<F>(&self, source: impl Into<String>, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if matches!(self.state.get(), ServiceState::Stopped | ServiceState::Closed) {
            return;
        }
        let insertion_order = self.next_insertion_order.fetch_add(1, Ordering::SeqCst);
        let item = QueuedItem {
            priority: Priority::High,
            insertion_order,
            source: source.into(),
            enqueued_at: Instant::now(),
            entry: QueueEntry::Internal { action: Mutex::new(Some(Box::new(action))) },
        };
        self.queue.lock().expect("executor queue lock poisoned").push(item);
        self.notify.notify_one();
    }

    pub fn pending_tasks(&self) -> Vec<PendingTaskInfo> {
        let now = Instant::now();
        let mut out: Vec<PendingTaskInfo> = self
            .queue
            .lock()
            .expect("executor queue lock poisoned")
            .iter()
            .map(|item| PendingTaskInfo {
                insertion_order: item.insertion_order,
                priority: item.priority,
                source: item.source.clone(),
                age: now.saturating_duration_since(item.enqueued_at),
                executing: false,
            })
            .collect();

        if let Some((source, priority, insertion_order, started)) =
            self.executing.lock().expect("executing lock poisoned").clone()
        {
            out.push(PendingTaskInfo {
                insertion_order,
                priority,
                source,
                age: now.saturating_duration_since(started),
                executing: true,
            });
        }
        out
    }

    /// Routes an inbound ack from the transport layer to the coordinator
    /// counting down the metadata version it acknowledges. A no-op if no
    /// coordinator is (or is still) waiting on that version.
    pub fn deliver_node_ack(&self, version: u64, node_is_master: bool, required: bool, error: Option<RingError>) {
        let coordinator = self
            .ack_coordinators
            .lock()
            .expect("ack coordinator map lock poisoned")
            .get(&version)
            .cloned();
        let Some(coordinator) = coordinator else { return };
        coordinator.on_node_ack(node_is_master, required, error);
        if coordinator.has_completed() {
            self.ack_coordinators
                .lock()
                .expect("ack coordinator map lock poisoned")
                .remove(&version);
        }
    }

    pub fn number_of_pending_tasks(&self) -> u32 {
        self.queue.lock().expect("executor queue lock poisoned").len() as u32
    }

    pub fn max_task_wait_time(&self) -> Duration {
        self.pending_tasks().into_iter().map(|t| t.age).max().unwrap_or_default()
    }

    fn log_slow_if_needed(&self, source: &str, elapsed: Duration) {
        let threshold = self.settings.current().slow_task_logging_threshold();
        if elapsed > threshold {
            warn!(
                source,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                "slow cluster update task"
            );
        }
    }

    async fn run(this: Arc<Self>) {
        ON_UPDATE_WORKER
            .scope((), async {
                loop {
                    let notified = this.notify.notified();
                    if let Some(item) = this.pop_ready() {
                        Self::run_one(&this, item).await;
                        continue;
                    }
                    if matches!(this.state.get(), ServiceState::Stopped | ServiceState::Closed) {
                        break;
                    }
                    notified.await;
                }
            })
            .await;
    }

    fn pop_ready(&self) -> Option<QueuedItem> {
        let mut queue = self.queue.lock().expect("executor queue lock poisoned");
        loop {
            let item = queue.pop()?;
            if let QueueEntry::User { claimed, .. } = &item.entry {
                if claimed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    // Already claimed by its per-task timeout; drop it.
                    continue;
                }
            }
            return Some(item);
        }
    }

    async fn run_one(this: &Arc<Self>, item: QueuedItem) {
        *this.executing.lock().expect("executing lock poisoned") =
            Some((item.source.clone(), item.priority, item.insertion_order, Instant::now()));

        match item.entry {
            QueueEntry::Internal { action } => {
                if let Some(f) = action.into_inner().expect("internal action lock poisoned") {
                    f();
                }
            }
            QueueEntry::User { task, .. } => {
                Self::run_pipeline(this, task, item.source).await;
            }
        }

        *this.executing.lock().expect("executing lock poisoned") = None;
    }

    /// The thirteen-step apply pipeline (spec §4.5).
    async fn run_pipeline(this: &Arc<Self>, task: Arc<dyn UpdateTask>, source: String) {
        let start = Instant::now();

        // Step 1: guard.
        if !this.state.is_started() {
            debug!(source = %source, "dropping update task: service not started");
            return;
        }

        let prev = this.snapshot.load();

        // Step 2: execute.
        let next = match task.execute(&prev) {
            Ok(next) => next,
            Err(err) => {
                this.log_slow_if_needed(&source, start.elapsed());
                task.on_failure(&source, &err);
                return;
            }
        };

        let flags = task.flags();
        let mut next = next;

        // Step 3: serialise and compare metadata.
        let prev_digest = prev.metadata.persisted_digest();
        let next_digest = next.metadata.persisted_digest();
        let metadata_changed = match (&prev_digest, &next_digest) {
            (Ok(p), Ok(n)) => p != n,
            _ => {
                warn!(source = %source, "failed to serialize metadata for persisted-form comparison");
                false
            }
        };

        if metadata_changed && !prev.blocks.disables_metadata_persistence() && flags.do_persist_metadata {
            let mut candidate = (*next).clone();
            candidate.metadata = candidate.metadata.with_bumped_version();
            candidate.version = prev.version + 1;
            let candidate = Arc::new(candidate);

            match this.ring.persist_metadata(&prev.metadata, &candidate.metadata, &source).await {
                Ok(()) => next = candidate,
                Err(RingError::ConcurrentMetaDataUpdate) => {
                    Self::register_cas_conflict_replay(this, task, source);
                    return;
                }
                Err(other) => {
                    let task_err = TaskError(other.to_string());
                    this.log_slow_if_needed(&source, start.elapsed());
                    task.on_failure(&source, &task_err);
                    return;
                }
            }
        }

        // Step 4: no-change fast path.
        if is_same_instance(&prev, &next) {
            if flags.acked {
                task.on_all_nodes_acked(None);
            }
            if flags.processed {
                task.cluster_state_processed(&source, &prev, &next);
            }
            this.log_slow_if_needed(&source, start.elapsed());
            return;
        }

        // Step 5: apply.
        let mut being_applied = (*next).clone();
        being_applied.status = ClusterStateStatus::BeingApplied;
        let next = Arc::new(being_applied);
        let delta = NodeSet::delta(&prev.nodes, &next.nodes);

        // Step 6: connect added nodes.
        for node in &delta.added {
            if let Err(err) = this.transport.connect_to_node(node).await {
                warn!(node = %node.id, error = %err, "failed to connect to added node");
            }
        }

        // Step 7: install snapshot, publish.
        this.snapshot.store(next.clone());
        this.discovery.publish(&next);

        // Step 8: ack setup.
        if flags.acked {
            if flags.must_apply_metadata && next.nodes.len() > 1 {
                match flags.ack_wait_strategy {
                    AckWaitStrategy::Coordinator => {
                        let required = next.nodes.iter().filter(|n| task.must_ack(n.as_ref())).count() as u32;
                        let coordinator = AckCoordinator::new(task.clone(), required, next.metadata.version);
                        coordinator.arm_timeout(flags.ack_timeout, &this.runtime);
                        this.ack_coordinators
                            .lock()
                            .expect("ack coordinator map lock poisoned")
                            .insert(next.metadata.version, coordinator);
                    }
                    AckWaitStrategy::Gossip => {
                        let acked = this
                            .discovery
                            .await_metadata_version(next.metadata.version, flags.ack_timeout)
                            .await;
                        if acked {
                            task.on_all_nodes_acked(None);
                        } else {
                            warn!(source = %source, "not all nodes acknowledged metadata version within ack_timeout");
                        }
                    }
                }
            } else {
                task.on_all_nodes_acked(None);
            }
        }

        // Step 9: pre-applied notifications.
        let event = ClusterChangedEvent::new(source.clone(), prev.clone(), next.clone());
        this.registry.notify_pre_applied(&event);

        // Step 10: disconnect removed nodes.
        for node in &delta.removed {
            if let Err(err) = this.transport.disconnect_from_node(node).await {
                warn!(node = %node.id, error = %err, "failed to disconnect removed node");
            }
        }

        // Step 11: status applied, post-applied notifications.
        let mut applied = (*next).clone();
        applied.status = ClusterStateStatus::Applied;
        let applied = Arc::new(applied);
        this.snapshot.store(applied.clone());

        let post_event = ClusterChangedEvent::new(source.clone(), next.clone(), applied.clone());
        this.registry.notify_post_applied(&post_event);

        // Step 12: completion callback.
        if flags.processed {
            task.cluster_state_processed(&source, &prev, &applied);
        }

        // Step 13: slow-task log.
        this.log_slow_if_needed(&source, start.elapsed());
    }

    fn register_cas_conflict_replay(this: &Arc<Self>, task: Arc<dyn UpdateTask>, source: String) {
        let listener = Arc::new(CasReplayListener {
            executor: this.clone(),
            task,
            source,
            fired: AtomicBool::new(false),
            self_ref: Mutex::new(None),
        });
        let as_listener: Arc<dyn Listener> = listener.clone();
        *listener.self_ref.lock().expect("cas replay lock poisoned") = Some(as_listener.clone());
        this.registry.add_first(as_listener);
    }
}

/// One-shot CAS-conflict replay subscriber (spec §4.5 step 3c, §9 Design
/// Notes): deregisters itself atomically the first time it observes an
/// event whose metadata actually changed.
struct CasReplayListener<R, D, T> {
    executor: Arc<UpdateExecutor<R, D, T>>,
    task: Arc<dyn UpdateTask>,
    source: String,
    fired: AtomicBool,
    self_ref: Mutex<Option<Arc<dyn Listener>>>,
}

impl<R, D, T> Listener for CasReplayListener<R, D, T>
where
    R: RingStore + Send + Sync + 'static,
    D: Discovery + Send + Sync + 'static,
    T: Transport + Send + Sync + 'static,
{
    fn cluster_changed(&self, event: &ClusterChangedEvent) {
        if !event.metadata_changed() {
            return;
        }
        if self.fired.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return;
        }
        let _ = self.executor.submit_task_with_priority(self.task.clone(), Some(Priority::Urgent));
        if let Some(handle) = self.self_ref.lock().expect("cas replay lock poisoned").take() {
            self.executor.registry.remove(&handle);
        }
    }
}
