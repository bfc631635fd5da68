//! The Ack Coordinator (spec §4.4): a single-winner countdown that fires a
//! terminal callback on reaching zero or on timeout, whichever is first.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RingError;
use crate::task::UpdateTask;

/// Tracks outstanding acknowledgements for one installed cluster-state
/// version and delivers exactly one terminal callback to the owning task.
pub struct AckCoordinator {
    remaining: AtomicU32,
    last_error: Mutex<Option<RingError>>,
    fired: AtomicBool,
    target_version: u64,
    task: Arc<dyn UpdateTask>,
}

impl AckCoordinator {
    /// `required` is the number of nodes for which `task.must_ack` returned
    /// true; callers must clamp it to at least 1 themselves (the master's
    /// ack is always awaited even when not otherwise required) — done here
    /// defensively too, since an incorrectly-computed `required` of 0 would
    /// otherwise let the coordinator never arm.
    pub fn new(task: Arc<dyn UpdateTask>, required: u32, target_version: u64) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicU32::new(required.max(1)),
            last_error: Mutex::new(None),
            fired: AtomicBool::new(false),
            target_version,
            task,
        })
    }

    pub fn target_version(&self) -> u64 {
        self.target_version
    }

    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    pub fn has_completed(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Arms a timeout that calls [`Self::on_timeout`] after `deadline` on
    /// `runtime`, unless the countdown has already completed.
    pub fn arm_timeout(self: &Arc<Self>, deadline: Duration, runtime: &tokio::runtime::Handle) {
        let this = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(deadline).await;
            this.on_timeout();
        });
    }

    /// Records an acknowledgement (or failure) from a node.
    ///
    /// `node_is_master` / `required` follow spec §4.4: a node that is not
    /// required but is the master still counts; otherwise the ack is
    /// ignored entirely (no error recorded, no decrement).
    pub fn on_node_ack(&self, node_is_master: bool, required: bool, error: Option<RingError>) {
        if !required && !node_is_master {
            return;
        }
        if self.fired.load(Ordering::SeqCst) {
            // Terminal callback already delivered; a late ack produces no
            // further callback (spec §8 scenario S4).
            return;
        }
        if let Some(err) = error {
            *self.last_error.lock().expect("ack coordinator lock poisoned") = Some(err);
        }

        loop {
            let current = self.remaining.load(Ordering::SeqCst);
            if current == 0 {
                return;
            }
            if self
                .remaining
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if current - 1 == 0 {
                    self.complete();
                }
                return;
            }
        }
    }

    fn complete(&self) {
        if self.claim_terminal() {
            let last_error = self.last_error.lock().expect("ack coordinator lock poisoned").clone();
            self.task.on_all_nodes_acked(last_error);
        }
    }

    fn on_timeout(&self) {
        if self.claim_terminal() {
            self.task.on_ack_timeout();
        }
    }

    fn claim_terminal(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ClusterState;
    use crate::task::{Priority, TaskError, TaskFlags};
    use std::sync::atomic::AtomicUsize;

    struct RecordingTask {
        acked: Arc<AtomicUsize>,
        timed_out: Arc<AtomicUsize>,
    }

    impl UpdateTask for RecordingTask {
        fn source(&self) -> &str {
            "recording-task"
        }
        fn priority(&self) -> Priority {
            Priority::Normal
        }
        fn flags(&self) -> TaskFlags {
            TaskFlags::default()
        }
        fn execute(&self, prev: &Arc<ClusterState>) -> Result<Arc<ClusterState>, TaskError> {
            Ok(prev.clone())
        }
        fn on_all_nodes_acked(&self, _last_error: Option<RingError>) {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
        fn on_ack_timeout(&self) {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task() -> (Arc<RecordingTask>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let acked = Arc::new(AtomicUsize::new(0));
        let timed_out = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(RecordingTask { acked: acked.clone(), timed_out: timed_out.clone() }),
            acked,
            timed_out,
        )
    }

    #[test]
    fn completes_when_countdown_reaches_zero() {
        let (t, acked, timed_out) = task();
        let coordinator = AckCoordinator::new(t, 3, 7);

        coordinator.on_node_ack(false, true, None);
        coordinator.on_node_ack(false, true, None);
        assert_eq!(acked.load(Ordering::SeqCst), 0);
        coordinator.on_node_ack(false, true, None);

        assert_eq!(acked.load(Ordering::SeqCst), 1);
        assert_eq!(timed_out.load(Ordering::SeqCst), 0);
        assert!(coordinator.has_completed());
    }

    #[test]
    fn late_ack_after_completion_produces_no_callback() {
        let (t, acked, _timed_out) = task();
        let coordinator = AckCoordinator::new(t, 1, 1);

        coordinator.on_node_ack(false, true, None);
        assert_eq!(acked.load(Ordering::SeqCst), 1);

        coordinator.on_node_ack(false, true, None);
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unrequired_non_master_ack_is_ignored() {
        let (t, acked, _timed_out) = task();
        let coordinator = AckCoordinator::new(t, 1, 1);

        coordinator.on_node_ack(false, false, None);
        assert_eq!(coordinator.remaining(), 1);
        assert_eq!(acked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn required_count_clamped_to_at_least_one() {
        let (t, _acked, _timed_out) = task();
        let coordinator = AckCoordinator::new(t, 0, 1);
        assert_eq!(coordinator.remaining(), 1);
    }

    #[tokio::test]
    async fn timeout_fires_when_acks_never_complete() {
        let (t, acked, timed_out) = task();
        let coordinator = AckCoordinator::new(t, 3, 1);
        coordinator.arm_timeout(Duration::from_millis(20), &tokio::runtime::Handle::current());

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
        assert_eq!(acked.load(Ordering::SeqCst), 0);

        // A late ack after timeout produces no further callback.
        coordinator.on_node_ack(false, true, None);
        assert_eq!(acked.load(Ordering::SeqCst), 0);
    }
}
