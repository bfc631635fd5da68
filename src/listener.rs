//! The Listener Registry (spec §4.2): priority/normal/last/post-applied
//! bands plus a timeout-aware band with scheduled expiry.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::state::{ClusterState, NodesDelta};

/// The event delivered to listeners after a snapshot has been installed.
pub struct ClusterChangedEvent {
    pub source: String,
    pub previous_state: Arc<ClusterState>,
    pub state: Arc<ClusterState>,
}

impl ClusterChangedEvent {
    pub fn new(source: impl Into<String>, previous_state: Arc<ClusterState>, state: Arc<ClusterState>) -> Self {
        Self {
            source: source.into(),
            previous_state,
            state,
        }
    }

    /// Whether the persisted form of the metadata differs between
    /// `previous_state` and `state`. Drives the CAS-conflict replay
    /// condition in spec §4.5 step 3c.
    pub fn metadata_changed(&self) -> bool {
        self.previous_state.metadata.version != self.state.metadata.version
    }

    pub fn nodes_delta(&self) -> NodesDelta {
        crate::state::NodeSet::delta(&self.previous_state.nodes, &self.state.nodes)
    }

    pub fn local_node_is_master(&self) -> bool {
        self.state.nodes.local_node_is_master()
    }
}

/// A listener notified whenever a new cluster state has been installed.
pub trait Listener: Send + Sync {
    fn cluster_changed(&self, event: &ClusterChangedEvent);
}

/// A listener registered with a deadline: it expects to be notified (or
/// explicitly closed) within `timeout` of being added (spec §4.2).
pub trait TimeoutAwareListener: Send + Sync {
    fn cluster_changed(&self, event: &ClusterChangedEvent);

    /// Called once, on the update-executor task, right after insertion.
    fn post_added(&self) {}

    /// Called if the deadline elapses before `cluster_changed` has fired.
    fn on_timeout(&self, timeout: Duration) {
        let _ = timeout;
    }

    /// Called exactly once on shutdown or rejection, regardless of whether
    /// `on_timeout` already fired.
    fn on_close(&self) {}
}

/// Which band a listener was registered into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Priority,
    Normal,
    Last,
    PostApplied,
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Default)]
struct BandSet {
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
}

impl BandSet {
    fn add_first(&self, listener: Arc<dyn Listener>) {
        self.listeners.lock().expect("band lock poisoned").insert(0, listener);
    }

    fn add_last(&self, listener: Arc<dyn Listener>) {
        self.listeners.lock().expect("band lock poisoned").push(listener);
    }

    fn remove(&self, listener: &Arc<dyn Listener>) {
        self.listeners
            .lock()
            .expect("band lock poisoned")
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Snapshot-on-iterate: the lock is held only long enough to clone the
    /// vector of `Arc`s, so a concurrent `remove` never skips or duplicates
    /// notifications for a notification pass already in flight.
    fn snapshot(&self) -> Vec<Arc<dyn Listener>> {
        self.listeners.lock().expect("band lock poisoned").clone()
    }
}

/// A listener entry tracked for timeout/close bookkeeping. Wraps the
/// caller's `TimeoutAwareListener` so it can also be inserted into the
/// `last` band as a plain `Listener`.
struct TimeoutEntry {
    id: u64,
    inner: Arc<dyn TimeoutAwareListener>,
    invoked: AtomicBool,
    fired: AtomicBool,
    cancelled: AtomicBool,
}

impl Listener for TimeoutEntry {
    fn cluster_changed(&self, event: &ClusterChangedEvent) {
        self.invoked.store(true, Ordering::SeqCst);
        self.inner.cluster_changed(event);
    }
}

impl TimeoutEntry {
    /// Claims the single terminal callback (`on_timeout` xor `on_close`).
    /// Returns `true` if this call won the race.
    fn claim_terminal(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn as_listener(self: &Arc<Self>) -> Arc<dyn Listener> {
        self.clone() as Arc<dyn Listener>
    }
}

/// A handle to a registered timeout-aware listener, supporting idempotent
/// cancellation (spec §3 `NotifyTimeout`, §5). The cancellation flag lives on
/// the shared `TimeoutEntry` so a removal issued through the registry (e.g.
/// `ListenerRegistry::remove_timeout`) is visible to every clone of this
/// handle, including the one the deadline timer task holds.
#[derive(Clone)]
pub struct NotifyTimeoutHandle {
    entry: Arc<TimeoutEntry>,
}

impl NotifyTimeoutHandle {
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.cancelled.load(Ordering::SeqCst)
    }
}

/// Four pre/post-applied bands plus the set of currently-tracked timeout
/// listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    priority: BandSet,
    normal: BandSet,
    last: BandSet,
    post_applied: BandSet,
    timeouts: Mutex<Vec<Arc<TimeoutEntry>>>,
    next_timeout_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_first(&self, listener: Arc<dyn Listener>) {
        self.priority.add_last(listener);
    }

    pub fn add(&self, listener: Arc<dyn Listener>) {
        self.normal.add_last(listener);
    }

    pub fn add_last(&self, listener: Arc<dyn Listener>) {
        self.last.add_last(listener);
    }

    pub fn add_post_applied(&self, listener: Arc<dyn Listener>) {
        self.post_applied.add_last(listener);
    }

    /// Removes `listener` from every band and, if it is the wrapper of a
    /// tracked timeout entry, cancels that entry's pending timer the same
    /// way `remove_timeout` does (spec §4.2 `remove`: "scans the timeout set
    /// and cancels any pending timer owned by the removed listener"). Most
    /// callers hold a `NotifyTimeoutHandle` rather than the internal
    /// `Arc<dyn Listener>` wrapper, though, so `remove_timeout` is the usual
    /// entry point for removing a timeout-aware listener — this path exists
    /// for the plain-`Listener` case and for completeness with entries that
    /// happen to be reachable this way.
    pub fn remove(&self, listener: &Arc<dyn Listener>) {
        self.priority.remove(listener);
        self.normal.remove(listener);
        self.last.remove(listener);
        self.post_applied.remove(listener);

        let matched = {
            let timeouts = self.timeouts.lock().expect("timeouts lock poisoned");
            timeouts.iter().find(|e| Arc::ptr_eq(&e.as_listener(), listener)).cloned()
        };
        if let Some(entry) = matched {
            entry.cancelled.store(true, Ordering::SeqCst);
            self.forget(entry.id);
        }
    }

    /// Removes a timeout-aware listener identified by the handle returned
    /// from `add_listener_with_timeout`: cancels its pending timer so a
    /// deadline that fires afterward is a no-op, and drops it from the
    /// `last` band and the tracked timeout set (spec §4.2 `remove`). Unlike
    /// shutdown's `close_all_timeouts`, an explicit removal does not invoke
    /// `on_close` — the spec only promises timer cancellation here.
    pub fn remove_timeout(&self, handle: &NotifyTimeoutHandle) {
        handle.cancel();
        self.last.remove(&handle.entry.as_listener());
        self.forget(handle.entry.id);
    }

    /// Reserves a timeout entry and its handle without touching the bands
    /// or tracked set — callable from any thread, so a caller can be handed
    /// the handle immediately while the actual insertion (`install_timeout`)
    /// runs on the update-worker task (spec §4.2 `addWithTimeout`).
    pub fn reserve_timeout(&self, listener: Arc<dyn TimeoutAwareListener>) -> NotifyTimeoutHandle {
        let id = self.next_timeout_id.fetch_add(1, Ordering::SeqCst);
        let entry = Arc::new(TimeoutEntry {
            id,
            inner: listener,
            invoked: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        NotifyTimeoutHandle { entry }
    }

    /// Performs the on-update-thread insertion step of `addWithTimeout`
    /// (spec §4.2): insert into the `last` band, call `post_added`, and
    /// track the entry for `remove`/`close_all_timeouts`. Submitting this as
    /// a HIGH-priority executor task is the caller's responsibility (the
    /// Update Executor does so via its internal-task path). A no-op if
    /// `handle` was already cancelled or removed before this ran.
    pub fn install_timeout(&self, handle: &NotifyTimeoutHandle) {
        if handle.is_cancelled() || handle.entry.fired.load(Ordering::SeqCst) {
            return;
        }
        self.last.add_last(handle.entry.as_listener());
        self.timeouts.lock().expect("timeouts lock poisoned").push(handle.entry.clone());
        handle.entry.inner.post_added();
    }

    /// Called by the timer task after the deadline. No-ops if the listener
    /// was already invoked, cancelled, or already closed.
    pub fn fire_timeout(&self, handle: &NotifyTimeoutHandle, timeout: Duration) {
        if handle.is_cancelled() {
            return;
        }
        if handle.entry.invoked.load(Ordering::SeqCst) {
            return;
        }
        if handle.entry.claim_terminal() {
            handle.entry.inner.on_timeout(timeout);
        }
        self.forget(handle.entry.id);
    }

    fn forget(&self, id: u64) {
        self.timeouts.lock().expect("timeouts lock poisoned").retain(|e| e.id != id);
    }

    /// Combines `reserve_timeout` + `install_timeout` for callers that don't
    /// need the handle to escape an executor task before insertion (used by
    /// this module's own tests; `ClusterService::add_listener_with_timeout`
    /// needs the two halves kept separate).
    #[cfg(test)]
    fn insert_with_timeout(&self, listener: Arc<dyn TimeoutAwareListener>) -> NotifyTimeoutHandle {
        let handle = self.reserve_timeout(listener);
        self.install_timeout(&handle);
        handle
    }

    /// Delivers `on_close` to every tracked timeout listener exactly once,
    /// then clears the tracked set (spec §3, §4.7 `stop`).
    pub fn close_all_timeouts(&self) {
        let entries: Vec<_> = self.timeouts.lock().expect("timeouts lock poisoned").drain(..).collect();
        for entry in entries {
            if entry.claim_terminal() {
                entry.inner.on_close();
            }
        }
    }

    /// Notifies the three pre-applied bands in order: priority, normal,
    /// last. Per-listener panics are caught, logged, and the notification
    /// pass continues with the remaining listeners.
    pub fn notify_pre_applied(&self, event: &ClusterChangedEvent) {
        self.notify_band(Band::Priority, &self.priority, event);
        self.notify_band(Band::Normal, &self.normal, event);
        self.notify_band(Band::Last, &self.last, event);
    }

    /// Notifies the post-applied band, run after transport reconnect.
    pub fn notify_post_applied(&self, event: &ClusterChangedEvent) {
        self.notify_band(Band::PostApplied, &self.post_applied, event);
    }

    fn notify_band(&self, band: Band, set: &BandSet, event: &ClusterChangedEvent) {
        for listener in set.snapshot() {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.cluster_changed(event);
            }));
            if let Err(panic) = outcome {
                let detail = panic_message(&panic);
                warn!(%band, source = %event.source, error = %detail, "listener panicked during notification");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    fn state() -> Arc<ClusterState> {
        let node = crate::state::DiscoveryNode::new("n", "127.0.0.1:9300".parse::<SocketAddr>().unwrap());
        Arc::new(ClusterState::initial(node, "uuid"))
    }

    struct Recorder {
        order: Arc<Mutex<Vec<&'static str>>>,
        tag: &'static str,
    }

    impl Listener for Recorder {
        fn cluster_changed(&self, _event: &ClusterChangedEvent) {
            self.order.lock().unwrap().push(self.tag);
        }
    }

    #[test]
    fn bands_notify_in_priority_normal_last_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        registry.add_last(Arc::new(Recorder { order: order.clone(), tag: "last" }));
        registry.add_first(Arc::new(Recorder { order: order.clone(), tag: "priority" }));
        registry.add(Arc::new(Recorder { order: order.clone(), tag: "normal" }));

        let s = state();
        let event = ClusterChangedEvent::new("test", s.clone(), s);
        registry.notify_pre_applied(&event);

        assert_eq!(*order.lock().unwrap(), vec!["priority", "normal", "last"]);
    }

    #[test]
    fn insertion_order_preserved_within_band() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        registry.add(Arc::new(Recorder { order: order.clone(), tag: "a" }));
        registry.add(Arc::new(Recorder { order: order.clone(), tag: "b" }));
        registry.add(Arc::new(Recorder { order: order.clone(), tag: "c" }));

        let s = state();
        let event = ClusterChangedEvent::new("test", s.clone(), s);
        registry.notify_pre_applied(&event);

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn panicking_listener_does_not_block_remaining_listeners() {
        struct Panicky;
        impl Listener for Panicky {
            fn cluster_changed(&self, _event: &ClusterChangedEvent) {
                panic!("boom");
            }
        }

        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        registry.add(Arc::new(Panicky));
        registry.add(Arc::new(Recorder { order: order.clone(), tag: "survivor" }));

        let s = state();
        let event = ClusterChangedEvent::new("test", s.clone(), s);
        registry.notify_pre_applied(&event);

        assert_eq!(*order.lock().unwrap(), vec!["survivor"]);
    }

    struct CountingTimeoutListener {
        timeouts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl TimeoutAwareListener for CountingTimeoutListener {
        fn cluster_changed(&self, _event: &ClusterChangedEvent) {}
        fn on_timeout(&self, _timeout: Duration) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn timeout_and_close_are_mutually_exclusive() {
        let registry = ListenerRegistry::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = registry.insert_with_timeout(Arc::new(CountingTimeoutListener {
            timeouts: timeouts.clone(),
            closes: closes.clone(),
        }));

        registry.fire_timeout(&handle, Duration::from_millis(10));
        registry.close_all_timeouts();

        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn close_wins_when_no_timeout_fired_yet() {
        let registry = ListenerRegistry::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        registry.insert_with_timeout(Arc::new(CountingTimeoutListener {
            timeouts: timeouts.clone(),
            closes: closes.clone(),
        }));

        registry.close_all_timeouts();

        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_suppresses_timeout() {
        let registry = ListenerRegistry::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = registry.insert_with_timeout(Arc::new(CountingTimeoutListener {
            timeouts: timeouts.clone(),
            closes: closes.clone(),
        }));

        handle.cancel();
        registry.fire_timeout(&handle, Duration::from_millis(10));

        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_timeout_cancels_the_pending_deadline() {
        let registry = ListenerRegistry::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = registry.insert_with_timeout(Arc::new(CountingTimeoutListener {
            timeouts: timeouts.clone(),
            closes: closes.clone(),
        }));

        registry.remove_timeout(&handle);
        registry.fire_timeout(&handle, Duration::from_millis(10));

        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_timeout_drops_the_entry_from_the_last_band() {
        let registry = ListenerRegistry::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = registry.insert_with_timeout(Arc::new(CountingTimeoutListener {
            timeouts: timeouts.clone(),
            closes: closes.clone(),
        }));

        registry.remove_timeout(&handle);

        let s = state();
        let event = ClusterChangedEvent::new("test", s.clone(), s);
        registry.notify_pre_applied(&event);

        assert!(registry.last.snapshot().is_empty());
        assert!(registry.timeouts.lock().unwrap().is_empty());
    }

    #[test]
    fn remove_timeout_skips_close_on_shutdown_afterward() {
        let registry = ListenerRegistry::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = registry.insert_with_timeout(Arc::new(CountingTimeoutListener {
            timeouts: timeouts.clone(),
            closes: closes.clone(),
        }));

        registry.remove_timeout(&handle);
        registry.close_all_timeouts();

        assert_eq!(closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reserve_then_install_matches_insert_with_timeout() {
        let registry = ListenerRegistry::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = registry.reserve_timeout(Arc::new(CountingTimeoutListener {
            timeouts: timeouts.clone(),
            closes: closes.clone(),
        }));

        assert!(registry.timeouts.lock().unwrap().is_empty());
        registry.install_timeout(&handle);
        assert_eq!(registry.timeouts.lock().unwrap().len(), 1);

        registry.close_all_timeouts();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelling_before_install_makes_install_a_no_op() {
        let registry = ListenerRegistry::new();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = registry.reserve_timeout(Arc::new(CountingTimeoutListener {
            timeouts: timeouts.clone(),
            closes: closes.clone(),
        }));

        handle.cancel();
        registry.install_timeout(&handle);

        assert!(registry.timeouts.lock().unwrap().is_empty());
        assert!(registry.last.snapshot().is_empty());
    }
}
