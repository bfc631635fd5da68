//! `ClusterService` (spec §4.7): owns the lifecycle of every other
//! component and exposes the public surface callers actually submit work
//! through.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::adapters::{Discovery, RingStore, Transport};
use crate::config::{RefreshableSettings, Settings};
use crate::error::{Error, Result};
use crate::executor::UpdateExecutor;
use crate::lifecycle::{LifecycleFlag, ServiceState};
use crate::listener::{ClusterChangedEvent, Listener, ListenerRegistry, NotifyTimeoutHandle, TimeoutAwareListener};
use crate::master_watcher::MasterRoleWatcher;
use crate::reconnect::ReconnectLoop;
use crate::snapshot::SnapshotStore;
use crate::state::{ClusterState, DiscoveryNode, MetaData};
use crate::task::{PendingTaskInfo, UpdateTask};

/// A last-band listener that observes every installed state transition so a
/// secondary-indices subsystem (not implemented by this crate) would have a
/// single, well-ordered place to react to metadata changes (spec §4.7
/// `start`).
struct SecondaryIndicesHook;

impl Listener for SecondaryIndicesHook {
    fn cluster_changed(&self, event: &ClusterChangedEvent) {
        if event.metadata_changed() {
            debug!(
                source = %event.source,
                indices = event.state.metadata.indices.len(),
                "secondary-indices hook observed a metadata change"
            );
        }
    }
}

/// Ties the Snapshot Store, Listener Registry, Master-Role Watcher, Update
/// Executor and Reconnect Loop together behind a start/stop lifecycle.
pub struct ClusterService<R, D, T> {
    node_name: String,
    address: SocketAddr,
    cluster_uuid: String,
    state: Arc<LifecycleFlag>,
    snapshot: Arc<SnapshotStore>,
    registry: Arc<ListenerRegistry>,
    master_watcher: Arc<MasterRoleWatcher>,
    secondary_indices_hook: Arc<dyn Listener>,
    executor: Mutex<Option<Arc<UpdateExecutor<R, D, T>>>>,
    executor_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    reconnect_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    settings: RefreshableSettings,
    ring: Arc<R>,
    discovery: Arc<D>,
    transport: Arc<T>,
    runtime: tokio::runtime::Handle,
}

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

impl<R, D, T> ClusterService<R, D, T>
where
    R: RingStore + Send + Sync + 'static,
    D: Discovery + Send + Sync + 'static,
    T: Transport + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        address: SocketAddr,
        cluster_uuid: impl Into<String>,
        ring: Arc<R>,
        discovery: Arc<D>,
        transport: Arc<T>,
        settings: Settings,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let local = DiscoveryNode::new("placeholder", address);
        let initial = ClusterState::initial(local, MetaData::generate_cluster_uuid());
        Self {
            node_name: node_name.into(),
            address,
            cluster_uuid: cluster_uuid.into(),
            state: Arc::new(LifecycleFlag::new(ServiceState::Initialized)),
            snapshot: Arc::new(SnapshotStore::new(initial)),
            registry: Arc::new(ListenerRegistry::new()),
            master_watcher: Arc::new(MasterRoleWatcher::new(runtime.clone())),
            secondary_indices_hook: Arc::new(SecondaryIndicesHook),
            executor: Mutex::new(None),
            executor_handle: Mutex::new(None),
            reconnect_handle: Mutex::new(None),
            settings: RefreshableSettings::new(settings),
            ring,
            discovery,
            transport,
            runtime,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state.get()
    }

    pub fn snapshot(&self) -> Arc<ClusterState> {
        self.snapshot.load()
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.current()
    }

    pub fn reload_settings(&self, updated: Settings) {
        self.settings.reload(updated);
    }

    /// Re-reads `slow_task_logging_threshold`/`reconnect_interval` from
    /// `path` (plus `RING_CLUSTER_*` env overrides) and swaps them in. The
    /// Reconnect Loop only picks up a changed interval on its next tick;
    /// the Update Executor picks up a changed threshold on its next task
    /// (spec §4.7 Settings reload).
    pub fn reload_settings_from_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let updated = crate::config::SettingsLoader::new().with_config_file(path).load()?;
        self.reload_settings(updated);
        Ok(())
    }

    /// Runs the startup sequence from spec §4.7.
    pub async fn start(&self) -> Result<()> {
        if self.state.get() == ServiceState::Started {
            return Err(Error::AlreadyStarted);
        }

        if let Err(err) = self.ring.init_keyspace().await {
            warn!(error = %err, "best-effort keyspace initialisation failed, continuing");
        }

        self.registry.add_first(self.master_watcher.clone() as Arc<dyn Listener>);

        let local = DiscoveryNode::new(self.node_name.clone(), self.address);
        let initial = ClusterState::initial(local, self.cluster_uuid.clone());
        self.snapshot.store(Arc::new(initial));

        let executor = UpdateExecutor::new(
            self.state.clone(),
            self.snapshot.clone(),
            self.registry.clone(),
            self.ring.clone(),
            self.discovery.clone(),
            self.transport.clone(),
            self.settings.clone(),
            self.runtime.clone(),
        );

        self.registry.add_last(self.secondary_indices_hook.clone());

        self.state.set(ServiceState::Started);

        let executor_handle = executor.spawn();
        *self.executor.lock().expect("executor slot lock poisoned") = Some(executor);
        *self.executor_handle.lock().expect("executor handle lock poisoned") = Some(executor_handle);

        let reconnect_loop = ReconnectLoop::new(
            self.state.clone(),
            self.snapshot.clone(),
            self.transport.clone(),
            self.settings.current().reconnect_interval(),
        );
        let reconnect_handle = reconnect_loop.spawn(&self.runtime);
        *self.reconnect_handle.lock().expect("reconnect handle lock poisoned") = Some(reconnect_handle);

        Ok(())
    }

    /// Runs the shutdown sequence from spec §4.7, with a bounded grace
    /// period for the in-flight update task (if any) to finish.
    pub async fn stop(&self) -> Result<()> {
        let current = self.state.get();
        if current != ServiceState::Started {
            return Err(Error::NotStarted(current));
        }

        self.state.set(ServiceState::Stopped);

        if let Some(handle) = self.reconnect_handle.lock().expect("reconnect handle lock poisoned").take() {
            handle.abort();
        }

        self.registry.close_all_timeouts();

        let executor = self.executor.lock().expect("executor slot lock poisoned").take();
        if let Some(executor) = executor {
            executor.wake();
        }
        if let Some(mut handle) = self.executor_handle.lock().expect("executor handle lock poisoned").take() {
            if tokio::time::timeout(STOP_GRACE_PERIOD, &mut handle).await.is_err() {
                handle.abort();
                warn!("update executor did not drain within the stop grace period");
            }
        }

        self.registry.remove(&(self.master_watcher.clone() as Arc<dyn Listener>));

        Ok(())
    }

    /// Stops the service (if started) and marks it permanently closed.
    pub async fn close(&self) -> Result<()> {
        if self.state.get() == ServiceState::Started {
            self.stop().await?;
        }
        self.state.set(ServiceState::Closed);
        Ok(())
    }

    pub fn submit_task(&self, task: Arc<dyn UpdateTask>) -> Result<()> {
        let executor = self.executor.lock().expect("executor slot lock poisoned").clone();
        match executor {
            Some(executor) => executor.submit_task(task),
            None => Err(Error::NotStarted(self.state.get())),
        }
    }

    pub fn add_role_listener(&self, listener: Arc<dyn crate::master_watcher::RoleListener>) {
        self.master_watcher.add_role_listener(listener);
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.registry.add(listener);
    }

    pub fn add_priority_listener(&self, listener: Arc<dyn Listener>) {
        self.registry.add_first(listener);
    }

    pub fn add_last_listener(&self, listener: Arc<dyn Listener>) {
        self.registry.add_last(listener);
    }

    pub fn add_post_applied_listener(&self, listener: Arc<dyn Listener>) {
        self.registry.add_post_applied(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) {
        self.registry.remove(listener);
    }

    /// Cancels a timeout-aware listener previously registered through
    /// `add_listener_with_timeout`: its pending deadline becomes a no-op and
    /// it is dropped from the `last` band (spec §4.2 `remove`).
    pub fn remove_timeout_listener(&self, handle: &NotifyTimeoutHandle) {
        self.registry.remove_timeout(handle);
    }

    /// Registers a timeout-aware listener and arms its deadline timer,
    /// returning the handle the caller needs to cancel it early via
    /// `remove_timeout_listener`. The handle is reserved synchronously so it
    /// can escape this call; the actual band/tracked-set insertion (spec
    /// §4.2 `addWithTimeout`) is submitted onto the Update Executor so it
    /// happens on the update-worker task, same as every other state
    /// mutation in this crate.
    pub fn add_listener_with_timeout(
        &self,
        listener: Arc<dyn TimeoutAwareListener>,
        timeout: Duration,
    ) -> Result<NotifyTimeoutHandle> {
        let executor = self.executor.lock().expect("executor slot lock poisoned").clone();
        let Some(executor) = executor else {
            return Err(Error::NotStarted(self.state.get()));
        };

        let handle = self.registry.reserve_timeout(listener);
        let registry = self.registry.clone();
        let runtime = self.runtime.clone();
        let handle_for_worker = handle.clone();
        executor.submit_internal("add_listener_with_timeout", move || {
            registry.install_timeout(&handle_for_worker);
            let registry_for_timer = registry.clone();
            let timer_handle = handle_for_worker.clone();
            runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                registry_for_timer.fire_timeout(&timer_handle, timeout);
            });
        });
        Ok(handle)
    }

    pub fn pending_tasks(&self) -> Vec<PendingTaskInfo> {
        self.executor
            .lock()
            .expect("executor slot lock poisoned")
            .as_ref()
            .map(|e| e.pending_tasks())
            .unwrap_or_default()
    }

    pub fn number_of_pending_tasks(&self) -> u32 {
        self.executor
            .lock()
            .expect("executor slot lock poisoned")
            .as_ref()
            .map(|e| e.number_of_pending_tasks())
            .unwrap_or(0)
    }

    pub fn max_task_wait_time(&self) -> Duration {
        self.executor
            .lock()
            .expect("executor slot lock poisoned")
            .as_ref()
            .map(|e| e.max_task_wait_time())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{NoopDiscovery, NoopRingStore, NoopTransport};
    use crate::state::ClusterStateStatus;
    use crate::task::{TaskError, TaskFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> ClusterService<NoopRingStore, NoopDiscovery, NoopTransport> {
        ClusterService::new(
            "node-a",
            "127.0.0.1:9300".parse::<SocketAddr>().unwrap(),
            "cluster-1",
            Arc::new(NoopRingStore::default()),
            Arc::new(NoopDiscovery::default()),
            Arc::new(NoopTransport::default()),
            Settings::default(),
            tokio::runtime::Handle::current(),
        )
    }

    struct NoopTask;
    impl UpdateTask for NoopTask {
        fn source(&self) -> &str {
            "noop"
        }
        fn execute(&self, prev: &Arc<ClusterState>) -> std::result::Result<Arc<ClusterState>, TaskError> {
            Ok(prev.clone())
        }
        fn flags(&self) -> TaskFlags {
            TaskFlags { acked: true, ..TaskFlags::default() }
        }
    }

    #[tokio::test]
    async fn start_installs_fresh_node_identity_each_time() {
        let service = service();
        let before = service.snapshot().nodes.local_node_id();

        service.start().await.unwrap();
        let after_first_start = service.snapshot().nodes.local_node_id();
        assert_ne!(before, after_first_start);

        service.stop().await.unwrap();
        service.start().await.unwrap();
        let after_second_start = service.snapshot().nodes.local_node_id();
        assert_ne!(after_first_start, after_second_start);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn submitting_before_start_is_rejected() {
        let service = service();
        let err = service.submit_task(Arc::new(NoopTask)).unwrap_err();
        assert!(matches!(err, Error::NotStarted(ServiceState::Initialized)));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let service = service();
        service.start().await.unwrap();
        let err = service.start().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let service = service();
        let err = service.stop().await.unwrap_err();
        assert!(matches!(err, Error::NotStarted(ServiceState::Initialized)));
    }

    #[tokio::test]
    async fn submitted_task_runs_once_started() {
        let service = service();
        service.start().await.unwrap();

        let acked = Arc::new(AtomicUsize::new(0));
        struct AckTask(Arc<AtomicUsize>);
        impl UpdateTask for AckTask {
            fn source(&self) -> &str {
                "ack-task"
            }
            fn execute(&self, prev: &Arc<ClusterState>) -> std::result::Result<Arc<ClusterState>, TaskError> {
                Ok(prev.clone())
            }
            fn flags(&self) -> TaskFlags {
                TaskFlags { acked: true, ..TaskFlags::default() }
            }
            fn on_all_nodes_acked(&self, _last_error: Option<crate::error::RingError>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        service.submit_task(Arc::new(AckTask(acked.clone()))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(acked.load(Ordering::SeqCst), 1);
        assert_eq!(service.snapshot().status, ClusterStateStatus::Received);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn close_stops_a_running_service_and_is_permanent() {
        let service = service();
        service.start().await.unwrap();
        service.close().await.unwrap();

        assert_eq!(service.state(), ServiceState::Closed);
        let err = service.submit_task(Arc::new(NoopTask)).unwrap_err();
        assert!(matches!(err, Error::NotStarted(ServiceState::Closed)));
    }

    #[tokio::test]
    async fn reload_settings_from_file_applies_toml_overrides() {
        let service = service();
        let path = std::env::temp_dir().join(format!("ring-cluster-service-test-{}.toml", std::process::id()));
        std::fs::write(&path, "[cluster.service]\nslow_task_logging_threshold_secs = 5\n").unwrap();

        service.reload_settings_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(service.settings().cluster.service.slow_task_logging_threshold_secs, 5);
    }

    #[tokio::test]
    async fn reload_settings_from_file_propagates_config_errors() {
        let service = service();
        let path = std::env::temp_dir().join(format!("ring-cluster-service-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "not valid toml : :\n").unwrap();

        let err = service.reload_settings_from_file(&path).unwrap_err();
        std::fs::remove_file(&path).ok();

        assert!(matches!(err, Error::Config(_)));
    }

    struct RecordingTimeoutListener {
        timeouts: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl crate::listener::TimeoutAwareListener for RecordingTimeoutListener {
        fn cluster_changed(&self, _event: &ClusterChangedEvent) {}
        fn on_timeout(&self, _timeout: Duration) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn add_listener_with_timeout_returns_a_handle_the_caller_can_cancel() {
        let service = service();
        service.start().await.unwrap();

        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = service
            .add_listener_with_timeout(
                Arc::new(RecordingTimeoutListener { timeouts: timeouts.clone(), closes: closes.clone() }),
                Duration::from_millis(20),
            )
            .unwrap();

        // Let the submitted insertion run on the update worker before removing.
        tokio::time::sleep(Duration::from_millis(5)).await;
        service.remove_timeout_listener(&handle);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn add_listener_with_timeout_fires_on_timeout_without_removal() {
        let service = service();
        service.start().await.unwrap();

        let timeouts = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        service
            .add_listener_with_timeout(
                Arc::new(RecordingTimeoutListener { timeouts: timeouts.clone(), closes: closes.clone() }),
                Duration::from_millis(10),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        service.stop().await.unwrap();
    }
}
