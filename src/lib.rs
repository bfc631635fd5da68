//! Cluster-state coordination core for a search/analytics node co-located
//! with a ring-structured storage layer.
//!
//! The core owns a single immutable [`state::ClusterState`] snapshot,
//! replaced only by a dedicated Update Executor task running a priority
//! queue of [`task::UpdateTask`]s. Everything else — listeners, the
//! Master-Role Watcher, ack coordination, and the periodic Reconnect Loop —
//! is built around that single-writer invariant. Leader election, the ring
//! storage format, and the gossip wire protocol are out of scope: this
//! crate consumes them through the [`adapters`] traits.

pub mod ack;
pub mod adapters;
pub mod config;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod listener;
pub mod master_watcher;
pub mod reconnect;
pub mod service;
pub mod snapshot;
pub mod state;
pub mod task;

pub use adapters::{Discovery, RingStore, Transport};
pub use config::{RefreshableSettings, Settings, SettingsLoader};
pub use error::{Error, Result, RingError};
pub use executor::{thread_is_update_worker, UpdateExecutor};
pub use lifecycle::{LifecycleFlag, ServiceState};
pub use listener::{Band, ClusterChangedEvent, Listener, ListenerRegistry, NotifyTimeoutHandle, TimeoutAwareListener};
pub use master_watcher::{MasterRoleWatcher, RoleListener};
pub use reconnect::ReconnectLoop;
pub use service::ClusterService;
pub use snapshot::SnapshotStore;
pub use task::{AckWaitStrategy, PendingTaskInfo, Priority, TaskError, TaskFlags, UpdateTask};
