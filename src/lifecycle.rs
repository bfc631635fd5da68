//! The service's lifecycle state machine (spec §9 Design Notes): submission
//! checks read this via a single atomic load rather than a collection of
//! booleans.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of the coordination service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceState {
    /// Constructed but `start()` has not been called yet.
    Initialized = 0,
    /// Running: the Update Executor and Reconnect Loop are active.
    Started = 1,
    /// `stop()` has completed; may be started again.
    Stopped = 2,
    /// Permanently shut down.
    Closed = 3,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Initialized,
            1 => Self::Started,
            2 => Self::Stopped,
            _ => Self::Closed,
        }
    }
}

/// An atomically-readable/writable [`ServiceState`], shared between the
/// service, the Update Executor and the Reconnect Loop so each can check
/// "are we still started?" without coordinating through a lock.
#[derive(Debug, Default)]
pub struct LifecycleFlag(AtomicU8);

impl LifecycleFlag {
    pub fn new(initial: ServiceState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: ServiceState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.get() == ServiceState::Started
    }
}

impl Default for ServiceState {
    fn default() -> Self {
        Self::Initialized
    }
}
