//! Error types for the cluster coordination core.

use thiserror::Error;

/// Errors surfaced by the ring storage adapter's CAS-style metadata
/// persistence call (spec §4.8 / §7).
#[derive(Error, Debug, Clone)]
pub enum RingError {
    /// The stored metadata did not match the `prev` value passed in —
    /// someone else persisted a newer version first.
    #[error("concurrent metadata update: stored state does not match prev")]
    ConcurrentMetaDataUpdate,

    /// The adapter itself is misconfigured (bad endpoint, missing keyspace).
    #[error("ring storage configuration error: {0}")]
    Configuration(String),

    /// Transport-level I/O failure talking to the ring.
    #[error("ring storage I/O error: {0}")]
    Io(String),

    /// The request was structurally invalid before it reached the ring.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The ring accepted the request but execution failed server-side.
    #[error("request execution failed: {0}")]
    RequestExecution(String),

    /// The request failed ring-side validation (schema, permissions, ...).
    #[error("request validation failed: {0}")]
    RequestValidation(String),
}

/// Errors raised by the coordination core itself.
#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value failed to parse or was out of range.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The service was asked to do something that requires it to be
    /// started (e.g. submit a task) while stopped or closed.
    #[error("service is not started (state: {0:?})")]
    NotStarted(crate::lifecycle::ServiceState),

    /// The service was started twice.
    #[error("service is already started")]
    AlreadyStarted,
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
