//! Error types for dtbench
//!
//! Per-operation failures ([`AdapterError`]) are data: workers turn them into
//! error samples and keep going. Only [`RunError`] stops a run.

use std::time::Duration;

use thiserror::Error;

use crate::phase::Phase;

/// Failure of a single backend call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    /// The call did not complete within the configured ceiling
    #[error("backend call timed out after {after:?}")]
    Timeout {
        /// Ceiling that was exceeded
        after: Duration,
    },
    /// The sensor has no readings
    #[error("no readings for sensor {sensor_id}")]
    NotFound {
        /// Sensor that was queried
        sensor_id: String,
    },
    /// The backend could not be reached
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Engine-specific failure
    #[error("backend error: {0}")]
    Backend(String),
    /// Failure produced by fault injection
    #[error("injected fault")]
    Injected,
}

impl AdapterError {
    /// Stable classification used when the error is stored in a sample
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Timeout { .. } => ErrorKind::Timeout,
            AdapterError::NotFound { .. } => ErrorKind::NotFound,
            AdapterError::Unavailable(_) => ErrorKind::Unavailable,
            AdapterError::Backend(_) => ErrorKind::Backend,
            AdapterError::Injected => ErrorKind::Injected,
        }
    }
}

/// Compact error classification carried by operation samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// See [`AdapterError::Timeout`]
    Timeout,
    /// See [`AdapterError::NotFound`]
    NotFound,
    /// See [`AdapterError::Unavailable`]
    Unavailable,
    /// See [`AdapterError::Backend`]
    Backend,
    /// See [`AdapterError::Injected`]
    Injected,
}

impl ErrorKind {
    /// Lower-case label for reports
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Backend => "backend",
            ErrorKind::Injected => "injected",
        }
    }
}

/// Invalid run configuration, raised before any worker starts
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    /// A numeric option is outside its accepted range
    #[error("{field} out of range: {value} (expected {expected})")]
    OutOfRange {
        /// Option name
        field: &'static str,
        /// Offending value, rendered
        value: String,
        /// Accepted range, rendered
        expected: &'static str,
    },
    /// A duration that must be positive is zero
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    /// Every query weight is zero while queries are enabled
    #[error("query mix has no positive weight")]
    EmptyQueryMix,
    /// An option name that is not recognized
    #[error("unrecognized option: {0}")]
    Unrecognized(String),
}

/// Systemic failure that stops a run
#[derive(Debug, Error)]
pub enum RunError {
    /// The configuration was rejected
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// Too many inserts failed while loading history
    #[error(
        "preload failed: {failed}/{total} inserts failed ({:.1}% > {:.1}% threshold)",
        error_rate * 100.0,
        threshold * 100.0
    )]
    PreloadFailure {
        /// Failed inserts during Preload
        failed: u64,
        /// Attempted inserts during Preload
        total: u64,
        /// failed / total
        error_rate: f64,
        /// Configured ceiling
        threshold: f64,
    },
    /// Preload ended before every sensor's history was inserted
    #[error(
        "preload ended after {preload:?} with history still pending for {pending} of {sensors} sensors; \
         raise `preload` or shorten `history_span`"
    )]
    PreloadIncomplete {
        /// Sensors with history records not yet inserted
        pending: usize,
        /// Sensors in the run
        sensors: usize,
        /// Configured Preload length
        preload: Duration,
    },
    /// The run was cancelled
    #[error("run aborted during repetition {repetition} in phase {phase}")]
    Aborted {
        /// Zero-based repetition index
        repetition: usize,
        /// Phase observed when cancellation took effect
        phase: Phase,
    },
    /// A worker thread could not be started
    #[error("failed to start {worker} thread: {source}")]
    Spawn {
        /// Which thread
        worker: &'static str,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },
    /// A worker thread panicked
    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),
}

/// Result alias for run-level operations
pub type Result<T> = std::result::Result<T, RunError>;
