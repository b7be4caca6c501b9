//! dtbench: workload generation and measurement engine for time-series stores
//!
//! This crate drives a reproducible, mixed read/write load against a storage
//! engine reached through [`BackendAdapter`], and measures throughput and tail
//! latency across a fixed phase protocol:
//!
//! ```text
//! Preload -> WarmUp -> Measure -> CoolDown -> Done
//! ```
//!
//! Only Measure-phase samples reach throughput, percentile and resource
//! statistics. Repetitions of the same configuration are merged into one
//! [`AggregatedReport`] by [`aggregate`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use dtbench::{MemoryBackend, RunConfig, Runner};
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let mut runner = Runner::new(RunConfig::default().with_sensors(500), backend)?;
//! let report = runner.run()?;
//! println!("{} repetitions merged", report.repetitions);
//! # Ok::<(), dtbench::RunError>(())
//! ```

#![warn(missing_docs)]

/// Error taxonomy
pub mod error;

/// Run configuration
pub mod config;

/// Records and query results
pub mod record;

/// Deterministic sensor streams
pub mod generator;

/// Backend adapter interface and in-process adapters
pub mod backend;

/// Cooperative cancellation
pub mod signal;

/// Backend calls with a timeout ceiling
pub mod executor;

/// Phase controller
pub mod phase;

/// Operation samples and phase-gated statistics
pub mod metrics;

/// Host resource samples
pub mod resource;

/// Ingestion worker pool
pub mod ingest;

/// Query worker pool
pub mod query;

/// Cross-repetition aggregation
pub mod aggregate;

/// Repetition orchestration
pub mod runner;

/// End-to-end scenarios across the whole engine
#[cfg(test)]
pub mod scenario_tests;

// Re-exports
pub use aggregate::{aggregate, AggregatedReport, MeanStdev, RepetitionResult, Statistic, StorageDelta, WarmupCheck};
pub use backend::{BackendAdapter, FaultInjectingBackend, FaultTarget, MemoryBackend, TopK};
pub use config::{QueryMix, QueryWindows, RunConfig, SampleRate, ValueModel};
pub use error::{AdapterError, ConfigError, ErrorKind, Result, RunError};
pub use generator::{LogicalClock, SensorStream, SensorStreamGenerator};
pub use metrics::{LatencySummary, MetricSnapshot, MetricsCollector, OperationKind, OperationSample, Outcome};
pub use phase::{Phase, PhaseController, PhaseHandle, PhaseOutcome, PhaseSchedule, PhaseTransition};
pub use record::{BucketMean, Reading, SensorMean, SensorRecord, SensorSet, TimeWindow};
pub use resource::{ResourceSample, ResourceSink, ResourceStats};
pub use runner::{NullSink, ReportSink, Runner};
pub use signal::RunSignal;
