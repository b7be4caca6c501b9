//! Repetition orchestration
//!
//! A [`Runner`] owns a validated [`RunConfig`] and one backend. Each
//! repetition builds fresh collectors and worker pools, drives them through
//! the phase protocol, and yields a [`RepetitionResult`]. Completed
//! repetitions are merged by [`aggregate`]; an aborted or failed repetition
//! ends the run and contributes nothing.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::aggregate::{aggregate, AggregatedReport, RepetitionResult, StorageDelta, WarmupCheck};
use crate::backend::BackendAdapter;
use crate::config::RunConfig;
use crate::error::{Result, RunError};
use crate::executor::CallExecutor;
use crate::generator::{LogicalClock, SensorStreamGenerator};
use crate::ingest::{HistoryBacklog, IngestContext, IngestSwitch, IngestionPool};
use crate::metrics::{MetricsCollector, OperationKind};
use crate::phase::{Phase, PhaseController, PhaseDriver, PhaseHandle, PhaseOutcome, PhaseSchedule};
use crate::query::{QueryContext, QueryPool};
use crate::record::SensorSet;
use crate::resource::{ResourceSample, ResourceSink};
use crate::signal::RunSignal;

/// Ceiling for the gate's own backend work when no `op_timeout` is set
const GATE_CALL_CEILING: Duration = Duration::from_secs(30);

/// Receiver of run output, such as a CSV exporter
pub trait ReportSink: Send {
    /// Called once per completed repetition
    fn on_repetition(&mut self, _result: &RepetitionResult) {}

    /// Called once with the final report
    fn on_aggregate(&mut self, _report: &AggregatedReport) {}
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {}

/// Runs every repetition of one configuration against one backend
pub struct Runner {
    config: RunConfig,
    adapter: Arc<dyn BackendAdapter>,
    signal: RunSignal,
    sink: Box<dyn ReportSink>,
    resource_feed: Option<Receiver<ResourceSample>>,
}

impl Runner {
    /// Validate `config` and prepare a run against `adapter`
    ///
    /// Nothing is started here, so a rejected configuration never touches the
    /// backend.
    pub fn new(config: RunConfig, adapter: Arc<dyn BackendAdapter>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            adapter,
            signal: RunSignal::new(),
            sink: Box::new(NullSink),
            resource_feed: None,
        })
    }

    /// Hand results to `sink` as they are produced
    pub fn with_report_sink<S: ReportSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// Accept host resource samples from `feed`
    pub fn with_resource_feed(mut self, feed: Receiver<ResourceSample>) -> Self {
        self.resource_feed = Some(feed);
        self
    }

    /// Signal that aborts the run when cancelled
    pub fn cancel_handle(&self) -> RunSignal {
        self.signal.clone()
    }

    /// The validated configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run every repetition and merge the results
    pub fn run(&mut self) -> Result<AggregatedReport> {
        info!(
            backend = self.adapter.name(),
            sensors = self.config.sensors,
            repetitions = self.config.repetitions,
            "run started"
        );

        let mut results = Vec::with_capacity(self.config.repetitions);
        for index in 0..self.config.repetitions {
            if self.signal.is_cancelled() {
                return Err(RunError::Aborted {
                    repetition: index,
                    phase: Phase::Preload,
                });
            }
            let result = self.run_repetition(index)?;
            self.sink.on_repetition(&result);
            results.push(result);
        }

        let report = aggregate(&results);
        self.sink.on_aggregate(&report);
        info!(repetitions = report.repetitions, "run complete");
        Ok(report)
    }

    /// Drive one repetition through every phase
    pub fn run_repetition(&mut self, index: usize) -> Result<RepetitionResult> {
        let config = &self.config;
        let adapter = self.adapter.clone();
        let before = adapter.storage_size_bytes();
        info!(repetition = index, storage_bytes = before, "repetition started");

        let collector = Arc::new(MetricsCollector::new());
        let switch = Arc::new(IngestSwitch::default());
        let settled_size = Arc::new(Mutex::new(None));

        // The backlog must exist before the controller can reach the gate
        let clock = LogicalClock::new(Instant::now(), config.logical_start.unwrap_or_else(Utc::now));
        let history = chrono::Duration::from_std(config.history_span).unwrap_or(chrono::Duration::zero());
        let sensors = SensorSet::new(config.sensors);
        let generator = SensorStreamGenerator::new(
            config.seed,
            config.sample_rate,
            clock.anchor_utc() - history,
            config.value_model,
            sensors.clone(),
        );
        let backlog = Arc::new(HistoryBacklog::new(&generator, clock.anchor_utc()));

        let mut controller = PhaseController::new(PhaseSchedule::from(config), self.signal.clone());
        let observer = collector.clone();
        controller.on_transition(move |t| observer.observe(t));
        controller.gate(
            Phase::Preload,
            preload_gate(
                config,
                PreloadInputs {
                    collector: collector.clone(),
                    switch: switch.clone(),
                    backlog: backlog.clone(),
                    adapter: adapter.clone(),
                    settled_size: settled_size.clone(),
                },
            ),
        );
        let (phases, driver) = controller.start()?;

        let ingest_ctx = IngestContext {
            adapter: adapter.clone(),
            collector: collector.clone(),
            phases: phases.clone(),
            clock,
            op_timeout: config.op_timeout,
            switch,
            backlog,
        };
        let ingest = match IngestionPool::start(ingest_ctx, &generator, config.effective_ingest_workers()) {
            Ok(pool) => pool,
            Err(err) => return Err(abort_start(&phases, driver, err)),
        };

        let query_ctx = QueryContext {
            adapter: adapter.clone(),
            collector: collector.clone(),
            phases: phases.clone(),
            clock,
            sensors,
            mix: config.query_mix,
            windows: config.query_windows,
            op_timeout: config.op_timeout,
            seed: config.seed,
        };
        let query = match QueryPool::start(query_ctx, config.query_workers, config.query_rate) {
            Ok(pool) => pool,
            Err(err) => {
                let err = abort_start(&phases, driver, err);
                let _ = ingest.join();
                return Err(err);
            }
        };

        let resources = Arc::new(ResourceSink::new(phases.clone()));
        let pump = match self.resource_feed.clone() {
            Some(feed) => {
                let sink = resources.clone();
                let view = phases.clone();
                let spawned = thread::Builder::new()
                    .name("resource-sink".to_string())
                    .spawn(move || sink.drain(&feed, &view));
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(source) => {
                        let err = abort_start(&phases, driver, RunError::Spawn { worker: "resource sink", source });
                        let _ = ingest.join();
                        let _ = query.join();
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        // Workers stop once the driver finishes; join them before judging the outcome
        let outcome = driver.join()?;
        let ingest_reports = ingest.join()?;
        let query_reports = query.join()?;
        if let Some(pump) = pump {
            let accepted = pump.join().map_err(|_| RunError::WorkerPanicked("resource sink"))?;
            info!(repetition = index, accepted, "resource feed drained");
        }

        match outcome {
            PhaseOutcome::Completed => {}
            PhaseOutcome::Aborted { phase } => {
                warn!(repetition = index, %phase, "repetition aborted, results discarded");
                return Err(RunError::Aborted {
                    repetition: index,
                    phase,
                });
            }
            PhaseOutcome::GateFailed(err) => return Err(err),
        }

        let warmup = WarmupCheck::from_snapshot(&collector.snapshot(Phase::WarmUp));
        if warmup.is_healthy(config.query_workers > 0) {
            info!(
                repetition = index,
                inserts_ok = warmup.inserts_ok,
                queries_ok = warmup.queries_ok,
                errors = warmup.errors,
                "warm-up check passed"
            );
        } else {
            warn!(
                repetition = index,
                inserts_ok = warmup.inserts_ok,
                queries_ok = warmup.queries_ok,
                errors = warmup.errors,
                "warm-up produced no successful operations of some kind"
            );
        }

        let after = settled_size
            .lock()
            .take()
            .unwrap_or_else(|| adapter.storage_size_bytes());
        let snapshot = collector.snapshot(Phase::Measure);
        let insert = snapshot.kind(OperationKind::Insert);
        info!(
            repetition = index,
            insert_throughput = insert.throughput,
            insert_errors = insert.counts.errors,
            query_ok = snapshot.query_ok(),
            inserts_total = ingest_reports.iter().map(|r| r.inserted).sum::<u64>(),
            queries_total = query_reports.iter().map(|r| r.total_issued()).sum::<u64>(),
            "repetition complete"
        );

        Ok(RepetitionResult {
            index,
            snapshot,
            storage: StorageDelta { before, after },
            resources: resources.measure_stats(),
            warmup,
        })
    }
}

/// Cancel a half-started repetition and wait for the controller
fn abort_start(phases: &PhaseHandle, driver: PhaseDriver, err: RunError) -> RunError {
    warn!(error = %err, "repetition failed to start");
    phases.cancel();
    let _ = driver.join();
    err
}

/// Shared state the Preload gate inspects
struct PreloadInputs {
    collector: Arc<MetricsCollector>,
    switch: Arc<IngestSwitch>,
    backlog: Arc<HistoryBacklog>,
    adapter: Arc<dyn BackendAdapter>,
    settled_size: Arc<Mutex<Option<u64>>>,
}

/// Gate run at the end of Preload
///
/// Rejects the dataset when too many inserts failed or history is still
/// pending, then quiesces ingestion, waits out the settle time and records
/// the storage size. Every wait is bounded and cancellable; the size probe
/// runs on its own executor so a hung backend cannot hold the controller.
fn preload_gate(config: &RunConfig, inputs: PreloadInputs) -> impl FnOnce(&PhaseHandle) -> Result<()> + Send + 'static {
    let threshold = config.preload_failure_threshold;
    let min_samples = config.preload_min_samples;
    let settle = config.settle;
    let preload = config.preload;
    let ceiling = config.op_timeout.unwrap_or(GATE_CALL_CEILING);
    let PreloadInputs {
        collector,
        switch,
        backlog,
        adapter,
        settled_size,
    } = inputs;

    move |phases: &PhaseHandle| {
        let counts = collector.counts(Phase::Preload, OperationKind::Insert);
        let error_rate = counts.error_rate();
        // Below the sample floor only a preload where nothing succeeded fails
        let rejected = if counts.total() >= min_samples {
            error_rate > threshold
        } else {
            counts.total() > 0 && counts.ok == 0
        };
        if rejected {
            return Err(RunError::PreloadFailure {
                failed: counts.errors,
                total: counts.total(),
                error_rate,
                threshold,
            });
        }
        if !backlog.is_loaded() {
            return Err(RunError::PreloadIncomplete {
                pending: backlog.pending(),
                sensors: backlog.sensors(),
                preload,
            });
        }
        info!(
            inserts = counts.total(),
            errors = counts.errors,
            error_rate,
            "preload gate passed"
        );

        let signal = phases.signal();
        if !switch.pause(signal, ceiling) {
            if signal.is_cancelled() {
                switch.resume();
                return Ok(());
            }
            warn!(?ceiling, "inserts still in flight, reading storage size anyway");
        }
        if signal.sleep(settle) {
            let mut probe = CallExecutor::new("storage-probe", Some(ceiling));
            match probe.call(move || Ok(adapter.storage_size_bytes())) {
                Ok(size) => {
                    info!(storage_bytes = size, ?settle, "storage size after settle");
                    *settled_size.lock() = Some(size);
                }
                Err(err) => warn!(error = %err, "storage size probe failed"),
            }
        }
        switch.resume();
        Ok(())
    }
}
