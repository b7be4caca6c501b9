//! Ingestion worker pool
//!
//! Each worker owns a disjoint partition of sensors and inserts every record
//! whose logical timestamp has come due. History before the run start is due
//! at once, so Preload loads it without pacing; afterwards the due-time rule
//! paces each sensor to its sample rate. A worker that falls behind catches
//! up in tick order and never skips or repeats a record.
//!
//! [`HistoryBacklog`] counts the sensors whose history is still being
//! loaded, so the end of Preload can tell a complete dataset from a
//! truncated one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::backend::BackendAdapter;
use crate::error::{Result, RunError};
use crate::executor::CallExecutor;
use crate::generator::{LogicalClock, SensorStream, SensorStreamGenerator};
use crate::metrics::{MetricsCollector, OperationKind, OperationSample, Outcome};
use crate::phase::PhaseHandle;
use crate::record::SensorRecord;
use crate::signal::RunSignal;

/// Longest a worker sleeps before re-checking for stop or pause
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Poll period while waiting for in-flight inserts to drain
const DRAIN_POLL: Duration = Duration::from_millis(1);

/// Pause switch for the ingestion pool
///
/// Pausing waits for in-flight inserts to drain, so once
/// [`IngestSwitch::pause`] returns `true` no insert is running.
#[derive(Default)]
pub struct IngestSwitch {
    paused: AtomicBool,
    in_flight: AtomicUsize,
}

impl IngestSwitch {
    /// Stop issuing inserts and wait up to `limit` until none is in flight
    ///
    /// Returns `false` if inserts were still running at the limit or the run
    /// was cancelled while waiting. Inserts stay paused either way.
    pub fn pause(&self, signal: &RunSignal, limit: Duration) -> bool {
        self.paused.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + limit;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline || !signal.sleep(DRAIN_POLL) {
                return false;
            }
        }
        true
    }

    /// Allow inserts again
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether inserts are paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Reserve an in-flight slot unless paused
    fn try_enter(&self) -> bool {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.paused.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sensors whose history before the run anchor is not fully inserted
#[derive(Debug)]
pub struct HistoryBacklog {
    anchor: DateTime<Utc>,
    sensors: usize,
    pending: AtomicUsize,
}

impl HistoryBacklog {
    /// Backlog of `generator` for records timestamped before `anchor`
    pub fn new(generator: &SensorStreamGenerator, anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            sensors: generator.sensors().len(),
            pending: AtomicUsize::new(generator.sensors_before(anchor)),
        }
    }

    /// End of the history
    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    /// Sensors in the run
    pub fn sensors(&self) -> usize {
        self.sensors
    }

    /// Sensors with history records not yet inserted
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether every history record has been attempted
    pub fn is_loaded(&self) -> bool {
        self.pending() == 0
    }

    fn caught_up(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared inputs of every ingestion worker
#[derive(Clone)]
pub struct IngestContext {
    /// Target backend
    pub adapter: Arc<dyn BackendAdapter>,
    /// Sample sink
    pub collector: Arc<MetricsCollector>,
    /// Phase view
    pub phases: PhaseHandle,
    /// Logical time source
    pub clock: LogicalClock,
    /// Ceiling per insert
    pub op_timeout: Option<Duration>,
    /// Pause switch
    pub switch: Arc<IngestSwitch>,
    /// History still to load
    pub backlog: Arc<HistoryBacklog>,
}

/// What one ingestion worker did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestWorkerReport {
    /// Worker index
    pub worker: usize,
    /// Sensors owned by the worker
    pub sensors: usize,
    /// Successful inserts
    pub inserted: u64,
    /// Failed inserts
    pub failed: u64,
    /// Executors abandoned after timeouts
    pub timeouts_abandoned: u64,
    /// Records produced, successful or not
    pub records: u64,
}

struct IngestWorker {
    id: usize,
    ctx: IngestContext,
    streams: Vec<SensorStream>,
    // Per stream: still inside the history
    behind: Vec<bool>,
    executor: CallExecutor,
    report: IngestWorkerReport,
}

impl IngestWorker {
    fn run(mut self) -> IngestWorkerReport {
        debug!(worker = self.id, sensors = self.streams.len(), "ingestion worker started");

        while !self.ctx.phases.should_stop() {
            if self.ctx.switch.is_paused() {
                self.ctx.phases.signal().sleep(IDLE_POLL);
                continue;
            }

            let now = self.ctx.clock.now();
            let mut issued = false;
            // One record per due sensor per pass, so sensors catch up together
            for i in 0..self.streams.len() {
                if self.ctx.phases.should_stop() {
                    break;
                }
                if self.streams[i].next_timestamp() > now {
                    continue;
                }
                if !self.ctx.switch.try_enter() {
                    break;
                }
                let record = self.streams[i].next_record();
                self.insert(record);
                self.ctx.switch.exit();
                issued = true;

                if self.behind[i] && self.streams[i].next_timestamp() >= self.ctx.backlog.anchor() {
                    self.behind[i] = false;
                    self.ctx.backlog.caught_up();
                }
            }

            if !issued {
                let next_due = self
                    .streams
                    .iter()
                    .map(|s| s.next_timestamp())
                    .min()
                    .map(|ts| self.ctx.clock.instant_of(ts));
                let wake = match next_due {
                    Some(due) => due.min(Instant::now() + IDLE_POLL),
                    None => Instant::now() + IDLE_POLL,
                };
                self.ctx.phases.signal().sleep_until(wake);
            }
        }

        self.report.timeouts_abandoned = self.executor.abandoned();
        debug!(
            worker = self.id,
            inserted = self.report.inserted,
            failed = self.report.failed,
            "ingestion worker stopped"
        );
        self.report
    }

    fn insert(&mut self, record: SensorRecord) {
        let adapter = self.ctx.adapter.clone();
        let start = Instant::now();
        let result = self.executor.call(move || adapter.insert(&record));
        let duration = start.elapsed();

        self.report.records += 1;
        let outcome = match result {
            Ok(()) => {
                self.report.inserted += 1;
                Outcome::Ok
            }
            Err(err) => {
                self.report.failed += 1;
                Outcome::Err(err.kind())
            }
        };

        self.ctx.collector.record(OperationSample {
            kind: OperationKind::Insert,
            // Tagged with the phase seen at completion
            phase: self.ctx.phases.current_phase(),
            start,
            duration,
            outcome,
        });
    }
}

/// Running set of ingestion workers
pub struct IngestionPool {
    handles: Vec<JoinHandle<IngestWorkerReport>>,
    switch: Arc<IngestSwitch>,
}

impl IngestionPool {
    /// Start `workers` workers over disjoint partitions of the generator's sensors
    pub fn start(ctx: IngestContext, generator: &SensorStreamGenerator, workers: usize) -> Result<Self> {
        let partitions = generator.sensors().partition(workers);
        let switch = ctx.switch.clone();
        let mut handles = Vec::with_capacity(partitions.len());

        for (id, partition) in partitions.into_iter().enumerate() {
            let streams: Vec<SensorStream> = partition
                .iter()
                .filter_map(|&index| generator.stream_at(index))
                .collect();
            let anchor = ctx.backlog.anchor();
            let behind = streams.iter().map(|s| s.next_timestamp() < anchor).collect();
            let worker = IngestWorker {
                id,
                behind,
                executor: CallExecutor::new(format!("ingest-{}", id), ctx.op_timeout),
                report: IngestWorkerReport {
                    worker: id,
                    sensors: streams.len(),
                    ..Default::default()
                },
                streams,
                ctx: ctx.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("ingest-{}", id))
                .spawn(move || worker.run())
                .map_err(|source| RunError::Spawn {
                    worker: "ingestion",
                    source,
                })?;
            handles.push(handle);
        }

        info!(workers = handles.len(), sensors = generator.sensors().len(), "ingestion pool started");
        Ok(Self { handles, switch })
    }

    /// Number of running workers
    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// The pool's pause switch
    pub fn switch(&self) -> &Arc<IngestSwitch> {
        &self.switch
    }

    /// Wait for every worker to stop
    pub fn join(self) -> Result<Vec<IngestWorkerReport>> {
        self.handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| RunError::WorkerPanicked("ingestion"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaultInjectingBackend, FaultTarget, MemoryBackend};
    use crate::config::{SampleRate, ValueModel};
    use crate::phase::{Phase, PhaseController, PhaseSchedule};
    use crate::record::SensorSet;
    use crate::signal::RunSignal;

    fn schedule(preload_ms: u64, rest_ms: u64) -> PhaseSchedule {
        PhaseSchedule {
            preload: Duration::from_millis(preload_ms),
            warm_up: Duration::from_millis(rest_ms),
            measure: Duration::from_millis(rest_ms),
            cool_down: Duration::from_millis(rest_ms),
        }
    }

    fn run_pool(
        adapter: Arc<dyn BackendAdapter>,
        sensors: usize,
        history: Duration,
        schedule: PhaseSchedule,
    ) -> (Arc<MetricsCollector>, Vec<IngestWorkerReport>, Arc<HistoryBacklog>) {
        let collector = Arc::new(MetricsCollector::new());
        let mut controller = PhaseController::new(schedule, RunSignal::new());
        let observer = collector.clone();
        controller.on_transition(move |t| observer.observe(t));
        let (phases, driver) = controller.start().unwrap();

        let clock = LogicalClock::new(phases.started_at(), chrono::Utc::now());
        let epoch = clock.anchor_utc() - chrono::Duration::from_std(history).unwrap();
        let generator = SensorStreamGenerator::new(
            5,
            SampleRate::Hz1,
            epoch,
            ValueModel::default(),
            SensorSet::new(sensors),
        );
        let backlog = Arc::new(HistoryBacklog::new(&generator, clock.anchor_utc()));
        let ctx = IngestContext {
            adapter,
            collector: collector.clone(),
            phases,
            clock,
            op_timeout: None,
            switch: Arc::new(IngestSwitch::default()),
            backlog: backlog.clone(),
        };
        let pool = IngestionPool::start(ctx, &generator, 3).unwrap();
        driver.join().unwrap();
        let reports = pool.join().unwrap();
        (collector, reports, backlog)
    }

    #[test]
    fn test_preload_loads_history_unthrottled() {
        let backend = Arc::new(MemoryBackend::new());
        let (collector, reports, backlog) =
            run_pool(backend.clone(), 10, Duration::from_secs(600), schedule(300, 10));

        // 600s of 1Hz history for 10 sensors, loaded well within 300ms
        assert!(backend.len() >= 6000, "only {} records loaded", backend.len());
        assert_eq!(reports.iter().map(|r| r.sensors).sum::<usize>(), 10);
        assert!(collector.counts(Phase::Preload, OperationKind::Insert).ok >= 5000);
        assert_eq!(backlog.sensors(), 10);
        assert!(backlog.is_loaded(), "{} sensors still behind", backlog.pending());
    }

    #[test]
    fn test_slow_backend_leaves_history_pending() {
        let backend = Arc::new(FaultInjectingBackend::new(MemoryBackend::new()));
        backend.set_delay(FaultTarget::Insert, Duration::from_millis(2));
        let (collector, _, backlog) =
            run_pool(backend.clone(), 4, Duration::from_secs(600), schedule(100, 10));

        // 2400 history records at 2ms each cannot fit in 100ms
        assert!(backlog.pending() > 0);
        assert!(!backlog.is_loaded());
        assert!(collector.counts(Phase::Preload, OperationKind::Insert).total() < 2400);
    }

    #[test]
    fn test_empty_history_has_no_backlog() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, _, backlog) = run_pool(backend, 4, Duration::ZERO, schedule(20, 10));
        assert_eq!(backlog.pending(), 0);
        assert!(backlog.is_loaded());
    }

    #[test]
    fn test_insert_is_tagged_with_completion_phase() {
        let backend = Arc::new(FaultInjectingBackend::new(MemoryBackend::new()));
        backend.set_delay(FaultTarget::Insert, Duration::from_millis(100));
        let schedule = PhaseSchedule {
            preload: Duration::from_millis(30),
            warm_up: Duration::from_millis(30),
            measure: Duration::from_millis(500),
            cool_down: Duration::from_millis(10),
        };
        // The only due record is issued in Preload and completes in Measure
        let (collector, reports, _) = run_pool(backend, 1, Duration::ZERO, schedule);

        assert_eq!(reports.iter().map(|r| r.records).sum::<u64>(), 1);
        assert!(collector.samples(Phase::Preload).is_empty());
        assert!(collector.samples(Phase::WarmUp).is_empty());
        let measured = collector.samples(Phase::Measure);
        assert_eq!(measured.len(), 1);
        let measure_start = collector.window(Phase::Measure).unwrap().start;
        assert!(measured[0].start < measure_start);
        assert!(measured[0].start + measured[0].duration >= measure_start);
    }

    #[test]
    fn test_no_duplicate_or_skipped_records() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, reports, _) = run_pool(backend.clone(), 4, Duration::from_secs(30), schedule(50, 50));

        let produced: u64 = reports.iter().map(|r| r.records).sum();
        assert_eq!(produced as usize, backend.len());
        for i in 0..4 {
            let id = format!("sensor-{:05}", i);
            // Every sensor has contiguous history up to now
            assert!(backend.sensor_len(&id) >= 30);
        }
    }

    #[test]
    fn test_insert_failures_are_samples_not_crashes() {
        let backend = Arc::new(FaultInjectingBackend::new(MemoryBackend::new()));
        backend.set_error_ratio(FaultTarget::Insert, 0.5);
        let (collector, reports, _) = run_pool(backend.clone(), 6, Duration::from_secs(100), schedule(100, 10));

        let failed: u64 = reports.iter().map(|r| r.failed).sum();
        let inserted: u64 = reports.iter().map(|r| r.inserted).sum();
        assert!(failed > 0);
        assert!(inserted > 0);
        let preload = collector.counts(Phase::Preload, OperationKind::Insert);
        assert!(preload.errors > 0);
        assert!((preload.error_rate() - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_switch_pause_drains_in_flight() {
        let switch = IngestSwitch::default();
        assert!(switch.try_enter());
        switch.exit();

        let signal = RunSignal::new();
        assert!(switch.pause(&signal, Duration::from_millis(10)));
        assert!(switch.is_paused());
        assert!(!switch.try_enter());
        switch.resume();
        assert!(switch.try_enter());
        switch.exit();
    }

    #[test]
    fn test_pause_gives_up_on_stuck_insert() {
        let switch = IngestSwitch::default();
        let signal = RunSignal::new();
        // An insert that never returns
        assert!(switch.try_enter());

        let start = Instant::now();
        assert!(!switch.pause(&signal, Duration::from_millis(50)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(switch.is_paused());

        let canceller = signal.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let start = Instant::now();
        assert!(!switch.pause(&signal, Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }
}
