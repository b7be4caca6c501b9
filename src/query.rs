//! Query worker pool
//!
//! Workers issue the four query shapes W1..W4 at configured relative weights,
//! starting when WarmUp begins. Each worker has its own seeded RNG, so shape
//! and sensor choices are reproducible per worker. Sensors are drawn
//! uniformly on every call.
//!
//! With a positive target rate the pool is open-loop: worker `w` of `n` owns
//! every `n`-th slot of a global schedule spaced `1 / rate` apart. Slots that
//! pass while a call is still running are skipped rather than burst later.
//! A rate of zero runs every worker closed-loop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::distributions::{Distribution, Uniform, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::backend::BackendAdapter;
use crate::config::{QueryMix, QueryWindows};
use crate::error::{AdapterError, ConfigError, Result, RunError};
use crate::executor::CallExecutor;
use crate::generator::{splitmix64, LogicalClock};
use crate::metrics::{MetricsCollector, OperationKind, OperationSample, Outcome};
use crate::phase::{Phase, PhaseHandle};
use crate::record::{SensorSet, TimeWindow};

/// Shared inputs of every query worker
#[derive(Clone)]
pub struct QueryContext {
    /// Target backend
    pub adapter: Arc<dyn BackendAdapter>,
    /// Sample sink
    pub collector: Arc<MetricsCollector>,
    /// Phase view
    pub phases: PhaseHandle,
    /// Logical time source; windows trail its `now`
    pub clock: LogicalClock,
    /// Sensors eligible for W1..W3
    pub sensors: SensorSet,
    /// Shape weights
    pub mix: QueryMix,
    /// Window sizes
    pub windows: QueryWindows,
    /// Ceiling per call
    pub op_timeout: Option<Duration>,
    /// Run seed
    pub seed: u64,
}

/// What one query worker did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryWorkerReport {
    /// Worker index
    pub worker: usize,
    /// Calls issued per shape, W1..W4
    pub issued: [u64; 4],
    /// Failed calls
    pub failed: u64,
    /// Schedule slots skipped because a call overran
    pub skipped_slots: u64,
    /// Executors abandoned after timeouts
    pub timeouts_abandoned: u64,
}

impl QueryWorkerReport {
    /// Calls issued across every shape
    pub fn total_issued(&self) -> u64 {
        self.issued.iter().sum()
    }
}

/// One query call, fully resolved
#[derive(Debug, Clone, PartialEq)]
pub enum QueryCall {
    /// W1
    Latest {
        /// Queried sensor
        sensor_id: Arc<str>,
    },
    /// W2
    Range {
        /// Queried sensor
        sensor_id: Arc<str>,
        /// Trailing window
        window: TimeWindow,
    },
    /// W3
    Downsample {
        /// Queried sensor
        sensor_id: Arc<str>,
        /// Trailing window
        window: TimeWindow,
        /// Bucket width
        bucket: Duration,
    },
    /// W4
    TopK {
        /// Trailing window
        window: TimeWindow,
        /// Result size
        k: usize,
    },
}

impl QueryCall {
    /// The operation kind this call is recorded under
    pub fn kind(&self) -> OperationKind {
        match self {
            QueryCall::Latest { .. } => OperationKind::Latest,
            QueryCall::Range { .. } => OperationKind::Range,
            QueryCall::Downsample { .. } => OperationKind::Downsample,
            QueryCall::TopK { .. } => OperationKind::TopK,
        }
    }

    /// Issue the call; returns the number of rows produced
    pub fn execute(&self, adapter: &dyn BackendAdapter) -> std::result::Result<usize, AdapterError> {
        match self {
            QueryCall::Latest { sensor_id } => adapter.query_latest(sensor_id).map(|_| 1),
            QueryCall::Range { sensor_id, window } => {
                adapter.query_range(sensor_id, *window).map(|rows| rows.len())
            }
            QueryCall::Downsample {
                sensor_id,
                window,
                bucket,
            } => adapter
                .query_downsample(sensor_id, *window, *bucket)
                .map(|rows| rows.len()),
            QueryCall::TopK { window, k } => adapter.query_top_k(*window, *k).map(|rows| rows.len()),
        }
    }
}

/// Picks query shapes and sensors from a seeded stream
pub struct QueryPlanner {
    rng: StdRng,
    shapes: WeightedIndex<u32>,
    sensor_pick: Uniform<usize>,
    sensors: SensorSet,
    windows: QueryWindows,
}

impl QueryPlanner {
    /// Planner for worker `worker` of a run seeded with `seed`
    pub fn new(
        seed: u64,
        worker: usize,
        mix: QueryMix,
        windows: QueryWindows,
        sensors: SensorSet,
    ) -> std::result::Result<Self, ConfigError> {
        let shapes = WeightedIndex::new(mix.weights()).map_err(|_| ConfigError::EmptyQueryMix)?;
        if sensors.is_empty() {
            return Err(ConfigError::OutOfRange {
                field: "sensors",
                value: "0".to_string(),
                expected: ">= 1",
            });
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(splitmix64(seed ^ splitmix64(worker as u64 + 1))),
            shapes,
            sensor_pick: Uniform::new(0, sensors.len()),
            sensors,
            windows,
        })
    }

    fn sensor(&mut self) -> Arc<str> {
        let index = self.sensor_pick.sample(&mut self.rng);
        // Index is drawn from 0..len
        self.sensors.ids()[index].clone()
    }

    /// Next call, with windows trailing `now`
    pub fn next_call(&mut self, now: chrono::DateTime<chrono::Utc>) -> QueryCall {
        let w = self.windows;
        match OperationKind::QUERIES[self.shapes.sample(&mut self.rng)] {
            OperationKind::Latest => QueryCall::Latest {
                sensor_id: self.sensor(),
            },
            OperationKind::Range => QueryCall::Range {
                sensor_id: self.sensor(),
                window: TimeWindow::trailing(now, w.range),
            },
            OperationKind::Downsample => QueryCall::Downsample {
                sensor_id: self.sensor(),
                window: TimeWindow::trailing(now, w.downsample_window),
                bucket: w.downsample_bucket,
            },
            _ => QueryCall::TopK {
                window: TimeWindow::trailing(now, w.top_k_window),
                k: w.top_k,
            },
        }
    }
}

/// Open-loop slot schedule of one worker
#[derive(Debug, Clone, Copy)]
struct Pacer {
    next: Instant,
    interval: Duration,
}

impl Pacer {
    fn new(start: Instant, interval: Duration, worker: usize, workers: usize) -> Self {
        let offset = interval.mul_f64(worker as f64 / workers.max(1) as f64);
        Self {
            next: start + offset,
            interval,
        }
    }

    /// Move past the slot just used; returns how many slots were skipped
    fn advance(&mut self, now: Instant) -> u64 {
        self.next += self.interval;
        if self.next >= now || self.interval.is_zero() {
            return 0;
        }
        let behind = now.duration_since(self.next).as_nanos();
        let skipped = (behind / self.interval.as_nanos()) as u64 + 1;
        self.next += self.interval * skipped.min(u32::MAX as u64) as u32;
        skipped
    }
}

struct QueryWorker {
    id: usize,
    ctx: QueryContext,
    planner: QueryPlanner,
    executor: CallExecutor,
    slot_interval: Option<Duration>,
    workers: usize,
    report: QueryWorkerReport,
}

impl QueryWorker {
    fn run(mut self) -> QueryWorkerReport {
        if !self.ctx.phases.wait_for(Phase::WarmUp) {
            return self.report;
        }
        let start = self
            .ctx
            .phases
            .window(Phase::WarmUp)
            .map_or_else(Instant::now, |w| w.start);
        let mut pacer = self
            .slot_interval
            .map(|interval| Pacer::new(start, interval, self.id, self.workers));
        debug!(worker = self.id, paced = pacer.is_some(), "query worker started");

        while !self.ctx.phases.should_stop() {
            if let Some(pacer) = &pacer {
                if !self.ctx.phases.signal().sleep_until(pacer.next) {
                    break;
                }
                if self.ctx.phases.should_stop() {
                    break;
                }
            }

            let call = self.planner.next_call(self.ctx.clock.now());
            self.issue(call);

            if let Some(pacer) = pacer.as_mut() {
                self.report.skipped_slots += pacer.advance(Instant::now());
            }
        }

        self.report.timeouts_abandoned = self.executor.abandoned();
        debug!(
            worker = self.id,
            issued = self.report.total_issued(),
            failed = self.report.failed,
            "query worker stopped"
        );
        self.report
    }

    fn issue(&mut self, call: QueryCall) {
        let kind = call.kind();
        let adapter = self.ctx.adapter.clone();
        let start = Instant::now();
        let result = self.executor.call(move || call.execute(adapter.as_ref()));
        let duration = start.elapsed();

        self.report.issued[kind.index() - 1] += 1;
        let outcome = match result {
            Ok(_) => Outcome::Ok,
            Err(err) => {
                self.report.failed += 1;
                Outcome::Err(err.kind())
            }
        };
        self.ctx.collector.record(OperationSample {
            kind,
            phase: self.ctx.phases.current_phase(),
            start,
            duration,
            outcome,
        });
    }
}

/// Running set of query workers
pub struct QueryPool {
    handles: Vec<JoinHandle<QueryWorkerReport>>,
}

impl QueryPool {
    /// Start `workers` workers targeting `rate` queries per second in total
    ///
    /// Workers block until WarmUp; `workers == 0` starts nothing.
    pub fn start(ctx: QueryContext, workers: usize, rate: f64) -> Result<Self> {
        let slot_interval = if rate > 0.0 {
            let interval = Duration::try_from_secs_f64(workers.max(1) as f64 / rate).map_err(|_| {
                RunError::Config(ConfigError::OutOfRange {
                    field: "query_rate",
                    value: rate.to_string(),
                    expected: "a rate whose slot interval fits a Duration",
                })
            })?;
            Some(interval)
        } else {
            None
        };
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let planner = QueryPlanner::new(ctx.seed, id, ctx.mix, ctx.windows, ctx.sensors.clone())
                .map_err(RunError::Config)?;
            let worker = QueryWorker {
                id,
                planner,
                executor: CallExecutor::new(format!("query-{}", id), ctx.op_timeout),
                slot_interval,
                workers,
                report: QueryWorkerReport {
                    worker: id,
                    ..Default::default()
                },
                ctx: ctx.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("query-{}", id))
                .spawn(move || worker.run())
                .map_err(|source| RunError::Spawn {
                    worker: "query",
                    source,
                })?;
            handles.push(handle);
        }

        info!(workers, rate, "query pool started");
        Ok(Self { handles })
    }

    /// Number of running workers
    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to stop
    pub fn join(self) -> Result<Vec<QueryWorkerReport>> {
        self.handles
            .into_iter()
            .map(|handle| handle.join().map_err(|_| RunError::WorkerPanicked("query")))
            .collect()
    }
}
