//! Operation samples and the metrics collector
//!
//! Workers append samples to a sharded store; each thread lands on its own
//! shard so workers never serialize on a single list. Snapshots merge the
//! shards without mutating them.
//!
//! Only Measure-phase samples feed throughput and latency percentiles. Every
//! other sample is kept and counted, but never enters those statistics.
//!
//! Percentiles use the nearest-rank method over the ascending durations of
//! the successful samples: `rank = ceil(p * n)`, clamped to `[1, n]`, and the
//! percentile is the element at `rank - 1`.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use crate::error::ErrorKind;
use crate::phase::{Phase, PhaseTransition, PhaseWindow};

/// Number of sample shards
const NUM_SHARDS: usize = 16;

/// Kind of operation a sample measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum OperationKind {
    /// Sensor record insert
    Insert,
    /// W1 latest value
    Latest,
    /// W2 range scan
    Range,
    /// W3 downsample
    Downsample,
    /// W4 top-K
    TopK,
}

impl OperationKind {
    /// Every kind in report order
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Insert,
        OperationKind::Latest,
        OperationKind::Range,
        OperationKind::Downsample,
        OperationKind::TopK,
    ];

    /// The four query shapes in W1..W4 order
    pub const QUERIES: [OperationKind; 4] = [
        OperationKind::Latest,
        OperationKind::Range,
        OperationKind::Downsample,
        OperationKind::TopK,
    ];

    /// Position in [`OperationKind::ALL`]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short label used in reports
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Latest => "w1_latest",
            OperationKind::Range => "w2_range",
            OperationKind::Downsample => "w3_downsample",
            OperationKind::TopK => "w4_top_k",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call succeeded
    Ok,
    /// The call failed
    Err(ErrorKind),
}

/// One timed backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationSample {
    /// What was called
    pub kind: OperationKind,
    /// Phase observed when the call completed
    pub phase: Phase,
    /// When the call started
    pub start: Instant,
    /// How long the call took
    pub duration: Duration,
    /// How the call ended
    pub outcome: Outcome,
}

impl OperationSample {
    /// Whether the call succeeded
    pub fn is_ok(&self) -> bool {
        self.outcome == Outcome::Ok
    }
}

/// Success and failure counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct OutcomeCounts {
    /// Successful calls
    pub ok: u64,
    /// Failed calls
    pub errors: u64,
}

impl OutcomeCounts {
    /// All calls
    pub fn total(&self) -> u64 {
        self.ok + self.errors
    }

    /// errors / total, 0 when nothing was recorded
    pub fn error_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.errors as f64 / total as f64,
        }
    }
}

/// Latency distribution of successful Measure-phase calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct LatencySummary {
    /// Samples in the distribution
    pub samples: u64,
    /// Fastest call
    pub min: Duration,
    /// Slowest call
    pub max: Duration,
    /// Arithmetic mean
    pub mean: Duration,
    /// 50th percentile
    pub p50: Duration,
    /// 95th percentile
    pub p95: Duration,
    /// 99th percentile
    pub p99: Duration,
}

impl LatencySummary {
    /// Summarize `durations`, which must be sorted ascending
    pub fn from_sorted(durations: &[Duration]) -> Option<Self> {
        let (min, max) = (*durations.first()?, *durations.last()?);
        let total: u128 = durations.iter().map(|d| d.as_nanos()).sum();
        let mean_nanos = total / durations.len() as u128;
        Some(Self {
            samples: durations.len() as u64,
            min,
            max,
            mean: Duration::from_nanos(mean_nanos.min(u64::MAX as u128) as u64),
            p50: percentile(durations, 0.50)?,
            p95: percentile(durations, 0.95)?,
            p99: percentile(durations, 0.99)?,
        })
    }
}

/// Nearest-rank percentile of ascending `sorted` durations
///
/// `rank = ceil(p * n)` clamped to `[1, n]`; `None` when `sorted` is empty.
pub fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (p * n as f64).ceil();
    let rank = if rank.is_nan() { 1 } else { (rank as usize).clamp(1, n) };
    Some(sorted[rank - 1])
}

/// Statistics for one operation kind within one phase
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct KindStats {
    /// Operation kind
    pub kind: OperationKind,
    /// Success / failure counts
    pub counts: OutcomeCounts,
    /// Failures broken down by cause
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    /// Successful calls per second; Measure only, 0 otherwise
    pub throughput: f64,
    /// Latency of successful calls; Measure only
    pub latency: Option<LatencySummary>,
}

impl KindStats {
    fn empty(kind: OperationKind) -> Self {
        Self {
            kind,
            counts: OutcomeCounts::default(),
            errors_by_kind: BTreeMap::new(),
            throughput: 0.0,
            latency: None,
        }
    }
}

/// Per-kind statistics of one phase
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricSnapshot {
    /// Phase the snapshot covers
    pub phase: Phase,
    /// Wall-clock length of that phase (up to now if still open)
    pub phase_duration: Duration,
    /// One entry per kind, in [`OperationKind::ALL`] order
    pub kinds: Vec<KindStats>,
}

impl MetricSnapshot {
    /// Statistics of one kind
    pub fn kind(&self, kind: OperationKind) -> &KindStats {
        &self.kinds[kind.index()]
    }

    /// Failures across every kind
    pub fn total_errors(&self) -> u64 {
        self.kinds.iter().map(|k| k.counts.errors).sum()
    }

    /// Successful calls across every query kind
    pub fn query_ok(&self) -> u64 {
        OperationKind::QUERIES
            .iter()
            .map(|k| self.kind(*k).counts.ok)
            .sum()
    }
}

thread_local! {
    static SHARD_HINT: Cell<Option<usize>> = const { Cell::new(None) };
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

fn shard_hint() -> usize {
    SHARD_HINT.with(|hint| match hint.get() {
        Some(shard) => shard,
        None => {
            let shard = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) % NUM_SHARDS;
            hint.set(Some(shard));
            shard
        }
    })
}

/// Append-only, phase-partitioned store of operation samples
pub struct MetricsCollector {
    shards: Box<[CachePadded<Mutex<Vec<OperationSample>>>]>,
    windows: RwLock<[Option<PhaseWindow>; 5]>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
            windows: RwLock::new([None; 5]),
        }
    }

    /// Append one sample
    pub fn record(&self, sample: OperationSample) {
        self.shards[shard_hint()].lock().push(sample);
    }

    /// Track phase boundaries; subscribe this to the phase controller
    pub fn observe(&self, transition: &PhaseTransition) {
        let mut windows = self.windows.write();
        if let Some(from) = transition.from {
            if let Some(window) = windows[from.index()].as_mut() {
                window.end = Some(transition.at);
            }
        }
        windows[transition.to.index()] = Some(PhaseWindow {
            start: transition.at,
            end: None,
        });
    }

    /// Set the span of `phase` directly
    pub fn set_window(&self, phase: Phase, window: PhaseWindow) {
        self.windows.write()[phase.index()] = Some(window);
    }

    /// Span of `phase` as observed
    pub fn window(&self, phase: Phase) -> Option<PhaseWindow> {
        self.windows.read()[phase.index()]
    }

    /// Total samples held
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Whether no sample was recorded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every sample recorded in `phase`
    pub fn samples(&self, phase: Phase) -> Vec<OperationSample> {
        let mut samples = Vec::new();
        for shard in self.shards.iter() {
            samples.extend(shard.lock().iter().filter(|s| s.phase == phase).copied());
        }
        samples
    }

    /// Success / failure counts of `kind` in `phase`
    pub fn counts(&self, phase: Phase, kind: OperationKind) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for shard in self.shards.iter() {
            for sample in shard.lock().iter() {
                if sample.phase == phase && sample.kind == kind {
                    if sample.is_ok() {
                        counts.ok += 1;
                    } else {
                        counts.errors += 1;
                    }
                }
            }
        }
        counts
    }

    /// Statistics of `phase`
    ///
    /// Counts cover every sample of the phase. Throughput and latency are
    /// only computed for Measure. Calling this does not modify the store.
    pub fn snapshot(&self, phase: Phase) -> MetricSnapshot {
        let samples = self.samples(phase);
        let phase_duration = self.window(phase).map_or(Duration::ZERO, |w| w.duration());

        let mut kinds: Vec<KindStats> = OperationKind::ALL.iter().map(|k| KindStats::empty(*k)).collect();
        let mut durations: Vec<Vec<Duration>> = vec![Vec::new(); OperationKind::ALL.len()];

        for sample in &samples {
            let stats = &mut kinds[sample.kind.index()];
            match sample.outcome {
                Outcome::Ok => {
                    stats.counts.ok += 1;
                    durations[sample.kind.index()].push(sample.duration);
                }
                Outcome::Err(cause) => {
                    stats.counts.errors += 1;
                    *stats.errors_by_kind.entry(cause).or_insert(0) += 1;
                }
            }
        }

        if phase == Phase::Measure {
            let secs = phase_duration.as_secs_f64();
            for (stats, mut ok_durations) in kinds.iter_mut().zip(durations) {
                sort_durations(&mut ok_durations);
                stats.latency = LatencySummary::from_sorted(&ok_durations);
                stats.throughput = if secs > 0.0 {
                    stats.counts.ok as f64 / secs
                } else {
                    0.0
                };
            }
        }

        MetricSnapshot {
            phase,
            phase_duration,
            kinds,
        }
    }
}

#[cfg(feature = "parallel")]
fn sort_durations(durations: &mut [Duration]) {
    use rayon::slice::ParallelSliceMut;
    durations.par_sort_unstable();
}

#[cfg(not(feature = "parallel"))]
fn sort_durations(durations: &mut [Duration]) {
    durations.sort_unstable();
}
