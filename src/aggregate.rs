//! Run aggregator
//!
//! Merges the Measure snapshots of every completed repetition into one
//! report. Each statistic is summarized as mean and population standard
//! deviation, `sqrt(sum((x - mean)^2) / n)`, so a single repetition has a
//! deviation of zero. Values are sorted before they are summed, which makes
//! the result independent of repetition order down to the last bit.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::metrics::{KindStats, MetricSnapshot, OperationKind};
use crate::resource::ResourceStats;

/// Storage size around the ingest-only phase of one repetition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageDelta {
    /// Bytes before Preload
    pub before: u64,
    /// Bytes after Preload plus the settle wait
    pub after: u64,
}

impl StorageDelta {
    /// Growth in bytes; 0 if the store shrank
    pub fn delta(&self) -> u64 {
        self.after.saturating_sub(self.before)
    }
}

/// Sample counts seen during WarmUp
///
/// WarmUp samples never reach the report's statistics; this only shows the
/// workload was actually running before measurement began.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct WarmupCheck {
    /// Successful inserts
    pub inserts_ok: u64,
    /// Successful queries, any shape
    pub queries_ok: u64,
    /// Failed calls of any kind
    pub errors: u64,
}

impl WarmupCheck {
    /// Counts from a WarmUp snapshot
    pub fn from_snapshot(snapshot: &MetricSnapshot) -> Self {
        Self {
            inserts_ok: snapshot.kind(OperationKind::Insert).counts.ok,
            queries_ok: snapshot.query_ok(),
            errors: snapshot.total_errors(),
        }
    }

    /// Whether both inserts and, when expected, queries succeeded
    pub fn is_healthy(&self, expect_queries: bool) -> bool {
        self.inserts_ok > 0 && (!expect_queries || self.queries_ok > 0)
    }
}

/// Everything one completed repetition contributes to the report
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct RepetitionResult {
    /// Zero-based repetition index
    pub index: usize,
    /// Measure-phase statistics
    pub snapshot: MetricSnapshot,
    /// Storage size around Preload
    pub storage: StorageDelta,
    /// Measure-phase host resources, if a sampler was attached
    pub resources: Option<ResourceStats>,
    /// WarmUp sanity counts
    pub warmup: WarmupCheck,
}

/// A per-kind figure that is averaged across repetitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum Statistic {
    /// Successful calls per second
    Throughput,
    /// Successful calls
    Ok,
    /// Failed calls
    Errors,
    /// errors / total
    ErrorRate,
    /// Mean latency, ms
    MeanLatency,
    /// Median latency, ms
    P50,
    /// 95th percentile latency, ms
    P95,
    /// 99th percentile latency, ms
    P99,
    /// Slowest call, ms
    MaxLatency,
}

impl Statistic {
    /// Every statistic in report order
    pub const ALL: [Statistic; 9] = [
        Statistic::Throughput,
        Statistic::Ok,
        Statistic::Errors,
        Statistic::ErrorRate,
        Statistic::MeanLatency,
        Statistic::P50,
        Statistic::P95,
        Statistic::P99,
        Statistic::MaxLatency,
    ];

    /// Column label
    pub fn as_str(self) -> &'static str {
        match self {
            Statistic::Throughput => "throughput_ops",
            Statistic::Ok => "ok",
            Statistic::Errors => "errors",
            Statistic::ErrorRate => "error_rate",
            Statistic::MeanLatency => "mean_ms",
            Statistic::P50 => "p50_ms",
            Statistic::P95 => "p95_ms",
            Statistic::P99 => "p99_ms",
            Statistic::MaxLatency => "max_ms",
        }
    }

    /// Value of this statistic in one repetition
    ///
    /// Latency statistics are `None` when the repetition had no successful
    /// call of the kind; such repetitions are left out of the average.
    pub fn extract(self, stats: &KindStats) -> Option<f64> {
        let latency = stats.latency.as_ref();
        match self {
            Statistic::Throughput => Some(stats.throughput),
            Statistic::Ok => Some(stats.counts.ok as f64),
            Statistic::Errors => Some(stats.counts.errors as f64),
            Statistic::ErrorRate => Some(stats.counts.error_rate()),
            Statistic::MeanLatency => latency.map(|l| millis(l.mean)),
            Statistic::P50 => latency.map(|l| millis(l.p50)),
            Statistic::P95 => latency.map(|l| millis(l.p95)),
            Statistic::P99 => latency.map(|l| millis(l.p99)),
            Statistic::MaxLatency => latency.map(|l| millis(l.max)),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

/// Mean and population standard deviation of one figure
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct MeanStdev {
    /// Values the figure covers
    pub n: usize,
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation
    pub stdev: f64,
}

impl MeanStdev {
    /// Summarize `values`; `None` when empty
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - mean).powi(2)).collect();
        deviations.sort_by(f64::total_cmp);
        let variance = deviations.iter().sum::<f64>() / n;

        Some(Self {
            n: sorted.len(),
            mean,
            stdev: variance.sqrt(),
        })
    }
}

/// Aggregated figures of one operation kind
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct KindAggregate {
    /// Operation kind
    pub kind: OperationKind,
    /// Every statistic with at least one value
    pub stats: BTreeMap<Statistic, MeanStdev>,
}

impl KindAggregate {
    /// Figure for `stat`, if any repetition produced one
    pub fn get(&self, stat: Statistic) -> Option<&MeanStdev> {
        self.stats.get(&stat)
    }
}

/// Storage growth across repetitions
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct StorageAggregate {
    /// Raw per-repetition measurements, by repetition index
    pub raw: Vec<StorageDelta>,
    /// Mean and deviation of the growth in bytes
    pub delta_bytes: Option<MeanStdev>,
}

/// Host resource figures across repetitions
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceAggregate {
    /// Repetitions that had resource samples
    pub repetitions: usize,
    /// Per-repetition mean CPU percent
    pub cpu_mean: MeanStdev,
    /// Per-repetition peak CPU percent
    pub cpu_peak: MeanStdev,
    /// Per-repetition mean memory MiB
    pub mem_mean: MeanStdev,
    /// Per-repetition peak memory MiB
    pub mem_peak: MeanStdev,
}

/// Final result of a run
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct AggregatedReport {
    /// Completed repetitions merged into the report
    pub repetitions: usize,
    /// One entry per kind, in [`OperationKind::ALL`] order
    pub kinds: Vec<KindAggregate>,
    /// Storage growth
    pub storage: StorageAggregate,
    /// Host resources, if any repetition had samples
    pub resources: Option<ResourceAggregate>,
    /// WarmUp counts, by repetition index
    pub warmup: Vec<WarmupCheck>,
}

impl AggregatedReport {
    /// Aggregate of one kind
    pub fn kind(&self, kind: OperationKind) -> &KindAggregate {
        &self.kinds[kind.index()]
    }

    /// Shorthand for one figure of one kind
    pub fn stat(&self, kind: OperationKind, stat: Statistic) -> Option<&MeanStdev> {
        self.kind(kind).get(stat)
    }
}

/// Merge completed repetitions into one report
///
/// A pure function of its input: any ordering of the same results yields an
/// identical report.
pub fn aggregate(results: &[RepetitionResult]) -> AggregatedReport {
    let mut ordered: Vec<&RepetitionResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.index);

    let kinds = OperationKind::ALL
        .iter()
        .map(|&kind| {
            let stats = Statistic::ALL
                .iter()
                .filter_map(|&stat| {
                    let values: Vec<f64> = ordered
                        .iter()
                        .filter_map(|r| stat.extract(r.snapshot.kind(kind)))
                        .collect();
                    MeanStdev::from_values(&values).map(|summary| (stat, summary))
                })
                .collect();
            KindAggregate { kind, stats }
        })
        .collect();

    let raw: Vec<StorageDelta> = ordered.iter().map(|r| r.storage).collect();
    let deltas: Vec<f64> = raw.iter().map(|s| s.delta() as f64).collect();

    AggregatedReport {
        repetitions: ordered.len(),
        kinds,
        storage: StorageAggregate {
            delta_bytes: MeanStdev::from_values(&deltas),
            raw,
        },
        resources: aggregate_resources(&ordered),
        warmup: ordered.iter().map(|r| r.warmup).collect(),
    }
}

fn aggregate_resources(results: &[&RepetitionResult]) -> Option<ResourceAggregate> {
    let stats: Vec<&ResourceStats> = results.iter().filter_map(|r| r.resources.as_ref()).collect();
    let series = |f: fn(&ResourceStats) -> f64| -> Option<MeanStdev> {
        let values: Vec<f64> = stats.iter().map(|s| f(s)).collect();
        MeanStdev::from_values(&values)
    };
    Some(ResourceAggregate {
        repetitions: stats.len(),
        cpu_mean: series(|s| s.cpu.mean)?,
        cpu_peak: series(|s| s.cpu.peak)?,
        mem_mean: series(|s| s.mem_mib.mean)?,
        mem_peak: series(|s| s.mem_mib.peak)?,
    })
}
