//! Run configuration
//!
//! A [`RunConfig`] is built once, validated once, and then shared read-only
//! with every worker for the lifetime of the run.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ConfigError;

/// Per-sensor sampling rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum SampleRate {
    /// One reading per second
    Hz1,
    /// Two readings per second
    Hz2,
}

impl SampleRate {
    /// Readings per second
    pub fn hertz(self) -> u32 {
        match self {
            SampleRate::Hz1 => 1,
            SampleRate::Hz2 => 2,
        }
    }

    /// Time between two readings of the same sensor
    pub fn interval(self) -> Duration {
        Duration::from_secs(1) / self.hertz()
    }
}

/// Relative weights of the four query shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(deny_unknown_fields))]
pub struct QueryMix {
    /// W1 latest value
    pub latest: u32,
    /// W2 range scan
    pub range: u32,
    /// W3 downsample
    pub downsample: u32,
    /// W4 top-K
    pub top_k: u32,
}

impl QueryMix {
    /// Weights in W1..W4 order
    pub fn weights(&self) -> [u32; 4] {
        [self.latest, self.range, self.downsample, self.top_k]
    }

    /// Sum of all weights
    pub fn total(&self) -> u64 {
        self.weights().iter().map(|&w| w as u64).sum()
    }
}

impl Default for QueryMix {
    fn default() -> Self {
        Self {
            latest: 40,
            range: 30,
            downsample: 20,
            top_k: 10,
        }
    }
}

/// Window sizes used by the query shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(deny_unknown_fields))]
pub struct QueryWindows {
    /// W2 trailing window
    pub range: Duration,
    /// W3 trailing window
    pub downsample_window: Duration,
    /// W3 bucket width
    pub downsample_bucket: Duration,
    /// W4 trailing window
    pub top_k_window: Duration,
    /// W4 result size
    pub top_k: usize,
}

impl Default for QueryWindows {
    fn default() -> Self {
        Self {
            range: Duration::from_secs(5 * 60),
            downsample_window: Duration::from_secs(60 * 60),
            downsample_bucket: Duration::from_secs(60),
            top_k_window: Duration::from_secs(5 * 60),
            top_k: 10,
        }
    }
}

/// Bounded random walk that drives sensor values
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(deny_unknown_fields))]
pub struct ValueModel {
    /// Lower bound of every value
    pub min: f64,
    /// Upper bound of every value
    pub max: f64,
    /// Largest change between two consecutive readings
    pub max_step: f64,
}

impl Default for ValueModel {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 100.0,
            max_step: 0.5,
        }
    }
}

/// Configuration for a benchmark run
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialization", serde(deny_unknown_fields, default))]
pub struct RunConfig {
    /// Number of simulated sensors
    pub sensors: usize,
    /// Sampling rate of every sensor
    pub sample_rate: SampleRate,
    /// Simulated history loaded during Preload, ending at run start
    pub history_span: Duration,
    /// Real-time length of Preload
    pub preload: Duration,
    /// Real-time length of WarmUp
    pub warm_up: Duration,
    /// Real-time length of Measure
    pub measure: Duration,
    /// Real-time length of CoolDown
    pub cool_down: Duration,
    /// Idle time after Preload before the storage size is read
    pub settle: Duration,
    /// Number of repetitions merged into the final report
    pub repetitions: usize,
    /// Seed for every random stream in the run
    pub seed: u64,
    /// Logical time of the run start; `None` uses the wall clock
    ///
    /// Pinning it makes record timestamps, not only values, repeat across
    /// runs and repetitions with the same seed.
    pub logical_start: Option<DateTime<Utc>>,
    /// Relative query weights
    pub query_mix: QueryMix,
    /// Query window sizes
    pub query_windows: QueryWindows,
    /// Ingestion workers; 0 picks one worker per 50 sensors
    pub ingest_workers: usize,
    /// Query workers; 0 disables queries
    pub query_workers: usize,
    /// Target queries per second across the pool; 0 runs closed-loop
    pub query_rate: f64,
    /// Ceiling for a single backend call
    pub op_timeout: Option<Duration>,
    /// Largest tolerated insert error rate during Preload (0.0..=1.0)
    pub preload_failure_threshold: f64,
    /// Inserts required before the Preload error rate is judged
    pub preload_min_samples: u64,
    /// Sensor value model
    pub value_model: ValueModel,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sensors: 100,
            sample_rate: SampleRate::Hz1,
            history_span: Duration::from_secs(60 * 60),
            preload: Duration::from_secs(120),
            warm_up: Duration::from_secs(60),
            measure: Duration::from_secs(300),
            cool_down: Duration::from_secs(60),
            settle: Duration::from_secs(60),
            repetitions: 3,
            seed: 42,
            logical_start: None,
            query_mix: QueryMix::default(),
            query_windows: QueryWindows::default(),
            ingest_workers: 0,
            query_workers: 4,
            query_rate: 50.0,
            op_timeout: Some(Duration::from_secs(5)),
            preload_failure_threshold: 0.3,
            preload_min_samples: 100,
            value_model: ValueModel::default(),
        }
    }
}

const MAX_SENSORS: usize = 1_000_000;
const MAX_REPETITIONS: usize = 100;
const MAX_WORKERS: usize = 1024;
const SENSORS_PER_INGEST_WORKER: usize = 50;
const MAX_AUTO_INGEST_WORKERS: usize = 64;
/// Slowest paced query rate; slower targets would need slots hours apart
const MIN_QUERY_RATE: f64 = 0.001;

impl RunConfig {
    /// Set the sensor count
    pub fn with_sensors(mut self, sensors: usize) -> Self {
        self.sensors = sensors;
        self
    }

    /// Set the sample rate
    pub fn with_sample_rate(mut self, rate: SampleRate) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set all four phase durations at once
    pub fn with_phases(
        mut self,
        preload: Duration,
        warm_up: Duration,
        measure: Duration,
        cool_down: Duration,
    ) -> Self {
        self.preload = preload;
        self.warm_up = warm_up;
        self.measure = measure;
        self.cool_down = cool_down;
        self
    }

    /// Set the simulated history span and settle time
    pub fn with_history(mut self, history_span: Duration, settle: Duration) -> Self {
        self.history_span = history_span;
        self.settle = settle;
        self
    }

    /// Set the repetition count
    pub fn with_repetitions(mut self, repetitions: usize) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Pin the logical time of the run start
    pub fn with_logical_start(mut self, start: Option<DateTime<Utc>>) -> Self {
        self.logical_start = start;
        self
    }

    /// Configure the query pool
    pub fn with_queries(mut self, workers: usize, rate: f64, mix: QueryMix) -> Self {
        self.query_workers = workers;
        self.query_rate = rate;
        self.query_mix = mix;
        self
    }

    /// Set the per-call timeout ceiling
    pub fn with_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Set the Preload failure gate
    pub fn with_preload_gate(mut self, threshold: f64, min_samples: u64) -> Self {
        self.preload_failure_threshold = threshold;
        self.preload_min_samples = min_samples;
        self
    }

    /// Number of ingestion workers actually started
    pub fn effective_ingest_workers(&self) -> usize {
        let workers = if self.ingest_workers == 0 {
            self.sensors
                .div_ceil(SENSORS_PER_INGEST_WORKER)
                .clamp(1, MAX_AUTO_INGEST_WORKERS)
        } else {
            self.ingest_workers
        };
        workers.min(self.sensors.max(1))
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensors == 0 || self.sensors > MAX_SENSORS {
            return Err(out_of_range("sensors", self.sensors, "1..=1000000"));
        }
        if self.repetitions == 0 || self.repetitions > MAX_REPETITIONS {
            return Err(out_of_range("repetitions", self.repetitions, "1..=100"));
        }
        if self.measure.is_zero() {
            return Err(ConfigError::ZeroDuration("measure"));
        }
        if self.ingest_workers > MAX_WORKERS {
            return Err(out_of_range("ingest_workers", self.ingest_workers, "0..=1024"));
        }
        if self.query_workers > MAX_WORKERS {
            return Err(out_of_range("query_workers", self.query_workers, "0..=1024"));
        }
        if !self.query_rate.is_finite() || self.query_rate < 0.0 {
            return Err(out_of_range("query_rate", self.query_rate, "finite, >= 0"));
        }
        if self.query_rate > 0.0 && self.query_rate < MIN_QUERY_RATE {
            return Err(out_of_range("query_rate", self.query_rate, "0 or >= 0.001"));
        }
        if self.query_workers > 0 && self.query_mix.total() == 0 {
            return Err(ConfigError::EmptyQueryMix);
        }
        if !(0.0..=1.0).contains(&self.preload_failure_threshold) {
            return Err(out_of_range(
                "preload_failure_threshold",
                self.preload_failure_threshold,
                "0.0..=1.0",
            ));
        }
        if matches!(self.op_timeout, Some(t) if t.is_zero()) {
            return Err(ConfigError::ZeroDuration("op_timeout"));
        }

        let windows = &self.query_windows;
        if windows.range.is_zero() {
            return Err(ConfigError::ZeroDuration("query_windows.range"));
        }
        if windows.downsample_window.is_zero() {
            return Err(ConfigError::ZeroDuration("query_windows.downsample_window"));
        }
        if windows.downsample_bucket.is_zero() {
            return Err(ConfigError::ZeroDuration("query_windows.downsample_bucket"));
        }
        if windows.downsample_bucket > windows.downsample_window {
            return Err(out_of_range(
                "query_windows.downsample_bucket",
                format!("{:?}", windows.downsample_bucket),
                "<= downsample_window",
            ));
        }
        if windows.top_k_window.is_zero() {
            return Err(ConfigError::ZeroDuration("query_windows.top_k_window"));
        }
        if windows.top_k == 0 {
            return Err(out_of_range("query_windows.top_k", windows.top_k, ">= 1"));
        }

        let model = &self.value_model;
        if !(model.min.is_finite() && model.max.is_finite() && model.min < model.max) {
            return Err(out_of_range(
                "value_model",
                format!("[{}, {}]", model.min, model.max),
                "finite min < max",
            ));
        }
        if !(model.max_step.is_finite() && model.max_step > 0.0) {
            return Err(out_of_range("value_model.max_step", model.max_step, "> 0"));
        }

        Ok(())
    }

    /// Apply a single `key = value` override
    ///
    /// Durations are given in seconds (fractions allowed). Unknown keys and
    /// unparsable values are rejected; range checks are left to
    /// [`RunConfig::validate`].
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key.trim() {
            "sensors" => self.sensors = parse(key, value)?,
            "sample_rate" => {
                self.sample_rate = match value {
                    "1" | "1hz" | "1Hz" => SampleRate::Hz1,
                    "2" | "2hz" | "2Hz" => SampleRate::Hz2,
                    _ => return Err(out_of_range("sample_rate", value, "1 or 2 (Hz)")),
                }
            }
            "history_span" => self.history_span = parse_secs(key, value)?,
            "preload" => self.preload = parse_secs(key, value)?,
            "warm_up" => self.warm_up = parse_secs(key, value)?,
            "measure" => self.measure = parse_secs(key, value)?,
            "cool_down" => self.cool_down = parse_secs(key, value)?,
            "settle" => self.settle = parse_secs(key, value)?,
            "repetitions" => self.repetitions = parse(key, value)?,
            "seed" => self.seed = parse(key, value)?,
            "logical_start" => {
                self.logical_start = match value {
                    "none" | "now" => None,
                    _ => Some(
                        DateTime::parse_from_rfc3339(value)
                            .map_err(|_| out_of_range("logical_start", value, "RFC 3339 timestamp or `now`"))?
                            .with_timezone(&Utc),
                    ),
                }
            }
            "ingest_workers" => self.ingest_workers = parse(key, value)?,
            "query_workers" => self.query_workers = parse(key, value)?,
            "query_rate" => self.query_rate = parse(key, value)?,
            "op_timeout" => {
                self.op_timeout = match value {
                    "none" | "off" => None,
                    _ => Some(parse_secs(key, value)?),
                }
            }
            "preload_failure_threshold" => self.preload_failure_threshold = parse(key, value)?,
            "preload_min_samples" => self.preload_min_samples = parse(key, value)?,
            "mix.latest" => self.query_mix.latest = parse(key, value)?,
            "mix.range" => self.query_mix.range = parse(key, value)?,
            "mix.downsample" => self.query_mix.downsample = parse(key, value)?,
            "mix.top_k" => self.query_mix.top_k = parse(key, value)?,
            "window.range" => self.query_windows.range = parse_secs(key, value)?,
            "window.downsample" => self.query_windows.downsample_window = parse_secs(key, value)?,
            "window.bucket" => self.query_windows.downsample_bucket = parse_secs(key, value)?,
            "window.top_k" => self.query_windows.top_k_window = parse_secs(key, value)?,
            "top_k" => self.query_windows.top_k = parse(key, value)?,
            other => return Err(ConfigError::Unrecognized(other.to_string())),
        }
        Ok(())
    }
}

fn out_of_range(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: value.to_string(),
        expected,
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::OutOfRange {
        field: field_name(key),
        value: value.to_string(),
        expected: "a number",
    })
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = parse(key, value)?;
    Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::OutOfRange {
        field: field_name(key),
        value: value.to_string(),
        expected: "non-negative seconds",
    })
}

// Error fields are `&'static str`; map recognized keys back to a static name.
fn field_name(key: &str) -> &'static str {
    const KEYS: &[&str] = &[
        "sensors",
        "history_span",
        "preload",
        "warm_up",
        "measure",
        "cool_down",
        "settle",
        "repetitions",
        "seed",
        "ingest_workers",
        "query_workers",
        "query_rate",
        "op_timeout",
        "preload_failure_threshold",
        "preload_min_samples",
        "mix.latest",
        "mix.range",
        "mix.downsample",
        "mix.top_k",
        "window.range",
        "window.downsample",
        "window.bucket",
        "window.top_k",
        "top_k",
    ];
    KEYS.iter().copied().find(|k| *k == key).unwrap_or("option")
}
