//! Backend adapter interface and the in-process adapters
//!
//! The engine reaches a storage engine only through [`BackendAdapter`]. Each
//! concrete database gets one implementation; the engine never constructs
//! engine-specific queries itself.

use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::error::AdapterError;
use crate::record::{BucketMean, Reading, SensorMean, SensorRecord, TimeWindow};

/// Result of a top-K query
pub type TopK = SmallVec<[SensorMean; 10]>;

/// Capability set every storage engine must provide
///
/// Implementations must be safe to call from many workers at once.
pub trait BackendAdapter: Send + Sync {
    /// Short engine name used in logs and reports
    fn name(&self) -> &str;

    /// Store one reading
    fn insert(&self, record: &SensorRecord) -> Result<(), AdapterError>;

    /// W1: most recent reading of a sensor
    fn query_latest(&self, sensor_id: &str) -> Result<Reading, AdapterError>;

    /// W2: all readings of a sensor inside `window`, oldest first
    fn query_range(&self, sensor_id: &str, window: TimeWindow) -> Result<Vec<Reading>, AdapterError>;

    /// W3: mean per `bucket` inside `window`, oldest bucket first
    fn query_downsample(
        &self,
        sensor_id: &str,
        window: TimeWindow,
        bucket: Duration,
    ) -> Result<Vec<BucketMean>, AdapterError>;

    /// W4: the `k` sensors with the highest mean inside `window`, highest first
    fn query_top_k(&self, window: TimeWindow, k: usize) -> Result<TopK, AdapterError>;

    /// Bytes currently used by the stored dataset
    fn storage_size_bytes(&self) -> u64;
}

impl<B: BackendAdapter + ?Sized> BackendAdapter for Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn insert(&self, record: &SensorRecord) -> Result<(), AdapterError> {
        (**self).insert(record)
    }

    fn query_latest(&self, sensor_id: &str) -> Result<Reading, AdapterError> {
        (**self).query_latest(sensor_id)
    }

    fn query_range(&self, sensor_id: &str, window: TimeWindow) -> Result<Vec<Reading>, AdapterError> {
        (**self).query_range(sensor_id, window)
    }

    fn query_downsample(
        &self,
        sensor_id: &str,
        window: TimeWindow,
        bucket: Duration,
    ) -> Result<Vec<BucketMean>, AdapterError> {
        (**self).query_downsample(sensor_id, window, bucket)
    }

    fn query_top_k(&self, window: TimeWindow, k: usize) -> Result<TopK, AdapterError> {
        (**self).query_top_k(window, k)
    }

    fn storage_size_bytes(&self) -> u64 {
        (**self).storage_size_bytes()
    }
}

/// Number of lock shards in the in-memory backend
const NUM_SHARDS: usize = 16;
/// Accounted bytes per stored reading (timestamp + value + index overhead)
const READING_FOOTPRINT: u64 = 48;

type Series = BTreeMap<DateTime<Utc>, f64>;

/// In-memory time-series store
///
/// Sensors are spread over sharded `RwLock`s; each sensor keeps its readings
/// in timestamp order.
pub struct MemoryBackend {
    shards: Vec<RwLock<AHashMap<Arc<str>, Series>>>,
    hasher: ahash::RandomState,
    bytes: AtomicU64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(AHashMap::new())).collect(),
            hasher: ahash::RandomState::new(),
            bytes: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, sensor_id: &str) -> &RwLock<AHashMap<Arc<str>, Series>> {
        let mut hasher = self.hasher.build_hasher();
        sensor_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    /// Total stored readings
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().values().map(|s| s.len()).sum::<usize>())
            .sum()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of readings stored for one sensor
    pub fn sensor_len(&self, sensor_id: &str) -> usize {
        self.shard_for(sensor_id)
            .read()
            .get(sensor_id)
            .map_or(0, |series| series.len())
    }

    /// Remove every reading
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
        self.bytes.store(0, Ordering::Release);
    }
}

fn window_mean(series: &Series, window: TimeWindow) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0u64;
    for (_, value) in series.range(window.start..window.end) {
        sum += value;
        count += 1;
    }
    (count > 0).then(|| sum / count as f64)
}

impl BackendAdapter for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn insert(&self, record: &SensorRecord) -> Result<(), AdapterError> {
        let mut shard = self.shard_for(&record.sensor_id).write();
        let series = shard.entry(record.sensor_id.clone()).or_default();
        if series.insert(record.timestamp, record.value).is_none() {
            self.bytes
                .fetch_add(READING_FOOTPRINT + record.sensor_id.len() as u64, Ordering::AcqRel);
        }
        Ok(())
    }

    fn query_latest(&self, sensor_id: &str) -> Result<Reading, AdapterError> {
        let shard = self.shard_for(sensor_id).read();
        shard
            .get(sensor_id)
            .and_then(|series| series.last_key_value())
            .map(|(timestamp, value)| Reading {
                timestamp: *timestamp,
                value: *value,
            })
            .ok_or_else(|| AdapterError::NotFound {
                sensor_id: sensor_id.to_string(),
            })
    }

    fn query_range(&self, sensor_id: &str, window: TimeWindow) -> Result<Vec<Reading>, AdapterError> {
        if window.start >= window.end {
            return Ok(Vec::new());
        }
        let shard = self.shard_for(sensor_id).read();
        Ok(shard
            .get(sensor_id)
            .map(|series| {
                series
                    .range(window.start..window.end)
                    .map(|(timestamp, value)| Reading {
                        timestamp: *timestamp,
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn query_downsample(
        &self,
        sensor_id: &str,
        window: TimeWindow,
        bucket: Duration,
    ) -> Result<Vec<BucketMean>, AdapterError> {
        let bucket = chrono::Duration::from_std(bucket)
            .map_err(|e| AdapterError::Backend(format!("bucket width: {}", e)))?;
        if bucket <= chrono::Duration::zero() {
            return Err(AdapterError::Backend("bucket width must be positive".to_string()));
        }
        if window.start >= window.end {
            return Ok(Vec::new());
        }
        let bucket_nanos = bucket.num_nanoseconds().unwrap_or(i64::MAX);

        let shard = self.shard_for(sensor_id).read();
        let Some(series) = shard.get(sensor_id) else {
            return Ok(Vec::new());
        };

        // Buckets are aligned to the window start
        let mut buckets: BTreeMap<i64, (f64, u64)> = BTreeMap::new();
        for (timestamp, value) in series.range(window.start..window.end) {
            let offset = (*timestamp - window.start).num_nanoseconds().unwrap_or(i64::MAX);
            let slot = buckets.entry(offset / bucket_nanos).or_insert((0.0, 0));
            slot.0 += value;
            slot.1 += 1;
        }

        Ok(buckets
            .into_iter()
            .map(|(index, (sum, count))| BucketMean {
                bucket_start: window.start + chrono::Duration::nanoseconds(index * bucket_nanos),
                mean: sum / count as f64,
                count,
            })
            .collect())
    }

    fn query_top_k(&self, window: TimeWindow, k: usize) -> Result<TopK, AdapterError> {
        if k == 0 || window.start >= window.end {
            return Ok(TopK::new());
        }
        let mut means: Vec<SensorMean> = Vec::new();
        for shard in &self.shards {
            let shard = shard.read();
            for (sensor_id, series) in shard.iter() {
                if let Some(mean) = window_mean(series, window) {
                    means.push(SensorMean {
                        sensor_id: sensor_id.clone(),
                        mean,
                    });
                }
            }
        }
        means.sort_by(|a, b| {
            b.mean
                .total_cmp(&a.mean)
                .then_with(|| a.sensor_id.cmp(&b.sensor_id))
        });
        means.truncate(k);
        Ok(means.into_iter().collect())
    }

    fn storage_size_bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }
}

/// Operation family a fault plan applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// `insert`
    Insert,
    /// All four query shapes
    Query,
}

/// Error ratio and latency injected into one operation family
#[derive(Default)]
struct FaultPlan {
    /// Error ratio in parts per million
    error_ppm: AtomicU64,
    /// Added latency in microseconds
    delay_us: AtomicU64,
    /// Calls seen so far
    calls: AtomicU64,
}

impl FaultPlan {
    /// Decide deterministically whether this call fails
    ///
    /// Call `n` fails when `floor((n + 1) * ratio)` exceeds `floor(n * ratio)`,
    /// so exactly `ratio` of every run of calls fails.
    fn should_fail(&self) -> bool {
        let ppm = self.error_ppm.load(Ordering::Relaxed);
        if ppm == 0 {
            return false;
        }
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        ((n + 1) * ppm) / 1_000_000 > (n * ppm) / 1_000_000
    }

    fn delay(&self) -> Option<Duration> {
        let us = self.delay_us.load(Ordering::Relaxed);
        (us > 0).then(|| Duration::from_micros(us))
    }
}

/// Wraps an adapter and injects failures and latency
///
/// Faults can be re-armed while a run is in progress.
pub struct FaultInjectingBackend<B> {
    inner: B,
    insert: FaultPlan,
    query: FaultPlan,
    faults_fired: AtomicU64,
}

impl<B: BackendAdapter> FaultInjectingBackend<B> {
    /// Wrap `inner` with no faults armed
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            insert: FaultPlan::default(),
            query: FaultPlan::default(),
            faults_fired: AtomicU64::new(0),
        }
    }

    fn plan(&self, target: FaultTarget) -> &FaultPlan {
        match target {
            FaultTarget::Insert => &self.insert,
            FaultTarget::Query => &self.query,
        }
    }

    /// Fail `ratio` (0.0..=1.0) of the calls of `target`
    pub fn set_error_ratio(&self, target: FaultTarget, ratio: f64) {
        let ppm = (ratio.clamp(0.0, 1.0) * 1_000_000.0).round() as u64;
        self.plan(target).error_ppm.store(ppm, Ordering::Relaxed);
    }

    /// Delay every call of `target` by `delay`
    pub fn set_delay(&self, target: FaultTarget, delay: Duration) {
        let us = delay.as_micros().min(u64::MAX as u128) as u64;
        self.plan(target).delay_us.store(us, Ordering::Relaxed);
    }

    /// Disarm every fault
    pub fn clear_faults(&self) {
        for target in [FaultTarget::Insert, FaultTarget::Query] {
            self.set_error_ratio(target, 0.0);
            self.set_delay(target, Duration::ZERO);
        }
    }

    /// Number of injected errors so far
    pub fn faults_fired(&self) -> u64 {
        self.faults_fired.load(Ordering::Relaxed)
    }

    /// The wrapped adapter
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn before_call(&self, target: FaultTarget) -> Result<(), AdapterError> {
        let plan = self.plan(target);
        if let Some(delay) = plan.delay() {
            std::thread::sleep(delay);
        }
        if plan.should_fail() {
            self.faults_fired.fetch_add(1, Ordering::Relaxed);
            return Err(AdapterError::Injected);
        }
        Ok(())
    }
}

impl<B: BackendAdapter> BackendAdapter for FaultInjectingBackend<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn insert(&self, record: &SensorRecord) -> Result<(), AdapterError> {
        self.before_call(FaultTarget::Insert)?;
        self.inner.insert(record)
    }

    fn query_latest(&self, sensor_id: &str) -> Result<Reading, AdapterError> {
        self.before_call(FaultTarget::Query)?;
        self.inner.query_latest(sensor_id)
    }

    fn query_range(&self, sensor_id: &str, window: TimeWindow) -> Result<Vec<Reading>, AdapterError> {
        self.before_call(FaultTarget::Query)?;
        self.inner.query_range(sensor_id, window)
    }

    fn query_downsample(
        &self,
        sensor_id: &str,
        window: TimeWindow,
        bucket: Duration,
    ) -> Result<Vec<BucketMean>, AdapterError> {
        self.before_call(FaultTarget::Query)?;
        self.inner.query_downsample(sensor_id, window, bucket)
    }

    fn query_top_k(&self, window: TimeWindow, k: usize) -> Result<TopK, AdapterError> {
        self.before_call(FaultTarget::Query)?;
        self.inner.query_top_k(window, k)
    }

    fn storage_size_bytes(&self) -> u64 {
        self.inner.storage_size_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn record(sensor: &str, secs: i64, value: f64) -> SensorRecord {
        SensorRecord {
            sensor_id: Arc::from(sensor),
            timestamp: ts(secs),
            value,
        }
    }

    fn window(start: i64, end: i64) -> TimeWindow {
        TimeWindow {
            start: ts(start),
            end: ts(end),
        }
    }

    #[test]
    fn test_insert_and_latest() {
        let backend = MemoryBackend::new();
        assert!(matches!(
            backend.query_latest("a"),
            Err(AdapterError::NotFound { .. })
        ));

        backend.insert(&record("a", 2, 20.0)).unwrap();
        backend.insert(&record("a", 1, 10.0)).unwrap();
        let latest = backend.query_latest("a").unwrap();
        assert_eq!(latest.timestamp, ts(2));
        assert_eq!(latest.value, 20.0);
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn test_duplicate_identity_is_not_double_counted() {
        let backend = MemoryBackend::new();
        backend.insert(&record("a", 1, 10.0)).unwrap();
        let size = backend.storage_size_bytes();
        backend.insert(&record("a", 1, 11.0)).unwrap();
        assert_eq!(backend.storage_size_bytes(), size);
        assert_eq!(backend.sensor_len("a"), 1);

        backend.clear();
        assert!(backend.is_empty());
        assert_eq!(backend.storage_size_bytes(), 0);
    }

    #[test]
    fn test_range_is_half_open() {
        let backend = MemoryBackend::new();
        for s in 0..10 {
            backend.insert(&record("a", s, s as f64)).unwrap();
        }
        let readings = backend.query_range("a", window(2, 5)).unwrap();
        let values: Vec<f64> = readings.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert!(backend.query_range("missing", window(0, 10)).unwrap().is_empty());
    }

    #[test]
    fn test_downsample_buckets() {
        let backend = MemoryBackend::new();
        for s in 0..120 {
            backend.insert(&record("a", s, if s < 60 { 1.0 } else { 3.0 })).unwrap();
        }
        let buckets = backend
            .query_downsample("a", window(0, 120), Duration::from_secs(60))
            .unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].bucket_start, ts(0));
        assert_eq!(buckets[0].mean, 1.0);
        assert_eq!(buckets[0].count, 60);
        assert_eq!(buckets[1].bucket_start, ts(60));
        assert_eq!(buckets[1].mean, 3.0);
    }

    #[test]
    fn test_top_k_orders_by_mean() {
        let backend = MemoryBackend::new();
        for (i, sensor) in ["a", "b", "c", "d"].iter().enumerate() {
            for s in 0..5 {
                backend.insert(&record(sensor, s, i as f64 * 10.0)).unwrap();
            }
        }
        // Outside the window, must not count
        backend.insert(&record("a", 100, 1000.0)).unwrap();

        let top = backend.query_top_k(window(0, 10), 2).unwrap();
        let ids: Vec<&str> = top.iter().map(|m| &*m.sensor_id).collect();
        assert_eq!(ids, vec!["d", "c"]);
        assert_eq!(top[0].mean, 30.0);
        assert!(backend.query_top_k(window(0, 10), 0).unwrap().is_empty());
    }

    #[test]
    fn test_fault_injection_ratio_is_exact() {
        let backend = FaultInjectingBackend::new(MemoryBackend::new());
        backend.set_error_ratio(FaultTarget::Insert, 0.5);

        let failures = (0..100)
            .filter(|s| backend.insert(&record("a", *s, 0.0)).is_err())
            .count();
        assert_eq!(failures, 50);
        assert_eq!(backend.faults_fired(), 50);
        assert_eq!(backend.inner().len(), 50);

        // Queries are untouched
        assert!(backend.query_latest("a").is_ok());

        backend.clear_faults();
        assert!(backend.insert(&record("a", 1000, 0.0)).is_ok());
    }
}
