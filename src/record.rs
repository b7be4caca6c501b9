//! Data records exchanged between the generator, the workers and backends

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};

/// One reading emitted by a sensor
///
/// Identity is `(sensor_id, timestamp)`; timestamps are strictly increasing
/// per sensor.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorRecord {
    /// Owning sensor
    pub sensor_id: Arc<str>,
    /// Logical timestamp
    pub timestamp: DateTime<Utc>,
    /// Scalar value
    pub value: f64,
}

/// A reading returned by a backend query
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading {
    /// Timestamp of the reading
    pub timestamp: DateTime<Utc>,
    /// Scalar value
    pub value: f64,
}

/// Mean value of one downsampling bucket
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketMean {
    /// Inclusive bucket start
    pub bucket_start: DateTime<Utc>,
    /// Mean of the readings in the bucket
    pub mean: f64,
    /// Readings that fell into the bucket
    pub count: u64,
}

/// Mean value of one sensor over a window, as returned by top-K
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorMean {
    /// Sensor identifier
    pub sensor_id: Arc<str>,
    /// Mean over the window
    pub mean: f64,
}

/// Half-open time window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeWindow {
    /// Inclusive start
    pub start: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Window of length `span` ending at `end`
    pub fn trailing(end: DateTime<Utc>, span: Duration) -> Self {
        let span = chrono::Duration::from_std(span).unwrap_or(chrono::Duration::zero());
        Self {
            start: end - span,
            end,
        }
    }

    /// Whether `ts` falls inside the window
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// The fixed set of sensors exercised by a run
#[derive(Debug, Clone)]
pub struct SensorSet {
    ids: Arc<[Arc<str>]>,
    index: Arc<AHashMap<Arc<str>, usize>>,
}

impl SensorSet {
    /// Create `count` sensors named `sensor-00000`, `sensor-00001`, ...
    pub fn new(count: usize) -> Self {
        Self::from_ids((0..count).map(|i| format!("sensor-{:05}", i)))
    }

    /// Create a set from explicit identifiers; duplicates are dropped
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        let mut ordered: Vec<Arc<str>> = Vec::new();
        let mut index = AHashMap::new();
        for id in ids {
            let id: Arc<str> = id.into();
            if !index.contains_key(&id) {
                index.insert(id.clone(), ordered.len());
                ordered.push(id);
            }
        }
        Self {
            ids: ordered.into(),
            index: Arc::new(index),
        }
    }

    /// Number of sensors
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Sensor at position `i`
    pub fn get(&self, i: usize) -> Option<&Arc<str>> {
        self.ids.get(i)
    }

    /// Position of a sensor in the set
    pub fn index_of(&self, sensor_id: &str) -> Option<usize> {
        self.index.get(sensor_id).copied()
    }

    /// All sensor identifiers in order
    pub fn ids(&self) -> &[Arc<str>] {
        &self.ids
    }

    /// Split sensor positions into `parts` disjoint, round-robin partitions
    ///
    /// Every sensor lands in exactly one partition. Empty partitions are
    /// dropped, so fewer than `parts` groups come back when there are fewer
    /// sensors than parts.
    pub fn partition(&self, parts: usize) -> Vec<Vec<usize>> {
        let parts = parts.max(1);
        let mut groups = vec![Vec::new(); parts];
        for i in 0..self.ids.len() {
            groups[i % parts].push(i);
        }
        groups.retain(|g| !g.is_empty());
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sensor_set_naming_and_index() {
        let set = SensorSet::new(3);
        assert_eq!(set.len(), 3);
        assert_eq!(&**set.get(2).unwrap(), "sensor-00002");
        assert_eq!(set.index_of("sensor-00001"), Some(1));
        assert_eq!(set.index_of("sensor-99999"), None);
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let set = SensorSet::new(10);
        let parts = set.partition(3);
        assert_eq!(parts.len(), 3);

        let mut all: Vec<usize> = parts.iter().flatten().copied().collect();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());

        // More parts than sensors
        assert_eq!(SensorSet::new(2).partition(8).len(), 2);
    }

    #[test]
    fn test_duplicate_ids_dropped() {
        let set = SensorSet::from_ids(["a", "b", "a"]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_trailing_window() {
        let end = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let window = TimeWindow::trailing(end, Duration::from_secs(300));
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 1, 1, 11, 55, 0).unwrap());
        assert!(window.contains(window.start));
        assert!(!window.contains(end));
    }
}
