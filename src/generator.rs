//! Deterministic synthetic sensor streams
//!
//! Every sensor owns an independent random walk seeded from
//! `(run seed, sensor_id)`. Record `t` of a sensor depends only on the seed,
//! the sensor id and `t`, so streams can be produced concurrently in any
//! interleaving and replayed exactly.
//!
//! Timestamps are a separate matter: tick 0 sits at the generator's epoch,
//! shifted by the sensor's stagger, and the stagger of sensor `i` is `i / n`
//! of the interval for a set of `n` sensors. A run anchored at wall-clock
//! time therefore replays the same values under new timestamps, and changing
//! the sensor count moves every sensor's offset. Pin
//! `RunConfig::logical_start` to replay timestamps as well.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{SampleRate, ValueModel};
use crate::record::{SensorRecord, SensorSet};

/// Derive the seed of one sensor's random stream
///
/// FNV-1a over the sensor id, folded with the run seed through splitmix64.
/// Both steps are fixed arithmetic so the result is stable across platforms.
pub fn sensor_seed(run_seed: u64, sensor_id: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in sensor_id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    splitmix64(run_seed ^ hash)
}

/// One round of splitmix64
pub fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Maps the monotonic clock onto logical record timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalClock {
    anchor: Instant,
    anchor_utc: DateTime<Utc>,
}

impl LogicalClock {
    /// A clock where `anchor` corresponds to `anchor_utc`
    pub fn new(anchor: Instant, anchor_utc: DateTime<Utc>) -> Self {
        Self { anchor, anchor_utc }
    }

    /// A clock anchored at the current instant and wall time
    pub fn starting_now() -> Self {
        Self::new(Instant::now(), Utc::now())
    }

    /// Logical time corresponding to `anchor`
    pub fn anchor_utc(&self) -> DateTime<Utc> {
        self.anchor_utc
    }

    /// Logical time now
    pub fn now(&self) -> DateTime<Utc> {
        self.at(Instant::now())
    }

    /// Logical time of `instant`
    pub fn at(&self, instant: Instant) -> DateTime<Utc> {
        let offset = instant.saturating_duration_since(self.anchor);
        self.anchor_utc + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
    }

    /// Monotonic instant at which logical time reaches `ts`
    ///
    /// Timestamps before the anchor map to the anchor itself.
    pub fn instant_of(&self, ts: DateTime<Utc>) -> Instant {
        match (ts - self.anchor_utc).to_std() {
            Ok(offset) => self.anchor + offset,
            Err(_) => self.anchor,
        }
    }
}

/// Cursor over one sensor's record sequence
pub struct SensorStream {
    sensor_id: Arc<str>,
    origin: DateTime<Utc>,
    interval_nanos: i64,
    tick: u64,
    value: f64,
    step: Uniform<f64>,
    model: ValueModel,
    rng: StdRng,
}

impl SensorStream {
    fn new(
        sensor_id: Arc<str>,
        origin: DateTime<Utc>,
        interval: Duration,
        model: ValueModel,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        // Start away from the bounds so early readings are not all reflections
        let span = model.max - model.min;
        let value = Uniform::new(model.min + span * 0.2, model.max - span * 0.2).sample(&mut rng);

        Self {
            sensor_id,
            origin,
            interval_nanos: interval.as_nanos().min(i64::MAX as u128) as i64,
            tick: 0,
            value,
            step: Uniform::new_inclusive(-model.max_step, model.max_step),
            model,
            rng,
        }
    }

    /// Sensor this stream belongs to
    pub fn sensor_id(&self) -> &Arc<str> {
        &self.sensor_id
    }

    /// Logical tick of the next record
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Timestamp of the next record
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        self.timestamp_of(self.tick)
    }

    /// Timestamp of record `tick`
    pub fn timestamp_of(&self, tick: u64) -> DateTime<Utc> {
        let offset = self.interval_nanos.saturating_mul(tick.min(i64::MAX as u64) as i64);
        self.origin + chrono::Duration::nanoseconds(offset)
    }

    /// Produce the next record and advance the logical clock
    pub fn next_record(&mut self) -> SensorRecord {
        let record = SensorRecord {
            sensor_id: self.sensor_id.clone(),
            timestamp: self.next_timestamp(),
            value: self.value,
        };

        let mut next = self.value + self.step.sample(&mut self.rng);
        // Reflect at the bounds
        if next > self.model.max {
            next = self.model.max - (next - self.model.max);
        } else if next < self.model.min {
            next = self.model.min + (self.model.min - next);
        }
        self.value = next.clamp(self.model.min, self.model.max);
        self.tick += 1;

        record
    }
}

impl Iterator for SensorStream {
    type Item = SensorRecord;

    fn next(&mut self) -> Option<SensorRecord> {
        Some(self.next_record())
    }
}

/// Produces the record streams of every sensor in a run
pub struct SensorStreamGenerator {
    seed: u64,
    epoch: DateTime<Utc>,
    interval: Duration,
    model: ValueModel,
    sensors: SensorSet,
    cursors: Vec<OnceLock<Mutex<SensorStream>>>,
}

impl SensorStreamGenerator {
    /// Create a generator whose tick 0 lies at `epoch`
    ///
    /// Sensor `i` of `n` is shifted by `i / n` of the sample interval so
    /// that the load of one interval is spread evenly.
    pub fn new(
        seed: u64,
        rate: SampleRate,
        epoch: DateTime<Utc>,
        model: ValueModel,
        sensors: SensorSet,
    ) -> Self {
        let cursors = (0..sensors.len()).map(|_| OnceLock::new()).collect();
        Self {
            seed,
            epoch,
            interval: rate.interval(),
            model,
            sensors,
            cursors,
        }
    }

    /// Timestamp of tick 0 before staggering
    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    /// Sample interval of every sensor
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The sensor set
    pub fn sensors(&self) -> &SensorSet {
        &self.sensors
    }

    /// Timestamp of tick 0 of sensor `index`
    fn origin_of(&self, index: usize) -> DateTime<Utc> {
        let stagger = self.interval.mul_f64(index as f64 / self.sensors.len().max(1) as f64);
        self.epoch + chrono::Duration::from_std(stagger).unwrap_or(chrono::Duration::zero())
    }

    /// Number of sensors with at least one record timestamped before `ts`
    pub fn sensors_before(&self, ts: DateTime<Utc>) -> usize {
        (0..self.sensors.len()).filter(|&i| self.origin_of(i) < ts).count()
    }

    /// A fresh stream for sensor `index`, positioned at tick 0
    pub fn stream_at(&self, index: usize) -> Option<SensorStream> {
        let sensor_id = self.sensors.get(index)?.clone();
        let seed = sensor_seed(self.seed, &sensor_id);
        Some(SensorStream::new(sensor_id, self.origin_of(index), self.interval, self.model, seed))
    }

    /// A fresh stream for `sensor_id`, positioned at tick 0
    pub fn stream(&self, sensor_id: &str) -> Option<SensorStream> {
        self.stream_at(self.sensors.index_of(sensor_id)?)
    }

    /// Next record of `sensor_id` from the generator's own cursor
    ///
    /// Cursors are independent per sensor; calls for different sensors never
    /// contend. Returns `None` for sensors outside the set.
    pub fn next(&self, sensor_id: &str) -> Option<SensorRecord> {
        let index = self.sensors.index_of(sensor_id)?;
        let cursor = match self.cursors[index].get() {
            Some(cursor) => cursor,
            None => {
                let stream = self.stream_at(index)?;
                self.cursors[index].get_or_init(|| Mutex::new(stream))
            }
        };
        Some(cursor.lock().next_record())
    }

    /// Record `tick` of `sensor_id`, replayed from tick 0
    pub fn record_at(&self, sensor_id: &str, tick: u64) -> Option<SensorRecord> {
        let mut stream = self.stream(sensor_id)?;
        for _ in 0..tick {
            stream.next_record();
        }
        Some(stream.next_record())
    }
}
