//! Resource sample sink
//!
//! Host CPU / memory samples arrive from an external sampler. The sink only
//! stores them, tagged with the phase in effect when they arrive; statistics
//! are computed over Measure samples only.

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::phase::{Phase, PhaseHandle};

/// One host resource reading
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceSample {
    /// When the sampler took the reading
    pub timestamp: DateTime<Utc>,
    /// CPU utilisation in percent
    pub cpu_percent: f64,
    /// Resident memory in MiB
    pub mem_mib: f64,
}

/// A stored sample and the phase it arrived in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaggedResourceSample {
    /// Phase at acceptance
    pub phase: Phase,
    /// The sample
    pub sample: ResourceSample,
}

/// Mean, population standard deviation and peak of one series
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct SeriesStats {
    /// Arithmetic mean
    pub mean: f64,
    /// Population standard deviation
    pub stdev: f64,
    /// Largest value
    pub peak: f64,
}

impl SeriesStats {
    /// Statistics of `values`; `None` when empty
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self {
            mean,
            stdev: variance.sqrt(),
            peak,
        })
    }
}

/// CPU and memory statistics over the Measure phase
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceStats {
    /// Samples the statistics cover
    pub samples: usize,
    /// CPU percent
    pub cpu: SeriesStats,
    /// Memory MiB
    pub mem_mib: SeriesStats,
}

/// Phase-tagged store for externally produced resource samples
pub struct ResourceSink {
    phase: Box<dyn Fn() -> Phase + Send + Sync>,
    samples: Mutex<Vec<TaggedResourceSample>>,
}

impl ResourceSink {
    /// Create a sink that tags samples with `phases`' current phase
    pub fn new(phases: PhaseHandle) -> Self {
        Self::with_phase_source(move || phases.current_phase())
    }

    /// Create a sink that asks `phase` for the tag of every sample
    pub fn with_phase_source<F>(phase: F) -> Self
    where
        F: Fn() -> Phase + Send + Sync + 'static,
    {
        Self {
            phase: Box::new(phase),
            samples: Mutex::new(Vec::new()),
        }
    }

    /// Store one sample
    pub fn accept(&self, sample: ResourceSample) {
        let phase = (self.phase)();
        self.samples.lock().push(TaggedResourceSample { phase, sample });
    }

    /// Accept every sample from `feed` until it disconnects or the run stops
    ///
    /// Returns the number of samples accepted.
    pub fn drain(&self, feed: &Receiver<ResourceSample>, phases: &PhaseHandle) -> usize {
        let mut accepted = 0;
        let poll = std::time::Duration::from_millis(100);
        while !phases.should_stop() {
            match feed.recv_timeout(poll) {
                Ok(sample) => {
                    self.accept(sample);
                    accepted += 1;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        accepted
    }

    /// Samples accepted while `phase` was in effect
    pub fn samples_in_phase(&self, phase: Phase) -> Vec<ResourceSample> {
        self.samples
            .lock()
            .iter()
            .filter(|tagged| tagged.phase == phase)
            .map(|tagged| tagged.sample)
            .collect()
    }

    /// Every sample with its phase tag
    pub fn all_samples(&self) -> Vec<TaggedResourceSample> {
        self.samples.lock().clone()
    }

    /// Statistics over Measure samples; `None` if there were none
    pub fn measure_stats(&self) -> Option<ResourceStats> {
        let samples = self.samples_in_phase(Phase::Measure);
        let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_percent).collect();
        let mem: Vec<f64> = samples.iter().map(|s| s.mem_mib).collect();
        Some(ResourceStats {
            samples: samples.len(),
            cpu: SeriesStats::from_values(&cpu)?,
            mem_mib: SeriesStats::from_values(&mem)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fixed_sink() -> (ResourceSink, Arc<Mutex<Phase>>) {
        let phase = Arc::new(Mutex::new(Phase::Preload));
        let source = phase.clone();
        let sink = ResourceSink::with_phase_source(move || *source.lock());
        (sink, phase)
    }

    fn sample(cpu: f64, mem: f64) -> ResourceSample {
        ResourceSample {
            timestamp: Utc::now(),
            cpu_percent: cpu,
            mem_mib: mem,
        }
    }

    #[test]
    fn test_series_stats_population_formula() {
        let stats = SeriesStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.stdev, 2.0);
        assert_eq!(stats.peak, 9.0);
        assert!(SeriesStats::from_values(&[]).is_none());
    }

    #[test]
    fn test_only_measure_samples_count() {
        let (sink, phase) = fixed_sink();
        sink.accept(sample(99.0, 4096.0));

        *phase.lock() = Phase::Measure;
        sink.accept(sample(10.0, 100.0));
        sink.accept(sample(30.0, 300.0));

        *phase.lock() = Phase::CoolDown;
        sink.accept(sample(99.0, 4096.0));

        let stats = sink.measure_stats().unwrap();
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.cpu.mean, 20.0);
        assert_eq!(stats.cpu.peak, 30.0);
        assert_eq!(stats.mem_mib.mean, 200.0);

        // Non-measure samples are retained
        assert_eq!(sink.all_samples().len(), 4);
        assert_eq!(sink.samples_in_phase(Phase::Preload).len(), 1);
    }

    #[test]
    fn test_no_measure_samples() {
        let (sink, _) = fixed_sink();
        sink.accept(sample(1.0, 1.0));
        assert!(sink.measure_stats().is_none());
    }
}
