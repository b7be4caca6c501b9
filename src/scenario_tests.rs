use crate::aggregate::{RepetitionResult, Statistic};
use crate::backend::{BackendAdapter, FaultInjectingBackend, FaultTarget, MemoryBackend, TopK};
use crate::config::{QueryMix, RunConfig, SampleRate};
use crate::error::{AdapterError, ErrorKind, RunError};
use crate::metrics::OperationKind;
use crate::phase::Phase;
use crate::record::{BucketMean, Reading, SensorRecord, TimeWindow};
use crate::runner::{ReportSink, Runner};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(test)]
mod scenario_tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    /// Counts query calls that reach the wrapped backend
    struct QueryCounter<B> {
        inner: B,
        queries: AtomicU64,
    }

    impl<B: BackendAdapter> QueryCounter<B> {
        fn new(inner: B) -> Self {
            Self {
                inner,
                queries: AtomicU64::new(0),
            }
        }

        fn queries(&self) -> u64 {
            self.queries.load(Ordering::Relaxed)
        }
    }

    impl<B: BackendAdapter> BackendAdapter for QueryCounter<B> {
        fn name(&self) -> &str {
            "query-counter"
        }

        fn insert(&self, record: &SensorRecord) -> Result<(), AdapterError> {
            self.inner.insert(record)
        }

        fn query_latest(&self, sensor_id: &str) -> Result<Reading, AdapterError> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            self.inner.query_latest(sensor_id)
        }

        fn query_range(&self, sensor_id: &str, window: TimeWindow) -> Result<Vec<Reading>, AdapterError> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            self.inner.query_range(sensor_id, window)
        }

        fn query_downsample(
            &self,
            sensor_id: &str,
            window: TimeWindow,
            bucket: Duration,
        ) -> Result<Vec<BucketMean>, AdapterError> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            self.inner.query_downsample(sensor_id, window, bucket)
        }

        fn query_top_k(&self, window: TimeWindow, k: usize) -> Result<TopK, AdapterError> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            self.inner.query_top_k(window, k)
        }

        fn storage_size_bytes(&self) -> u64 {
            self.inner.storage_size_bytes()
        }
    }

    #[derive(Clone, Default)]
    struct CollectingSink {
        results: Arc<Mutex<Vec<RepetitionResult>>>,
        aggregated: Arc<Mutex<bool>>,
    }

    impl ReportSink for CollectingSink {
        fn on_repetition(&mut self, result: &RepetitionResult) {
            self.results.lock().push(result.clone());
        }

        fn on_aggregate(&mut self, _report: &crate::aggregate::AggregatedReport) {
            *self.aggregated.lock() = true;
        }
    }

    #[test]
    fn scenario_steady_ingest_matches_sensor_rate() {
        let config = RunConfig::default()
            .with_sensors(100)
            .with_sample_rate(SampleRate::Hz1)
            .with_phases(ms(500), ms(500), Duration::from_secs(3), ms(200))
            .with_history(Duration::from_secs(60), ms(50))
            .with_repetitions(1)
            .with_queries(2, 20.0, QueryMix::default());
        let backend = Arc::new(MemoryBackend::new());
        let mut runner = Runner::new(config, backend.clone()).unwrap();

        let start = Instant::now();
        let report = runner.run().unwrap();
        let elapsed = start.elapsed();

        let throughput = report
            .stat(OperationKind::Insert, Statistic::Throughput)
            .unwrap()
            .mean;
        println!(
            "Steady ingest: {:.1} inserts/sec over a 3s Measure ({:?} total run)",
            throughput, elapsed
        );
        assert!(
            (80.0..=120.0).contains(&throughput),
            "Insert throughput off target: {:.1} ops/sec",
            throughput
        );
        assert_eq!(report.stat(OperationKind::Insert, Statistic::Errors).unwrap().mean, 0.0);
        assert!(report.stat(OperationKind::Insert, Statistic::P95).is_some());
    }

    #[test]
    fn scenario_preload_failure_stops_before_warm_up() {
        let faulty = FaultInjectingBackend::new(MemoryBackend::new());
        faulty.set_error_ratio(FaultTarget::Insert, 0.5);
        let backend = Arc::new(QueryCounter::new(faulty));

        let config = RunConfig::default()
            .with_sensors(10)
            .with_phases(ms(200), ms(200), ms(200), ms(50))
            .with_history(Duration::from_secs(60), Duration::ZERO)
            .with_repetitions(2)
            .with_preload_gate(0.3, 100)
            .with_queries(2, 0.0, QueryMix::default());
        let sink = CollectingSink::default();
        let mut runner = Runner::new(config, backend.clone())
            .unwrap()
            .with_report_sink(sink.clone());

        match runner.run() {
            Err(RunError::PreloadFailure {
                failed,
                total,
                error_rate,
                threshold,
            }) => {
                println!("Preload rejected: {}/{} failed", failed, total);
                assert!(total >= 100);
                assert!((error_rate - 0.5).abs() < 0.01);
                assert_eq!(threshold, 0.3);
            }
            other => panic!("expected PreloadFailure, got {:?}", other.map(|r| r.repetitions)),
        }

        // Query workers only start in WarmUp
        assert_eq!(backend.queries(), 0);
        assert!(sink.results.lock().is_empty());
        assert!(!*sink.aggregated.lock());
    }

    #[test]
    fn scenario_unfinished_history_fails_preload() {
        let slow = FaultInjectingBackend::new(MemoryBackend::new());
        slow.set_delay(FaultTarget::Insert, Duration::from_micros(200));
        let backend = Arc::new(QueryCounter::new(slow));

        // 60000 history records at 200us each cannot load in 300ms
        let config = RunConfig::default()
            .with_sensors(100)
            .with_sample_rate(SampleRate::Hz1)
            .with_phases(ms(300), ms(200), Duration::from_secs(2), ms(50))
            .with_history(Duration::from_secs(600), ms(10))
            .with_repetitions(1)
            .with_queries(2, 0.0, QueryMix::default());
        let sink = CollectingSink::default();
        let mut runner = Runner::new(config, backend.clone())
            .unwrap()
            .with_report_sink(sink.clone());

        let start = Instant::now();
        match runner.run() {
            Err(RunError::PreloadIncomplete {
                pending,
                sensors,
                preload,
            }) => {
                println!("Preload incomplete: {}/{} sensors behind after {:?}", pending, sensors, preload);
                assert!(pending > 0);
                assert_eq!(sensors, 100);
                assert_eq!(preload, ms(300));
            }
            other => panic!("expected PreloadIncomplete, got {:?}", other.map(|r| r.repetitions)),
        }

        // Nothing was measured from the truncated dataset
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(backend.queries(), 0);
        assert!(sink.results.lock().is_empty());
        assert!(!*sink.aggregated.lock());
    }

    #[test]
    fn scenario_cancel_mid_measure_discards_repetition() {
        let config = RunConfig::default()
            .with_sensors(20)
            .with_phases(ms(200), ms(100), Duration::from_secs(3), ms(100))
            .with_history(Duration::from_secs(30), ms(10))
            .with_repetitions(3)
            .with_queries(2, 50.0, QueryMix::default());
        let backend = Arc::new(MemoryBackend::new());
        let sink = CollectingSink::default();
        let mut runner = Runner::new(config, backend)
            .unwrap()
            .with_report_sink(sink.clone());

        let cancel = runner.cancel_handle();
        let canceller = thread::spawn(move || {
            thread::sleep(ms(1_000));
            cancel.cancel();
        });

        let start = Instant::now();
        let result = runner.run();
        canceller.join().unwrap();
        let elapsed = start.elapsed();

        assert!(
            matches!(
                result,
                Err(RunError::Aborted {
                    repetition: 0,
                    phase: Phase::Measure
                })
            ),
            "unexpected result {:?}",
            result.map(|r| r.repetitions)
        );
        // Workers drained promptly instead of running out the phase clock
        assert!(elapsed < Duration::from_secs(2), "abort took {:?}", elapsed);
        assert!(sink.results.lock().is_empty());
        assert!(!*sink.aggregated.lock());
    }

    #[test]
    fn scenario_hung_backend_calls_time_out() {
        let faulty = FaultInjectingBackend::new(MemoryBackend::new());
        faulty.set_delay(FaultTarget::Query, ms(300));
        let backend = Arc::new(faulty);

        let config = RunConfig::default()
            .with_sensors(10)
            .with_phases(ms(100), ms(50), ms(400), ms(50))
            .with_history(Duration::from_secs(30), ms(10))
            .with_repetitions(1)
            .with_op_timeout(Some(ms(20)))
            .with_queries(2, 0.0, QueryMix::default());
        let mut runner = Runner::new(config, backend).unwrap();

        let start = Instant::now();
        let result = runner.run_repetition(0).unwrap();
        let elapsed = start.elapsed();

        let timeouts: u64 = OperationKind::QUERIES
            .iter()
            .map(|k| {
                result
                    .snapshot
                    .kind(*k)
                    .errors_by_kind
                    .get(&ErrorKind::Timeout)
                    .copied()
                    .unwrap_or(0)
            })
            .sum();
        println!("Hung backend: {} query timeouts, run took {:?}", timeouts, elapsed);
        assert!(timeouts > 0);
        assert_eq!(result.snapshot.query_ok(), 0);
        // Inserts were unaffected
        assert!(result.snapshot.kind(OperationKind::Insert).counts.ok > 0);
        assert!(elapsed < Duration::from_secs(2), "run hung for {:?}", elapsed);
    }

    #[test]
    fn scenario_history_stays_out_of_measure_statistics() {
        let config = RunConfig::default()
            .with_sensors(20)
            .with_phases(ms(1_500), ms(200), ms(300), ms(50))
            .with_history(Duration::from_secs(600), ms(10))
            .with_repetitions(1)
            .with_queries(1, 0.0, QueryMix::default());
        let backend = Arc::new(MemoryBackend::new());
        let mut runner = Runner::new(config, backend.clone()).unwrap();

        let result = runner.run_repetition(0).unwrap();
        let inserts = result.snapshot.kind(OperationKind::Insert);

        // 12000 history records were loaded, Measure saw only live ones
        assert!(backend.len() >= 12_000);
        assert!(inserts.counts.total() < 100, "{} Measure inserts", inserts.counts.total());
        assert_eq!(result.snapshot.phase, Phase::Measure);
        assert!(result.storage.delta() >= 12_000 * 48);
        assert!(result.warmup.is_healthy(true));
    }

    #[test]
    fn scenario_repetitions_merge_into_one_report() {
        let config = RunConfig::default()
            .with_sensors(30)
            .with_phases(ms(150), ms(100), ms(300), ms(50))
            .with_history(Duration::from_secs(30), ms(10))
            .with_repetitions(3)
            .with_queries(2, 40.0, QueryMix::default());
        let backend = Arc::new(MemoryBackend::new());
        let sink = CollectingSink::default();
        let mut runner = Runner::new(config, backend)
            .unwrap()
            .with_report_sink(sink.clone());

        let report = runner.run().unwrap();
        assert_eq!(report.repetitions, 3);
        assert_eq!(sink.results.lock().len(), 3);
        assert!(*sink.aggregated.lock());

        let throughput = report.stat(OperationKind::Insert, Statistic::Throughput).unwrap();
        assert_eq!(throughput.n, 3);
        assert!(throughput.mean > 0.0);
        // Raw storage figures are kept per repetition
        assert_eq!(report.storage.raw.len(), 3);
        assert!(report.storage.raw.iter().all(|s| s.after > s.before));
        println!(
            "Three repetitions: insert throughput {:.1} ± {:.1} ops/sec",
            throughput.mean, throughput.stdev
        );
    }
}
