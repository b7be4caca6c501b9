//! dtbench command line driver
//!
//! Runs the full phase protocol against the in-memory reference backend and
//! prints the aggregated report.
//!
//! Usage:
//!   dtbench --sensors 1000 --rate 2 --measure 60 --repetitions 3
//!   dtbench --set mix.top_k=0 --set window.range=120 --fault-insert-ratio 0.05
//!   dtbench --set logical_start=2024-01-01T00:00:00Z
//!
//! Ctrl-C or SIGTERM aborts the run cooperatively; a second Ctrl-C exits
//! immediately.

use std::future::Future;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::{error, warn};

use dtbench::{
    AggregatedReport, BackendAdapter, ConfigError, FaultInjectingBackend, FaultTarget, MemoryBackend,
    OperationKind, RunConfig, RunError, RunSignal, Runner, Statistic,
};

/// Time-series workload benchmark.
#[derive(Parser, Debug)]
#[command(name = "dtbench", about = "Phase-controlled time-series workload benchmark")]
struct Args {
    /// Number of simulated sensors.
    #[arg(long)]
    sensors: Option<usize>,

    /// Sample rate per sensor in Hz: 1 | 2
    #[arg(long)]
    rate: Option<u32>,

    /// Simulated history loaded during Preload, in seconds.
    #[arg(long)]
    history: Option<f64>,

    /// Preload length in seconds.
    #[arg(long)]
    preload: Option<f64>,

    /// WarmUp length in seconds.
    #[arg(long)]
    warm_up: Option<f64>,

    /// Measure length in seconds.
    #[arg(long)]
    measure: Option<f64>,

    /// CoolDown length in seconds.
    #[arg(long)]
    cool_down: Option<f64>,

    /// Idle time after Preload before reading the storage size, in seconds.
    #[arg(long)]
    settle: Option<f64>,

    /// Number of repetitions.
    #[arg(long)]
    repetitions: Option<usize>,

    /// Random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Number of query workers.
    #[arg(long)]
    query_workers: Option<usize>,

    /// Target queries per second across all query workers; 0 = closed loop.
    #[arg(long)]
    query_rate: Option<f64>,

    /// Extra option as key=value; may be repeated.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Fraction of inserts that fail (fault injection).
    #[arg(long, default_value_t = 0.0)]
    fault_insert_ratio: f64,

    /// Added latency per query call in milliseconds (fault injection).
    #[arg(long, default_value_t = 0)]
    fault_query_delay_ms: u64,
}

impl Args {
    fn into_config(self) -> Result<RunConfig, ConfigError> {
        let mut config = RunConfig::default();
        let flags: [(&str, Option<String>); 12] = [
            ("sensors", self.sensors.map(|v| v.to_string())),
            ("sample_rate", self.rate.map(|v| v.to_string())),
            ("history_span", self.history.map(|v| v.to_string())),
            ("preload", self.preload.map(|v| v.to_string())),
            ("warm_up", self.warm_up.map(|v| v.to_string())),
            ("measure", self.measure.map(|v| v.to_string())),
            ("cool_down", self.cool_down.map(|v| v.to_string())),
            ("settle", self.settle.map(|v| v.to_string())),
            ("repetitions", self.repetitions.map(|v| v.to_string())),
            ("seed", self.seed.map(|v| v.to_string())),
            ("query_workers", self.query_workers.map(|v| v.to_string())),
            ("query_rate", self.query_rate.map(|v| v.to_string())),
        ];
        for (key, value) in flags {
            if let Some(value) = value {
                config.set_option(key, &value)?;
            }
        }
        for pair in &self.overrides {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| ConfigError::Unrecognized(pair.clone()))?;
            config.set_option(key, value)?;
        }
        Ok(config)
    }
}

fn ms(d: Option<&dtbench::MeanStdev>) -> String {
    match d {
        Some(s) => format!("{:>8.3} ±{:>7.3}", s.mean, s.stdev),
        None => format!("{:>17}", "-"),
    }
}

fn print_report(report: &AggregatedReport) {
    println!();
    println!("=== dtbench report ({} repetitions) ===", report.repetitions);
    println!(
        "{:<14} {:>10} {:>8} {:>17} {:>17} {:>17} {:>17}",
        "kind", "ok", "errors", "ops/s", "p50 ms", "p95 ms", "p99 ms"
    );
    for kind in OperationKind::ALL {
        let agg = report.kind(kind);
        let count = |stat| agg.get(stat).map_or(0.0, |s| s.mean);
        println!(
            "{:<14} {:>10.0} {:>8.0} {} {} {} {}",
            kind.as_str(),
            count(Statistic::Ok),
            count(Statistic::Errors),
            ms(agg.get(Statistic::Throughput)),
            ms(agg.get(Statistic::P50)),
            ms(agg.get(Statistic::P95)),
            ms(agg.get(Statistic::P99)),
        );
    }

    println!();
    for (i, storage) in report.storage.raw.iter().enumerate() {
        println!(
            "repetition {}: storage {} -> {} bytes (+{})",
            i,
            storage.before,
            storage.after,
            storage.delta()
        );
    }
    if let Some(delta) = &report.storage.delta_bytes {
        println!("storage growth: {:.0} ± {:.0} bytes", delta.mean, delta.stdev);
    }
    if let Some(resources) = &report.resources {
        println!(
            "cpu: {:.1}% mean, {:.1}% peak; memory: {:.1} MiB mean, {:.1} MiB peak",
            resources.cpu_mean.mean, resources.cpu_peak.mean, resources.mem_mean.mean, resources.mem_peak.mean
        );
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM, returning a description of which signal fired.
async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT (Ctrl+C) received",
                _ = sigterm.recv() => "SIGTERM received",
            },
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT (Ctrl+C) received"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT (Ctrl+C) received"
    }
}

/// Cancel `signal` once `shutdown` resolves, exit on a further Ctrl-C
fn watch_shutdown<F>(signal: RunSignal, shutdown: F)
where
    F: Future<Output = &'static str> + Send + 'static,
{
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!(error = %e, "signal handling unavailable");
            return;
        }
    };
    let spawned = thread::Builder::new()
        .name("signal-watch".to_string())
        .spawn(move || {
            let interrupted = runtime.block_on(async {
                let received = shutdown.await;
                warn!(signal = received, "aborting run, waiting for in-flight calls");
                signal.cancel();
                tokio::signal::ctrl_c().await.is_ok()
            });
            if interrupted {
                eprintln!("dtbench: interrupted");
                process::exit(130);
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "signal handling unavailable");
    }
}

fn run(args: Args) -> Result<AggregatedReport, RunError> {
    let insert_ratio = args.fault_insert_ratio;
    let query_delay = Duration::from_millis(args.fault_query_delay_ms);
    let config = args.into_config()?;

    let backend = FaultInjectingBackend::new(MemoryBackend::new());
    backend.set_error_ratio(FaultTarget::Insert, insert_ratio);
    backend.set_delay(FaultTarget::Query, query_delay);
    let backend: Arc<dyn BackendAdapter> = Arc::new(backend);

    let mut runner = Runner::new(config, backend)?;
    watch_shutdown(runner.cancel_handle(), wait_for_shutdown_signal());
    runner.run()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(report) => print_report(&report),
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("dtbench: error: {}", e);
            process::exit(1);
        }
    }
}
