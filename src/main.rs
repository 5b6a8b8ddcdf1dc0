use anyhow::{Context, Result};
use clap::Parser;
use labelprof::arbiter::ProfilerArbiter;
use labelprof::cli::{Cli, OutputFormat};
use labelprof::collector::{CpuCollector, CpuTimeSink};
use labelprof::config::Settings;
use labelprof::sink::{JsonLinesSink, PercentageSink};
use labelprof::workload;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing_subscriber::EnvFilter;

const RULES: [&str; 3] = ["rule1", "rule2", "rule3"];

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    } else if std::env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_settings(args: &Cli) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_toml_file(path)?,
        None => Settings::default(),
    };
    args.apply_overrides(&mut settings);
    settings.validate().context("Invalid command-line overrides")?;
    Ok(settings)
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);
    let settings = load_settings(&args)?;

    let sink: Arc<dyn CpuTimeSink> = match args.format {
        OutputFormat::Text => Arc::new(PercentageSink::stdout()),
        OutputFormat::Json => Arc::new(JsonLinesSink::stdout()),
    };

    let arbiter = ProfilerArbiter::new(settings.arbiter_config());
    arbiter.start().context("Failed to start profiler arbiter")?;
    let collector = CpuCollector::with_config(arbiter.clone(), sink, settings.collector_config());
    collector.start().context("Failed to start CPU collector")?;

    let stop = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    for rule in RULES {
        workers.push(
            workload::spawn_labeled_worker(rule.to_string(), vec![rule.to_string()], stop.clone())
                .with_context(|| format!("Failed to spawn worker {rule}"))?,
        );
    }
    workers.push(
        workload::spawn_labeled_worker(
            "all-rules".to_string(),
            RULES.iter().map(|r| r.to_string()).collect(),
            stop.clone(),
        )
        .context("Failed to spawn multi-label worker")?,
    );

    thread::sleep(args.duration());
    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }

    // One more rotation so the tail of the run reaches the sink
    thread::sleep(settings.arbiter_config().rotation_interval);
    collector.stop();
    arbiter.stop();

    let stats = arbiter.stats();
    tracing::info!(
        windows = stats.windows_opened,
        delivered = stats.snapshots_delivered,
        skipped = stats.deliveries_skipped,
        "profiler finished"
    );
    Ok(())
}
