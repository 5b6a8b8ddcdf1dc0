//! CLI argument parsing for the labelprof demo

use crate::config::Settings;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Output format for per-label CPU time
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Percentage table, largest label first (default)
    Text,
    /// One JSON array of records per update
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "labelprof")]
#[command(version)]
#[command(
    about = "Label-attributed CPU profiling demo: labeled workers report CPU time per label",
    long_about = None
)]
pub struct Cli {
    /// How long the labeled workers run
    #[arg(long = "duration-secs", value_name = "SECS", default_value = "10")]
    pub duration_secs: u64,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// TOML settings file for the arbiter, sampler and collector
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the capture window rotation interval
    #[arg(long = "rotation-ms", value_name = "MS")]
    pub rotation_ms: Option<u64>,

    /// Override the collector fallback interval
    #[arg(long = "collect-ms", value_name = "MS")]
    pub collect_ms: Option<u64>,

    /// Override the sampling frequency
    #[arg(long = "frequency-hz", value_name = "HZ")]
    pub frequency_hz: Option<u32>,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Apply command-line overrides on top of file settings
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(ms) = self.rotation_ms {
            settings.rotation_ms = ms;
        }
        if let Some(ms) = self.collect_ms {
            settings.collector.collect_ms = ms;
        }
        if let Some(hz) = self.frequency_hz {
            settings.sampler.frequency_hz = hz;
        }
    }
}
