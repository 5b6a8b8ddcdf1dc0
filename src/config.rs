//! TOML settings file
//!
//! ```toml
//! rotation_ms = 1000
//! block_size = 4096
//!
//! [sampler]
//! frequency_hz = 100
//! max_samples = 16384
//!
//! [collector]
//! collect_ms = 1000
//! inbox_capacity = 1
//! ```
//!
//! Every field is optional; omitted ones keep their defaults.

use crate::arbiter::{ArbiterConfig, DEFAULT_BLOCK_SIZE, DEFAULT_ROTATION_INTERVAL};
use crate::collector::CollectorConfig;
use crate::sampler::SamplerConfig;
use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub rotation_ms: u64,
    pub block_size: usize,
    pub sampler: SamplerConfig,
    pub collector: CollectorSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorSettings {
    pub collect_ms: u64,
    pub inbox_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rotation_ms: DEFAULT_ROTATION_INTERVAL.as_millis() as u64,
            block_size: DEFAULT_BLOCK_SIZE,
            sampler: SamplerConfig::default(),
            collector: CollectorSettings::default(),
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        let defaults = CollectorConfig::default();
        Self {
            collect_ms: defaults.collect_interval.as_millis() as u64,
            inbox_capacity: defaults.inbox_capacity,
        }
    }
}

impl Settings {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).context("Failed to parse profiler settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.rotation_ms > 0, "rotation_ms must be positive");
        ensure!(self.block_size > 0, "block_size must be positive");
        ensure!(self.collector.collect_ms > 0, "collect_ms must be positive");
        ensure!(
            self.collector.inbox_capacity > 0,
            "inbox_capacity must be positive"
        );
        self.sampler
            .validate()
            .context("Invalid [sampler] section")?;
        Ok(())
    }

    pub fn arbiter_config(&self) -> ArbiterConfig {
        ArbiterConfig {
            rotation_interval: Duration::from_millis(self.rotation_ms),
            block_size: self.block_size,
            sampler: self.sampler.clone(),
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            collect_interval: Duration::from_millis(self.collector.collect_ms),
            inbox_capacity: self.collector.inbox_capacity,
        }
    }
}
