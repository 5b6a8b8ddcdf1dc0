//! Snapshot codec: structured CPU profile and its binary encoding
//!
//! A capture window produces one [`Profile`], encoded as MessagePack with
//! named fields. Consumers receive the raw bytes and call [`Profile::parse`].
//!
//! Each sample carries two values, mirroring the usual pprof CPU layout:
//!
//! | index | type      | unit        |
//! |-------|-----------|-------------|
//! | 0     | `samples` | `count`     |
//! | 1     | `cpu`     | `nanoseconds` |

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current snapshot format version
pub const FORMAT_VERSION: u32 = 1;

/// Sample type name of the sample-count column
pub const SAMPLES_KIND: &str = "samples";

/// Sample type name of the CPU time column
pub const CPU_KIND: &str = "cpu";

/// Describes one value column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueType {
    pub kind: String,
    pub unit: String,
}

impl ValueType {
    pub fn new(kind: &str, unit: &str) -> Self {
        Self {
            kind: kind.to_string(),
            unit: unit.to_string(),
        }
    }
}

/// One aggregated stack sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Sample {
    /// Return addresses, leaf first. Empty when stacks were not captured.
    pub stack: Vec<u64>,
    /// One value per entry of [`Profile::sample_types`]
    pub values: Vec<i64>,
    /// Label key to label values
    pub labels: BTreeMap<String, Vec<String>>,
}

impl Sample {
    /// Values recorded under `key`, empty if none
    pub fn label_values(&self, key: &str) -> &[String] {
        self.labels.get(key).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// A decoded capture window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub format_version: u32,
    pub sample_types: Vec<ValueType>,
    /// Sampling period in nanoseconds of CPU time
    pub period_ns: u64,
    /// Wall-clock length of the capture window
    pub duration_ns: u64,
    /// Ticks that fired after the sample ring filled up
    pub dropped_samples: u64,
    pub samples: Vec<Sample>,
}

impl Profile {
    /// Empty CPU profile with the standard `samples`/`cpu` columns
    pub fn cpu(period_ns: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            sample_types: vec![
                ValueType::new(SAMPLES_KIND, "count"),
                ValueType::new(CPU_KIND, "nanoseconds"),
            ],
            period_ns,
            duration_ns: 0,
            dropped_samples: 0,
            samples: Vec::new(),
        }
    }

    /// Decode a snapshot buffer
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }
        let profile: Profile = rmp_serde::from_slice(data)?;
        if profile.format_version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion {
                found: profile.format_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(profile)
    }

    /// Append the encoded profile to `buf`, keeping its capacity
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), rmp_serde::encode::Error> {
        rmp_serde::encode::write_named(buf, self)
    }

    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Column index of the sample type named `kind`
    pub fn value_index(&self, kind: &str) -> Option<usize> {
        self.sample_types.iter().position(|t| t.kind == kind)
    }

    /// Sum of the `kind` column across all samples
    pub fn total(&self, kind: &str) -> i64 {
        let Some(idx) = self.value_index(kind) else {
            return 0;
        };
        self.samples
            .iter()
            .filter_map(|s| s.values.get(idx))
            .sum()
    }
}
