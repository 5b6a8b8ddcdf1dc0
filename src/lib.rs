//! labelprof - label-attributed CPU profiling for Rust services
//!
//! A single process-wide CPU sampler is shared by any number of consumers.
//! The [`arbiter`] rotates capture windows on a fixed interval and fans each
//! finished snapshot out to every registered inbox. Work is tagged with
//! [`labels`] that follow the current thread (and async tasks via
//! [`labels::Labeled`]), and the [`collector`] turns labeled samples into
//! cumulative CPU time per label.

pub mod arbiter;
pub mod cli;
pub mod collector;
pub mod config;
pub mod error;
pub mod labels;
pub mod profile;
pub mod recovery;
pub mod sampler;
pub mod sink;
pub mod workload;
