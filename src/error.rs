//! Error taxonomy for the profiler core
//!
//! Failures are either returned from the call that can act on them
//! (`ProfilerArbiter::start`) or carried as data on a [`crate::arbiter::Snapshot`].
//! Nothing here is meant to cross a thread boundary as a panic.

use thiserror::Error;

/// Errors from the arbiter lifecycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfilerError {
    #[error("cpu profiler arbiter is already started")]
    AlreadyStarted,

    #[error("failed to spawn {thread} thread: {reason}")]
    Spawn { thread: &'static str, reason: String },
}

/// Errors from the exclusive sampler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    /// Another capture window is open somewhere in the process
    #[error("cpu sampler is already in use")]
    InUse,

    #[error("invalid sampler configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to install SIGPROF handler: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("failed to arm profiling timer: {0}")]
    Timer(String),

    #[error("failed to encode captured profile: {0}")]
    Encode(String),

    /// The capture rotation panicked; the window was abandoned
    #[error("capture rotation faulted")]
    Faulted,
}

/// Errors from decoding a snapshot buffer
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty snapshot buffer")]
    Empty,

    #[error("malformed snapshot: {0}")]
    Malformed(#[from] rmp_serde::decode::Error),

    #[error("unsupported snapshot format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

pub type Result<T> = std::result::Result<T, ProfilerError>;
