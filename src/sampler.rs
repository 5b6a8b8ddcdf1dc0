//! Exclusive in-process CPU sampler
//!
//! The process-wide `ITIMER_PROF` interval timer delivers `SIGPROF` to
//! whichever thread is consuming CPU. The handler records the label-set id
//! active on that thread (and optionally its call stack) into a preallocated
//! sample ring owned by the open [`CaptureWindow`].
//!
//! There is one timer per process, so at most one window can be open at any
//! instant; [`CaptureWindow::open`] fails with [`SamplerError::InUse`]
//! otherwise.
//!
//! # Design
//!
//! ```text
//! ┌────────────────────────┐  SIGPROF   ┌─────────────────────────────┐
//! │ worker thread (labels) │ ─────────► │ on_sigprof                  │
//! └────────────────────────┘            │   slot = ring.next++        │
//!                                       │   slot.label_set = current  │
//!                                       │   slot.stack = backtrace?   │
//!                                       └──────────────┬──────────────┘
//!                                                      │ atomics only
//!                                                      ▼
//!                                  CaptureWindow::finish → Profile → bytes
//! ```
//!
//! The handler never allocates or locks. It only touches the ring through
//! atomics, and `finish` waits until no handler is in flight before it frees
//! the ring.
//!
//! Stack capture uses `backtrace::trace_unsynchronized` from signal context.
//! That unwinder is not strictly async-signal-safe, so it is off by default.

use crate::error::SamplerError;
use crate::labels::{self, LabelSetId};
use crate::profile::{Profile, Sample};
use fnv::FnvHashMap;
use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use serde::Deserialize;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Sampler configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplerConfig {
    /// Samples per second of consumed CPU time
    pub frequency_hz: u32,
    /// Capacity of the per-window sample ring
    pub max_samples: usize,
    /// Record call stacks alongside labels
    pub capture_stacks: bool,
    /// Frames kept per stack when `capture_stacks` is set
    pub max_stack_depth: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 100,
            max_samples: 16 * 1024,
            capture_stacks: false,
            max_stack_depth: 32,
        }
    }
}

/// Largest sample ring a window may preallocate
pub const MAX_SAMPLES_LIMIT: usize = 1 << 20;

/// Deepest stack a sample may record
pub const MAX_STACK_DEPTH_LIMIT: usize = 256;

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.frequency_hz == 0 || self.frequency_hz > 1_000_000 {
            return Err(SamplerError::InvalidConfig(format!(
                "frequency_hz must be in 1..=1000000, got {}",
                self.frequency_hz
            )));
        }
        if self.max_samples == 0 || self.max_samples > MAX_SAMPLES_LIMIT {
            return Err(SamplerError::InvalidConfig(format!(
                "max_samples must be in 1..={MAX_SAMPLES_LIMIT}, got {}",
                self.max_samples
            )));
        }
        if self.capture_stacks
            && (self.max_stack_depth == 0 || self.max_stack_depth > MAX_STACK_DEPTH_LIMIT)
        {
            return Err(SamplerError::InvalidConfig(format!(
                "max_stack_depth must be in 1..={MAX_STACK_DEPTH_LIMIT} when capture_stacks is set, got {}",
                self.max_stack_depth
            )));
        }
        Ok(())
    }

    /// CPU time represented by one sample
    pub fn period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.frequency_hz.max(1)))
    }
}

static CAPTURING: AtomicBool = AtomicBool::new(false);
static ACTIVE_RING: AtomicPtr<SampleRing> = AtomicPtr::new(ptr::null_mut());
static HANDLERS_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Whether a capture window is open anywhere in the process
pub fn is_capturing() -> bool {
    CAPTURING.load(Ordering::Acquire)
}

struct Slot {
    label_set: AtomicU32,
    depth: AtomicU32,
    ready: AtomicBool,
}

struct SampleRing {
    next: AtomicUsize,
    dropped: AtomicU64,
    slots: Box<[Slot]>,
    frames: Box<[AtomicU64]>,
    stack_depth: usize,
}

impl SampleRing {
    fn new(config: &SamplerConfig) -> Result<Self, SamplerError> {
        let stack_depth = if config.capture_stacks {
            config.max_stack_depth
        } else {
            0
        };
        let frame_count = config.max_samples.checked_mul(stack_depth).ok_or_else(|| {
            SamplerError::InvalidConfig("stack frame buffer size overflows".to_string())
        })?;
        let slots = (0..config.max_samples)
            .map(|_| Slot {
                label_set: AtomicU32::new(0),
                depth: AtomicU32::new(0),
                ready: AtomicBool::new(false),
            })
            .collect();
        let frames = (0..frame_count).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            next: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            slots,
            frames,
            stack_depth,
        })
    }

    /// Called from signal context.
    fn record(&self, label_set: LabelSetId) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed);
        let Some(slot) = self.slots.get(idx) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        slot.label_set.store(label_set.as_u32(), Ordering::Relaxed);

        if self.stack_depth > 0 {
            let base = idx * self.stack_depth;
            let frames = &self.frames[base..base + self.stack_depth];
            let mut depth = 0;
            // SAFETY: no other unwinder runs on this thread while the handler
            // executes; the closure only stores into preallocated atomics.
            unsafe {
                backtrace::trace_unsynchronized(|frame| {
                    if depth >= frames.len() {
                        return false;
                    }
                    frames[depth].store(frame.ip() as u64, Ordering::Relaxed);
                    depth += 1;
                    true
                });
            }
            slot.depth.store(depth as u32, Ordering::Relaxed);
        }

        slot.ready.store(true, Ordering::Release);
    }

    fn into_profile(self, period: Duration, elapsed: Duration) -> Profile {
        let period_ns = period.as_nanos() as u64;
        let recorded = self.next.load(Ordering::Acquire).min(self.slots.len());

        let mut counts: FnvHashMap<(u32, Vec<u64>), i64> = FnvHashMap::default();
        for (idx, slot) in self.slots[..recorded].iter().enumerate() {
            if !slot.ready.load(Ordering::Acquire) {
                continue;
            }
            let depth = slot.depth.load(Ordering::Relaxed) as usize;
            let base = idx * self.stack_depth;
            let stack = self.frames[base..base + depth.min(self.stack_depth)]
                .iter()
                .map(|f| f.load(Ordering::Relaxed))
                .collect();
            *counts
                .entry((slot.label_set.load(Ordering::Relaxed), stack))
                .or_insert(0) += 1;
        }

        let mut profile = Profile::cpu(period_ns);
        profile.duration_ns = elapsed.as_nanos() as u64;
        profile.dropped_samples = self.dropped.load(Ordering::Relaxed);
        profile.samples = counts
            .into_iter()
            .map(|((label_set, stack), count)| {
                let labels = labels::resolve(LabelSetId::from_u32(label_set))
                    .map(|set| {
                        let mut map = std::collections::BTreeMap::new();
                        if !set.is_empty() {
                            map.insert(labels::LABEL_KEY.to_string(), set.to_vec());
                        }
                        map
                    })
                    .unwrap_or_default();
                Sample {
                    stack,
                    values: vec![count, count * period_ns as i64],
                    labels,
                }
            })
            .collect();
        profile
            .samples
            .sort_by(|a, b| b.values[0].cmp(&a.values[0]).then(a.labels.cmp(&b.labels)));
        profile
    }
}

extern "C" fn on_sigprof(_signal: libc::c_int) {
    let saved_errno = Errno::last_raw();
    HANDLERS_IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let ring = ACTIVE_RING.load(Ordering::SeqCst);
    if !ring.is_null() {
        // SAFETY: the ring is only freed after ACTIVE_RING is cleared and
        // HANDLERS_IN_FLIGHT has drained to zero.
        unsafe { (*ring).record(labels::current_id()) };
    }
    HANDLERS_IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
    Errno::set_raw(saved_errno);
}

/// Install the SIGPROF handler once per process.
///
/// It stays installed after windows close: a late SIGPROF must never hit
/// the default disposition, which terminates the process.
fn install_handler() -> Result<(), SamplerError> {
    static INSTALLED: OnceLock<Result<(), Errno>> = OnceLock::new();
    let result = INSTALLED.get_or_init(|| {
        let action = SigAction::new(
            SigHandler::Handler(on_sigprof),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: on_sigprof only touches atomics and const thread-locals.
        unsafe { sigaction(Signal::SIGPROF, &action) }.map(|_| ())
    });
    (*result).map_err(SamplerError::Signal)
}

fn set_timer(interval: Duration) -> Result<(), SamplerError> {
    let tv = libc::timeval {
        tv_sec: interval.as_secs() as libc::time_t,
        tv_usec: interval.subsec_micros() as libc::suseconds_t,
    };
    let value = libc::itimerval {
        it_interval: tv,
        it_value: tv,
    };
    // SAFETY: plain syscall with a valid itimerval; old value not requested.
    let rc = unsafe { libc::setitimer(libc::ITIMER_PROF, &value, ptr::null_mut()) };
    if rc != 0 {
        return Err(SamplerError::Timer(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    Ok(())
}

fn wait_for_handlers() {
    while HANDLERS_IN_FLIGHT.load(Ordering::SeqCst) != 0 {
        std::thread::yield_now();
    }
}

/// An open capture window holding the exclusive sampler
///
/// # Example
///
/// ```no_run
/// use labelprof::profile::Profile;
/// use labelprof::sampler::{CaptureWindow, SamplerConfig};
///
/// let window = CaptureWindow::open(&SamplerConfig::default(), Vec::with_capacity(4096))?;
/// // ... do work ...
/// let bytes = window.finish()?;
/// let profile = Profile::parse(&bytes).unwrap();
/// println!("{} distinct samples", profile.samples.len());
/// # Ok::<(), labelprof::error::SamplerError>(())
/// ```
pub struct CaptureWindow {
    ring: Option<NonNull<SampleRing>>,
    buffer: Vec<u8>,
    period: Duration,
    opened_at: Instant,
}

// SAFETY: the ring is shared with the signal handler only through atomics;
// ownership of the allocation moves with the window.
unsafe impl Send for CaptureWindow {}

impl CaptureWindow {
    /// Take the sampler and start recording into a fresh ring.
    ///
    /// `buffer` receives the encoded profile on [`finish`](Self::finish).
    pub fn open(config: &SamplerConfig, buffer: Vec<u8>) -> Result<Self, SamplerError> {
        config.validate()?;
        // Allocate before taking exclusivity so a failure here cannot leave it held
        let ring = Box::new(SampleRing::new(config)?);
        if CAPTURING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SamplerError::InUse);
        }

        if let Err(e) = install_handler() {
            CAPTURING.store(false, Ordering::Release);
            return Err(e);
        }

        let ring = NonNull::from(Box::leak(ring));
        ACTIVE_RING.store(ring.as_ptr(), Ordering::SeqCst);

        let mut window = Self {
            ring: Some(ring),
            buffer,
            period: config.period(),
            opened_at: Instant::now(),
        };
        set_timer(window.period)?;
        window.opened_at = Instant::now();
        Ok(window)
    }

    /// Stop recording, release the sampler and return the encoded profile
    pub fn finish(mut self) -> Result<Vec<u8>, SamplerError> {
        let elapsed = self.opened_at.elapsed();
        let Some(ring) = self.disarm() else {
            return Ok(std::mem::take(&mut self.buffer));
        };
        let profile = ring.into_profile(self.period, elapsed);
        let mut buffer = std::mem::take(&mut self.buffer);
        profile
            .encode_into(&mut buffer)
            .map_err(|e| SamplerError::Encode(e.to_string()))?;
        Ok(buffer)
    }

    fn disarm(&mut self) -> Option<SampleRing> {
        let ring = self.ring.take()?;
        if let Err(e) = set_timer(Duration::ZERO) {
            tracing::warn!(error = %e, "failed to disarm profiling timer");
        }
        ACTIVE_RING.store(ptr::null_mut(), Ordering::SeqCst);
        wait_for_handlers();
        // SAFETY: produced by Box::leak in `open`; no handler can reach it now.
        let ring = unsafe { Box::from_raw(ring.as_ptr()) };
        CAPTURING.store(false, Ordering::Release);
        Some(*ring)
    }
}

impl Drop for CaptureWindow {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelContext;
    use crate::workload;
    use serial_test::serial;

    fn fast_config() -> SamplerConfig {
        SamplerConfig {
            frequency_hz: 250,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SamplerConfig::default().validate().is_ok());
        let zero_hz = SamplerConfig {
            frequency_hz: 0,
            ..SamplerConfig::default()
        };
        assert!(matches!(
            zero_hz.validate(),
            Err(SamplerError::InvalidConfig(_))
        ));
        let zero_cap = SamplerConfig {
            max_samples: 0,
            ..SamplerConfig::default()
        };
        assert!(zero_cap.validate().is_err());
        let zero_depth = SamplerConfig {
            capture_stacks: true,
            max_stack_depth: 0,
            ..SamplerConfig::default()
        };
        assert!(zero_depth.validate().is_err());
    }

    #[test]
    fn test_oversized_rings_rejected() {
        let huge = SamplerConfig {
            max_samples: usize::MAX / 4,
            ..SamplerConfig::default()
        };
        assert!(matches!(huge.validate(), Err(SamplerError::InvalidConfig(_))));
        let at_limit = SamplerConfig {
            max_samples: MAX_SAMPLES_LIMIT,
            ..SamplerConfig::default()
        };
        assert!(at_limit.validate().is_ok());
        let deep = SamplerConfig {
            capture_stacks: true,
            max_stack_depth: MAX_STACK_DEPTH_LIMIT + 1,
            ..SamplerConfig::default()
        };
        assert!(deep.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_rejected_open_leaves_sampler_free() {
        let huge = SamplerConfig {
            max_samples: usize::MAX / 4,
            ..SamplerConfig::default()
        };
        assert!(matches!(
            CaptureWindow::open(&huge, Vec::new()),
            Err(SamplerError::InvalidConfig(_))
        ));
        assert!(!is_capturing());
        let window = CaptureWindow::open(&fast_config(), Vec::new()).unwrap();
        window.finish().unwrap();
    }

    #[test]
    fn test_period_from_frequency() {
        assert_eq!(fast_config().period(), Duration::from_millis(4));
        assert_eq!(SamplerConfig::default().period(), Duration::from_millis(10));
    }

    #[test]
    #[serial]
    fn test_second_window_is_rejected() {
        let first = CaptureWindow::open(&fast_config(), Vec::new()).unwrap();
        assert!(is_capturing());
        assert!(matches!(
            CaptureWindow::open(&fast_config(), Vec::new()),
            Err(SamplerError::InUse)
        ));
        first.finish().unwrap();
        assert!(!is_capturing());

        let again = CaptureWindow::open(&fast_config(), Vec::new()).unwrap();
        again.finish().unwrap();
    }

    #[test]
    #[serial]
    fn test_drop_releases_sampler() {
        {
            let _window = CaptureWindow::open(&fast_config(), Vec::new()).unwrap();
        }
        assert!(!is_capturing());
    }

    #[test]
    #[serial]
    fn test_labeled_cpu_work_is_sampled() {
        let window = CaptureWindow::open(&fast_config(), Vec::with_capacity(4096)).unwrap();
        let ctx = LabelContext::background().with_label("sampler-test");
        ctx.scope(|| workload::burn_for(Duration::from_millis(500)));
        let bytes = window.finish().unwrap();

        let profile = Profile::parse(&bytes).unwrap();
        assert!(profile.duration_ns > 0);
        let labeled: i64 = profile
            .samples
            .iter()
            .filter(|s| s.label_values(labels::LABEL_KEY) == ["sampler-test"])
            .map(|s| s.values[0])
            .sum();
        assert!(labeled > 0, "expected labeled samples, got {:?}", profile);
        for sample in &profile.samples {
            assert_eq!(sample.values[1], sample.values[0] * profile.period_ns as i64);
        }
    }

    #[test]
    #[serial]
    fn test_full_ring_counts_dropped_samples() {
        let config = SamplerConfig {
            frequency_hz: 250,
            max_samples: 1,
            ..SamplerConfig::default()
        };
        let window = CaptureWindow::open(&config, Vec::new()).unwrap();
        workload::burn_for(Duration::from_millis(300));
        let profile = Profile::parse(&window.finish().unwrap()).unwrap();
        assert!(profile.total(crate::profile::SAMPLES_KIND) <= 1);
        assert!(profile.dropped_samples > 0);
    }

    #[test]
    #[serial]
    fn test_stack_capture_records_frames() {
        let config = SamplerConfig {
            frequency_hz: 250,
            capture_stacks: true,
            max_stack_depth: 16,
            ..SamplerConfig::default()
        };
        let window = CaptureWindow::open(&config, Vec::new()).unwrap();
        workload::burn_for(Duration::from_millis(300));
        let profile = Profile::parse(&window.finish().unwrap()).unwrap();
        assert!(profile
            .samples
            .iter()
            .any(|s| !s.stack.is_empty() && s.stack.len() <= 16));
    }
}
