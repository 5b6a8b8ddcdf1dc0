//! Profiler arbiter: multiplexes the exclusive CPU sampler across consumers
//!
//! The sampler allows one capture at a time. The arbiter owns it on behalf of
//! every registered [`ProfileConsumer`], rotating capture windows on a fixed
//! tick and handing each finished [`Snapshot`] to all of them.
//!
//! # Design
//!
//! ```text
//!   register() ──┐ wake (coalesced)
//!                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ ROTATION THREAD                                              │
//! │   select! { shutdown | tick | wake }                         │
//! │   finish open window ─► fan-out (try_send per consumer)      │
//! │   no consumers?  stay idle                                   │
//! │   else open next window, capacity = next block above last    │
//! └──────────────────────────────────────────────────────────────┘
//!                │ Arc<Snapshot>, dropped when an inbox is full
//!                ▼
//!        consumer inboxes (bounded channels)
//! ```
//!
//! The registry and the window-open flag share one mutex. Delivery never
//! blocks: a full inbox simply misses that snapshot.

use crate::error::{DecodeError, ProfilerError, Result, SamplerError};
use crate::profile::Profile;
use crate::recovery::with_recovery;
use crate::sampler::{CaptureWindow, SamplerConfig};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use fnv::FnvHashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default length of one capture window
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(1);

/// Default growth step for snapshot buffers
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Arbiter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArbiterConfig {
    /// Tick between window rotations
    pub rotation_interval: Duration,
    /// Snapshot buffers are sized in multiples of this
    pub block_size: usize,
    pub sampler: SamplerConfig,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            block_size: DEFAULT_BLOCK_SIZE,
            sampler: SamplerConfig::default(),
        }
    }
}

/// Smallest multiple of `block_size` strictly greater than `last_size`
pub fn next_capacity(last_size: usize, block_size: usize) -> usize {
    let block = block_size.max(1);
    (last_size / block + 1) * block
}

/// Output of one capture window
#[derive(Debug)]
pub struct Snapshot {
    /// Encoded [`Profile`]; empty when `error` is set
    pub data: Vec<u8>,
    /// Why the window could not be captured
    pub error: Option<SamplerError>,
}

impl Snapshot {
    fn captured(data: Vec<u8>) -> Self {
        Self { data, error: None }
    }

    fn failed(error: SamplerError) -> Self {
        Self {
            data: Vec::new(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Decode the captured profile
    pub fn parse(&self) -> std::result::Result<Profile, DecodeError> {
        Profile::parse(&self.data)
    }
}

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// A bounded inbox receiving snapshots from an arbiter
///
/// Clones share the same inbox and identity. A zero-capacity inbox can never
/// accept a non-blocking delivery, so the arbiter ignores it.
#[derive(Clone)]
pub struct ProfileConsumer {
    id: u64,
    capacity: usize,
    sender: Sender<Arc<Snapshot>>,
    receiver: Receiver<Arc<Snapshot>>,
}

impl fmt::Debug for ProfileConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileConsumer")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("pending", &self.receiver.len())
            .finish()
    }
}

impl PartialEq for ProfileConsumer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProfileConsumer {}

impl ProfileConsumer {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = channel::bounded(capacity);
        Self {
            id: NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            sender,
            receiver,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_valid(&self) -> bool {
        self.capacity > 0
    }

    /// Snapshots waiting in the inbox
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn receiver(&self) -> &Receiver<Arc<Snapshot>> {
        &self.receiver
    }

    pub fn try_recv(&self) -> Option<Arc<Snapshot>> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Arc<Snapshot>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(snapshot) => Some(snapshot),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Counters describing arbiter activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArbiterStats {
    pub windows_opened: u64,
    pub open_failures: u64,
    pub snapshots_delivered: u64,
    /// Deliveries skipped because an inbox was full
    pub deliveries_skipped: u64,
    /// Encoded size of the last finished window
    pub last_window_size: usize,
}

#[derive(Default)]
struct Counters {
    windows_opened: AtomicU64,
    open_failures: AtomicU64,
    snapshots_delivered: AtomicU64,
    deliveries_skipped: AtomicU64,
    last_window_size: AtomicUsize,
}

#[derive(Default)]
struct Registry {
    consumers: FnvHashMap<u64, Sender<Arc<Snapshot>>>,
    window_open: bool,
}

struct Shared {
    registry: Mutex<Registry>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    counters: Counters,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn consumer_count(&self) -> usize {
        self.registry().consumers.len()
    }

    fn set_window_open(&self, open: bool) {
        self.registry().window_open = open;
    }

    fn fan_out(&self, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        let counters = &self.counters;
        let mut registry = self.registry();
        with_recovery("arbiter fan-out", || {
            let mut dead = Vec::new();
            for (id, inbox) in &registry.consumers {
                match inbox.try_send(snapshot.clone()) {
                    Ok(()) => {
                        counters.snapshots_delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        counters.deliveries_skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => dead.push(*id),
                }
            }
            for id in dead {
                tracing::debug!(consumer = id, "pruning dropped consumer");
                registry.consumers.remove(&id);
            }
        });
    }
}

struct RotationWorker {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    shared: Arc<Shared>,
    config: ArbiterConfig,
    worker: Mutex<Option<RotationWorker>>,
}

impl Inner {
    fn stop(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        let Some(RotationWorker { shutdown, handle }) = worker.take() else {
            return;
        };
        drop(shutdown);
        if handle.join().is_err() {
            tracing::error!("cpu profiler rotation thread panicked");
        }
        tracing::info!("cpu profiler arbiter stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Broker for the exclusive CPU sampler
///
/// Cloning yields another handle to the same arbiter. The rotation thread is
/// stopped when [`stop`](Self::stop) is called or the last handle drops.
///
/// # Example
///
/// ```no_run
/// use labelprof::arbiter::{ArbiterConfig, ProfileConsumer, ProfilerArbiter};
/// use std::time::Duration;
///
/// let arbiter = ProfilerArbiter::new(ArbiterConfig::default());
/// arbiter.start()?;
///
/// let inbox = ProfileConsumer::new(1);
/// arbiter.register(&inbox);
/// if let Some(snapshot) = inbox.recv_timeout(Duration::from_secs(3)) {
///     println!("{} bytes captured", snapshot.data.len());
/// }
/// arbiter.unregister(&inbox);
/// arbiter.stop();
/// # Ok::<(), labelprof::error::ProfilerError>(())
/// ```
#[derive(Clone)]
pub struct ProfilerArbiter {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProfilerArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilerArbiter")
            .field("running", &self.is_running())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

impl Default for ProfilerArbiter {
    fn default() -> Self {
        Self::new(ArbiterConfig::default())
    }
}

impl ProfilerArbiter {
    pub fn new(config: ArbiterConfig) -> Self {
        let (wake_tx, wake_rx) = channel::bounded(1);
        Self {
            inner: Arc::new(Inner {
                shared: Arc::new(Shared {
                    registry: Mutex::new(Registry::default()),
                    wake_tx,
                    wake_rx,
                    counters: Counters::default(),
                }),
                config,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.inner.config
    }

    /// Launch the rotation thread.
    ///
    /// Capturing begins once a consumer is registered.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock().unwrap_or_else(|e| e.into_inner());
        if worker.is_some() {
            return Err(ProfilerError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let rotation = Rotation {
            shared: self.inner.shared.clone(),
            config: self.inner.config.clone(),
            window: None,
            last_size: 0,
        };
        let handle = thread::Builder::new()
            .name("labelprof-arbiter".to_string())
            .spawn(move || rotation.run(shutdown_rx))
            .map_err(|e| ProfilerError::Spawn {
                thread: "arbiter rotation",
                reason: e.to_string(),
            })?;

        *worker = Some(RotationWorker {
            shutdown: shutdown_tx,
            handle,
        });
        tracing::info!(
            interval_ms = self.inner.config.rotation_interval.as_millis() as u64,
            "cpu profiler arbiter started"
        );
        Ok(())
    }

    /// Stop the rotation thread and wait for it to exit.
    ///
    /// Any open window is closed first. No-op when not running.
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Add `consumer` to the registry. Registering twice has no extra effect.
    pub fn register(&self, consumer: &ProfileConsumer) {
        if !consumer.is_valid() {
            return;
        }
        let wake = {
            let mut registry = self.inner.shared.registry();
            registry
                .consumers
                .insert(consumer.id, consumer.sender.clone());
            !registry.window_open
        };
        if wake {
            let _ = self.inner.shared.wake_tx.try_send(());
        }
    }

    pub fn unregister(&self, consumer: &ProfileConsumer) {
        if !consumer.is_valid() {
            return;
        }
        self.inner.shared.registry().consumers.remove(&consumer.id);
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.shared.consumer_count()
    }

    /// Whether a capture window is currently open
    pub fn is_capturing(&self) -> bool {
        self.inner.shared.registry().window_open
    }

    pub fn stats(&self) -> ArbiterStats {
        let c = &self.inner.shared.counters;
        ArbiterStats {
            windows_opened: c.windows_opened.load(Ordering::Relaxed),
            open_failures: c.open_failures.load(Ordering::Relaxed),
            snapshots_delivered: c.snapshots_delivered.load(Ordering::Relaxed),
            deliveries_skipped: c.deliveries_skipped.load(Ordering::Relaxed),
            last_window_size: c.last_window_size.load(Ordering::Relaxed),
        }
    }
}

/// State owned by the rotation thread
struct Rotation {
    shared: Arc<Shared>,
    config: ArbiterConfig,
    window: Option<CaptureWindow>,
    last_size: usize,
}

impl Rotation {
    fn run(mut self, shutdown: Receiver<()>) {
        let ticker = channel::tick(self.config.rotation_interval);
        loop {
            crossbeam::select! {
                recv(shutdown) -> _ => break,
                recv(self.shared.wake_rx) -> _ => {
                    if self.window.is_some() {
                        continue;
                    }
                }
                recv(ticker) -> _ => {}
            }
            self.guarded(Self::rotate);
        }

        if let Some(window) = self.window.take() {
            if let Err(e) = window.finish() {
                tracing::warn!(error = %e, "failed to finish capture window on shutdown");
            }
            self.shared.set_window_open(false);
        }
    }

    /// Run one rotation step; a panic abandons the window and is reported
    /// to consumers as a faulted snapshot.
    fn guarded(&mut self, step: fn(&mut Self)) {
        if with_recovery("arbiter rotation", || step(self)).is_some() {
            return;
        }
        // Dropping the window disarms the sampler and releases exclusivity
        self.window = None;
        self.shared.set_window_open(false);
        self.shared
            .counters
            .open_failures
            .fetch_add(1, Ordering::Relaxed);
        self.shared.fan_out(Snapshot::failed(SamplerError::Faulted));
    }

    fn rotate(&mut self) {
        if let Some(window) = self.window.take() {
            let snapshot = match window.finish() {
                Ok(data) => {
                    self.last_size = data.len();
                    self.shared
                        .counters
                        .last_window_size
                        .store(self.last_size, Ordering::Relaxed);
                    tracing::debug!(bytes = self.last_size, "capture window closed");
                    Snapshot::captured(data)
                }
                Err(e) => Snapshot::failed(e),
            };
            self.shared.set_window_open(false);
            self.shared.fan_out(snapshot);
        }

        if self.shared.consumer_count() == 0 {
            return;
        }

        let capacity = next_capacity(self.last_size, self.config.block_size);
        match CaptureWindow::open(&self.config.sampler, Vec::with_capacity(capacity)) {
            Ok(window) => {
                self.window = Some(window);
                self.shared.set_window_open(true);
                self.shared
                    .counters
                    .windows_opened
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open capture window");
                self.shared
                    .counters
                    .open_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.shared.fan_out(Snapshot::failed(e));
            }
        }
    }
}

/// The process-wide arbiter, created on first use
pub fn global() -> &'static ProfilerArbiter {
    static GLOBAL: OnceLock<ProfilerArbiter> = OnceLock::new();
    GLOBAL.get_or_init(ProfilerArbiter::default)
}

pub fn start_cpu_profiler() -> Result<()> {
    global().start()
}

pub fn stop_cpu_profiler() {
    global().stop();
}

pub fn register(consumer: &ProfileConsumer) {
    global().register(consumer);
}

pub fn unregister(consumer: &ProfileConsumer) {
    global().unregister(consumer);
}
