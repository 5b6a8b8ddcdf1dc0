//! Label-based CPU time collector
//!
//! A [`CpuCollector`] registers one inbox with a [`ProfilerArbiter`], decodes
//! each snapshot it receives and folds the labeled samples into cumulative
//! per-label CPU time. After every processed snapshot the full set of totals is
//! pushed to a [`CpuTimeSink`].
//!
//! Reduction rule: a sample with labels `L1..Ln` adds its CPU value to each of
//! them, so overlapping labels can sum to more than the elapsed CPU time.
//! Unlabeled samples are skipped.

use crate::arbiter::{ProfileConsumer, ProfilerArbiter, Snapshot};
use crate::error::ProfilerError;
use crate::labels::LABEL_KEY;
use crate::profile::{Profile, CPU_KIND};
use crate::recovery::with_recovery;
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const NANOS_PER_MILLI: u64 = 1_000_000;

/// Cumulative CPU time attributed to one label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimeRecord {
    pub label: String,
    pub cpu_time_ms: u64,
}

/// Receiver of per-label CPU time totals
///
/// Called serially from the collector thread; it must not block for long.
pub trait CpuTimeSink: Send + Sync {
    fn collect(&self, records: &[CpuTimeRecord]);
}

impl<F> CpuTimeSink for F
where
    F: Fn(&[CpuTimeRecord]) + Send + Sync,
{
    fn collect(&self, records: &[CpuTimeRecord]) {
        self(records)
    }
}

/// Per-label running totals in the sampler's native unit (nanoseconds)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelAggregator {
    totals: BTreeMap<String, u64>,
}

impl LabelAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to every label in `labels`. Non-positive values are ignored.
    pub fn add_sample(&mut self, labels: &[String], value: i64) {
        if value <= 0 {
            return;
        }
        for label in labels {
            let total = self.totals.entry(label.clone()).or_insert(0);
            *total = total.saturating_add(value as u64);
        }
    }

    /// Fold every labeled sample of `profile` into the totals
    pub fn add_profile(&mut self, profile: &Profile) {
        let Some(idx) = profile
            .value_index(CPU_KIND)
            .or_else(|| profile.sample_types.len().checked_sub(1))
        else {
            return;
        };
        for sample in &profile.samples {
            let labels = sample.label_values(LABEL_KEY);
            if labels.is_empty() {
                continue;
            }
            if let Some(&value) = sample.values.get(idx) {
                self.add_sample(labels, value);
            }
        }
    }

    pub fn total_ns(&self, label: &str) -> u64 {
        self.totals.get(label).copied().unwrap_or(0)
    }

    /// Totals in whole milliseconds (truncating), sorted by label
    pub fn records(&self) -> Vec<CpuTimeRecord> {
        self.totals
            .iter()
            .map(|(label, ns)| CpuTimeRecord {
                label: label.clone(),
                cpu_time_ms: ns / NANOS_PER_MILLI,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    pub fn reset(&mut self) {
        self.totals.clear();
    }
}

/// Collector configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Fallback wake-up when no snapshot arrives
    pub collect_interval: Duration,
    /// Capacity of the inbox registered with the arbiter
    pub inbox_capacity: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collect_interval: Duration::from_secs(1),
            inbox_capacity: 1,
        }
    }
}

/// State owned by the collector thread
struct CollectLoop {
    consumer: ProfileConsumer,
    sink: Arc<dyn CpuTimeSink>,
    aggregator: LabelAggregator,
}

impl CollectLoop {
    fn run(mut self, shutdown: Receiver<()>, interval: Duration) -> LabelAggregator {
        let ticker = channel::tick(interval);
        let inbox = self.consumer.receiver().clone();
        loop {
            crossbeam::select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => {}
                recv(inbox) -> msg => {
                    if let Ok(snapshot) = msg {
                        self.process(&snapshot);
                    }
                }
            }
        }
        self.aggregator
    }

    fn process(&mut self, snapshot: &Snapshot) {
        if let Some(e) = &snapshot.error {
            tracing::debug!(error = %e, "dropping errored snapshot");
            return;
        }
        let profile = match snapshot.parse() {
            Ok(profile) => profile,
            Err(e) => {
                tracing::debug!(error = %e, "dropping undecodable snapshot");
                return;
            }
        };
        self.aggregator.add_profile(&profile);
        let records = self.aggregator.records();
        let sink = &self.sink;
        with_recovery("cpu time sink", || sink.collect(&records));
    }
}

struct CollectorWorker {
    shutdown: Sender<()>,
    handle: JoinHandle<LabelAggregator>,
}

enum State {
    Idle(LabelAggregator),
    Running(CollectorWorker),
}

/// Consumes arbiter snapshots and reports per-label CPU time to a sink
///
/// # Example
///
/// ```no_run
/// use labelprof::arbiter::ProfilerArbiter;
/// use labelprof::collector::{CpuCollector, CpuTimeRecord};
/// use std::sync::Arc;
///
/// let arbiter = ProfilerArbiter::default();
/// arbiter.start()?;
///
/// let collector = CpuCollector::new(arbiter.clone(), Arc::new(|records: &[CpuTimeRecord]| {
///     for r in records {
///         println!("{}: {} ms", r.label, r.cpu_time_ms);
///     }
/// }));
/// collector.start()?;
/// // ... labeled work ...
/// collector.stop();
/// arbiter.stop();
/// # Ok::<(), labelprof::error::ProfilerError>(())
/// ```
pub struct CpuCollector {
    arbiter: ProfilerArbiter,
    sink: Arc<dyn CpuTimeSink>,
    config: CollectorConfig,
    consumer: ProfileConsumer,
    state: Mutex<State>,
}

impl CpuCollector {
    pub fn new(arbiter: ProfilerArbiter, sink: Arc<dyn CpuTimeSink>) -> Self {
        Self::with_config(arbiter, sink, CollectorConfig::default())
    }

    pub fn with_config(
        arbiter: ProfilerArbiter,
        sink: Arc<dyn CpuTimeSink>,
        config: CollectorConfig,
    ) -> Self {
        let consumer = ProfileConsumer::new(config.inbox_capacity.max(1));
        Self {
            arbiter,
            sink,
            config,
            consumer,
            state: Mutex::new(State::Idle(LabelAggregator::new())),
        }
    }

    /// Register with the arbiter and launch the processing thread.
    ///
    /// The inbox is registered once per run; removing it from the arbiter by
    /// hand stops delivery until the next `start`. Calling it while running
    /// is a no-op.
    pub fn start(&self) -> Result<(), ProfilerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let aggregator = match &mut *state {
            State::Running(_) => return Ok(()),
            State::Idle(aggregator) => std::mem::take(aggregator),
        };

        self.arbiter.register(&self.consumer);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let collect_loop = CollectLoop {
            consumer: self.consumer.clone(),
            sink: self.sink.clone(),
            aggregator,
        };
        let interval = self.config.collect_interval;
        let spawned = thread::Builder::new()
            .name("labelprof-collector".to_string())
            .spawn(move || collect_loop.run(shutdown_rx, interval));

        match spawned {
            Ok(handle) => {
                *state = State::Running(CollectorWorker {
                    shutdown: shutdown_tx,
                    handle,
                });
                tracing::info!("cpu collector started");
                Ok(())
            }
            Err(e) => {
                self.arbiter.unregister(&self.consumer);
                Err(ProfilerError::Spawn {
                    thread: "cpu collector",
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop the processing thread, wait for it and unregister.
    ///
    /// Accumulated totals are kept for a later `start`. No-op when idle.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let worker = match std::mem::replace(&mut *state, State::Idle(LabelAggregator::new())) {
            State::Running(worker) => worker,
            idle @ State::Idle(_) => {
                *state = idle;
                return;
            }
        };

        drop(worker.shutdown);
        match worker.handle.join() {
            Ok(aggregator) => *state = State::Idle(aggregator),
            Err(_) => tracing::error!("cpu collector thread panicked; totals lost"),
        }
        self.arbiter.unregister(&self.consumer);
        tracing::info!("cpu collector stopped");
    }

    pub fn is_running(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(|e| e.into_inner()),
            State::Running(_)
        )
    }

    /// The inbox this collector registers with the arbiter
    pub fn consumer(&self) -> &ProfileConsumer {
        &self.consumer
    }

    /// Current totals; only available while stopped
    pub fn records(&self) -> Option<Vec<CpuTimeRecord>> {
        match &*self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            State::Idle(aggregator) => Some(aggregator.records()),
            State::Running(_) => None,
        }
    }
}

impl Drop for CpuCollector {
    fn drop(&mut self) {
        self.stop();
    }
}
