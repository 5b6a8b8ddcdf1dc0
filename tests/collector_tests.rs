//! CPU collector integration tests against a live arbiter

use labelprof::arbiter::{ArbiterConfig, ProfilerArbiter};
use labelprof::collector::{CollectorConfig, CpuCollector, CpuTimeRecord, CpuTimeSink};
use labelprof::labels::LabelContext;
use labelprof::sampler::SamplerConfig;
use labelprof::workload;
use serial_test::serial;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const ROTATION: Duration = Duration::from_millis(100);

fn fast_arbiter() -> ProfilerArbiter {
    let arbiter = ProfilerArbiter::new(ArbiterConfig {
        rotation_interval: ROTATION,
        sampler: SamplerConfig {
            frequency_hz: 1000,
            ..SamplerConfig::default()
        },
        ..ArbiterConfig::default()
    });
    arbiter.start().unwrap();
    arbiter
}

fn fast_collector(arbiter: &ProfilerArbiter, sink: Arc<dyn CpuTimeSink>) -> CpuCollector {
    CpuCollector::with_config(
        arbiter.clone(),
        sink,
        CollectorConfig {
            collect_interval: ROTATION,
            ..CollectorConfig::default()
        },
    )
}

/// Sink that remembers the latest batch and how many batches it saw
#[derive(Default)]
struct LatestSink {
    latest: Mutex<BTreeMap<String, u64>>,
    batches: AtomicUsize,
}

impl CpuTimeSink for LatestSink {
    fn collect(&self, records: &[CpuTimeRecord]) {
        let mut latest = self.latest.lock().unwrap();
        for r in records {
            latest.insert(r.label.clone(), r.cpu_time_ms);
        }
        self.batches.fetch_add(1, Ordering::SeqCst);
    }
}

impl LatestSink {
    fn get(&self, label: &str) -> u64 {
        self.latest.lock().unwrap().get(label).copied().unwrap_or(0)
    }

    fn labels(&self) -> Vec<String> {
        self.latest.lock().unwrap().keys().cloned().collect()
    }
}

fn run_labeled(labels: &[&'static str], duration: Duration) -> thread::JoinHandle<()> {
    let labels: Vec<&'static str> = labels.to_vec();
    thread::spawn(move || {
        LabelContext::background().with_labels(labels);
        workload::burn_for(duration);
    })
}

#[test]
#[serial]
fn test_collector_attributes_cpu_time_per_label() {
    let arbiter = fast_arbiter();
    let sink = Arc::new(LatestSink::default());
    let collector = fast_collector(&arbiter, sink.clone());
    collector.start().unwrap();

    let single = run_labeled(&["alpha"], ROTATION * 6);
    let multi = run_labeled(&["alpha", "beta"], ROTATION * 6);
    single.join().unwrap();
    multi.join().unwrap();
    thread::sleep(ROTATION * 3);
    collector.stop();

    assert!(sink.batches.load(Ordering::SeqCst) > 0);
    assert_eq!(sink.labels(), vec!["alpha".to_string(), "beta".to_string()]);
    assert!(sink.get("beta") > 0);
    // Every multi-label sample also counts toward alpha
    assert!(sink.get("alpha") >= sink.get("beta"));
    assert_eq!(arbiter.consumer_count(), 0);
    arbiter.stop();
}

#[test]
#[serial]
fn test_unlabeled_work_is_not_reported() {
    let arbiter = fast_arbiter();
    let sink = Arc::new(LatestSink::default());
    let collector = fast_collector(&arbiter, sink.clone());
    collector.start().unwrap();

    thread::spawn(|| workload::burn_for(ROTATION * 4))
        .join()
        .unwrap();
    thread::sleep(ROTATION * 2);
    collector.stop();

    assert!(sink.labels().is_empty());
    arbiter.stop();
}

#[test]
#[serial]
fn test_totals_survive_restart() {
    let arbiter = fast_arbiter();
    let sink = Arc::new(LatestSink::default());
    let collector = fast_collector(&arbiter, sink.clone());

    collector.start().unwrap();
    run_labeled(&["gamma"], ROTATION * 4).join().unwrap();
    thread::sleep(ROTATION * 2);
    collector.stop();
    let first = collector
        .records()
        .unwrap()
        .into_iter()
        .find(|r| r.label == "gamma")
        .map(|r| r.cpu_time_ms)
        .unwrap_or(0);

    collector.start().unwrap();
    run_labeled(&["gamma"], ROTATION * 4).join().unwrap();
    thread::sleep(ROTATION * 2);
    collector.stop();

    assert!(sink.get("gamma") >= first);
    arbiter.stop();
}

#[test]
#[serial]
fn test_panicking_sink_keeps_collector_alive() {
    let arbiter = fast_arbiter();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let collector = fast_collector(
        &arbiter,
        Arc::new(move |_: &[CpuTimeRecord]| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first batch rejected");
            }
        }),
    );
    collector.start().unwrap();

    run_labeled(&["delta"], ROTATION * 5).join().unwrap();
    thread::sleep(ROTATION * 2);
    assert!(collector.is_running());
    collector.stop();

    assert!(calls.load(Ordering::SeqCst) >= 2);
    arbiter.stop();
}
