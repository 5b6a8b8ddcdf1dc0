//! Synthetic CPU-bound workload for demos and tests

use crate::labels::LabelContext;
use std::hint::black_box;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Count primes below `limit` by trial division
pub fn count_primes(limit: u64) -> u64 {
    let mut count = 0;
    for i in 2..limit {
        let mut is_prime = true;
        let mut j = 2;
        while j * j <= i {
            if i % j == 0 {
                is_prime = false;
                break;
            }
            j += 1;
        }
        if is_prime {
            count += 1;
        }
    }
    count
}

/// Spin on prime counting for roughly `duration` of wall time
pub fn burn_for(duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        black_box(count_primes(black_box(2_000)));
    }
}

/// Spin on prime counting until `stop` is raised
pub fn burn_until(stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        black_box(count_primes(black_box(20_000)));
    }
}

/// Spawn a thread that applies `labels` and burns CPU until `stop` is raised
pub fn spawn_labeled_worker(
    name: String,
    labels: Vec<String>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(move || {
        LabelContext::background().with_labels(labels);
        burn_until(&stop);
    })
}
