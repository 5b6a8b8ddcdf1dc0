//! Property-based tests for the pure parts of the profiler
//!
//! Core properties covered:
//! 1. Snapshot buffer capacity rule
//! 2. Per-label reduction of labeled samples
//! 3. Label-set derivation (dedupe, interning)
//! 4. Snapshot decoding never panics on arbitrary bytes

use labelprof::arbiter::next_capacity;
use labelprof::collector::LabelAggregator;
use labelprof::labels::{LabelContext, LABEL_KEY};
use labelprof::profile::{Profile, Sample};
use proptest::prelude::*;
use std::collections::BTreeMap;

const POOL: [&str; 4] = ["rule1", "rule2", "rule3", "rule4"];

fn label_subset() -> impl Strategy<Value = Vec<String>> {
    prop::sample::subsequence(POOL.to_vec(), 0..=POOL.len())
        .prop_map(|labels| labels.into_iter().map(String::from).collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_next_capacity_is_next_block_multiple(
        last in 0usize..1_000_000,
        block in 1usize..65_536,
    ) {
        let cap = next_capacity(last, block);
        prop_assert!(cap > last);
        prop_assert_eq!(cap % block, 0);
        prop_assert!(cap - last <= block);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_reduction_matches_naive_sum(
        samples in prop::collection::vec((label_subset(), 0i64..50_000_000), 0..40),
    ) {
        let mut profile = Profile::cpu(10_000_000);
        for (labels, cpu) in &samples {
            let mut map = BTreeMap::new();
            if !labels.is_empty() {
                map.insert(LABEL_KEY.to_string(), labels.clone());
            }
            profile.samples.push(Sample {
                stack: Vec::new(),
                values: vec![1, *cpu],
                labels: map,
            });
        }

        let mut agg = LabelAggregator::new();
        agg.add_profile(&profile);

        for label in POOL {
            let expected: i64 = samples
                .iter()
                .filter(|(labels, _)| labels.iter().any(|l| l == label))
                .map(|(_, cpu)| *cpu)
                .sum();
            prop_assert_eq!(agg.total_ns(label), expected as u64);
        }

        let records = agg.records();
        prop_assert!(records.windows(2).all(|w| w[0].label < w[1].label));
        for record in &records {
            prop_assert_eq!(record.cpu_time_ms, agg.total_ns(&record.label) / 1_000_000);
        }
    }

    #[test]
    fn prop_reduction_is_additive_across_profiles(
        first in prop::collection::vec((label_subset(), 1i64..1_000_000), 0..20),
        second in prop::collection::vec((label_subset(), 1i64..1_000_000), 0..20),
    ) {
        let mut combined = LabelAggregator::new();
        let mut split_a = LabelAggregator::new();
        let mut split_b = LabelAggregator::new();
        for (labels, cpu) in &first {
            combined.add_sample(labels, *cpu);
            split_a.add_sample(labels, *cpu);
        }
        for (labels, cpu) in &second {
            combined.add_sample(labels, *cpu);
            split_b.add_sample(labels, *cpu);
        }
        for label in POOL {
            prop_assert_eq!(
                combined.total_ns(label),
                split_a.total_ns(label) + split_b.total_ns(label)
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_label_sets_are_deduplicated_and_interned(
        labels in prop::collection::vec("[a-z]{1,6}", 1..8),
    ) {
        let ctx = LabelContext::background().scope(|| {
            LabelContext::background().with_labels(labels.clone())
        });

        let mut unique: Vec<String> = Vec::new();
        for label in &labels {
            if !unique.contains(label) {
                unique.push(label.clone());
            }
        }
        prop_assert_eq!(ctx.labels(), unique.as_slice());

        let again = LabelContext::background().scope(|| {
            LabelContext::background().with_labels(unique.clone())
        });
        prop_assert_eq!(ctx.id(), again.id());
        prop_assert!(LabelContext::current().is_empty());
    }

    #[test]
    fn prop_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Profile::parse(&data);
    }
}
