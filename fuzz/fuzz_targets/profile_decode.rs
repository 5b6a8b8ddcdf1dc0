#![no_main]

use labelprof::collector::LabelAggregator;
use labelprof::profile::Profile;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Collectors decode whatever lands in their inbox; this must never panic
    if let Ok(profile) = Profile::parse(data) {
        let mut agg = LabelAggregator::new();
        agg.add_profile(&profile);
        let _ = agg.records();
    }
});
