//! Ready-made [`CpuTimeSink`] implementations
//!
//! - [`PercentageSink`]: human-readable share of CPU time per label
//! - [`JsonLinesSink`]: one JSON array of records per update

use crate::collector::{CpuTimeRecord, CpuTimeSink};
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Mutex;

/// Keeps the latest totals and prints each label's share, largest first
pub struct PercentageSink {
    out: Mutex<Box<dyn Write + Send>>,
    totals: Mutex<BTreeMap<String, u64>>,
}

impl PercentageSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            totals: Mutex::new(BTreeMap::new()),
        }
    }

    /// Latest totals, largest first, ties broken by label
    pub fn ranked(&self) -> Vec<(String, u64)> {
        let totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        let mut ranked: Vec<(String, u64)> =
            totals.iter().map(|(l, ms)| (l.clone(), *ms)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }

    /// Render the current table
    pub fn render(&self) -> String {
        let ranked = self.ranked();
        let total: u64 = ranked.iter().map(|(_, ms)| ms).sum();

        let mut report = String::from("Current CPU Usage by Label:\n");
        if total == 0 {
            report.push_str("No CPU time recorded\n");
            return report;
        }
        for (label, ms) in &ranked {
            let pct = *ms as f64 / total as f64 * 100.0;
            report.push_str(&format!(
                "Label: {label}, CPU Time: {ms} ms, Percentage: {pct:.2}%\n"
            ));
        }
        report
    }
}

impl CpuTimeSink for PercentageSink {
    fn collect(&self, records: &[CpuTimeRecord]) {
        {
            let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
            // Collector totals are cumulative, so the newest value replaces the old one
            for record in records {
                totals.insert(record.label.clone(), record.cpu_time_ms);
            }
        }
        let report = self.render();
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{report}").and_then(|_| out.flush()) {
            tracing::warn!(error = %e, "failed to write cpu usage report");
        }
    }
}

/// Writes each update as a single JSON line
pub struct JsonLinesSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

impl CpuTimeSink for JsonLinesSink {
    fn collect(&self, records: &[CpuTimeRecord]) {
        let line = match serde_json::to_string(records) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize cpu time records");
                return;
            }
        };
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            tracing::warn!(error = %e, "failed to write cpu time records");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Write target the test can read back
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn record(label: &str, ms: u64) -> CpuTimeRecord {
        CpuTimeRecord {
            label: label.into(),
            cpu_time_ms: ms,
        }
    }

    #[test]
    fn test_percentage_sink_ranks_descending() {
        let buf = SharedBuf::default();
        let sink = PercentageSink::new(Box::new(buf.clone()));
        sink.collect(&[record("a", 25), record("b", 75)]);

        let out = buf.contents();
        let b_pos = out.find("Label: b, CPU Time: 75 ms, Percentage: 75.00%").unwrap();
        let a_pos = out.find("Label: a, CPU Time: 25 ms, Percentage: 25.00%").unwrap();
        assert!(b_pos < a_pos);
    }

    #[test]
    fn test_percentage_sink_replaces_cumulative_totals() {
        let sink = PercentageSink::new(Box::new(io::sink()));
        sink.collect(&[record("a", 10)]);
        sink.collect(&[record("a", 30), record("b", 10)]);
        assert_eq!(
            sink.ranked(),
            vec![("a".to_string(), 30), ("b".to_string(), 10)]
        );
    }

    #[test]
    fn test_percentage_sink_reports_nothing_recorded() {
        let buf = SharedBuf::default();
        let sink = PercentageSink::new(Box::new(buf.clone()));
        sink.collect(&[]);
        sink.collect(&[record("idle", 0)]);
        assert_eq!(buf.contents().matches("No CPU time recorded").count(), 2);
    }

    #[test]
    fn test_json_lines_sink_writes_one_line_per_update() {
        let buf = SharedBuf::default();
        let sink = JsonLinesSink::new(Box::new(buf.clone()));
        sink.collect(&[record("rule1", 12)]);
        sink.collect(&[record("rule1", 20), record("rule2", 3)]);

        let out = buf.contents();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Vec<CpuTimeRecord> = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed, vec![record("rule1", 20), record("rule2", 3)]);
        assert!(lines[0].contains("\"cpu_time_ms\":12"));
    }
}
