//! KV operation timings
//!
//! One latency histogram per operation kind, in microseconds.

use std::collections::BTreeMap;
use std::time::Duration;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

use crate::retry::OperationKind;

/// Highest trackable latency: one hour in microseconds
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Summary of one operation kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingSummary {
    pub operation: &'static str,
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub max_us: u64,
}

pub struct KvTimings {
    histograms: Mutex<BTreeMap<OperationKind, Histogram<u64>>>,
}

impl Default for KvTimings {
    fn default() -> Self {
        Self::new()
    }
}

impl KvTimings {
    pub fn new() -> Self {
        Self {
            histograms: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a completed operation
    #[inline]
    pub fn record(&self, op: OperationKind, latency: Duration) {
        let latency_us = (latency.as_micros() as u64).max(1);
        let mut histograms = self.histograms.lock();
        if !histograms.contains_key(&op) {
            match Histogram::new_with_bounds(1, MAX_LATENCY_US, 3) {
                Ok(h) => {
                    histograms.insert(op, h);
                }
                Err(_) => return,
            }
        }
        if let Some(h) = histograms.get_mut(&op) {
            h.saturating_record(latency_us);
        }
    }

    pub fn count(&self, op: OperationKind) -> u64 {
        self.histograms.lock().get(&op).map_or(0, |h| h.len())
    }

    pub fn total_count(&self) -> u64 {
        self.histograms.lock().values().map(|h| h.len()).sum()
    }

    /// Latency percentile in microseconds
    pub fn percentile_us(&self, op: OperationKind, p: f64) -> u64 {
        self.histograms
            .lock()
            .get(&op)
            .map_or(0, |h| h.value_at_percentile(p))
    }

    pub fn mean_us(&self, op: OperationKind) -> f64 {
        self.histograms.lock().get(&op).map_or(0.0, |h| h.mean())
    }

    /// Per-kind summaries, in operation kind order
    pub fn summary(&self) -> Vec<TimingSummary> {
        self.histograms
            .lock()
            .iter()
            .map(|(op, h)| TimingSummary {
                operation: op.as_str(),
                count: h.len(),
                mean_us: h.mean(),
                p50_us: h.value_at_percentile(50.0),
                p99_us: h.value_at_percentile(99.0),
                p999_us: h.value_at_percentile(99.9),
                max_us: h.max(),
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.summary()).unwrap_or(serde_json::Value::Null)
    }

    pub fn reset(&self) {
        self.histograms.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_summarize() {
        let timings = KvTimings::new();
        for us in 1..=100 {
            timings.record(OperationKind::Get, Duration::from_micros(us * 10));
        }
        timings.record(OperationKind::Upsert, Duration::from_millis(5));

        assert_eq!(timings.count(OperationKind::Get), 100);
        assert_eq!(timings.count(OperationKind::Remove), 0);
        assert_eq!(timings.total_count(), 101);

        let p50 = timings.percentile_us(OperationKind::Get, 50.0);
        assert!((495..=505).contains(&p50), "p50 = {}", p50);

        let summary = timings.summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].operation, "get");
        assert_eq!(summary[1].operation, "upsert");
        assert_eq!(summary[1].count, 1);

        let json = timings.to_json();
        assert_eq!(json[0]["operation"], "get");
        assert_eq!(json[0]["count"], 100);
    }

    #[test]
    fn test_sub_microsecond_and_huge_values() {
        let timings = KvTimings::new();
        timings.record(OperationKind::Exists, Duration::from_nanos(10));
        timings.record(OperationKind::Exists, Duration::from_secs(7200));
        assert_eq!(timings.count(OperationKind::Exists), 2);
        timings.reset();
        assert_eq!(timings.total_count(), 0);
    }
}
