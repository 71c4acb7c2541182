//! Threshold logging tracer
//!
//! Keeps two bounded queues per service: orphaned spans (responses that
//! arrived after their operation was already completed) and spans slower
//! than the service threshold. Each is flushed on its own timer into one
//! JSON report per service.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use super::span::{Span, SpanPayload};
use super::span_queue::ThresholdSpanQueue;
use crate::cluster::ServiceType;
use crate::config::TracerSettings;

/// Which queue a report came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Orphans,
    Threshold,
}

impl ReportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportKind::Orphans => "orphaned responses",
            ReportKind::Threshold => "operations over threshold",
        }
    }
}

/// One flushed report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryReport {
    #[serde(skip)]
    pub kind: ReportKind,
    pub service: &'static str,
    /// Spans offered since the previous flush
    pub count: u64,
    /// Longest retained spans, longest first
    pub top: Vec<SpanPayload>,
}

impl TelemetryReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Destination of flushed reports
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, report: &TelemetryReport);
}

/// Where a finished span went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanVerdict {
    Orphan,
    OverThreshold,
    Ignored,
}

type QueueSet = BTreeMap<ServiceType, ThresholdSpanQueue>;

pub struct ThresholdTracer {
    settings: TracerSettings,
    orphans: Mutex<QueueSet>,
    threshold: Mutex<QueueSet>,
    sink: Option<Arc<dyn TelemetrySink>>,
    orphans_seen: AtomicU64,
    slow_seen: AtomicU64,
}

impl ThresholdTracer {
    pub fn new(settings: TracerSettings) -> Self {
        Self {
            settings,
            orphans: Mutex::new(BTreeMap::new()),
            threshold: Mutex::new(BTreeMap::new()),
            sink: None,
            orphans_seen: AtomicU64::new(0),
            slow_seen: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn orphan_flush_interval(&self) -> Duration {
        self.settings.orphan_flush_interval
    }

    pub fn threshold_flush_interval(&self) -> Duration {
        self.settings.threshold_flush_interval
    }

    /// Route a finished span to the queue it belongs in
    pub fn finish_span(&self, span: &Span) -> SpanVerdict {
        if span.orphaned {
            self.orphans_seen.fetch_add(1, Ordering::Relaxed);
            let capacity = self.settings.orphan_queue_size;
            self.orphans
                .lock()
                .entry(span.service)
                .or_insert_with(|| ThresholdSpanQueue::new(capacity))
                .push(span.report());
            return SpanVerdict::Orphan;
        }
        if span.duration > self.settings.threshold_for(span.service) {
            self.slow_seen.fetch_add(1, Ordering::Relaxed);
            let capacity = self.settings.threshold_queue_size;
            self.threshold
                .lock()
                .entry(span.service)
                .or_insert_with(|| ThresholdSpanQueue::new(capacity))
                .push(span.report());
            return SpanVerdict::OverThreshold;
        }
        SpanVerdict::Ignored
    }

    pub fn flush_orphans(&self) -> Vec<TelemetryReport> {
        self.flush(&self.orphans, ReportKind::Orphans)
    }

    pub fn flush_threshold(&self) -> Vec<TelemetryReport> {
        self.flush(&self.threshold, ReportKind::Threshold)
    }

    fn flush(&self, queues: &Mutex<QueueSet>, kind: ReportKind) -> Vec<TelemetryReport> {
        let reports: Vec<TelemetryReport> = {
            let mut queues = queues.lock();
            queues
                .iter_mut()
                .filter(|(_, q)| !q.is_empty())
                .map(|(service, q)| {
                    let count = q.seen();
                    TelemetryReport {
                        kind,
                        service: service.as_str(),
                        count,
                        top: q.flush().into_iter().map(|s| s.payload).collect(),
                    }
                })
                .collect()
        };

        for report in &reports {
            warn!("{}: {}", kind.as_str(), report.to_json());
            if let Some(sink) = &self.sink {
                sink.emit(report);
            }
        }
        reports
    }

    pub fn orphans_seen(&self) -> u64 {
        self.orphans_seen.load(Ordering::Relaxed)
    }

    pub fn slow_seen(&self) -> u64 {
        self.slow_seen.load(Ordering::Relaxed)
    }
}
