//! Latency telemetry
//!
//! - Bounded span queues that keep the longest spans
//! - Threshold tracer flushing orphan and slow-operation reports
//! - Per-operation KV latency histograms

pub mod span;
pub mod span_queue;
pub mod threshold_tracer;
pub mod timings;

pub use span::{ReportedSpan, Span, SpanPayload};
pub use span_queue::ThresholdSpanQueue;
pub use threshold_tracer::{ReportKind, SpanVerdict, TelemetryReport, TelemetrySink, ThresholdTracer};
pub use timings::{KvTimings, TimingSummary};
