//! Timing spans

use std::cmp::Ordering;
use std::time::Duration;

use serde::Serialize;

use crate::cluster::ServiceType;

/// A finished operation timing
#[derive(Debug, Clone)]
pub struct Span {
    pub service: ServiceType,
    pub operation_name: String,
    pub operation_id: Option<String>,
    pub remote_address: Option<String>,
    pub local_id: Option<String>,
    pub duration: Duration,
    /// Server-reported processing time, when the response carried one
    pub server_duration: Option<Duration>,
    /// The response arrived after the operation was already completed
    pub orphaned: bool,
}

impl Span {
    pub fn new(service: ServiceType, operation_name: impl Into<String>, duration: Duration) -> Self {
        Self {
            service,
            operation_name: operation_name.into(),
            operation_id: None,
            remote_address: None,
            local_id: None,
            duration,
            server_duration: None,
            orphaned: false,
        }
    }

    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn with_remote(mut self, address: impl Into<String>) -> Self {
        self.remote_address = Some(address.into());
        self
    }

    pub fn with_local_id(mut self, id: impl Into<String>) -> Self {
        self.local_id = Some(id.into());
        self
    }

    pub fn with_server_duration(mut self, duration: Duration) -> Self {
        self.server_duration = Some(duration);
        self
    }

    pub fn orphaned(mut self) -> Self {
        self.orphaned = true;
        self
    }

    /// Freeze into the form kept by the span queues
    pub fn report(&self) -> ReportedSpan {
        ReportedSpan {
            duration: self.duration,
            payload: SpanPayload {
                operation_name: self.operation_name.clone(),
                last_operation_id: self.operation_id.clone(),
                last_remote_address: self.remote_address.clone(),
                last_local_id: self.local_id.clone(),
                total_us: self.duration.as_micros() as u64,
                server_us: self.server_duration.map(|d| d.as_micros() as u64),
            },
        }
    }
}

/// Report entry of one span
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpanPayload {
    pub operation_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_remote_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_local_id: Option<String>,
    pub total_us: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_us: Option<u64>,
}

/// Immutable `(duration, payload)` pair, ordered by duration only
#[derive(Debug, Clone)]
pub struct ReportedSpan {
    pub duration: Duration,
    pub payload: SpanPayload,
}

impl ReportedSpan {
    pub fn new(duration: Duration, payload: SpanPayload) -> Self {
        Self { duration, payload }
    }
}

impl PartialEq for ReportedSpan {
    fn eq(&self, other: &Self) -> bool {
        self.duration == other.duration
    }
}

impl Eq for ReportedSpan {}

impl PartialOrd for ReportedSpan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReportedSpan {
    fn cmp(&self, other: &Self) -> Ordering {
        self.duration.cmp(&other.duration)
    }
}
