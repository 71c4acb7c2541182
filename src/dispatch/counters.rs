//! Dispatch counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Outcome counters of one instance
///
/// Updated with relaxed ordering; readers only need eventually consistent
/// totals.
#[derive(Default)]
pub struct DispatchCounters {
    /// Operations accepted by `submit`
    pub submitted: AtomicU64,
    /// Requests handed to the transport, retries and remaps included
    pub sent: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    /// Resends to a guessed owner
    pub remapped: AtomicU64,
    /// Operations parked until the first config arrived
    pub deferred: AtomicU64,
    /// Responses that arrived after their operation was completed
    pub orphaned: AtomicU64,
}

impl DispatchCounters {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            remapped: self.remapped.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            retried: 0,
            config_revisions_applied: 0,
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub submitted: u64,
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub remapped: u64,
    pub deferred: u64,
    pub orphaned: u64,
    pub retried: u64,
    pub config_revisions_applied: u64,
}

impl DispatchStats {
    /// Operations with a delivered outcome
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}
