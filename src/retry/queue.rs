//! Deadline-ordered retry queue
//!
//! Failed operations wait here until their backoff elapses, then come back
//! out of `drain` in deadline order (ties by enqueue order) to be routed
//! again. Every operation leaves the queue exactly once: drained for
//! resubmission, handed back with its terminal error, or cancelled.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::policy::{OperationKind, RetryAction, RetryPolicy};
use crate::cluster::{ConfigEvent, ConfigListener};
use crate::config::RetrySettings;
use crate::utils::{DispatchError, ErrorKind};

/// Operation handle the queue can schedule
pub trait Retryable: Send {
    fn kind(&self) -> OperationKind;

    /// When the caller first submitted the operation
    fn submitted_at(&self) -> Instant;

    /// Retries performed so far
    fn retries(&self) -> u32;

    /// Called when the operation leaves the queue for another attempt
    fn record_retry(&mut self);

    /// Per-operation opt-in to retrying after an uncertain failure
    fn retry_uncertain(&self) -> bool {
        false
    }
}

/// Queue entry id, stable while the operation is queued
pub type RetryId = u64;

struct PendingOperation<T> {
    op: T,
    last_error: DispatchError,
    enqueued_at: Instant,
    deadline: Instant,
    expiry: Instant,
}

struct QueueState<T> {
    entries: HashMap<RetryId, PendingOperation<T>>,
    by_deadline: BTreeSet<(Instant, RetryId)>,
    by_expiry: BTreeSet<(Instant, RetryId)>,
    policy: RetryPolicy,
    rng: fastrand::Rng,
    next_seq: RetryId,
}

impl<T> QueueState<T> {
    fn insert(&mut self, entry: PendingOperation<T>) -> RetryId {
        let id = self.next_seq;
        self.next_seq += 1;
        self.by_deadline.insert((entry.deadline, id));
        self.by_expiry.insert((entry.expiry, id));
        self.entries.insert(id, entry);
        id
    }

    fn remove(&mut self, id: RetryId) -> Option<PendingOperation<T>> {
        let entry = self.entries.remove(&id)?;
        self.by_deadline.remove(&(entry.deadline, id));
        self.by_expiry.remove(&(entry.expiry, id));
        Some(entry)
    }

    fn reschedule(&mut self, id: RetryId, deadline: Instant) {
        if let Some(entry) = self.entries.get_mut(&id) {
            self.by_deadline.remove(&(entry.deadline, id));
            entry.deadline = deadline;
            self.by_deadline.insert((deadline, id));
        }
    }
}

/// Operation rejected by the queue, with the error to complete it with
pub struct Rejected<T> {
    pub op: T,
    pub error: DispatchError,
}

/// Result of one drain pass
pub struct Drained<T> {
    /// Due for another attempt, in deadline order
    pub ready: Vec<T>,
    /// Expired or otherwise terminal
    pub failed: Vec<Rejected<T>>,
}

impl<T> Default for Drained<T> {
    fn default() -> Self {
        Self {
            ready: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Retry queue
pub struct RetryQueue<T> {
    state: Mutex<QueueState<T>>,
    operation_timeout: Duration,
    retried: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

impl<T: Retryable> RetryQueue<T> {
    pub fn new(settings: &RetrySettings, operation_timeout: Duration, seed: u64) -> Self {
        Self::with_policy(RetryPolicy::new(settings), operation_timeout, seed)
    }

    pub fn with_policy(policy: RetryPolicy, operation_timeout: Duration, seed: u64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: HashMap::new(),
                by_deadline: BTreeSet::new(),
                by_expiry: BTreeSet::new(),
                policy,
                rng: fastrand::Rng::with_seed(seed),
                next_seq: 0,
            }),
            operation_timeout,
            retried: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Queue `op` after it failed with `error`
    ///
    /// Returns the operation back with its terminal error when the policy
    /// says no, or when its time budget is already spent.
    pub fn enqueue(&self, op: T, error: DispatchError, now: Instant) -> Result<RetryId, Rejected<T>> {
        let expiry = op.submitted_at() + self.operation_timeout;
        if now >= expiry {
            self.timed_out.fetch_add(1, Ordering::Relaxed);
            let error = self.timeout_error(&op, error.kind(), now);
            return Err(Rejected { op, error });
        }

        let mut state = self.state.lock();
        let QueueState { policy, rng, .. } = &mut *state;
        let action = policy.decide(op.kind(), error.kind(), op.retries(), op.retry_uncertain(), rng);
        let deadline = match action {
            RetryAction::NoRetry => {
                drop(state);
                self.rejected.fetch_add(1, Ordering::Relaxed);
                debug!("Not retrying {} after {}", op.kind(), error.kind());
                return Err(Rejected { op, error });
            }
            RetryAction::Immediate => now,
            RetryAction::Backoff(delay) => (now + delay).min(expiry),
        };

        debug!(
            "Retrying {} (attempt {}) in {:?} after {}",
            op.kind(),
            op.retries() + 1,
            deadline - now,
            error.kind()
        );
        Ok(state.insert(PendingOperation {
            op,
            last_error: error,
            enqueued_at: now,
            deadline,
            expiry,
        }))
    }

    /// Pop everything due at `now`
    ///
    /// Entries whose time budget ran out are failed with
    /// `OperationTimeout` and never handed out for another attempt.
    pub fn drain(&self, now: Instant) -> Drained<T> {
        let mut drained = Drained::default();
        let mut state = self.state.lock();

        let expired: Vec<RetryId> = state
            .by_expiry
            .iter()
            .take_while(|(expiry, _)| *expiry <= now)
            .map(|&(_, id)| id)
            .collect();
        for id in expired {
            if let Some(entry) = state.remove(id) {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                let error = self.timeout_error(&entry.op, entry.last_error.kind(), now);
                drained.failed.push(Rejected { op: entry.op, error });
            }
        }

        let due: Vec<RetryId> = state
            .by_deadline
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|&(_, id)| id)
            .collect();
        for id in due {
            if let Some(mut entry) = state.remove(id) {
                entry.op.record_retry();
                drained.ready.push(entry.op);
            }
        }
        drop(state);

        if !drained.failed.is_empty() {
            warn!("{} queued operations timed out", drained.failed.len());
        }
        self.retried.fetch_add(drained.ready.len() as u64, Ordering::Relaxed);
        drained
    }

    /// Replace the error a queued operation is waiting on
    ///
    /// If the new error is not retryable the entry is removed and returned
    /// for completion; otherwise its schedule is left alone.
    pub fn reclassify(&self, id: RetryId, error: DispatchError) -> Option<Rejected<T>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let entry = state.entries.get_mut(&id)?;
        if state_is_retryable(&state.policy, &entry.op, error.kind()) {
            entry.last_error = error;
            return None;
        }
        let entry = state.remove(id)?;
        drop(guard);
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Some(Rejected { op: entry.op, error })
    }

    /// Swap the policy and re-evaluate every queued entry
    pub fn set_policy(&self, policy: RetryPolicy) -> Vec<Rejected<T>> {
        let mut state = self.state.lock();
        state.policy = policy;
        let doomed: Vec<RetryId> = state
            .entries
            .iter()
            .filter(|(_, e)| !state_is_retryable(&state.policy, &e.op, e.last_error.kind()))
            .map(|(&id, _)| id)
            .collect();
        let mut rejected: Vec<(RetryId, Rejected<T>)> = doomed
            .into_iter()
            .filter_map(|id| {
                state.remove(id).map(|e| {
                    (
                        id,
                        Rejected {
                            op: e.op,
                            error: e.last_error,
                        },
                    )
                })
            })
            .collect();
        drop(state);
        rejected.sort_by_key(|(id, _)| *id);
        self.rejected.fetch_add(rejected.len() as u64, Ordering::Relaxed);
        rejected.into_iter().map(|(_, r)| r).collect()
    }

    /// Make every operation waiting on a topology error due immediately
    pub fn wake_topology_waiters(&self) -> usize {
        let mut state = self.state.lock();
        let waiting: Vec<(RetryId, Instant)> = state
            .entries
            .iter()
            .filter(|(_, e)| e.last_error.kind().is_topology() && e.deadline > e.enqueued_at)
            .map(|(&id, e)| (id, e.enqueued_at))
            .collect();
        for &(id, enqueued_at) in &waiting {
            state.reschedule(id, enqueued_at);
        }
        if !waiting.is_empty() {
            debug!("New topology: {} queued operations due now", waiting.len());
        }
        waiting.len()
    }

    /// Remove every entry, in enqueue order
    pub fn cancel_all(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let mut ids: Vec<RetryId> = state.entries.keys().copied().collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| state.remove(id).map(|e| e.op))
            .collect()
    }

    /// Earliest deadline or expiry still pending
    pub fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        let deadline = state.by_deadline.first().map(|&(d, _)| d);
        let expiry = state.by_expiry.first().map(|&(e, _)| e);
        deadline.into_iter().chain(expiry).min()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retried_count(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn timed_out_count(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn timeout_error(&self, op: &T, last: ErrorKind, now: Instant) -> DispatchError {
        DispatchError::OperationTimeout {
            elapsed_ms: now.saturating_duration_since(op.submitted_at()).as_millis() as u64,
            retries: op.retries(),
            last,
        }
    }
}

fn state_is_retryable<T: Retryable>(policy: &RetryPolicy, op: &T, error: ErrorKind) -> bool {
    policy.is_retryable(op.kind(), error, op.retry_uncertain())
}

impl<T: Retryable> ConfigListener for RetryQueue<T> {
    fn on_config_event(&self, event: &ConfigEvent) {
        if let ConfigEvent::Applied { .. } = event {
            self.wake_topology_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::policy::RetryRule;
    use crate::utils::{RoutingError, TransportError};

    struct TestOp {
        name: &'static str,
        kind: OperationKind,
        submitted: Instant,
        retries: u32,
    }

    impl TestOp {
        fn new(name: &'static str, kind: OperationKind, submitted: Instant) -> Self {
            Self {
                name,
                kind,
                submitted,
                retries: 0,
            }
        }
    }

    impl Retryable for TestOp {
        fn kind(&self) -> OperationKind {
            self.kind
        }

        fn submitted_at(&self) -> Instant {
            self.submitted
        }

        fn retries(&self) -> u32 {
            self.retries
        }

        fn record_retry(&mut self) {
            self.retries += 1;
        }
    }

    fn settings() -> RetrySettings {
        RetrySettings {
            jitter: false,
            ..RetrySettings::default()
        }
    }

    fn queue() -> RetryQueue<TestOp> {
        RetryQueue::new(&settings(), Duration::from_millis(2500), 1)
    }

    fn not_connected() -> DispatchError {
        TransportError::NotConnected(0).into()
    }

    fn names(ops: &[TestOp]) -> Vec<&'static str> {
        ops.iter().map(|o| o.name).collect()
    }

    #[test]
    fn test_never_dispatched_early() {
        let q = queue();
        let t0 = Instant::now();
        q.enqueue(TestOp::new("a", OperationKind::Get, t0), not_connected(), t0)
            .ok()
            .unwrap();

        assert!(q.drain(t0 + Duration::from_millis(9)).ready.is_empty());
        let drained = q.drain(t0 + Duration::from_millis(10));
        assert_eq!(names(&drained.ready), vec!["a"]);
        assert_eq!(drained.ready[0].retries, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn test_drain_in_deadline_then_enqueue_order() {
        let q = queue();
        let t0 = Instant::now();
        let mut late = TestOp::new("late", OperationKind::Get, t0);
        late.retries = 2; // 40ms backoff
        q.enqueue(late, not_connected(), t0).ok().unwrap();
        q.enqueue(TestOp::new("first", OperationKind::Get, t0), not_connected(), t0)
            .ok()
            .unwrap();
        q.enqueue(TestOp::new("second", OperationKind::Upsert, t0), not_connected(), t0)
            .ok()
            .unwrap();

        let drained = q.drain(t0 + Duration::from_millis(50));
        assert_eq!(names(&drained.ready), vec!["first", "second", "late"]);
    }

    #[test]
    fn test_no_retry_returns_operation() {
        let q = queue();
        let t0 = Instant::now();
        let rejected = q
            .enqueue(
                TestOp::new("a", OperationKind::Get, t0),
                DispatchError::NonRetryable(ErrorKind::KeyNotFound),
                t0,
            )
            .err()
            .unwrap();
        assert_eq!(rejected.op.name, "a");
        assert_eq!(rejected.error, DispatchError::NonRetryable(ErrorKind::KeyNotFound));
        assert!(q.is_empty());
        assert_eq!(q.rejected_count(), 1);
    }

    #[test]
    fn test_uncertain_mutation_not_retried() {
        let q = queue();
        let t0 = Instant::now();
        let err: DispatchError = TransportError::SocketClosed(1).into();
        assert!(q
            .enqueue(TestOp::new("incr", OperationKind::Counter, t0), err.clone(), t0)
            .is_err());
        assert!(q.enqueue(TestOp::new("get", OperationKind::Get, t0), err, t0).is_ok());
    }

    #[test]
    fn test_timeout_fails_exactly_once() {
        let q = queue();
        let t0 = Instant::now();
        q.enqueue(TestOp::new("a", OperationKind::Get, t0), not_connected(), t0 + Duration::from_millis(2495))
            .ok()
            .unwrap();

        // backoff would land past the timeout; the entry expires instead
        let drained = q.drain(t0 + Duration::from_millis(2500));
        assert!(drained.ready.is_empty());
        assert_eq!(drained.failed.len(), 1);
        assert!(matches!(
            drained.failed[0].error,
            DispatchError::OperationTimeout {
                elapsed_ms: 2500,
                retries: 0,
                last: ErrorKind::NotConnected
            }
        ));
        assert!(q.is_empty());
        assert!(q.drain(t0 + Duration::from_secs(10)).failed.is_empty());

        // already past the budget at enqueue time
        let late = q.enqueue(TestOp::new("b", OperationKind::Get, t0), not_connected(), t0 + Duration::from_secs(3));
        assert!(matches!(
            late.err().unwrap().error,
            DispatchError::OperationTimeout { .. }
        ));
        assert_eq!(q.timed_out_count(), 2);
    }

    #[test]
    fn test_max_retries() {
        let settings = RetrySettings {
            max_retries: Some(1),
            ..settings()
        };
        let q: RetryQueue<TestOp> = RetryQueue::new(&settings, Duration::from_secs(10), 1);
        let t0 = Instant::now();
        q.enqueue(TestOp::new("a", OperationKind::Get, t0), not_connected(), t0)
            .ok()
            .unwrap();
        let op = q.drain(t0 + Duration::from_secs(1)).ready.pop().unwrap();
        assert_eq!(op.retries, 1);
        assert!(q.enqueue(op, not_connected(), t0 + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_reclassify() {
        let q = queue();
        let t0 = Instant::now();
        let id = q
            .enqueue(TestOp::new("a", OperationKind::Get, t0), not_connected(), t0)
            .ok()
            .unwrap();

        assert!(q.reclassify(id, TransportError::Timeout(0).into()).is_none());
        assert_eq!(q.len(), 1);

        let rejected = q
            .reclassify(id, DispatchError::NonRetryable(ErrorKind::AuthFailed))
            .unwrap();
        assert_eq!(rejected.op.name, "a");
        assert!(q.is_empty());
        assert!(q.reclassify(id, not_connected()).is_none());
    }

    #[test]
    fn test_set_policy_reevaluates() {
        let q = queue();
        let t0 = Instant::now();
        q.enqueue(TestOp::new("get", OperationKind::Get, t0), not_connected(), t0)
            .ok()
            .unwrap();
        q.enqueue(TestOp::new("set", OperationKind::Upsert, t0), not_connected(), t0)
            .ok()
            .unwrap();

        let policy = RetryPolicy::new(&settings()).with_rule(
            OperationKind::Upsert,
            ErrorKind::NotConnected,
            RetryRule::Never,
        );
        let rejected = q.set_policy(policy);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].op.name, "set");
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_topology_waiters_woken_by_new_config() {
        let q = queue();
        let t0 = Instant::now();
        let mut slow = TestOp::new("nmvb", OperationKind::Get, t0);
        slow.retries = 4; // 160ms backoff
        q.enqueue(slow, RoutingError::NoActiveOwner { vbucket: 3 }.into(), t0)
            .ok()
            .unwrap();
        let mut other = TestOp::new("conn", OperationKind::Get, t0);
        other.retries = 4;
        q.enqueue(other, not_connected(), t0).ok().unwrap();

        let snap = crate::cluster::TopologySnapshot::uniform(2, 4, 0, crate::cluster::Revision::new(0, 1)).unwrap();
        q.on_config_event(&ConfigEvent::Applied {
            old: None,
            new: std::sync::Arc::new(snap),
        });

        let drained = q.drain(t0 + Duration::from_millis(1));
        assert_eq!(names(&drained.ready), vec!["nmvb"]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_cancel_all() {
        let q = queue();
        let t0 = Instant::now();
        for name in ["a", "b", "c"] {
            q.enqueue(TestOp::new(name, OperationKind::Get, t0), not_connected(), t0)
                .ok()
                .unwrap();
        }
        assert_eq!(names(&q.cancel_all()), vec!["a", "b", "c"]);
        assert!(q.is_empty());
        assert_eq!(q.next_deadline(), None);
    }
}
