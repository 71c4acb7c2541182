//! Operations submitted to the dispatch core

use std::fmt;
use std::time::Instant;

use crate::retry::{OperationKind, Retryable};
use crate::transport::Response;
use crate::utils::DispatchError;

/// Completion callback, invoked exactly once
pub type Completion = Box<dyn FnOnce(Result<Response, DispatchError>) + Send>;

/// A KV operation and its completion
pub struct Operation {
    pub kind: OperationKind,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    /// Read from this replica instead of the active copy
    pub replica: Option<usize>,
    retry_uncertain: bool,
    submitted: Instant,
    retries: u32,
    /// Local not-my-vbucket recoveries, bounded by `max_remap_attempts`
    remaps: u32,
    completion: Completion,
}

impl Operation {
    pub fn new<F>(kind: OperationKind, key: impl Into<Vec<u8>>, completion: F) -> Self
    where
        F: FnOnce(Result<Response, DispatchError>) + Send + 'static,
    {
        Self {
            kind,
            key: key.into(),
            payload: Vec::new(),
            replica: None,
            retry_uncertain: false,
            submitted: Instant::now(),
            retries: 0,
            remaps: 0,
            completion: Box::new(completion),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Target the `replica`-th replica copy; the kind becomes `GetReplica`
    pub fn with_replica(mut self, replica: usize) -> Self {
        self.replica = Some(replica);
        self.kind = OperationKind::GetReplica;
        self
    }

    /// Allow retries after an uncertain failure even if not idempotent
    pub fn allow_uncertain_retry(mut self) -> Self {
        self.retry_uncertain = true;
        self
    }

    pub fn submitted(&self) -> Instant {
        self.submitted
    }

    pub fn remaps(&self) -> u32 {
        self.remaps
    }

    pub(crate) fn mark_submitted(&mut self, now: Instant) {
        self.submitted = now;
        self.retries = 0;
        self.remaps = 0;
    }

    pub(crate) fn record_remap(&mut self) -> u32 {
        self.remaps += 1;
        self.remaps
    }

    /// Deliver the outcome; consumes the operation
    pub fn complete(self, result: Result<Response, DispatchError>) {
        (self.completion)(result)
    }
}

impl Retryable for Operation {
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
        self.remaps = 0;
    }

    fn retry_uncertain(&self) -> bool {
        self.retry_uncertain
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("replica", &self.replica)
            .field("retries", &self.retries)
            .field("remaps", &self.remaps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_completion_runs_once_with_result() {
        let (tx, rx) = mpsc::channel();
        let op = Operation::new(OperationKind::Get, "user::1", move |r| {
            tx.send(r).ok();
        });
        op.complete(Err(DispatchError::RequestCanceled));
        assert_eq!(rx.recv().unwrap(), Err(DispatchError::RequestCanceled));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_builders() {
        let op = Operation::new(OperationKind::Get, "k", |_| {}).with_replica(1);
        assert_eq!(op.kind, OperationKind::GetReplica);
        assert_eq!(op.replica, Some(1));

        let mut op = Operation::new(OperationKind::Counter, "c", |_| {}).allow_uncertain_retry();
        assert!(op.retry_uncertain());
        op.record_remap();
        op.record_retry();
        assert_eq!(op.retries(), 1);
        assert_eq!(op.remaps(), 0);
    }
}
