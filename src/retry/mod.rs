//! Retry scheduling
//!
//! - Policy table keyed by operation kind and error kind
//! - Exponential backoff with jitter
//! - Deadline-ordered retry queue

pub mod backoff;
pub mod policy;
pub mod queue;

pub use backoff::Backoff;
pub use policy::{OperationKind, RetryAction, RetryPolicy, RetryRule};
pub use queue::{Drained, Rejected, RetryId, RetryQueue, Retryable};
