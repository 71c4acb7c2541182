//! Retry policy table
//!
//! Decisions are looked up by `(OperationKind, ErrorKind)`. Defaults are
//! filled in per error kind and can be overridden per pair.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::backoff::Backoff;
use crate::config::RetrySettings;
use crate::utils::ErrorKind;

/// Closed set of KV operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Get,
    GetReplica,
    Exists,
    Touch,
    Upsert,
    Insert,
    Replace,
    Remove,
    Append,
    Prepend,
    Counter,
    Observe,
}

impl OperationKind {
    pub const ALL: [OperationKind; 12] = [
        OperationKind::Get,
        OperationKind::GetReplica,
        OperationKind::Exists,
        OperationKind::Touch,
        OperationKind::Upsert,
        OperationKind::Insert,
        OperationKind::Replace,
        OperationKind::Remove,
        OperationKind::Append,
        OperationKind::Prepend,
        OperationKind::Counter,
        OperationKind::Observe,
    ];

    /// Can the operation be applied twice without changing the outcome?
    pub fn is_idempotent(self) -> bool {
        matches!(
            self,
            OperationKind::Get
                | OperationKind::GetReplica
                | OperationKind::Exists
                | OperationKind::Observe
                | OperationKind::Touch
                | OperationKind::Upsert
        )
    }

    pub fn is_mutation(self) -> bool {
        !matches!(
            self,
            OperationKind::Get | OperationKind::GetReplica | OperationKind::Exists | OperationKind::Observe
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Get => "get",
            OperationKind::GetReplica => "get_replica",
            OperationKind::Exists => "exists",
            OperationKind::Touch => "touch",
            OperationKind::Upsert => "upsert",
            OperationKind::Insert => "insert",
            OperationKind::Replace => "replace",
            OperationKind::Remove => "remove",
            OperationKind::Append => "append",
            OperationKind::Prepend => "prepend",
            OperationKind::Counter => "counter",
            OperationKind::Observe => "observe",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRule {
    Never,
    /// Due on the next drain
    Immediate,
    /// Exponential backoff
    Backoff,
}

/// What to do with a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    NoRetry,
    Backoff(Duration),
    Immediate,
}

/// Policy table plus the backoff curve
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    overrides: HashMap<(OperationKind, ErrorKind), RetryRule>,
    backoff: Backoff,
    max_retries: Option<u32>,
    retry_uncertain: bool,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            overrides: HashMap::new(),
            backoff: Backoff::from_settings(settings),
            max_retries: settings.max_retries,
            retry_uncertain: settings.retry_uncertain_mutations,
        }
    }

    /// Rule used when no override is set
    pub fn default_rule(error: ErrorKind) -> RetryRule {
        match error {
            ErrorKind::NotMyVbucket
            | ErrorKind::NoActiveOwner
            | ErrorKind::GuessesExhausted
            | ErrorKind::NoConfig
            | ErrorKind::ConnectionRefused
            | ErrorKind::NotConnected
            | ErrorKind::SocketClosedInFlight
            | ErrorKind::TimeoutInFlight
            | ErrorKind::TemporaryFailure
            | ErrorKind::Locked
            | ErrorKind::ConfigUnavailable => RetryRule::Backoff,
            ErrorKind::AuthFailed
            | ErrorKind::KeyNotFound
            | ErrorKind::KeyExists
            | ErrorKind::Other => RetryRule::Never,
        }
    }

    /// Override the rule for one `(operation, error)` pair
    pub fn set_rule(&mut self, op: OperationKind, error: ErrorKind, rule: RetryRule) {
        self.overrides.insert((op, error), rule);
    }

    pub fn with_rule(mut self, op: OperationKind, error: ErrorKind, rule: RetryRule) -> Self {
        self.set_rule(op, error, rule);
        self
    }

    pub fn rule(&self, op: OperationKind, error: ErrorKind) -> RetryRule {
        self.overrides
            .get(&(op, error))
            .copied()
            .unwrap_or_else(|| Self::default_rule(error))
    }

    /// Is `error` still retryable for `op`, ignoring attempt counts?
    pub fn is_retryable(&self, op: OperationKind, error: ErrorKind, op_opt_in: bool) -> bool {
        if error.is_uncertain() && !op.is_idempotent() && !(op_opt_in || self.retry_uncertain) {
            return false;
        }
        self.rule(op, error) != RetryRule::Never
    }

    /// Decide what happens after attempt number `retries + 1` failed
    pub fn decide(
        &self,
        op: OperationKind,
        error: ErrorKind,
        retries: u32,
        op_opt_in: bool,
        rng: &mut fastrand::Rng,
    ) -> RetryAction {
        if !self.is_retryable(op, error, op_opt_in) {
            return RetryAction::NoRetry;
        }
        if self.max_retries.is_some_and(|max| retries >= max) {
            return RetryAction::NoRetry;
        }
        match self.rule(op, error) {
            RetryRule::Never => RetryAction::NoRetry,
            RetryRule::Immediate => RetryAction::Immediate,
            RetryRule::Backoff => RetryAction::Backoff(self.backoff.delay(retries, rng)),
        }
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }
}
