//! Transport collaborator interface
//!
//! The dispatch core never touches sockets or clocks. It hands requests,
//! connection attempts and timer registrations to a `Transport`, and the
//! owner of the transport feeds completions back through the `Instance`
//! event methods (`handle_response`, `on_connection_up`, `on_timer`, ...).
//!
//! The wire encoding of requests and responses is the transport's business;
//! here they are plain structs.

pub mod loopback;

use std::time::Duration;

use crate::cluster::NodeDescriptor;
use crate::config::SeedHost;
use crate::retry::OperationKind;
use crate::utils::{ErrorKind, TransportError};

pub use loopback::LoopbackTransport;

/// Request correlation id
pub type Opaque = u32;

/// Periodic work the instance asks the transport to schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Drain the retry queue, expire timeouts, advance bootstrap deadlines
    RetryTick,
    OrphanFlush,
    ThresholdFlush,
    ConfigPoll,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::RetryTick,
        TimerKind::OrphanFlush,
        TimerKind::ThresholdFlush,
        TimerKind::ConfigPoll,
    ];
}

/// Handle of a scheduled one-shot timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

/// Outgoing KV request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opaque: Opaque,
    pub kind: OperationKind,
    pub key: Vec<u8>,
    pub vbucket: u16,
    pub payload: Vec<u8>,
}

/// Server status of a KV response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    NotMyVbucket,
    KeyNotFound,
    KeyExists,
    TemporaryFailure,
    Busy,
    Locked,
    AuthError,
    Internal,
}

impl ResponseStatus {
    /// Failure classification; `None` for success
    pub fn error_kind(self) -> Option<ErrorKind> {
        match self {
            ResponseStatus::Success => None,
            ResponseStatus::NotMyVbucket => Some(ErrorKind::NotMyVbucket),
            ResponseStatus::KeyNotFound => Some(ErrorKind::KeyNotFound),
            ResponseStatus::KeyExists => Some(ErrorKind::KeyExists),
            ResponseStatus::TemporaryFailure | ResponseStatus::Busy => {
                Some(ErrorKind::TemporaryFailure)
            }
            ResponseStatus::Locked => Some(ErrorKind::Locked),
            ResponseStatus::AuthError => Some(ErrorKind::AuthFailed),
            ResponseStatus::Internal => Some(ErrorKind::Other),
        }
    }
}

/// Incoming KV response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: ResponseStatus,
    pub payload: Vec<u8>,
    /// Configuration document attached to a not-my-vbucket reply
    pub config: Option<String>,
    /// Server-side processing time
    pub server_duration: Option<Duration>,
}

impl Response {
    pub fn success(payload: Vec<u8>) -> Self {
        Self {
            status: ResponseStatus::Success,
            payload,
            config: None,
            server_duration: None,
        }
    }

    pub fn status(status: ResponseStatus) -> Self {
        Self {
            status,
            payload: Vec::new(),
            config: None,
            server_duration: None,
        }
    }

    pub fn not_my_vbucket(config: Option<String>) -> Self {
        Self {
            config,
            ..Self::status(ResponseStatus::NotMyVbucket)
        }
    }

    pub fn with_server_duration(mut self, duration: Duration) -> Self {
        self.server_duration = Some(duration);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// I/O substrate used by the dispatch core
pub trait Transport: Send + Sync {
    /// Queue `request` for `node`
    ///
    /// An error means the request never left (no connection to the node).
    fn send(&self, node_index: usize, node: &NodeDescriptor, request: Request) -> Result<(), TransportError>;

    /// Start connecting to a bootstrap seed
    fn connect(&self, seed: &SeedHost);

    /// Fire `kind` once after `after`
    fn schedule_timer(&self, after: Duration, kind: TimerKind) -> TimerHandle;

    fn cancel_timer(&self, handle: TimerHandle);
}
