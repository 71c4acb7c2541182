//! Error types for vbucket-dispatch

use std::fmt;
use thiserror::Error;

/// Flat classification of a failure, used as the retry policy key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Node answered that it does not own the vbucket
    NotMyVbucket,
    /// Snapshot has no active owner for the vbucket
    NoActiveOwner,
    /// Every known node was tried for the vbucket in this incident
    GuessesExhausted,
    /// No topology snapshot has been applied yet
    NoConfig,
    /// Connection could not be established; the request never left
    ConnectionRefused,
    /// No connection to the target node; the request never left
    NotConnected,
    /// Socket closed while the request was in flight
    SocketClosedInFlight,
    /// Request timed out on the wire
    TimeoutInFlight,
    /// Server is temporarily unable to handle the request
    TemporaryFailure,
    /// Document is locked
    Locked,
    AuthFailed,
    KeyNotFound,
    KeyExists,
    ConfigUnavailable,
    Other,
}

impl ErrorKind {
    /// Errors caused by a stale or missing topology
    pub fn is_topology(self) -> bool {
        matches!(
            self,
            ErrorKind::NotMyVbucket
                | ErrorKind::NoActiveOwner
                | ErrorKind::GuessesExhausted
                | ErrorKind::NoConfig
        )
    }

    /// Errors after which the request may or may not have been applied
    pub fn is_uncertain(self) -> bool {
        matches!(
            self,
            ErrorKind::SocketClosedInFlight | ErrorKind::TimeoutInFlight
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotMyVbucket => "not_my_vbucket",
            ErrorKind::NoActiveOwner => "no_active_owner",
            ErrorKind::GuessesExhausted => "guesses_exhausted",
            ErrorKind::NoConfig => "no_config",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::SocketClosedInFlight => "socket_closed_in_flight",
            ErrorKind::TimeoutInFlight => "timeout_in_flight",
            ErrorKind::TemporaryFailure => "temporary_failure",
            ErrorKind::Locked => "locked",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::KeyNotFound => "key_not_found",
            ErrorKind::KeyExists => "key_exists",
            ErrorKind::ConfigUnavailable => "config_unavailable",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level dispatch error, delivered to operation callers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Node {node} does not own vbucket {vbucket}")]
    Topology { vbucket: u16, node: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No cluster configuration available: {0}")]
    ConfigUnavailable(String),

    #[error("Bootstrap failed after {attempts} attempts: {reason}")]
    BootstrapFailure { attempts: u32, reason: String },

    #[error("Operation timed out after {elapsed_ms}ms ({retries} retries, last error: {last})")]
    OperationTimeout {
        elapsed_ms: u64,
        retries: u32,
        last: ErrorKind,
    },

    #[error("Non-retryable failure: {0}")]
    NonRetryable(ErrorKind),

    #[error("Request canceled")]
    RequestCanceled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl DispatchError {
    /// Classification used by the retry policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Routing(e) => e.kind(),
            DispatchError::Topology { .. } => ErrorKind::NotMyVbucket,
            DispatchError::Transport(e) => e.kind(),
            DispatchError::ConfigUnavailable(_) => ErrorKind::ConfigUnavailable,
            DispatchError::NonRetryable(kind) => *kind,
            DispatchError::BootstrapFailure { .. }
            | DispatchError::OperationTimeout { .. }
            | DispatchError::RequestCanceled
            | DispatchError::Config(_) => ErrorKind::Other,
        }
    }

    /// Build the error surfaced to the caller for a server status
    pub fn from_kind(kind: ErrorKind, vbucket: u16, node: usize) -> Self {
        match kind {
            ErrorKind::NotMyVbucket => DispatchError::Topology { vbucket, node },
            ErrorKind::NoActiveOwner => RoutingError::NoActiveOwner { vbucket }.into(),
            ErrorKind::GuessesExhausted => RoutingError::GuessesExhausted { vbucket }.into(),
            ErrorKind::NoConfig => RoutingError::NoConfig.into(),
            ErrorKind::NotConnected | ErrorKind::ConnectionRefused => {
                TransportError::NotConnected(node).into()
            }
            ErrorKind::SocketClosedInFlight => TransportError::SocketClosed(node).into(),
            ErrorKind::TimeoutInFlight => TransportError::Timeout(node).into(),
            ErrorKind::ConfigUnavailable => {
                DispatchError::ConfigUnavailable("no source produced a configuration".into())
            }
            other => DispatchError::NonRetryable(other),
        }
    }
}

/// Key-to-node routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("vbucket {vbucket} has no active owner")]
    NoActiveOwner { vbucket: u16 },

    #[error("all known nodes tried for vbucket {vbucket}")]
    GuessesExhausted { vbucket: u16 },

    #[error("no topology snapshot applied yet")]
    NoConfig,
}

impl RoutingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RoutingError::NoActiveOwner { .. } => ErrorKind::NoActiveOwner,
            RoutingError::GuessesExhausted { .. } => ErrorKind::GuessesExhausted,
            RoutingError::NoConfig => ErrorKind::NoConfig,
        }
    }
}

/// Connection-level errors reported by the transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("No connection to node {0}")]
    NotConnected(usize),

    #[error("Connection to node {0} closed with request in flight")]
    SocketClosed(usize),

    #[error("Request to node {0} timed out")]
    Timeout(usize),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::ConnectFailed { .. } => ErrorKind::ConnectionRefused,
            TransportError::NotConnected(_) => ErrorKind::NotConnected,
            TransportError::SocketClosed(_) => ErrorKind::SocketClosedInFlight,
            TransportError::Timeout(_) => ErrorKind::TimeoutInFlight,
        }
    }
}

/// Configuration parsing errors (cluster JSON, connection strings, settings)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to parse cluster configuration: {0}")]
    Parse(String),

    #[error("Cluster configuration has no data nodes")]
    EmptyTopology,

    #[error("vbucket {vbucket} references unknown node index {index}")]
    BadNodeIndex { vbucket: usize, index: i64 },

    #[error("Invalid connection string: {0}")]
    InvalidConnectionSpec(String),

    #[error("Invalid value '{value}' for option '{key}': {reason}")]
    InvalidOption {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unknown option: {0}")]
    UnknownOption(String),
}
