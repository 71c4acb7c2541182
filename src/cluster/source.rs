//! Configuration sources
//!
//! A source produces candidate snapshots on request. Fetching never blocks:
//! a source either answers right away (`FetchStart::Ready`) or later through
//! `ConfigMonitor::complete_fetch`.

use parking_lot::RwLock;

use super::config_monitor::RefreshReason;
use super::topology::TopologySnapshot;
use crate::utils::DispatchError;

/// Index of a source registered with the monitor
pub type SourceId = usize;

/// Where a source gets its configuration from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Fetched over an established data connection
    Cccp,
    /// Fetched from the management REST endpoint
    Http,
    /// Provided by the application
    Static,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Cccp => "cccp",
            SourceKind::Http => "http",
            SourceKind::Static => "static",
        }
    }
}

/// Result of starting a fetch
#[derive(Debug)]
pub enum FetchStart {
    /// The source answered synchronously
    Ready(Result<TopologySnapshot, DispatchError>),
    /// The answer arrives through `ConfigMonitor::complete_fetch`
    Pending,
}

/// Provider of candidate topology snapshots
pub trait ConfigSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Begin fetching a fresh configuration
    fn start_fetch(&self, id: SourceId, reason: RefreshReason) -> FetchStart;
}

/// Source serving an application-provided JSON configuration document
pub struct StaticSource {
    document: RwLock<String>,
    origin: Option<String>,
}

impl StaticSource {
    pub fn new(document: impl Into<String>, origin: Option<String>) -> Self {
        Self {
            document: RwLock::new(document.into()),
            origin,
        }
    }

    /// Serve a snapshot, rendered into the JSON document format
    pub fn from_snapshot(snapshot: &TopologySnapshot) -> Self {
        Self::new(snapshot.to_json().to_string(), None)
    }

    /// Replace the served document; picked up by the next fetch
    pub fn set_document(&self, document: impl Into<String>) {
        *self.document.write() = document.into();
    }

    pub fn set_snapshot(&self, snapshot: &TopologySnapshot) {
        self.set_document(snapshot.to_json().to_string());
    }
}

impl ConfigSource for StaticSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Static
    }

    fn start_fetch(&self, _id: SourceId, _reason: RefreshReason) -> FetchStart {
        let document = self.document.read();
        FetchStart::Ready(
            TopologySnapshot::from_json(&document, self.origin.as_deref()).map_err(Into::into),
        )
    }
}
