//! Cluster topology and routing
//!
//! This module provides:
//! - Immutable topology snapshots parsed from the cluster config document
//! - CRC32 key to vbucket to node mapping
//! - Heuristic alternate-owner guessing on routing failures
//! - Revision-ordered config application with refresh coalescing

pub mod config_monitor;
pub mod guesser;
pub mod node;
pub mod source;
pub mod topology;
pub mod vbucket_map;

pub use config_monitor::{ConfigEvent, ConfigListener, ConfigMonitor, ProposeOutcome, RefreshReason};
pub use guesser::VBucketGuesser;
pub use node::{NodeDescriptor, ServicePorts, ServiceType};
pub use source::{ConfigSource, FetchStart, SourceId, SourceKind, StaticSource};
pub use topology::{Revision, TopologySnapshot, VBucketEntry};
pub use vbucket_map::{VBucketMap, VBucketRoute};
