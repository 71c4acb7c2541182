//! Operation dispatch
//!
//! Routes KV operations to the owning node, recovers from not-my-vbucket
//! replies and stale topologies, and delivers each outcome exactly once.

pub mod counters;
pub mod instance;
pub mod operation;

pub use counters::{DispatchCounters, DispatchStats};
pub use instance::Instance;
pub use operation::{Completion, Operation};
