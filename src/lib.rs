//! vbucket-dispatch library
//!
//! Client-side dispatch core for vbucket-partitioned key-value clusters:
//! topology tracking, key routing with owner guessing, bootstrap, retries
//! and latency telemetry.

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod retry;
pub mod telemetry;
pub mod transport;
pub mod utils;
