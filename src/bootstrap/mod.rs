//! Cluster bootstrap
//!
//! Drives seed resolution, seed connections and the first configuration,
//! and re-bootstraps after the cluster becomes unreachable.

pub mod seeds;
pub mod state_machine;

pub use seeds::{ResolveOutcome, SeedResolver, StaticResolver};
pub use state_machine::{BootstrapAction, BootstrapState, BootstrapStateMachine};
