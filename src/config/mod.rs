//! Configuration module

pub mod cli;
pub mod connstr;
pub mod settings;

pub use cli::SimArgs;
pub use connstr::{ConnectionSpec, Scheme, SeedHost};
pub use settings::{DispatchSettings, RemapOrder, RetrySettings, TracerSettings};
