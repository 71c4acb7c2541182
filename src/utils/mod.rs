//! Utility modules

pub mod error;
pub mod hash;

pub use error::{ConfigError, DispatchError, ErrorKind, RoutingError, TransportError};
pub use hash::vbucket_hash;
