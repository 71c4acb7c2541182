//! Seed resolution

use crate::config::{ConnectionSpec, SeedHost};

/// Result of starting a seed resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(Vec<SeedHost>),
    Failed(String),
    /// The answer arrives through `Instance::on_seeds_resolved`
    Pending,
}

/// Turns a connection spec into connectable seed addresses
pub trait SeedResolver: Send + Sync {
    fn resolve(&self, spec: &ConnectionSpec) -> ResolveOutcome;
}

/// Uses the hosts listed in the connection string as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticResolver;

impl SeedResolver for StaticResolver {
    fn resolve(&self, spec: &ConnectionSpec) -> ResolveOutcome {
        if spec.hosts.is_empty() {
            ResolveOutcome::Failed("connection string lists no hosts".to_string())
        } else {
            ResolveOutcome::Resolved(spec.hosts.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_resolver() {
        let mut spec = ConnectionSpec::parse("couchbase://a,b:12000").unwrap();
        assert_eq!(
            StaticResolver.resolve(&spec),
            ResolveOutcome::Resolved(vec![SeedHost::new("a", 11210), SeedHost::new("b", 12000)])
        );

        spec.hosts.clear();
        assert!(matches!(StaticResolver.resolve(&spec), ResolveOutcome::Failed(_)));
    }
}
