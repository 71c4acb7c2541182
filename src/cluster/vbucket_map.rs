//! Key to node mapping
//!
//! Pure functions over an immutable snapshot: same key and same vbucket
//! table always give the same answer, and concurrent callers need no
//! synchronization.

use super::topology::TopologySnapshot;
use crate::utils::{vbucket_hash, RoutingError};

/// Where a key goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VBucketRoute {
    pub vbucket: u16,
    pub node: usize,
}

/// Key mapping over a topology snapshot
pub struct VBucketMap;

impl VBucketMap {
    /// Partition id of `key`
    #[inline]
    pub fn vbucket_for_key(key: &[u8], num_vbuckets: usize) -> u16 {
        vbucket_hash(key, num_vbuckets)
    }

    /// Resolve `key` to its vbucket and active owner
    ///
    /// Fails with `NoActiveOwner` while the vbucket is in transition; callers
    /// treat that as retryable.
    pub fn resolve(key: &[u8], snapshot: &TopologySnapshot) -> Result<VBucketRoute, RoutingError> {
        let vbucket = Self::vbucket_for_key(key, snapshot.num_vbuckets());
        snapshot
            .active_for(vbucket)
            .map(|node| VBucketRoute { vbucket, node })
            .ok_or(RoutingError::NoActiveOwner { vbucket })
    }

    /// Resolve `key` to the owner of its `replica`-th copy (0-based)
    pub fn resolve_replica(
        key: &[u8],
        snapshot: &TopologySnapshot,
        replica: usize,
    ) -> Result<VBucketRoute, RoutingError> {
        let vbucket = Self::vbucket_for_key(key, snapshot.num_vbuckets());
        snapshot
            .vbucket(vbucket)
            .and_then(|entry| entry.replicas.get(replica).copied())
            .map(|node| VBucketRoute { vbucket, node })
            .ok_or(RoutingError::NoActiveOwner { vbucket })
    }
}
