//! Heuristic vbucket owner guessing
//!
//! When a node rejects a vbucket (or cannot be reached) the real owner is
//! usually a node the current snapshot already knows about: one of the
//! replicas that is about to be promoted, or any other data node. The
//! guesser hands out those candidates one at a time, never repeating a node
//! within the same incident, and remembers which alternates worked.
//!
//! Candidate order for `remap`:
//! 1. alternates that were promoted before (most recent first)
//! 2. replicas listed for the vbucket, then its active owner (replica-first only)
//! 3. every data node, round-robin from the vbucket's cursor
//!
//! Incidents end when a guess is confirmed or a newer snapshot is applied.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::config_monitor::{ConfigEvent, ConfigListener};
use super::topology::TopologySnapshot;
use crate::config::RemapOrder;

#[derive(Debug, Clone, Default)]
struct GuessEntry {
    /// Previously promoted alternates, most recent first
    guesses: Vec<usize>,
    /// Nodes tried during the current incident
    tried: Vec<usize>,
    /// Next position of the round-robin scan
    cursor: usize,
    /// Guess that overrides the active owner until the next snapshot
    preferred: Option<usize>,
}

#[derive(Default)]
struct GuessTable {
    snapshot: Option<Arc<TopologySnapshot>>,
    entries: Vec<GuessEntry>,
}

/// Per-vbucket alternate owner table
pub struct VBucketGuesser {
    table: Mutex<GuessTable>,
    cap: usize,
    order: RemapOrder,
    remaps: AtomicU64,
    exhausted: AtomicU64,
}

impl VBucketGuesser {
    pub fn new(cap: usize, order: RemapOrder) -> Self {
        Self {
            table: Mutex::new(GuessTable::default()),
            cap: cap.max(1),
            order,
            remaps: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    /// Rebuild the table for a newly applied snapshot
    ///
    /// Ignored unless `new` supersedes the snapshot the table was built
    /// from. Guess lists survive only for vbuckets whose active owner is the
    /// same in `old` and `new`; incident state is always reset.
    pub fn on_new_topology(&self, old: Option<&TopologySnapshot>, new: &Arc<TopologySnapshot>) -> bool {
        let mut table = self.table.lock();
        if let Some(cur) = &table.snapshot {
            if !new.supersedes(cur) {
                return false;
            }
        }

        let mut entries = vec![GuessEntry::default(); new.num_vbuckets()];
        let mut cleared = 0usize;
        if let Some(old) = old {
            let comparable = old.num_vbuckets() == new.num_vbuckets()
                && table.entries.len() == new.num_vbuckets();
            for (vb, entry) in entries.iter_mut().enumerate() {
                let vb16 = vb as u16;
                let same_owner = comparable && old.active_for(vb16) == new.active_for(vb16);
                let previous = table.entries.get(vb).map(|e| e.guesses.as_slice()).unwrap_or(&[]);
                if same_owner {
                    entry.guesses = previous
                        .iter()
                        .copied()
                        .filter(|&idx| new.is_data_node(idx))
                        .collect();
                } else if !previous.is_empty() {
                    cleared += 1;
                }
            }
        }

        debug!(
            "Guess table rebuilt for rev {} ({} guess lists cleared)",
            new.revision(),
            cleared
        );
        table.entries = entries;
        table.snapshot = Some(Arc::clone(new));
        true
    }

    /// Next candidate owner after `bad_node` failed for `vbucket`
    ///
    /// `None` once every known data node was tried in this incident; the
    /// caller must then refresh the topology instead of guessing further.
    pub fn remap(&self, vbucket: u16, bad_node: usize) -> Option<usize> {
        let mut table = self.table.lock();
        let snapshot = table.snapshot.clone()?;
        let order = self.order;
        let cap = self.cap;
        let entry = table.entries.get_mut(vbucket as usize)?;

        if !entry.tried.contains(&bad_node) {
            entry.tried.push(bad_node);
        }
        if entry.preferred == Some(bad_node) {
            entry.preferred = None;
        }

        let (pick, scanned) = {
            let current: &GuessEntry = entry;
            let untried = |idx: usize| snapshot.is_data_node(idx) && !current.tried.contains(&idx);

            let mut pick = current.guesses.iter().copied().find(|&idx| untried(idx));
            let mut scanned = false;
            if pick.is_none() && order == RemapOrder::ReplicaFirst {
                pick = snapshot.vbucket(vbucket).and_then(|vb| {
                    vb.replicas.iter().copied().chain(vb.active).find(|&idx| untried(idx))
                });
            }
            if pick.is_none() {
                let n = snapshot.num_nodes();
                pick = (0..n).map(|step| (current.cursor + step) % n).find(|&idx| untried(idx));
                scanned = pick.is_some();
            }
            (pick, scanned)
        };

        match pick {
            Some(idx) => {
                if scanned {
                    entry.cursor = (idx + 1) % snapshot.num_nodes();
                }
                entry.tried.push(idx);
                entry.guesses.retain(|&g| g != idx);
                entry.guesses.insert(0, idx);
                entry.guesses.truncate(cap);
                entry.preferred = Some(idx);
                self.remaps.fetch_add(1, Ordering::Relaxed);
                debug!("vbucket {}: node {} failed, guessing node {}", vbucket, bad_node, idx);
                Some(idx)
            }
            None => {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                debug!("vbucket {}: all {} nodes tried", vbucket, entry.tried.len());
                None
            }
        }
    }

    /// Guess currently overriding the active owner of `vbucket`
    pub fn preferred(&self, vbucket: u16) -> Option<usize> {
        self.table
            .lock()
            .entries
            .get(vbucket as usize)
            .and_then(|e| e.preferred)
    }

    /// A request for `vbucket` succeeded on `node`
    ///
    /// Ends the incident unless a different guess is preferred, in which
    /// case the success came from a request routed before the last remap.
    pub fn confirm(&self, vbucket: u16, node: usize) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entries.get_mut(vbucket as usize) {
            match entry.preferred {
                Some(preferred) if preferred != node => {
                    debug!("vbucket {}: late success from node {} ignored", vbucket, node);
                }
                _ => entry.tried.clear(),
            }
        }
    }

    /// Alternates remembered for `vbucket`, most recent first
    pub fn guesses(&self, vbucket: u16) -> Vec<usize> {
        self.table
            .lock()
            .entries
            .get(vbucket as usize)
            .map(|e| e.guesses.clone())
            .unwrap_or_default()
    }

    pub fn remap_count(&self) -> u64 {
        self.remaps.load(Ordering::Relaxed)
    }

    pub fn exhausted_count(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

impl ConfigListener for VBucketGuesser {
    fn on_config_event(&self, event: &ConfigEvent) {
        if let ConfigEvent::Applied { old, new } = event {
            self.on_new_topology(old.as_deref(), new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::topology::{Revision, VBucketEntry};
    use crate::cluster::NodeDescriptor;

    fn four_nodes(rev: i64) -> Arc<TopologySnapshot> {
        Arc::new(TopologySnapshot::uniform(4, 8, 1, Revision::new(0, rev)).unwrap())
    }

    fn guesser_with(order: RemapOrder, snap: &Arc<TopologySnapshot>) -> VBucketGuesser {
        let guesser = VBucketGuesser::new(4, order);
        assert!(guesser.on_new_topology(None, snap));
        guesser
    }

    #[test]
    fn test_replica_first_order() {
        let snap = four_nodes(1);
        let guesser = guesser_with(RemapOrder::ReplicaFirst, &snap);

        // vbucket 1: active 1, replica 2
        assert_eq!(guesser.remap(1, 1), Some(2));
        assert_eq!(guesser.preferred(1), Some(2));
        // replica failed too: round-robin over the rest
        assert_eq!(guesser.remap(1, 2), Some(0));
        assert_eq!(guesser.remap(1, 0), Some(3));
        assert_eq!(guesser.remap(1, 3), None);
        assert_eq!(guesser.preferred(1), None);
        assert_eq!(guesser.exhausted_count(), 1);
    }

    #[test]
    fn test_round_robin_order() {
        let snap = four_nodes(1);
        let guesser = guesser_with(RemapOrder::RoundRobin, &snap);

        assert_eq!(guesser.remap(1, 1), Some(0));
        assert_eq!(guesser.remap(1, 0), Some(2));
        assert_eq!(guesser.remap(1, 2), Some(3));
        assert_eq!(guesser.remap(1, 3), None);
    }

    #[test]
    fn test_never_returns_bad_node_or_non_data_node() {
        let mut nodes: Vec<NodeDescriptor> =
            (0..2).map(|i| NodeDescriptor::data_node("h", 11210 + i)).collect();
        let mut query_only = NodeDescriptor::data_node("q", 0);
        query_only.data = false;
        nodes.push(query_only);
        let vbuckets = vec![VBucketEntry { active: Some(0), replicas: vec![] }; 2];
        let snap = Arc::new(TopologySnapshot::new(nodes, vbuckets, 0, Revision::new(0, 1)).unwrap());
        let guesser = guesser_with(RemapOrder::ReplicaFirst, &snap);

        assert_eq!(guesser.remap(0, 0), Some(1));
        assert_eq!(guesser.remap(0, 1), None);
    }

    #[test]
    fn test_promoted_guess_is_tried_first_in_next_incident() {
        let snap = four_nodes(1);
        let guesser = guesser_with(RemapOrder::RoundRobin, &snap);

        assert_eq!(guesser.remap(1, 1), Some(0));
        assert_eq!(guesser.remap(1, 0), Some(2));
        guesser.confirm(1, 2);
        assert_eq!(guesser.guesses(1), vec![2, 0]);

        // new incident: the working alternate comes back first
        assert_eq!(guesser.remap(1, 1), Some(2));
    }

    #[test]
    fn test_late_success_does_not_end_incident() {
        let snap = four_nodes(1);
        let guesser = guesser_with(RemapOrder::RoundRobin, &snap);

        assert_eq!(guesser.remap(1, 1), Some(0));
        // a request sent to node 3 before the remap answers late
        guesser.confirm(1, 3);
        // nodes 1 and 0 stay tried
        assert_eq!(guesser.remap(1, 0), Some(2));

        guesser.confirm(1, 2);
        assert_eq!(guesser.remap(1, 1), Some(2));
        assert_eq!(guesser.remap(1, 2), Some(0));
    }

    #[test]
    fn test_guess_list_capped() {
        let snap = Arc::new(TopologySnapshot::uniform(8, 8, 0, Revision::new(0, 1)).unwrap());
        let guesser = VBucketGuesser::new(2, RemapOrder::RoundRobin);
        guesser.on_new_topology(None, &snap);

        let mut bad = 0;
        for _ in 0..5 {
            bad = guesser.remap(0, bad).unwrap();
        }
        assert_eq!(guesser.guesses(0).len(), 2);
    }

    #[test]
    fn test_owner_change_clears_guesses() {
        let v1 = four_nodes(1);
        let guesser = guesser_with(RemapOrder::ReplicaFirst, &v1);
        // build guesses on vbucket 0 (owner 0) and vbucket 1 (owner 1)
        guesser.remap(0, 0);
        guesser.remap(1, 1);
        assert!(!guesser.guesses(0).is_empty());
        assert!(!guesser.guesses(1).is_empty());

        // failing over node 0 moves vbucket 0 but not vbucket 1
        let v2 = Arc::new(v1.failed_over(0, Revision::new(0, 2)).unwrap());
        assert!(guesser.on_new_topology(Some(&v1), &v2));

        assert!(guesser.guesses(0).is_empty());
        assert_eq!(guesser.guesses(1), vec![2]);
        // incident state is reset either way
        assert_eq!(guesser.preferred(1), None);
    }

    #[test]
    fn test_stale_topology_ignored() {
        let v2 = four_nodes(2);
        let guesser = guesser_with(RemapOrder::ReplicaFirst, &v2);
        guesser.remap(1, 1);

        let v1 = four_nodes(1);
        assert!(!guesser.on_new_topology(Some(&v2), &v1));
        assert!(!guesser.on_new_topology(Some(&v2), &v2));
        assert_eq!(guesser.preferred(1), Some(2));
    }

    #[test]
    fn test_remap_without_snapshot() {
        let guesser = VBucketGuesser::new(4, RemapOrder::ReplicaFirst);
        assert_eq!(guesser.remap(0, 0), None);
    }
}
