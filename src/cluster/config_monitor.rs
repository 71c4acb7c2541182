//! Cluster configuration monitor
//!
//! Owns the active topology snapshot. Candidates from any source are
//! compared by revision and only strictly newer ones replace the current
//! snapshot, so duplicate and out-of-order delivery is harmless. Listeners
//! are notified synchronously, in apply order, before `propose` returns.
//!
//! Refresh requests are coalesced per source: a source with a fetch in
//! flight is not asked again. When every source of a refresh cycle fails
//! (error or timeout) listeners receive `ConfigEvent::Unavailable`; the
//! monitor itself never retries. A fetch that brings nothing newer is
//! reported as `ConfigEvent::Confirmed`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::source::{ConfigSource, FetchStart, SourceId};
use super::topology::{Revision, TopologySnapshot};
use crate::utils::DispatchError;

/// Why a refresh was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshReason {
    Bootstrap,
    NotMyVbucket,
    NoActiveOwner,
    GuessesExhausted,
    ConnectionLost,
    Polling,
    Explicit,
}

/// Notification delivered to listeners
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A newer snapshot became current
    Applied {
        old: Option<Arc<TopologySnapshot>>,
        new: Arc<TopologySnapshot>,
    },
    /// A fetch answered with the current revision or an older one
    Confirmed { current: Arc<TopologySnapshot> },
    /// Every source failed to produce a configuration
    Unavailable { reason: String },
}

/// Receiver of configuration events
///
/// Called with no monitor lock held, but implementations must not call
/// `propose` from inside the callback.
pub trait ConfigListener: Send + Sync {
    fn on_config_event(&self, event: &ConfigEvent);
}

/// Result of proposing a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposeOutcome {
    Applied { previous: Option<Revision>, current: Revision },
    Ignored { current: Revision },
}

impl ProposeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ProposeOutcome::Applied { .. })
    }
}

struct InFlightFetch {
    reason: RefreshReason,
    deadline: Instant,
}

struct SourceSlot {
    source: Arc<dyn ConfigSource>,
    in_flight: Option<InFlightFetch>,
    failed: bool,
}

#[derive(Default)]
struct RefreshState {
    sources: Vec<SourceSlot>,
    /// A refresh cycle is open; `true` once any source produced a candidate
    cycle: Option<bool>,
}

/// Configuration monitor
pub struct ConfigMonitor {
    current: RwLock<Option<Arc<TopologySnapshot>>>,
    /// Serializes swap + notification so listeners see revisions in order
    apply_lock: Mutex<()>,
    refresh: Mutex<RefreshState>,
    listeners: RwLock<Vec<Arc<dyn ConfigListener>>>,
    node_timeout: Duration,
    applied: AtomicU64,
    ignored: AtomicU64,
    coalesced: AtomicU64,
}

impl ConfigMonitor {
    /// Create a monitor; `node_timeout` bounds each source's fetch
    pub fn new(node_timeout: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            apply_lock: Mutex::new(()),
            refresh: Mutex::new(RefreshState::default()),
            listeners: RwLock::new(Vec::new()),
            node_timeout,
            applied: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Register a configuration source
    pub fn add_source(&self, source: Arc<dyn ConfigSource>) -> SourceId {
        let mut state = self.refresh.lock();
        state.sources.push(SourceSlot {
            source,
            in_flight: None,
            failed: false,
        });
        state.sources.len() - 1
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn ConfigListener>) {
        self.listeners.write().push(listener);
    }

    /// Current snapshot
    pub fn current(&self) -> Option<Arc<TopologySnapshot>> {
        self.current.read().clone()
    }

    /// Current revision
    pub fn revision(&self) -> Option<Revision> {
        self.current.read().as_ref().map(|s| s.revision())
    }

    pub fn has_config(&self) -> bool {
        self.current.read().is_some()
    }

    /// Offer a candidate snapshot
    pub fn propose(&self, candidate: TopologySnapshot) -> ProposeOutcome {
        let _apply = self.apply_lock.lock();

        let (old, new) = {
            let mut current = self.current.write();
            if let Some(cur) = current.as_ref() {
                if !candidate.supersedes(cur) {
                    self.ignored.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Ignoring config rev {} (current {})",
                        candidate.revision(),
                        cur.revision()
                    );
                    return ProposeOutcome::Ignored {
                        current: cur.revision(),
                    };
                }
            }
            let new = Arc::new(candidate);
            let old = current.replace(Arc::clone(&new));
            (old, new)
        };

        self.applied.fetch_add(1, Ordering::Relaxed);
        info!(
            "Applied cluster config rev {} ({} nodes, {} vbuckets)",
            new.revision(),
            new.num_nodes(),
            new.num_vbuckets()
        );

        let previous = old.as_ref().map(|s| s.revision());
        let current = new.revision();
        self.notify(&ConfigEvent::Applied { old, new });

        ProposeOutcome::Applied { previous, current }
    }

    /// Ask every source for a fresh configuration
    ///
    /// Returns the number of fetches actually started; sources that already
    /// have a fetch in flight are skipped.
    pub fn request_refresh(&self, reason: RefreshReason, now: Instant) -> usize {
        let to_start: Vec<(SourceId, Arc<dyn ConfigSource>)> = {
            let mut state = self.refresh.lock();
            let mut to_start = Vec::new();
            for (id, slot) in state.sources.iter_mut().enumerate() {
                if let Some(in_flight) = &slot.in_flight {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Refresh ({:?}) coalesced into in-flight {} fetch ({:?})",
                        reason,
                        slot.source.kind().as_str(),
                        in_flight.reason
                    );
                    continue;
                }
                slot.in_flight = Some(InFlightFetch {
                    reason,
                    deadline: now + self.node_timeout,
                });
                slot.failed = false;
                to_start.push((id, Arc::clone(&slot.source)));
            }
            if !to_start.is_empty() && state.cycle.is_none() {
                state.cycle = Some(false);
            }
            to_start
        };

        let started = to_start.len();
        for (id, source) in to_start {
            debug!("Requesting config from {} source ({:?})", source.kind().as_str(), reason);
            if let FetchStart::Ready(result) = source.start_fetch(id, reason) {
                self.complete_fetch(id, result);
            }
        }
        started
    }

    /// Completion of a source fetch
    pub fn complete_fetch(
        &self,
        id: SourceId,
        result: Result<TopologySnapshot, DispatchError>,
    ) -> Option<ProposeOutcome> {
        {
            let mut state = self.refresh.lock();
            let had_fetch = match state.sources.get_mut(id) {
                Some(slot) => {
                    let had_fetch = slot.in_flight.take().is_some();
                    if result.is_err() && had_fetch {
                        slot.failed = true;
                    }
                    had_fetch
                }
                None => return None,
            };
            if result.is_ok() && had_fetch {
                if let Some(produced) = state.cycle.as_mut() {
                    *produced = true;
                }
            }
        }

        let outcome = match result {
            Ok(snapshot) => {
                let outcome = self.propose(snapshot);
                if !outcome.is_applied() {
                    if let Some(current) = self.current() {
                        self.notify(&ConfigEvent::Confirmed { current });
                    }
                }
                Some(outcome)
            }
            Err(e) => {
                warn!("Config source {} failed: {}", id, e);
                None
            }
        };
        self.finish_cycle_if_idle();
        outcome
    }

    /// Expire fetches that exceeded the per-source window
    pub fn tick(&self, now: Instant) {
        {
            let mut state = self.refresh.lock();
            for (id, slot) in state.sources.iter_mut().enumerate() {
                if slot.in_flight.as_ref().is_some_and(|f| f.deadline <= now) {
                    warn!(
                        "Config fetch from {} source {} timed out",
                        slot.source.kind().as_str(),
                        id
                    );
                    slot.in_flight = None;
                    slot.failed = true;
                }
            }
        }
        self.finish_cycle_if_idle();
    }

    /// Is any source fetch in flight?
    pub fn is_refreshing(&self) -> bool {
        self.refresh
            .lock()
            .sources
            .iter()
            .any(|slot| slot.in_flight.is_some())
    }

    /// Close the refresh cycle once no fetch is in flight
    fn finish_cycle_if_idle(&self) {
        let unavailable = {
            let mut state = self.refresh.lock();
            if state.sources.iter().any(|slot| slot.in_flight.is_some()) {
                return;
            }
            match state.cycle.take() {
                Some(false) => state.sources.iter().all(|slot| slot.failed),
                _ => false,
            }
        };

        if unavailable {
            warn!("No configuration source produced a config");
            self.notify(&ConfigEvent::Unavailable {
                reason: "all configuration sources failed".to_string(),
            });
        }
    }

    fn notify(&self, event: &ConfigEvent) {
        let listeners: Vec<Arc<dyn ConfigListener>> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_config_event(event);
        }
    }

    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn ignored_count(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::source::SourceKind;
    use crate::utils::TransportError;

    fn snap(rev: i64) -> TopologySnapshot {
        TopologySnapshot::uniform(2, 16, 1, Revision::new(0, rev)).unwrap()
    }

    /// Records every event it receives
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ConfigListener for Recorder {
        fn on_config_event(&self, event: &ConfigEvent) {
            let entry = match event {
                ConfigEvent::Applied { old, new } => format!(
                    "applied {:?}->{}",
                    old.as_ref().map(|s| s.revision().rev),
                    new.revision().rev
                ),
                ConfigEvent::Confirmed { current } => format!("confirmed {}", current.revision().rev),
                ConfigEvent::Unavailable { .. } => "unavailable".to_string(),
            };
            self.events.lock().push(entry);
        }
    }

    /// Source that never answers synchronously and counts fetches
    #[derive(Default)]
    struct PendingSource {
        fetches: AtomicU64,
    }

    impl ConfigSource for PendingSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Cccp
        }

        fn start_fetch(&self, _id: SourceId, _reason: RefreshReason) -> FetchStart {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            FetchStart::Pending
        }
    }

    #[test]
    fn test_stale_revision_rejected() {
        let monitor = ConfigMonitor::new(Duration::from_secs(2));
        assert!(monitor.propose(snap(5)).is_applied());
        assert_eq!(
            monitor.propose(snap(3)),
            ProposeOutcome::Ignored {
                current: Revision::new(0, 5)
            }
        );
        assert_eq!(monitor.revision(), Some(Revision::new(0, 5)));
    }

    #[test]
    fn test_revision_non_decreasing_under_shuffled_delivery() {
        let monitor = ConfigMonitor::new(Duration::from_secs(2));
        let recorder = Arc::new(Recorder::default());
        monitor.subscribe(recorder.clone());

        let mut last = None;
        for rev in [4, 2, 4, 7, 1, 7, 6, 9, 3] {
            monitor.propose(snap(rev));
            let current = monitor.revision();
            assert!(current >= last);
            last = current;
        }
        assert_eq!(monitor.revision(), Some(Revision::new(0, 9)));
        assert_eq!(monitor.applied_count(), 3);
        assert_eq!(monitor.ignored_count(), 6);
        assert_eq!(
            *recorder.events.lock(),
            vec!["applied None->4", "applied Some(4)->7", "applied Some(7)->9"]
        );
    }

    #[test]
    fn test_refresh_coalesces_per_source() {
        let monitor = ConfigMonitor::new(Duration::from_secs(2));
        let source = Arc::new(PendingSource::default());
        let id = monitor.add_source(source.clone());
        let now = Instant::now();

        assert_eq!(monitor.request_refresh(RefreshReason::NotMyVbucket, now), 1);
        assert_eq!(monitor.request_refresh(RefreshReason::NotMyVbucket, now), 0);
        assert_eq!(monitor.request_refresh(RefreshReason::Polling, now), 0);
        assert_eq!(source.fetches.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.coalesced_count(), 2);
        assert!(monitor.is_refreshing());

        let outcome = monitor.complete_fetch(id, Ok(snap(1)));
        assert!(outcome.unwrap().is_applied());
        assert!(!monitor.is_refreshing());

        // next request starts a new fetch
        assert_eq!(monitor.request_refresh(RefreshReason::Polling, now), 1);
    }

    #[test]
    fn test_all_sources_failing_reports_unavailable() {
        let monitor = ConfigMonitor::new(Duration::from_secs(2));
        let recorder = Arc::new(Recorder::default());
        monitor.subscribe(recorder.clone());
        let a = monitor.add_source(Arc::new(PendingSource::default()));
        let _b = monitor.add_source(Arc::new(PendingSource::default()));
        let now = Instant::now();

        monitor.request_refresh(RefreshReason::Bootstrap, now);
        monitor.complete_fetch(a, Err(TransportError::NotConnected(0).into()));
        assert!(recorder.events.lock().is_empty());

        // second source times out
        monitor.tick(now + Duration::from_secs(1));
        assert!(recorder.events.lock().is_empty());
        monitor.tick(now + Duration::from_secs(2));
        assert_eq!(*recorder.events.lock(), vec!["unavailable"]);
        assert!(!monitor.is_refreshing());
    }

    #[test]
    fn test_partial_failure_is_not_unavailable() {
        let monitor = ConfigMonitor::new(Duration::from_secs(2));
        let recorder = Arc::new(Recorder::default());
        monitor.subscribe(recorder.clone());
        let a = monitor.add_source(Arc::new(PendingSource::default()));
        let b = monitor.add_source(Arc::new(PendingSource::default()));
        let now = Instant::now();

        monitor.request_refresh(RefreshReason::Bootstrap, now);
        monitor.complete_fetch(a, Ok(snap(2)));
        monitor.complete_fetch(b, Err(TransportError::Timeout(1).into()));

        assert_eq!(*recorder.events.lock(), vec!["applied None->2"]);
    }

    #[test]
    fn test_unchanged_fetch_confirms_current() {
        let monitor = ConfigMonitor::new(Duration::from_secs(2));
        let recorder = Arc::new(Recorder::default());
        monitor.subscribe(recorder.clone());
        let id = monitor.add_source(Arc::new(PendingSource::default()));
        let now = Instant::now();

        monitor.request_refresh(RefreshReason::Bootstrap, now);
        monitor.complete_fetch(id, Ok(snap(4)));
        monitor.request_refresh(RefreshReason::ConnectionLost, now);
        let outcome = monitor.complete_fetch(id, Ok(snap(4)));

        assert!(!outcome.unwrap().is_applied());
        assert_eq!(*recorder.events.lock(), vec!["applied None->4", "confirmed 4"]);
        // a direct proposal of a stale candidate stays silent
        monitor.propose(snap(2));
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[test]
    fn test_synchronous_source_applies_immediately() {
        use crate::cluster::source::StaticSource;

        let monitor = ConfigMonitor::new(Duration::from_secs(2));
        monitor.add_source(Arc::new(StaticSource::from_snapshot(&snap(11))));
        assert_eq!(monitor.request_refresh(RefreshReason::Bootstrap, Instant::now()), 1);
        assert_eq!(monitor.revision(), Some(Revision::new(0, 11)));
        assert!(!monitor.is_refreshing());
    }
}
