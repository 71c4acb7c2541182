//! Bootstrap state machine
//!
//! ```text
//! Idle -> ResolvingSeeds -> Connecting -> AwaitingConfig -> Ready
//!              ^                                              |
//!              +---- config unavailable / all connections lost
//! ```
//!
//! Every failed attempt (seed resolution, all connects refused, no config,
//! attempt deadline) counts toward `max_attempts` consecutive failures;
//! reaching it moves to the terminal `Failed` state. A ready-eligible
//! config resets the counter. Triggers that arrive while an attempt is in
//! progress are coalesced into it.
//!
//! The machine performs no I/O. Each transition returns the
//! `BootstrapAction` its owner has to carry out.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cluster::{ConfigEvent, ConfigListener, TopologySnapshot};
use crate::config::SeedHost;
use crate::utils::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapState {
    Idle,
    ResolvingSeeds,
    Connecting,
    AwaitingConfig,
    Ready,
    Failed,
    Stopped,
}

impl BootstrapState {
    /// An attempt is underway
    pub fn in_progress(self) -> bool {
        matches!(
            self,
            BootstrapState::ResolvingSeeds | BootstrapState::Connecting | BootstrapState::AwaitingConfig
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BootstrapState::Failed | BootstrapState::Stopped)
    }
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Work the owner must perform after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum BootstrapAction {
    ResolveSeeds,
    Connect(Vec<SeedHost>),
    RequestConfig,
    /// Bootstrap gave up; fail waiting operations with this error
    Surface(DispatchError),
    None,
}

struct Inner {
    state: BootstrapState,
    failures: u32,
    attempt_started: Option<Instant>,
    /// Latest time seen by any event, used by listener-driven transitions
    clock: Option<Instant>,
    pending_connects: usize,
    failure: Option<DispatchError>,
    last_reason: Option<String>,
    queued: VecDeque<BootstrapAction>,
}

pub struct BootstrapStateMachine {
    inner: Mutex<Inner>,
    max_attempts: u32,
    attempt_timeout: Duration,
    coalesced: AtomicU64,
    attempts: AtomicU64,
}

impl BootstrapStateMachine {
    pub fn new(max_attempts: u32, attempt_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: BootstrapState::Idle,
                failures: 0,
                attempt_started: None,
                clock: None,
                pending_connects: 0,
                failure: None,
                last_reason: None,
                queued: VecDeque::new(),
            }),
            max_attempts: max_attempts.max(1),
            attempt_timeout,
            coalesced: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BootstrapState::Ready
    }

    /// Error surfaced once `Failed` was reached
    pub fn failure(&self) -> Option<DispatchError> {
        self.inner.lock().failure.clone()
    }

    /// Consecutive failed attempts
    pub fn failures(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Kick off the first attempt
    pub fn start(&self, now: Instant) -> BootstrapAction {
        let mut inner = self.inner.lock();
        inner.clock = Some(now);
        match inner.state {
            BootstrapState::Idle => self.begin_attempt(&mut inner, now),
            state => self.coalesce(state),
        }
    }

    /// Seed resolution finished
    pub fn on_seeds_resolved(&self, result: Result<Vec<SeedHost>, String>, now: Instant) -> BootstrapAction {
        let mut inner = self.inner.lock();
        inner.clock = Some(now);
        if inner.state != BootstrapState::ResolvingSeeds {
            debug!("Ignoring seed resolution in state {}", inner.state);
            return BootstrapAction::None;
        }
        match result {
            Ok(seeds) if !seeds.is_empty() => {
                inner.pending_connects = seeds.len();
                self.transition(&mut inner, BootstrapState::Connecting);
                BootstrapAction::Connect(seeds)
            }
            Ok(_) => self.fail_attempt(&mut inner, "no seeds resolved".to_string(), now),
            Err(reason) => self.fail_attempt(&mut inner, format!("seed resolution failed: {}", reason), now),
        }
    }

    /// A seed or data connection came up
    pub fn on_connected(&self, now: Instant) -> BootstrapAction {
        let mut inner = self.inner.lock();
        inner.clock = Some(now);
        if inner.state != BootstrapState::Connecting {
            return BootstrapAction::None;
        }
        self.transition(&mut inner, BootstrapState::AwaitingConfig);
        BootstrapAction::RequestConfig
    }

    /// A seed connection attempt failed
    pub fn on_connect_failed(&self, reason: &str, now: Instant) -> BootstrapAction {
        let mut inner = self.inner.lock();
        inner.clock = Some(now);
        if inner.state != BootstrapState::Connecting {
            return BootstrapAction::None;
        }
        inner.pending_connects = inner.pending_connects.saturating_sub(1);
        if inner.pending_connects > 0 {
            debug!("Seed connect failed ({}), {} still pending", reason, inner.pending_connects);
            return BootstrapAction::None;
        }
        self.fail_attempt(&mut inner, format!("could not connect to any seed: {}", reason), now)
    }

    /// A snapshot was applied
    pub fn on_config_applied(&self, snapshot: &TopologySnapshot) -> BootstrapAction {
        let mut inner = self.inner.lock();
        if !snapshot.is_ready_eligible() {
            debug!("Config rev {} has no active vbuckets yet", snapshot.revision());
            return BootstrapAction::None;
        }
        if inner.state.in_progress() {
            info!(
                "Bootstrap complete with config rev {} after {} failed attempts",
                snapshot.revision(),
                inner.failures
            );
            self.transition(&mut inner, BootstrapState::Ready);
        }
        if inner.state == BootstrapState::Ready {
            inner.failures = 0;
            inner.attempt_started = None;
        }
        BootstrapAction::None
    }

    /// A fetch answered with the snapshot already held
    ///
    /// Completes an attempt waiting for its config; the cluster did not
    /// change while the connections were re-established.
    pub fn on_config_confirmed(&self, snapshot: &TopologySnapshot) -> BootstrapAction {
        if self.state() != BootstrapState::AwaitingConfig {
            return BootstrapAction::None;
        }
        self.on_config_applied(snapshot)
    }

    /// Every configuration source failed
    pub fn on_config_unavailable(&self, reason: &str) -> BootstrapAction {
        let mut inner = self.inner.lock();
        let now = match inner.clock {
            Some(now) => now,
            None => return BootstrapAction::None,
        };
        match inner.state {
            BootstrapState::Ready => {
                warn!("Config unavailable while ready ({}), re-bootstrapping", reason);
                self.begin_attempt(&mut inner, now)
            }
            BootstrapState::AwaitingConfig => self.fail_attempt(&mut inner, reason.to_string(), now),
            _ => BootstrapAction::None,
        }
    }

    /// The last data connection went away
    pub fn on_all_data_connections_lost(&self, now: Instant) -> BootstrapAction {
        let mut inner = self.inner.lock();
        inner.clock = Some(now);
        match inner.state {
            BootstrapState::Ready => {
                warn!("All data connections lost, re-bootstrapping");
                self.begin_attempt(&mut inner, now)
            }
            state => self.coalesce(state),
        }
    }

    /// Check the attempt deadline
    pub fn tick(&self, now: Instant) -> BootstrapAction {
        let mut inner = self.inner.lock();
        inner.clock = Some(now);
        let expired = inner.state.in_progress()
            && inner
                .attempt_started
                .is_some_and(|started| now.saturating_duration_since(started) >= self.attempt_timeout);
        if !expired {
            return BootstrapAction::None;
        }
        let reason = format!(
            "no usable config within {:?} (last: {})",
            self.attempt_timeout,
            inner.last_reason.as_deref().unwrap_or("none")
        );
        self.fail_attempt(&mut inner, reason, now)
    }

    /// Stop from any non-terminal state; returns whether the state changed
    pub fn shutdown(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.queued.clear();
        self.transition(&mut inner, BootstrapState::Stopped);
        true
    }

    /// Actions produced by listener callbacks since the last call
    pub fn take_actions(&self) -> Vec<BootstrapAction> {
        self.inner.lock().queued.drain(..).collect()
    }

    fn begin_attempt(&self, inner: &mut Inner, now: Instant) -> BootstrapAction {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        inner.attempt_started = Some(now);
        inner.pending_connects = 0;
        self.transition(inner, BootstrapState::ResolvingSeeds);
        BootstrapAction::ResolveSeeds
    }

    fn fail_attempt(&self, inner: &mut Inner, reason: String, now: Instant) -> BootstrapAction {
        inner.failures += 1;
        warn!(
            "Bootstrap attempt failed ({}/{}): {}",
            inner.failures, self.max_attempts, reason
        );
        if inner.failures >= self.max_attempts {
            let error = DispatchError::BootstrapFailure {
                attempts: inner.failures,
                reason: reason.clone(),
            };
            inner.failure = Some(error.clone());
            inner.last_reason = Some(reason);
            self.transition(inner, BootstrapState::Failed);
            return BootstrapAction::Surface(error);
        }
        inner.last_reason = Some(reason);
        self.begin_attempt(inner, now)
    }

    fn coalesce(&self, state: BootstrapState) -> BootstrapAction {
        if state.in_progress() {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            debug!("Bootstrap trigger coalesced into attempt in state {}", state);
        }
        BootstrapAction::None
    }

    fn transition(&self, inner: &mut Inner, to: BootstrapState) {
        if inner.state != to {
            info!("Bootstrap: {} -> {}", inner.state, to);
            inner.state = to;
        }
    }
}

impl ConfigListener for BootstrapStateMachine {
    fn on_config_event(&self, event: &ConfigEvent) {
        let action = match event {
            ConfigEvent::Applied { new, .. } => self.on_config_applied(new),
            ConfigEvent::Confirmed { current } => self.on_config_confirmed(current),
            ConfigEvent::Unavailable { reason } => self.on_config_unavailable(reason),
        };
        if action != BootstrapAction::None {
            self.inner.lock().queued.push_back(action);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeDescriptor, Revision, VBucketEntry};
    use std::sync::Arc;

    fn machine() -> BootstrapStateMachine {
        BootstrapStateMachine::new(3, Duration::from_secs(5))
    }

    fn seeds() -> Vec<SeedHost> {
        vec![SeedHost::new("a", 11210), SeedHost::new("b", 11210)]
    }

    fn ready_config() -> TopologySnapshot {
        TopologySnapshot::uniform(2, 8, 1, Revision::new(0, 1)).unwrap()
    }

    fn bootstrap_to_ready(m: &BootstrapStateMachine, now: Instant) {
        assert_eq!(m.start(now), BootstrapAction::ResolveSeeds);
        assert_eq!(m.on_seeds_resolved(Ok(seeds()), now), BootstrapAction::Connect(seeds()));
        assert_eq!(m.on_connected(now), BootstrapAction::RequestConfig);
        m.on_config_applied(&ready_config());
        assert_eq!(m.state(), BootstrapState::Ready);
    }

    #[test]
    fn test_happy_path() {
        let m = machine();
        assert_eq!(m.state(), BootstrapState::Idle);
        bootstrap_to_ready(&m, Instant::now());
        assert_eq!(m.failures(), 0);
        assert_eq!(m.attempts(), 1);
    }

    #[test]
    fn test_not_ready_eligible_config_keeps_waiting() {
        let m = machine();
        let now = Instant::now();
        m.start(now);
        m.on_seeds_resolved(Ok(seeds()), now);
        m.on_connected(now);

        let nodes = vec![NodeDescriptor::data_node("a", 11210)];
        let empty = TopologySnapshot::new(nodes, vec![VBucketEntry::default(); 4], 0, Revision::new(0, 1)).unwrap();
        m.on_config_applied(&empty);
        assert_eq!(m.state(), BootstrapState::AwaitingConfig);
    }

    #[test]
    fn test_fails_after_attempt_cap() {
        let m = machine();
        let now = Instant::now();
        m.start(now);
        assert_eq!(m.on_seeds_resolved(Err("nxdomain".into()), now), BootstrapAction::ResolveSeeds);
        assert_eq!(m.on_seeds_resolved(Ok(vec![]), now), BootstrapAction::ResolveSeeds);

        let action = m.on_seeds_resolved(Err("nxdomain".into()), now);
        assert!(matches!(
            action,
            BootstrapAction::Surface(DispatchError::BootstrapFailure { attempts: 3, .. })
        ));
        assert_eq!(m.state(), BootstrapState::Failed);
        assert!(m.failure().is_some());

        // terminal: nothing restarts it
        assert_eq!(m.start(now), BootstrapAction::None);
        assert_eq!(m.on_all_data_connections_lost(now), BootstrapAction::None);
        assert!(!m.shutdown());
        assert_eq!(m.state(), BootstrapState::Failed);
    }

    #[test]
    fn test_all_connects_failing_is_one_failure() {
        let m = machine();
        let now = Instant::now();
        m.start(now);
        m.on_seeds_resolved(Ok(seeds()), now);
        assert_eq!(m.on_connect_failed("refused", now), BootstrapAction::None);
        assert_eq!(m.on_connect_failed("refused", now), BootstrapAction::ResolveSeeds);
        assert_eq!(m.failures(), 1);
        assert_eq!(m.state(), BootstrapState::ResolvingSeeds);
    }

    #[test]
    fn test_attempt_timeout() {
        let m = machine();
        let now = Instant::now();
        m.start(now);
        m.on_seeds_resolved(Ok(seeds()), now);
        m.on_connected(now);

        assert_eq!(m.tick(now + Duration::from_secs(4)), BootstrapAction::None);
        assert_eq!(m.tick(now + Duration::from_secs(5)), BootstrapAction::ResolveSeeds);
        assert_eq!(m.failures(), 1);
        // deadline restarts with the new attempt
        assert_eq!(m.tick(now + Duration::from_secs(9)), BootstrapAction::None);
    }

    #[test]
    fn test_rebootstrap_from_ready_and_coalescing() {
        let m = machine();
        let now = Instant::now();
        bootstrap_to_ready(&m, now);

        assert_eq!(m.on_all_data_connections_lost(now), BootstrapAction::ResolveSeeds);
        assert_eq!(m.state(), BootstrapState::ResolvingSeeds);
        // concurrent triggers do not start a second attempt
        assert_eq!(m.on_all_data_connections_lost(now), BootstrapAction::None);
        assert_eq!(m.on_config_unavailable("all sources failed"), BootstrapAction::None);
        assert_eq!(m.coalesced_count(), 1);

        // a config arriving mid-attempt completes it
        m.on_config_applied(&ready_config());
        assert_eq!(m.state(), BootstrapState::Ready);
    }

    #[test]
    fn test_confirmed_config_completes_rebootstrap() {
        let m = Arc::new(machine());
        let now = Instant::now();
        bootstrap_to_ready(&m, now);
        let current = Arc::new(ready_config());

        m.on_all_data_connections_lost(now);
        // not waiting for a config yet
        m.on_config_event(&ConfigEvent::Confirmed { current: current.clone() });
        assert_eq!(m.state(), BootstrapState::ResolvingSeeds);

        m.on_seeds_resolved(Ok(seeds()), now);
        m.on_connected(now);
        m.on_config_event(&ConfigEvent::Confirmed { current });
        assert_eq!(m.state(), BootstrapState::Ready);
        assert_eq!(m.failures(), 0);
        assert!(m.take_actions().is_empty());
    }

    #[test]
    fn test_listener_queues_actions() {
        let m = Arc::new(machine());
        let now = Instant::now();
        bootstrap_to_ready(&m, now);

        m.on_config_event(&ConfigEvent::Unavailable {
            reason: "all configuration sources failed".into(),
        });
        assert_eq!(m.take_actions(), vec![BootstrapAction::ResolveSeeds]);
        assert!(m.take_actions().is_empty());
        assert_eq!(m.state(), BootstrapState::ResolvingSeeds);
    }

    #[test]
    fn test_failures_reset_on_ready() {
        let m = machine();
        let now = Instant::now();
        m.start(now);
        m.on_seeds_resolved(Err("x".into()), now);
        m.on_seeds_resolved(Err("x".into()), now);
        assert_eq!(m.failures(), 2);
        m.on_seeds_resolved(Ok(seeds()), now);
        m.on_connected(now);
        m.on_config_applied(&ready_config());
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn test_shutdown() {
        let m = machine();
        let now = Instant::now();
        m.start(now);
        assert!(m.shutdown());
        assert_eq!(m.state(), BootstrapState::Stopped);
        assert_eq!(m.on_seeds_resolved(Ok(seeds()), now), BootstrapAction::None);
        assert!(!m.shutdown());
    }
}
