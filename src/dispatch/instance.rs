//! Dispatch instance
//!
//! Owns every component of the dispatch core and runs the operation
//! lifecycle on top of them:
//!
//! ```text
//! submit -> route (snapshot + guesses) -> transport.send -> handle_response
//!             |                                               |
//!             +-- no config: deferred until bootstrap Ready   +-- NMVB: propose attached
//!                                                             |   config, refresh, remap
//!                                                             +-- retryable: retry queue
//! ```
//!
//! The instance is event driven. Transport completions, timers, seed
//! resolution and config fetches all come in through the `on_*` and
//! `handle_*` methods; none of them block.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::counters::{DispatchCounters, DispatchStats};
use super::operation::Operation;
use crate::bootstrap::{BootstrapAction, BootstrapState, BootstrapStateMachine, ResolveOutcome, SeedResolver};
use crate::cluster::{
    ConfigMonitor, ConfigSource, RefreshReason, Revision, ServiceType, SourceId, TopologySnapshot,
    VBucketGuesser, VBucketMap, VBucketRoute,
};
use crate::config::{ConnectionSpec, DispatchSettings, SeedHost};
use crate::retry::{OperationKind, Rejected, RetryQueue, Retryable};
use crate::telemetry::{KvTimings, Span, TelemetrySink, ThresholdTracer};
use crate::transport::{Opaque, Request, Response, TimerHandle, TimerKind, Transport};
use crate::utils::{DispatchError, ErrorKind, RoutingError, TransportError};

struct InFlight {
    op: Operation,
    route: VBucketRoute,
    /// Revision the route was computed from
    revision: Revision,
    sent_at: Instant,
    host: String,
    remote: String,
    /// Client and connection the request went out on
    local_id: String,
}

/// Request completed by timeout while still on the wire
struct OrphanCandidate {
    kind: OperationKind,
    sent_at: Instant,
    remote: String,
    local_id: String,
}

#[derive(Default)]
struct Connections {
    up: HashSet<String>,
    down: HashSet<String>,
}

pub struct Instance {
    settings: DispatchSettings,
    spec: ConnectionSpec,
    monitor: Arc<ConfigMonitor>,
    guesser: Arc<VBucketGuesser>,
    retryq: Arc<RetryQueue<Operation>>,
    bootstrap: Arc<BootstrapStateMachine>,
    tracer: ThresholdTracer,
    timings: KvTimings,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn SeedResolver>,
    /// Random per-instance id reported in telemetry
    client_id: String,
    in_flight: Mutex<HashMap<Opaque, InFlight>>,
    timed_out: Mutex<HashMap<Opaque, OrphanCandidate>>,
    deferred: Mutex<VecDeque<Operation>>,
    connections: Mutex<Connections>,
    timers: Mutex<HashMap<TimerKind, TimerHandle>>,
    next_opaque: AtomicU32,
    destroying: AtomicBool,
    counters: DispatchCounters,
}

impl Instance {
    pub fn new(
        settings: DispatchSettings,
        spec: ConnectionSpec,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SeedResolver>,
        sources: Vec<Arc<dyn ConfigSource>>,
    ) -> Self {
        let monitor = Arc::new(ConfigMonitor::new(settings.config_node_timeout));
        for source in sources {
            monitor.add_source(source);
        }
        let guesser = Arc::new(VBucketGuesser::new(settings.guess_list_cap, settings.remap_order));
        let retryq = Arc::new(RetryQueue::new(
            &settings.retry,
            settings.operation_timeout,
            fastrand::u64(..),
        ));
        let bootstrap = Arc::new(BootstrapStateMachine::new(
            settings.max_bootstrap_attempts,
            settings.bootstrap_timeout,
        ));

        // Guess table first: retries woken by a new config must see it
        monitor.subscribe(guesser.clone());
        monitor.subscribe(retryq.clone());
        monitor.subscribe(bootstrap.clone());

        Self {
            tracer: ThresholdTracer::new(settings.tracer.clone()),
            settings,
            spec,
            monitor,
            guesser,
            retryq,
            bootstrap,
            timings: KvTimings::new(),
            transport,
            resolver,
            client_id: format!("{:016x}", fastrand::u64(..)),
            in_flight: Mutex::new(HashMap::new()),
            timed_out: Mutex::new(HashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
            connections: Mutex::new(Connections::default()),
            timers: Mutex::new(HashMap::new()),
            next_opaque: AtomicU32::new(1),
            destroying: AtomicBool::new(false),
            counters: DispatchCounters::default(),
        }
    }

    /// Send tracer reports to `sink` in addition to the log
    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.tracer = ThresholdTracer::new(self.settings.tracer.clone()).with_sink(sink);
        self
    }

    /// Begin bootstrapping and arm the periodic timers
    pub fn start(&self, now: Instant) {
        if self.is_destroying() {
            return;
        }
        info!(
            "Starting dispatch for bucket {} with {} seeds",
            self.spec.bucket.as_deref().unwrap_or("default"),
            self.spec.hosts.len()
        );
        for kind in TimerKind::ALL {
            self.arm_timer(kind);
        }
        let action = self.bootstrap.start(now);
        self.pump(action, now);
    }

    /// Submit an operation
    pub fn submit(&self, mut op: Operation, now: Instant) {
        if self.is_destroying() {
            op.complete(Err(DispatchError::RequestCanceled));
            return;
        }
        op.mark_submitted(now);
        DispatchCounters::incr(&self.counters.submitted);

        match self.bootstrap.state() {
            BootstrapState::Failed => {
                let error = self.bootstrap.failure().unwrap_or(DispatchError::BootstrapFailure {
                    attempts: self.settings.max_bootstrap_attempts,
                    reason: "bootstrap failed".to_string(),
                });
                self.finish(op, Err(error));
                return;
            }
            BootstrapState::Stopped => {
                self.finish(op, Err(DispatchError::RequestCanceled));
                return;
            }
            _ => {}
        }

        self.dispatch(op, now);
        self.pump(BootstrapAction::None, now);
    }

    /// Response for a request sent earlier
    pub fn handle_response(&self, opaque: Opaque, response: Response, now: Instant) {
        if self.is_destroying() {
            return;
        }
        let entry = self.in_flight.lock().remove(&opaque);
        let Some(entry) = entry else {
            self.handle_orphan(opaque, &response, now);
            return;
        };

        match response.status.error_kind() {
            None => self.complete_success(opaque, entry, response, now),
            Some(ErrorKind::NotMyVbucket) => self.handle_not_my_vbucket(entry, response, now),
            Some(kind) => {
                let error = DispatchError::from_kind(kind, entry.route.vbucket, entry.route.node);
                self.retry_or_fail(entry.op, error, now);
            }
        }
        self.pump(BootstrapAction::None, now);
    }

    /// A request in flight failed at the connection level
    pub fn handle_transport_error(&self, opaque: Opaque, error: TransportError, now: Instant) {
        if self.is_destroying() {
            return;
        }
        let entry = self.in_flight.lock().remove(&opaque);
        if let Some(entry) = entry {
            debug!("Request {} to {} failed: {}", opaque, entry.remote, error);
            self.retry_or_fail(entry.op, error.into(), now);
        }
        self.pump(BootstrapAction::None, now);
    }

    /// Seed resolution that answered `Pending` finished
    pub fn on_seeds_resolved(&self, result: Result<Vec<SeedHost>, String>, now: Instant) {
        if self.is_destroying() {
            return;
        }
        let action = self.bootstrap.on_seeds_resolved(result, now);
        self.pump(action, now);
    }

    /// A connection to `address` (`host:port`) is established
    pub fn on_connection_up(&self, address: &str, now: Instant) {
        if self.is_destroying() {
            return;
        }
        {
            let mut conns = self.connections.lock();
            conns.down.remove(address);
            conns.up.insert(address.to_string());
        }
        let action = self.bootstrap.on_connected(now);
        self.pump(action, now);
    }

    /// Connecting to `address` failed
    pub fn on_connect_failed(&self, address: &str, reason: &str, now: Instant) {
        if self.is_destroying() {
            return;
        }
        debug!("Connect to {} failed: {}", address, reason);
        let action = self.bootstrap.on_connect_failed(reason, now);
        self.pump(action, now);
    }

    /// The connection to `address` was lost
    pub fn on_connection_down(&self, address: &str, now: Instant) {
        if self.is_destroying() {
            return;
        }
        let all_lost = {
            let mut conns = self.connections.lock();
            conns.up.remove(address);
            conns.down.insert(address.to_string());
            conns.up.is_empty()
        };
        warn!("Connection to {} lost", address);
        self.request_refresh(RefreshReason::ConnectionLost, now);
        let action = if all_lost {
            self.bootstrap.on_all_data_connections_lost(now)
        } else {
            BootstrapAction::None
        };
        self.pump(action, now);
    }

    /// Completion of a config fetch that answered `Pending`
    pub fn complete_config_fetch(
        &self,
        source: SourceId,
        result: Result<TopologySnapshot, DispatchError>,
        now: Instant,
    ) {
        if self.is_destroying() {
            return;
        }
        self.monitor.complete_fetch(source, result);
        self.pump(BootstrapAction::None, now);
    }

    /// A timer scheduled through the transport fired
    pub fn on_timer(&self, kind: TimerKind, now: Instant) {
        if self.is_destroying() {
            return;
        }
        self.timers.lock().remove(&kind);

        match kind {
            TimerKind::RetryTick => {
                self.monitor.tick(now);
                let action = self.bootstrap.tick(now);
                self.expire_in_flight(now);
                self.expire_deferred(now);
                self.pump(action, now);
            }
            TimerKind::OrphanFlush => {
                self.tracer.flush_orphans();
                let horizon = self.settings.operation_timeout + self.tracer.orphan_flush_interval();
                self.timed_out
                    .lock()
                    .retain(|_, c| now.saturating_duration_since(c.sent_at) < horizon);
            }
            TimerKind::ThresholdFlush => {
                self.tracer.flush_threshold();
            }
            TimerKind::ConfigPoll => {
                if self.bootstrap.is_ready() {
                    self.request_refresh(RefreshReason::Polling, now);
                    self.pump(BootstrapAction::None, now);
                }
            }
        }
        self.arm_timer(kind);
    }

    /// Tear down: cancel timers and fail every pending operation once
    pub fn shutdown(&self) {
        if self.destroying.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down dispatch instance");
        self.bootstrap.shutdown();

        let timers: Vec<TimerHandle> = self.timers.lock().drain().map(|(_, h)| h).collect();
        for handle in timers {
            self.transport.cancel_timer(handle);
        }

        let mut canceled: Vec<Operation> = self.deferred.lock().drain(..).collect();
        canceled.extend(self.retryq.cancel_all());
        let mut in_flight: Vec<(Opaque, InFlight)> = self.in_flight.lock().drain().collect();
        in_flight.sort_by_key(|(opaque, _)| *opaque);
        canceled.extend(in_flight.into_iter().map(|(_, e)| e.op));
        self.timed_out.lock().clear();

        if !canceled.is_empty() {
            info!("Canceling {} pending operations", canceled.len());
        }
        for op in canceled {
            self.finish(op, Err(DispatchError::RequestCanceled));
        }
    }

    /// Identifier of this instance in telemetry reports
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::SeqCst)
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.bootstrap.state()
    }

    pub fn monitor(&self) -> &ConfigMonitor {
        &self.monitor
    }

    pub fn guesser(&self) -> &VBucketGuesser {
        &self.guesser
    }

    pub fn retry_queue(&self) -> &RetryQueue<Operation> {
        &self.retryq
    }

    pub fn tracer(&self) -> &ThresholdTracer {
        &self.tracer
    }

    pub fn timings(&self) -> &KvTimings {
        &self.timings
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            retried: self.retryq.retried_count(),
            config_revisions_applied: self.monitor.applied_count(),
            ..self.counters.snapshot()
        }
    }

    // ===== Routing =====

    fn dispatch(&self, mut op: Operation, now: Instant) {
        let Some(snapshot) = self.monitor.current() else {
            self.defer(op);
            return;
        };

        let mut route = match self.route(&op, &snapshot) {
            Ok(route) => route,
            Err(e) => {
                let reason = match e {
                    RoutingError::GuessesExhausted { .. } => RefreshReason::GuessesExhausted,
                    _ => RefreshReason::NoActiveOwner,
                };
                self.request_refresh(reason, now);
                self.retry_or_fail(op, e.into(), now);
                return;
            }
        };

        if op.replica.is_none()
            && op.remaps() < self.settings.max_remap_attempts
            && self.is_node_down(&snapshot, route.node)
        {
            if let Some(alternate) = self.guesser.remap(route.vbucket, route.node) {
                debug!(
                    "Node {} is down, sending vbucket {} to node {}",
                    route.node, route.vbucket, alternate
                );
                op.record_remap();
                DispatchCounters::incr(&self.counters.remapped);
                route.node = alternate;
            }
        }

        self.send(op, route, &snapshot, now);
    }

    /// Pick the target node: replica copy, guessed owner or active owner
    fn route(&self, op: &Operation, snapshot: &TopologySnapshot) -> Result<VBucketRoute, RoutingError> {
        if let Some(replica) = op.replica {
            return VBucketMap::resolve_replica(&op.key, snapshot, replica);
        }
        match VBucketMap::resolve(&op.key, snapshot) {
            Ok(mut route) => {
                if let Some(guess) = self.guesser.preferred(route.vbucket) {
                    route.node = guess;
                }
                Ok(route)
            }
            Err(RoutingError::NoActiveOwner { vbucket }) => self
                .guesser
                .preferred(vbucket)
                .map(|node| VBucketRoute { vbucket, node })
                .ok_or(RoutingError::NoActiveOwner { vbucket }),
            Err(e) => Err(e),
        }
    }

    fn send(&self, op: Operation, route: VBucketRoute, snapshot: &TopologySnapshot, now: Instant) {
        let Some(node) = snapshot.node(route.node) else {
            self.retry_or_fail(op, TransportError::NotConnected(route.node).into(), now);
            return;
        };

        let opaque = self.next_opaque.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            opaque,
            kind: op.kind,
            key: op.key.clone(),
            vbucket: route.vbucket,
            payload: op.payload.clone(),
        };
        self.in_flight.lock().insert(
            opaque,
            InFlight {
                op,
                route,
                revision: snapshot.revision(),
                sent_at: now,
                host: node.host.clone(),
                remote: node.address(),
                local_id: format!("{}/{}", self.client_id, route.node),
            },
        );
        DispatchCounters::incr(&self.counters.sent);

        if let Err(e) = self.transport.send(route.node, node, request) {
            let entry = self.in_flight.lock().remove(&opaque);
            if let Some(entry) = entry {
                debug!("Send to node {} failed: {}", route.node, e);
                self.retry_or_fail(entry.op, e.into(), now);
            }
        }
    }

    fn handle_not_my_vbucket(&self, entry: InFlight, response: Response, now: Instant) {
        let InFlight {
            mut op,
            route,
            revision,
            host,
            ..
        } = entry;

        if let Some(document) = response.config.as_deref() {
            match TopologySnapshot::from_json(document, Some(&host)) {
                Ok(snapshot) => {
                    self.monitor.propose(snapshot);
                }
                Err(e) => warn!("Ignoring config attached to not-my-vbucket: {}", e),
            }
        }

        let attempt = op.record_remap();
        self.request_refresh(RefreshReason::NotMyVbucket, now);
        if attempt > self.settings.max_remap_attempts || op.replica.is_some() {
            let error = DispatchError::Topology {
                vbucket: route.vbucket,
                node: route.node,
            };
            self.retry_or_fail(op, error, now);
            return;
        }

        // A newer config may already route the key elsewhere
        if self.monitor.revision() != Some(revision) {
            self.dispatch(op, now);
            return;
        }

        match self.guesser.remap(route.vbucket, route.node) {
            Some(_) => {
                DispatchCounters::incr(&self.counters.remapped);
                self.dispatch(op, now);
            }
            None => {
                self.request_refresh(RefreshReason::GuessesExhausted, now);
                let error = RoutingError::GuessesExhausted {
                    vbucket: route.vbucket,
                };
                self.retry_or_fail(op, error.into(), now);
            }
        }
    }

    fn complete_success(&self, opaque: Opaque, entry: InFlight, response: Response, now: Instant) {
        let InFlight {
            op,
            route,
            remote,
            local_id,
            ..
        } = entry;
        self.guesser.confirm(route.vbucket, route.node);

        let total = now.saturating_duration_since(op.submitted());
        let mut span = Span::new(ServiceType::Kv, op.kind.as_str(), total)
            .with_operation_id(format!("0x{:x}", opaque))
            .with_remote(remote)
            .with_local_id(local_id);
        if let Some(server) = response.server_duration {
            span = span.with_server_duration(server);
        }
        self.tracer.finish_span(&span);
        self.timings.record(op.kind, total);
        self.finish(op, Ok(response));
    }

    fn handle_orphan(&self, opaque: Opaque, response: &Response, now: Instant) {
        let candidate = self.timed_out.lock().remove(&opaque);
        let Some(candidate) = candidate else {
            debug!("Response for unknown opaque {}", opaque);
            return;
        };
        DispatchCounters::incr(&self.counters.orphaned);
        let mut span = Span::new(
            ServiceType::Kv,
            candidate.kind.as_str(),
            now.saturating_duration_since(candidate.sent_at),
        )
        .with_operation_id(format!("0x{:x}", opaque))
        .with_remote(candidate.remote)
        .with_local_id(candidate.local_id)
        .orphaned();
        if let Some(server) = response.server_duration {
            span = span.with_server_duration(server);
        }
        self.tracer.finish_span(&span);
    }

    // ===== Retries, deferral and completion =====

    fn retry_or_fail(&self, op: Operation, error: DispatchError, now: Instant) {
        if let Err(Rejected { op, error }) = self.retryq.enqueue(op, error, now) {
            self.finish(op, Err(error));
        }
    }

    fn defer(&self, op: Operation) {
        DispatchCounters::incr(&self.counters.deferred);
        self.deferred.lock().push_back(op);
    }

    fn finish(&self, op: Operation, result: Result<Response, DispatchError>) {
        match &result {
            Ok(_) => DispatchCounters::incr(&self.counters.succeeded),
            Err(e) => {
                debug!("{} failed: {}", op.kind, e);
                DispatchCounters::incr(&self.counters.failed);
            }
        }
        op.complete(result);
    }

    /// Run bootstrap actions to quiescence, then replay and retry
    fn pump(&self, first: BootstrapAction, now: Instant) {
        let mut pending = VecDeque::from([first]);
        loop {
            while let Some(action) = pending.pop_front() {
                if let Some(next) = self.execute(action, now) {
                    pending.push_back(next);
                }
            }
            pending.extend(self.bootstrap.take_actions());
            if pending.is_empty() {
                break;
            }
        }

        if self.bootstrap.is_ready() {
            self.replay_deferred(now);
        }
        self.process_retries(now);
    }

    fn execute(&self, action: BootstrapAction, now: Instant) -> Option<BootstrapAction> {
        match action {
            BootstrapAction::ResolveSeeds => match self.resolver.resolve(&self.spec) {
                ResolveOutcome::Resolved(seeds) => Some(self.bootstrap.on_seeds_resolved(Ok(seeds), now)),
                ResolveOutcome::Failed(reason) => Some(self.bootstrap.on_seeds_resolved(Err(reason), now)),
                ResolveOutcome::Pending => None,
            },
            BootstrapAction::Connect(seeds) => {
                for seed in &seeds {
                    debug!("Connecting to seed {}", seed);
                    self.transport.connect(seed);
                }
                None
            }
            BootstrapAction::RequestConfig => {
                self.request_refresh(RefreshReason::Bootstrap, now);
                None
            }
            BootstrapAction::Surface(error) => {
                let waiting: Vec<Operation> = self.deferred.lock().drain(..).collect();
                if !waiting.is_empty() {
                    warn!("Failing {} operations waiting for bootstrap: {}", waiting.len(), error);
                }
                for op in waiting {
                    self.finish(op, Err(error.clone()));
                }
                None
            }
            BootstrapAction::None => None,
        }
    }

    fn replay_deferred(&self, now: Instant) {
        let waiting: Vec<Operation> = self.deferred.lock().drain(..).collect();
        if waiting.is_empty() {
            return;
        }
        debug!("Replaying {} deferred operations", waiting.len());
        for op in waiting {
            self.dispatch(op, now);
        }
    }

    fn process_retries(&self, now: Instant) {
        let drained = self.retryq.drain(now);
        for Rejected { op, error } in drained.failed {
            self.finish(op, Err(error));
        }
        for op in drained.ready {
            self.dispatch(op, now);
        }
    }

    fn expire_in_flight(&self, now: Instant) {
        let timeout = self.settings.operation_timeout;
        let mut expired: Vec<(Opaque, InFlight)> = {
            let mut in_flight = self.in_flight.lock();
            let ids: Vec<Opaque> = in_flight
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.op.submitted()) >= timeout)
                .map(|(&opaque, _)| opaque)
                .collect();
            ids.into_iter()
                .filter_map(|opaque| in_flight.remove(&opaque).map(|e| (opaque, e)))
                .collect()
        };
        expired.sort_by_key(|(opaque, _)| *opaque);

        for (opaque, entry) in expired {
            self.timed_out.lock().insert(
                opaque,
                OrphanCandidate {
                    kind: entry.op.kind,
                    sent_at: entry.sent_at,
                    remote: entry.remote.clone(),
                    local_id: entry.local_id.clone(),
                },
            );
            let error = timeout_error(&entry.op, ErrorKind::TimeoutInFlight, now);
            self.finish(entry.op, Err(error));
        }
    }

    fn expire_deferred(&self, now: Instant) {
        let timeout = self.settings.operation_timeout;
        let expired: Vec<Operation> = {
            let mut deferred = self.deferred.lock();
            let (expired, waiting): (Vec<Operation>, Vec<Operation>) = deferred
                .drain(..)
                .partition(|op| now.saturating_duration_since(op.submitted()) >= timeout);
            deferred.extend(waiting);
            expired
        };
        for op in expired {
            let error = timeout_error(&op, ErrorKind::NoConfig, now);
            self.finish(op, Err(error));
        }
    }

    // ===== Helpers =====

    fn request_refresh(&self, reason: RefreshReason, now: Instant) {
        if !self.is_destroying() {
            self.monitor.request_refresh(reason, now);
        }
    }

    fn is_node_down(&self, snapshot: &TopologySnapshot, node: usize) -> bool {
        snapshot
            .node(node)
            .is_some_and(|n| self.connections.lock().down.contains(&n.address()))
    }

    fn arm_timer(&self, kind: TimerKind) {
        let after: Duration = match kind {
            TimerKind::RetryTick => self.settings.retry.tick_interval,
            TimerKind::OrphanFlush => self.tracer.orphan_flush_interval(),
            TimerKind::ThresholdFlush => self.tracer.threshold_flush_interval(),
            TimerKind::ConfigPoll => match self.settings.config_poll_interval {
                Some(interval) => interval,
                None => return,
            },
        };
        let handle = self.transport.schedule_timer(after, kind);
        self.timers.lock().insert(kind, handle);
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timeout_error(op: &Operation, last: ErrorKind, now: Instant) -> DispatchError {
    DispatchError::OperationTimeout {
        elapsed_ms: now.saturating_duration_since(op.submitted()).as_millis() as u64,
        retries: op.retries(),
        last,
    }
}
