//! vbucket-dispatch-sim - drive the dispatch core against a simulated cluster
//!
//! The cluster lives in memory behind a `LoopbackTransport`. Time is
//! virtual: every submitted operation advances the clock by the simulated
//! request latency, and timers fire when the clock passes their deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vbucket_dispatch::bootstrap::StaticResolver;
use vbucket_dispatch::cluster::{ConfigSource, Revision, StaticSource, TopologySnapshot};
use vbucket_dispatch::config::{ConnectionSpec, SimArgs};
use vbucket_dispatch::dispatch::{Instance, Operation};
use vbucket_dispatch::retry::OperationKind;
use vbucket_dispatch::transport::{LoopbackTransport, Response, TimerKind};

/// Operations submitted between the failover and the cluster publishing it
const CONFIG_PUBLISH_LAG: u64 = 500;

fn setup_logging(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")
}

/// Server side of the simulation: the topology the nodes actually follow
struct SimCluster {
    truth: TopologySnapshot,
    source: Arc<StaticSource>,
    transport: Arc<LoopbackTransport>,
    server_latency: Duration,
}

impl SimCluster {
    /// Answer every request on the wire, including ones sent while answering
    fn deliver(&self, instance: &Instance, now: Instant) {
        loop {
            let sent = self.transport.take_sent();
            if sent.is_empty() {
                break;
            }
            for req in sent {
                let owner = self.truth.active_for(req.request.vbucket);
                let response = if owner == Some(req.node) {
                    Response::success(req.request.payload.clone())
                } else {
                    Response::not_my_vbucket(Some(self.truth.to_json().to_string()))
                };
                instance.handle_response(
                    req.request.opaque,
                    response.with_server_duration(self.server_latency),
                    now,
                );
            }
        }
    }

    /// Fail `node` over; the new config is only served once published
    fn fail_over(&mut self, node: usize) -> Result<()> {
        let current = self.truth.revision();
        self.truth = self
            .truth
            .failed_over(node, Revision::new(current.epoch, current.rev + 1))?;
        self.transport.set_node_down(node, true);
        Ok(())
    }

    fn publish(&self) {
        self.source.set_snapshot(&self.truth);
    }
}

/// Fire every timer whose deadline passed
fn fire_due_timers(
    transport: &LoopbackTransport,
    instance: &Instance,
    armed_at: &mut HashMap<TimerKind, Instant>,
    now: Instant,
) {
    for timer in transport.timers() {
        let armed = *armed_at.entry(timer.kind).or_insert(now);
        if now >= armed + timer.after && transport.fire(timer.kind).is_some() {
            armed_at.insert(timer.kind, now);
            instance.on_timer(timer.kind, now);
        }
    }
}

fn run() -> Result<()> {
    let args = SimArgs::parse_args();
    setup_logging(args.verbose, args.quiet)?;

    let spec = ConnectionSpec::parse(&args.connstr).context("Invalid connection string")?;
    let settings = spec.settings().context("Invalid dispatch options")?;
    let operation_timeout = settings.operation_timeout;
    let tick = settings.retry.tick_interval;

    let initial = TopologySnapshot::uniform(args.nodes, args.vbuckets, args.replicas, Revision::new(1, 1))?;
    if let Some(node) = args.fail_node {
        anyhow::ensure!(node < args.nodes, "--fail-node {} out of range (0..{})", node, args.nodes);
    }

    let transport = Arc::new(LoopbackTransport::new());
    let source = Arc::new(StaticSource::from_snapshot(&initial));
    let latency = Duration::from_micros(args.latency_us);
    let mut cluster = SimCluster {
        truth: initial,
        source: source.clone(),
        transport: transport.clone(),
        server_latency: latency / 2,
    };

    let instance = Instance::new(
        settings,
        spec,
        transport.clone(),
        Arc::new(StaticResolver),
        vec![source as Arc<dyn ConfigSource>],
    );

    println!("vbucket-dispatch-sim v{}", env!("CARGO_PKG_VERSION"));
    println!("====================================");
    println!(
        "Nodes: {}, vBuckets: {}, Replicas: {}",
        args.nodes, args.vbuckets, args.replicas
    );
    println!("Operations: {}, Keyspace: {}", args.ops, args.keyspace);
    if let Some(node) = args.fail_node {
        println!("Failover: node {} at op {}", node, args.fail_at);
    }
    println!("====================================\n");

    let t0 = Instant::now();
    let mut now = t0;
    let mut armed_at: HashMap<TimerKind, Instant> = HashMap::new();

    instance.start(now);
    for seed in transport.take_connects() {
        instance.on_connection_up(&seed.to_string(), now);
    }
    info!("Bootstrap state: {}", instance.bootstrap_state());

    let outcomes: Arc<Mutex<BTreeMap<String, u64>>> = Arc::new(Mutex::new(BTreeMap::new()));
    let mut rng = fastrand::Rng::with_seed(args.seed);
    let mut publish_at = None;

    for i in 0..args.ops {
        if let Some(node) = args.fail_node.filter(|_| i == args.fail_at) {
            warn!("Failing over node {} at op {}", node, i);
            cluster.fail_over(node)?;
            if let Some(addr) = cluster.truth.node(node).map(|n| n.address()) {
                instance.on_connection_down(&addr, now);
            }
            publish_at = Some(i + CONFIG_PUBLISH_LAG);
        }
        if publish_at == Some(i) {
            info!("Cluster publishes config rev {}", cluster.truth.revision());
            cluster.publish();
        }

        let key = format!("key:{:012}", rng.u64(0..args.keyspace.max(1)));
        let kind = if rng.u8(0..100) < args.write_pct {
            OperationKind::Upsert
        } else {
            OperationKind::Get
        };
        let tally = outcomes.clone();
        let op = Operation::new(kind, key, move |result| {
            let label = match result {
                Ok(_) => "ok".to_string(),
                Err(e) => e.kind().as_str().to_string(),
            };
            *tally.lock().entry(label).or_insert(0) += 1;
        })
        .with_payload(b"value".to_vec());

        instance.submit(op, now);
        now += latency;
        cluster.deliver(&instance, now);
        fire_due_timers(&transport, &instance, &mut armed_at, now);
        cluster.deliver(&instance, now);
    }

    if let Some(at) = publish_at {
        if at >= args.ops {
            cluster.publish();
        }
    }

    // Let queued retries run out
    let deadline = now + operation_timeout + tick;
    while now < deadline && (instance.in_flight_count() > 0 || !instance.retry_queue().is_empty()) {
        now += tick;
        fire_due_timers(&transport, &instance, &mut armed_at, now);
        cluster.deliver(&instance, now);
    }

    instance.on_timer(TimerKind::ThresholdFlush, now);
    instance.on_timer(TimerKind::OrphanFlush, now);
    instance.shutdown();

    let stats = instance.stats();
    println!("\n====================================");
    println!("SIMULATION COMPLETE");
    println!("====================================");
    println!("Virtual time: {:.3}s", now.duration_since(t0).as_secs_f64());
    println!("{}", serde_json::to_string_pretty(&stats)?);

    println!("\nOutcomes:");
    for (label, count) in outcomes.lock().iter() {
        println!("  {}: {}", label, count);
    }

    println!("\nLatency (us):");
    for s in instance.timings().summary() {
        println!(
            "  {:<10} count={} avg={:.1} p50={} p99={} p99.9={} max={}",
            s.operation, s.count, s.mean_us, s.p50_us, s.p99_us, s.p999_us, s.max_us
        );
    }

    println!(
        "\nGuesser: {} remaps, {} exhausted; slow ops: {}, orphans: {}",
        instance.guesser().remap_count(),
        instance.guesser().exhausted_count(),
        instance.tracer().slow_seen(),
        instance.tracer().orphans_seen()
    );

    if stats.completed() != stats.submitted {
        anyhow::bail!(
            "{} operations submitted but {} completed",
            stats.submitted,
            stats.completed()
        );
    }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

