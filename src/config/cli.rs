//! Command-line arguments of the cluster simulator

use clap::Parser;

/// Drive the dispatch core against an in-memory vbucket cluster
#[derive(Parser, Debug, Clone)]
#[command(name = "vbucket-dispatch-sim")]
#[command(version, about, long_about = None)]
pub struct SimArgs {
    /// Connection string (seeds, bucket and dispatch options)
    #[arg(long = "connstr", default_value = "couchbase://127.0.0.1/default")]
    pub connstr: String,

    // ===== Cluster Shape =====
    /// Number of data nodes in the simulated cluster
    #[arg(short = 'n', long = "nodes", default_value_t = 4)]
    pub nodes: usize,

    /// Number of vbuckets
    #[arg(long = "vbuckets", default_value_t = 1024)]
    pub vbuckets: usize,

    /// Replicas per vbucket
    #[arg(short = 'r', long = "replicas", default_value_t = 1)]
    pub replicas: usize,

    // ===== Workload =====
    /// Number of operations to submit
    #[arg(short = 'o', long = "ops", default_value_t = 10_000)]
    pub ops: u64,

    /// Size of the key space
    #[arg(short = 'k', long = "keyspace", default_value_t = 100_000)]
    pub keyspace: u64,

    /// Percentage of mutations in the workload (the rest are reads)
    #[arg(long = "write-pct", default_value_t = 20)]
    pub write_pct: u8,

    /// RNG seed for keys and jitter
    #[arg(long = "seed", default_value_t = 12345)]
    pub seed: u64,

    // ===== Fault Injection =====
    /// Fail over this node partway through the run
    #[arg(long = "fail-node")]
    pub fail_node: Option<usize>,

    /// Operation index at which the failover happens
    #[arg(long = "fail-at", default_value_t = 2_000)]
    pub fail_at: u64,

    /// Simulated per-request latency in microseconds
    #[arg(long = "latency-us", default_value_t = 250)]
    pub latency_us: u64,

    // ===== Output =====
    /// Verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

impl SimArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = SimArgs::try_parse_from(["vbucket-dispatch-sim"]).unwrap();
        assert_eq!(args.nodes, 4);
        assert_eq!(args.vbuckets, 1024);
        assert_eq!(args.fail_node, None);
    }

    #[test]
    fn test_fault_injection_flags() {
        let args = SimArgs::try_parse_from([
            "vbucket-dispatch-sim",
            "--fail-node",
            "2",
            "--fail-at",
            "50",
            "-n",
            "3",
        ])
        .unwrap();
        assert_eq!(args.fail_node, Some(2));
        assert_eq!(args.fail_at, 50);
        assert_eq!(args.nodes, 3);
    }
}
