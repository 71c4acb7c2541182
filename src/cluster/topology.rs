//! Immutable cluster topology snapshots
//!
//! A snapshot is built once (from the cluster's JSON configuration document
//! or programmatically) and never mutated afterwards. Newer configurations
//! always produce a new snapshot which replaces the old one as a whole.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde_json::json;

use super::node::{parse_server_entry, NodeDescriptor, ServicePorts, ServiceType};
use crate::utils::ConfigError;

/// Monotonically comparable configuration revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision {
    /// Bumped by the cluster when revision numbering restarts
    pub epoch: i64,
    pub rev: i64,
}

impl Revision {
    pub const fn new(epoch: i64, rev: i64) -> Self {
        Self { epoch, rev }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.rev)
    }
}

/// Ownership of one vbucket
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VBucketEntry {
    /// Active owner; `None` while the cluster moves the vbucket
    pub active: Option<usize>,
    /// Replica owners in replica order
    pub replicas: Vec<usize>,
}

/// Cluster topology snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    /// Data nodes first (their positions are the vbucket node indices),
    /// followed by nodes without the data service
    nodes: Vec<NodeDescriptor>,
    vbuckets: Vec<VBucketEntry>,
    num_replicas: usize,
    revision: Revision,
    bucket_uuid: Option<String>,
    bucket_name: Option<String>,
}

impl TopologySnapshot {
    /// Build a snapshot, validating every node index in the vbucket table
    pub fn new(
        nodes: Vec<NodeDescriptor>,
        vbuckets: Vec<VBucketEntry>,
        num_replicas: usize,
        revision: Revision,
    ) -> Result<Self, ConfigError> {
        if vbuckets.is_empty() || !nodes.iter().any(|n| n.data) {
            return Err(ConfigError::EmptyTopology);
        }
        for (vb, entry) in vbuckets.iter().enumerate() {
            for &idx in entry.active.iter().chain(entry.replicas.iter()) {
                if nodes.get(idx).map_or(true, |n| !n.data) {
                    return Err(ConfigError::BadNodeIndex {
                        vbucket: vb,
                        index: idx as i64,
                    });
                }
            }
        }
        Ok(Self {
            nodes,
            vbuckets,
            num_replicas,
            revision,
            bucket_uuid: None,
            bucket_name: None,
        })
    }

    /// Attach bucket identity
    pub fn with_bucket(mut self, name: Option<String>, uuid: Option<String>) -> Self {
        self.bucket_name = name;
        self.bucket_uuid = uuid;
        self
    }

    /// Evenly spread `num_vbuckets` over `num_nodes` local data nodes
    ///
    /// Node `i` listens on `127.0.0.1:11210 + i`. Replica `r` of a vbucket
    /// lives `r + 1` nodes after its active owner.
    pub fn uniform(
        num_nodes: usize,
        num_vbuckets: usize,
        num_replicas: usize,
        revision: Revision,
    ) -> Result<Self, ConfigError> {
        let nodes = (0..num_nodes)
            .map(|i| NodeDescriptor::data_node("127.0.0.1", 11210 + i as u16))
            .collect();
        let replicas = num_replicas.min(num_nodes.saturating_sub(1));
        let vbuckets = (0..num_vbuckets)
            .map(|vb| VBucketEntry {
                active: Some(vb % num_nodes.max(1)),
                replicas: (1..=replicas).map(|r| (vb + r) % num_nodes).collect(),
            })
            .collect();
        Self::new(nodes, vbuckets, num_replicas, revision)
    }

    /// Parse the cluster's JSON configuration document
    ///
    /// `origin` replaces the `$HOST` placeholder the cluster uses for the
    /// node that served the document.
    pub fn from_json(document: &str, origin: Option<&str>) -> Result<Self, ConfigError> {
        let document = match origin {
            Some(host) => document.replace("$HOST", host),
            None => document.to_string(),
        };
        let raw: RawConfig =
            serde_json::from_str(&document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let server_map = raw
            .vbucket_server_map
            .ok_or_else(|| ConfigError::Parse("missing vBucketServerMap".to_string()))?;
        if server_map.server_list.is_empty() {
            return Err(ConfigError::EmptyTopology);
        }

        // Service ports from nodesExt, keyed by (host, kv port)
        let mut ext_ports: HashMap<(String, u16), ServicePorts> = HashMap::new();
        let mut non_data: Vec<NodeDescriptor> = Vec::new();
        for ext in &raw.nodes_ext {
            let host = ext
                .hostname
                .clone()
                .or_else(|| origin.map(str::to_string))
                .unwrap_or_else(|| "localhost".to_string());
            let mut ports = ServicePorts::new();
            for (key, port) in &ext.services {
                if let Some(service) = ServiceType::from_config_key(key) {
                    ports.set(service, *port);
                }
            }
            match ports.get(ServiceType::Kv) {
                Some(kv) => {
                    ext_ports.insert((host, kv), ports);
                }
                None => non_data.push(NodeDescriptor {
                    host,
                    ports,
                    data: false,
                }),
            }
        }

        let mut nodes = Vec::with_capacity(server_map.server_list.len() + non_data.len());
        for entry in &server_map.server_list {
            let (host, kv_port) = parse_server_entry(entry)
                .ok_or_else(|| ConfigError::Parse(format!("bad server entry '{}'", entry)))?;
            let ports = ext_ports
                .remove(&(host.clone(), kv_port))
                .unwrap_or_else(|| ServicePorts::new().with(ServiceType::Kv, kv_port));
            nodes.push(NodeDescriptor {
                host,
                ports,
                data: true,
            });
        }
        nodes.extend(non_data);

        let num_servers = server_map.server_list.len() as i64;
        let mut vbuckets = Vec::with_capacity(server_map.vbucket_map.len());
        for (vb, row) in server_map.vbucket_map.iter().enumerate() {
            let mut indices = Vec::with_capacity(row.len());
            for &idx in row {
                if idx < -1 || idx >= num_servers {
                    return Err(ConfigError::BadNodeIndex { vbucket: vb, index: idx });
                }
                indices.push((idx >= 0).then_some(idx as usize));
            }
            let mut iter = indices.into_iter();
            let active = iter.next().flatten();
            let replicas = iter.flatten().collect();
            vbuckets.push(VBucketEntry { active, replicas });
        }

        Ok(Self::new(
            nodes,
            vbuckets,
            server_map.num_replicas,
            Revision::new(raw.rev_epoch, raw.rev),
        )?
        .with_bucket(raw.name, raw.uuid))
    }

    /// Render back into the cluster's JSON configuration format
    pub fn to_json(&self) -> serde_json::Value {
        let server_list: Vec<String> = self.data_nodes().map(|(_, n)| n.address()).collect();
        let nodes_ext: Vec<serde_json::Value> = self
            .nodes
            .iter()
            .map(|n| {
                let services: serde_json::Map<String, serde_json::Value> = n
                    .ports
                    .iter()
                    .map(|(s, p)| (s.config_key().to_string(), json!(p)))
                    .collect();
                json!({ "hostname": n.host, "services": services })
            })
            .collect();
        let vbucket_map: Vec<Vec<i64>> = self
            .vbuckets
            .iter()
            .map(|e| {
                let mut row = vec![e.active.map_or(-1, |i| i as i64)];
                row.extend(e.replicas.iter().map(|&i| i as i64));
                row.resize(self.num_replicas + 1, -1);
                row
            })
            .collect();

        json!({
            "rev": self.revision.rev,
            "revEpoch": self.revision.epoch,
            "name": self.bucket_name,
            "uuid": self.bucket_uuid,
            "nodesExt": nodes_ext,
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": self.num_replicas,
                "serverList": server_list,
                "vBucketMap": vbucket_map,
            }
        })
    }

    /// Copy of this topology with `node` failed over under a new revision
    ///
    /// Every vbucket owned by `node` is handed to its first surviving replica
    /// (or left without an owner), and `node` is removed from replica lists.
    pub fn failed_over(&self, node: usize, revision: Revision) -> Result<Self, ConfigError> {
        let vbuckets = self
            .vbuckets
            .iter()
            .map(|entry| {
                let replicas: Vec<usize> =
                    entry.replicas.iter().copied().filter(|&r| r != node).collect();
                if entry.active == Some(node) {
                    let mut rest = replicas.into_iter();
                    let active = rest.next();
                    VBucketEntry {
                        active,
                        replicas: rest.collect(),
                    }
                } else {
                    VBucketEntry {
                        active: entry.active,
                        replicas,
                    }
                }
            })
            .collect();
        Ok(Self::new(self.nodes.clone(), vbuckets, self.num_replicas, revision)?
            .with_bucket(self.bucket_name.clone(), self.bucket_uuid.clone()))
    }

    /// Does this snapshot replace `current`?
    ///
    /// A change of bucket UUID is a discontinuity (bucket recreated) and
    /// always wins; otherwise the revision must be strictly greater.
    pub fn supersedes(&self, current: &TopologySnapshot) -> bool {
        if let (Some(new_uuid), Some(cur_uuid)) = (&self.bucket_uuid, &current.bucket_uuid) {
            if new_uuid != cur_uuid {
                return true;
            }
        }
        self.revision > current.revision
    }

    /// Can this snapshot serve data operations?
    pub fn is_ready_eligible(&self) -> bool {
        self.vbuckets.iter().any(|e| e.active.is_some())
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    pub fn bucket_uuid(&self) -> Option<&str> {
        self.bucket_uuid.as_deref()
    }

    pub fn bucket_name(&self) -> Option<&str> {
        self.bucket_name.as_deref()
    }

    pub fn nodes(&self) -> &[NodeDescriptor] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> Option<&NodeDescriptor> {
        self.nodes.get(idx)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Data nodes with their indices
    pub fn data_nodes(&self) -> impl Iterator<Item = (usize, &NodeDescriptor)> {
        self.nodes.iter().enumerate().filter(|(_, n)| n.data)
    }

    pub fn num_data_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.data).count()
    }

    pub fn is_data_node(&self, idx: usize) -> bool {
        self.nodes.get(idx).is_some_and(|n| n.data)
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbuckets.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn vbucket(&self, vbucket: u16) -> Option<&VBucketEntry> {
        self.vbuckets.get(vbucket as usize)
    }

    pub fn active_for(&self, vbucket: u16) -> Option<usize> {
        self.vbucket(vbucket).and_then(|e| e.active)
    }

    /// Number of vbuckets each node is active for
    pub fn active_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.nodes.len()];
        for idx in self.vbuckets.iter().filter_map(|e| e.active) {
            counts[idx] += 1;
        }
        counts
    }
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    rev: i64,
    #[serde(default, rename = "revEpoch")]
    rev_epoch: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default, rename = "nodesExt")]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: Option<RawServerMap>,
}

#[derive(Deserialize)]
struct RawNodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Deserialize)]
struct RawServerMap {
    #[serde(default, rename = "numReplicas")]
    num_replicas: usize,
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "rev": 1073,
        "revEpoch": 2,
        "name": "default",
        "uuid": "a1b2c3",
        "nodesExt": [
            {"hostname": "10.0.0.1", "services": {"kv": 11210, "mgmt": 8091, "n1ql": 8093}},
            {"hostname": "10.0.0.2", "services": {"kv": 11210, "mgmt": 8091}},
            {"hostname": "10.0.0.3", "services": {"mgmt": 8091, "fts": 8094}}
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 1,
            "serverList": ["10.0.0.1:11210", "10.0.0.2:11210"],
            "vBucketMap": [[0, 1], [1, 0], [-1, 1], [1, -1]]
        }
    }"#;

    #[test]
    fn test_parse_config() {
        let snap = TopologySnapshot::from_json(CONFIG, None).unwrap();

        assert_eq!(snap.revision(), Revision::new(2, 1073));
        assert_eq!(snap.bucket_uuid(), Some("a1b2c3"));
        assert_eq!(snap.bucket_name(), Some("default"));
        assert_eq!(snap.num_nodes(), 3);
        assert_eq!(snap.num_data_nodes(), 2);
        assert_eq!(snap.num_vbuckets(), 4);

        assert_eq!(snap.node(0).unwrap().port(ServiceType::Query), Some(8093));
        assert!(!snap.is_data_node(2));
        assert_eq!(snap.node(2).unwrap().port(ServiceType::Search), Some(8094));

        assert_eq!(snap.vbucket(0).unwrap().replicas, vec![1]);
        assert_eq!(snap.active_for(2), None);
        assert_eq!(snap.vbucket(3).unwrap().replicas, Vec::<usize>::new());
    }

    #[test]
    fn test_parse_host_placeholder() {
        let doc = r#"{"rev": 1, "vBucketServerMap": {"numReplicas": 0,
            "serverList": ["$HOST:11210"], "vBucketMap": [[0], [0]]}}"#;
        let snap = TopologySnapshot::from_json(doc, Some("192.168.1.5")).unwrap();
        assert_eq!(snap.node(0).unwrap().address(), "192.168.1.5:11210");
    }

    #[test]
    fn test_parse_rejects_bad_index() {
        let doc = r#"{"rev": 1, "vBucketServerMap": {"numReplicas": 0,
            "serverList": ["a:1"], "vBucketMap": [[0], [3]]}}"#;
        assert_eq!(
            TopologySnapshot::from_json(doc, None),
            Err(ConfigError::BadNodeIndex { vbucket: 1, index: 3 })
        );
    }

    #[test]
    fn test_parse_rejects_empty() {
        let doc = r#"{"rev": 1, "vBucketServerMap": {"serverList": [], "vBucketMap": []}}"#;
        assert_eq!(TopologySnapshot::from_json(doc, None), Err(ConfigError::EmptyTopology));
        assert!(matches!(
            TopologySnapshot::from_json("{not json", None),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_json_round_trip_preserves_ownership() {
        let snap = TopologySnapshot::from_json(CONFIG, None).unwrap();
        let rendered = snap.to_json().to_string();
        let reparsed = TopologySnapshot::from_json(&rendered, None).unwrap();
        assert_eq!(reparsed, snap);
    }

    #[test]
    fn test_supersedes() {
        let base = TopologySnapshot::uniform(2, 8, 1, Revision::new(1, 5)).unwrap();
        let newer = TopologySnapshot::uniform(2, 8, 1, Revision::new(1, 6)).unwrap();
        let new_epoch = TopologySnapshot::uniform(2, 8, 1, Revision::new(2, 0)).unwrap();
        let older = TopologySnapshot::uniform(2, 8, 1, Revision::new(1, 3)).unwrap();

        assert!(newer.supersedes(&base));
        assert!(new_epoch.supersedes(&newer));
        assert!(!older.supersedes(&base));
        assert!(!base.supersedes(&base));

        let recreated = older
            .clone()
            .with_bucket(Some("default".into()), Some("uuid-2".into()));
        let current = base.with_bucket(Some("default".into()), Some("uuid-1".into()));
        assert!(recreated.supersedes(&current));
    }

    #[test]
    fn test_uniform_and_failover() {
        let snap = TopologySnapshot::uniform(3, 6, 1, Revision::new(0, 1)).unwrap();
        assert_eq!(snap.active_counts(), vec![2, 2, 2]);
        assert_eq!(snap.vbucket(0).unwrap().replicas, vec![1]);

        let failed = snap.failed_over(0, Revision::new(0, 2)).unwrap();
        assert_eq!(failed.active_counts(), vec![0, 4, 2]);
        assert_eq!(failed.active_for(0), Some(1));
        assert!(failed.vbucket(2).unwrap().replicas.is_empty());
        assert!(failed.supersedes(&snap));
    }
}
