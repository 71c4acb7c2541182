//! Cluster node representation

use std::fmt;

/// Services a node may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceType {
    Kv,
    Management,
    Views,
    Query,
    Search,
    Analytics,
}

impl ServiceType {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceType::Kv => "kv",
            ServiceType::Management => "mgmt",
            ServiceType::Views => "views",
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
        }
    }

    /// Map a key of the `services` object in the cluster config
    pub fn from_config_key(key: &str) -> Option<Self> {
        match key {
            "kv" => Some(ServiceType::Kv),
            "mgmt" => Some(ServiceType::Management),
            "capi" => Some(ServiceType::Views),
            "n1ql" => Some(ServiceType::Query),
            "fts" => Some(ServiceType::Search),
            "cbas" => Some(ServiceType::Analytics),
            _ => None,
        }
    }

    /// Key used for this service in the cluster config
    pub fn config_key(self) -> &'static str {
        match self {
            ServiceType::Kv => "kv",
            ServiceType::Management => "mgmt",
            ServiceType::Views => "capi",
            ServiceType::Query => "n1ql",
            ServiceType::Search => "fts",
            ServiceType::Analytics => "cbas",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-service ports of a node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePorts {
    ports: Vec<(ServiceType, u16)>,
}

impl ServicePorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, service: ServiceType, port: u16) -> Self {
        self.set(service, port);
        self
    }

    pub fn set(&mut self, service: ServiceType, port: u16) {
        match self.ports.iter_mut().find(|(s, _)| *s == service) {
            Some(entry) => entry.1 = port,
            None => {
                self.ports.push((service, port));
                self.ports.sort_by_key(|(s, _)| *s);
            }
        }
    }

    pub fn get(&self, service: ServiceType) -> Option<u16> {
        self.ports
            .iter()
            .find(|(s, _)| *s == service)
            .map(|(_, port)| *port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServiceType, u16)> + '_ {
        self.ports.iter().copied()
    }
}

/// A node as described by a topology snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// Hostname or IP
    pub host: String,
    /// Ports of the services this node runs
    pub ports: ServicePorts,
    /// Does this node serve vbuckets?
    pub data: bool,
}

impl NodeDescriptor {
    /// A data node listening on `kv_port`
    pub fn data_node(host: impl Into<String>, kv_port: u16) -> Self {
        Self {
            host: host.into(),
            ports: ServicePorts::new().with(ServiceType::Kv, kv_port),
            data: true,
        }
    }

    pub fn port(&self, service: ServiceType) -> Option<u16> {
        self.ports.get(service)
    }

    pub fn has_service(&self, service: ServiceType) -> bool {
        self.ports.get(service).is_some()
    }

    /// Data-service address as `host:port`
    pub fn address(&self) -> String {
        let port = self.port(ServiceType::Kv).unwrap_or(0);
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }
}

/// Parse a `host:port` entry of the config's server list
pub(crate) fn parse_server_entry(entry: &str) -> Option<(String, u16)> {
    if let Some(stripped) = entry.strip_prefix('[') {
        let (host, tail) = stripped.split_once("]:")?;
        return Some((host.to_string(), tail.parse().ok()?));
    }
    let (host, port) = entry.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_ports() {
        let ports = ServicePorts::new()
            .with(ServiceType::Query, 8093)
            .with(ServiceType::Kv, 11210)
            .with(ServiceType::Kv, 12000);
        assert_eq!(ports.get(ServiceType::Kv), Some(12000));
        assert_eq!(ports.get(ServiceType::Search), None);
        // kept sorted by service
        let services: Vec<_> = ports.iter().map(|(s, _)| s).collect();
        assert_eq!(services, vec![ServiceType::Kv, ServiceType::Query]);
    }

    #[test]
    fn test_node_address() {
        assert_eq!(NodeDescriptor::data_node("10.0.0.1", 11210).address(), "10.0.0.1:11210");
        assert_eq!(NodeDescriptor::data_node("::1", 11210).address(), "[::1]:11210");
    }

    #[test]
    fn test_parse_server_entry() {
        assert_eq!(
            parse_server_entry("10.0.0.1:11210"),
            Some(("10.0.0.1".to_string(), 11210))
        );
        assert_eq!(parse_server_entry("[::1]:11210"), Some(("::1".to_string(), 11210)));
        assert_eq!(parse_server_entry("no-port"), None);
        assert_eq!(parse_server_entry(":11210"), None);
    }

    #[test]
    fn test_service_config_keys() {
        for service in [
            ServiceType::Kv,
            ServiceType::Management,
            ServiceType::Views,
            ServiceType::Query,
            ServiceType::Search,
            ServiceType::Analytics,
        ] {
            assert_eq!(ServiceType::from_config_key(service.config_key()), Some(service));
        }
        assert_eq!(ServiceType::from_config_key("eventing"), None);
    }
}
