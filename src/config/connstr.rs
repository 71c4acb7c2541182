//! Connection string parsing
//!
//! Format: `scheme://host1[:port],host2[:port]/bucket?key=value&key=value`
//!
//! - `couchbase://` seeds use the plain data port (11210)
//! - `couchbases://` seeds use the TLS data port (11207)
//! - `http://` seeds use the management port (8091)
//!
//! Hosts may be separated by `,` or `;`; IPv6 literals go in brackets.

use std::fmt;

use super::settings::DispatchSettings;
use crate::utils::ConfigError;

/// Connection string scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Couchbase,
    Couchbases,
    Http,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "couchbase" => Some(Scheme::Couchbase),
            "couchbases" => Some(Scheme::Couchbases),
            "http" => Some(Scheme::Http),
            _ => None,
        }
    }

    /// Port used for seeds listed without one
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Couchbase => 11210,
            Scheme::Couchbases => 11207,
            Scheme::Http => 8091,
        }
    }
}

/// A bootstrap seed address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeedHost {
    pub host: String,
    pub port: u16,
}

impl SeedHost {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SeedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parsed connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub scheme: Scheme,
    pub hosts: Vec<SeedHost>,
    pub bucket: Option<String>,
    /// Raw `key=value` options, in order of appearance
    pub options: Vec<(String, String)>,
}

impl ConnectionSpec {
    /// Parse a connection string
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let input = input.trim();
        let (scheme_str, rest) = input
            .split_once("://")
            .ok_or_else(|| ConfigError::InvalidConnectionSpec(format!("missing scheme in '{}'", input)))?;
        let scheme = Scheme::parse(scheme_str).ok_or_else(|| {
            ConfigError::InvalidConnectionSpec(format!("unsupported scheme '{}'", scheme_str))
        })?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };
        let (host_list, bucket) = match location.split_once('/') {
            Some((hosts, bucket)) if !bucket.is_empty() => (hosts, Some(bucket.to_string())),
            Some((hosts, _)) => (hosts, None),
            None => (location, None),
        };

        let mut hosts = Vec::new();
        for entry in host_list.split([',', ';']) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            hosts.push(Self::parse_host(entry, scheme.default_port())?);
        }
        if hosts.is_empty() {
            hosts.push(SeedHost::new("localhost", scheme.default_port()));
        }

        let mut options = Vec::new();
        if let Some(query) = query {
            for pair in query.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    ConfigError::InvalidConnectionSpec(format!("option '{}' has no value", pair))
                })?;
                options.push((key.to_string(), value.to_string()));
            }
        }

        Ok(Self {
            scheme,
            hosts,
            bucket,
            options,
        })
    }

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    fn parse_host(entry: &str, default_port: u16) -> Result<SeedHost, ConfigError> {
        let bad = || ConfigError::InvalidConnectionSpec(format!("invalid host '{}'", entry));

        if let Some(stripped) = entry.strip_prefix('[') {
            let (host, tail) = stripped.split_once(']').ok_or_else(bad)?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| bad())?,
                None if tail.is_empty() => default_port,
                None => return Err(bad()),
            };
            return Ok(SeedHost::new(host, port));
        }

        match entry.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse().map_err(|_| bad())?;
                Ok(SeedHost::new(host, port))
            }
            Some(_) => Err(bad()),
            None => Ok(SeedHost::new(entry, default_port)),
        }
    }

    /// Build settings from defaults plus the options in this spec
    pub fn settings(&self) -> Result<DispatchSettings, ConfigError> {
        let mut settings = DispatchSettings::default();
        settings.apply_options(self.options.iter().map(|(k, v)| (k.as_str(), v.as_str())))?;
        Ok(settings)
    }
}
