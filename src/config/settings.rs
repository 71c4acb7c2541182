//! Dispatch settings
//!
//! Every tunable of the dispatch core lives here. Defaults can be overridden
//! with `key=value` options taken from the connection string; durations are
//! given in (fractional) seconds, e.g. `operation_timeout=2.5`.

use std::time::Duration;

use crate::cluster::ServiceType;
use crate::utils::ConfigError;

/// Order in which the guesser proposes alternate owners for a vbucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemapOrder {
    /// Replicas listed for the vbucket first, then every other data node
    #[default]
    ReplicaFirst,
    /// Every data node in index order, ignoring replica lists
    RoundRobin,
}

/// Retry and backoff tunables
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Upper bound of any single backoff delay
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Randomize each delay in `[d/2, d]`
    pub jitter: bool,
    /// Hard cap on the number of retries, independent of the timeout
    pub max_retries: Option<u32>,
    /// Retry non-idempotent operations after an uncertain failure
    pub retry_uncertain_mutations: bool,
    /// How often the retry queue is drained
    pub tick_interval: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: true,
            max_retries: None,
            retry_uncertain_mutations: false,
            tick_interval: Duration::from_millis(10),
        }
    }
}

/// Threshold tracer tunables
#[derive(Debug, Clone)]
pub struct TracerSettings {
    pub orphan_queue_size: usize,
    pub orphan_flush_interval: Duration,
    pub threshold_queue_size: usize,
    pub threshold_flush_interval: Duration,
    pub kv_threshold: Duration,
    pub query_threshold: Duration,
    pub views_threshold: Duration,
    pub search_threshold: Duration,
    pub analytics_threshold: Duration,
}

impl Default for TracerSettings {
    fn default() -> Self {
        Self {
            orphan_queue_size: 128,
            orphan_flush_interval: Duration::from_secs(10),
            threshold_queue_size: 128,
            threshold_flush_interval: Duration::from_secs(10),
            kv_threshold: Duration::from_millis(500),
            query_threshold: Duration::from_secs(1),
            views_threshold: Duration::from_secs(1),
            search_threshold: Duration::from_secs(1),
            analytics_threshold: Duration::from_secs(1),
        }
    }
}

impl TracerSettings {
    /// Latency above which a span of `service` is reported as slow
    pub fn threshold_for(&self, service: ServiceType) -> Duration {
        match service {
            ServiceType::Kv => self.kv_threshold,
            ServiceType::Query => self.query_threshold,
            ServiceType::Views => self.views_threshold,
            ServiceType::Search => self.search_threshold,
            ServiceType::Analytics => self.analytics_threshold,
            ServiceType::Management => self.query_threshold,
        }
    }
}

/// Complete dispatch configuration
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Total time budget of an operation, retries included
    pub operation_timeout: Duration,
    /// How long a single config source may take to answer a refresh
    pub config_node_timeout: Duration,
    /// Background config polling; `None` disables it
    pub config_poll_interval: Option<Duration>,
    /// Time budget of one bootstrap attempt
    pub bootstrap_timeout: Duration,
    /// Consecutive failed bootstrap attempts before giving up
    pub max_bootstrap_attempts: u32,
    /// Local remaps tried for one operation before handing it to the retry queue
    pub max_remap_attempts: u32,
    /// Capacity of each vbucket's guess list
    pub guess_list_cap: usize,
    pub remap_order: RemapOrder,
    pub retry: RetrySettings,
    pub tracer: TracerSettings,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(2500),
            config_node_timeout: Duration::from_secs(2),
            config_poll_interval: Some(Duration::from_millis(2500)),
            bootstrap_timeout: Duration::from_secs(5),
            max_bootstrap_attempts: 3,
            max_remap_attempts: 3,
            guess_list_cap: 4,
            remap_order: RemapOrder::default(),
            retry: RetrySettings::default(),
            tracer: TracerSettings::default(),
        }
    }
}

impl DispatchSettings {
    /// Apply a list of `key=value` options on top of the current values
    pub fn apply_options<'a, I>(&mut self, options: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (key, value) in options {
            self.apply_option(key, value)?;
        }
        Ok(())
    }

    /// Apply a single option
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "operation_timeout" => self.operation_timeout = parse_secs(key, value)?,
            "config_node_timeout" => self.config_node_timeout = parse_secs(key, value)?,
            "config_poll_interval" => {
                let interval = parse_secs(key, value)?;
                self.config_poll_interval = (!interval.is_zero()).then_some(interval);
            }
            "config_total_timeout" => self.bootstrap_timeout = parse_secs(key, value)?,
            "bootstrap_max_attempts" => {
                self.max_bootstrap_attempts = parse_num(key, value)?;
            }
            "max_remap_attempts" => self.max_remap_attempts = parse_num(key, value)?,
            "vbguess_cap" => self.guess_list_cap = parse_num(key, value)?,
            "vbguess_order" => {
                self.remap_order = match value {
                    "replica_first" => RemapOrder::ReplicaFirst,
                    "round_robin" => RemapOrder::RoundRobin,
                    _ => return Err(invalid(key, value, "expected replica_first or round_robin")),
                }
            }
            "retry_interval" => self.retry.initial_backoff = parse_secs(key, value)?,
            "retry_max_backoff" => self.retry.max_backoff = parse_secs(key, value)?,
            "retry_backoff" => {
                let factor: f64 = value
                    .parse()
                    .map_err(|_| invalid(key, value, "expected a number"))?;
                if !factor.is_finite() || factor < 1.0 {
                    return Err(invalid(key, value, "must be >= 1.0"));
                }
                self.retry.backoff_multiplier = factor;
            }
            "retry_jitter" => self.retry.jitter = parse_bool(key, value)?,
            "max_retries" => {
                let max: u32 = parse_num(key, value)?;
                self.retry.max_retries = Some(max);
            }
            "retry_uncertain" => self.retry.retry_uncertain_mutations = parse_bool(key, value)?,
            "retry_tick_interval" => self.retry.tick_interval = parse_secs(key, value)?,
            "tracing_orphaned_queue_size" => {
                self.tracer.orphan_queue_size = parse_num(key, value)?;
            }
            "tracing_orphaned_queue_flush_interval" => {
                self.tracer.orphan_flush_interval = parse_secs(key, value)?;
            }
            "tracing_threshold_queue_size" => {
                self.tracer.threshold_queue_size = parse_num(key, value)?;
            }
            "tracing_threshold_queue_flush_interval" => {
                self.tracer.threshold_flush_interval = parse_secs(key, value)?;
            }
            "tracing_threshold_kv" => self.tracer.kv_threshold = parse_secs(key, value)?,
            "tracing_threshold_query" => self.tracer.query_threshold = parse_secs(key, value)?,
            "tracing_threshold_view" => self.tracer.views_threshold = parse_secs(key, value)?,
            "tracing_threshold_search" => self.tracer.search_threshold = parse_secs(key, value)?,
            "tracing_threshold_analytics" => {
                self.tracer.analytics_threshold = parse_secs(key, value)?;
            }
            _ => return Err(ConfigError::UnknownOption(key.to_string())),
        }
        Ok(())
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidOption {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Upper bound of any duration option (30 days)
const MAX_OPTION_SECS: f64 = 30.0 * 24.0 * 3600.0;

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    let secs: f64 = value
        .parse()
        .map_err(|_| invalid(key, value, "expected seconds"))?;
    if secs > MAX_OPTION_SECS {
        return Err(invalid(key, value, "must not exceed 30 days"));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|_| invalid(key, value, "must be a non-negative number of seconds"))
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(key, value, "expected a non-negative integer"))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = DispatchSettings::default();
        assert_eq!(settings.operation_timeout, Duration::from_millis(2500));
        assert_eq!(settings.max_bootstrap_attempts, 3);
        assert_eq!(settings.remap_order, RemapOrder::ReplicaFirst);
        assert_eq!(settings.tracer.orphan_queue_size, 128);
        assert_eq!(
            settings.tracer.threshold_for(ServiceType::Kv),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_apply_options() {
        let mut settings = DispatchSettings::default();
        settings
            .apply_options([
                ("operation_timeout", "5"),
                ("retry_interval", "0.05"),
                ("max_retries", "7"),
                ("vbguess_order", "round_robin"),
                ("config_poll_interval", "0"),
                ("retry_uncertain", "true"),
            ])
            .unwrap();

        assert_eq!(settings.operation_timeout, Duration::from_secs(5));
        assert_eq!(settings.retry.initial_backoff, Duration::from_millis(50));
        assert_eq!(settings.retry.max_retries, Some(7));
        assert_eq!(settings.remap_order, RemapOrder::RoundRobin);
        assert_eq!(settings.config_poll_interval, None);
        assert!(settings.retry.retry_uncertain_mutations);
    }

    #[test]
    fn test_reject_bad_values() {
        let mut settings = DispatchSettings::default();
        assert!(matches!(
            settings.apply_option("operation_timeout", "-1"),
            Err(ConfigError::InvalidOption { .. })
        ));
        assert!(matches!(
            settings.apply_option("retry_backoff", "0.5"),
            Err(ConfigError::InvalidOption { .. })
        ));
        assert_eq!(
            settings.apply_option("no_such_thing", "1"),
            Err(ConfigError::UnknownOption("no_such_thing".to_string()))
        );
    }

    #[test]
    fn test_reject_out_of_range_durations() {
        let mut settings = DispatchSettings::default();
        for value in ["1e30", "1e15", "2592001", "NaN", "inf"] {
            assert!(
                matches!(
                    settings.apply_option("operation_timeout", value),
                    Err(ConfigError::InvalidOption { .. })
                ),
                "{} accepted",
                value
            );
        }
        assert_eq!(settings.operation_timeout, Duration::from_millis(2500));

        settings.apply_option("operation_timeout", "2592000").unwrap();
        assert_eq!(settings.operation_timeout, Duration::from_secs(2_592_000));
    }
}
