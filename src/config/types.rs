use crate::health::probe::CustomProbe;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level control plane configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub health: HealthConfig,

    /// Defaults applied to every breaker created through the registry.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Etcd,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default)]
    pub etcd: EtcdConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    #[serde(default = "default_etcd_endpoints")]
    pub endpoints: Vec<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Per-request timeout for store I/O (seconds).
    #[serde(default = "default_etcd_timeout")]
    pub timeout_secs: f64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: default_etcd_endpoints(),
            username: None,
            password: None,
            timeout_secs: default_etcd_timeout(),
        }
    }
}

fn default_etcd_endpoints() -> Vec<String> {
    vec!["http://127.0.0.1:2379".to_string()]
}

fn default_etcd_timeout() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// First segment of every key: `<prefix>:<tenant>:<service>:<instance>`.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Lease length in seconds. A record expires this long after its last write.
    #[serde(default = "default_service_ttl")]
    pub service_ttl_secs: f64,

    /// Must be shorter than `service_ttl_secs`.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: f64,

    /// Lifetime of locally cached discovery results.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: f64,

    /// Capacity of the event broadcast channel; slow subscribers lag past it.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            service_ttl_secs: default_service_ttl(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            cache_ttl_secs: default_cache_ttl(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl RegistryConfig {
    pub fn service_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.service_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.cache_ttl_secs)
    }
}

fn default_key_prefix() -> String {
    "services".to_string()
}

fn default_service_ttl() -> f64 {
    30.0
}

fn default_heartbeat_interval() -> f64 {
    10.0
}

fn default_cache_ttl() -> f64 {
    10.0
}

fn default_event_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the registry is diffed against tracked checkers (seconds).
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: f64,

    /// Probe results retained per checker.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Check applied to newly discovered instances without an override.
    #[serde(default)]
    pub default_check: HealthCheckConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            discovery_interval_secs: default_discovery_interval(),
            history_size: default_history_size(),
            default_check: HealthCheckConfig::default(),
        }
    }
}

impl HealthConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs_f64(self.discovery_interval_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_discovery_interval() -> f64 {
    60.0
}

fn default_history_size() -> usize {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckType {
    Http,
    Tcp,
    Custom,
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CheckType::Http => "http",
            CheckType::Tcp => "tcp",
            CheckType::Custom => "custom",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// `None` picks HTTP when the instance advertises a health-check URL,
    /// TCP otherwise.
    #[serde(default)]
    pub check_type: Option<CheckType>,

    #[serde(default = "default_hc_interval")]
    pub interval_secs: f64,

    #[serde(default = "default_hc_timeout")]
    pub timeout_secs: f64,

    #[serde(default = "default_hc_threshold")]
    pub healthy_threshold: u32,

    #[serde(default = "default_hc_threshold")]
    pub unhealthy_threshold: u32,

    #[serde(default = "default_healthy_statuses", deserialize_with = "deserialize_null_default")]
    pub healthy_statuses: Vec<u16>,

    /// When set, an HTTP probe also requires the body to contain this string.
    #[serde(default)]
    pub expected_body: Option<String>,

    /// Predicate for `CheckType::Custom`. Code-only; never serialized.
    #[serde(skip)]
    pub custom: Option<CustomProbe>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_type: None,
            interval_secs: default_hc_interval(),
            timeout_secs: default_hc_timeout(),
            healthy_threshold: default_hc_threshold(),
            unhealthy_threshold: default_hc_threshold(),
            healthy_statuses: default_healthy_statuses(),
            expected_body: None,
            custom: None,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn with_custom(mut self, probe: CustomProbe) -> Self {
        self.check_type = Some(CheckType::Custom);
        self.custom = Some(probe);
        self
    }
}

fn default_hc_interval() -> f64 {
    10.0
}

fn default_hc_timeout() -> f64 {
    3.0
}

fn default_hc_threshold() -> u32 {
    3
}

fn default_healthy_statuses() -> Vec<u16> {
    vec![200]
}

/// State machine: Closed → Open → HalfOpen → Closed/Open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures (in Closed) that trip the breaker.
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close it again.
    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,

    /// Upper bound on a single wrapped call (seconds).
    #[serde(default = "default_cb_timeout")]
    pub timeout_secs: f64,

    /// Time since the last failure before an Open breaker admits a probe.
    #[serde(default = "default_cb_recovery_timeout")]
    pub recovery_timeout_secs: f64,

    /// Number of recent outcomes kept for the failure-rate trip.
    #[serde(default = "default_cb_window_size")]
    pub window_size: usize,

    #[serde(default = "default_cb_failure_rate")]
    pub failure_rate_threshold: f64,

    /// Concurrent calls admitted while half-open. 0 = unlimited.
    #[serde(default)]
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_cb_failure_threshold(),
            success_threshold: default_cb_success_threshold(),
            timeout_secs: default_cb_timeout(),
            recovery_timeout_secs: default_cb_recovery_timeout(),
            window_size: default_cb_window_size(),
            failure_rate_threshold: default_cb_failure_rate(),
            half_open_max_calls: 0,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs)
    }
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    3
}

fn default_cb_timeout() -> f64 {
    30.0
}

fn default_cb_recovery_timeout() -> f64 {
    60.0
}

fn default_cb_window_size() -> usize {
    100
}

fn default_cb_failure_rate() -> f64 {
    0.5
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
    IpHash,
    HealthAware,
}

impl std::str::FromStr for LbStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "least_connections" | "least_conn" => Ok(Self::LeastConnections),
            "weighted_round_robin" | "wrr" => Ok(Self::WeightedRoundRobin),
            "random" => Ok(Self::Random),
            "ip_hash" => Ok(Self::IpHash),
            "health_aware" => Ok(Self::HealthAware),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

impl std::fmt::Display for LbStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::Random => "random",
            Self::IpHash => "ip_hash",
            Self::HealthAware => "health_aware",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub strategy: LbStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint, e.g. `0.0.0.0:9091`.
    /// When unset no recorder is installed and metrics are not collected.
    #[serde(default)]
    pub listen: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let cfg: MeshConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.registry.key_prefix, "services");
        assert_eq!(cfg.registry.cache_ttl(), Duration::from_secs(10));
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.load_balancer.strategy, LbStrategy::RoundRobin);
        assert!(cfg.health.enabled);
        assert_eq!(cfg.health.discovery_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_null_healthy_statuses_falls_back_to_empty() {
        let json = r#"{ "healthy_statuses": null }"#;
        let hc: HealthCheckConfig = serde_json::from_str(json).unwrap();
        assert!(hc.healthy_statuses.is_empty());
    }

    #[test]
    fn test_strategy_serde_names() {
        let cfg: LoadBalancerConfig =
            serde_json::from_str(r#"{ "strategy": "weighted_round_robin" }"#).unwrap();
        assert_eq!(cfg.strategy, LbStrategy::WeightedRoundRobin);
        assert_eq!(
            serde_json::to_string(&LbStrategy::HealthAware).unwrap(),
            r#""health_aware""#
        );
    }

    #[test]
    fn test_strategy_from_str_aliases() {
        assert_eq!("roundrobin".parse::<LbStrategy>(), Ok(LbStrategy::RoundRobin));
        assert_eq!("least_conn".parse::<LbStrategy>(), Ok(LbStrategy::LeastConnections));
        assert_eq!("ip_hash".parse::<LbStrategy>(), Ok(LbStrategy::IpHash));
        assert!("consistent".parse::<LbStrategy>().is_err());
    }

    #[test]
    fn test_check_type_display() {
        assert_eq!(CheckType::Http.to_string(), "http");
        assert_eq!(CheckType::Custom.to_string(), "custom");
    }
}
