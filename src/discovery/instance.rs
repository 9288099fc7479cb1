use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, SystemTime};

/// Lifecycle status of a registered instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    Stopping,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Unhealthy => "UNHEALTHY",
            HealthStatus::Starting => "STARTING",
            HealthStatus::Stopping => "STOPPING",
            HealthStatus::Unknown => "UNKNOWN",
        })
    }
}

/// A named network surface of an instance, e.g. `http` or `grpc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Endpoint {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// `host:port`, suitable for a TCP connect.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol,
            self.host,
            self.port,
            self.path.as_deref().unwrap_or("")
        )
    }
}

/// One registry record. `(tenant_id, name, instance_id)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub instance_id: String,
    pub version: String,
    #[serde(default)]
    pub tenant_id: Option<String>,

    /// Ordered by name so "the first endpoint" is stable across reads.
    #[serde(default)]
    pub endpoints: BTreeMap<String, Endpoint>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub status: HealthStatus,
    #[serde(with = "rfc3339")]
    pub registered_at: SystemTime,
    #[serde(with = "rfc3339")]
    pub last_heartbeat: SystemTime,
    /// Last write that re-applied the TTL (registration, heartbeat or health
    /// update). Lets cached readers detect a lapsed lease.
    #[serde(default, with = "rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub lease_renewed_at: Option<SystemTime>,
    #[serde(default)]
    pub health_check_url: Option<String>,
}

impl ServiceInstance {
    /// A fresh record, optimistically `HEALTHY`; the health manager demotes it
    /// once probes say otherwise.
    pub fn new(
        name: impl Into<String>,
        instance_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            name: name.into(),
            instance_id: instance_id.into(),
            version: version.into(),
            tenant_id: None,
            endpoints: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
            status: HealthStatus::Healthy,
            registered_at: now,
            last_heartbeat: now,
            lease_renewed_at: None,
            health_check_url: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, endpoint: Endpoint) -> Self {
        self.endpoints.insert(name.into(), endpoint);
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    /// Static load-balancing weight from `metadata["weight"]`, default 1.
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|w| w.parse::<u32>().ok())
            .unwrap_or(1)
    }

    /// Conventional circuit breaker name: `service:instance`.
    pub fn breaker_key(&self) -> String {
        format!("{}:{}", self.name, self.instance_id)
    }

    /// The endpoint TCP probes and callers use when none is named explicitly.
    pub fn primary_endpoint(&self) -> Option<&Endpoint> {
        self.endpoints.values().next()
    }

    pub fn lease_renewed_at(&self) -> SystemTime {
        self.lease_renewed_at.unwrap_or(self.last_heartbeat)
    }

    /// Whether a lease of `ttl` that was last renewed per this record has lapsed.
    pub fn lease_expired(&self, ttl: Duration, now: SystemTime) -> bool {
        match now.duration_since(self.lease_renewed_at()) {
            Ok(elapsed) => elapsed >= ttl,
            Err(_) => false,
        }
    }
}

/// `<hostname>-<8 hex digits>`, unique enough for instance ids.
pub fn generate_instance_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let rand_suffix: u32 = rand::random();
    format!("{}-{:08x}", hostname, rand_suffix)
}

/// RFC 3339 (millisecond precision) encoding for `SystemTime` fields.
mod rfc3339 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::SystemTime;

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_rfc3339_millis(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_rfc3339_weak(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::SystemTime;

        pub fn serialize<S: Serializer>(t: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.collect_str(&humantime::format_rfc3339_millis(*t)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SystemTime>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => humantime::parse_rfc3339_weak(&raw)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServiceInstance {
        ServiceInstance::new("orders", "orders-1", "1.4.0")
            .with_tenant("acme")
            .with_endpoint("http", Endpoint::new("http", "10.0.0.5", 8080).with_path("/api"))
            .with_endpoint("grpc", Endpoint::new("grpc", "10.0.0.5", 9090))
            .with_capability("payments")
            .with_tag("canary")
            .with_metadata("weight", "5")
            .with_health_check_url("http://10.0.0.5:8080/health")
    }

    #[test]
    fn test_json_shape() {
        let inst = sample();
        let value = serde_json::to_value(&inst).unwrap();
        assert_eq!(value["status"], "HEALTHY");
        assert_eq!(value["tenant_id"], "acme");
        assert_eq!(value["endpoints"]["http"]["path"], "/api");
        assert!(value["endpoints"]["grpc"].get("path").is_none());
        assert!(value["registered_at"].as_str().unwrap().ends_with('Z'));
        assert!(value.get("lease_renewed_at").is_none());
    }

    #[test]
    fn test_decode_minimal_record() {
        let json = r#"{
            "name": "billing",
            "instance_id": "b-1",
            "version": "2.0",
            "registered_at": "2024-05-01T10:00:00Z",
            "last_heartbeat": "2024-05-01T10:00:05.250Z"
        }"#;
        let inst: ServiceInstance = serde_json::from_str(json).unwrap();
        assert_eq!(inst.status, HealthStatus::Unknown);
        assert!(inst.tenant_id.is_none());
        assert!(inst.endpoints.is_empty());
        assert_eq!(inst.lease_renewed_at(), inst.last_heartbeat);
    }

    #[test]
    fn test_weight_parsing() {
        assert_eq!(sample().weight(), 5);
        let plain = ServiceInstance::new("a", "1", "v");
        assert_eq!(plain.weight(), 1);
        let bad = ServiceInstance::new("a", "1", "v").with_metadata("weight", "heavy");
        assert_eq!(bad.weight(), 1);
    }

    #[test]
    fn test_primary_endpoint_is_first_by_name() {
        let inst = sample();
        assert_eq!(inst.primary_endpoint().unwrap().protocol, "grpc");
        assert_eq!(inst.endpoints["http"].url(), "http://10.0.0.5:8080/api");
        assert_eq!(inst.endpoints["grpc"].address(), "10.0.0.5:9090");
    }

    #[test]
    fn test_lease_expired() {
        let mut inst = sample();
        let t0 = SystemTime::now();
        inst.last_heartbeat = t0;
        let ttl = Duration::from_secs(30);
        assert!(!inst.lease_expired(ttl, t0 + Duration::from_secs(29)));
        assert!(inst.lease_expired(ttl, t0 + Duration::from_secs(30)));

        inst.lease_renewed_at = Some(t0 + Duration::from_secs(20));
        assert!(!inst.lease_expired(ttl, t0 + Duration::from_secs(45)));
    }

    #[test]
    fn test_generate_instance_id_format() {
        let id = generate_instance_id();
        let (_, suffix) = id.rsplit_once('-').unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(generate_instance_id(), id);
    }

    #[test]
    fn test_breaker_key() {
        assert_eq!(sample().breaker_key(), "orders:orders-1");
    }
}
