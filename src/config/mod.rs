pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use crate::error::MeshError;
use anyhow::Result;
use std::path::Path;

impl MeshConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used: an in-memory store with every
    /// component enabled, enough for local development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: MeshConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            MeshConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            backend = ?config.store.backend,
            service_ttl_secs = config.registry.service_ttl_secs,
            strategy = %config.load_balancer.strategy,
            "loaded mesh configuration"
        );
        Ok(config)
    }

    /// Apply environment variable overrides for connection/infra settings.
    fn apply_env_overrides(&mut self) {
        // Store
        if let Ok(v) = std::env::var("HERMES_MESH_STORE_BACKEND") {
            match v.as_str() {
                "etcd" => self.store.backend = StoreBackend::Etcd,
                "memory" => self.store.backend = StoreBackend::Memory,
                other => tracing::warn!("config: ignoring unknown store backend override: {}", other),
            }
        }
        if let Ok(v) = std::env::var("HERMES_MESH_ETCD_ENDPOINTS") {
            self.store.etcd.endpoints = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("HERMES_MESH_ETCD_USERNAME") {
            self.store.etcd.username = Some(v);
        }
        if let Ok(v) = std::env::var("HERMES_MESH_ETCD_PASSWORD") {
            self.store.etcd.password = Some(v);
        }

        // Registry
        if let Ok(v) = std::env::var("HERMES_MESH_KEY_PREFIX") {
            self.registry.key_prefix = v;
        }
        if let Ok(v) = std::env::var("HERMES_MESH_SERVICE_TTL") {
            if let Ok(n) = v.parse::<f64>() {
                self.registry.service_ttl_secs = n;
            }
        }
        if let Ok(v) = std::env::var("HERMES_MESH_HEARTBEAT_INTERVAL") {
            if let Ok(n) = v.parse::<f64>() {
                self.registry.heartbeat_interval_secs = n;
            }
        }

        // Metrics
        if let Ok(v) = std::env::var("HERMES_MESH_METRICS_LISTEN") {
            self.metrics.listen = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), MeshError> {
        let reg = &self.registry;
        if reg.key_prefix.is_empty() || reg.key_prefix.contains(':') {
            return Err(config_error("registry.key_prefix must be non-empty and must not contain ':'"));
        }
        positive_secs("registry.service_ttl_secs", reg.service_ttl_secs)?;
        positive_secs("registry.heartbeat_interval_secs", reg.heartbeat_interval_secs)?;
        if reg.heartbeat_interval_secs >= reg.service_ttl_secs {
            return Err(config_error(format!(
                "registry.heartbeat_interval_secs ({}) must be shorter than service_ttl_secs ({})",
                reg.heartbeat_interval_secs, reg.service_ttl_secs
            )));
        }
        non_negative_secs("registry.cache_ttl_secs", reg.cache_ttl_secs)?;
        if reg.event_buffer == 0 {
            return Err(config_error("registry.event_buffer must be at least 1"));
        }

        if self.store.backend == StoreBackend::Etcd && self.store.etcd.endpoints.is_empty() {
            return Err(config_error("store.backend is etcd but store.etcd.endpoints is empty"));
        }
        positive_secs("store.etcd.timeout_secs", self.store.etcd.timeout_secs)?;

        let hc = &self.health.default_check;
        if hc.check_type == Some(CheckType::Custom) {
            return Err(config_error("health.default_check cannot use the custom check type from a config file"));
        }
        validate_check("health.default_check", hc)?;
        positive_secs("health.discovery_interval_secs", self.health.discovery_interval_secs)?;

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 || cb.success_threshold == 0 {
            return Err(config_error("circuit_breaker thresholds must be at least 1"));
        }
        if cb.window_size == 0 {
            return Err(config_error("circuit_breaker.window_size must be at least 1"));
        }
        // Written so that NaN fails too.
        if !(cb.failure_rate_threshold > 0.0 && cb.failure_rate_threshold <= 1.0) {
            return Err(config_error(format!(
                "circuit_breaker.failure_rate_threshold must be in (0, 1], got {}",
                cb.failure_rate_threshold
            )));
        }
        positive_secs("circuit_breaker.timeout_secs", cb.timeout_secs)?;
        non_negative_secs("circuit_breaker.recovery_timeout_secs", cb.recovery_timeout_secs)?;

        if let Some(ref listen) = self.metrics.listen {
            listen
                .parse::<std::net::SocketAddr>()
                .map_err(|e| config_error(format!("metrics.listen '{}' is invalid: {}", listen, e)))?;
        }
        Ok(())
    }
}

impl HealthCheckConfig {
    /// Checks a config handed over at runtime. Durations must be finite
    /// and positive; a custom check needs its predicate.
    pub fn validate(&self) -> Result<(), MeshError> {
        validate_check("health check", self)?;
        if self.check_type == Some(CheckType::Custom) && self.custom.is_none() {
            return Err(config_error("health check type is custom but no predicate is set"));
        }
        Ok(())
    }
}

fn validate_check(section: &str, hc: &HealthCheckConfig) -> Result<(), MeshError> {
    if hc.healthy_threshold == 0 || hc.unhealthy_threshold == 0 {
        return Err(config_error(format!("{} thresholds must be at least 1", section)));
    }
    positive_secs(&format!("{}.interval_secs", section), hc.interval_secs)?;
    positive_secs(&format!("{}.timeout_secs", section), hc.timeout_secs)
}

/// Seconds that feed `Duration::from_secs_f64`, which panics on NaN,
/// infinity and negatives.
fn positive_secs(name: &str, secs: f64) -> Result<(), MeshError> {
    if secs.is_finite() && secs > 0.0 {
        Ok(())
    } else {
        Err(config_error(format!("{} must be a finite positive number, got {}", name, secs)))
    }
}

fn non_negative_secs(name: &str, secs: f64) -> Result<(), MeshError> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(())
    } else {
        Err(config_error(format!("{} must be a finite non-negative number, got {}", name, secs)))
    }
}

fn config_error(msg: impl Into<String>) -> MeshError {
    MeshError::Config(msg.into())
}
