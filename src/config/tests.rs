use super::types::*;
use super::MeshConfig;
use std::path::Path;

#[test]
fn test_load_toml_config() {
    let cfg = MeshConfig::load(Path::new("config.toml")).unwrap();
    assert_eq!(cfg.store.backend, StoreBackend::Memory);
    assert!(!cfg.store.etcd.endpoints.is_empty());
    assert_eq!(cfg.registry.key_prefix, "services");
    assert_eq!(cfg.circuit_breaker.success_threshold, 3);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "store": { "backend": "etcd", "etcd": { "endpoints": ["http://10.0.0.1:2379"] } },
        "registry": { "service_ttl_secs": 12, "heartbeat_interval_secs": 4 },
        "load_balancer": { "strategy": "health_aware" }
    }"#;
    let tmp = std::env::temp_dir().join("hermes_mesh_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = MeshConfig::load(&tmp).unwrap();
    assert_eq!(cfg.store.backend, StoreBackend::Etcd);
    assert_eq!(cfg.store.etcd.endpoints, vec!["http://10.0.0.1:2379".to_string()]);
    assert_eq!(cfg.registry.service_ttl_secs, 12.0);
    assert_eq!(cfg.load_balancer.strategy, LbStrategy::HealthAware);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_missing_file_uses_defaults() {
    let cfg = MeshConfig::load(Path::new("does-not-exist.toml")).unwrap();
    assert_eq!(cfg.registry.service_ttl_secs, 30.0);
    assert_eq!(cfg.health.default_check.healthy_threshold, 3);
}

#[test]
fn test_unsupported_extension_fails() {
    let tmp = std::env::temp_dir().join("hermes_mesh_test_config.yaml");
    std::fs::write(&tmp, "store: {}").unwrap();
    assert!(MeshConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_default_config() {
    tokio_test::assert_ok!(MeshConfig::default().validate());
}

#[test]
fn test_validate_heartbeat_not_shorter_than_ttl_fails() {
    let mut cfg = MeshConfig::default();
    cfg.registry.service_ttl_secs = 10.0;
    cfg.registry.heartbeat_interval_secs = 10.0;
    tokio_test::assert_err!(cfg.validate());
}

#[test]
fn test_validate_prefix_with_separator_fails() {
    let mut cfg = MeshConfig::default();
    cfg.registry.key_prefix = "svc:v2".into();
    let err = tokio_test::assert_err!(cfg.validate());
    assert!(matches!(err, crate::error::MeshError::Config(_)));
}

#[test]
fn test_validate_failure_rate_out_of_range_fails() {
    let mut cfg = MeshConfig::default();
    cfg.circuit_breaker.failure_rate_threshold = 1.5;
    tokio_test::assert_err!(cfg.validate());
    cfg.circuit_breaker.failure_rate_threshold = 0.0;
    tokio_test::assert_err!(cfg.validate());
}

#[test]
fn test_validate_zero_thresholds_fail() {
    let mut cfg = MeshConfig::default();
    cfg.circuit_breaker.failure_threshold = 0;
    tokio_test::assert_err!(cfg.validate());

    let mut cfg = MeshConfig::default();
    cfg.health.default_check.unhealthy_threshold = 0;
    tokio_test::assert_err!(cfg.validate());
}

#[test]
fn test_validate_etcd_without_endpoints_fails() {
    let mut cfg = MeshConfig::default();
    cfg.store.backend = StoreBackend::Etcd;
    cfg.store.etcd.endpoints.clear();
    tokio_test::assert_err!(cfg.validate());
}

#[test]
fn test_validate_custom_default_check_fails() {
    let mut cfg = MeshConfig::default();
    cfg.health.default_check.check_type = Some(CheckType::Custom);
    tokio_test::assert_err!(cfg.validate());
}

#[test]
fn test_validate_bad_metrics_listen_fails() {
    let mut cfg = MeshConfig::default();
    cfg.metrics.listen = Some("not-an-address".into());
    tokio_test::assert_err!(cfg.validate());
    cfg.metrics.listen = Some("127.0.0.1:9091".into());
    tokio_test::assert_ok!(cfg.validate());
}

#[test]
fn test_validate_rejects_non_finite_durations() {
    for raw in ["nan", "inf", "-inf"] {
        let cfg: MeshConfig = toml::from_str(&format!("[registry]\nservice_ttl_secs = {}", raw)).unwrap();
        tokio_test::assert_err!(cfg.validate());

        let cfg: MeshConfig = toml::from_str(&format!("[registry]\ncache_ttl_secs = {}", raw)).unwrap();
        tokio_test::assert_err!(cfg.validate());

        let cfg: MeshConfig = toml::from_str(&format!("[health.default_check]\ninterval_secs = {}", raw)).unwrap();
        tokio_test::assert_err!(cfg.validate());

        let cfg: MeshConfig = toml::from_str(&format!("[circuit_breaker]\nrecovery_timeout_secs = {}", raw)).unwrap();
        tokio_test::assert_err!(cfg.validate());
    }

    let mut cfg = MeshConfig::default();
    cfg.store.etcd.timeout_secs = f64::NAN;
    tokio_test::assert_err!(cfg.validate());

    let mut cfg = MeshConfig::default();
    cfg.health.discovery_interval_secs = f64::INFINITY;
    tokio_test::assert_err!(cfg.validate());

    let mut cfg = MeshConfig::default();
    cfg.circuit_breaker.failure_rate_threshold = f64::NAN;
    tokio_test::assert_err!(cfg.validate());
}

#[test]
fn test_zero_cache_ttl_is_allowed() {
    let cfg: MeshConfig = toml::from_str("[registry]\ncache_ttl_secs = 0").unwrap();
    tokio_test::assert_ok!(cfg.validate());
}

#[test]
fn test_runtime_check_config_validation() {
    tokio_test::assert_ok!(HealthCheckConfig::default().validate());

    let bad = HealthCheckConfig {
        timeout_secs: -1.0,
        ..HealthCheckConfig::default()
    };
    tokio_test::assert_err!(bad.validate());

    let bad = HealthCheckConfig {
        interval_secs: f64::NAN,
        ..HealthCheckConfig::default()
    };
    tokio_test::assert_err!(bad.validate());

    let bad = HealthCheckConfig {
        check_type: Some(CheckType::Custom),
        ..HealthCheckConfig::default()
    };
    tokio_test::assert_err!(bad.validate());
}
