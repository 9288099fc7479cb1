//! End-to-end control plane tests over the in-memory store: registration,
//! discovery, load balancing, circuit breaking and active health checks
//! against real local sockets.

use hermes_mesh::config::{CheckType, HealthCheckConfig, LbStrategy, MeshConfig};
use hermes_mesh::discovery::{DiscoveryQuery, Endpoint, HealthStatus, ServiceInstance};
use hermes_mesh::error::BreakerError;
use hermes_mesh::server::ControlPlane;
use hermes_mesh::store::MemoryStore;
use hermes_mesh::upstream::CircuitState;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

fn mesh_config() -> MeshConfig {
    let mut cfg = MeshConfig::default();
    cfg.registry.cache_ttl_secs = 0.0;
    cfg.load_balancer.strategy = LbStrategy::RoundRobin;
    cfg.health.discovery_interval_secs = 0.05;
    cfg.health.default_check = HealthCheckConfig {
        check_type: Some(CheckType::Tcp),
        interval_secs: 0.05,
        timeout_secs: 0.5,
        healthy_threshold: 2,
        unhealthy_threshold: 2,
        ..HealthCheckConfig::default()
    };
    cfg.circuit_breaker.failure_threshold = 3;
    cfg.circuit_breaker.recovery_timeout_secs = 60.0;
    cfg
}

fn plane() -> ControlPlane {
    ControlPlane::with_store(mesh_config(), Arc::new(MemoryStore::new())).unwrap()
}

fn instance(id: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new("orders", id, "1.0").with_endpoint("http", Endpoint::new("http", "127.0.0.1", port))
}

/// Poll the stored record until it reaches `want` or the deadline passes.
async fn wait_for_status(cp: &ControlPlane, id: &str, want: HealthStatus) -> bool {
    for _ in 0..100 {
        if let Some(inst) = cp.registry().get_instance("orders", id, None).await {
            if inst.status == want {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_register_discover_and_balance() {
    let cp = plane();
    let reg = cp.registry();

    for id in ["o-1", "o-2", "o-3"] {
        assert!(reg.register(instance(id, 9000), false).await);
    }
    assert!(
        reg.register(ServiceInstance::new("orders", "o-9", "1.0").with_tenant("acme"), false)
            .await
    );

    let global = reg.discover(&DiscoveryQuery::service("orders")).await;
    assert_eq!(global.len(), 3, "tenant records must not leak into the global scope");

    // Round robin over three instances visits each one equally.
    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..30 {
        let picked = cp.pick("orders", None, None).await.unwrap();
        *counts.entry(picked.instance_id.clone()).or_default() += 1;
        cp.balancer("orders")
            .record_result(&picked.instance_id, true, Duration::from_millis(5));
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 10), "{:?}", counts);

    let stats = cp.balancer("orders").stats();
    assert_eq!(stats.len(), 3);
    assert!(stats.iter().all(|s| s.active_connections == 0 && s.total_requests == 10));

    assert_eq!(cp.pick("orders", Some("acme"), None).await.unwrap().instance_id, "o-9");
}

#[tokio::test]
async fn test_breaker_opens_and_rejects_without_calling() {
    let cp = plane();
    let inst = instance("o-1", 9000);
    let breaker = cp.breakers().get_or_create(&inst.breaker_key());

    for _ in 0..3 {
        let r = breaker.call(async { Err::<(), _>("connection reset") }).await;
        assert!(matches!(r, Err(BreakerError::Failed("connection reset"))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = Arc::new(Mutex::new(false));
    let flag = invoked.clone();
    let r = breaker
        .call(async move {
            *flag.lock().unwrap() = true;
            Ok::<_, String>(())
        })
        .await;
    assert!(r.unwrap_err().is_open());
    assert!(!*invoked.lock().unwrap(), "an open breaker must not run the call");

    // The registry hands out the same breaker for the same key.
    assert!(Arc::ptr_eq(&breaker, &cp.breakers().get_or_create(&inst.breaker_key())));
}

#[tokio::test]
async fn test_health_checks_flip_status_with_hysteresis() {
    let cp = plane();

    // Reachable, but registered as unhealthy: two successful probes promote it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up_port = listener.local_addr().unwrap().port();

    // Nothing listens here: two failed probes demote it.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let down_port = closed.local_addr().unwrap().port();
    drop(closed);

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = changes.clone();
    cp.health()
        .unwrap()
        .add_listener(move |c| sink.lock().unwrap().push((c.instance_id.clone(), c.current)));

    let reg = cp.registry();
    assert!(
        reg.register(instance("o-up", up_port).with_status(HealthStatus::Unhealthy), false)
            .await
    );
    assert!(reg.register(instance("o-down", down_port), false).await);

    cp.start();

    assert!(wait_for_status(&cp, "o-up", HealthStatus::Healthy).await);
    assert!(wait_for_status(&cp, "o-down", HealthStatus::Unhealthy).await);

    let healthy = reg.discover(&DiscoveryQuery::service("orders")).await;
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].instance_id, "o-up");

    let stats = cp.health().unwrap().get_stats("orders", "o-down", None).unwrap();
    assert_eq!(stats.status, HealthStatus::Unhealthy);
    assert!(stats.consecutive_failures >= 2);

    {
        let seen = changes.lock().unwrap();
        assert!(seen.contains(&("o-up".to_string(), HealthStatus::Healthy)));
        assert!(seen.contains(&("o-down".to_string(), HealthStatus::Unhealthy)));
    }

    cp.shutdown().await;
    assert!(!cp.health().unwrap().is_running());
    drop(listener);
}

#[tokio::test]
async fn test_auto_heartbeat_keeps_record_alive() {
    let mut cfg = mesh_config();
    cfg.registry.service_ttl_secs = 0.3;
    cfg.registry.heartbeat_interval_secs = 0.1;
    let cp = ControlPlane::with_store(cfg, Arc::new(MemoryStore::new())).unwrap();
    let reg = cp.registry();

    assert!(reg.register(instance("o-1", 9000), true).await);
    assert!(reg.register(instance("o-2", 9001), false).await);
    assert_eq!(reg.heartbeat_count(), 1);

    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(reg.get_instance("orders", "o-1", None).await.is_some());
    assert!(
        reg.get_instance("orders", "o-2", None).await.is_none(),
        "a record without heartbeats lapses after its ttl"
    );

    assert!(reg.deregister("orders", "o-1", None).await);
    assert_eq!(reg.heartbeat_count(), 0);
    cp.shutdown().await;
}
