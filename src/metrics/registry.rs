use crate::config::MetricsConfig;
use anyhow::Context;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Install the global Prometheus recorder serving `/metrics` on
/// `cfg.listen`, and register metric descriptions. Returns the bound
/// address.
///
/// Without a listen address nothing is installed and the `metrics` macros
/// used throughout the crate stay no-ops, which is what the tests rely on.
/// Must be called **once** at startup, inside the tokio runtime.
pub fn install(cfg: &MetricsConfig) -> anyhow::Result<Option<SocketAddr>> {
    let Some(ref listen) = cfg.listen else {
        tracing::info!("metrics: no listen address configured, metrics disabled");
        return Ok(None);
    };
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("metrics: invalid listen address {}", listen))?;

    let (recorder, exporter) = PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_duration_seconds".to_string()), LATENCY_BUCKETS)
        .context("metrics: invalid bucket matcher")?
        .set_buckets_for_metric(Matcher::Suffix("_time_seconds".to_string()), LATENCY_BUCKETS)
        .context("metrics: invalid bucket matcher")?
        .with_http_listener(addr)
        .build()
        .context("metrics: failed to build prometheus exporter")?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow::anyhow!("metrics: a global recorder is already installed"))?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!("metrics: exporter stopped: {:?}", e);
        }
    });

    describe_all();
    tracing::info!("metrics: serving prometheus metrics, addr={}", addr);
    Ok(Some(addr))
}

/// Adds HELP / TYPE lines for every metric the crate emits.
fn describe_all() {
    // registry
    describe_counter!(
        "mesh_registry_operations_total",
        Unit::Count,
        "Registry operations by op and result"
    );
    describe_counter!(
        "mesh_registry_events_total",
        Unit::Count,
        "Registry events emitted, by kind"
    );
    describe_counter!(
        "mesh_registry_discover_total",
        Unit::Count,
        "Discovery lookups by source (cache or store)"
    );
    describe_counter!(
        "mesh_registry_heartbeat_failures_total",
        Unit::Count,
        "Heartbeats that could not renew their lease"
    );
    describe_gauge!(
        "mesh_registry_heartbeat_tasks",
        Unit::Count,
        "Running heartbeat tasks owned by this process"
    );

    // circuit breaker
    describe_counter!(
        "mesh_circuit_breaker_calls_total",
        Unit::Count,
        "Calls through a breaker by result: success, failure or rejected"
    );
    describe_counter!(
        "mesh_circuit_breaker_failures_total",
        Unit::Count,
        "Breaker failures by mode: timeout, exception or custom"
    );
    describe_counter!(
        "mesh_circuit_breaker_transitions_total",
        Unit::Count,
        "Breaker state transitions by target state"
    );
    describe_gauge!(
        "mesh_circuit_breaker_state",
        Unit::Count,
        "Breaker state: 0=closed 1=open 2=half-open"
    );
    describe_histogram!(
        "mesh_circuit_breaker_call_duration_seconds",
        Unit::Seconds,
        "Duration of calls admitted by a breaker"
    );

    // health
    describe_counter!(
        "mesh_health_check_total",
        Unit::Count,
        "Health probes by check type and result"
    );
    describe_histogram!(
        "mesh_health_check_duration_seconds",
        Unit::Seconds,
        "Health probe duration"
    );
    describe_counter!(
        "mesh_health_check_transitions_total",
        Unit::Count,
        "Health status flips by new status"
    );
    describe_counter!(
        "mesh_health_check_write_failures_total",
        Unit::Count,
        "Health status writes to the registry that failed and will be retried"
    );
    describe_counter!(
        "mesh_health_check_discovery_errors_total",
        Unit::Count,
        "Health discovery rounds that could not read the registry"
    );
    describe_gauge!(
        "mesh_health_check_tracked_instances",
        Unit::Count,
        "Instances with a running health checker"
    );

    // store
    describe_histogram!(
        "mesh_store_request_duration_seconds",
        Unit::Seconds,
        "etcd request duration by operation"
    );

    // load balancer
    describe_counter!(
        "mesh_lb_selections_total",
        Unit::Count,
        "Instances selected, by strategy"
    );
    describe_counter!(
        "mesh_lb_no_candidate_total",
        Unit::Count,
        "Selections that found no eligible instance"
    );
    describe_counter!(
        "mesh_lb_results_total",
        Unit::Count,
        "Call outcomes reported to the load balancer"
    );
    describe_histogram!(
        "mesh_lb_response_time_seconds",
        Unit::Seconds,
        "Response times reported to the load balancer"
    );
}
