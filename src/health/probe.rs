use crate::config::{CheckType, HealthCheckConfig};
use crate::discovery::ServiceInstance;
use crate::error::MeshError;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::net::TcpStream;

pub type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// User-supplied health predicate for [`CheckType::Custom`].
#[derive(Clone)]
pub struct CustomProbe(Arc<dyn Fn(&ServiceInstance) -> ProbeFuture + Send + Sync>);

impl CustomProbe {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(&ServiceInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self(Arc::new(move |inst: &ServiceInstance| -> ProbeFuture { Box::pin(f(inst)) }))
    }

    /// Wrap a synchronous predicate.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ServiceInstance) -> bool + Send + Sync + 'static,
    {
        Self::new(move |inst: &ServiceInstance| std::future::ready(f(inst)))
    }

    fn run(&self, inst: &ServiceInstance) -> ProbeFuture {
        (self.0)(inst)
    }
}

impl std::fmt::Debug for CustomProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CustomProbe(..)")
    }
}

/// Outcome of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub success: bool,
    pub check_type: CheckType,
    pub duration: Duration,
    #[serde(serialize_with = "serialize_time")]
    pub at: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn serialize_time<S: serde::Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&humantime::format_rfc3339_millis(*t))
}

/// HTTP when the instance advertises a health-check URL, TCP otherwise.
pub fn effective_check_type(check: &HealthCheckConfig, inst: &ServiceInstance) -> CheckType {
    check.check_type.unwrap_or(if inst.health_check_url.is_some() {
        CheckType::Http
    } else {
        CheckType::Tcp
    })
}

/// Shared client for HTTP probes. Per-probe timeouts are set on each request.
pub fn build_probe_client() -> Result<reqwest::Client, MeshError> {
    Ok(reqwest::Client::builder()
        .no_proxy()
        .pool_idle_timeout(Duration::from_secs(30))
        .build()?)
}

/// Run one probe against `inst`, bounded by the check's timeout. Never fails;
/// problems are reported in the result.
pub async fn run_probe(client: &reqwest::Client, check: &HealthCheckConfig, inst: &ServiceInstance) -> ProbeResult {
    let check_type = effective_check_type(check, inst);
    let started = Instant::now();
    let at = SystemTime::now();
    let timeout = check.timeout();

    let outcome = match tokio::time::timeout(timeout, probe(client, check_type, check, inst)).await {
        Ok(r) => r,
        Err(_) => Err(MeshError::Probe(format!("timed out after {:?}", timeout))),
    };

    ProbeResult {
        success: outcome.is_ok(),
        check_type,
        duration: started.elapsed(),
        at,
        error: outcome.err().map(|e| e.to_string()),
    }
}

async fn probe(
    client: &reqwest::Client,
    check_type: CheckType,
    check: &HealthCheckConfig,
    inst: &ServiceInstance,
) -> Result<(), MeshError> {
    match check_type {
        CheckType::Http => http_probe(client, check, inst).await,
        CheckType::Tcp => tcp_probe(inst).await,
        CheckType::Custom => match check.custom {
            Some(ref custom) => {
                if custom.run(inst).await {
                    Ok(())
                } else {
                    Err(MeshError::Probe("custom check reported unhealthy".to_string()))
                }
            }
            None => Err(MeshError::Probe("no custom check configured".to_string())),
        },
    }
}

async fn http_probe(client: &reqwest::Client, check: &HealthCheckConfig, inst: &ServiceInstance) -> Result<(), MeshError> {
    let url = match inst.health_check_url {
        Some(ref url) => url.clone(),
        None => inst
            .primary_endpoint()
            .map(|ep| ep.url())
            .ok_or_else(|| MeshError::Probe("instance has no health check url or endpoint".to_string()))?,
    };

    let resp = client.get(&url).timeout(check.timeout()).send().await?;
    let status = resp.status().as_u16();
    if !check.healthy_statuses.contains(&status) {
        return Err(MeshError::Probe(format!("unexpected status {} from {}", status, url)));
    }
    if let Some(ref expected) = check.expected_body {
        let body = resp.text().await?;
        if !body.contains(expected.as_str()) {
            return Err(MeshError::Probe(format!("body from {} does not contain {:?}", url, expected)));
        }
    }
    Ok(())
}

async fn tcp_probe(inst: &ServiceInstance) -> Result<(), MeshError> {
    let endpoint = inst
        .primary_endpoint()
        .ok_or_else(|| MeshError::Probe("instance has no endpoints".to_string()))?;
    let addr = endpoint.address();
    TcpStream::connect(&addr)
        .await
        .map(drop)
        .map_err(|e| MeshError::Probe(format!("connect {}: {}", addr, e)))
}
