pub mod health_aware;
pub mod ip_hash;
pub mod least_connections;
pub mod random;
pub mod round_robin;
pub mod weighted_round_robin;

use crate::config::{LbStrategy, LoadBalancerConfig};
use crate::discovery::ServiceInstance;
use dashmap::DashMap;
use health_aware::HealthAwareBalancer;
use ip_hash::IpHashBalancer;
use least_connections::LeastConnectionsBalancer;
use random::RandomBalancer;
use round_robin::RoundRobinBalancer;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use weighted_round_robin::WeightedRoundRobinBalancer;

/// EMA smoothing factor for response times.
const EMA_ALPHA: f64 = 0.2;

/// Response time at which the latency factor of the health score bottoms out.
const SLOW_RESPONSE_SECS: f64 = 5.0;

/// Instances scoring at or below this are skipped while healthier ones exist.
const HEALTHY_SCORE: f64 = 0.5;

/// Per-request hints for strategies that need them.
#[derive(Debug, Clone, Default)]
pub struct SelectContext {
    pub client_ip: Option<String>,
    pub client_id: Option<String>,
}

impl SelectContext {
    pub fn client_ip(ip: impl Into<String>) -> Self {
        Self {
            client_ip: Some(ip.into()),
            client_id: None,
        }
    }

    pub fn client_id(id: impl Into<String>) -> Self {
        Self {
            client_ip: None,
            client_id: Some(id.into()),
        }
    }

    /// Sticky key for hashing: the client IP, else the client id.
    pub fn sticky_key(&self) -> Option<&str> {
        self.client_ip.as_deref().or(self.client_id.as_deref())
    }
}

#[derive(Debug, Default)]
struct Outcomes {
    total_requests: u64,
    failed_requests: u64,
    /// Seconds; `None` until the first sample.
    avg_response_time: Option<f64>,
}

impl Outcomes {
    fn health_score(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        let success_rate =
            (self.total_requests - self.failed_requests) as f64 / self.total_requests as f64;
        let avg = self.avg_response_time.unwrap_or(0.0);
        let latency_factor = (1.0 - avg / SLOW_RESPONSE_SECS).max(0.1);
        success_rate * latency_factor
    }
}

/// Runtime counters for one instance id. Survives instance-set changes.
#[derive(Debug, Default)]
pub struct InstanceRuntime {
    active_connections: AtomicU64,
    outcomes: Mutex<Outcomes>,
}

impl InstanceRuntime {
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn health_score(&self) -> f64 {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .health_score()
    }

    fn record(&self, success: bool, duration: Duration) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        let mut o = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        o.total_requests += 1;
        if !success {
            o.failed_requests += 1;
        }
        let sample = duration.as_secs_f64();
        o.avg_response_time = Some(match o.avg_response_time {
            Some(avg) => EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * avg,
            None => sample,
        });
    }
}

/// A selectable instance together with its runtime, as handed to strategies.
pub struct Candidate<'a> {
    pub instance: &'a ServiceInstance,
    pub runtime: Arc<InstanceRuntime>,
    pub health_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStats {
    pub instance_id: String,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time: Duration,
    pub health_score: f64,
}

enum Strategy {
    RoundRobin(RoundRobinBalancer),
    LeastConnections(LeastConnectionsBalancer),
    WeightedRoundRobin(WeightedRoundRobinBalancer),
    Random(RandomBalancer),
    IpHash(IpHashBalancer),
    HealthAware(HealthAwareBalancer),
}

/// Picks one instance per request and learns from reported outcomes.
///
/// Instance lists are passed to every `select`; runtime counters are kept per
/// instance id, so they survive list changes and are dropped only when an id
/// disappears.
pub struct LoadBalancer {
    kind: LbStrategy,
    strategy: Strategy,
    runtimes: DashMap<String, Arc<InstanceRuntime>>,
}

impl LoadBalancer {
    pub fn new(kind: LbStrategy) -> Self {
        let strategy = match kind {
            LbStrategy::RoundRobin => Strategy::RoundRobin(RoundRobinBalancer::new()),
            LbStrategy::LeastConnections => Strategy::LeastConnections(LeastConnectionsBalancer::new()),
            LbStrategy::WeightedRoundRobin => Strategy::WeightedRoundRobin(WeightedRoundRobinBalancer::new()),
            LbStrategy::Random => Strategy::Random(RandomBalancer::new()),
            LbStrategy::IpHash => Strategy::IpHash(IpHashBalancer::new()),
            LbStrategy::HealthAware => Strategy::HealthAware(HealthAwareBalancer::new()),
        };
        Self {
            kind,
            strategy,
            runtimes: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &LoadBalancerConfig) -> Self {
        Self::new(cfg.strategy)
    }

    pub fn strategy(&self) -> LbStrategy {
        self.kind
    }

    fn runtime(&self, instance_id: &str) -> Arc<InstanceRuntime> {
        if let Some(rt) = self.runtimes.get(instance_id) {
            return rt.value().clone();
        }
        self.runtimes
            .entry(instance_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop runtimes of ids no longer in the list.
    fn sync(&self, instances: &[ServiceInstance]) {
        let live: HashSet<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
        // Read pass first; retain takes every shard's write lock.
        if self.runtimes.iter().any(|e| !live.contains(e.key().as_str())) {
            self.runtimes.retain(|id, _| live.contains(id.as_str()));
        }
    }

    /// Choose an instance, or `None` when there is nothing to choose from.
    /// The chosen instance's active connection count is incremented until
    /// [`record_result`](Self::record_result) reports the call's outcome.
    pub fn select(&self, instances: &[ServiceInstance], ctx: Option<&SelectContext>) -> Option<ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        self.sync(instances);

        let all: Vec<Candidate<'_>> = instances
            .iter()
            .map(|instance| {
                let runtime = self.runtime(&instance.instance_id);
                let health_score = runtime.health_score();
                Candidate {
                    instance,
                    runtime,
                    health_score,
                }
            })
            .collect();

        let candidates: Vec<Candidate<'_>> = match self.strategy {
            Strategy::HealthAware(_) => all,
            _ => {
                let healthy_count = all.iter().filter(|c| c.health_score > HEALTHY_SCORE).count();
                if healthy_count == 0 {
                    all
                } else {
                    all.into_iter().filter(|c| c.health_score > HEALTHY_SCORE).collect()
                }
            }
        };

        let idx = match &self.strategy {
            Strategy::RoundRobin(lb) => lb.pick(&candidates),
            Strategy::LeastConnections(lb) => lb.pick(&candidates),
            Strategy::WeightedRoundRobin(lb) => lb.pick(&candidates),
            Strategy::Random(lb) => lb.pick(&candidates),
            Strategy::IpHash(lb) => lb.pick(&candidates, ctx),
            Strategy::HealthAware(lb) => lb.pick(&candidates),
        };
        let Some(chosen) = idx.and_then(|i| candidates.get(i)) else {
            metrics::counter!("mesh_lb_no_candidate_total", "strategy" => self.kind.to_string()).increment(1);
            return None;
        };

        chosen.runtime.active_connections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mesh_lb_selections_total", "strategy" => self.kind.to_string()).increment(1);
        Some(chosen.instance.clone())
    }

    /// Report the outcome of a call to a previously selected instance.
    pub fn record_result(&self, instance_id: &str, success: bool, duration: Duration) {
        let Some(runtime) = self.runtimes.get(instance_id).map(|e| e.value().clone()) else {
            tracing::debug!("loadbalance: result for unknown instance {}", instance_id);
            return;
        };
        runtime.record(success, duration);
        let result = if success { "success" } else { "failure" };
        metrics::counter!("mesh_lb_results_total", "result" => result).increment(1);
        metrics::histogram!("mesh_lb_response_time_seconds").record(duration.as_secs_f64());
    }

    pub fn stats(&self) -> Vec<InstanceStats> {
        let mut out: Vec<InstanceStats> = self
            .runtimes
            .iter()
            .map(|e| {
                let rt = e.value();
                let o = rt.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
                InstanceStats {
                    instance_id: e.key().clone(),
                    active_connections: rt.active_connections(),
                    total_requests: o.total_requests,
                    failed_requests: o.failed_requests,
                    avg_response_time: Duration::from_secs_f64(o.avg_response_time.unwrap_or(0.0)),
                    health_score: o.health_score(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::instances;
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_select_empty_returns_none() {
        for kind in [
            LbStrategy::RoundRobin,
            LbStrategy::LeastConnections,
            LbStrategy::WeightedRoundRobin,
            LbStrategy::Random,
            LbStrategy::IpHash,
            LbStrategy::HealthAware,
        ] {
            let lb = LoadBalancer::new(kind);
            assert!(lb.select(&[], None).is_none(), "empty {} should return None", kind);
        }
    }

    #[test]
    fn test_round_robin_is_fair() {
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        let insts = instances(3);
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            let picked = lb.select(&insts, None).unwrap();
            lb.record_result(&picked.instance_id, true, Duration::from_millis(5));
            *counts.entry(picked.instance_id).or_insert(0) += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|c| *c == 100), "{:?}", counts);
    }

    #[test]
    fn test_unhealthy_instance_is_skipped_until_all_are() {
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        let insts = instances(2);
        for _ in 0..3 {
            lb.select(&insts, None);
        }
        for _ in 0..4 {
            lb.record_result("o-1", false, Duration::from_millis(10));
        }
        for _ in 0..20 {
            assert_eq!(lb.select(&insts, None).unwrap().instance_id, "o-2");
        }

        for _ in 0..4 {
            lb.record_result("o-2", false, Duration::from_millis(10));
        }
        let mut seen = HashSet::new();
        for _ in 0..10 {
            seen.insert(lb.select(&insts, None).unwrap().instance_id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_record_result_updates_stats() {
        let lb = LoadBalancer::new(LbStrategy::LeastConnections);
        let insts = instances(1);
        lb.select(&insts, None).unwrap();
        lb.select(&insts, None).unwrap();
        assert_eq!(lb.stats()[0].active_connections, 2);

        lb.record_result("o-1", true, Duration::from_millis(100));
        lb.record_result("o-1", false, Duration::from_millis(200));
        let s = &lb.stats()[0];
        assert_eq!(s.active_connections, 0);
        assert_eq!(s.total_requests, 2);
        assert_eq!(s.failed_requests, 1);
        // First sample seeds the EMA: 0.2 * 0.2 + 0.8 * 0.1 = 0.12.
        assert!((s.avg_response_time.as_secs_f64() - 0.12).abs() < 1e-9);
        // 0.5 success rate * (1 - 0.12 / 5).
        assert!((s.health_score - 0.5 * (1.0 - 0.12 / 5.0)).abs() < 1e-9);
    }

    #[test]
    fn test_active_connections_never_underflow() {
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        lb.select(&instances(1), None).unwrap();
        lb.record_result("o-1", true, Duration::ZERO);
        lb.record_result("o-1", true, Duration::ZERO);
        assert_eq!(lb.stats()[0].active_connections, 0);
    }

    #[test]
    fn test_counters_survive_instance_set_change() {
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        let insts = instances(3);
        lb.select(&insts, None);
        lb.record_result("o-1", false, Duration::from_millis(50));

        // o-3 leaves; o-1 keeps its history.
        lb.select(&insts[..2], None);
        let stats = lb.stats();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].instance_id, "o-1");
        assert_eq!(stats[0].failed_requests, 1);
    }

    #[test]
    fn test_large_instance_set_swap_drops_departed_runtime() {
        let lb = LoadBalancer::new(LbStrategy::RoundRobin);
        let mut insts = instances(2000);
        lb.select(&insts, None);
        assert_eq!(lb.stats().len(), 2000);

        // Same size, one id replaced.
        insts[1999] = ServiceInstance::new("orders", "o-new", "1.0");
        for _ in 0..2000 {
            let picked = lb.select(&insts, None).unwrap();
            lb.record_result(&picked.instance_id, true, Duration::ZERO);
        }
        let stats = lb.stats();
        assert_eq!(stats.len(), 2000);
        assert!(stats.iter().all(|s| s.instance_id != "o-2000"));
        assert!(stats.iter().any(|s| s.instance_id == "o-new"));
    }

    #[test]
    fn test_health_score_latency_floor() {
        let o = Outcomes {
            total_requests: 10,
            failed_requests: 0,
            avg_response_time: Some(60.0),
        };
        assert!((o.health_score() - 0.1).abs() < 1e-9);
        assert_eq!(Outcomes::default().health_score(), 1.0);
    }

    #[test]
    fn test_unknown_result_is_ignored() {
        let lb = LoadBalancer::new(LbStrategy::Random);
        lb.record_result("ghost", true, Duration::ZERO);
        assert!(lb.stats().is_empty());
        assert_eq!(lb.strategy(), LbStrategy::Random);
    }
}
