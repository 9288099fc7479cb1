use super::probe::{effective_check_type, run_probe, ProbeResult};
use crate::config::{CheckType, HealthCheckConfig};
use crate::discovery::{HealthStatus, ServiceInstance};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// A status flip decided by hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub previous: HealthStatus,
    pub current: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub service: String,
    pub instance_id: String,
    pub tenant_id: Option<String>,
    pub check_type: CheckType,
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub total_checks: u64,
    pub failed_checks: u64,
    pub last_result: Option<ProbeResult>,
    pub history: Vec<ProbeResult>,
}

struct CheckerState {
    consecutive_successes: u32,
    consecutive_failures: u32,
    current_status: HealthStatus,
    total_checks: u64,
    failed_checks: u64,
    history: VecDeque<ProbeResult>,
    /// `current_status` has not reached the registry yet.
    unwritten: bool,
}

/// Probe state for one monitored instance.
///
/// The status only flips after `healthy_threshold` consecutive successes or
/// `unhealthy_threshold` consecutive failures, starting from the status the
/// instance had in the registry when it was first seen.
pub struct HealthChecker {
    instance: ArcSwap<ServiceInstance>,
    config: ArcSwap<HealthCheckConfig>,
    history_size: usize,
    state: Mutex<CheckerState>,
}

impl HealthChecker {
    pub fn new(instance: ServiceInstance, config: HealthCheckConfig, history_size: usize) -> Self {
        let current_status = instance.status;
        Self {
            instance: ArcSwap::from_pointee(instance),
            config: ArcSwap::from_pointee(config),
            history_size: history_size.max(1),
            state: Mutex::new(CheckerState {
                consecutive_successes: 0,
                consecutive_failures: 0,
                current_status,
                total_checks: 0,
                failed_checks: 0,
                history: VecDeque::new(),
                unwritten: false,
            }),
        }
    }

    pub fn instance(&self) -> Arc<ServiceInstance> {
        self.instance.load_full()
    }

    /// Pick up endpoint or URL changes from a newer registry record.
    pub fn update_instance(&self, instance: ServiceInstance) {
        self.instance.store(Arc::new(instance));
    }

    pub fn config(&self) -> Arc<HealthCheckConfig> {
        self.config.load_full()
    }

    /// Takes effect from the next probe.
    pub fn set_config(&self, config: HealthCheckConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).current_status
    }

    /// The decided status while it still has to be written to the registry.
    pub fn unwritten_status(&self) -> Option<HealthStatus> {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.unwritten.then_some(st.current_status)
    }

    /// Clear the pending write, unless the status has flipped again since
    /// `status` was written.
    pub fn mark_written(&self, status: HealthStatus) {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if st.current_status == status {
            st.unwritten = false;
        }
    }

    /// Probe once and fold the result in.
    pub async fn check(&self, client: &reqwest::Client) -> (ProbeResult, Option<Transition>) {
        let instance = self.instance();
        let config = self.config();
        let result = run_probe(client, &config, &instance).await;
        let transition = self.record(result.clone(), &config);
        (result, transition)
    }

    fn record(&self, result: ProbeResult, config: &HealthCheckConfig) -> Option<Transition> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.total_checks += 1;

        let previous = st.current_status;
        let next = if result.success {
            st.consecutive_successes += 1;
            st.consecutive_failures = 0;
            (st.consecutive_successes >= config.healthy_threshold).then_some(HealthStatus::Healthy)
        } else {
            st.failed_checks += 1;
            st.consecutive_failures += 1;
            st.consecutive_successes = 0;
            (st.consecutive_failures >= config.unhealthy_threshold).then_some(HealthStatus::Unhealthy)
        };

        st.history.push_back(result);
        while st.history.len() > self.history_size {
            st.history.pop_front();
        }

        match next {
            Some(current) if current != previous => {
                st.current_status = current;
                st.unwritten = true;
                Some(Transition { previous, current })
            }
            _ => None,
        }
    }

    pub fn stats(&self) -> HealthStats {
        let instance = self.instance();
        let config = self.config();
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        HealthStats {
            service: instance.name.clone(),
            instance_id: instance.instance_id.clone(),
            tenant_id: instance.tenant_id.clone(),
            check_type: effective_check_type(&config, &instance),
            status: st.current_status,
            consecutive_successes: st.consecutive_successes,
            consecutive_failures: st.consecutive_failures,
            total_checks: st.total_checks,
            failed_checks: st.failed_checks,
            last_result: st.history.back().cloned(),
            history: st.history.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn result(success: bool) -> ProbeResult {
        ProbeResult {
            success,
            check_type: CheckType::Tcp,
            duration: Duration::from_millis(1),
            at: SystemTime::now(),
            error: (!success).then(|| "connect refused".to_string()),
        }
    }

    fn checker(status: HealthStatus) -> HealthChecker {
        let inst = ServiceInstance::new("orders", "o-1", "1.0").with_status(status);
        HealthChecker::new(inst, HealthCheckConfig::default(), 5)
    }

    #[test]
    fn test_unhealthy_after_threshold_failures() {
        let c = checker(HealthStatus::Healthy);
        let cfg = c.config();
        assert_eq!(c.record(result(false), &cfg), None);
        assert_eq!(c.record(result(false), &cfg), None);
        assert_eq!(
            c.record(result(false), &cfg),
            Some(Transition {
                previous: HealthStatus::Healthy,
                current: HealthStatus::Unhealthy
            })
        );
        // Further failures do not re-announce.
        assert_eq!(c.record(result(false), &cfg), None);
        assert_eq!(c.status(), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_success_interrupts_failure_streak() {
        let c = checker(HealthStatus::Healthy);
        let cfg = c.config();
        c.record(result(false), &cfg);
        c.record(result(false), &cfg);
        c.record(result(true), &cfg);
        c.record(result(false), &cfg);
        c.record(result(false), &cfg);
        assert_eq!(c.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_starting_instance_promoted_after_successes() {
        let c = checker(HealthStatus::Starting);
        let cfg = c.config();
        assert_eq!(c.record(result(true), &cfg), None);
        assert_eq!(c.record(result(true), &cfg), None);
        let t = c.record(result(true), &cfg).unwrap();
        assert_eq!(t.previous, HealthStatus::Starting);
        assert_eq!(t.current, HealthStatus::Healthy);
    }

    #[test]
    fn test_history_is_bounded() {
        let c = checker(HealthStatus::Healthy);
        let cfg = c.config();
        for i in 0..12 {
            c.record(result(i % 2 == 0), &cfg);
        }
        let stats = c.stats();
        assert_eq!(stats.history.len(), 5);
        assert_eq!(stats.total_checks, 12);
        assert_eq!(stats.failed_checks, 6);
        assert!(!stats.last_result.unwrap().success);
    }

    #[test]
    fn test_set_config_applies_new_thresholds() {
        let c = checker(HealthStatus::Healthy);
        c.set_config(HealthCheckConfig {
            unhealthy_threshold: 1,
            ..HealthCheckConfig::default()
        });
        let cfg = c.config();
        assert!(c.record(result(false), &cfg).is_some());
    }

    #[test]
    fn test_flip_stays_unwritten_until_marked() {
        let c = checker(HealthStatus::Healthy);
        let cfg = c.config();
        assert_eq!(c.unwritten_status(), None);
        for _ in 0..3 {
            c.record(result(false), &cfg);
        }
        assert_eq!(c.unwritten_status(), Some(HealthStatus::Unhealthy));
        // Still pending across checks that change nothing.
        c.record(result(false), &cfg);
        assert_eq!(c.unwritten_status(), Some(HealthStatus::Unhealthy));

        c.mark_written(HealthStatus::Unhealthy);
        assert_eq!(c.unwritten_status(), None);
    }

    #[test]
    fn test_stale_write_does_not_clear_newer_flip() {
        let c = checker(HealthStatus::Healthy);
        let cfg = c.config();
        for _ in 0..3 {
            c.record(result(false), &cfg);
        }
        for _ in 0..3 {
            c.record(result(true), &cfg);
        }
        assert_eq!(c.unwritten_status(), Some(HealthStatus::Healthy));
        c.mark_written(HealthStatus::Unhealthy);
        assert_eq!(c.unwritten_status(), Some(HealthStatus::Healthy));
    }
}
