use super::checker::{HealthChecker, HealthStats, Transition};
use super::probe::{build_probe_client, ProbeResult};
use crate::config::{HealthCheckConfig, HealthConfig};
use crate::discovery::{key, HealthStatus, RegistryEvent, ServiceInstance, ServiceRegistry};
use crate::error::MeshError;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Probes run concurrently by [`HealthManager::check_all`].
const CHECK_ALL_CONCURRENCY: usize = 16;

/// Delivered to listeners when hysteresis flips an instance's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub service: String,
    pub instance_id: String,
    pub tenant_id: Option<String>,
    pub previous: HealthStatus,
    pub current: HealthStatus,
}

pub type StatusListener = Arc<dyn Fn(&StatusChange) + Send + Sync>;

struct Tracked {
    checker: Arc<HealthChecker>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Running {
    cancel: CancellationToken,
    discovery: JoinHandle<()>,
}

fn checker_key(tenant_id: Option<&str>, service: &str, instance_id: &str) -> String {
    format!("{}:{}:{}", key::scope(tenant_id), service, instance_id)
}

fn override_key(service: &str, instance_id: &str) -> String {
    format!("{}:{}", service, instance_id)
}

fn log_transition(instance: &ServiceInstance, t: Transition) {
    if t.current == HealthStatus::Healthy {
        tracing::info!(
            service = %instance.name,
            instance = %instance.instance_id,
            from = %t.previous,
            "health: instance marked healthy"
        );
    } else {
        tracing::warn!(
            service = %instance.name,
            instance = %instance.instance_id,
            from = %t.previous,
            to = %t.current,
            "health: instance marked unhealthy"
        );
    }
    metrics::counter!("mesh_health_check_transitions_total", "to" => t.current.to_string()).increment(1);
}

/// Actively probes every instance in the registry and writes status flips
/// back to it.
///
/// A discovery loop diffs the registry against the tracked checkers every
/// `discovery_interval` (and on registry events); each checker runs its own
/// probe loop. Probe failures are recorded, never propagated.
pub struct HealthManager {
    registry: Arc<ServiceRegistry>,
    config: HealthConfig,
    client: reqwest::Client,
    checkers: DashMap<String, Tracked>,
    /// Per `service:instance` check configs, applied across tenants.
    overrides: DashMap<String, HealthCheckConfig>,
    listeners: RwLock<Vec<StatusListener>>,
    running: Mutex<Option<Running>>,
}

impl HealthManager {
    pub fn new(registry: Arc<ServiceRegistry>, config: HealthConfig) -> Result<Arc<Self>, MeshError> {
        Ok(Arc::new(Self {
            registry,
            config,
            client: build_probe_client()?,
            checkers: DashMap::new(),
            overrides: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            running: Mutex::new(None),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Start the discovery loop. Idempotent; a no-op when health checking is
    /// disabled in config.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            tracing::info!("health: disabled by config, not starting");
            return;
        }
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);
        let mut events = self.registry.subscribe();
        let period = self.config.discovery_interval();

        let discovery = tokio::spawn(async move {
            tracing::info!("health: discovery loop started, interval={:?}", period);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => None,
                    ev = events.recv() => match ev {
                        Ok(ev) => Some(ev),
                        Err(RecvError::Lagged(n)) => {
                            tracing::debug!("health: missed {} registry events, resyncing", n);
                            None
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                match event {
                    None => manager.sync(&token).await,
                    Some(RegistryEvent::Registered(inst)) => manager.track(inst, &token),
                    Some(RegistryEvent::Deregistered(inst)) => {
                        manager.untrack(&checker_key(inst.tenant_id.as_deref(), &inst.name, &inst.instance_id))
                    }
                    Some(RegistryEvent::HealthChanged { .. }) => {}
                }
            }
            tracing::info!("health: discovery loop stopped");
        });

        *running = Some(Running { cancel, discovery });
    }

    /// Stop the discovery loop and every checker, waiting for them to exit.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.discovery.await {
            tracing::warn!("health: discovery loop ended abnormally: {}", e);
        }

        let keys: Vec<String> = self.checkers.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, tracked)) = self.checkers.remove(&key) {
                tracked.cancel.cancel();
                if let Err(e) = tracked.handle.await {
                    tracing::warn!("health: checker {} ended abnormally: {}", key, e);
                }
            }
        }
        metrics::gauge!("mesh_health_check_tracked_instances").set(0.0);
        tracing::info!("health: stopped");
    }

    /// Diff the registry against tracked checkers. A store failure leaves the
    /// tracked set untouched.
    async fn sync(self: &Arc<Self>, parent: &CancellationToken) {
        let instances = match self.registry.try_list_all().await {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!("health: discovery failed, keeping {} checkers: {}", self.checkers.len(), e);
                metrics::counter!("mesh_health_check_discovery_errors_total").increment(1);
                return;
            }
        };

        let mut seen = HashSet::with_capacity(instances.len());
        for inst in instances {
            seen.insert(checker_key(inst.tenant_id.as_deref(), &inst.name, &inst.instance_id));
            self.track(inst, parent);
        }
        let stale: Vec<String> = self
            .checkers
            .iter()
            .filter(|e| !seen.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.untrack(&key);
        }
        metrics::gauge!("mesh_health_check_tracked_instances").set(self.checkers.len() as f64);
    }

    fn track(self: &Arc<Self>, inst: ServiceInstance, parent: &CancellationToken) {
        if parent.is_cancelled() {
            return;
        }
        let ckey = checker_key(inst.tenant_id.as_deref(), &inst.name, &inst.instance_id);
        if let Some(tracked) = self.checkers.get(&ckey) {
            tracked.checker.update_instance(inst);
            return;
        }

        let config = self
            .overrides
            .get(&override_key(&inst.name, &inst.instance_id))
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.config.default_check.clone());
        tracing::info!(
            service = %inst.name,
            instance = %inst.instance_id,
            tenant = key::scope(inst.tenant_id.as_deref()),
            "health: tracking instance"
        );
        let checker = Arc::new(HealthChecker::new(inst, config, self.config.history_size));

        let cancel = parent.child_token();
        let token = cancel.clone();
        let weak: Weak<Self> = Arc::downgrade(self);
        let task_checker = checker.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = manager.run_check(&task_checker) => {}
                }
                drop(manager);

                let interval = task_checker.config().interval();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        self.checkers.insert(ckey, Tracked { checker, cancel, handle });
        metrics::gauge!("mesh_health_check_tracked_instances").set(self.checkers.len() as f64);
    }

    fn untrack(&self, key: &str) {
        if let Some((_, tracked)) = self.checkers.remove(key) {
            tracked.cancel.cancel();
            tracing::info!("health: stopped tracking {}", key);
        }
        metrics::gauge!("mesh_health_check_tracked_instances").set(self.checkers.len() as f64);
    }

    async fn run_check(&self, checker: &HealthChecker) -> ProbeResult {
        let (result, transition) = checker.check(&self.client).await;
        let outcome = if result.success { "success" } else { "failure" };
        metrics::counter!("mesh_health_check_total", "type" => result.check_type.to_string(), "result" => outcome)
            .increment(1);
        metrics::histogram!("mesh_health_check_duration_seconds").record(result.duration.as_secs_f64());

        let instance = checker.instance();
        if !result.success {
            tracing::debug!(
                service = %instance.name,
                instance = %instance.instance_id,
                "health: check failed: {}",
                result.error.as_deref().unwrap_or("unknown")
            );
        }
        if let Some(t) = transition {
            log_transition(&instance, t);
        }
        self.flush_status(checker, &instance).await;
        if let Some(t) = transition {
            self.notify_listeners(&instance, t);
        }
        result
    }

    /// Write the checker's decided status while it is pending. A failed
    /// write stays pending and is retried after the next check.
    async fn flush_status(&self, checker: &HealthChecker, instance: &ServiceInstance) {
        let Some(status) = checker.unwritten_status() else {
            return;
        };
        let written = self
            .registry
            .update_health(&instance.name, &instance.instance_id, status, instance.tenant_id.as_deref())
            .await;
        if written {
            checker.mark_written(status);
        } else {
            metrics::counter!("mesh_health_check_write_failures_total").increment(1);
            tracing::warn!(
                service = %instance.name,
                instance = %instance.instance_id,
                "health: could not write status {} to registry, will retry",
                status
            );
        }
    }

    fn notify_listeners(&self, instance: &ServiceInstance, t: Transition) {
        let change = StatusChange {
            service: instance.name.clone(),
            instance_id: instance.instance_id.clone(),
            tenant_id: instance.tenant_id.clone(),
            previous: t.previous,
            current: t.current,
        };
        let listeners: Vec<StatusListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(&change))).is_err() {
                tracing::error!("health: status listener panicked");
            }
        }
    }

    /// Register a callback for status flips. Called on the checker's task;
    /// keep it short.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&StatusChange) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Set the check for one `service:instance`. Applies to a running
    /// checker from its next probe and to the instance if it appears later.
    /// An invalid config is rejected and the current one kept.
    pub fn configure_check(
        &self,
        service: &str,
        instance_id: &str,
        config: HealthCheckConfig,
    ) -> Result<(), MeshError> {
        config.validate()?;
        for entry in self.checkers.iter() {
            let inst = entry.checker.instance();
            if inst.name == service && inst.instance_id == instance_id {
                entry.checker.set_config(config.clone());
            }
        }
        tracing::info!(
            service = %service,
            instance = %instance_id,
            interval_secs = config.interval_secs,
            "health: check configured"
        );
        self.overrides.insert(override_key(service, instance_id), config);
        Ok(())
    }

    fn checker(&self, service: &str, instance_id: &str, tenant_id: Option<&str>) -> Option<Arc<HealthChecker>> {
        self.checkers
            .get(&checker_key(tenant_id, service, instance_id))
            .map(|t| t.checker.clone())
    }

    /// Probe one tracked instance immediately, outside its schedule.
    pub async fn check_now(&self, service: &str, instance_id: &str, tenant_id: Option<&str>) -> Option<ProbeResult> {
        let checker = self.checker(service, instance_id, tenant_id)?;
        Some(self.run_check(&checker).await)
    }

    /// Probe every tracked instance once, a bounded number at a time.
    pub async fn check_all(&self) -> Vec<ProbeResult> {
        let checkers: Vec<Arc<HealthChecker>> = self.checkers.iter().map(|e| e.checker.clone()).collect();
        stream::iter(checkers)
            .map(|checker| async move { self.run_check(&checker).await })
            .buffer_unordered(CHECK_ALL_CONCURRENCY)
            .collect()
            .await
    }

    pub fn get_stats(&self, service: &str, instance_id: &str, tenant_id: Option<&str>) -> Option<HealthStats> {
        self.checker(service, instance_id, tenant_id).map(|c| c.stats())
    }

    pub fn get_all_stats(&self) -> Vec<HealthStats> {
        let mut all: Vec<HealthStats> = self.checkers.iter().map(|e| e.checker.stats()).collect();
        all.sort_by(|a, b| {
            (&a.tenant_id, &a.service, &a.instance_id).cmp(&(&b.tenant_id, &b.service, &b.instance_id))
        });
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::health::probe::CustomProbe;
    use crate::store::{KvStore, MemoryStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Memory store whose writes fail while `failing` is set.
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl KvStore for FlakyStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("store unavailable");
            }
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> anyhow::Result<bool> {
            self.inner.delete(key).await
        }
        async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
            self.inner.scan_prefix(prefix).await
        }
    }

    fn fast_check(up: Arc<AtomicBool>) -> HealthCheckConfig {
        HealthCheckConfig {
            interval_secs: 0.02,
            timeout_secs: 0.5,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            ..HealthCheckConfig::default()
        }
        .with_custom(CustomProbe::from_fn(move |_| up.load(Ordering::SeqCst)))
    }

    async fn setup(up: Arc<AtomicBool>) -> (Arc<ServiceRegistry>, Arc<HealthManager>) {
        let registry = ServiceRegistry::new(Arc::new(MemoryStore::new()), RegistryConfig::default());
        let config = HealthConfig {
            discovery_interval_secs: 0.05,
            default_check: fast_check(up),
            ..HealthConfig::default()
        };
        let manager = HealthManager::new(registry.clone(), config).unwrap();
        (registry, manager)
    }

    #[tokio::test]
    async fn test_failing_instance_marked_unhealthy_then_recovers() {
        let up = Arc::new(AtomicBool::new(false));
        let (registry, manager) = setup(up.clone()).await;
        let changes = Arc::new(Mutex::new(Vec::new()));
        {
            let changes = changes.clone();
            manager.add_listener(move |c| changes.lock().unwrap().push(c.current));
        }

        registry.register(ServiceInstance::new("orders", "o-1", "1.0"), false).await;
        manager.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let inst = registry.get_instance("orders", "o-1", None).await.unwrap();
        assert_eq!(inst.status, HealthStatus::Unhealthy);

        up.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let inst = registry.get_instance("orders", "o-1", None).await.unwrap();
        assert_eq!(inst.status, HealthStatus::Healthy);

        manager.stop().await;
        assert!(!manager.is_running());
        assert_eq!(
            *changes.lock().unwrap(),
            vec![HealthStatus::Unhealthy, HealthStatus::Healthy]
        );
    }

    #[tokio::test]
    async fn test_vanished_instance_is_untracked() {
        let up = Arc::new(AtomicBool::new(true));
        let (registry, manager) = setup(up).await;
        registry.register(ServiceInstance::new("orders", "o-1", "1.0"), false).await;
        manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.get_all_stats().len(), 1);

        registry.deregister("orders", "o-1", None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.get_all_stats().is_empty());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_configure_check_applies_to_running_checker() {
        let up = Arc::new(AtomicBool::new(true));
        let (registry, manager) = setup(up).await;
        registry.register(ServiceInstance::new("orders", "o-1", "1.0"), false).await;
        manager.start();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let down = Arc::new(AtomicBool::new(false));
        let mut cfg = fast_check(down);
        cfg.unhealthy_threshold = 1;
        manager.configure_check("orders", "o-1", cfg).unwrap();

        let r = manager.check_now("orders", "o-1", None).await.unwrap();
        assert!(!r.success);
        let stats = manager.get_stats("orders", "o-1", None).unwrap();
        assert_eq!(stats.status, HealthStatus::Unhealthy);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_check_all_and_panicking_listener() {
        let up = Arc::new(AtomicBool::new(false));
        let (registry, manager) = setup(up).await;
        manager.add_listener(|_| panic!("listener bug"));
        registry.register(ServiceInstance::new("orders", "o-1", "1.0"), false).await;
        registry.register(ServiceInstance::new("orders", "o-2", "1.0").with_tenant("acme"), false).await;
        manager.start();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let results = manager.check_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.success));
        assert!(manager.check_now("orders", "o-2", Some("acme")).await.is_some());
        assert!(manager.check_now("orders", "o-2", None).await.is_none());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_manager_does_not_start() {
        let registry = ServiceRegistry::new(Arc::new(MemoryStore::new()), RegistryConfig::default());
        let config = HealthConfig {
            enabled: false,
            ..HealthConfig::default()
        };
        let manager = HealthManager::new(registry, config).unwrap();
        manager.start();
        assert!(!manager.is_running());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_status_write_retried_after_store_recovers() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing: AtomicBool::new(false),
        });
        let registry = ServiceRegistry::new(store.clone(), RegistryConfig::default());
        let config = HealthConfig {
            discovery_interval_secs: 0.05,
            default_check: fast_check(Arc::new(AtomicBool::new(false))),
            ..HealthConfig::default()
        };
        let manager = HealthManager::new(registry.clone(), config).unwrap();
        assert!(registry.register(ServiceInstance::new("orders", "o-1", "1.0"), false).await);

        store.failing.store(true, Ordering::SeqCst);
        manager.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = manager.get_stats("orders", "o-1", None).unwrap();
        assert_eq!(stats.status, HealthStatus::Unhealthy);
        let inst = registry.get_instance("orders", "o-1", None).await.unwrap();
        assert_eq!(inst.status, HealthStatus::Healthy, "the write cannot have landed yet");

        // No further flip happens; the pending status alone must get through.
        store.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        let inst = registry.get_instance("orders", "o-1", None).await.unwrap();
        assert_eq!(inst.status, HealthStatus::Unhealthy);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_configure_check_rejects_invalid_config() {
        let up = Arc::new(AtomicBool::new(true));
        let (_registry, manager) = setup(up.clone()).await;

        let mut bad = fast_check(up.clone());
        bad.interval_secs = f64::NAN;
        assert!(matches!(
            manager.configure_check("orders", "o-1", bad),
            Err(MeshError::Config(_))
        ));
        let mut bad = fast_check(up.clone());
        bad.timeout_secs = -0.5;
        assert!(manager.configure_check("orders", "o-1", bad).is_err());
        assert!(manager.overrides.is_empty());

        assert!(manager.configure_check("orders", "o-1", fast_check(up)).is_ok());
        assert_eq!(manager.overrides.len(), 1);
    }
}
