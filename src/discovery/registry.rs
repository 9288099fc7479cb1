use super::cache::{DiscoveryCache, ScopeKey};
use super::events::RegistryEvent;
use super::instance::{HealthStatus, ServiceInstance};
use super::key;
use super::query::DiscoveryQuery;
use crate::config::RegistryConfig;
use crate::error::MeshError;
use crate::store::KvStore;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Held while a read-modify-write on one key is in flight.
struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Two references left (the map's and ours) means nobody is waiting.
        let lock = &self.lock;
        self.locks
            .remove_if(&self.key, |_, l| Arc::ptr_eq(l, lock) && Arc::strong_count(l) == 2);
    }
}

struct HeartbeatTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Service registry over a TTL key/value store.
///
/// Every record lives at `<prefix>:<tenant|global>:<service>:<instance>` with
/// an expiry of `service_ttl`; heartbeats re-write the record to keep it alive.
/// Store failures never surface as errors: mutations return `false` and reads
/// return an empty result, with a warning logged and a metric bumped.
///
/// The registry owns its heartbeat tasks and the maintenance loop, and
/// stops them in [`ServiceRegistry::shutdown`].
pub struct ServiceRegistry {
    store: Arc<dyn KvStore>,
    config: RegistryConfig,
    cache: DiscoveryCache,
    events: broadcast::Sender<RegistryEvent>,
    /// Records this process registered, keyed by store key. Used to re-create
    /// a record whose lease lapsed while its heartbeat was still running.
    local: DashMap<String, ServiceInstance>,
    heartbeats: DashMap<String, HeartbeatTask>,
    /// Serializes read-modify-write sequences on one key within this process.
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    shutdown: CancellationToken,
    maintenance_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn KvStore>, config: RegistryConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let cache = DiscoveryCache::new(config.cache_ttl());
        Arc::new(Self {
            store,
            config,
            cache,
            events,
            local: DashMap::new(),
            heartbeats: DashMap::new(),
            key_locks: DashMap::new(),
            shutdown: CancellationToken::new(),
            maintenance_task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribe to registry events. A subscriber that falls more than
    /// `event_buffer` events behind sees `RecvError::Lagged` and keeps going.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn key_of(&self, tenant_id: Option<&str>, name: &str, instance_id: &str) -> String {
        key::instance_key(&self.config.key_prefix, tenant_id, name, instance_id)
    }

    /// Take this process's lock for `key`. The map entry is dropped again
    /// when the last holder releases it, so missing ids leave nothing behind.
    async fn lock_key(&self, key: &str) -> KeyGuard<'_> {
        let lock = self
            .key_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;
        KeyGuard {
            locks: &self.key_locks,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    fn emit(&self, event: RegistryEvent) {
        metrics::counter!("mesh_registry_events_total", "kind" => event.kind()).increment(1);
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn write(&self, key: &str, inst: &ServiceInstance) -> anyhow::Result<()> {
        let json = serde_json::to_string(inst)?;
        self.store.set(key, &json, self.config.service_ttl()).await
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<ServiceInstance>> {
        match self.store.get(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Register (or re-register) an instance. With `auto_heartbeat` a
    /// background task re-writes the record every `heartbeat_interval`
    /// until the instance is deregistered or the registry shuts down.
    pub async fn register(self: &Arc<Self>, instance: ServiceInstance, auto_heartbeat: bool) -> bool {
        if let Err(reason) = validate_identity(&instance) {
            tracing::warn!(
                service = %instance.name,
                instance = %instance.instance_id,
                "registry: rejecting registration: {}",
                reason
            );
            record_op("register", false);
            return false;
        }

        let mut instance = instance;
        let now = SystemTime::now();
        instance.last_heartbeat = now;
        instance.lease_renewed_at = Some(now);

        let key = self.key_of(instance.tenant_id.as_deref(), &instance.name, &instance.instance_id);
        {
            let _guard = self.lock_key(&key).await;
            if let Err(e) = self.write(&key, &instance).await {
                tracing::warn!("registry: register {} failed: {}", key, e);
                record_op("register", false);
                return false;
            }
            self.local.insert(key.clone(), instance.clone());
        }

        self.cache.invalidate_tenant(instance.tenant_id.as_deref());
        tracing::info!(
            service = %instance.name,
            instance = %instance.instance_id,
            tenant = key::scope(instance.tenant_id.as_deref()),
            status = %instance.status,
            "registry: registered instance"
        );
        record_op("register", true);

        if auto_heartbeat {
            self.spawn_heartbeat(&key, &instance);
        } else if let Some((_, old)) = self.heartbeats.remove(&key) {
            old.cancel.cancel();
        }
        metrics::gauge!("mesh_registry_heartbeat_tasks").set(self.heartbeats.len() as f64);

        self.emit(RegistryEvent::Registered(instance));
        true
    }

    fn spawn_heartbeat(self: &Arc<Self>, key: &str, instance: &ServiceInstance) {
        let cancel = self.shutdown.child_token();
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval();
        let name = instance.name.clone();
        let instance_id = instance.instance_id.clone();
        let tenant_id = instance.tenant_id.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry
                    .renew(&name, &instance_id, tenant_id.as_deref(), Some(&token))
                    .await;
            }
            tracing::debug!(service = %name, instance = %instance_id, "registry: heartbeat task stopped");
        });

        if let Some(old) = self.heartbeats.insert(key.to_string(), HeartbeatTask { cancel, handle }) {
            old.cancel.cancel();
        }
    }

    /// Remove an instance. Returns whether a record existed in the store.
    /// Stops the instance's heartbeat task first so it cannot re-create the
    /// record afterwards.
    pub async fn deregister(&self, name: &str, instance_id: &str, tenant_id: Option<&str>) -> bool {
        let key = self.key_of(tenant_id, name, instance_id);
        if let Some((_, task)) = self.heartbeats.remove(&key) {
            task.cancel.cancel();
        }
        metrics::gauge!("mesh_registry_heartbeat_tasks").set(self.heartbeats.len() as f64);
        let local = self.local.remove(&key).map(|(_, inst)| inst);

        let guard = self.lock_key(&key).await;
        let last = match self.read(&key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!("registry: reading {} before delete failed: {}", key, e);
                None
            }
        };
        let existed = match self.store.delete(&key).await {
            Ok(existed) => existed,
            Err(e) => {
                tracing::warn!("registry: deregister {} failed: {}", key, e);
                record_op("deregister", false);
                return false;
            }
        };
        drop(guard);

        self.cache.invalidate_tenant(tenant_id);
        record_op("deregister", true);
        if existed {
            tracing::info!(
                service = %name,
                instance = %instance_id,
                tenant = key::scope(tenant_id),
                "registry: deregistered instance"
            );
            if let Some(inst) = last.or(local) {
                self.emit(RegistryEvent::Deregistered(inst));
            }
        } else {
            tracing::debug!("registry: deregister {}: no such record", key);
        }
        existed
    }

    /// Set an instance's status and refresh its lease. Returns `false` when
    /// the record does not exist or the store fails. `health_changed` fires
    /// only when the status actually changed.
    pub async fn update_health(
        &self,
        name: &str,
        instance_id: &str,
        status: HealthStatus,
        tenant_id: Option<&str>,
    ) -> bool {
        let key = self.key_of(tenant_id, name, instance_id);
        let guard = self.lock_key(&key).await;

        let mut inst = match self.read(&key).await {
            Ok(Some(inst)) => inst,
            Ok(None) => {
                tracing::debug!("registry: update_health {}: no such record", key);
                record_op("update_health", false);
                return false;
            }
            Err(e) => {
                tracing::warn!("registry: update_health {} read failed: {}", key, e);
                record_op("update_health", false);
                return false;
            }
        };

        let previous = inst.status;
        inst.status = status;
        inst.lease_renewed_at = Some(SystemTime::now());
        if let Err(e) = self.write(&key, &inst).await {
            tracing::warn!("registry: update_health {} write failed: {}", key, e);
            record_op("update_health", false);
            return false;
        }
        if let Some(mut local) = self.local.get_mut(&key) {
            local.status = status;
            local.lease_renewed_at = inst.lease_renewed_at;
        }
        drop(guard);

        self.cache.invalidate_tenant(tenant_id);
        record_op("update_health", true);
        if previous != status {
            tracing::info!(
                service = %name,
                instance = %instance_id,
                from = %previous,
                to = %status,
                "registry: health changed"
            );
            self.emit(RegistryEvent::HealthChanged { previous, instance: inst });
        }
        true
    }

    /// Renew an instance's lease now. The stored status is preserved. If the
    /// record lapsed but this process registered it, the local copy is
    /// written back. Returns `false` when there is nothing to renew.
    pub async fn heartbeat(&self, name: &str, instance_id: &str, tenant_id: Option<&str>) -> bool {
        self.renew(name, instance_id, tenant_id, None).await
    }

    async fn renew(
        &self,
        name: &str,
        instance_id: &str,
        tenant_id: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        let key = self.key_of(tenant_id, name, instance_id);
        let _guard = self.lock_key(&key).await;
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return false;
        }

        let now = SystemTime::now();
        let (mut inst, recreated) = match self.read(&key).await {
            Ok(Some(inst)) => (inst, false),
            Ok(None) => match self.local.get(&key) {
                Some(local) => (local.clone(), true),
                None => {
                    tracing::debug!("registry: heartbeat {}: no such record", key);
                    return false;
                }
            },
            Err(e) => {
                tracing::warn!("registry: heartbeat {} read failed: {}", key, e);
                metrics::counter!("mesh_registry_heartbeat_failures_total").increment(1);
                return false;
            }
        };

        inst.last_heartbeat = now;
        inst.lease_renewed_at = Some(now);
        if let Err(e) = self.write(&key, &inst).await {
            tracing::warn!("registry: heartbeat {} write failed: {}", key, e);
            metrics::counter!("mesh_registry_heartbeat_failures_total").increment(1);
            return false;
        }
        if let Some(mut local) = self.local.get_mut(&key) {
            *local = inst.clone();
        }
        record_op("heartbeat", true);

        if recreated {
            tracing::info!("registry: lease for {} had lapsed, re-registered", key);
            self.cache.invalidate_tenant(tenant_id);
            self.emit(RegistryEvent::Registered(inst));
        }
        true
    }

    /// Live instances matching every filter of `query`, within exactly the
    /// query's tenant scope. May be served from the local cache; cached
    /// records whose lease has lapsed are dropped.
    pub async fn discover(&self, query: &DiscoveryQuery) -> Vec<ServiceInstance> {
        let scope = ScopeKey::new(query.tenant_id.as_deref(), query.name.as_deref());
        let instances = match self.cache.get(&scope) {
            Some(hit) => {
                metrics::counter!("mesh_registry_discover_total", "source" => "cache").increment(1);
                hit
            }
            None => {
                metrics::counter!("mesh_registry_discover_total", "source" => "store").increment(1);
                match self.fetch_scope(&scope).await {
                    Ok(fetched) => self.cache.put(scope, fetched),
                    Err(e) => {
                        tracing::warn!(
                            tenant = key::scope(query.tenant_id.as_deref()),
                            service = query.name.as_deref().unwrap_or("*"),
                            "registry: discover failed: {}",
                            e
                        );
                        record_op("discover", false);
                        return Vec::new();
                    }
                }
            }
        };

        let ttl = self.config.service_ttl();
        let now = SystemTime::now();
        instances
            .iter()
            .filter(|i| !i.lease_expired(ttl, now) && query.matches(i))
            .cloned()
            .collect()
    }

    async fn fetch_scope(&self, scope: &ScopeKey) -> anyhow::Result<Vec<ServiceInstance>> {
        let prefix = match scope.service {
            Some(ref service) => key::service_prefix(&self.config.key_prefix, scope.tenant_id.as_deref(), service),
            None => key::tenant_prefix(&self.config.key_prefix, scope.tenant_id.as_deref()),
        };
        let kvs = self.store.scan_prefix(&prefix).await?;
        Ok(kvs
            .into_iter()
            .filter_map(|(k, v)| decode(&k, &v))
            .filter(|i| i.tenant_id == scope.tenant_id)
            .collect())
    }

    /// Fetch one record directly from the store.
    pub async fn get_instance(
        &self,
        name: &str,
        instance_id: &str,
        tenant_id: Option<&str>,
    ) -> Option<ServiceInstance> {
        let key = self.key_of(tenant_id, name, instance_id);
        match self.read(&key).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!("registry: get {} failed: {}", key, e);
                None
            }
        }
    }

    /// Names of services with at least one live record in a tenant scope.
    pub async fn list_services(&self, tenant_id: Option<&str>) -> BTreeSet<String> {
        let prefix = key::tenant_prefix(&self.config.key_prefix, tenant_id);
        match self.store.scan_prefix(&prefix).await {
            Ok(kvs) => kvs
                .iter()
                .filter_map(|(k, _)| key::parse(&self.config.key_prefix, k))
                .map(|(_, service, _)| service)
                .collect(),
            Err(e) => {
                tracing::warn!("registry: list_services failed: {}", e);
                BTreeSet::new()
            }
        }
    }

    /// Every live record of every tenant and status, bypassing the cache.
    pub async fn list_all(&self) -> Vec<ServiceInstance> {
        match self.try_list_all().await {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!("registry: list_all failed: {}", e);
                record_op("list_all", false);
                Vec::new()
            }
        }
    }

    /// Like [`list_all`](Self::list_all), but a store failure is an error
    /// rather than an empty list, for callers that must not mistake an outage
    /// for "no instances".
    pub async fn try_list_all(&self) -> Result<Vec<ServiceInstance>, MeshError> {
        let prefix = key::all_prefix(&self.config.key_prefix);
        let kvs = self
            .store
            .scan_prefix(&prefix)
            .await
            .map_err(|e| MeshError::Store(format!("{:#}", e)))?;
        Ok(kvs.into_iter().filter_map(|(k, v)| decode(&k, &v)).collect())
    }

    /// Start the maintenance loop. Each tick drops local copies of records
    /// that lapsed without a heartbeat task; with caching on it also
    /// re-fetches scopes read recently and evicts idle ones. Ticks every
    /// `cache_ttl`, or every `service_ttl` when caching is off.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.maintenance_task.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let caching = self.cache.enabled();
        let period = if caching { self.cache.ttl() } else { self.config.service_ttl() };
        *slot = Some(tokio::spawn(async move {
            tracing::info!("registry: maintenance loop started, period={:?}, caching={}", period, caching);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.prune_local();
                if caching {
                    registry.refresh_cache(period * 2).await;
                }
            }
            tracing::info!("registry: maintenance loop stopped");
        }));
    }

    /// Forget local copies whose lease lapsed and that no heartbeat task
    /// will bring back. Returns how many were dropped.
    fn prune_local(&self) -> usize {
        let ttl = self.config.service_ttl();
        let now = SystemTime::now();
        let before = self.local.len();
        self.local
            .retain(|key, inst| self.heartbeats.contains_key(key) || !inst.lease_expired(ttl, now));
        let pruned = before.saturating_sub(self.local.len());
        if pruned > 0 {
            tracing::debug!("registry: pruned {} lapsed local records", pruned);
        }
        pruned
    }

    async fn refresh_cache(&self, idle: std::time::Duration) {
        for scope in self.cache.retain_active(idle) {
            match self.fetch_scope(&scope).await {
                Ok(fresh) => {
                    self.cache.put(scope, fresh);
                }
                Err(e) => tracing::debug!("registry: cache refresh for {:?} failed: {}", scope, e),
            }
        }
    }

    /// Stop every heartbeat task and the maintenance loop, then wait for them to
    /// finish. Records stay in the store and expire on their own lease.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let keys: Vec<String> = self.heartbeats.iter().map(|e| e.key().clone()).collect();
        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, task)) = self.heartbeats.remove(&key) {
                task.cancel.cancel();
                handles.push(task.handle);
            }
        }
        let refresh = self
            .maintenance_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        handles.extend(refresh);

        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("registry: background task ended abnormally: {}", e);
            }
        }
        metrics::gauge!("mesh_registry_heartbeat_tasks").set(0.0);
        self.cache.clear();
        tracing::info!("registry: shut down");
    }

    /// Number of running heartbeat tasks.
    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.len()
    }
}

fn decode(key: &str, json: &str) -> Option<ServiceInstance> {
    match serde_json::from_str::<ServiceInstance>(json) {
        Ok(inst) => Some(inst),
        Err(e) => {
            tracing::warn!("registry: skipping undecodable record {}: {}", key, e);
            None
        }
    }
}

fn record_op(op: &'static str, ok: bool) {
    let result = if ok { "success" } else { "error" };
    metrics::counter!("mesh_registry_operations_total", "op" => op, "result" => result).increment(1);
}

fn validate_identity(inst: &ServiceInstance) -> Result<(), &'static str> {
    if inst.name.is_empty() || inst.name.contains(':') {
        return Err("service name must be non-empty and must not contain ':'");
    }
    if inst.instance_id.is_empty() {
        return Err("instance id must be non-empty");
    }
    if let Some(ref tenant) = inst.tenant_id {
        if tenant.is_empty() || tenant.contains(':') || tenant == key::GLOBAL_SCOPE {
            return Err("tenant id must be non-empty, must not contain ':' and must not be 'global'");
        }
    }
    Ok(())
}
