use super::instance::ServiceInstance;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// What one discovery scan covered: a tenant scope, optionally narrowed to a
/// single service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub tenant_id: Option<String>,
    pub service: Option<String>,
}

impl ScopeKey {
    pub fn new(tenant_id: Option<&str>, service: Option<&str>) -> Self {
        Self {
            tenant_id: tenant_id.map(str::to_string),
            service: service.map(str::to_string),
        }
    }
}

struct Entry {
    fetched_at: Instant,
    last_used: Instant,
    instances: Arc<Vec<ServiceInstance>>,
}

/// Short-lived cache of raw scan results, before query filters are applied.
///
/// A zero TTL disables caching. The lock is only held for map operations,
/// never across store I/O.
pub struct DiscoveryCache {
    ttl: Duration,
    entries: Mutex<HashMap<ScopeKey, Entry>>,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Fresh entry for `key`, if any. Marks it as used.
    pub fn get(&self, key: &ScopeKey) -> Option<Arc<Vec<ServiceInstance>>> {
        if !self.enabled() {
            return None;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(key)?;
        if now.duration_since(entry.fetched_at) >= self.ttl {
            return None;
        }
        entry.last_used = now;
        Some(entry.instances.clone())
    }

    pub fn put(&self, key: ScopeKey, instances: Vec<ServiceInstance>) -> Arc<Vec<ServiceInstance>> {
        let instances = Arc::new(instances);
        if !self.enabled() {
            return instances;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let last_used = entries.get(&key).map(|e| e.last_used).unwrap_or(now);
        entries.insert(
            key,
            Entry {
                fetched_at: now,
                last_used,
                instances: instances.clone(),
            },
        );
        instances
    }

    /// Drop every entry of one tenant scope. Called after local writes so the
    /// next read sees them.
    pub fn invalidate_tenant(&self, tenant_id: Option<&str>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|k, _| k.tenant_id.as_deref() != tenant_id);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Scopes read within the last `idle` period; the refresh loop re-fetches
    /// these and evicts the rest.
    pub fn retain_active(&self, idle: Duration) -> Vec<ScopeKey> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| now.duration_since(e.last_used) < idle);
        entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
