use super::instance::{HealthStatus, ServiceInstance};
use std::collections::BTreeSet;

/// Discovery filters. Every filter that is set must match (AND semantics).
///
/// Defaults to healthy instances in the global scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryQuery {
    pub name: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    /// `None` matches every status.
    pub status: Option<HealthStatus>,
    /// `None` is the global scope, never "all tenants".
    pub tenant_id: Option<String>,
}

impl Default for DiscoveryQuery {
    fn default() -> Self {
        Self {
            name: None,
            capabilities: BTreeSet::new(),
            tags: BTreeSet::new(),
            status: Some(HealthStatus::Healthy),
            tenant_id: None,
        }
    }
}

impl DiscoveryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(name: impl Into<String>) -> Self {
        Self::default().name(name)
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn status(mut self, status: HealthStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn any_status(mut self) -> Self {
        self.status = None;
        self
    }

    pub fn matches(&self, inst: &ServiceInstance) -> bool {
        if inst.tenant_id != self.tenant_id {
            return false;
        }
        if let Some(ref name) = self.name {
            if &inst.name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if inst.status != status {
                return false;
            }
        }
        self.capabilities.is_subset(&inst.capabilities) && self.tags.is_subset(&inst.tags)
    }
}
