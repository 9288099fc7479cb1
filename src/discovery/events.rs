use super::instance::{HealthStatus, ServiceInstance};

/// One event per registry mutation, carrying the record the mutation produced
/// (for `Deregistered`, the last record seen before deletion).
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Registered(ServiceInstance),
    Deregistered(ServiceInstance),
    HealthChanged {
        previous: HealthStatus,
        instance: ServiceInstance,
    },
}

impl RegistryEvent {
    /// Stream name: `registered`, `deregistered` or `health_changed`.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryEvent::Registered(_) => "registered",
            RegistryEvent::Deregistered(_) => "deregistered",
            RegistryEvent::HealthChanged { .. } => "health_changed",
        }
    }

    pub fn instance(&self) -> &ServiceInstance {
        match self {
            RegistryEvent::Registered(i) | RegistryEvent::Deregistered(i) => i,
            RegistryEvent::HealthChanged { instance, .. } => instance,
        }
    }
}
