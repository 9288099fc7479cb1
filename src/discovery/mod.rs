//! Service registry: instance records, TTL leases, tenant-scoped discovery
//! and change events.

pub mod cache;
pub mod events;
pub mod instance;
pub mod key;
pub mod query;
pub mod registry;

pub use events::RegistryEvent;
pub use instance::{generate_instance_id, Endpoint, HealthStatus, ServiceInstance};
pub use query::DiscoveryQuery;
pub use registry::ServiceRegistry;
