use crate::config::MeshConfig;
use crate::discovery::{DiscoveryQuery, ServiceInstance, ServiceRegistry};
use crate::health::HealthManager;
use crate::store::{self, KvStore};
use crate::upstream::{CircuitBreakerRegistry, LoadBalancer, SelectContext};
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// The wired-up control plane: one registry over the configured store, an
/// optional health manager feeding it, a shared circuit breaker registry and
/// one load balancer per service.
///
/// Components only reach each other through the registry, so each one can
/// also be used on its own.
pub struct ControlPlane {
    config: MeshConfig,
    registry: Arc<ServiceRegistry>,
    health: Option<Arc<HealthManager>>,
    breakers: Arc<CircuitBreakerRegistry>,
    balancers: DashMap<String, Arc<LoadBalancer>>,
}

impl ControlPlane {
    /// Connect to the configured store and build every component.
    /// Nothing runs until [`start`](Self::start).
    pub async fn build(config: MeshConfig) -> Result<Self> {
        let store = store::build_store(&config.store).await?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: MeshConfig, store: Arc<dyn KvStore>) -> Result<Self> {
        let registry = ServiceRegistry::new(store, config.registry.clone());
        let health = if config.health.enabled {
            Some(HealthManager::new(registry.clone(), config.health.clone())?)
        } else {
            tracing::info!("health: disabled by config");
            None
        };
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));

        Ok(Self {
            config,
            registry,
            health,
            breakers,
            balancers: DashMap::new(),
        })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn health(&self) -> Option<&Arc<HealthManager>> {
        self.health.as_ref()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The load balancer for `service`, created with the configured strategy
    /// on first use.
    pub fn balancer(&self, service: &str) -> Arc<LoadBalancer> {
        if let Some(lb) = self.balancers.get(service) {
            return lb.clone();
        }
        self.balancers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(LoadBalancer::from_config(&self.config.load_balancer)))
            .clone()
    }

    /// Discover healthy instances of `service` and pick one.
    pub async fn pick(
        &self,
        service: &str,
        tenant_id: Option<&str>,
        ctx: Option<&SelectContext>,
    ) -> Option<ServiceInstance> {
        let mut query = DiscoveryQuery::service(service);
        if let Some(tenant) = tenant_id {
            query = query.tenant(tenant);
        }
        let instances = self.registry.discover(&query).await;
        self.balancer(service).select(&instances, ctx)
    }

    /// Start the registry maintenance loop and the health manager.
    pub fn start(&self) {
        self.registry.start();
        if let Some(ref health) = self.health {
            health.start();
        }
        tracing::info!(
            "control_plane: started, health={}, strategy={}",
            self.health.is_some(),
            self.config.load_balancer.strategy
        );
    }

    /// Stop health checking first so no probe writes land after the
    /// registry's tasks are gone.
    pub async fn shutdown(&self) {
        if let Some(ref health) = self.health {
            health.stop().await;
        }
        self.registry.shutdown().await;
        tracing::info!("control_plane: stopped");
    }
}
