//! Key/value backends for the service registry.
//!
//! The registry only needs per-key expiry, atomic single-key get/set and a
//! prefix scan; anything offering those can sit behind [`KvStore`].

pub mod etcd;
pub mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use crate::config::{StoreBackend, StoreConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Write `value` and (re)arm the key's expiry to `ttl` in the same write.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// All live `(key, value)` pairs whose key starts with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>>;
}

/// Build the backend selected in config.
pub async fn build_store(cfg: &StoreConfig) -> anyhow::Result<Arc<dyn KvStore>> {
    match cfg.backend {
        StoreBackend::Memory => {
            tracing::info!("store: using in-memory backend");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Etcd => {
            let store = EtcdStore::connect(&cfg.etcd).await?;
            tracing::info!("store: connected to etcd at {}", store.base_url());
            Ok(Arc::new(store))
        }
    }
}
