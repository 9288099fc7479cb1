use super::KvStore;
use crate::config::EtcdConfig;
use crate::etcd::client::{
    b64_decode, b64_encode, prefix_range_end, DeleteRangeRequest, PutRequest, RangeRequest,
};
use crate::etcd::EtcdClient;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

/// etcd-backed registry store.
///
/// etcd expiry is per lease, not per key, so every write grants a fresh lease
/// of `ceil(ttl)` seconds, binds the key to it and then revokes the lease the
/// key was bound to before. Leases granted by other processes are left to
/// expire on their own.
pub struct EtcdStore {
    client: EtcdClient,
    /// key -> lease currently bound to it by this process.
    leases: DashMap<String, i64>,
}

impl EtcdStore {
    pub async fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        Ok(Self::new(EtcdClient::connect(cfg).await?))
    }

    pub fn new(client: EtcdClient) -> Self {
        Self {
            client,
            leases: DashMap::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    async fn revoke_quietly(&self, key: &str, lease_id: i64) {
        if let Err(e) = self.client.lease_revoke(lease_id).await {
            tracing::debug!("store: etcd: revoke of superseded lease failed, key={}, lease={}, error={}", key, lease_id, e);
        }
    }
}

fn lease_ttl_secs(ttl: Duration) -> u64 {
    (ttl.as_secs_f64().ceil() as u64).max(1)
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let resp = self
            .client
            .range(&RangeRequest {
                key: b64_encode(key),
                range_end: String::new(),
                keys_only: None,
            })
            .await?;
        match resp.kvs.into_iter().next() {
            Some(kv) => Ok(Some(b64_decode(&kv.value)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let lease_id = self.client.lease_grant(lease_ttl_secs(ttl)).await?;
        if let Err(e) = self
            .client
            .put(&PutRequest {
                key: b64_encode(key),
                value: b64_encode(value),
                lease: Some(lease_id),
            })
            .await
        {
            self.revoke_quietly(key, lease_id).await;
            return Err(e);
        }

        if let Some(previous) = self.leases.insert(key.to_string(), lease_id) {
            if previous != lease_id {
                self.revoke_quietly(key, previous).await;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let deleted = self
            .client
            .delete_range(&DeleteRangeRequest {
                key: b64_encode(key),
                range_end: String::new(),
            })
            .await?;
        if let Some((_, lease_id)) = self.leases.remove(key) {
            self.revoke_quietly(key, lease_id).await;
        }
        Ok(deleted > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, String)>> {
        let resp = self
            .client
            .range(&RangeRequest {
                key: b64_encode(prefix),
                range_end: prefix_range_end(prefix),
                keys_only: None,
            })
            .await?;

        let mut out = Vec::with_capacity(resp.kvs.len());
        for kv in resp.kvs {
            let key = match b64_decode(&kv.key) {
                Ok(k) => k,
                Err(e) => {
                    tracing::warn!("store: etcd: skipping undecodable key: {}", e);
                    continue;
                }
            };
            match b64_decode(&kv.value) {
                Ok(v) => out.push((key, v)),
                Err(e) => tracing::warn!("store: etcd: skipping undecodable value, key={}, error={}", key, e),
            }
        }
        Ok(out)
    }
}
