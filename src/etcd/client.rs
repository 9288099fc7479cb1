use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EtcdConfig;

/// etcd v3.6+ encodes int64 fields as JSON strings, older versions as numbers.
fn int64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Num(i64),
        Str(String),
    }

    match Option::<Wire>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Wire::Num(n)) => Ok(Some(n)),
        Some(Wire::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Clone)]
struct Credentials {
    name: String,
    password: String,
}

/// etcd v3 client speaking the HTTP/JSON gateway: KV range/put/deleterange
/// and lease grant/revoke, which is all the registry store needs.
///
/// Auth tokens expire server side; a request rejected as unauthenticated
/// re-authenticates once and is retried. Cloning shares the token.
#[derive(Clone)]
pub struct EtcdClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
    token: Arc<ArcSwapOption<String>>,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: Option<String>,
}

#[derive(Serialize)]
pub struct RangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub range_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys_only: Option<bool>,
}

#[derive(Deserialize)]
pub struct RangeResponse {
    #[serde(default)]
    pub kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, deserialize_with = "int64")]
    pub lease: Option<i64>,
}

#[derive(Serialize)]
pub struct PutRequest {
    pub key: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<i64>,
}

#[derive(Serialize)]
pub struct DeleteRangeRequest {
    pub key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub range_end: String,
}

#[derive(Deserialize)]
struct DeleteRangeResponse {
    #[serde(default, deserialize_with = "int64")]
    deleted: Option<i64>,
}

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: u64,
}

#[derive(Deserialize)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "int64")]
    id: Option<i64>,
}

#[derive(Serialize)]
struct LeaseRevokeRequest {
    #[serde(rename = "ID")]
    id: i64,
}

pub fn b64_encode(s: &str) -> String {
    B64.encode(s.as_bytes())
}

pub fn b64_decode(s: &str) -> anyhow::Result<String> {
    Ok(String::from_utf8(B64.decode(s)?)?)
}

/// Base64 `range_end` covering every key that starts with `prefix`: the
/// prefix with its last non-0xff byte incremented.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return B64.encode(&end);
        }
    }
    // "\0" is etcd's "to the end of the keyspace".
    B64.encode([0u8])
}

/// An etcd error body that means the token is missing or stale.
fn is_auth_failure(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::UNAUTHORIZED
        || body.contains("invalid auth token")
        || body.contains("user name is empty")
}

impl EtcdClient {
    /// Connect to the first endpoint that answers, authenticating when
    /// credentials are configured.
    pub async fn connect(cfg: &EtcdConfig) -> anyhow::Result<Self> {
        if cfg.endpoints.is_empty() {
            anyhow::bail!("etcd: no endpoints configured");
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_secs))
            .connect_timeout(Duration::from_secs_f64(cfg.timeout_secs.min(5.0)))
            .build()?;
        let credentials = match (&cfg.username, &cfg.password) {
            (Some(name), Some(password)) => Some(Credentials {
                name: name.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        let mut last_error = None;
        for endpoint in &cfg.endpoints {
            let client = Self {
                http: http.clone(),
                base_url: endpoint.trim_end_matches('/').to_string(),
                credentials: credentials.clone(),
                token: Arc::new(ArcSwapOption::empty()),
            };
            match client.handshake().await {
                Ok(()) => return Ok(client),
                Err(e) => {
                    tracing::warn!("etcd: endpoint {} unusable, trying next: {:#}", client.base_url, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("etcd: all endpoints failed")))
    }

    /// Authenticate, or without credentials issue a keys-only range to check
    /// the endpoint is alive.
    async fn handshake(&self) -> anyhow::Result<()> {
        if self.credentials.is_some() {
            return self.authenticate().await;
        }
        self.range(&RangeRequest {
            key: b64_encode("\0"),
            range_end: String::new(),
            keys_only: Some(true),
        })
        .await
        .map(drop)
    }

    async fn authenticate(&self) -> anyhow::Result<()> {
        let Some(ref creds) = self.credentials else {
            return Ok(());
        };
        let resp = self
            .http
            .post(format!("{}/v3/auth/authenticate", self.base_url))
            .json(&AuthRequest {
                name: &creds.name,
                password: &creds.password,
            })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("etcd: authenticate as {} failed: {} - {}", creds.name, status, body);
        }
        let auth: AuthResponse = resp.json().await?;
        match auth.token {
            Some(token) => {
                self.token.store(Some(Arc::new(token)));
                tracing::debug!("etcd: authenticated as {}", creds.name);
                Ok(())
            }
            None => anyhow::bail!("etcd: authenticate as {} returned no token", creds.name),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send<B: Serialize>(&self, path: &str, body: &B) -> anyhow::Result<reqwest::Response> {
        let mut req = self.http.post(format!("{}{}", self.base_url, path)).json(body);
        if let Some(token) = self.token.load_full() {
            req = req.header("Authorization", token.as_str());
        }
        Ok(req.send().await?)
    }

    /// POST JSON and fail on a non-2xx answer. A rejected token is refreshed
    /// and the request retried once.
    async fn post_json<B: Serialize>(&self, op: &'static str, path: &str, body: &B) -> anyhow::Result<reqwest::Response> {
        let started = Instant::now();
        let mut resp = self.send(path, body).await?;
        if !resp.status().is_success() && self.credentials.is_some() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            if !is_auth_failure(status, &text) {
                anyhow::bail!("etcd {} failed: {} - {}", path, status, text);
            }
            tracing::info!("etcd: auth token rejected, re-authenticating");
            self.authenticate().await?;
            resp = self.send(path, body).await?;
        }
        metrics::histogram!("mesh_store_request_duration_seconds", "op" => op)
            .record(started.elapsed().as_secs_f64());

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("etcd {} failed: {} - {}", path, status, text);
        }
        Ok(resp)
    }

    pub async fn range(&self, req: &RangeRequest) -> anyhow::Result<RangeResponse> {
        Ok(self.post_json("range", "/v3/kv/range", req).await?.json().await?)
    }

    pub async fn put(&self, req: &PutRequest) -> anyhow::Result<()> {
        self.post_json("put", "/v3/kv/put", req).await.map(drop)
    }

    /// Returns the number of keys deleted.
    pub async fn delete_range(&self, req: &DeleteRangeRequest) -> anyhow::Result<i64> {
        let resp: DeleteRangeResponse = self
            .post_json("delete", "/v3/kv/deleterange", req)
            .await?
            .json()
            .await?;
        Ok(resp.deleted.unwrap_or(0))
    }

    pub async fn lease_grant(&self, ttl_secs: u64) -> anyhow::Result<i64> {
        let grant: LeaseGrantResponse = self
            .post_json("lease_grant", "/v3/lease/grant", &LeaseGrantRequest { ttl: ttl_secs })
            .await?
            .json()
            .await?;
        match grant.id {
            Some(id) if id != 0 => Ok(id),
            _ => anyhow::bail!("etcd: lease grant returned no id"),
        }
    }

    pub async fn lease_revoke(&self, lease_id: i64) -> anyhow::Result<()> {
        self.post_json("lease_revoke", "/v3/lease/revoke", &LeaseRevokeRequest { id: lease_id })
            .await
            .map(drop)
    }
}
