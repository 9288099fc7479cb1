//! Registry key layout: `<prefix>:<tenant|"global">:<service>:<instance>`.
//!
//! Scoping by tenant first lets one prefix scan return exactly one tenant's
//! records, which is what keeps tenant isolation cheap.

pub const GLOBAL_SCOPE: &str = "global";

pub fn scope(tenant_id: Option<&str>) -> &str {
    tenant_id.unwrap_or(GLOBAL_SCOPE)
}

pub fn instance_key(prefix: &str, tenant_id: Option<&str>, service: &str, instance_id: &str) -> String {
    format!("{}:{}:{}:{}", prefix, scope(tenant_id), service, instance_id)
}

/// Prefix matching every record of one tenant scope.
pub fn tenant_prefix(prefix: &str, tenant_id: Option<&str>) -> String {
    format!("{}:{}:", prefix, scope(tenant_id))
}

/// Prefix matching every instance of one service within a tenant scope.
pub fn service_prefix(prefix: &str, tenant_id: Option<&str>, service: &str) -> String {
    format!("{}:{}:{}:", prefix, scope(tenant_id), service)
}

/// Prefix matching every record of every tenant.
pub fn all_prefix(prefix: &str) -> String {
    format!("{}:", prefix)
}

/// Split a key back into `(tenant scope, service, instance)`. The instance id
/// is everything after the third separator, so ids may contain `:`.
pub fn parse(prefix: &str, key: &str) -> Option<(String, String, String)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix(':')?;
    let mut parts = rest.splitn(3, ':');
    let scope = parts.next()?;
    let service = parts.next()?;
    let instance = parts.next()?;
    if scope.is_empty() || service.is_empty() || instance.is_empty() {
        return None;
    }
    Some((scope.to_string(), service.to_string(), instance.to_string()))
}
