//! Vault KV v2 backend
//!
//! Talks to the Vault HTTP API with `reqwest`: KV reads and check-and-set
//! writes, ACL policies, and AppRole machine authentication.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{AppRoleSpec, Policy, PolicyAdmin, SecretBackend, SecretRecord};
use crate::error::StoreError;

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Vault API client bound to one KV v2 mount
#[derive(Clone)]
pub struct VaultClient {
    http: Client,
    address: String,
    mount: String,
    token: String,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("address", &self.address)
            .field("mount", &self.mount)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Debug, Deserialize)]
struct KvReadData {
    data: Option<BTreeMap<String, Value>>,
    metadata: Option<KvMetadata>,
}

#[derive(Debug, Deserialize)]
struct KvMetadata {
    version: u64,
}

#[derive(Debug, Deserialize)]
struct KvWriteResponse {
    data: KvMetadata,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    auth: LoginAuth,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
    lease_duration: u64,
    #[serde(default)]
    renewable: bool,
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RoleIdData {
    role_id: String,
}

#[derive(Debug, Deserialize)]
struct SecretIdData {
    secret_id: String,
}

/// Health endpoint statuses that mean the store can serve requests
fn health_status_is_serving(status: StatusCode) -> bool {
    // 429 standby, 472 DR secondary, 473 performance standby
    matches!(status.as_u16(), 200 | 429 | 472 | 473)
}

fn field_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Version of a deleted record from a KV v2 404 body; `None` when the path
/// never held a version
fn deleted_version(body: &str) -> Option<u64> {
    serde_json::from_str::<KvReadResponse>(body)
        .ok()
        .and_then(|b| b.data.metadata)
        .map(|m| m.version)
        .filter(|v| *v > 0)
}

async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::NOT_IMPLEMENTED => {
            Err(StoreError::Unavailable(format!("{}: {}", status, body)))
        }
        _ => Err(StoreError::Rejected {
            status: status.as_u16(),
            message: body,
        }),
    }
}

impl VaultClient {
    /// Create a client authenticated with a static token
    pub fn new(http: Client, address: &str, mount: &str, token: impl Into<String>) -> Self {
        Self {
            http,
            address: address.trim_end_matches('/').to_string(),
            mount: mount.trim_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Authenticate with an AppRole (role_id, secret_id) pair
    pub async fn login_approle(
        http: Client,
        address: &str,
        mount: &str,
        role_id: &str,
        secret_id: &str,
    ) -> Result<Self, StoreError> {
        let url = format!("{}/v1/auth/approle/login", address.trim_end_matches('/'));
        let response = http
            .post(&url)
            .json(&json!({ "role_id": role_id, "secret_id": secret_id }))
            .send()
            .await?;

        let login: LoginResponse = check(response).await?.json().await?;
        info!(
            lease_seconds = login.auth.lease_duration,
            renewable = login.auth.renewable,
            "Authenticated to secret store via AppRole"
        );

        Ok(Self::new(http, address, mount, login.auth.client_token))
    }

    pub fn mount(&self) -> &str {
        &self.mount
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path.trim_start_matches('/'))
    }

    fn data_url(&self, path: &str) -> String {
        self.url(&format!("{}/data/{}", self.mount, path.trim_start_matches('/')))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StoreError> {
        let response = self
            .http
            .get(self.url(path))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn post_json(&self, path: &str, body: &Value) -> Result<Response, StoreError> {
        let response = self
            .http
            .post(self.url(path))
            .header(TOKEN_HEADER, &self.token)
            .json(body)
            .send()
            .await?;
        check(response).await
    }
}

#[async_trait]
impl SecretBackend for VaultClient {
    async fn health(&self) -> Result<(), StoreError> {
        let response = self.http.get(self.url("sys/health")).send().await?;
        let status = response.status();
        if health_status_is_serving(status) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "health endpoint returned {}",
                status
            )))
        }
    }

    async fn read(&self, path: &str) -> Result<Option<SecretRecord>, StoreError> {
        let response = self
            .http
            .get(self.data_url(path))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            // a deleted or destroyed latest version still reports its metadata
            let text = response.text().await.unwrap_or_default();
            let tombstone = deleted_version(&text).map(|version| SecretRecord {
                fields: BTreeMap::new(),
                version,
            });
            debug!(path = %path, version = ?tombstone.as_ref().map(|r| r.version), "Secret not found");
            return Ok(tombstone);
        }

        let body: KvReadResponse = check(response).await?.json().await?;
        let version = body.data.metadata.map(|m| m.version).unwrap_or(0);

        Ok(Some(SecretRecord {
            fields: body
                .data
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, field_to_string(v)))
                .collect(),
            version,
        }))
    }

    async fn write(
        &self,
        path: &str,
        fields: &BTreeMap<String, String>,
        cas: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut body = json!({ "data": fields });
        if let Some(version) = cas {
            body["options"] = json!({ "cas": version });
        }

        let response = self
            .http
            .post(self.data_url(path))
            .header(TOKEN_HEADER, &self.token)
            .json(&body)
            .send()
            .await?;

        if response.status() == StatusCode::BAD_REQUEST {
            let text = response.text().await.unwrap_or_default();
            if text.contains("check-and-set") {
                return Err(StoreError::Conflict(path.to_string()));
            }
            return Err(StoreError::Rejected {
                status: 400,
                message: text,
            });
        }

        let written: KvWriteResponse = check(response).await?.json().await?;
        Ok(written.data.version)
    }
}

#[async_trait]
impl PolicyAdmin for VaultClient {
    async fn ensure_kv_mount(&self) -> Result<bool, StoreError> {
        let mounts: Value = self.get_json("sys/mounts").await?;
        let key = format!("{}/", self.mount);
        // newer servers nest the table under "data"
        let present = mounts.get(&key).is_some()
            || mounts.get("data").and_then(|d| d.get(&key)).is_some();
        if present {
            return Ok(false);
        }

        self.post_json(
            &format!("sys/mounts/{}", self.mount),
            &json!({ "type": "kv", "options": { "version": "2" } }),
        )
        .await?;
        info!(mount = %self.mount, "Enabled KV v2 secrets engine");
        Ok(true)
    }

    async fn put_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        let response = self
            .http
            .put(self.url(&format!("sys/policies/acl/{}", policy.name)))
            .header(TOKEN_HEADER, &self.token)
            .json(&json!({ "policy": policy.to_hcl() }))
            .send()
            .await?;
        check(response).await?;
        debug!(policy = %policy.name, "Policy written");
        Ok(())
    }

    async fn ensure_approle(&self, spec: &AppRoleSpec) -> Result<String, StoreError> {
        let methods: Value = self.get_json("sys/auth").await?;
        let enabled = methods.get("approle/").is_some()
            || methods.get("data").and_then(|d| d.get("approle/")).is_some();
        if !enabled {
            self.post_json("sys/auth/approle", &json!({ "type": "approle" }))
                .await?;
            info!("Enabled AppRole auth method");
        }

        self.post_json(
            &format!("auth/approle/role/{}", spec.name),
            &json!({
                "token_policies": spec.token_policies,
                "token_ttl": spec.token_ttl,
                "token_max_ttl": spec.token_max_ttl,
                "secret_id_num_uses": spec.secret_id_num_uses,
            }),
        )
        .await?;

        let role: DataEnvelope<RoleIdData> = self
            .get_json(&format!("auth/approle/role/{}/role-id", spec.name))
            .await?;
        Ok(role.data.role_id)
    }

    async fn mint_secret_id(&self, role: &str) -> Result<String, StoreError> {
        let response = self
            .post_json(&format!("auth/approle/role/{}/secret-id", role), &json!({}))
            .await?;
        let secret: DataEnvelope<SecretIdData> = response.json().await?;
        Ok(secret.data.secret_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_statuses() {
        assert!(health_status_is_serving(StatusCode::OK));
        assert!(health_status_is_serving(StatusCode::TOO_MANY_REQUESTS));
        assert!(!health_status_is_serving(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!health_status_is_serving(StatusCode::NOT_IMPLEMENTED));
    }

    #[test]
    fn test_data_url_uses_kv_v2_layout() {
        let client = VaultClient::new(Client::new(), "http://vault:8200/", "/secret/", "t");
        assert_eq!(
            client.data_url("/service-accounts/gitea"),
            "http://vault:8200/v1/secret/data/service-accounts/gitea"
        );
        assert!(!format!("{:?}", client).contains("\"t\""));
    }

    #[test]
    fn test_deleted_version_is_read_from_not_found_body() {
        let deleted = r#"{"data":{"data":null,"metadata":{"version":3,"deletion_time":"2026-10-01T00:00:00Z","destroyed":false}}}"#;
        assert_eq!(deleted_version(deleted), Some(3));
        assert_eq!(deleted_version(r#"{"errors":[]}"#), None);
        assert_eq!(deleted_version(""), None);
    }

    #[test]
    fn test_non_string_fields_are_stringified() {
        assert_eq!(field_to_string(json!("abc")), "abc");
        assert_eq!(field_to_string(json!(42)), "42");
        assert_eq!(field_to_string(Value::Null), "");
    }
}
