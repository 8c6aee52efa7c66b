//! Vault client and seeder against a mock Vault HTTP API

mod common;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use lornu_access::secrets::{self, PutOutcome, SecretBackend, SecretStore, IDENTITY_PATH};
use lornu_access::{AccessConfig, ReconcileError, Seeder, StoreError, VaultClient};

use common::*;

const ROOT_TOKEN: &str = "root";

#[derive(Default)]
struct Vault {
    sealed: bool,
    kv: BTreeMap<String, (Value, u64)>,
    mounts: BTreeSet<String>,
    policies: BTreeMap<String, String>,
    approle_enabled: bool,
    roles: BTreeMap<String, Value>,
    secret_ids: Vec<String>,
    client_tokens: Vec<String>,
}

type Shared = Arc<Mutex<Vault>>;
type Reply = (StatusCode, Json<Value>);

fn reply(status: StatusCode, body: Value) -> Reply {
    (status, Json(body))
}

fn authorized(vault: &Vault, headers: &HeaderMap) -> bool {
    match headers.get("x-vault-token").and_then(|v| v.to_str().ok()) {
        Some(token) => token == ROOT_TOKEN || vault.client_tokens.iter().any(|t| t == token),
        None => false,
    }
}

fn denied() -> Reply {
    reply(StatusCode::FORBIDDEN, json!({ "errors": ["permission denied"] }))
}

async fn health(State(vault): State<Shared>) -> Reply {
    if vault.lock().unwrap().sealed {
        reply(StatusCode::SERVICE_UNAVAILABLE, json!({ "sealed": true }))
    } else {
        reply(StatusCode::OK, json!({ "initialized": true, "sealed": false }))
    }
}

async fn kv_read(State(vault): State<Shared>, Path(path): Path<String>, headers: HeaderMap) -> Reply {
    let vault = vault.lock().unwrap();
    if !authorized(&vault, &headers) {
        return denied();
    }
    match vault.kv.get(&path) {
        Some((Value::Null, version)) => reply(
            StatusCode::NOT_FOUND,
            json!({ "data": { "data": null, "metadata": {
                "version": version,
                "deletion_time": "2026-10-01T00:00:00Z",
                "destroyed": false,
            } } }),
        ),
        Some((data, version)) => reply(
            StatusCode::OK,
            json!({ "data": { "data": data, "metadata": { "version": version } } }),
        ),
        None => reply(StatusCode::NOT_FOUND, json!({ "errors": [] })),
    }
}

async fn kv_delete(State(vault): State<Shared>, Path(path): Path<String>, headers: HeaderMap) -> StatusCode {
    let mut vault = vault.lock().unwrap();
    if !authorized(&vault, &headers) {
        return StatusCode::FORBIDDEN;
    }
    if let Some(entry) = vault.kv.get_mut(&path) {
        entry.0 = Value::Null;
    }
    StatusCode::NO_CONTENT
}

async fn kv_write(
    State(vault): State<Shared>,
    Path(path): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Reply {
    let mut vault = vault.lock().unwrap();
    if !authorized(&vault, &headers) {
        return denied();
    }
    let current = vault.kv.get(&path).map(|(_, v)| *v).unwrap_or(0);
    if let Some(cas) = body["options"]["cas"].as_u64() {
        if cas != current {
            return reply(
                StatusCode::BAD_REQUEST,
                json!({ "errors": ["check-and-set parameter did not match the current version"] }),
            );
        }
    }
    let version = current + 1;
    vault.kv.insert(path, (body["data"].clone(), version));
    reply(StatusCode::OK, json!({ "data": { "version": version } }))
}

async fn list_mounts(State(vault): State<Shared>) -> Reply {
    let mounts: serde_json::Map<String, Value> = vault
        .lock()
        .unwrap()
        .mounts
        .iter()
        .map(|m| (format!("{}/", m), json!({ "type": "kv" })))
        .collect();
    reply(StatusCode::OK, Value::Object(mounts))
}

async fn enable_mount(State(vault): State<Shared>, Path(mount): Path<String>) -> StatusCode {
    vault.lock().unwrap().mounts.insert(mount);
    StatusCode::NO_CONTENT
}

async fn write_policy(
    State(vault): State<Shared>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    let policy = body["policy"].as_str().unwrap_or_default().to_string();
    vault.lock().unwrap().policies.insert(name, policy);
    StatusCode::NO_CONTENT
}

async fn list_auth(State(vault): State<Shared>) -> Reply {
    if vault.lock().unwrap().approle_enabled {
        reply(StatusCode::OK, json!({ "approle/": { "type": "approle" } }))
    } else {
        reply(StatusCode::OK, json!({ "token/": { "type": "token" } }))
    }
}

async fn enable_approle(State(vault): State<Shared>) -> StatusCode {
    vault.lock().unwrap().approle_enabled = true;
    StatusCode::NO_CONTENT
}

async fn write_role(
    State(vault): State<Shared>,
    Path(role): Path<String>,
    Json(body): Json<Value>,
) -> StatusCode {
    vault.lock().unwrap().roles.insert(role, body);
    StatusCode::NO_CONTENT
}

async fn role_id(State(vault): State<Shared>, Path(role): Path<String>) -> Reply {
    if vault.lock().unwrap().roles.contains_key(&role) {
        reply(StatusCode::OK, json!({ "data": { "role_id": format!("role-{}", role) } }))
    } else {
        reply(StatusCode::NOT_FOUND, json!({ "errors": [] }))
    }
}

async fn secret_id(State(vault): State<Shared>, Path(_role): Path<String>) -> Reply {
    let mut vault = vault.lock().unwrap();
    let id = format!("secret-id-{}", vault.secret_ids.len() + 1);
    vault.secret_ids.push(id.clone());
    reply(StatusCode::OK, json!({ "data": { "secret_id": id, "secret_id_ttl": 0 } }))
}

async fn login(State(vault): State<Shared>, Json(body): Json<Value>) -> Reply {
    let mut vault = vault.lock().unwrap();
    let role_ok = body["role_id"]
        .as_str()
        .and_then(|id| id.strip_prefix("role-"))
        .map(|role| vault.roles.contains_key(role))
        .unwrap_or(false);
    let secret_ok = body["secret_id"]
        .as_str()
        .map(|id| vault.secret_ids.iter().any(|s| s == id))
        .unwrap_or(false);
    if !(role_ok && secret_ok) {
        return reply(StatusCode::BAD_REQUEST, json!({ "errors": ["invalid role or secret ID"] }));
    }
    let token = format!("approle-token-{}", vault.client_tokens.len() + 1);
    vault.client_tokens.push(token.clone());
    reply(
        StatusCode::OK,
        json!({ "auth": { "client_token": token, "lease_duration": 86400, "renewable": true } }),
    )
}

async fn mock_vault(vault: Shared) -> String {
    let router = Router::new()
        .route("/v1/sys/health", get(health))
        .route("/v1/secret/data/*path", get(kv_read).post(kv_write).delete(kv_delete))
        .route("/v1/sys/mounts", get(list_mounts))
        .route("/v1/sys/mounts/:mount", post(enable_mount))
        .route("/v1/sys/policies/acl/:name", put(write_policy))
        .route("/v1/sys/auth", get(list_auth))
        .route("/v1/sys/auth/approle", post(enable_approle))
        .route("/v1/auth/approle/role/:role", post(write_role))
        .route("/v1/auth/approle/role/:role/role-id", get(role_id))
        .route("/v1/auth/approle/role/:role/secret-id", post(secret_id))
        .route("/v1/auth/approle/login", post(login))
        .with_state(vault);
    serve(router).await
}

fn client(base: &str) -> VaultClient {
    VaultClient::new(reqwest::Client::new(), base, "secret", ROOT_TOKEN)
}

#[tokio::test]
async fn test_kv_writes_never_replace_present_values() {
    let vault: Shared = Arc::default();
    let base = mock_vault(vault.clone()).await;
    let store = SecretStore::new(Arc::new(client(&base)));

    let path = secrets::token_path("nexus");
    store
        .put_if_absent(&path, &fields(&[("username", "svc"), ("token", "first")]))
        .await
        .unwrap();
    store
        .put_if_absent(&path, &fields(&[("token", "second"), ("platform_id", "svc")]))
        .await
        .unwrap();

    let record = store.read(&path).await.unwrap().unwrap();
    assert_eq!(record.field("token"), Some("first"));
    assert_eq!(record.field("platform_id"), Some("svc"));
    assert_eq!(record.version, 2);
    assert!(store.read("missing/path").await.unwrap().is_none());
}

async fn soft_delete(base: &str, path: &str) {
    let response = reqwest::Client::new()
        .delete(format!("{}/v1/secret/data/{}", base, path))
        .header("X-Vault-Token", ROOT_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_deleted_records_are_refilled() {
    let vault: Shared = Arc::default();
    let base = mock_vault(vault.clone()).await;
    let store = SecretStore::new(Arc::new(client(&base)));

    let admin = secrets::admin_path("gitea");
    store.put(&admin, &fields(&[("username", "admin"), ("password", "old")])).await.unwrap();
    store.put(&admin, &fields(&[("username", "admin"), ("password", "older")])).await.unwrap();
    for _ in 0..3 {
        store.put(IDENTITY_PATH, &fields(&[("password", "old")])).await.unwrap();
    }
    soft_delete(&base, &admin).await;
    soft_delete(&base, IDENTITY_PATH).await;

    let deleted = store.read(&admin).await.unwrap().unwrap();
    assert_eq!(deleted.version, 2);
    assert_eq!(deleted.field("password"), None);

    let outcome = store
        .put_if_absent(&admin, &fields(&[("username", "admin"), ("password", "fresh")]))
        .await
        .unwrap();
    assert_eq!(outcome, PutOutcome::Written);
    assert_eq!(store.get(&admin, "password").await.unwrap().as_deref(), Some("fresh"));

    let (password, outcome) = store
        .ensure_generated(IDENTITY_PATH, "password", &BTreeMap::new(), || "regenerated".to_string())
        .await
        .unwrap();
    assert_eq!((password.as_str(), outcome), ("regenerated", PutOutcome::Written));

    let state = vault.lock().unwrap();
    assert_eq!(state.kv[&admin].1, 3);
    assert_eq!(state.kv[IDENTITY_PATH].1, 4);
}

#[tokio::test]
async fn test_stale_cas_write_is_a_conflict() {
    let vault: Shared = Arc::default();
    let base = mock_vault(vault.clone()).await;
    let backend = client(&base);

    let path = "service-accounts/sonar";
    assert_eq!(backend.write(path, &fields(&[("token", "a")]), Some(0)).await.unwrap(), 1);

    let err = backend
        .write(path, &fields(&[("token", "b")]), Some(0))
        .await
        .unwrap_err();
    assert_eq!(err, StoreError::Conflict(path.to_string()));
    assert_eq!(backend.read(path).await.unwrap().unwrap().field("token"), Some("a"));
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let vault: Shared = Arc::default();
    let base = mock_vault(vault).await;
    let backend = VaultClient::new(reqwest::Client::new(), &base, "secret", "wrong");

    let err = backend.read("platforms/gitea/admin").await.unwrap_err();
    assert!(matches!(err, StoreError::Rejected { status: 403, .. }));
}

#[tokio::test]
async fn test_sealed_store_aborts_reconciliation() {
    let vault: Shared = Arc::default();
    vault.lock().unwrap().sealed = true;
    let base = mock_vault(vault).await;
    let store = Arc::new(SecretStore::new(Arc::new(client(&base))));

    assert!(matches!(store.health().await, Err(StoreError::Unavailable(_))));
    let err = reconciler(store).run(Vec::new()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::StoreUnavailable(_)));
}

#[tokio::test]
async fn test_seeding_is_repeatable_and_approle_login_works() {
    let vault: Shared = Arc::default();
    let base = mock_vault(vault.clone()).await;
    let config = AccessConfig::from_toml_str(&format!(
        r#"
        [secret_store]
        address = "{base}"
        token = "root"

        [[platforms]]
        kind = "gitea"
        name = "gitea"
        base_url = "http://gitea:3000"
        organization = "platform"
        default_admin_password = "gitea-admin-password"

        [[platforms]]
        kind = "nexus"
        name = "nexus"
        base_url = "http://nexus:8081"
        "#
    ))
    .unwrap();

    let backend = Arc::new(client(&base));
    let store = Arc::new(SecretStore::new(backend.clone()));
    let seeder = Seeder::new(store.clone(), backend.clone());

    let first = seeder.seed(&config).await.unwrap();
    assert!(first.mount_created);
    assert_eq!(first.policies, vec!["read-only", "read-write", "admin"]);
    assert_eq!(first.written.len(), 4);
    assert!(first.written.contains(&IDENTITY_PATH.to_string()));
    assert!(first.preserved.is_empty());

    let second = seeder.seed(&config).await.unwrap();
    assert!(!second.mount_created);
    assert!(second.written.is_empty());
    assert_eq!(second.preserved.len(), 4);

    let approle = store
        .read(&secrets::approle_path("reconciler"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(approle.field("role_id"), Some("role-reconciler"));
    assert_eq!(approle.field("secret_id"), Some("secret-id-1"));
    assert_eq!(
        store.get("platforms/gitea/admin", "password").await.unwrap().as_deref(),
        Some("gitea-admin-password")
    );

    {
        let state = vault.lock().unwrap();
        assert_eq!(state.secret_ids.len(), 1);
        let role = &state.roles["reconciler"];
        assert_eq!(role["token_policies"], json!(["read-write"]));
        assert_eq!(role["token_ttl"], "24h");
        assert_eq!(role["token_max_ttl"], "48h");
        assert_eq!(role["secret_id_num_uses"], 0);
        assert!(state.policies["admin"].contains("\"sudo\""));
    }

    let role_id = approle.field("role_id").unwrap();
    let secret_id = approle.field("secret_id").unwrap();
    let session =
        VaultClient::login_approle(reqwest::Client::new(), &base, "secret", role_id, secret_id)
            .await
            .unwrap();
    let identity = session.read(IDENTITY_PATH).await.unwrap().unwrap();
    assert_eq!(identity.field("username"), Some("svc-automation"));
    assert_eq!(identity.field("password").map(str::len), Some(32));
}
