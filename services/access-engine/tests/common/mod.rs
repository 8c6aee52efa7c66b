#![allow(dead_code)]

use axum::{http::StatusCode, routing::get, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lornu_access::config::{IdentityConfig, ReadinessConfig};
use lornu_access::reconciler::build_http_client;
use lornu_access::secrets::{self, MemoryBackend, SecretStore};
use lornu_access::{ReadinessProber, Reconciler};

/// Serve `router` on an ephemeral port and return its base URL
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Base URL of a healthy `/health` endpoint
pub async fn health_server() -> String {
    serve(Router::new().route("/health", get(|| async { StatusCode::OK }))).await
}

/// Base URL nothing listens on
pub async fn closed_port() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn memory_store() -> (Arc<MemoryBackend>, Arc<SecretStore>) {
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(SecretStore::new(backend.clone()));
    (backend, store)
}

pub async fn seed_admin(store: &SecretStore, platform: &str) {
    store
        .put(
            &secrets::admin_path(platform),
            &fields(&[("username", "admin"), ("password", "admin-password")]),
        )
        .await
        .unwrap();
}

/// Reconciler with a short readiness budget and the production HTTP client
pub fn reconciler(store: Arc<SecretStore>) -> Reconciler {
    let http = build_http_client(Duration::from_secs(5)).unwrap();
    let prober = ReadinessProber::new(http.clone(), &ReadinessConfig::default())
        .with_timing(Duration::from_millis(200), Duration::from_millis(50));
    Reconciler::new(store, http, prober, IdentityConfig::default())
}
