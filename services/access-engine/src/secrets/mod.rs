//! Secret Store Access
//!
//! Typed access to a versioned key-value secret store (Vault KV v2 or an
//! in-memory backend for tests and local runs).
//!
//! ## Paths
//!
//! - `platforms/<name>/admin` - admin bootstrap credential (`username`, `password`)
//! - `service-accounts/identity` - the shared service identity (`username`, `email`, `password`)
//! - `service-accounts/<name>` - per-platform credential (`username`, `token`, `platform_id`)
//! - `auth/approle/<role>` - machine-auth identity (`role_id`, `secret_id`)

pub mod memory;
pub mod policy;
pub mod store;
pub mod vault;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::BTreeMap;

use crate::error::StoreError;

pub use memory::MemoryBackend;
pub use policy::{AppRoleSpec, Capability, PathRule, Policy};
pub use store::{PutOutcome, SecretStore};
pub use vault::VaultClient;

pub const IDENTITY_PATH: &str = "service-accounts/identity";

/// Admin credential path for a platform
pub fn admin_path(platform: &str) -> String {
    format!("platforms/{}/admin", platform)
}

/// Service identity credential path for a platform
pub fn token_path(platform: &str) -> String {
    format!("service-accounts/{}", platform)
}

/// Machine-auth identity path for an AppRole role
pub fn approle_path(role: &str) -> String {
    format!("auth/approle/{}", role)
}

/// Random alphanumeric secret for generated passwords
pub fn generate_secret(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Latest version of a record
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretRecord {
    pub fields: BTreeMap<String, String>,
    pub version: u64,
}

impl SecretRecord {
    /// Field value, treating empty strings as absent
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

impl std::fmt::Debug for SecretRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretRecord")
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("version", &self.version)
            .finish()
    }
}

/// Storage backend for path-addressed, versioned records
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Succeeds only when the store can serve reads and writes
    async fn health(&self) -> Result<(), StoreError>;

    /// Latest version at `path`, or `None` when nothing was ever written.
    ///
    /// A deleted latest version comes back with no fields and its version
    /// number, so a later check-and-set write can still target it.
    async fn read(&self, path: &str) -> Result<Option<SecretRecord>, StoreError>;

    /// Upsert the whole field map at `path` and return the new version.
    ///
    /// With `cas = Some(v)` the write only succeeds when the current version
    /// is `v` (`0` meaning "does not exist"), otherwise `StoreError::Conflict`.
    async fn write(
        &self,
        path: &str,
        fields: &BTreeMap<String, String>,
        cas: Option<u64>,
    ) -> Result<u64, StoreError>;
}

/// The store's own access-control surface, used by the bootstrap seeder
#[async_trait]
pub trait PolicyAdmin: Send + Sync {
    /// Make sure the KV mount exists; true when it had to be created
    async fn ensure_kv_mount(&self) -> Result<bool, StoreError>;

    async fn put_policy(&self, policy: &Policy) -> Result<(), StoreError>;

    /// Create or update the role and return its role id
    async fn ensure_approle(&self, spec: &AppRoleSpec) -> Result<String, StoreError>;

    /// Mint a new secret id for the role
    async fn mint_secret_id(&self, role: &str) -> Result<String, StoreError>;
}
