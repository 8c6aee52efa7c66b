//! In-memory secret backend
//!
//! Deterministic backend with Vault KV semantics (versions, check-and-set)
//! for tests and local dry runs.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{AppRoleSpec, Policy, PolicyAdmin, SecretBackend, SecretRecord};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, SecretRecord>>,
    policies: Mutex<BTreeMap<String, String>>,
    roles: Mutex<BTreeMap<String, (AppRoleSpec, String)>>,
    mount_created: AtomicBool,
    unavailable: AtomicBool,
    conflict_next_write: AtomicBool,
    writes: AtomicUsize,
    secret_ids_minted: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a sealed or unreachable store
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next write fail as if a concurrent writer got there first
    pub fn fail_next_write_with_conflict(&self) {
        self.conflict_next_write.store(true, Ordering::SeqCst);
    }

    /// Delete the latest version's data but keep the version counter
    pub fn soft_delete(&self, path: &str) {
        if let Some(record) = self.lock_records().get_mut(path) {
            record.fields.clear();
        }
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn secret_ids_minted(&self) -> usize {
        self.secret_ids_minted.load(Ordering::SeqCst)
    }

    pub fn policy(&self, name: &str) -> Option<String> {
        self.lock_policies().get(name).cloned()
    }

    pub fn role(&self, name: &str) -> Option<AppRoleSpec> {
        self.lock_roles().get(name).map(|(spec, _)| spec.clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory backend marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<String, SecretRecord>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_policies(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.policies.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_roles(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, (AppRoleSpec, String)>> {
        self.roles.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(36)
        .map(char::from)
        .collect()
}

#[async_trait]
impl SecretBackend for MemoryBackend {
    async fn health(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn read(&self, path: &str) -> Result<Option<SecretRecord>, StoreError> {
        self.check_available()?;
        Ok(self.lock_records().get(path).cloned())
    }

    async fn write(
        &self,
        path: &str,
        fields: &BTreeMap<String, String>,
        cas: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.check_available()?;

        if self.conflict_next_write.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Conflict(path.to_string()));
        }

        let mut records = self.lock_records();
        let current = records.get(path).map(|r| r.version).unwrap_or(0);
        if let Some(expected) = cas {
            if expected != current {
                return Err(StoreError::Conflict(path.to_string()));
            }
        }

        let version = current + 1;
        records.insert(
            path.to_string(),
            SecretRecord {
                fields: fields.clone(),
                version,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }
}

#[async_trait]
impl PolicyAdmin for MemoryBackend {
    async fn ensure_kv_mount(&self) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(!self.mount_created.swap(true, Ordering::SeqCst))
    }

    async fn put_policy(&self, policy: &Policy) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock_policies()
            .insert(policy.name.clone(), policy.to_hcl());
        Ok(())
    }

    async fn ensure_approle(&self, spec: &AppRoleSpec) -> Result<String, StoreError> {
        self.check_available()?;
        let mut roles = self.lock_roles();
        let role_id = roles
            .get(&spec.name)
            .map(|(_, id)| id.clone())
            .unwrap_or_else(random_id);
        roles.insert(spec.name.clone(), (spec.clone(), role_id.clone()));
        Ok(role_id)
    }

    async fn mint_secret_id(&self, role: &str) -> Result<String, StoreError> {
        self.check_available()?;
        if !self.lock_roles().contains_key(role) {
            return Err(StoreError::Rejected {
                status: 404,
                message: format!("role {} not found", role),
            });
        }
        self.secret_ids_minted.fetch_add(1, Ordering::SeqCst);
        Ok(random_id())
    }
}
