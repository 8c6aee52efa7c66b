//! Secret store client with idempotent-by-presence writes
//!
//! Generated secrets are only written where no non-empty value exists yet.
//! The get-then-put sequence for one path runs under a per-path lock, and
//! creates use the backend's check-and-set so concurrent writers outside this
//! process cannot both win.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use super::{SecretBackend, SecretRecord};
use crate::error::StoreError;

/// Whether a conditional write changed the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    Preserved,
}

pub struct SecretStore {
    backend: Arc<dyn SecretBackend>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SecretStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn health(&self) -> Result<(), StoreError> {
        self.backend.health().await
    }

    /// Acquire the critical section for `path`
    pub async fn lock(&self, path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn read(&self, path: &str) -> Result<Option<SecretRecord>, StoreError> {
        self.backend.read(path).await
    }

    /// Non-empty value of one field
    pub async fn get(&self, path: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .read(path)
            .await?
            .and_then(|record| record.field(field).map(str::to_string)))
    }

    /// Unconditional whole-record upsert
    pub async fn put(
        &self,
        path: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<u64, StoreError> {
        let version = self.backend.write(path, fields, None).await?;
        debug!(path = %path, version, "Secret record written");
        Ok(version)
    }

    /// Upsert guarded by the record version observed earlier (`0` = absent)
    pub async fn put_versioned(
        &self,
        path: &str,
        fields: &BTreeMap<String, String>,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.backend
            .write(path, fields, Some(expected_version))
            .await
    }

    /// Fill in fields that are missing or empty at `path`, never replacing a
    /// non-empty value.
    pub async fn put_if_absent(
        &self,
        path: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<PutOutcome, StoreError> {
        let _guard = self.lock(path).await;
        self.merge_missing(path, fields).await
    }

    /// Return the value of `field` at `path`, generating and persisting it
    /// (alongside `extra`) when absent.
    pub async fn ensure_generated<F>(
        &self,
        path: &str,
        field: &str,
        extra: &BTreeMap<String, String>,
        generate: F,
    ) -> Result<(String, PutOutcome), StoreError>
    where
        F: FnOnce() -> String,
    {
        let _guard = self.lock(path).await;

        if let Some(existing) = self.get(path, field).await? {
            // still fill in descriptive fields that may be missing
            self.merge_missing(path, extra).await?;
            return Ok((existing, PutOutcome::Preserved));
        }

        let value = generate();
        let mut fields = extra.clone();
        fields.insert(field.to_string(), value.clone());

        match self.merge_missing(path, &fields).await? {
            PutOutcome::Written => {
                info!(path = %path, field = %field, "Generated secret stored");
                Ok((value, PutOutcome::Written))
            }
            PutOutcome::Preserved => {
                let stored = self.get(path, field).await?.ok_or_else(|| {
                    StoreError::Decode(format!("{} vanished from {}", field, path))
                })?;
                Ok((stored, PutOutcome::Preserved))
            }
        }
    }

    async fn merge_missing(
        &self,
        path: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<PutOutcome, StoreError> {
        let existing = self.read(path).await?;
        let (mut merged, version) = match existing {
            Some(record) => (record.fields, record.version),
            None => (BTreeMap::new(), 0),
        };

        let mut changed = false;
        for (key, value) in fields {
            let present = merged.get(key).map(|v| !v.is_empty()).unwrap_or(false);
            if !present && !value.is_empty() {
                merged.insert(key.clone(), value.clone());
                changed = true;
            }
        }

        if !changed {
            debug!(path = %path, "Existing secret preserved");
            return Ok(PutOutcome::Preserved);
        }

        match self.backend.write(path, &merged, Some(version)).await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(StoreError::Conflict(_)) => {
                warn!(path = %path, "Concurrent writer won, keeping its value");
                Ok(PutOutcome::Preserved)
            }
            Err(e) => Err(e),
        }
    }
}
