//! Bootstrap Seeder
//!
//! Prepares the secret store before the first reconciliation: admin
//! credentials per platform, the service identity record, one policy per
//! access tier and the machine-auth role the reconciler logs in with.
//! Safe to re-run; nothing that already holds a value is overwritten.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AccessConfig;
use crate::error::StoreError;
use crate::secrets::{
    self, AppRoleSpec, Policy, PolicyAdmin, PutOutcome, SecretStore, IDENTITY_PATH,
};
use crate::types::AccessTier;

const PLACEHOLDER_PASSWORD_LEN: usize = 24;

/// What a seeding pass did to the store
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeedReport {
    pub mount_created: bool,
    /// Record paths that received new values
    pub written: Vec<String>,
    /// Record paths left untouched because they were already populated
    pub preserved: Vec<String>,
    pub policies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approle: Option<String>,
}

impl SeedReport {
    fn track(&mut self, path: &str, outcome: PutOutcome) {
        match outcome {
            PutOutcome::Written => self.written.push(path.to_string()),
            PutOutcome::Preserved => self.preserved.push(path.to_string()),
        }
    }
}

pub struct Seeder {
    store: Arc<SecretStore>,
    admin: Arc<dyn PolicyAdmin>,
}

impl Seeder {
    pub fn new(store: Arc<SecretStore>, admin: Arc<dyn PolicyAdmin>) -> Self {
        Self { store, admin }
    }

    pub async fn seed(&self, config: &AccessConfig) -> Result<SeedReport, StoreError> {
        self.store.health().await?;
        let mut report = SeedReport {
            mount_created: self.admin.ensure_kv_mount().await?,
            ..Default::default()
        };

        for platform in &config.platforms {
            let path = platform.admin_path();
            let password = platform
                .default_admin_password
                .clone()
                .unwrap_or_else(|| secrets::generate_secret(PLACEHOLDER_PASSWORD_LEN));
            let mut fields = BTreeMap::new();
            fields.insert("username".to_string(), platform.default_admin());
            fields.insert("password".to_string(), password);

            let outcome = self.store.put_if_absent(&path, &fields).await?;
            if outcome == PutOutcome::Written && platform.default_admin_password.is_none() {
                warn!(
                    platform = %platform.name,
                    path = %path,
                    "Seeded a placeholder admin password; replace it with the platform's real one"
                );
            }
            report.track(&path, outcome);
        }

        let mut identity = BTreeMap::new();
        identity.insert("username".to_string(), config.identity.username.clone());
        identity.insert("email".to_string(), config.identity.email.clone());
        let (_, outcome) = self
            .store
            .ensure_generated(IDENTITY_PATH, "password", &identity, || {
                secrets::generate_secret(32)
            })
            .await?;
        report.track(IDENTITY_PATH, outcome);

        for policy in Policy::tier_policies(&config.secret_store.mount) {
            self.admin.put_policy(&policy).await?;
            report.policies.push(policy.name);
        }

        let role_policy = AccessTier::ReadWrite.as_str();
        let spec = AppRoleSpec::reconciler(&config.secret_store.approle, role_policy);
        let role_id = self.admin.ensure_approle(&spec).await?;
        let path = secrets::approle_path(&spec.name);
        let outcome = self.persist_role(&path, &spec.name, &role_id).await?;
        report.track(&path, outcome);
        report.approle = Some(spec.name);

        info!(
            written = report.written.len(),
            preserved = report.preserved.len(),
            policies = report.policies.len(),
            "Secret store seeded"
        );
        Ok(report)
    }

    /// Store the role id and, only when none is stored yet, a new secret id
    async fn persist_role(
        &self,
        path: &str,
        role: &str,
        role_id: &str,
    ) -> Result<PutOutcome, StoreError> {
        let _guard = self.store.lock(path).await;
        let existing = self.store.read(path).await?;
        let version = existing.as_ref().map(|r| r.version).unwrap_or(0);
        let has_secret_id = existing
            .as_ref()
            .and_then(|r| r.field("secret_id"))
            .is_some();
        let role_id_current = existing.as_ref().and_then(|r| r.field("role_id")) == Some(role_id);

        if has_secret_id && role_id_current {
            return Ok(PutOutcome::Preserved);
        }

        let mut fields = existing.map(|r| r.fields).unwrap_or_default();
        fields.insert("role_id".to_string(), role_id.to_string());
        if !has_secret_id {
            fields.insert("secret_id".to_string(), self.admin.mint_secret_id(role).await?);
            info!(role = %role, "Minted AppRole secret id");
        }

        match self.store.put_versioned(path, &fields, version).await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(StoreError::Conflict(_)) => {
                warn!(path = %path, "AppRole credentials written concurrently, keeping stored ones");
                Ok(PutOutcome::Preserved)
            }
            Err(e) => Err(e),
        }
    }
}
