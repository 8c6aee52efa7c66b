//! Platform Adapters
//!
//! One adapter per platform behind a uniform capability set. Each adapter
//! owns its own "does this already exist" strategy: some platforms report
//! duplicates with a distinguishable status on create, others need a lookup
//! first. Callers only ever see the three-way created / exists / failed result.
//!
//! Admin credentials are passed in through [`AdapterContext`] on every call;
//! adapters hold no credential state of their own.

mod http;
pub mod gitea;
pub mod jenkins;
pub mod nexus;
pub mod sonarqube;

use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::PlatformConfig;
use crate::error::{StepError, StoreError};
use crate::secrets::{self, SecretStore};
use crate::types::{
    BindOutcome, IdentityOutcome, IssuedToken, PermissionOutcome, PlatformCredential,
    PlatformKind, ServiceIdentity, TierDefinition, TierOutcome, TokenOutcome,
};

pub use gitea::GiteaAdapter;
pub use jenkins::JenkinsAdapter;
pub use nexus::NexusAdapter;
pub use sonarqube::SonarQubeAdapter;

/// Per-call context threaded from the reconciler
pub struct AdapterContext<'a> {
    pub http: &'a Client,
    pub admin: &'a PlatformCredential,
    pub store: &'a SecretStore,
}

/// Uniform provisioning capability set
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Configured platform name; scopes secret paths
    fn name(&self) -> &str;

    fn kind(&self) -> PlatformKind;

    /// Health endpoint that answers even when unauthenticated
    fn probe_url(&self) -> String;

    /// Make sure every tier's group exists
    async fn ensure_groups(
        &self,
        ctx: &AdapterContext<'_>,
        tiers: &[TierDefinition],
    ) -> Vec<TierOutcome>;

    /// Bring each group's enumerated permissions in line with its tier.
    ///
    /// Per-tier failures come back as `PermissionOutcome::Partial`; `Err` is
    /// for failures before any tier could be looked at.
    async fn apply_tier_permissions(
        &self,
        ctx: &AdapterContext<'_>,
        tiers: &[TierDefinition],
    ) -> Result<PermissionOutcome, StepError>;

    /// Look up the service identity by username, creating it when missing
    async fn ensure_service_identity(
        &self,
        ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
    ) -> Result<IdentityOutcome, StepError>;

    /// Ask the platform for a new credential. Only called by `ensure_token`
    /// after the store showed no existing one.
    async fn issue_token(
        &self,
        ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
        platform_id: &str,
    ) -> Result<String, StepError>;

    /// Grant the identity membership in one elevated tier
    async fn bind_identity_to_tier(
        &self,
        ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
        platform_id: &str,
        tier: &TierDefinition,
    ) -> Result<BindOutcome, StepError>;

    /// Issue a token only when the store holds none for this platform.
    ///
    /// Platforms can mint unlimited tokens but never reveal an old one, so
    /// the store is authoritative. The path stays locked from the presence
    /// check until the new token is persisted.
    async fn ensure_token(
        &self,
        ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
        platform_id: &str,
    ) -> Result<TokenOutcome, StepError> {
        let path = secrets::token_path(self.name());
        let _guard = ctx.store.lock(&path).await;

        let existing = ctx.store.read(&path).await?;
        if existing.as_ref().and_then(|r| r.field("token")).is_some() {
            return Ok(TokenOutcome::AlreadyPresent);
        }
        let version = existing.as_ref().map(|r| r.version).unwrap_or(0);

        let token = self.issue_token(ctx, identity, platform_id).await?;

        let mut fields: BTreeMap<String, String> =
            existing.map(|r| r.fields).unwrap_or_default();
        fields.insert("username".to_string(), identity.username.clone());
        fields.insert("platform_id".to_string(), platform_id.to_string());
        fields.insert("token".to_string(), token.clone());

        match ctx.store.put_versioned(&path, &fields, version).await {
            Ok(_) => {
                info!(platform = %self.name(), path = %path, "Service identity token stored");
                Ok(TokenOutcome::Issued(IssuedToken(token)))
            }
            Err(StoreError::Conflict(_)) => {
                // another writer stored a token first; theirs stays authoritative
                warn!(
                    platform = %self.name(),
                    path = %path,
                    "Token written concurrently, discarding the one just issued"
                );
                Ok(TokenOutcome::AlreadyPresent)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Build the adapter for a configured platform
pub fn build_adapter(config: &PlatformConfig) -> Box<dyn PlatformAdapter> {
    match config.kind {
        PlatformKind::Gitea => Box::new(GiteaAdapter::new(config)),
        PlatformKind::Sonarqube => Box::new(SonarQubeAdapter::new(config)),
        PlatformKind::Nexus => Box::new(NexusAdapter::new(config)),
        PlatformKind::Jenkins => Box::new(JenkinsAdapter::new(config)),
    }
}
