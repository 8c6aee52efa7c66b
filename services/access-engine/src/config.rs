//! Access Engine Configuration
//!
//! Loaded from a TOML file; secret-store connection values can be overridden
//! from the command line or environment (see `main.rs`).
//!
//! ```toml
//! [secret_store]
//! address = "http://vault:8200"
//!
//! [identity]
//! username = "svc-automation"
//! email = "automation@lornu.ai"
//!
//! [[platforms]]
//! kind = "gitea"
//! name = "gitea"
//! base_url = "http://gitea:3000"
//! organization = "platform"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ReconcileError;
use crate::secrets;
use crate::types::{AccessTier, PlatformKind, TierDefinition};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    pub secret_store: SecretStoreConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum platforms reconciled at once (default: all of them)
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Optional wall-clock limit for one platform's reconciliation
    #[serde(default)]
    pub platform_deadline_secs: Option<u64>,
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SecretStoreConfig {
    pub address: String,
    #[serde(default = "default_mount")]
    pub mount: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    #[serde(default)]
    pub secret_id: Option<String>,
    /// AppRole role provisioned by the seeder
    #[serde(default = "default_approle")]
    pub approle: String,
}

impl std::fmt::Debug for SecretStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStoreConfig")
            .field("address", &self.address)
            .field("mount", &self.mount)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("role_id", &self.role_id)
            .field("secret_id", &self.secret_id.as_ref().map(|_| "[REDACTED]"))
            .field("approle", &self.approle)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identity_username")]
    pub username: String,
    #[serde(default = "default_identity_email")]
    pub email: String,
    #[serde(default = "default_identity_display_name")]
    pub display_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            username: default_identity_username(),
            email: default_identity_email(),
            display_name: default_identity_display_name(),
        }
    }
}

/// Readiness probe settings shared by all platforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    #[serde(default = "default_probe_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub interval_secs: u64,
    /// Statuses that prove the service answered, regardless of auth outcome
    #[serde(default = "default_alive_statuses")]
    pub alive_statuses: Vec<u16>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_probe_timeout_secs(),
            interval_secs: default_probe_interval_secs(),
            alive_statuses: default_alive_statuses(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub group: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Tier -> group/permission table for one platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    pub read_only: TierSpec,
    pub read_write: TierSpec,
    pub admin: TierSpec,
}

impl TierTable {
    pub fn definitions(&self) -> Vec<TierDefinition> {
        [
            (AccessTier::ReadOnly, &self.read_only),
            (AccessTier::ReadWrite, &self.read_write),
            (AccessTier::Admin, &self.admin),
        ]
        .into_iter()
        .map(|(tier, spec)| TierDefinition {
            tier,
            group: spec.group.clone(),
            permissions: spec.permissions.clone(),
        })
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub kind: PlatformKind,
    /// Scope for secret paths; unique per run
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub admin_secret_path: Option<String>,
    /// Overrides the kind's default health endpoint
    #[serde(default)]
    pub probe_path: Option<String>,
    /// Gitea organization holding the tier teams
    #[serde(default)]
    pub organization: Option<String>,
    /// Seeded when no admin credential exists yet
    #[serde(default)]
    pub default_admin_username: Option<String>,
    #[serde(default)]
    pub default_admin_password: Option<String>,
    #[serde(default)]
    pub tiers: Option<TierTable>,
    /// The single elevated tier the service identity joins
    #[serde(default = "default_bind_tier")]
    pub bind_tier: AccessTier,
}

impl PlatformConfig {
    pub fn new(kind: PlatformKind, name: &str, base_url: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            base_url: base_url.to_string(),
            admin_secret_path: None,
            probe_path: None,
            organization: None,
            default_admin_username: None,
            default_admin_password: None,
            tiers: None,
            bind_tier: default_bind_tier(),
        }
    }

    pub fn admin_path(&self) -> String {
        self.admin_secret_path
            .clone()
            .unwrap_or_else(|| secrets::admin_path(&self.name))
    }

    pub fn token_path(&self) -> String {
        secrets::token_path(&self.name)
    }

    /// Configured tier table, or the kind's built-in one
    pub fn tier_definitions(&self) -> Vec<TierDefinition> {
        match &self.tiers {
            Some(table) => table.definitions(),
            None => default_tiers(self.kind),
        }
    }

    pub fn default_admin(&self) -> String {
        self.default_admin_username
            .clone()
            .unwrap_or_else(|| match self.kind {
                PlatformKind::Gitea => "gitea-admin".to_string(),
                _ => "admin".to_string(),
            })
    }
}

/// Built-in per-platform tier tables. Read-only permissions are contained in
/// read-write, and admin carries the platform's full-control permission.
pub fn default_tiers(kind: PlatformKind) -> Vec<TierDefinition> {
    use AccessTier::*;
    match kind {
        PlatformKind::Gitea => {
            let units = [
                "repo.code",
                "repo.issues",
                "repo.pulls",
                "repo.releases",
                "repo.wiki",
                "repo.packages",
                "repo.actions",
            ];
            vec![
                TierDefinition::new(ReadOnly, "platform-read-only", &units),
                TierDefinition::new(ReadWrite, "platform-read-write", &units),
                TierDefinition::new(Admin, "platform-admin", &units),
            ]
        }
        PlatformKind::Sonarqube => vec![
            TierDefinition::new(
                ReadOnly,
                "platform-read-only",
                &["template:user", "template:codeviewer"],
            ),
            TierDefinition::new(
                ReadWrite,
                "platform-read-write",
                &[
                    "template:user",
                    "template:codeviewer",
                    "template:issueadmin",
                    "template:scan",
                    "provisioning",
                    "scan",
                ],
            ),
            TierDefinition::new(
                Admin,
                "platform-admin",
                &[
                    "template:user",
                    "template:codeviewer",
                    "template:issueadmin",
                    "template:scan",
                    "template:securityhotspotadmin",
                    "template:admin",
                    "provisioning",
                    "scan",
                    "gateadmin",
                    "profileadmin",
                    "admin",
                ],
            ),
        ],
        PlatformKind::Nexus => vec![
            TierDefinition::new(
                ReadOnly,
                "platform-read-only",
                &[
                    "nx-repository-view-*-*-browse",
                    "nx-repository-view-*-*-read",
                ],
            ),
            TierDefinition::new(
                ReadWrite,
                "platform-read-write",
                &[
                    "nx-repository-view-*-*-browse",
                    "nx-repository-view-*-*-read",
                    "nx-repository-view-*-*-add",
                    "nx-repository-view-*-*-edit",
                    "nx-component-upload",
                ],
            ),
            TierDefinition::new(Admin, "platform-admin", &["nx-all"]),
        ],
        PlatformKind::Jenkins => {
            let read = [
                "hudson.model.Hudson.Read",
                "hudson.model.Item.Discover",
                "hudson.model.Item.Read",
                "hudson.model.View.Read",
            ];
            let mut write = read.to_vec();
            write.extend([
                "hudson.model.Item.Build",
                "hudson.model.Item.Cancel",
                "hudson.model.Item.Create",
                "hudson.model.Item.Configure",
                "hudson.model.Item.Workspace",
                "hudson.model.Run.Update",
            ]);
            let mut admin = write.clone();
            admin.push("hudson.model.Hudson.Administer");
            vec![
                TierDefinition::new(ReadOnly, "platform-read-only", &read),
                TierDefinition::new(ReadWrite, "platform-read-write", &write),
                TierDefinition::new(Admin, "platform-admin", &admin),
            ]
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_mount() -> String {
    "secret".to_string()
}

fn default_approle() -> String {
    "reconciler".to_string()
}

fn default_identity_username() -> String {
    "svc-automation".to_string()
}

fn default_identity_email() -> String {
    "automation@lornu.ai".to_string()
}

fn default_identity_display_name() -> String {
    "Platform Automation".to_string()
}

fn default_probe_timeout_secs() -> u64 {
    300
}

fn default_probe_interval_secs() -> u64 {
    5
}

fn default_alive_statuses() -> Vec<u16> {
    vec![200, 201, 204, 301, 302, 303, 307, 308, 401, 403]
}

fn default_bind_tier() -> AccessTier {
    AccessTier::Admin
}

impl AccessConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: AccessConfig = toml::from_str(raw).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        let mut names = HashSet::new();
        for platform in &self.platforms {
            if platform.name.is_empty() {
                return Err(ReconcileError::InvalidConfig(
                    "platform name must not be empty".into(),
                ));
            }
            if !names.insert(platform.name.as_str()) {
                return Err(ReconcileError::InvalidConfig(format!(
                    "duplicate platform name: {}",
                    platform.name
                )));
            }
            if platform.kind == PlatformKind::Gitea && platform.organization.is_none() {
                return Err(ReconcileError::InvalidConfig(format!(
                    "gitea platform {} needs an organization",
                    platform.name
                )));
            }

            let tiers = platform.tier_definitions();
            let mut groups = HashSet::new();
            for tier in &tiers {
                if tier.group.is_empty() || !groups.insert(tier.group.as_str()) {
                    return Err(ReconcileError::InvalidConfig(format!(
                        "platform {} needs three distinct, non-empty group names",
                        platform.name
                    )));
                }
            }
        }

        if self.identity.username.is_empty() {
            return Err(ReconcileError::InvalidConfig(
                "identity username must not be empty".into(),
            ));
        }
        if self.concurrency == Some(0) {
            return Err(ReconcileError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn platform_deadline(&self) -> Option<Duration> {
        self.platform_deadline_secs.map(Duration::from_secs)
    }

    /// Restrict the run to the named platforms (no filter when empty)
    pub fn retain_platforms(&mut self, names: &[String]) {
        if !names.is_empty() {
            self.platforms.retain(|p| names.contains(&p.name));
        }
    }
}
