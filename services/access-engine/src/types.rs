//! Access Model Types
//!
//! Tiers, the shared service identity, platform credentials and the
//! per-step outcomes produced by a reconciliation run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::StepError;

/// Permission tier replicated on every platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessTier {
    ReadOnly,
    ReadWrite,
    Admin,
}

impl AccessTier {
    pub const ALL: [AccessTier; 3] = [AccessTier::ReadOnly, AccessTier::ReadWrite, AccessTier::Admin];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessTier::ReadOnly => "read-only",
            AccessTier::ReadWrite => "read-write",
            AccessTier::Admin => "admin",
        }
    }
}

impl std::fmt::Display for AccessTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target platform variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Source control host
    Gitea,
    /// Code quality server
    Sonarqube,
    /// Binary artifact registry
    Nexus,
    /// Build automation server
    Jenkins,
}

impl std::fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformKind::Gitea => write!(f, "gitea"),
            PlatformKind::Sonarqube => write!(f, "sonarqube"),
            PlatformKind::Nexus => write!(f, "nexus"),
            PlatformKind::Jenkins => write!(f, "jenkins"),
        }
    }
}

/// A tier as realised on one platform: the group name and its enumerated
/// permission identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDefinition {
    pub tier: AccessTier,
    /// Group, team or role name on the platform
    pub group: String,
    /// Platform-specific permission identifiers
    pub permissions: Vec<String>,
}

impl TierDefinition {
    pub fn new(tier: AccessTier, group: impl Into<String>, permissions: &[&str]) -> Self {
        Self {
            tier,
            group: group.into(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// The shared automation principal
#[derive(Clone)]
pub struct ServiceIdentity {
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub password: String,
}

impl std::fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("display_name", &self.display_name)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Admin bootstrap credential for one platform. Only ever read from the
/// secret store.
#[derive(Clone, PartialEq, Eq)]
pub struct PlatformCredential {
    pub username: String,
    pub password: String,
}

impl PlatformCredential {
    /// Build from a secret record's fields; `None` when either field is
    /// missing or empty.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Option<Self> {
        let username = fields.get("username").filter(|v| !v.is_empty())?;
        let password = fields.get("password").filter(|v| !v.is_empty())?;
        Some(Self {
            username: username.clone(),
            password: password.clone(),
        })
    }
}

impl std::fmt::Debug for PlatformCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformCredential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// ============================================================
// Adapter outcomes
// ============================================================

/// Result of ensuring one tier's group exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    Created,
    AlreadyExists,
    Failed(StepError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierOutcome {
    pub tier: AccessTier,
    pub group: String,
    pub outcome: GroupOutcome,
}

/// Result of ensuring the service identity; carries the platform's id for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityOutcome {
    Created(String),
    AlreadyExists(String),
}

impl IdentityOutcome {
    pub fn platform_id(&self) -> &str {
        match self {
            IdentityOutcome::Created(id) | IdentityOutcome::AlreadyExists(id) => id,
        }
    }
}

/// Token issued by a platform. The value is persisted before this is returned.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken(pub String);

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IssuedToken([REDACTED])")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    Issued(IssuedToken),
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Bound,
    AlreadyBound,
}

/// A tier whose permission set could not be applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierFailure {
    pub tier: AccessTier,
    pub error: StepError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    /// At least one tier's permissions were changed
    Applied,
    /// Every tier already carried its configured permission set
    AlreadyApplied,
    /// Some tiers failed; the others are in place
    Partial(Vec<TierFailure>),
}

// ============================================================
// Reconciliation report
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Groups,
    TierPermissions,
    Identity,
    Token,
    Binding,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::Groups => write!(f, "groups"),
            Step::TierPermissions => write!(f, "tier_permissions"),
            Step::Identity => write!(f, "identity"),
            Step::Token => write!(f, "token"),
            Step::Binding => write!(f, "binding"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Created,
    Applied,
    Issued,
    Bound,
    AlreadySatisfied,
    /// Some sub-operations succeeded, some failed
    Partial,
    /// Not attempted because a prerequisite step failed
    Blocked,
    Failed,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            StepStatus::Created
                | StepStatus::Applied
                | StepStatus::Issued
                | StepStatus::Bound
                | StepStatus::AlreadySatisfied
        )
    }

    /// Whether the step changed platform or store state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            StepStatus::Created | StepStatus::Applied | StepStatus::Issued | StepStatus::Bound
        )
    }
}

/// Error details attached to a failed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepErrorReport {
    pub kind: String,
    pub message: String,
}

impl From<&StepError> for StepErrorReport {
    fn from(err: &StepError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: Step,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StepErrorReport>,
}

impl StepReport {
    pub fn new(step: Step, status: StepStatus) -> Self {
        Self {
            step,
            status,
            detail: None,
            errors: Vec::new(),
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn error(mut self, err: &StepError) -> Self {
        self.errors.push(StepErrorReport::from(err));
        self
    }
}

/// Per-tier group state as observed by the groups step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: AccessTier,
    pub group: String,
    pub status: StepStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformStatus {
    /// Platform never answered the readiness probe, or had no admin credential
    Skipped,
    /// Some steps failed; completed steps stay applied
    Partial,
    Converged,
}

impl std::fmt::Display for PlatformStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlatformStatus::Skipped => write!(f, "skipped"),
            PlatformStatus::Partial => write!(f, "partial"),
            PlatformStatus::Converged => write!(f, "converged"),
        }
    }
}

/// Per-platform outcome of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub platform: String,
    pub kind: PlatformKind,
    pub status: PlatformStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_id: Option<String>,
    pub tiers: Vec<TierReport>,
    pub steps: Vec<StepReport>,
}

impl ReconciliationResult {
    pub fn new(platform: impl Into<String>, kind: PlatformKind) -> Self {
        Self {
            platform: platform.into(),
            kind,
            status: PlatformStatus::Partial,
            skip_reason: None,
            platform_id: None,
            tiers: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn step(&self, step: Step) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == step)
    }

    pub fn step_status(&self, step: Step) -> Option<StepStatus> {
        self.step(step).map(|s| s.status)
    }
}

/// Result of a full run across all configured platforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: uuid::Uuid,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub results: Vec<ReconciliationResult>,
}

impl RunReport {
    pub fn platform(&self, name: &str) -> Option<&ReconciliationResult> {
        self.results.iter().find(|r| r.platform == name)
    }

    pub fn all_converged(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status == PlatformStatus::Converged)
    }

    /// Format the report as a table for terminal output
    pub fn display(&self) -> String {
        let mut out = format!(
            "{:<16} {:<10} {:<10} {:<12} {:<16} {:<12} {:<12} {:<12}\n",
            "PLATFORM", "KIND", "STATUS", "GROUPS", "PERMISSIONS", "IDENTITY", "TOKEN", "BINDING"
        );
        out.push_str(&"-".repeat(106));
        out.push('\n');

        for result in &self.results {
            let cell = |step: Step| {
                result
                    .step_status(step)
                    .and_then(|s| serde_json::to_value(s).ok())
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "-".to_string())
            };
            out.push_str(&format!(
                "{:<16} {:<10} {:<10} {:<12} {:<16} {:<12} {:<12} {:<12}\n",
                result.platform,
                result.kind.to_string(),
                result.status.to_string(),
                cell(Step::Groups),
                cell(Step::TierPermissions),
                cell(Step::Identity),
                cell(Step::Token),
                cell(Step::Binding),
            ));
        }
        out
    }
}
