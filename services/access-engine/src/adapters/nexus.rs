//! Nexus Repository (artifact registry) adapter
//!
//! Tiers are Nexus roles with enumerated privileges; role existence is
//! checked by id before creating. Nexus OSS has no per-user API tokens, so
//! the credential stored for the service identity is its password.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use tracing::{info, warn};

use super::http::{self, encode, join};
use super::{AdapterContext, PlatformAdapter};
use crate::config::PlatformConfig;
use crate::error::StepError;
use crate::types::{
    BindOutcome, GroupOutcome, IdentityOutcome, PermissionOutcome, PlatformKind,
    ServiceIdentity, TierDefinition, TierFailure, TierOutcome,
};

const DEFAULT_PROBE_PATH: &str = "/service/rest/v1/status";
/// Role every new user starts with; the elevated tier is added by binding
const BASELINE_ROLE: &str = "nx-anonymous";

pub struct NexusAdapter {
    name: String,
    base_url: String,
    probe_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Role {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    privileges: Vec<String>,
    #[serde(default)]
    roles: Vec<String>,
}

impl Role {
    fn for_tier(tier: &TierDefinition) -> Self {
        Self {
            id: tier.group.clone(),
            name: tier.group.clone(),
            description: format!("{} tier, managed by access-engine", tier.tier),
            privileges: tier.permissions.clone(),
            roles: Vec::new(),
        }
    }

    fn privileges_match(&self, tier: &TierDefinition) -> bool {
        let current: BTreeSet<&String> = self.privileges.iter().collect();
        let wanted: BTreeSet<&String> = tier.permissions.iter().collect();
        current == wanted
    }
}

fn split_display_name(display_name: &str) -> (String, String) {
    match display_name.trim().split_once(' ') {
        Some((first, last)) => (first.to_string(), last.trim().to_string()),
        None => (display_name.to_string(), "Service".to_string()),
    }
}

/// Roles listed on a user record
fn user_roles(user: &Value) -> Vec<String> {
    user.get("roles")
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl NexusAdapter {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            probe_path: config
                .probe_path
                .clone()
                .unwrap_or_else(|| DEFAULT_PROBE_PATH.to_string()),
        }
    }

    fn api(&self, path: &str) -> String {
        join(&self.base_url, &format!("/service/rest/v1{}", path))
    }

    async fn get_role(&self, ctx: &AdapterContext<'_>, id: &str) -> Result<Option<Role>, StepError> {
        let response = http::send(
            ctx.http
                .get(self.api(&format!("/security/roles/{}", encode(id))))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        http::read_optional_json(response).await
    }

    /// Exact-match user lookup; the query parameter is a prefix filter
    async fn find_user(
        &self,
        ctx: &AdapterContext<'_>,
        user_id: &str,
    ) -> Result<Option<Value>, StepError> {
        let response = http::send(
            ctx.http
                .get(self.api("/security/users"))
                .query(&[("userId", user_id)])
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        let users: Vec<Value> = http::read_json(response).await?;
        Ok(users
            .into_iter()
            .find(|u| u.get("userId").and_then(Value::as_str) == Some(user_id)))
    }

    async fn ensure_role(
        &self,
        ctx: &AdapterContext<'_>,
        tier: &TierDefinition,
    ) -> Result<GroupOutcome, StepError> {
        if self.get_role(ctx, &tier.group).await?.is_some() {
            return Ok(GroupOutcome::AlreadyExists);
        }

        let response = http::send(
            ctx.http
                .post(self.api("/security/roles"))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .json(&Role::for_tier(tier)),
        )
        .await?;
        if http::created_or_exists(response).await? {
            info!(platform = %self.name, role = %tier.group, tier = %tier.tier, "Created role");
            Ok(GroupOutcome::Created)
        } else {
            Ok(GroupOutcome::AlreadyExists)
        }
    }
}

#[async_trait]
impl PlatformAdapter for NexusAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Nexus
    }

    fn probe_url(&self) -> String {
        join(&self.base_url, &self.probe_path)
    }

    async fn ensure_groups(
        &self,
        ctx: &AdapterContext<'_>,
        tiers: &[TierDefinition],
    ) -> Vec<TierOutcome> {
        let mut outcomes = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let outcome = self
                .ensure_role(ctx, tier)
                .await
                .unwrap_or_else(GroupOutcome::Failed);
            outcomes.push(TierOutcome {
                tier: tier.tier,
                group: tier.group.clone(),
                outcome,
            });
        }
        outcomes
    }

    async fn apply_tier_permissions(
        &self,
        ctx: &AdapterContext<'_>,
        tiers: &[TierDefinition],
    ) -> Result<PermissionOutcome, StepError> {
        let mut changed = false;
        let mut failures = Vec::new();

        for tier in tiers {
            let result: Result<bool, StepError> = async {
                let role = self
                    .get_role(ctx, &tier.group)
                    .await?
                    .ok_or_else(|| StepError::Decode(format!("role {} not found", tier.group)))?;
                if role.privileges_match(tier) {
                    return Ok(false);
                }

                let mut updated = Role::for_tier(tier);
                updated.roles = role.roles;
                let response = http::send(
                    ctx.http
                        .put(self.api(&format!("/security/roles/{}", encode(&tier.group))))
                        .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                        .json(&updated),
                )
                .await?;
                http::expect_success(response).await?;
                info!(platform = %self.name, role = %tier.group, "Role privileges updated");
                Ok(true)
            }
            .await;

            match result {
                Ok(tier_changed) => changed |= tier_changed,
                Err(error) => failures.push(TierFailure {
                    tier: tier.tier,
                    error,
                }),
            }
        }

        if !failures.is_empty() {
            Ok(PermissionOutcome::Partial(failures))
        } else if changed {
            Ok(PermissionOutcome::Applied)
        } else {
            Ok(PermissionOutcome::AlreadyApplied)
        }
    }

    async fn ensure_service_identity(
        &self,
        ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
    ) -> Result<IdentityOutcome, StepError> {
        if self.find_user(ctx, &identity.username).await?.is_some() {
            return Ok(IdentityOutcome::AlreadyExists(identity.username.clone()));
        }

        let (first_name, last_name) = split_display_name(&identity.display_name);
        let response = http::send(
            ctx.http
                .post(self.api("/security/users"))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .json(&json!({
                    "userId": identity.username,
                    "firstName": first_name,
                    "lastName": last_name,
                    "emailAddress": identity.email,
                    "password": identity.password,
                    "status": "active",
                    "roles": [BASELINE_ROLE],
                })),
        )
        .await?;
        http::expect_success(response).await?;
        info!(platform = %self.name, user = %identity.username, "Created service identity");
        Ok(IdentityOutcome::Created(identity.username.clone()))
    }

    async fn issue_token(
        &self,
        _ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
        _platform_id: &str,
    ) -> Result<String, StepError> {
        warn!(
            platform = %self.name,
            "Nexus OSS issues no user tokens, storing the identity password as its credential"
        );
        Ok(identity.password.clone())
    }

    async fn bind_identity_to_tier(
        &self,
        ctx: &AdapterContext<'_>,
        _identity: &ServiceIdentity,
        platform_id: &str,
        tier: &TierDefinition,
    ) -> Result<BindOutcome, StepError> {
        let mut user = self
            .find_user(ctx, platform_id)
            .await?
            .ok_or_else(|| StepError::Decode(format!("user {} not found", platform_id)))?;

        let mut roles = user_roles(&user);
        if roles.contains(&tier.group) {
            return Ok(BindOutcome::AlreadyBound);
        }
        roles.push(tier.group.clone());
        user["roles"] = json!(roles);

        let response = http::send(
            ctx.http
                .put(self.api(&format!("/security/users/{}", encode(platform_id))))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .json(&user),
        )
        .await?;
        http::expect_success(response).await?;
        info!(platform = %self.name, role = %tier.group, user = %platform_id, "Bound identity to role");
        Ok(BindOutcome::Bound)
    }
}
