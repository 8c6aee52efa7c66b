//! SonarQube (code quality) adapter
//!
//! Group creation relies on SonarQube's status code: a duplicate name comes
//! back as 400 "already exists". Permissions are enumerated per group, either
//! global (`scan`) or on the default project template (`template:user`).

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::http::{self, join};
use super::{AdapterContext, PlatformAdapter};
use crate::config::PlatformConfig;
use crate::error::StepError;
use crate::types::{
    BindOutcome, GroupOutcome, IdentityOutcome, PermissionOutcome, PlatformKind,
    ServiceIdentity, TierDefinition, TierFailure, TierOutcome,
};

const DEFAULT_PROBE_PATH: &str = "/api/system/status";
const DEFAULT_TEMPLATE: &str = "Default template";
const TEMPLATE_PREFIX: &str = "template:";

pub struct SonarQubeAdapter {
    name: String,
    base_url: String,
    probe_path: String,
}

#[derive(Debug, Deserialize)]
struct GroupList {
    #[serde(default)]
    groups: Vec<GroupPermissions>,
}

#[derive(Debug, Deserialize)]
struct GroupPermissions {
    name: String,
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    login: String,
}

#[derive(Debug, Deserialize)]
struct CreatedUser {
    user: UserEntry,
}

#[derive(Debug, Deserialize)]
struct GeneratedToken {
    token: String,
}

#[derive(Debug, Deserialize)]
struct UserGroups {
    #[serde(default)]
    groups: Vec<UserGroup>,
}

#[derive(Debug, Deserialize)]
struct UserGroup {
    name: String,
}

/// Where a permission identifier is granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Global,
    Template,
}

/// Split a tier's permissions into global and template-scoped identifiers
fn split_permissions(permissions: &[String]) -> (BTreeSet<&str>, BTreeSet<&str>) {
    let mut global = BTreeSet::new();
    let mut template = BTreeSet::new();
    for permission in permissions {
        match permission.strip_prefix(TEMPLATE_PREFIX) {
            Some(p) => template.insert(p),
            None => global.insert(permission.as_str()),
        };
    }
    (global, template)
}

impl SonarQubeAdapter {
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
        join(&self.base_url, path)
    }

    async fn current_permissions(
        &self,
        ctx: &AdapterContext<'_>,
        group: &str,
        scope: Scope,
    ) -> Result<BTreeSet<String>, StepError> {
        let request = match scope {
            Scope::Global => ctx
                .http
                .get(self.api("/api/permissions/groups"))
                .query(&[("q", group), ("ps", "100")]),
            Scope::Template => ctx
                .http
                .get(self.api("/api/permissions/template_groups"))
                .query(&[("templateName", DEFAULT_TEMPLATE), ("q", group)]),
        };
        let response = http::send(
            request.basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        let list: GroupList = http::read_json(response).await?;

        Ok(list
            .groups
            .into_iter()
            .find(|g| g.name == group)
            .map(|g| g.permissions.into_iter().collect())
            .unwrap_or_default())
    }

    async fn grant(
        &self,
        ctx: &AdapterContext<'_>,
        group: &str,
        permission: &str,
        scope: Scope,
    ) -> Result<(), StepError> {
        let request = match scope {
            Scope::Global => ctx
                .http
                .post(self.api("/api/permissions/add_group"))
                .form(&[("groupName", group), ("permission", permission)]),
            Scope::Template => ctx
                .http
                .post(self.api("/api/permissions/add_group_to_template"))
                .form(&[
                    ("groupName", group),
                    ("permission", permission),
                    ("templateName", DEFAULT_TEMPLATE),
                ]),
        };
        let response = http::send(
            request.basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        http::expect_success(response).await?;
        Ok(())
    }

    /// Grant missing permissions for one tier; true when anything changed
    async fn apply_tier(
        &self,
        ctx: &AdapterContext<'_>,
        tier: &TierDefinition,
    ) -> Result<bool, StepError> {
        let (global, template) = split_permissions(&tier.permissions);
        let mut changed = false;

        for (scope, wanted) in [(Scope::Global, global), (Scope::Template, template)] {
            if wanted.is_empty() {
                continue;
            }
            let current = self.current_permissions(ctx, &tier.group, scope).await?;
            for permission in wanted.into_iter().filter(|p| !current.contains(*p)) {
                self.grant(ctx, &tier.group, permission, scope).await?;
                debug!(platform = %self.name, group = %tier.group, permission, "Granted permission");
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl PlatformAdapter for SonarQubeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Sonarqube
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
            let description = format!("{} tier, managed by access-engine", tier.tier);
            let result = http::send(
                ctx.http
                    .post(self.api("/api/user_groups/create"))
                    .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                    .form(&[("name", tier.group.as_str()), ("description", description.as_str())]),
            )
            .await;
            let result = match result {
                Ok(response) => http::created_or_exists(response).await,
                Err(e) => Err(e),
            };

            let outcome = match result {
                Ok(true) => {
                    info!(platform = %self.name, group = %tier.group, tier = %tier.tier, "Created group");
                    GroupOutcome::Created
                }
                Ok(false) => GroupOutcome::AlreadyExists,
                Err(e) => GroupOutcome::Failed(e),
            };
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
            match self.apply_tier(ctx, tier).await {
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
        let response = http::send(
            ctx.http
                .get(self.api("/api/users/search"))
                .query(&[("q", identity.username.as_str())])
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        let list: UserList = http::read_json(response).await?;
        if let Some(user) = list.users.into_iter().find(|u| u.login == identity.username) {
            return Ok(IdentityOutcome::AlreadyExists(user.login));
        }

        let response = http::send(
            ctx.http
                .post(self.api("/api/users/create"))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .form(&[
                    ("login", identity.username.as_str()),
                    ("name", identity.display_name.as_str()),
                    ("email", identity.email.as_str()),
                    ("password", identity.password.as_str()),
                    ("local", "true"),
                ]),
        )
        .await?;
        let created: CreatedUser = http::read_json(response).await?;
        info!(platform = %self.name, user = %created.user.login, "Created service identity");
        Ok(IdentityOutcome::Created(created.user.login))
    }

    async fn issue_token(
        &self,
        ctx: &AdapterContext<'_>,
        _identity: &ServiceIdentity,
        platform_id: &str,
    ) -> Result<String, StepError> {
        let token_name = format!(
            "access-engine-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        let response = http::send(
            ctx.http
                .post(self.api("/api/user_tokens/generate"))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .form(&[("name", token_name.as_str()), ("login", platform_id)]),
        )
        .await?;
        let generated: GeneratedToken = http::read_json(response).await?;
        info!(platform = %self.name, token_name = %token_name, "Issued user token");
        Ok(generated.token)
    }

    async fn bind_identity_to_tier(
        &self,
        ctx: &AdapterContext<'_>,
        _identity: &ServiceIdentity,
        platform_id: &str,
        tier: &TierDefinition,
    ) -> Result<BindOutcome, StepError> {
        let response = http::send(
            ctx.http
                .get(self.api("/api/users/groups"))
                .query(&[("login", platform_id), ("selected", "selected"), ("ps", "100")])
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        let groups: UserGroups = http::read_json(response).await?;
        if groups.groups.iter().any(|g| g.name == tier.group) {
            return Ok(BindOutcome::AlreadyBound);
        }

        let response = http::send(
            ctx.http
                .post(self.api("/api/user_groups/add_user"))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .form(&[("name", tier.group.as_str()), ("login", platform_id)]),
        )
        .await?;
        http::expect_success(response).await?;
        info!(platform = %self.name, group = %tier.group, user = %platform_id, "Bound identity to group");
        Ok(BindOutcome::Bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_permissions_by_scope() {
        let permissions = vec![
            "template:user".to_string(),
            "scan".to_string(),
            "template:codeviewer".to_string(),
            "admin".to_string(),
        ];
        let (global, template) = split_permissions(&permissions);

        assert_eq!(global.into_iter().collect::<Vec<_>>(), vec!["admin", "scan"]);
        assert_eq!(
            template.into_iter().collect::<Vec<_>>(),
            vec!["codeviewer", "user"]
        );
    }

    #[test]
    fn test_group_list_tolerates_missing_permissions() {
        let list: GroupList = serde_json::from_str(
            r#"{"paging":{"pageIndex":1},"groups":[{"id":"1","name":"platform-admin"}]}"#,
        )
        .unwrap();
        assert!(list.groups[0].permissions.is_empty());
    }
}
