//! Jenkins (build server) adapter
//!
//! Tiers map to global roles of the role-strategy plugin. Mutating requests
//! carry a CSRF crumb; the crumb is bound to the session cookie, which the
//! shared client keeps in its cookie store.

use async_trait::async_trait;
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use super::http::{self, encode, join};
use super::{AdapterContext, PlatformAdapter};
use crate::config::PlatformConfig;
use crate::error::StepError;
use crate::types::{
    BindOutcome, GroupOutcome, IdentityOutcome, PermissionOutcome, PlatformKind,
    ServiceIdentity, TierDefinition, TierFailure, TierOutcome,
};

const DEFAULT_PROBE_PATH: &str = "/login";
const ROLE_TYPE: &str = "globalRoles";

pub struct JenkinsAdapter {
    name: String,
    base_url: String,
    probe_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Crumb {
    crumb: String,
    crumb_request_field: String,
}

/// `getRole` answer; an unknown role comes back as `{}` or 404
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleInfo {
    permission_ids: Option<BTreeMap<String, bool>>,
    #[serde(default)]
    sids_assigned_to_role: Vec<Value>,
}

impl RoleInfo {
    fn exists(&self) -> bool {
        self.permission_ids.is_some()
    }

    fn granted(&self) -> BTreeSet<&str> {
        self.permission_ids
            .iter()
            .flatten()
            .filter(|(_, granted)| **granted)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// Assigned sids; older plugin versions list plain strings, newer ones
    /// objects with a `sid` field
    fn sids(&self) -> Vec<&str> {
        self.sids_assigned_to_role
            .iter()
            .filter_map(|entry| match entry {
                Value::String(sid) => Some(sid.as_str()),
                Value::Object(map) => map.get("sid").and_then(Value::as_str),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    data: TokenData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenData {
    token_value: String,
}

fn permissions_match(role: &RoleInfo, tier: &TierDefinition) -> bool {
    let wanted: BTreeSet<&str> = tier.permissions.iter().map(String::as_str).collect();
    role.granted() == wanted
}

impl JenkinsAdapter {
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

    /// Fetch a crumb for the given user; `None` when CSRF protection is off
    async fn crumb(
        &self,
        ctx: &AdapterContext<'_>,
        username: &str,
        password: &str,
    ) -> Result<Option<Crumb>, StepError> {
        let response = http::send(
            ctx.http
                .get(self.api("/crumbIssuer/api/json"))
                .basic_auth(username, Some(password)),
        )
        .await?;
        http::read_optional_json(response).await
    }

    /// POST as the platform admin, with a crumb when Jenkins issues one
    async fn admin_post(
        &self,
        ctx: &AdapterContext<'_>,
        path: &str,
    ) -> Result<RequestBuilder, StepError> {
        let crumb = self
            .crumb(ctx, &ctx.admin.username, &ctx.admin.password)
            .await?;
        let request = ctx
            .http
            .post(self.api(path))
            .basic_auth(&ctx.admin.username, Some(&ctx.admin.password));
        Ok(match crumb {
            Some(c) => request.header(c.crumb_request_field.as_str(), c.crumb.as_str()),
            None => request,
        })
    }

    async fn get_role(
        &self,
        ctx: &AdapterContext<'_>,
        role_name: &str,
    ) -> Result<RoleInfo, StepError> {
        let response = http::send(
            ctx.http
                .get(self.api("/role-strategy/strategy/getRole"))
                .query(&[("type", ROLE_TYPE), ("roleName", role_name)])
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        Ok(http::read_optional_json::<RoleInfo>(response)
            .await?
            .unwrap_or_default())
    }

    async fn add_role(
        &self,
        ctx: &AdapterContext<'_>,
        tier: &TierDefinition,
        overwrite: bool,
    ) -> Result<(), StepError> {
        let permission_ids = tier.permissions.join(",");
        let request = self
            .admin_post(ctx, "/role-strategy/strategy/addRole")
            .await?
            .form(&[
                ("type", ROLE_TYPE),
                ("roleName", tier.group.as_str()),
                ("permissionIds", permission_ids.as_str()),
                ("overwrite", if overwrite { "true" } else { "false" }),
            ]);
        http::expect_success(http::send(request).await?).await?;
        Ok(())
    }

    async fn user_exists(
        &self,
        ctx: &AdapterContext<'_>,
        username: &str,
    ) -> Result<bool, StepError> {
        let response = http::send(
            ctx.http
                .get(self.api(&format!("/user/{}/api/json", encode(username))))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        Ok(http::read_optional_json::<Value>(response).await?.is_some())
    }

    async fn ensure_role(
        &self,
        ctx: &AdapterContext<'_>,
        tier: &TierDefinition,
    ) -> Result<GroupOutcome, StepError> {
        if self.get_role(ctx, &tier.group).await?.exists() {
            return Ok(GroupOutcome::AlreadyExists);
        }
        self.add_role(ctx, tier, false).await?;
        info!(platform = %self.name, role = %tier.group, tier = %tier.tier, "Created role");
        Ok(GroupOutcome::Created)
    }
}

#[async_trait]
impl PlatformAdapter for JenkinsAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Jenkins
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
                let role = self.get_role(ctx, &tier.group).await?;
                if permissions_match(&role, tier) {
                    return Ok(false);
                }
                // overwrite keeps existing sid assignments
                self.add_role(ctx, tier, true).await?;
                debug!(platform = %self.name, role = %tier.group, "Role permissions overwritten");
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
        if self.user_exists(ctx, &identity.username).await? {
            return Ok(IdentityOutcome::AlreadyExists(identity.username.clone()));
        }

        let request = self
            .admin_post(ctx, "/securityRealm/createAccountByAdmin")
            .await?
            .form(&[
                ("username", identity.username.as_str()),
                ("password1", identity.password.as_str()),
                ("password2", identity.password.as_str()),
                ("fullname", identity.display_name.as_str()),
                ("email", identity.email.as_str()),
            ]);
        http::expect_success(http::send(request).await?).await?;

        // the form answers with an HTML page even when validation failed
        if !self.user_exists(ctx, &identity.username).await? {
            return Err(StepError::Rejected {
                status: 200,
                payload: format!("account {} was not created", identity.username),
            });
        }
        info!(platform = %self.name, user = %identity.username, "Created service identity");
        Ok(IdentityOutcome::Created(identity.username.clone()))
    }

    async fn issue_token(
        &self,
        ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
        platform_id: &str,
    ) -> Result<String, StepError> {
        // API tokens can only be generated by their owner
        let crumb = self
            .crumb(ctx, &identity.username, &identity.password)
            .await?;
        let token_name = format!(
            "access-engine-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        let mut request = ctx
            .http
            .post(self.api(&format!(
                "/user/{}/descriptorByName/jenkins.security.ApiTokenProperty/generateNewToken",
                encode(platform_id)
            )))
            .basic_auth(&identity.username, Some(&identity.password))
            .form(&[("newTokenName", token_name.as_str())]);
        if let Some(c) = crumb {
            request = request.header(c.crumb_request_field.as_str(), c.crumb.as_str());
        }

        let generated: TokenResponse = http::read_json(http::send(request).await?).await?;
        info!(platform = %self.name, token_name = %token_name, "Issued API token");
        Ok(generated.data.token_value)
    }

    async fn bind_identity_to_tier(
        &self,
        ctx: &AdapterContext<'_>,
        _identity: &ServiceIdentity,
        platform_id: &str,
        tier: &TierDefinition,
    ) -> Result<BindOutcome, StepError> {
        let role = self.get_role(ctx, &tier.group).await?;
        if role.sids().contains(&platform_id) {
            return Ok(BindOutcome::AlreadyBound);
        }

        let request = self
            .admin_post(ctx, "/role-strategy/strategy/assignRole")
            .await?
            .form(&[
                ("type", ROLE_TYPE),
                ("roleName", tier.group.as_str()),
                ("sid", platform_id),
            ]);
        http::expect_success(http::send(request).await?).await?;
        info!(platform = %self.name, role = %tier.group, user = %platform_id, "Bound identity to role");
        Ok(BindOutcome::Bound)
    }
}
