//! Gitea (source control) adapter
//!
//! Tiers are teams inside one organization. Gitea's create endpoints do not
//! reliably flag duplicates, so every ensure step looks up first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use super::http::{self, encode, join};
use super::{AdapterContext, PlatformAdapter};
use crate::config::PlatformConfig;
use crate::error::StepError;
use crate::types::{
    AccessTier, BindOutcome, GroupOutcome, IdentityOutcome, PermissionOutcome, PlatformKind,
    ServiceIdentity, TierDefinition, TierFailure, TierOutcome,
};

const DEFAULT_PROBE_PATH: &str = "/api/healthz";
const TEAM_PAGE_SIZE: usize = 50;
const MAX_TEAM_PAGES: usize = 100;
const TOKEN_SCOPES: [&str; 4] = [
    "write:repository",
    "write:organization",
    "write:issue",
    "read:user",
];

pub struct GiteaAdapter {
    name: String,
    base_url: String,
    organization: String,
    probe_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Team {
    id: i64,
    name: String,
    #[serde(default)]
    permission: String,
    #[serde(default)]
    units: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    sha1: String,
}

#[derive(Debug, Serialize)]
struct TeamPayload<'a> {
    name: &'a str,
    description: String,
    permission: &'static str,
    units: &'a [String],
    units_map: BTreeMap<&'a str, &'static str>,
    includes_all_repositories: bool,
    can_create_org_repo: bool,
}

/// Gitea team access mode for a tier
fn access_mode(tier: AccessTier) -> &'static str {
    match tier {
        AccessTier::ReadOnly => "read",
        AccessTier::ReadWrite => "write",
        AccessTier::Admin => "admin",
    }
}

fn team_payload(tier: &TierDefinition) -> TeamPayload<'_> {
    let mode = access_mode(tier.tier);
    TeamPayload {
        name: &tier.group,
        description: format!("{} tier, managed by access-engine", tier.tier),
        permission: mode,
        units: &tier.permissions,
        units_map: tier
            .permissions
            .iter()
            .map(|unit| (unit.as_str(), mode))
            .collect(),
        includes_all_repositories: true,
        can_create_org_repo: tier.tier != AccessTier::ReadOnly,
    }
}

/// Whether an existing team differs from its tier definition
fn team_drifted(team: &Team, tier: &TierDefinition) -> bool {
    if team.permission != access_mode(tier.tier) {
        return true;
    }
    // admin teams get every unit regardless
    if tier.tier == AccessTier::Admin {
        return false;
    }
    let current: BTreeSet<&str> = team.units.iter().map(String::as_str).collect();
    let wanted: BTreeSet<&str> = tier.permissions.iter().map(String::as_str).collect();
    current != wanted
}

impl GiteaAdapter {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            name: config.name.clone(),
            base_url: config.base_url.clone(),
            organization: config.organization.clone().unwrap_or_default(),
            probe_path: config
                .probe_path
                .clone()
                .unwrap_or_else(|| DEFAULT_PROBE_PATH.to_string()),
        }
    }

    fn api(&self, path: &str) -> String {
        join(&self.base_url, &format!("/api/v1{}", path))
    }

    async fn ensure_organization(&self, ctx: &AdapterContext<'_>) -> Result<(), StepError> {
        let response = http::send(
            ctx.http
                .get(self.api(&format!("/orgs/{}", encode(&self.organization))))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        let existing: Option<serde_json::Value> = http::read_optional_json(response).await?;
        if existing.is_some() {
            return Ok(());
        }

        let response = http::send(
            ctx.http
                .post(self.api("/orgs"))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .json(&json!({
                    "username": self.organization,
                    "visibility": "private",
                })),
        )
        .await?;
        if http::created_or_exists(response).await? {
            info!(platform = %self.name, org = %self.organization, "Created organization");
        }
        Ok(())
    }

    /// Every team in the organization, following pagination
    async fn list_teams(&self, ctx: &AdapterContext<'_>) -> Result<Vec<Team>, StepError> {
        let url = self.api(&format!("/orgs/{}/teams", encode(&self.organization)));
        let mut teams = Vec::new();

        for page in 1..=MAX_TEAM_PAGES {
            let response = http::send(
                ctx.http
                    .get(&url)
                    .query(&[("page", page), ("limit", TEAM_PAGE_SIZE)])
                    .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
            )
            .await?;
            let total = response
                .headers()
                .get("x-total-count")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok());
            let batch: Vec<Team> = http::read_json(response).await?;
            if batch.is_empty() {
                break;
            }
            teams.extend(batch);
            if total.is_some_and(|total| teams.len() >= total) {
                break;
            }
        }
        debug!(platform = %self.name, teams = teams.len(), "Listed organization teams");
        Ok(teams)
    }

    async fn find_team(&self, ctx: &AdapterContext<'_>, group: &str) -> Result<Team, StepError> {
        self.list_teams(ctx)
            .await?
            .into_iter()
            .find(|t| t.name == group)
            .ok_or_else(|| StepError::Decode(format!("team {} not found", group)))
    }

    async fn create_team(
        &self,
        ctx: &AdapterContext<'_>,
        tier: &TierDefinition,
    ) -> Result<bool, StepError> {
        let response = http::send(
            ctx.http
                .post(self.api(&format!("/orgs/{}/teams", encode(&self.organization))))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .json(&team_payload(tier)),
        )
        .await?;
        http::created_or_exists(response).await
    }
}

#[async_trait]
impl PlatformAdapter for GiteaAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Gitea
    }

    fn probe_url(&self) -> String {
        join(&self.base_url, &self.probe_path)
    }

    async fn ensure_groups(
        &self,
        ctx: &AdapterContext<'_>,
        tiers: &[TierDefinition],
    ) -> Vec<TierOutcome> {
        let failed_all = |err: StepError| {
            tiers
                .iter()
                .map(|t| TierOutcome {
                    tier: t.tier,
                    group: t.group.clone(),
                    outcome: GroupOutcome::Failed(err.clone()),
                })
                .collect::<Vec<_>>()
        };

        if let Err(e) = self.ensure_organization(ctx).await {
            warn!(platform = %self.name, error = %e, "Organization unavailable");
            return failed_all(e);
        }

        let existing = match self.list_teams(ctx).await {
            Ok(teams) => teams,
            Err(e) => return failed_all(e),
        };

        let mut outcomes = Vec::with_capacity(tiers.len());
        for tier in tiers {
            let outcome = if existing.iter().any(|t| t.name == tier.group) {
                debug!(platform = %self.name, team = %tier.group, "Team already exists");
                GroupOutcome::AlreadyExists
            } else {
                match self.create_team(ctx, tier).await {
                    Ok(true) => {
                        info!(platform = %self.name, team = %tier.group, tier = %tier.tier, "Created team");
                        GroupOutcome::Created
                    }
                    Ok(false) => GroupOutcome::AlreadyExists,
                    Err(e) => GroupOutcome::Failed(e),
                }
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
        let teams = self.list_teams(ctx).await?;
        let mut changed = false;
        let mut failures = Vec::new();

        for tier in tiers {
            let Some(team) = teams.iter().find(|t| t.name == tier.group) else {
                failures.push(TierFailure {
                    tier: tier.tier,
                    error: StepError::Decode(format!("team {} not found", tier.group)),
                });
                continue;
            };
            if !team_drifted(team, tier) {
                continue;
            }

            let result = http::send(
                ctx.http
                    .patch(self.api(&format!("/teams/{}", team.id)))
                    .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                    .json(&team_payload(tier)),
            )
            .await;
            let result = match result {
                Ok(response) => http::expect_success(response).await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    info!(platform = %self.name, team = %tier.group, "Team permissions updated");
                    changed = true;
                }
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
                .get(self.api(&format!("/users/{}", encode(&identity.username))))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        if let Some(user) = http::read_optional_json::<User>(response).await? {
            return Ok(IdentityOutcome::AlreadyExists(user.id.to_string()));
        }

        let response = http::send(
            ctx.http
                .post(self.api("/admin/users"))
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password))
                .json(&json!({
                    "username": identity.username,
                    "email": identity.email,
                    "full_name": identity.display_name,
                    "password": identity.password,
                    "must_change_password": false,
                    "send_notify": false,
                })),
        )
        .await?;
        let user: User = http::read_json(response).await?;
        info!(platform = %self.name, user = %identity.username, "Created service identity");
        Ok(IdentityOutcome::Created(user.id.to_string()))
    }

    async fn issue_token(
        &self,
        ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
        _platform_id: &str,
    ) -> Result<String, StepError> {
        // token names are unique per user
        let token_name = format!(
            "access-engine-{}",
            chrono::Utc::now().format("%Y%m%d%H%M%S")
        );
        let response = http::send(
            ctx.http
                .post(self.api(&format!("/users/{}/tokens", encode(&identity.username))))
                .basic_auth(&identity.username, Some(&identity.password))
                .json(&json!({ "name": token_name, "scopes": TOKEN_SCOPES })),
        )
        .await?;
        let token: AccessToken = http::read_json(response).await?;
        info!(platform = %self.name, token_name = %token_name, "Issued access token");
        Ok(token.sha1)
    }

    async fn bind_identity_to_tier(
        &self,
        ctx: &AdapterContext<'_>,
        identity: &ServiceIdentity,
        _platform_id: &str,
        tier: &TierDefinition,
    ) -> Result<BindOutcome, StepError> {
        let team = self.find_team(ctx, &tier.group).await?;
        let member_url = self.api(&format!(
            "/teams/{}/members/{}",
            team.id,
            encode(&identity.username)
        ));

        let response = http::send(
            ctx.http
                .get(&member_url)
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        if response.status().is_success() {
            return Ok(BindOutcome::AlreadyBound);
        }
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(http::rejected(response).await);
        }

        let response = http::send(
            ctx.http
                .put(&member_url)
                .basic_auth(&ctx.admin.username, Some(&ctx.admin.password)),
        )
        .await?;
        http::expect_success(response).await?;
        info!(platform = %self.name, team = %tier.group, user = %identity.username, "Bound identity to team");
        Ok(BindOutcome::Bound)
    }
}
