//! Reconciler
//!
//! Drives every configured platform to the target access model. Each platform
//! runs an explicit state machine:
//!
//! ```text
//! pending -> probing -> skipped
//!                    -> groups -> tier_permissions -> identity -> token -> binding
//!                       -> converged | partial
//! ```
//!
//! A failed step never undoes earlier ones and never stops independent later
//! steps. Platforms run concurrently; the secret store is the only shared
//! state and serialises writes per path.

use futures::stream::{self, StreamExt};
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::adapters::{build_adapter, AdapterContext, PlatformAdapter};
use crate::config::{AccessConfig, IdentityConfig, PlatformConfig};
use crate::error::{ReconcileError, StepError};
use crate::readiness::{Readiness, ReadinessProber};
use crate::secrets::{self, PutOutcome, SecretStore, IDENTITY_PATH};
use crate::types::{
    BindOutcome, GroupOutcome, IdentityOutcome, PermissionOutcome, PlatformCredential,
    PlatformStatus, ReconciliationResult, RunReport, ServiceIdentity, Step, StepReport,
    StepStatus, TierDefinition, TierReport, TokenOutcome,
};

pub const SKIP_MISSING_CREDENTIAL: &str = "missing_credential";
pub const SKIP_UNREACHABLE: &str = "unreachable";
pub const SKIP_CREDENTIAL_UNREADABLE: &str = "credential_unreadable";
const DEADLINE_EXCEEDED: &str = "deadline_exceeded";

const GENERATED_PASSWORD_LEN: usize = 32;

/// HTTP client shared by every platform and the secret store
pub fn build_http_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(timeout)
        .cookie_store(true)
        .build()
}

/// A platform's configuration paired with its adapter
pub struct PlatformTarget {
    pub config: PlatformConfig,
    pub adapter: Box<dyn PlatformAdapter>,
}

impl PlatformTarget {
    pub fn new(config: PlatformConfig) -> Self {
        let adapter = build_adapter(&config);
        Self { config, adapter }
    }

    pub fn with_adapter(config: PlatformConfig, adapter: Box<dyn PlatformAdapter>) -> Self {
        Self { config, adapter }
    }
}

/// Position in a platform's step sequence once it is known to be reachable
enum PlatformState {
    Groups,
    TierPermissions,
    Identity,
    Token,
    Binding,
    Finished,
}

/// Facts carried between steps of one platform
#[derive(Default)]
struct StepContext {
    /// Tiers whose group was created or already existed
    ready_tiers: Vec<TierDefinition>,
    all_groups_ready: bool,
    platform_id: Option<String>,
}

pub struct Reconciler {
    store: Arc<SecretStore>,
    http: Client,
    prober: ReadinessProber,
    identity: IdentityConfig,
    concurrency: Option<usize>,
    deadline: Option<Duration>,
}

impl Reconciler {
    pub fn new(
        store: Arc<SecretStore>,
        http: Client,
        prober: ReadinessProber,
        identity: IdentityConfig,
    ) -> Self {
        Self {
            store,
            http,
            prober,
            identity,
            concurrency: None,
            deadline: None,
        }
    }

    /// Upper bound on platforms reconciled at once (default: all)
    pub fn with_concurrency(mut self, concurrency: Option<usize>) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Wall-clock limit per platform; steps finished before it stay applied
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// One full run across `targets`.
    ///
    /// Fails only when the secret store cannot be used; every platform-level
    /// problem is reported inside the returned [`RunReport`].
    pub async fn run(&self, targets: Vec<PlatformTarget>) -> Result<RunReport, ReconcileError> {
        let run_id = uuid::Uuid::new_v4();
        let started_at = chrono::Utc::now();
        info!(run_id = %run_id, platforms = targets.len(), "Starting reconciliation run");

        if let Err(e) = self.store.health().await {
            error!(run_id = %run_id, error = %e, "Secret store unavailable, no platform touched");
            return Err(ReconcileError::StoreUnavailable(e));
        }

        let identity = self.resolve_identity().await?;

        let limit = self.concurrency.unwrap_or(targets.len()).max(1);
        let results: Vec<ReconciliationResult> = stream::iter(targets.iter())
            .map(|target| self.reconcile_platform(target, &identity))
            .buffered(limit)
            .collect()
            .await;

        let report = RunReport {
            run_id,
            started_at,
            finished_at: chrono::Utc::now(),
            results,
        };
        info!(
            run_id = %run_id,
            converged = report.all_converged(),
            "Reconciliation run finished"
        );
        Ok(report)
    }

    /// Load the shared identity, generating its password on first use
    pub async fn resolve_identity(&self) -> Result<ServiceIdentity, ReconcileError> {
        let mut extra = BTreeMap::new();
        extra.insert("username".to_string(), self.identity.username.clone());
        extra.insert("email".to_string(), self.identity.email.clone());

        let (password, outcome) = self
            .store
            .ensure_generated(IDENTITY_PATH, "password", &extra, || {
                secrets::generate_secret(GENERATED_PASSWORD_LEN)
            })
            .await
            .map_err(ReconcileError::StoreUnavailable)?;

        if outcome == PutOutcome::Written {
            info!(user = %self.identity.username, "Generated service identity password");
        }

        Ok(ServiceIdentity {
            username: self.identity.username.clone(),
            email: self.identity.email.clone(),
            display_name: self.identity.display_name.clone(),
            password,
        })
    }

    /// Reconcile one platform, honouring the per-platform deadline
    pub async fn reconcile_platform(
        &self,
        target: &PlatformTarget,
        identity: &ServiceIdentity,
    ) -> ReconciliationResult {
        let mut result = ReconciliationResult::new(target.adapter.name(), target.adapter.kind());
        let mut reachable = false;

        let timed_out = match self.deadline {
            Some(deadline) => tokio::time::timeout(
                deadline,
                self.drive(target, identity, &mut result, &mut reachable),
            )
            .await
            .is_err(),
            None => {
                self.drive(target, identity, &mut result, &mut reachable).await;
                false
            }
        };

        if timed_out && !reachable {
            warn!(platform = %result.platform, "Platform deadline exceeded before it answered its probe");
            skip(&mut result, SKIP_UNREACHABLE);
        } else if timed_out {
            warn!(platform = %result.platform, "Platform deadline exceeded, keeping completed steps");
            for step in [
                Step::Groups,
                Step::TierPermissions,
                Step::Identity,
                Step::Token,
                Step::Binding,
            ] {
                if result.step(step).is_none() {
                    result
                        .steps
                        .push(StepReport::new(step, StepStatus::Blocked).detail(DEADLINE_EXCEEDED));
                }
            }
            result.status = PlatformStatus::Partial;
        }
        result
    }

    async fn drive(
        &self,
        target: &PlatformTarget,
        identity: &ServiceIdentity,
        result: &mut ReconciliationResult,
        reachable: &mut bool,
    ) {
        let adapter = target.adapter.as_ref();

        let admin = match self.admin_credential(&target.config).await {
            Ok(Some(admin)) => admin,
            Ok(None) => {
                warn!(platform = %adapter.name(), "No admin credential in the secret store, skipping");
                return skip(result, SKIP_MISSING_CREDENTIAL);
            }
            Err(e) => {
                warn!(platform = %adapter.name(), error = %e, "Admin credential unreadable, skipping");
                return skip(result, SKIP_CREDENTIAL_UNREADABLE);
            }
        };

        match self.prober.await_ready(&adapter.probe_url()).await {
            Readiness::Ready { .. } => {}
            Readiness::TimedOut { attempts, last_error } => {
                warn!(
                    platform = %adapter.name(),
                    attempts,
                    last_error = last_error.as_deref().unwrap_or("-"),
                    "Platform unreachable, skipping for this run"
                );
                return skip(result, SKIP_UNREACHABLE);
            }
        }
        *reachable = true;

        let ctx = AdapterContext {
            http: &self.http,
            admin: &admin,
            store: &self.store,
        };
        let tiers = target.config.tier_definitions();
        let mut facts = StepContext::default();
        let mut state = PlatformState::Groups;

        loop {
            state = match state {
                PlatformState::Groups => {
                    let report = self.groups_step(adapter, &ctx, &tiers, &mut facts, result).await;
                    record(result, report);
                    PlatformState::TierPermissions
                }
                PlatformState::TierPermissions => {
                    let report = permissions_step(adapter, &ctx, &tiers, &facts).await;
                    record(result, report);
                    PlatformState::Identity
                }
                PlatformState::Identity => {
                    let report = match adapter.ensure_service_identity(&ctx, identity).await {
                        Ok(outcome) => {
                            facts.platform_id = Some(outcome.platform_id().to_string());
                            match outcome {
                                IdentityOutcome::Created(_) => {
                                    StepReport::new(Step::Identity, StepStatus::Created)
                                }
                                IdentityOutcome::AlreadyExists(_) => {
                                    StepReport::new(Step::Identity, StepStatus::AlreadySatisfied)
                                }
                            }
                        }
                        Err(e) => StepReport::new(Step::Identity, StepStatus::Failed).error(&e),
                    };
                    result.platform_id = facts.platform_id.clone();
                    record(result, report);
                    PlatformState::Token
                }
                PlatformState::Token => {
                    let report = match &facts.platform_id {
                        None => StepReport::new(Step::Token, StepStatus::Blocked)
                            .detail("service identity unavailable"),
                        Some(platform_id) => {
                            match adapter.ensure_token(&ctx, identity, platform_id).await {
                                Ok(TokenOutcome::Issued(_)) => {
                                    StepReport::new(Step::Token, StepStatus::Issued)
                                        .detail(target.config.token_path())
                                }
                                Ok(TokenOutcome::AlreadyPresent) => {
                                    StepReport::new(Step::Token, StepStatus::AlreadySatisfied)
                                }
                                Err(e) => StepReport::new(Step::Token, StepStatus::Failed).error(&e),
                            }
                        }
                    };
                    record(result, report);
                    PlatformState::Binding
                }
                PlatformState::Binding => {
                    let report = bind_step(adapter, &ctx, identity, &target.config, &tiers, &facts).await;
                    record(result, report);
                    PlatformState::Finished
                }
                PlatformState::Finished => break,
            };
        }

        result.status = if result.steps.iter().all(|s| s.status.is_success()) {
            PlatformStatus::Converged
        } else {
            PlatformStatus::Partial
        };
        info!(platform = %result.platform, status = %result.status, "Platform reconciled");
    }

    async fn admin_credential(
        &self,
        config: &PlatformConfig,
    ) -> Result<Option<PlatformCredential>, StepError> {
        let record = self.store.read(&config.admin_path()).await?;
        Ok(record.and_then(|r| PlatformCredential::from_fields(&r.fields)))
    }

    async fn groups_step(
        &self,
        adapter: &dyn PlatformAdapter,
        ctx: &AdapterContext<'_>,
        tiers: &[TierDefinition],
        facts: &mut StepContext,
        result: &mut ReconciliationResult,
    ) -> StepReport {
        let outcomes = adapter.ensure_groups(ctx, tiers).await;

        let mut created = 0;
        let mut errors = Vec::new();
        for outcome in &outcomes {
            let status = match &outcome.outcome {
                GroupOutcome::Created => {
                    created += 1;
                    StepStatus::Created
                }
                GroupOutcome::AlreadyExists => StepStatus::AlreadySatisfied,
                GroupOutcome::Failed(e) => {
                    warn!(
                        platform = %adapter.name(),
                        tier = %outcome.tier,
                        group = %outcome.group,
                        error = %e,
                        "Group could not be ensured"
                    );
                    errors.push(e.clone());
                    StepStatus::Failed
                }
            };
            if status.is_success() {
                if let Some(tier) = tiers.iter().find(|t| t.tier == outcome.tier) {
                    facts.ready_tiers.push(tier.clone());
                }
            }
            result.tiers.push(TierReport {
                tier: outcome.tier,
                group: outcome.group.clone(),
                status,
            });
        }
        facts.all_groups_ready = facts.ready_tiers.len() == tiers.len();

        let status = if errors.is_empty() && created > 0 {
            StepStatus::Created
        } else if errors.is_empty() {
            StepStatus::AlreadySatisfied
        } else if facts.ready_tiers.is_empty() {
            StepStatus::Failed
        } else {
            StepStatus::Partial
        };
        errors
            .iter()
            .fold(StepReport::new(Step::Groups, status), |report, e| report.error(e))
    }
}

async fn permissions_step(
    adapter: &dyn PlatformAdapter,
    ctx: &AdapterContext<'_>,
    tiers: &[TierDefinition],
    facts: &StepContext,
) -> StepReport {
    if facts.ready_tiers.is_empty() {
        return StepReport::new(Step::TierPermissions, StepStatus::Blocked)
            .detail("no tier group available");
    }

    let report = match adapter
        .apply_tier_permissions(ctx, &facts.ready_tiers)
        .await
    {
        Ok(PermissionOutcome::Applied) => StepReport::new(Step::TierPermissions, StepStatus::Applied),
        Ok(PermissionOutcome::AlreadyApplied) => {
            StepReport::new(Step::TierPermissions, StepStatus::AlreadySatisfied)
        }
        Ok(PermissionOutcome::Partial(failures)) => {
            let status = if failures.len() >= facts.ready_tiers.len() {
                StepStatus::Failed
            } else {
                StepStatus::Partial
            };
            failures.iter().fold(
                StepReport::new(Step::TierPermissions, status),
                |report, f| report.error(&f.error),
            )
        }
        Err(e) => StepReport::new(Step::TierPermissions, StepStatus::Failed).error(&e),
    };

    if facts.all_groups_ready || !report.status.is_success() {
        return report;
    }
    // the tiers without a group could not be covered
    let missing: Vec<String> = tiers
        .iter()
        .filter(|t| !facts.ready_tiers.iter().any(|r| r.tier == t.tier))
        .map(|t| t.tier.to_string())
        .collect();
    StepReport {
        status: StepStatus::Partial,
        ..report
    }
    .detail(format!("tiers without group: {}", missing.join(", ")))
}

async fn bind_step(
    adapter: &dyn PlatformAdapter,
    ctx: &AdapterContext<'_>,
    identity: &ServiceIdentity,
    config: &PlatformConfig,
    tiers: &[TierDefinition],
    facts: &StepContext,
) -> StepReport {
    let Some(platform_id) = &facts.platform_id else {
        return StepReport::new(Step::Binding, StepStatus::Blocked)
            .detail("service identity unavailable");
    };
    // membership is granted only once every tier exists
    if !facts.all_groups_ready {
        return StepReport::new(Step::Binding, StepStatus::Blocked)
            .detail("not every tier group exists");
    }
    let Some(tier) = tiers.iter().find(|t| t.tier == config.bind_tier) else {
        return StepReport::new(Step::Binding, StepStatus::Failed)
            .detail(format!("no {} tier configured", config.bind_tier));
    };

    match adapter
        .bind_identity_to_tier(ctx, identity, platform_id, tier)
        .await
    {
        Ok(BindOutcome::Bound) => StepReport::new(Step::Binding, StepStatus::Bound).detail(&tier.group),
        Ok(BindOutcome::AlreadyBound) => {
            StepReport::new(Step::Binding, StepStatus::AlreadySatisfied).detail(&tier.group)
        }
        Err(e) => StepReport::new(Step::Binding, StepStatus::Failed).error(&e),
    }
}

fn record(result: &mut ReconciliationResult, report: StepReport) {
    if report.status.is_success() {
        debug!(platform = %result.platform, step = %report.step, status = ?report.status, "Step done");
    } else {
        warn!(
            platform = %result.platform,
            step = %report.step,
            status = ?report.status,
            errors = report.errors.len(),
            "Step did not complete"
        );
    }
    result.steps.push(report);
}

fn skip(result: &mut ReconciliationResult, reason: &str) {
    result.status = PlatformStatus::Skipped;
    result.skip_reason = Some(reason.to_string());
}

/// Reconcile every platform in `config` against `store`
pub async fn run_reconciliation(
    config: &AccessConfig,
    store: Arc<SecretStore>,
) -> Result<RunReport, ReconcileError> {
    config.validate()?;
    let http = build_http_client(config.request_timeout())
        .map_err(|e| ReconcileError::InvalidConfig(format!("http client: {}", e)))?;
    let prober = ReadinessProber::new(http.clone(), &config.readiness);
    let targets = config
        .platforms
        .iter()
        .cloned()
        .map(PlatformTarget::new)
        .collect();

    Reconciler::new(store, http, prober, config.identity.clone())
        .with_concurrency(config.concurrency)
        .with_deadline(config.platform_deadline())
        .run(targets)
        .await
}
