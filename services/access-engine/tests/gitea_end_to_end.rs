//! Full reconciliation against a mock Gitea API

mod common;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use lornu_access::config::PlatformConfig;
use lornu_access::secrets;
use lornu_access::types::{Step, StepStatus};
use lornu_access::{PlatformKind, PlatformStatus, PlatformTarget};

use common::*;

#[derive(Default)]
struct Gitea {
    orgs: BTreeSet<String>,
    teams: Vec<Value>,
    users: BTreeMap<String, i64>,
    members: BTreeSet<(i64, String)>,
    tokens: Vec<String>,
    mutations: usize,
}

type Shared = Arc<Mutex<Gitea>>;

async fn get_org(
    State(gitea): State<Shared>,
    Path(org): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if gitea.lock().unwrap().orgs.contains(&org) {
        Ok(Json(json!({ "username": org })))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn create_org(State(gitea): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let mut gitea = gitea.lock().unwrap();
    let name = body["username"].as_str().unwrap_or_default().to_string();
    gitea.orgs.insert(name.clone());
    gitea.mutations += 1;
    (StatusCode::CREATED, Json(json!({ "username": name })))
}

async fn list_teams(
    State(gitea): State<Shared>,
    Path(_org): Path<String>,
    Query(params): Query<BTreeMap<String, usize>>,
) -> ([(&'static str, String); 1], Json<Value>) {
    let gitea = gitea.lock().unwrap();
    let limit = params.get("limit").copied().unwrap_or(30).min(50);
    let page = params.get("page").copied().unwrap_or(1).max(1);
    let teams: Vec<Value> = gitea
        .teams
        .iter()
        .skip((page - 1) * limit)
        .take(limit)
        .cloned()
        .collect();
    (
        [("x-total-count", gitea.teams.len().to_string())],
        Json(Value::Array(teams)),
    )
}

async fn create_team(
    State(gitea): State<Shared>,
    Path(_org): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut gitea = gitea.lock().unwrap();
    let name = body["name"].as_str().unwrap_or_default();
    if gitea.teams.iter().any(|t| t["name"] == name) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "team already exists" })),
        );
    }
    let team = json!({
        "id": gitea.teams.len() as i64 + 1,
        "name": name,
        "permission": body["permission"],
        "units": body["units"],
    });
    gitea.teams.push(team.clone());
    gitea.mutations += 1;
    (StatusCode::CREATED, Json(team))
}

async fn edit_team(
    State(gitea): State<Shared>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let mut gitea = gitea.lock().unwrap();
    gitea.mutations += 1;
    let team = gitea
        .teams
        .iter_mut()
        .find(|t| t["id"] == id)
        .ok_or(StatusCode::NOT_FOUND)?;
    team["permission"] = body["permission"].clone();
    team["units"] = body["units"].clone();
    Ok(Json(team.clone()))
}

async fn get_member(
    State(gitea): State<Shared>,
    Path((id, user)): Path<(i64, String)>,
) -> StatusCode {
    if gitea.lock().unwrap().members.contains(&(id, user)) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn add_member(
    State(gitea): State<Shared>,
    Path((id, user)): Path<(i64, String)>,
) -> StatusCode {
    let mut gitea = gitea.lock().unwrap();
    gitea.members.insert((id, user));
    gitea.mutations += 1;
    StatusCode::NO_CONTENT
}

async fn get_user(
    State(gitea): State<Shared>,
    Path(user): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match gitea.lock().unwrap().users.get(&user) {
        Some(id) => Ok(Json(json!({ "id": id, "login": user }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn create_user(State(gitea): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let mut gitea = gitea.lock().unwrap();
    let login = body["username"].as_str().unwrap_or_default().to_string();
    if gitea.users.contains_key(&login) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "user already exists" })),
        );
    }
    let id = 100 + gitea.users.len() as i64;
    gitea.users.insert(login.clone(), id);
    gitea.mutations += 1;
    (StatusCode::CREATED, Json(json!({ "id": id, "login": login })))
}

async fn create_token(
    State(gitea): State<Shared>,
    Path(_user): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("Basic "))
        .unwrap_or(false);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "message": "unauthorized" })));
    }

    let mut gitea = gitea.lock().unwrap();
    let sha1 = format!("sha1-token-{}", gitea.tokens.len() + 1);
    gitea.tokens.push(sha1.clone());
    gitea.mutations += 1;
    (
        StatusCode::CREATED,
        Json(json!({ "id": gitea.tokens.len(), "name": body["name"], "sha1": sha1 })),
    )
}

async fn mock_gitea(gitea: Shared) -> String {
    let router = Router::new()
        .route("/api/healthz", get(|| async { StatusCode::OK }))
        .route("/api/v1/orgs", post(create_org))
        .route("/api/v1/orgs/:org", get(get_org))
        .route("/api/v1/orgs/:org/teams", get(list_teams).post(create_team))
        .route("/api/v1/teams/:id", patch(edit_team))
        .route("/api/v1/teams/:id/members/:user", get(get_member).put(add_member))
        .route("/api/v1/users/:user", get(get_user))
        .route("/api/v1/users/:user/tokens", post(create_token))
        .route("/api/v1/admin/users", post(create_user))
        .with_state(gitea);
    serve(router).await
}

fn gitea_target(base_url: &str) -> PlatformTarget {
    let mut config = PlatformConfig::new(PlatformKind::Gitea, "gitea", base_url);
    config.organization = Some("platform".to_string());
    PlatformTarget::new(config)
}

#[tokio::test]
async fn test_gitea_converges_then_stays_converged() {
    let gitea: Shared = Arc::default();
    let base = mock_gitea(gitea.clone()).await;
    let (_, store) = memory_store();
    seed_admin(&store, "gitea").await;
    let reconciler = reconciler(store.clone());

    let first = reconciler.run(vec![gitea_target(&base)]).await.unwrap();
    let result = first.platform("gitea").unwrap();
    assert_eq!(result.status, PlatformStatus::Converged, "{:?}", result.steps);
    assert_eq!(result.step_status(Step::Groups), Some(StepStatus::Created));
    assert_eq!(result.step_status(Step::Identity), Some(StepStatus::Created));
    assert_eq!(result.step_status(Step::Token), Some(StepStatus::Issued));
    assert_eq!(result.step_status(Step::Binding), Some(StepStatus::Bound));
    assert_eq!(result.platform_id.as_deref(), Some("100"));

    let token_path = secrets::token_path("gitea");
    let stored = store.read(&token_path).await.unwrap().unwrap();
    assert_eq!(stored.field("token"), Some("sha1-token-1"));
    assert_eq!(stored.field("username"), Some("svc-automation"));
    assert_eq!(stored.field("platform_id"), Some("100"));

    let mutations = {
        let state = gitea.lock().unwrap();
        assert_eq!(state.teams.len(), 3);
        assert_eq!(state.users.len(), 1);
        let admin_team = state
            .teams
            .iter()
            .find(|t| t["name"] == "platform-admin")
            .unwrap()["id"]
            .as_i64()
            .unwrap();
        assert!(state.members.contains(&(admin_team, "svc-automation".to_string())));
        state.mutations
    };

    let second = reconciler.run(vec![gitea_target(&base)]).await.unwrap();
    let result = second.platform("gitea").unwrap();
    assert_eq!(result.status, PlatformStatus::Converged);
    for step in [Step::Groups, Step::Identity, Step::Token, Step::Binding] {
        assert_eq!(result.step_status(step), Some(StepStatus::AlreadySatisfied));
    }

    assert_eq!(
        store.read(&token_path).await.unwrap().unwrap().field("token"),
        Some("sha1-token-1")
    );
    let state = gitea.lock().unwrap();
    assert_eq!(state.mutations, mutations);
    assert_eq!(state.tokens.len(), 1);
}

#[tokio::test]
async fn test_drifted_team_is_patched() {
    let gitea: Shared = Arc::default();
    {
        let mut state = gitea.lock().unwrap();
        state.orgs.insert("platform".to_string());
        state.teams.push(json!({
            "id": 1,
            "name": "platform-read-only",
            "permission": "write",
            "units": ["repo.code"],
        }));
    }
    let base = mock_gitea(gitea.clone()).await;
    let (_, store) = memory_store();
    seed_admin(&store, "gitea").await;

    let report = reconciler(store).run(vec![gitea_target(&base)]).await.unwrap();
    let result = report.platform("gitea").unwrap();

    assert_eq!(result.step_status(Step::TierPermissions), Some(StepStatus::Applied));
    let read_only = result
        .tiers
        .iter()
        .find(|t| t.group == "platform-read-only")
        .unwrap();
    assert_eq!(read_only.status, StepStatus::AlreadySatisfied);

    let state = gitea.lock().unwrap();
    assert_eq!(state.teams[0]["permission"], "read");
    assert_eq!(state.teams[0]["units"].as_array().unwrap().len(), 7);
}

#[tokio::test]
async fn test_tier_teams_beyond_the_first_page_are_found() {
    let gitea: Shared = Arc::default();
    {
        let mut state = gitea.lock().unwrap();
        state.orgs.insert("platform".to_string());
        for i in 0..60 {
            state.teams.push(json!({
                "id": i + 1,
                "name": format!("project-{}", i),
                "permission": "read",
                "units": ["repo.code"],
            }));
        }
    }
    let base = mock_gitea(gitea.clone()).await;
    let (_, store) = memory_store();
    seed_admin(&store, "gitea").await;
    let reconciler = reconciler(store);

    let first = reconciler.run(vec![gitea_target(&base)]).await.unwrap();
    let result = first.platform("gitea").unwrap();
    assert_eq!(result.status, PlatformStatus::Converged, "{:?}", result.steps);
    assert_eq!(gitea.lock().unwrap().teams.len(), 63);
    let mutations = gitea.lock().unwrap().mutations;

    let second = reconciler.run(vec![gitea_target(&base)]).await.unwrap();
    let result = second.platform("gitea").unwrap();
    assert_eq!(result.status, PlatformStatus::Converged, "{:?}", result.steps);
    assert_eq!(result.step_status(Step::Groups), Some(StepStatus::AlreadySatisfied));
    assert_eq!(result.step_status(Step::TierPermissions), Some(StepStatus::AlreadySatisfied));
    assert_eq!(gitea.lock().unwrap().mutations, mutations);
}
