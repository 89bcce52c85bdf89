//! Stub GitHub API server for connector tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct IssueSeed {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone)]
pub struct PullSeed {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub created_at: String,
    pub updated_at: String,
    pub merged: bool,
}

#[derive(Debug, Clone)]
pub struct RepoSeed {
    pub full_name: String,
    pub private: bool,
    pub fork: bool,
    pub description: String,
    pub language: String,
    pub readme: Option<String>,
    pub issues: Vec<IssueSeed>,
    pub pulls: Vec<PullSeed>,
}

impl RepoSeed {
    pub fn named(full_name: &str) -> Self {
        Self {
            full_name: full_name.to_string(),
            private: false,
            fork: false,
            description: "Test repository".into(),
            language: "Rust".into(),
            readme: Some("# Hello\n\nThis is the readme.".into()),
            issues: Vec::new(),
            pulls: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Seed {
    token: String,
    user: String,
    repos: Vec<RepoSeed>,
    /// Artificial delay per list call, for tests that need a slow upstream.
    latency_ms: u64,
}

#[derive(Clone, Default)]
pub struct StubState {
    inner: Arc<Mutex<Seed>>,
}

fn lock(inner: &Mutex<Seed>) -> MutexGuard<'_, Seed> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StubState {
    pub fn set_credentials(&self, token: &str, user: &str) {
        let mut seed = lock(&self.inner);
        seed.token = token.to_string();
        seed.user = user.to_string();
    }

    pub fn add_repo(&self, repo: RepoSeed) {
        lock(&self.inner).repos.push(repo);
    }

    pub fn add_issue(&self, full_name: &str, issue: IssueSeed) {
        let mut seed = lock(&self.inner);
        if let Some(repo) = seed.repos.iter_mut().find(|r| r.full_name == full_name) {
            repo.issues.push(issue);
        }
    }

    pub fn set_latency(&self, latency_ms: u64) {
        lock(&self.inner).latency_ms = latency_ms;
    }

    async fn simulate_latency(&self) {
        let latency_ms = lock(&self.inner).latency_ms;
        if latency_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = format!("Bearer {}", lock(&self.inner).token);
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected && !expected.ends_with(' '))
    }
}

/// A live stub GitHub API on an ephemeral port.
pub struct StubGitHub {
    pub addr: SocketAddr,
    pub state: StubState,
}

impl StubGitHub {
    pub async fn spawn() -> Self {
        let state = StubState::default();
        let app = Router::new()
            .route("/user", get(get_user))
            .route("/user/repos", get(list_repos))
            .route("/repos/{owner}/{name}", get(get_repo))
            .route("/repos/{owner}/{name}/readme", get(get_readme))
            .route("/repos/{owner}/{name}/issues", get(list_issues))
            .route(
                "/repos/{owner}/{name}/issues/{number}/comments",
                get(empty_list),
            )
            .route("/repos/{owner}/{name}/pulls", get(list_pulls))
            .route(
                "/repos/{owner}/{name}/pulls/{number}/comments",
                get(empty_list),
            )
            .route("/graphql", post(graphql))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub github");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

fn repo_json(repo: &RepoSeed) -> Value {
    let owner = repo.full_name.split('/').next().unwrap_or_default();
    json!({
        "full_name": repo.full_name,
        "private": repo.private,
        "fork": repo.fork,
        "archived": false,
        "description": repo.description,
        "language": repo.language,
        "topics": ["testing"],
        "html_url": format!("https://github.com/{}", repo.full_name),
        "owner": {"login": owner},
        "created_at": "2024-01-01T00:00:00Z",
        "updated_at": "2024-06-01T00:00:00Z",
    })
}

fn issue_json(repo: &RepoSeed, issue: &IssueSeed) -> Value {
    json!({
        "number": issue.number,
        "title": issue.title,
        "state": "open",
        "body": issue.body,
        "user": {"login": "octocat"},
        "labels": [{"name": "bug"}],
        "html_url": format!("https://github.com/{}/issues/{}", repo.full_name, issue.number),
        "created_at": issue.created_at,
        "updated_at": issue.updated_at,
    })
}

fn pull_json(repo: &RepoSeed, pull: &PullSeed) -> Value {
    json!({
        "number": pull.number,
        "title": pull.title,
        "state": "open",
        "body": pull.body,
        "user": {"login": "octocat"},
        "labels": [],
        "draft": false,
        "merged_at": if pull.merged { Some("2024-06-01T00:00:00Z") } else { None },
        "html_url": format!("https://github.com/{}/pull/{}", repo.full_name, pull.number),
        "created_at": pull.created_at,
        "updated_at": pull.updated_at,
    })
}

async fn get_user(
    State(state): State<StubState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    if !state.authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let user = lock(&state.inner).user.clone();
    Ok(Json(json!({"login": user})))
}

async fn list_repos(
    State(state): State<StubState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    if !state.authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if params.get("page").is_some_and(|p| p != "1") {
        return Ok(Json(json!([])));
    }
    let repos: Vec<Value> = lock(&state.inner).repos.iter().map(repo_json).collect();
    Ok(Json(Value::Array(repos)))
}

async fn get_repo(
    State(state): State<StubState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let full_name = format!("{owner}/{name}");
    lock(&state.inner)
        .repos
        .iter()
        .find(|repo| repo.full_name == full_name)
        .map(|repo| Json(repo_json(repo)))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_readme(
    State(state): State<StubState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Value>, StatusCode> {
    let full_name = format!("{owner}/{name}");
    let seed = lock(&state.inner);
    let repo = seed
        .repos
        .iter()
        .find(|repo| repo.full_name == full_name)
        .ok_or(StatusCode::NOT_FOUND)?;
    let readme = repo.readme.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "content": base64::engine::general_purpose::STANDARD.encode(readme),
        "encoding": "base64",
    })))
}

async fn list_issues(
    State(state): State<StubState>,
    Path((owner, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    state.simulate_latency().await;
    let full_name = format!("{owner}/{name}");
    if params.get("page").is_some_and(|p| p != "1") {
        return Ok(Json(json!([])));
    }
    let since = params.get("since").cloned();
    let seed = lock(&state.inner);
    let repo = seed
        .repos
        .iter()
        .find(|repo| repo.full_name == full_name)
        .ok_or(StatusCode::NOT_FOUND)?;

    let mut issues: Vec<&IssueSeed> = repo
        .issues
        .iter()
        .filter(|issue| match &since {
            Some(since) => issue.updated_at.as_str() > since.as_str(),
            None => true,
        })
        .collect();
    issues.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(Json(Value::Array(
        issues.into_iter().map(|i| issue_json(repo, i)).collect(),
    )))
}

async fn list_pulls(
    State(state): State<StubState>,
    Path((owner, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    let full_name = format!("{owner}/{name}");
    if params.get("page").is_some_and(|p| p != "1") {
        return Ok(Json(json!([])));
    }
    let seed = lock(&state.inner);
    let repo = seed
        .repos
        .iter()
        .find(|repo| repo.full_name == full_name)
        .ok_or(StatusCode::NOT_FOUND)?;

    let mut pulls: Vec<&PullSeed> = repo.pulls.iter().collect();
    pulls.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(Json(Value::Array(
        pulls.into_iter().map(|p| pull_json(repo, p)).collect(),
    )))
}

async fn empty_list(State(state): State<StubState>) -> Json<Value> {
    state.simulate_latency().await;
    Json(json!([]))
}

async fn graphql(State(_state): State<StubState>) -> Json<Value> {
    Json(json!({
        "data": {
            "repository": {
                "discussions": {
                    "pageInfo": {"hasNextPage": false, "endCursor": null},
                    "nodes": [],
                }
            }
        }
    }))
}
