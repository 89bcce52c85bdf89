#![allow(clippy::missing_docs_in_private_items)]

//! GitHub connector: repositories, issues, pull requests and discussions,
//! with per-repo watermarks for incremental syncs.

pub mod client;
pub mod config;
pub mod mappers;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::error::AppError;
use connector_sdk::{Connector, SyncContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use client::{GitHubClient, Issue, Pull, Repo};
use config::{CHECKPOINT_INTERVAL, ITEMS_PER_PAGE};
use mappers::{
    generate_discussion_content, generate_issue_content, generate_pr_content,
    generate_repo_content, map_discussion_to_document, map_issue_to_document, map_pr_to_document,
    map_repo_to_document,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RepoState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    issues_updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prs_updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    discussions_updated_at: Option<String>,
}

impl RepoState {
    fn is_empty(&self) -> bool {
        self.issues_updated_at.is_none()
            && self.prs_updated_at.is_none()
            && self.discussions_updated_at.is_none()
    }
}

/// Replay cursor: highest observed `updated_at` per repo and sub-resource.
/// Watermarks only move forward; a failed run never writes a lower one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GitHubState {
    #[serde(default)]
    repos: HashMap<String, RepoState>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SourceConfig {
    #[serde(default)]
    api_url: Option<String>,
    #[serde(default)]
    repos: Vec<String>,
    #[serde(default)]
    orgs: Vec<String>,
    #[serde(default)]
    users: Vec<String>,
    #[serde(default = "default_true")]
    include_discussions: bool,
    #[serde(default)]
    include_forks: bool,
}

pub struct GitHubConnector;

#[async_trait]
impl Connector for GitHubConnector {
    fn name(&self) -> &str {
        "github"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    async fn sync(
        &self,
        source_config: Value,
        credentials: Value,
        state: Option<Value>,
        ctx: Arc<SyncContext>,
    ) -> Result<(), AppError> {
        let config: SourceConfig = serde_json::from_value(source_config).unwrap_or_default();

        let token = credentials
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if token.is_empty() {
            ctx.fail("Missing 'token' in credentials").await?;
            return Ok(());
        }

        let client = GitHubClient::new(token, config.api_url.as_deref())?;
        let username = match client.validate_token().await {
            Ok(username) => username,
            Err(AppError::Auth(err)) => {
                ctx.fail(&format!("Authentication failed: {err}")).await?;
                return Ok(());
            }
            Err(err) => {
                ctx.fail(&format!("Connection test failed: {err}")).await?;
                return Ok(());
            }
        };
        info!(%username, "starting GitHub sync");

        let prev_state: GitHubState = state
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();
        let mut new_repo_states: HashMap<String, RepoState> = HashMap::new();
        let mut docs_since_checkpoint = 0usize;

        let repos = match self.resolve_repos(&client, &config, &username).await {
            Ok(repos) => repos,
            Err(err) => {
                ctx.fail(&format!("Failed to resolve repositories: {err}"))
                    .await?;
                return Ok(());
            }
        };

        for repo in &repos {
            if ctx.is_cancelled() {
                return Err(self
                    .bail_cancelled(&ctx, &prev_state, &new_repo_states)
                    .await);
            }

            let full_name = repo.full_name.clone();
            let prev = prev_state.repos.get(&full_name).cloned().unwrap_or_default();
            let (owner, name) = match full_name.split_once('/') {
                Some(parts) => parts,
                None => {
                    warn!(%full_name, "skipping repo with malformed name");
                    continue;
                }
            };

            self.sync_repo_document(&client, repo, &ctx, &mut docs_since_checkpoint)
                .await?;

            let issues_updated_at = self
                .sync_issues(
                    &client,
                    owner,
                    name,
                    repo,
                    prev.issues_updated_at.clone(),
                    &ctx,
                    &mut docs_since_checkpoint,
                    &prev_state,
                    &new_repo_states,
                )
                .await?;

            let prs_updated_at = self
                .sync_pulls(
                    &client,
                    owner,
                    name,
                    repo,
                    prev.prs_updated_at.clone(),
                    &ctx,
                    &mut docs_since_checkpoint,
                    &prev_state,
                    &new_repo_states,
                )
                .await?;

            let discussions_updated_at = if config.include_discussions {
                self.sync_discussions(
                    &client,
                    owner,
                    name,
                    repo,
                    prev.discussions_updated_at.clone(),
                    &ctx,
                    &mut docs_since_checkpoint,
                    &prev_state,
                    &new_repo_states,
                )
                .await?
            } else {
                prev.discussions_updated_at.clone()
            };

            let entry = RepoState {
                issues_updated_at,
                prs_updated_at,
                discussions_updated_at,
            };

            if !entry.is_empty() {
                new_repo_states.insert(full_name, entry);
            }

            if docs_since_checkpoint >= CHECKPOINT_INTERVAL {
                ctx.save_state(&snapshot(&prev_state, &new_repo_states))
                    .await?;
                docs_since_checkpoint = 0;
            }
        }

        let final_state = json!({ "repos": new_repo_states });
        ctx.complete(Some(&final_state)).await?;
        info!(
            scanned = ctx.documents_scanned(),
            emitted = ctx.documents_emitted(),
            "GitHub sync completed"
        );
        Ok(())
    }
}

impl GitHubConnector {
    /// Which repos to walk, from explicit names, orgs and users; defaults to
    /// everything the token can see. Forks are filtered unless requested.
    async fn resolve_repos(
        &self,
        client: &GitHubClient,
        config: &SourceConfig,
        _username: &str,
    ) -> Result<Vec<Repo>, AppError> {
        let mut repos: Vec<Repo> = Vec::new();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        for spec in &config.repos {
            let Some((owner, name)) = spec.split_once('/') else {
                warn!(%spec, "ignoring malformed repo spec");
                continue;
            };
            match client.get_repo(owner, name).await {
                Ok(repo) => {
                    if seen.insert(repo.full_name.clone()) {
                        repos.push(repo);
                    }
                }
                Err(err) => warn!(%spec, error = %err, "failed to fetch repo"),
            }
        }

        for org in &config.orgs {
            for repo in client.list_repos_for_org(org).await? {
                if seen.insert(repo.full_name.clone()) {
                    repos.push(repo);
                }
            }
        }

        for user in &config.users {
            for repo in client.list_repos_for_user(user).await? {
                if seen.insert(repo.full_name.clone()) {
                    repos.push(repo);
                }
            }
        }

        if config.repos.is_empty() && config.orgs.is_empty() && config.users.is_empty() {
            for repo in client.list_repos_for_authenticated_user().await? {
                if seen.insert(repo.full_name.clone()) {
                    repos.push(repo);
                }
            }
        }

        if !config.include_forks {
            repos.retain(|repo| !repo.fork);
        }

        info!(count = repos.len(), "resolved repositories to sync");
        Ok(repos)
    }

    async fn sync_repo_document(
        &self,
        client: &GitHubClient,
        repo: &Repo,
        ctx: &SyncContext,
        docs_since_checkpoint: &mut usize,
    ) -> Result<(), AppError> {
        ctx.increment_scanned().await?;
        let result: Result<(), AppError> = async {
            let (owner, name) = repo
                .full_name
                .split_once('/')
                .ok_or_else(|| AppError::Validation("malformed repo name".into()))?;
            let readme = client.get_readme(owner, name).await;
            let content = generate_repo_content(repo, readme.as_deref());
            let content_id = ctx.save_content(&content, "text/plain").await?;
            ctx.emit(map_repo_to_document(repo, content_id)).await?;
            *docs_since_checkpoint += 1;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            let external_id = format!("github:repo:{}", repo.full_name);
            warn!(%external_id, error = %err, "error processing repo");
            ctx.emit_error(&external_id, &err.to_string());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_issues(
        &self,
        client: &GitHubClient,
        owner: &str,
        name: &str,
        repo: &Repo,
        since: Option<String>,
        ctx: &Arc<SyncContext>,
        docs_since_checkpoint: &mut usize,
        prev_state: &GitHubState,
        new_repo_states: &HashMap<String, RepoState>,
    ) -> Result<Option<String>, AppError> {
        let full_name = &repo.full_name;
        let mut latest = since.clone();
        let mut page = 1;

        loop {
            if ctx.is_cancelled() {
                return Err(self.bail_cancelled(ctx, prev_state, new_repo_states).await);
            }
            let rows = match client
                .list_issues_page(owner, name, since.as_deref(), page)
                .await
            {
                Ok(rows) => rows,
                Err(err) => {
                    error!(%full_name, error = %err, "error fetching issues");
                    ctx.emit_error(&format!("github:issue:{full_name}:*"), &err.to_string());
                    return Ok(latest);
                }
            };
            let raw_count = rows.len();

            for issue in rows.iter().filter(|issue| issue.pull_request.is_none()) {
                if ctx.is_cancelled() {
                    return Err(self.bail_cancelled(ctx, prev_state, new_repo_states).await);
                }
                ctx.increment_scanned().await?;
                match self.process_issue(client, owner, name, repo, issue, ctx).await {
                    Ok(()) => {
                        *docs_since_checkpoint += 1;
                        latest = max_watermark(latest, issue.updated_at.as_deref());
                    }
                    Err(err) => {
                        let external_id =
                            format!("github:issue:{full_name}#{}", issue.number);
                        warn!(%external_id, error = %err, "error processing issue");
                        ctx.emit_error(&external_id, &err.to_string());
                    }
                }
            }

            if raw_count < ITEMS_PER_PAGE {
                return Ok(latest);
            }
            page += 1;
        }
    }

    async fn process_issue(
        &self,
        client: &GitHubClient,
        owner: &str,
        name: &str,
        repo: &Repo,
        issue: &Issue,
        ctx: &SyncContext,
    ) -> Result<(), AppError> {
        let comments = client.list_issue_comments(owner, name, issue.number).await;
        let content = generate_issue_content(issue, &comments);
        let content_id = ctx.save_content(&content, "text/plain").await?;
        let document = map_issue_to_document(issue, content_id, &repo.full_name, repo.private);
        ctx.emit(document).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_pulls(
        &self,
        client: &GitHubClient,
        owner: &str,
        name: &str,
        repo: &Repo,
        since: Option<String>,
        ctx: &Arc<SyncContext>,
        docs_since_checkpoint: &mut usize,
        prev_state: &GitHubState,
        new_repo_states: &HashMap<String, RepoState>,
    ) -> Result<Option<String>, AppError> {
        let full_name = &repo.full_name;
        let mut latest = since.clone();
        let mut page = 1;

        loop {
            if ctx.is_cancelled() {
                return Err(self.bail_cancelled(ctx, prev_state, new_repo_states).await);
            }
            let pulls = match client.list_pulls_page(owner, name, page).await {
                Ok(pulls) => pulls,
                Err(err) => {
                    error!(%full_name, error = %err, "error fetching PRs");
                    ctx.emit_error(&format!("github:pr:{full_name}:*"), &err.to_string());
                    return Ok(latest);
                }
            };
            let raw_count = pulls.len();

            for pr in &pulls {
                // Pulls have no server-side `since`; rows are update-ordered
                // descending, so falling behind the watermark ends the walk
                if let (Some(since), Some(updated_at)) = (since.as_deref(), pr.updated_at.as_deref())
                {
                    if updated_at <= since {
                        return Ok(latest);
                    }
                }
                if ctx.is_cancelled() {
                    return Err(self.bail_cancelled(ctx, prev_state, new_repo_states).await);
                }
                ctx.increment_scanned().await?;
                match self.process_pull(client, owner, name, repo, pr, ctx).await {
                    Ok(()) => {
                        *docs_since_checkpoint += 1;
                        latest = max_watermark(latest, pr.updated_at.as_deref());
                    }
                    Err(err) => {
                        let external_id = format!("github:pr:{full_name}#{}", pr.number);
                        warn!(%external_id, error = %err, "error processing PR");
                        ctx.emit_error(&external_id, &err.to_string());
                    }
                }
            }

            if raw_count < ITEMS_PER_PAGE {
                return Ok(latest);
            }
            page += 1;
        }
    }

    async fn process_pull(
        &self,
        client: &GitHubClient,
        owner: &str,
        name: &str,
        repo: &Repo,
        pr: &Pull,
        ctx: &SyncContext,
    ) -> Result<(), AppError> {
        let issue_comments = client.list_pr_issue_comments(owner, name, pr.number).await;
        let review_comments = client.list_pr_review_comments(owner, name, pr.number).await;
        let content = generate_pr_content(pr, &issue_comments, &review_comments);
        let content_id = ctx.save_content(&content, "text/plain").await?;
        let document = map_pr_to_document(pr, content_id, &repo.full_name, repo.private);
        ctx.emit(document).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_discussions(
        &self,
        client: &GitHubClient,
        owner: &str,
        name: &str,
        repo: &Repo,
        since: Option<String>,
        ctx: &Arc<SyncContext>,
        docs_since_checkpoint: &mut usize,
        prev_state: &GitHubState,
        new_repo_states: &HashMap<String, RepoState>,
    ) -> Result<Option<String>, AppError> {
        let full_name = &repo.full_name;
        let mut latest = since.clone();
        let mut cursor: Option<String> = None;

        loop {
            if ctx.is_cancelled() {
                return Err(self.bail_cancelled(ctx, prev_state, new_repo_states).await);
            }
            let (nodes, next_cursor) = match client
                .list_discussions_page(owner, name, cursor.as_deref())
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    error!(%full_name, error = %err, "error fetching discussions");
                    ctx.emit_error(
                        &format!("github:discussion:{full_name}:*"),
                        &err.to_string(),
                    );
                    return Ok(latest);
                }
            };

            for discussion in &nodes {
                let updated_at = discussion["updatedAt"].as_str();
                if let (Some(since), Some(updated_at)) = (since.as_deref(), updated_at) {
                    if updated_at <= since {
                        return Ok(latest);
                    }
                }
                if ctx.is_cancelled() {
                    return Err(self.bail_cancelled(ctx, prev_state, new_repo_states).await);
                }
                ctx.increment_scanned().await?;
                let result: Result<(), AppError> = async {
                    let content = generate_discussion_content(discussion);
                    let content_id = ctx.save_content(&content, "text/plain").await?;
                    let document = map_discussion_to_document(
                        discussion,
                        content_id,
                        full_name,
                        repo.private,
                    );
                    ctx.emit(document).await
                }
                .await;
                match result {
                    Ok(()) => {
                        *docs_since_checkpoint += 1;
                        latest = max_watermark(latest, updated_at);
                    }
                    Err(err) => {
                        let number = discussion["number"].as_u64().unwrap_or(0);
                        let external_id = format!("github:discussion:{full_name}#{number}");
                        warn!(%external_id, error = %err, "error processing discussion");
                        ctx.emit_error(&external_id, &err.to_string());
                    }
                }
            }

            match next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(latest),
            }
        }
    }

    /// Persist the best state we have and surface cancellation.
    async fn bail_cancelled(
        &self,
        ctx: &SyncContext,
        prev_state: &GitHubState,
        new_repo_states: &HashMap<String, RepoState>,
    ) -> AppError {
        let state = snapshot(prev_state, new_repo_states);
        if let Err(err) = ctx.save_state(&state).await {
            warn!(error = %err, "failed to checkpoint state on cancellation");
        }
        AppError::Cancelled
    }
}

/// Previous state overlaid with this run's progress; used for checkpoints
/// and cancellation, where untouched repos must keep their watermarks.
fn snapshot(prev_state: &GitHubState, new_repo_states: &HashMap<String, RepoState>) -> Value {
    let mut merged = prev_state.repos.clone();
    for (repo, entry) in new_repo_states {
        merged.insert(repo.clone(), entry.clone());
    }
    json!({ "repos": merged })
}

/// Watermarks are RFC 3339 strings; lexicographic order is chronological.
fn max_watermark(current: Option<String>, candidate: Option<&str>) -> Option<String> {
    match (current, candidate) {
        (None, Some(candidate)) => Some(candidate.to_string()),
        (Some(current), Some(candidate)) if candidate > current.as_str() => {
            Some(candidate.to_string())
        }
        (current, _) => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarks_only_move_forward() {
        assert_eq!(
            max_watermark(None, Some("2024-01-01T00:00:00Z")),
            Some("2024-01-01T00:00:00Z".to_string())
        );
        assert_eq!(
            max_watermark(
                Some("2024-06-01T00:00:00Z".into()),
                Some("2024-01-01T00:00:00Z")
            ),
            Some("2024-06-01T00:00:00Z".to_string())
        );
        assert_eq!(
            max_watermark(
                Some("2024-01-01T00:00:00Z".into()),
                Some("2024-06-01T00:00:00Z")
            ),
            Some("2024-06-01T00:00:00Z".to_string())
        );
        assert_eq!(max_watermark(Some("x".into()), None), Some("x".to_string()));
    }

    #[test]
    fn snapshot_preserves_untouched_repo_watermarks() {
        let mut prev = GitHubState::default();
        prev.repos.insert(
            "acme/old".into(),
            RepoState {
                issues_updated_at: Some("2024-01-01T00:00:00Z".into()),
                ..Default::default()
            },
        );
        let mut fresh = HashMap::new();
        fresh.insert(
            "acme/new".into(),
            RepoState {
                issues_updated_at: Some("2024-06-01T00:00:00Z".into()),
                ..Default::default()
            },
        );

        let value = snapshot(&prev, &fresh);
        assert_eq!(
            value["repos"]["acme/old"]["issues_updated_at"],
            "2024-01-01T00:00:00Z"
        );
        assert_eq!(
            value["repos"]["acme/new"]["issues_updated_at"],
            "2024-06-01T00:00:00Z"
        );
    }

    #[test]
    fn source_config_defaults() {
        let config: SourceConfig = serde_json::from_value(json!({})).expect("parse");
        assert!(config.include_discussions);
        assert!(!config.include_forks);
        assert!(config.repos.is_empty());
    }
}
