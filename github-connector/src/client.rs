use std::time::Duration;

use base64::Engine;
use common::error::AppError;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::{DISCUSSIONS_QUERY, ITEMS_PER_PAGE, MAX_COMMENT_COUNT};

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const PAGE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_RETRY_AFTER_SECS: u64 = 10;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Actor {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Milestone {
    pub title: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repo {
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub owner: Option<Actor>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub assignee: Option<Actor>,
    #[serde(default)]
    pub milestone: Option<Milestone>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    /// Present when the "issue" is actually a pull request.
    #[serde(default)]
    pub pull_request: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pull {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub draft: Option<bool>,
    #[serde(default)]
    pub merged_at: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Comment {
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub body: Option<String>,
    /// Set on review comments: the file the comment is attached to.
    #[serde(default)]
    pub path: Option<String>,
}

/// Thin REST/GraphQL client exposing the operations the connector needs.
///
/// Page-level calls let the sync loop poll cancellation between pages.
pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl GitHubClient {
    pub fn new(token: &str, base_url: Option<&str>) -> Result<Self, AppError> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(PAGE_TIMEOUT)
                .user_agent("knowledge-backbone-github-connector")
                .pool_max_idle_per_host(10)
                .build()?,
            token: token.to_string(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Validate the token by fetching the authenticated user; returns the
    /// login name.
    pub async fn validate_token(&self) -> Result<String, AppError> {
        let user: Value = self.get_json("/user", &[]).await.map_err(|err| match err {
            AppError::Auth(_) => AppError::Auth("Invalid or expired token".into()),
            err => err,
        })?;
        user.get("login")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::InternalError("github: /user response missing login".into()))
    }

    pub async fn get_repo(&self, owner: &str, repo: &str) -> Result<Repo, AppError> {
        self.get_typed(&format!("/repos/{owner}/{repo}"), &[]).await
    }

    /// README body, or `None` when the repo has none.
    pub async fn get_readme(&self, owner: &str, repo: &str) -> Option<String> {
        let response: Result<Value, AppError> =
            self.get_json(&format!("/repos/{owner}/{repo}/readme"), &[]).await;
        match response {
            Ok(body) => {
                let content = body.get("content")?.as_str()?.replace(['\n', '\r'], "");
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .ok()?;
                Some(String::from_utf8_lossy(&decoded).into_owned())
            }
            Err(AppError::NotFound(_)) => None,
            Err(err) => {
                warn!(error = %err, "failed to fetch readme");
                None
            }
        }
    }

    pub async fn list_repos_for_org(&self, org: &str) -> Result<Vec<Repo>, AppError> {
        self.collect_pages(&format!("/orgs/{org}/repos"), &[]).await
    }

    pub async fn list_repos_for_user(&self, username: &str) -> Result<Vec<Repo>, AppError> {
        self.collect_pages(&format!("/users/{username}/repos"), &[])
            .await
    }

    pub async fn list_repos_for_authenticated_user(&self) -> Result<Vec<Repo>, AppError> {
        self.collect_pages("/user/repos", &[]).await
    }

    /// One page of issues ordered by `updated` descending. `since` is
    /// forwarded to the API. Rows that are really pull requests come through
    /// with `pull_request` set; callers filter them but judge page fullness
    /// on the raw row count.
    pub async fn list_issues_page(
        &self,
        owner: &str,
        repo: &str,
        since: Option<&str>,
        page: usize,
    ) -> Result<Vec<Issue>, AppError> {
        let page_param = page.to_string();
        let per_page = ITEMS_PER_PAGE.to_string();
        let mut params = vec![
            ("state", "all"),
            ("sort", "updated"),
            ("direction", "desc"),
            ("per_page", per_page.as_str()),
            ("page", page_param.as_str()),
        ];
        if let Some(since) = since {
            params.push(("since", since));
        }
        self.get_typed(&format!("/repos/{owner}/{repo}/issues"), &params)
            .await
    }

    pub async fn list_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Vec<Comment> {
        self.collect_comments(&format!("/repos/{owner}/{repo}/issues/{number}/comments"))
            .await
    }

    /// One page of pull requests ordered by `updated` descending. The API has
    /// no `since` filter for pulls; callers stop paging once rows fall behind
    /// their watermark.
    pub async fn list_pulls_page(
        &self,
        owner: &str,
        repo: &str,
        page: usize,
    ) -> Result<Vec<Pull>, AppError> {
        let page_param = page.to_string();
        let per_page = ITEMS_PER_PAGE.to_string();
        let params = vec![
            ("state", "all"),
            ("sort", "updated"),
            ("direction", "desc"),
            ("per_page", per_page.as_str()),
            ("page", page_param.as_str()),
        ];
        self.get_typed(&format!("/repos/{owner}/{repo}/pulls"), &params)
            .await
    }

    pub async fn list_pr_issue_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Vec<Comment> {
        self.collect_comments(&format!("/repos/{owner}/{repo}/issues/{number}/comments"))
            .await
    }

    pub async fn list_pr_review_comments(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Vec<Comment> {
        self.collect_comments(&format!("/repos/{owner}/{repo}/pulls/{number}/comments"))
            .await
    }

    /// One GraphQL page of discussions ordered by update time descending.
    /// Returns the nodes and the cursor for the next page, if any.
    pub async fn list_discussions_page(
        &self,
        owner: &str,
        repo: &str,
        cursor: Option<&str>,
    ) -> Result<(Vec<Value>, Option<String>), AppError> {
        let payload = json!({
            "query": DISCUSSIONS_QUERY,
            "variables": {"owner": owner, "name": repo, "cursor": cursor},
        });
        let response: Value = self.post_json("/graphql", &payload).await?;

        let discussions = &response["data"]["repository"]["discussions"];
        let nodes = discussions["nodes"].as_array().cloned().unwrap_or_default();
        let next_cursor = if discussions["pageInfo"]["hasNextPage"]
            .as_bool()
            .unwrap_or(false)
        {
            discussions["pageInfo"]["endCursor"]
                .as_str()
                .map(str::to_string)
        } else {
            None
        };
        Ok((nodes, next_cursor))
    }

    async fn collect_comments(&self, path: &str) -> Vec<Comment> {
        let mut comments: Vec<Comment> = Vec::new();
        let mut page = 1;
        loop {
            let per_page = ITEMS_PER_PAGE.to_string();
            let page_param = page.to_string();
            let params = vec![
                ("per_page", per_page.as_str()),
                ("page", page_param.as_str()),
            ];
            let batch: Result<Vec<Comment>, AppError> = self.get_typed(path, &params).await;
            match batch {
                Ok(batch) => {
                    let len = batch.len();
                    comments.extend(batch);
                    if comments.len() >= MAX_COMMENT_COUNT || len < ITEMS_PER_PAGE {
                        comments.truncate(MAX_COMMENT_COUNT);
                        return comments;
                    }
                    page += 1;
                }
                Err(err) => {
                    // Comments are additive context; their loss is not fatal
                    warn!(path, error = %err, "failed to fetch comments");
                    return comments;
                }
            }
        }
    }

    async fn collect_pages(&self, path: &str, params: &[(&str, &str)]) -> Result<Vec<Repo>, AppError> {
        let mut repos = Vec::new();
        let mut page = 1;
        loop {
            let per_page = ITEMS_PER_PAGE.to_string();
            let page_param = page.to_string();
            let mut page_params: Vec<(&str, &str)> = params.to_vec();
            page_params.push(("per_page", per_page.as_str()));
            page_params.push(("page", page_param.as_str()));
            let batch: Vec<Repo> = self.get_typed(path, &page_params).await?;
            let len = batch.len();
            repos.extend(batch);
            if len < ITEMS_PER_PAGE {
                return Ok(repos);
            }
            page += 1;
        }
    }

    async fn get_typed<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, AppError> {
        let value = self.get_json(path, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn get_json(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, AppError> {
        self.request_with_retry(|| {
            self.http
                .get(format!("{}{path}", self.base_url))
                .query(params)
                .bearer_auth(&self.token)
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        })
        .await
    }

    async fn post_json(&self, path: &str, payload: &Value) -> Result<Value, AppError> {
        self.request_with_retry(|| {
            self.http
                .post(format!("{}{path}", self.base_url))
                .bearer_auth(&self.token)
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .json(payload)
        })
        .await
    }

    /// Same ladder as the embedding providers: 401/404 surface immediately,
    /// 429 waits out `Retry-After`, 5xx and network errors get bounded
    /// exponential backoff.
    async fn request_with_retry<F>(&self, build_request: F) -> Result<Value, AppError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let response = match build_request().send().await {
                Ok(response) => response,
                Err(err) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::TransientApi(format!(
                            "github: request failed after {MAX_RETRIES} attempts: {err}"
                        )));
                    }
                    warn!(error = %err, attempt, "github request error, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            };

            let status = response.status().as_u16();
            match status {
                code if (200..300).contains(&code) => return Ok(response.json().await?),
                401 => return Err(AppError::Auth("github: invalid or expired token".into())),
                404 => return Err(AppError::NotFound("github: resource not found".into())),
                429 => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                    warn!(retry_after, "github rate limited, waiting");
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                }
                code if code >= 500 => {
                    attempt += 1;
                    let body = response.text().await.unwrap_or_default();
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::Api {
                            status: code,
                            message: format!("github: {body}"),
                        });
                    }
                    warn!(status = code, attempt, "github server error, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                code => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(AppError::Api {
                        status: code,
                        message: format!("github: {body}"),
                    });
                }
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(1 << (attempt.saturating_sub(1))))
}
