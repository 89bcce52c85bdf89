use std::time::Duration;

use common::error::AppError;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::auth::MsGraphAuth;

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_RETRY_AFTER_SECS: u64 = 10;

/// One page of a delta walk: the changed items plus either a next-page link
/// or the delta link to persist for the following sync.
#[derive(Debug, Default)]
struct DeltaPage {
    items: Vec<Value>,
    next_link: Option<String>,
    delta_link: Option<String>,
}

/// Async client for Microsoft Graph v1.0.
///
/// Retry ladder: 401 refreshes the token once then fails, 404 surfaces,
/// 429 honors `Retry-After`, 5xx and network errors back off exponentially
/// with a bounded attempt count.
pub struct GraphClient {
    http: reqwest::Client,
    auth: MsGraphAuth,
    token: RwLock<String>,
    base_url: String,
}

impl GraphClient {
    pub async fn new(auth: MsGraphAuth, base_url: Option<&str>) -> Result<Self, AppError> {
        let token = auth.get_token().await?;
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .connect_timeout(Duration::from_secs(10))
                .pool_max_idle_per_host(10)
                .build()?,
            auth,
            token: RwLock::new(token),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Validate credentials by reading the organization object.
    pub async fn test_connection(&self) -> Result<(), AppError> {
        self.get("/organization", &[("$select", "id,displayName")])
            .await?;
        Ok(())
    }

    /// Every user in the tenant.
    pub async fn list_users(&self) -> Result<Vec<Value>, AppError> {
        let mut users = Vec::new();
        let mut url = self.absolute("/users");
        let mut params: Option<Vec<(String, String)>> = Some(vec![(
            "$select".to_string(),
            "id,displayName,mail,userPrincipalName".to_string(),
        )]);

        loop {
            let data = self.get_url(&url, params.take()).await?;
            if let Some(batch) = data.get("value").and_then(Value::as_array) {
                users.extend(batch.iter().cloned());
            }
            match data.get("@odata.nextLink").and_then(Value::as_str) {
                Some(next) => url = next.to_string(),
                None => return Ok(users),
            }
        }
    }

    /// Execute a delta query, following all pages.
    ///
    /// With `delta_token = None` the walk is a full snapshot; with a token
    /// from an earlier run only changes since that point come back, deletes
    /// as `@removed` tombstones. Returns the items and the new delta token.
    pub async fn get_delta(
        &self,
        path: &str,
        delta_token: Option<&str>,
        select: Option<&str>,
    ) -> Result<(Vec<Value>, Option<String>), AppError> {
        // A delta token is an absolute URL with everything baked in
        let mut url = match delta_token {
            Some(token) => token.to_string(),
            None => self.absolute(path),
        };
        let mut params: Option<Vec<(String, String)>> = match (delta_token, select) {
            (None, Some(select)) => Some(vec![("$select".to_string(), select.to_string())]),
            _ => None,
        };

        let mut items = Vec::new();
        loop {
            let page = self.delta_page(&url, params.take()).await?;
            items.extend(page.items);
            match page.next_link {
                Some(next) => url = next,
                None => return Ok((items, page.delta_link)),
            }
        }
    }

    async fn delta_page(
        &self,
        url: &str,
        params: Option<Vec<(String, String)>>,
    ) -> Result<DeltaPage, AppError> {
        let data = self.get_url(url, params).await?;
        Ok(DeltaPage {
            items: data
                .get("value")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            next_link: data
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string),
            delta_link: data
                .get("@odata.deltaLink")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, AppError> {
        let params: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        self.get_url(&self.absolute(path), Some(params)).await
    }

    /// Download raw content (file bodies).
    pub async fn get_binary(&self, path: &str) -> Result<Vec<u8>, AppError> {
        let url = self.absolute(path);
        let response = self.send_with_retry(&url, None, true).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn get_url(
        &self,
        url: &str,
        params: Option<Vec<(String, String)>>,
    ) -> Result<Value, AppError> {
        let response = self.send_with_retry(url, params, false).await?;
        Ok(response.json().await?)
    }

    async fn send_with_retry(
        &self,
        url: &str,
        params: Option<Vec<(String, String)>>,
        follow_redirects: bool,
    ) -> Result<reqwest::Response, AppError> {
        let mut attempt: u32 = 0;
        let mut auth_retried = false;

        loop {
            let token = self.token.read().await.clone();
            let mut request = self.http.get(url).bearer_auth(token);
            if let Some(params) = &params {
                request = request.query(params);
            }
            if follow_redirects {
                request = request.header(reqwest::header::ACCEPT, "*/*");
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::TransientApi(format!(
                            "graph: request failed after {MAX_RETRIES} attempts: {err}"
                        )));
                    }
                    warn!(error = %err, attempt, "graph request error, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
            };

            let status = response.status().as_u16();
            match status {
                code if (200..300).contains(&code) => return Ok(response),
                401 => {
                    if auth_retried {
                        return Err(AppError::Auth(
                            "graph: authentication failed after token refresh".into(),
                        ));
                    }
                    auth_retried = true;
                    warn!("graph returned 401, refreshing token");
                    let fresh = self.auth.get_token().await?;
                    *self.token.write().await = fresh;
                }
                404 => return Err(AppError::NotFound("graph: resource not found".into())),
                429 => {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                    warn!(retry_after, "graph rate limited, waiting");
                    tokio::time::sleep(Duration::from_secs(retry_after)).await;
                }
                code if code >= 500 => {
                    attempt += 1;
                    let body = response.text().await.unwrap_or_default();
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::Api {
                            status: code,
                            message: format!("graph: {body}"),
                        });
                    }
                    warn!(status = code, attempt, "graph server error, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                code => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(AppError::Api {
                        status: code,
                        message: format!("graph: {body}"),
                    });
                }
            }
        }
    }

    fn absolute(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{path}", self.base_url)
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BASE_DELAY_MS.saturating_mul(1 << (attempt.saturating_sub(1))))
}
