use common::error::AppError;
use serde_json::Value;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
const DEFAULT_LOGIN_BASE: &str = "https://login.microsoftonline.com";

/// App-only authentication against Microsoft Entra ID using the client
/// credentials flow. A pre-issued static token is accepted for testing and
/// for deployments that manage tokens externally.
pub struct MsGraphAuth {
    http: reqwest::Client,
    login_base: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    static_token: Option<String>,
}

impl MsGraphAuth {
    pub fn from_credentials(credentials: &Value) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        if let Some(token) = credentials.get("token").and_then(Value::as_str) {
            return Ok(Self {
                http,
                login_base: DEFAULT_LOGIN_BASE.to_string(),
                tenant_id: String::new(),
                client_id: String::new(),
                client_secret: String::new(),
                static_token: Some(token.to_string()),
            });
        }

        let field = |name: &str| {
            credentials
                .get(name)
                .and_then(Value::as_str)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        match (field("tenant_id"), field("client_id"), field("client_secret")) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Ok(Self {
                http,
                login_base: credentials
                    .get("login_base")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_LOGIN_BASE)
                    .trim_end_matches('/')
                    .to_string(),
                tenant_id,
                client_id,
                client_secret,
                static_token: None,
            }),
            _ => Err(AppError::Auth(
                "Missing required credentials: tenant_id, client_id, client_secret".into(),
            )),
        }
    }

    /// A valid access token; client-credential tokens are re-requested on
    /// every call, Entra handles server-side caching.
    pub async fn get_token(&self) -> Result<String, AppError> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }

        let response = self
            .http
            .post(format!(
                "{}/{}/oauth2/v2.0/token",
                self.login_base, self.tenant_id
            ))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", GRAPH_SCOPE),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Auth(format!(
                "token request failed ({status}): {body}"
            )));
        }

        let body: Value = response.json().await?;
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AppError::Auth("token response missing access_token".into()))
    }
}
