//! Bearer token acquisition for the management API.
//!
//! [`DefaultCredential`] tries a service principal from the environment, then
//! the instance metadata service, then the Azure CLI, and keeps using the first
//! source that yields a token.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::config::{ServicePrincipal, Settings};

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("token request to {endpoint} failed: {message}")]
    Request { endpoint: String, message: String },
    #[error("failed to parse token response: {0}")]
    Parse(String),
    #[error("azure cli failed: {0}")]
    Cli(String),
    #[error("no credential source produced a token: {}", .0.join("; "))]
    Unavailable(Vec<String>),
}

#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// True if the token expires within `grace_period`.
    pub fn is_expired(&self, grace_period: Duration) -> bool {
        Utc::now() + grace_period >= self.expires_at
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[async_trait]
pub trait TokenCredential: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError>;
}

/// Reuses a token until shortly before it expires.
pub struct TokenCache {
    credential: Box<dyn TokenCredential>,
    scope: String,
    cached: RwLock<Option<AccessToken>>,
    grace_period: Duration,
}

impl TokenCache {
    pub fn new(credential: Box<dyn TokenCredential>, scope: impl Into<String>) -> Self {
        Self {
            credential,
            scope: scope.into(),
            cached: RwLock::new(None),
            grace_period: Duration::minutes(5),
        }
    }

    #[instrument(skip(self), fields(scope = %self.scope))]
    pub async fn token(&self) -> Result<String, CredentialError> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref()
                && !token.is_expired(self.grace_period)
            {
                return Ok(token.token.clone());
            }
        }

        debug!(source = self.credential.name(), "refreshing access token");
        let fresh = self.credential.get_token(&self.scope).await?;
        let value = fresh.token.clone();
        *self.cached.write().await = Some(fresh);
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    expires_in: NumberOrString,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

impl NumberOrString {
    fn as_i64(&self) -> Result<i64, CredentialError> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::String(value) => value
                .parse()
                .map_err(|_| CredentialError::Parse(format!("invalid expires_in: {value}"))),
        }
    }
}

impl OAuthTokenResponse {
    fn into_access_token(self) -> Result<AccessToken, CredentialError> {
        let expires_in = self.expires_in.as_i64()?;
        let expires_at = Duration::try_seconds(expires_in)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
            .ok_or_else(|| CredentialError::Parse(format!("expires_in out of range: {expires_in}")))?;
        Ok(AccessToken {
            token: self.access_token,
            expires_at,
        })
    }
}

async fn read_token_response(
    endpoint: &str,
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<AccessToken, CredentialError> {
    let response = response.map_err(|err| CredentialError::Request {
        endpoint: endpoint.to_string(),
        message: err.to_string(),
    })?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CredentialError::Request {
            endpoint: endpoint.to_string(),
            message: format!("status {status}: {body}"),
        });
    }
    let parsed: OAuthTokenResponse = response
        .json()
        .await
        .map_err(|err| CredentialError::Parse(err.to_string()))?;
    parsed.into_access_token()
}

/// OAuth2 client-credentials flow for a service principal.
pub struct ClientSecretCredential {
    http: reqwest::Client,
    authority: String,
    tenant_id: String,
    client_id: String,
    client_secret: SecretString,
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        authority: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: SecretString,
    ) -> Self {
        Self {
            http,
            authority: authority.into(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    pub fn from_principal(http: reqwest::Client, authority: &str, principal: &ServicePrincipal) -> Self {
        Self::new(
            http,
            authority,
            principal.tenant_id.clone(),
            principal.client_id.clone(),
            SecretString::from(principal.client_secret.expose_secret().to_string()),
        )
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }
}

#[async_trait]
impl TokenCredential for ClientSecretCredential {
    fn name(&self) -> &'static str {
        "client secret"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let url = self.token_url();
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("scope", scope),
        ];
        let response = self.http.post(&url).form(&params).send().await;
        read_token_response(&url, response).await
    }
}

/// Token from the instance metadata service of the VM this runs on.
pub struct ManagedIdentityCredential {
    http: reqwest::Client,
    endpoint: String,
    client_id: Option<String>,
}

impl ManagedIdentityCredential {
    pub fn new(http: reqwest::Client, client_id: Option<String>) -> Self {
        Self::with_endpoint(http, IMDS_ENDPOINT, client_id)
    }

    pub fn with_endpoint(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        client_id: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            client_id,
        }
    }
}

#[async_trait]
impl TokenCredential for ManagedIdentityCredential {
    fn name(&self) -> &'static str {
        "managed identity"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let resource = scope_to_resource(scope);
        let mut query = vec![("api-version", IMDS_API_VERSION), ("resource", resource)];
        if let Some(client_id) = self.client_id.as_deref() {
            query.push(("client_id", client_id));
        }
        let response = self
            .http
            .get(&self.endpoint)
            .query(&query)
            .header("Metadata", "true")
            .timeout(StdDuration::from_secs(5))
            .send()
            .await;
        read_token_response(&self.endpoint, response).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliTokenOutput {
    access_token: String,
    expires_on: Option<String>,
    #[serde(rename = "expires_on")]
    expires_on_epoch: Option<i64>,
}

/// Parses the JSON printed by `az account get-access-token`.
pub fn parse_cli_token(output: &str) -> Result<AccessToken, CredentialError> {
    let parsed: CliTokenOutput =
        serde_json::from_str(output).map_err(|err| CredentialError::Parse(err.to_string()))?;

    let expires_at = match (parsed.expires_on_epoch, parsed.expires_on.as_deref()) {
        (Some(epoch), _) => DateTime::from_timestamp(epoch, 0)
            .ok_or_else(|| CredentialError::Parse(format!("invalid expires_on: {epoch}")))?,
        (None, Some(local)) => {
            let naive = NaiveDateTime::parse_from_str(local, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|err| CredentialError::Parse(format!("invalid expiresOn {local}: {err}")))?;
            Local
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| CredentialError::Parse(format!("ambiguous expiresOn: {local}")))?
                .with_timezone(&Utc)
        }
        (None, None) => return Err(CredentialError::Parse("missing token expiry".to_string())),
    };

    Ok(AccessToken {
        token: parsed.access_token,
        expires_at,
    })
}

/// Token from a logged-in Azure CLI.
#[derive(Debug, Default)]
pub struct AzureCliCredential;

#[async_trait]
impl TokenCredential for AzureCliCredential {
    fn name(&self) -> &'static str {
        "azure cli"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        let program = if cfg!(windows) { "az.cmd" } else { "az" };
        let output = tokio::process::Command::new(program)
            .args([
                "account",
                "get-access-token",
                "--resource",
                scope_to_resource(scope),
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|err| CredentialError::Cli(err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CredentialError::Cli(stderr.trim().to_string()));
        }
        parse_cli_token(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Ordered chain of credential sources.
pub struct DefaultCredential {
    sources: Vec<Box<dyn TokenCredential>>,
    selected: Mutex<Option<usize>>,
}

impl DefaultCredential {
    pub fn new(sources: Vec<Box<dyn TokenCredential>>) -> Self {
        Self {
            sources,
            selected: Mutex::new(None),
        }
    }

    pub fn from_settings(http: reqwest::Client, settings: &Settings) -> Self {
        let mut sources: Vec<Box<dyn TokenCredential>> = Vec::new();
        if let Some(principal) = settings.service_principal.as_ref() {
            sources.push(Box::new(ClientSecretCredential::from_principal(
                http.clone(),
                &settings.cloud.login,
                principal,
            )));
        }
        sources.push(Box::new(ManagedIdentityCredential::new(
            http,
            settings.managed_identity_client_id.clone(),
        )));
        sources.push(Box::new(AzureCliCredential));
        Self::new(sources)
    }

    /// Names of the configured sources, in the order they are tried.
    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|source| source.name()).collect()
    }

    fn selected(&self) -> Option<usize> {
        self.selected.lock().ok().and_then(|guard| *guard)
    }

    fn select(&self, index: usize) {
        if let Ok(mut guard) = self.selected.lock() {
            *guard = Some(index);
        }
    }
}

#[async_trait]
impl TokenCredential for DefaultCredential {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn get_token(&self, scope: &str) -> Result<AccessToken, CredentialError> {
        if let Some(index) = self.selected() {
            return self.sources[index].get_token(scope).await;
        }

        let mut failures = Vec::new();
        for (index, source) in self.sources.iter().enumerate() {
            match source.get_token(scope).await {
                Ok(token) => {
                    info!(source = source.name(), "authenticated");
                    self.select(index);
                    return Ok(token);
                }
                Err(err) => {
                    debug!(source = source.name(), error = %err, "credential source unavailable");
                    failures.push(format!("{}: {err}", source.name()));
                }
            }
        }
        Err(CredentialError::Unavailable(failures))
    }
}

fn scope_to_resource(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}
