//! Azure Resource Manager REST client with long-running operation polling.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::ClientOptions;
use crate::credential::{CredentialError, TokenCache};
use crate::resources::ResourceId;

const ASYNC_OPERATION: &str = "azure-asyncoperation";

pub type ArmResult<T> = Result<T, ArmError>;

#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    #[error("resource not found: {resource}: {message}")]
    NotFound { resource: String, message: String },
    #[error("management API error {status} {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },
    #[error("operation on {resource} ended {status}: {code}: {message}")]
    OperationFailed {
        resource: String,
        status: String,
        code: String,
        message: String,
    },
    #[error("operation on {resource} did not finish within {waited:?}")]
    Timeout { resource: String, waited: Duration },
    #[error("authentication failed: {0}")]
    Credential(#[from] CredentialError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArmError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// The management operations the engine needs. Mutating calls return once the
/// remote operation has finished.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn get(&self, id: &ResourceId, api_version: &str) -> ArmResult<Value>;

    async fn create_or_update(
        &self,
        id: &ResourceId,
        api_version: &str,
        body: &Value,
    ) -> ArmResult<Value>;

    async fn post_action(&self, id: &ResourceId, action: &str, api_version: &str) -> ArmResult<()>;

    async fn delete(&self, id: &ResourceId, api_version: &str) -> ArmResult<()>;
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct OperationStatus {
    status: String,
    #[serde(default)]
    error: Option<ErrorBody>,
}

fn is_terminal(state: &str) -> bool {
    matches!(
        state.to_ascii_lowercase().as_str(),
        "succeeded" | "failed" | "canceled" | "cancelled"
    )
}

fn provisioning_state(body: &Value) -> Option<&str> {
    body.pointer("/properties/provisioningState")
        .and_then(Value::as_str)
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Where to look for the outcome of an accepted request.
enum Poll {
    AsyncOperation(String),
    Location(String),
}

fn poll_target(headers: &HeaderMap) -> Option<Poll> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    header(ASYNC_OPERATION)
        .map(Poll::AsyncOperation)
        .or_else(|| header(LOCATION.as_str()).map(Poll::Location))
}

pub struct ArmClient {
    http: reqwest::Client,
    endpoint: String,
    tokens: TokenCache,
    options: ClientOptions,
}

impl ArmClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        tokens: TokenCache,
        options: ClientOptions,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
            options,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.endpoint, path, api_version)
    }

    /// Sends one request, retrying throttling and gateway errors.
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> ArmResult<reqwest::Response> {
        let mut attempts = 0;
        let mut delay = self.options.retry_delay;

        loop {
            let token = self.tokens.token().await?;
            let mut request = self.http.request(method.clone(), url).bearer_auth(&token);
            if let Some(body) = body {
                request = request.json(body);
            } else if method == Method::POST {
                // Actions are rejected without an explicit zero length.
                request = request.body(Vec::new());
            }
            let response = request.send().await?;
            let status = response.status();

            let retryable = matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS
                    | StatusCode::BAD_GATEWAY
                    | StatusCode::SERVICE_UNAVAILABLE
                    | StatusCode::GATEWAY_TIMEOUT
            );
            if retryable && attempts < self.options.max_retries {
                attempts += 1;
                let wait = retry_after(response.headers()).unwrap_or(delay);
                warn!(
                    "{} {} returned {}, retry {}/{} after {:?}",
                    method, url, status, attempts, self.options.max_retries, wait
                );
                tokio::time::sleep(wait).await;
                delay *= 2;
                continue;
            }

            return Ok(response);
        }
    }

    async fn error_from(resource: &str, response: reqwest::Response) -> ArmError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str::<ErrorEnvelope>(&text)
            .map(|envelope| envelope.error)
            .unwrap_or_else(|_| ErrorBody {
                code: status.to_string(),
                message: text,
            });

        let missing = matches!(
            body.code.as_str(),
            "ResourceNotFound" | "ResourceGroupNotFound" | "NotFound"
        );
        if status == StatusCode::NOT_FOUND || missing {
            return ArmError::NotFound {
                resource: resource.to_string(),
                message: body.message,
            };
        }
        ArmError::Api {
            status: status.as_u16(),
            code: body.code,
            message: body.message,
        }
    }

    async fn json_body(response: reqwest::Response) -> ArmResult<Value> {
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn wait_for(&self, response_headers: &HeaderMap) -> Duration {
        retry_after(response_headers).unwrap_or(self.options.poll_interval)
    }

    /// Follows an accepted request until it reaches a terminal state.
    async fn wait_until_done(
        &self,
        resource: &ResourceId,
        target: Poll,
        first_wait: Duration,
    ) -> ArmResult<()> {
        let deadline = Instant::now() + self.options.operation_timeout;
        let mut wait = first_wait;

        loop {
            if Instant::now() + wait > deadline {
                return Err(ArmError::Timeout {
                    resource: resource.to_string(),
                    waited: self.options.operation_timeout,
                });
            }
            tokio::time::sleep(wait).await;

            let url = match &target {
                Poll::AsyncOperation(url) | Poll::Location(url) => url.as_str(),
            };
            let response = self.send(Method::GET, url, None).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(Self::error_from(resource.as_str(), response).await);
            }
            wait = self.wait_for(response.headers());

            match &target {
                Poll::AsyncOperation(_) => {
                    let operation: OperationStatus = response.json().await?;
                    debug!(resource = %resource, status = %operation.status, "polled operation");
                    if !is_terminal(&operation.status) {
                        continue;
                    }
                    if operation.status.eq_ignore_ascii_case("succeeded") {
                        return Ok(());
                    }
                    let error = operation.error.unwrap_or_default();
                    return Err(ArmError::OperationFailed {
                        resource: resource.to_string(),
                        status: operation.status,
                        code: error.code,
                        message: error.message,
                    });
                }
                Poll::Location(_) => {
                    debug!(resource = %resource, status = %status, "polled location");
                    if status != StatusCode::ACCEPTED {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Polls the resource itself until its provisioning state is terminal.
    async fn wait_for_provisioning(
        &self,
        id: &ResourceId,
        api_version: &str,
        mut body: Value,
    ) -> ArmResult<Value> {
        let deadline = Instant::now() + self.options.operation_timeout;
        loop {
            let state = provisioning_state(&body).unwrap_or("Succeeded").to_string();
            if is_terminal(&state) {
                if state.eq_ignore_ascii_case("succeeded") {
                    return Ok(body);
                }
                return Err(ArmError::OperationFailed {
                    resource: id.to_string(),
                    status: state,
                    code: String::new(),
                    message: "provisioning did not succeed".to_string(),
                });
            }
            if Instant::now() + self.options.poll_interval > deadline {
                return Err(ArmError::Timeout {
                    resource: id.to_string(),
                    waited: self.options.operation_timeout,
                });
            }
            debug!(resource = %id, state = %state, "waiting for provisioning");
            tokio::time::sleep(self.options.poll_interval).await;
            body = self.get(id, api_version).await?;
        }
    }
}

#[async_trait]
impl ManagementApi for ArmClient {
    #[instrument(skip(self), fields(resource = %id))]
    async fn get(&self, id: &ResourceId, api_version: &str) -> ArmResult<Value> {
        let response = self
            .send(Method::GET, &self.url(id.as_str(), api_version), None)
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(id.as_str(), response).await);
        }
        Self::json_body(response).await
    }

    #[instrument(skip(self, body), fields(resource = %id))]
    async fn create_or_update(
        &self,
        id: &ResourceId,
        api_version: &str,
        body: &Value,
    ) -> ArmResult<Value> {
        let response = self
            .send(Method::PUT, &self.url(id.as_str(), api_version), Some(body))
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(id.as_str(), response).await);
        }

        if let Some(target) = poll_target(response.headers()) {
            let wait = self.wait_for(response.headers());
            self.wait_until_done(id, target, wait).await?;
            return self.get(id, api_version).await;
        }

        let created = Self::json_body(response).await?;
        if created.is_null() {
            return self.get(id, api_version).await;
        }
        self.wait_for_provisioning(id, api_version, created).await
    }

    #[instrument(skip(self), fields(resource = %id))]
    async fn post_action(&self, id: &ResourceId, action: &str, api_version: &str) -> ArmResult<()> {
        let path = format!("{}/{}", id, action);
        let response = self
            .send(Method::POST, &self.url(&path, api_version), None)
            .await?;
        if !response.status().is_success() {
            return Err(Self::error_from(id.as_str(), response).await);
        }
        if let Some(target) = poll_target(response.headers()) {
            let wait = self.wait_for(response.headers());
            self.wait_until_done(id, target, wait).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(resource = %id))]
    async fn delete(&self, id: &ResourceId, api_version: &str) -> ArmResult<()> {
        let response = self
            .send(Method::DELETE, &self.url(id.as_str(), api_version), None)
            .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::error_from(id.as_str(), response).await);
        }
        if let Some(target) = poll_target(response.headers()) {
            let wait = self.wait_for(response.headers());
            self.wait_until_done(id, target, wait).await?;
        }
        Ok(())
    }
}
