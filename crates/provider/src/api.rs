//! REST API client for the generation provider.
//!
//! Wraps the provider's HTTP endpoints (job submission and status lookup)
//! using [`reqwest`]. The API key is an opaque bearer token supplied by the
//! caller on every request.

use std::time::Duration;

use async_trait::async_trait;
use kiln_core::polling::{FailureKind, RemoteStatus};
use serde::{Deserialize, Serialize};

/// Body of a job submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitRequest {
    pub prompt: String,
    pub model: String,
    /// Reference image URL or data URI for image-to-image / image-to-video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Requested clip length in seconds for video models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
}

/// Response returned by the provider after accepting a job.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitResponse {
    #[serde(alias = "taskId")]
    pub task_id: String,
}

/// A well-formed status response.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TaskStatusResponse {
    /// `pending`, `success`, `fail` (plus provider-specific running words).
    pub status: String,
    /// Present once the job succeeded.
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    /// Provider's explanation for a failed job.
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}

impl TaskStatusResponse {
    pub fn remote_status(&self) -> RemoteStatus {
        RemoteStatus::parse(&self.status)
    }
}

/// Errors from the provider REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ProviderApiError {
    /// The HTTP request itself failed (network, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The provider returned a non-2xx status code.
    #[error("Provider API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The body of a 2xx response could not be understood.
    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderApiError {
    /// Classify this error for the poll loop.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ApiError { status, .. } => FailureKind::from_http_status(*status),
            Self::Request(e) => match e.status() {
                Some(status) => FailureKind::from_http_status(status.as_u16()),
                None => FailureKind::Transient,
            },
            Self::Malformed(_) => FailureKind::Transient,
        }
    }
}

/// The two provider operations the supervisor depends on.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submit a job and return the provider's task id.
    async fn submit(&self, request: &SubmitRequest, api_key: &str) -> Result<String, ProviderApiError>;

    /// Fetch the current status of a task.
    async fn fetch_status(
        &self,
        task_id: &str,
        api_key: &str,
    ) -> Result<TaskStatusResponse, ProviderApiError>;
}

/// HTTP client for the generation provider.
pub struct ProviderApi {
    client: reqwest::Client,
    base_url: String,
}

impl ProviderApi {
    /// Create a client for `base_url` (e.g. `https://api.provider.example`)
    /// with the given per-request timeout.
    pub fn new(base_url: String, request_timeout: Duration) -> Result<Self, ProviderApiError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code, otherwise capture the
    /// status and body in a [`ProviderApiError::ApiError`].
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ProviderApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ProviderApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON body, reporting decode failures as
    /// [`ProviderApiError::Malformed`] rather than transport errors.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderApiError> {
        let response = Self::ensure_success(response).await?;
        let text = response.text().await?;
        serde_json::from_str::<T>(&text).map_err(|e| ProviderApiError::Malformed(format!("{e}: {text}")))
    }
}

#[async_trait]
impl GenerationProvider for ProviderApi {
    /// `POST /v1/tasks` with the job payload.
    async fn submit(&self, request: &SubmitRequest, api_key: &str) -> Result<String, ProviderApiError> {
        let response = self
            .client
            .post(format!("{}/v1/tasks", self.base_url))
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await?;

        let parsed: SubmitResponse = Self::parse_response(response).await?;
        if parsed.task_id.trim().is_empty() {
            return Err(ProviderApiError::Malformed(
                "submission returned an empty task id".to_string(),
            ));
        }
        Ok(parsed.task_id)
    }

    /// `GET /v1/tasks/{task_id}`.
    async fn fetch_status(
        &self,
        task_id: &str,
        api_key: &str,
    ) -> Result<TaskStatusResponse, ProviderApiError> {
        let response = self
            .client
            .get(format!("{}/v1/tasks/{}", self.base_url, task_id))
            .bearer_auth(api_key)
            .send()
            .await?;

        Self::parse_response(response).await
    }
}
