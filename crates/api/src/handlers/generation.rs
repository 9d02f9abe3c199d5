//! Handlers for remote generation jobs: submit, then wait.

use std::time::Duration;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use kiln_core::error::CoreError;
use kiln_core::polling::{validate_task_id, PollConfig};
use kiln_provider::{poll_task, SubmitRequest};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub prompt: String,
    pub model: String,
    pub image: Option<String>,
    /// Clip length in seconds for video models.
    pub duration: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

/// Optional per-call overrides of the configured poll budget.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitQuery {
    pub interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub max_error_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitTaskResponse {
    pub task_id: String,
    pub result: serde_json::Value,
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /generation/tasks
///
/// Submit a job to the provider and return its task id without waiting.
pub async fn submit_task(
    State(state): State<AppState>,
    payload: Result<Json<SubmitTaskRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<DataResponse<SubmitTaskResponse>>)> {
    let Json(body) = payload.map_err(|e| AppError::BadRequest(e.body_text()))?;
    let api_key = require_api_key(&state)?;

    if body.prompt.trim().is_empty() {
        return Err(CoreError::Validation("prompt must not be empty".to_string()).into());
    }
    if body.model.trim().is_empty() {
        return Err(CoreError::Validation("model must not be empty".to_string()).into());
    }
    if body.duration == Some(0) {
        return Err(CoreError::Validation("duration must be at least 1 second".to_string()).into());
    }

    let request = SubmitRequest {
        prompt: body.prompt,
        model: body.model,
        image: body.image.filter(|s| !s.trim().is_empty()),
        duration: body.duration,
    };
    let task_id = state.provider.submit(&request, api_key).await?;
    tracing::info!(task_id = %task_id, model = %request.model, "Generation task submitted");

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: SubmitTaskResponse { task_id },
        }),
    ))
}

/// POST /generation/tasks/{task_id}/wait
///
/// Poll the task until it succeeds, fails, or the budget runs out. The loop
/// stops as soon as the client disconnects or the server shuts down.
pub async fn wait_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    query: Result<Query<WaitQuery>, QueryRejection>,
) -> AppResult<Json<DataResponse<WaitTaskResponse>>> {
    let Query(query) = query.map_err(|e| AppError::BadRequest(e.body_text()))?;
    validate_task_id(&task_id)?;
    let api_key = require_api_key(&state)?;
    let config = effective_poll_config(state.poll_config, &query, state.config.request_timeout())?;

    let cancel = state.shutdown.child_token();
    let _disconnect_guard = cancel.clone().drop_guard();

    let outcome = poll_task(state.provider.as_ref(), &task_id, api_key, &config, &cancel).await?;

    Ok(Json(DataResponse {
        data: WaitTaskResponse {
            task_id: outcome.task_id,
            result: outcome.result,
            attempts: outcome.attempts,
        },
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn require_api_key(state: &AppState) -> Result<&str, CoreError> {
    let key = state.config.provider.api_key.as_str();
    if key.trim().is_empty() {
        return Err(CoreError::Unauthorized(
            "The generation provider API key is not configured".to_string(),
        ));
    }
    Ok(key)
}

/// Apply query overrides to the configured poll budget. The result must
/// finish inside `request_timeout` so the caller gets a typed outcome rather
/// than a bare 408.
fn effective_poll_config(
    base: PollConfig,
    query: &WaitQuery,
    request_timeout: Duration,
) -> Result<PollConfig, CoreError> {
    let config = PollConfig {
        interval: query
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(base.interval),
        max_attempts: query.max_attempts.unwrap_or(base.max_attempts),
        max_error_retries: query.max_error_retries.unwrap_or(base.max_error_retries),
        retry_server_errors: base.retry_server_errors,
    };
    config.validate()?;
    if config.budget() >= request_timeout {
        return Err(CoreError::Validation(format!(
            "poll budget of {}ms (intervalMs x maxAttempts) must be below the {}s request timeout",
            config.budget().as_millis(),
            request_timeout.as_secs(),
        )));
    }
    Ok(config)
}
