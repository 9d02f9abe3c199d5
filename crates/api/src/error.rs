use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kiln_core::error::CoreError;
use kiln_core::polling::AbortReason;
use kiln_provider::{PollError, ProviderApiError};
use kiln_relay::RelayError;
use serde::Serialize;
use serde_json::{json, Value};

/// Application-level error type for HTTP handlers.
///
/// Wraps the domain errors of each crate and implements [`IntoResponse`] to
/// produce `{ code, message, details?, hint? }` bodies with a distinct status
/// and `code` per failure mode.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Transcoding session start failures.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Terminal failures of a generation wait.
    #[error(transparent)]
    Poll(#[from] PollError),

    /// Provider failures outside the poll loop (submission).
    #[error(transparent)]
    Provider(#[from] ProviderApiError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

/// JSON error body.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl ErrorBody {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            hint: None,
        }
    }

    fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn hint(mut self, hint: Option<&str>) -> Self {
        self.hint = hint.map(str::to_string);
        self
    }
}

const INTERNAL_MESSAGE: &str = "An internal error occurred";

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Core(core) => classify_core(core),
            AppError::Relay(err) => classify_relay(err),
            AppError::Poll(err) => classify_poll(err),
            AppError::Provider(err) => classify_provider(err),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorBody::new("BAD_REQUEST", msg.clone())),
        };

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core(err: &CoreError) -> (StatusCode, ErrorBody) {
    match err {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            ErrorBody::new("NOT_FOUND", format!("{entity} with id {id} not found")),
        ),
        CoreError::Validation(msg) => (
            StatusCode::BAD_REQUEST,
            ErrorBody::new("VALIDATION_ERROR", msg.clone()),
        ),
        CoreError::Unauthorized(msg) => (
            StatusCode::UNAUTHORIZED,
            ErrorBody::new("UNAUTHORIZED", msg.clone()),
        ),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("INTERNAL_ERROR", INTERNAL_MESSAGE),
            )
        }
    }
}

fn classify_relay(err: &RelayError) -> (StatusCode, ErrorBody) {
    match err {
        RelayError::Core(core) => classify_core(core),
        RelayError::SpawnFailed { program, source, .. } => {
            tracing::error!(program = %program, error = %source, "Transcoder spawn failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("SPAWN_FAILED", err.to_string())
                    .details(json!({ "program": program }))
                    .hint(err.hint()),
            )
        }
        RelayError::ReadinessTimeout {
            session_id,
            pid,
            waited_ms,
        } => (
            StatusCode::GATEWAY_TIMEOUT,
            ErrorBody::new("READINESS_TIMEOUT", err.to_string())
                .details(json!({ "sessionId": session_id, "pid": pid, "waitedMs": waited_ms }))
                .hint(err.hint()),
        ),
        RelayError::ProcessExitedEarly {
            session_id,
            exit_code,
            diagnostics,
        } => (
            StatusCode::BAD_GATEWAY,
            ErrorBody::new("PROCESS_EXITED_EARLY", err.to_string())
                .details(json!({
                    "sessionId": session_id,
                    "exitCode": exit_code,
                    "diagnostics": diagnostics,
                }))
                .hint(err.hint()),
        ),
        RelayError::Cancelled { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorBody::new("CANCELLED", err.to_string()),
        ),
        RelayError::Io(e) => {
            tracing::error!(error = %e, "Relay I/O error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new("INTERNAL_ERROR", INTERNAL_MESSAGE),
            )
        }
    }
}

fn classify_poll(err: &PollError) -> (StatusCode, ErrorBody) {
    let details = json!({ "taskId": err.task_id(), "attempts": err.attempts() });
    let (status, code, hint) = match err {
        PollError::RemoteFailed { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "GENERATION_FAILED",
            Some("The provider rejected the job; adjust the prompt or inputs and submit again"),
        ),
        PollError::Fatal { reason, .. } => match reason {
            AbortReason::NotFound => (StatusCode::NOT_FOUND, "TASK_NOT_FOUND", None),
            AbortReason::Unauthorized { .. } => (
                StatusCode::BAD_GATEWAY,
                "PROVIDER_UNAUTHORIZED",
                Some("Check PROVIDER_API_KEY"),
            ),
            AbortReason::ServerError { .. } | AbortReason::RetriesExhausted { .. } => {
                (StatusCode::BAD_GATEWAY, "PROVIDER_ERROR", None)
            }
        },
        PollError::RetriesExhausted { .. } => (
            StatusCode::BAD_GATEWAY,
            "POLL_RETRIES_EXHAUSTED",
            Some("The provider could not be reached reliably; wait on the task again later"),
        ),
        PollError::TimedOut { .. } => (
            StatusCode::GATEWAY_TIMEOUT,
            "GENERATION_TIMEOUT",
            Some("The job may still be running; wait on the task again to resume polling"),
        ),
        PollError::Cancelled { .. } => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED", None),
    };
    (
        status,
        ErrorBody::new(code, err.to_string()).details(details).hint(hint),
    )
}

fn classify_provider(err: &ProviderApiError) -> (StatusCode, ErrorBody) {
    tracing::warn!(error = %err, "Provider request failed");
    match err {
        ProviderApiError::ApiError { status, .. } if *status == 401 || *status == 403 => (
            StatusCode::BAD_GATEWAY,
            ErrorBody::new("PROVIDER_UNAUTHORIZED", "The provider rejected the API key")
                .details(json!({ "status": status }))
                .hint(Some("Check PROVIDER_API_KEY")),
        ),
        ProviderApiError::ApiError { status, .. } => (
            StatusCode::BAD_GATEWAY,
            ErrorBody::new("PROVIDER_ERROR", format!("The provider returned HTTP {status}"))
                .details(json!({ "status": status })),
        ),
        ProviderApiError::Request(_) => (
            StatusCode::BAD_GATEWAY,
            ErrorBody::new("PROVIDER_UNREACHABLE", "The provider could not be reached"),
        ),
        ProviderApiError::Malformed(_) => (
            StatusCode::BAD_GATEWAY,
            ErrorBody::new("PROVIDER_ERROR", "The provider returned an unexpected response"),
        ),
    }
}
