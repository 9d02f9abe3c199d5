//! Cancellable status polling for submitted generation jobs.
//!
//! [`poll_task`] blocks its caller until the job succeeds, fails remotely,
//! exhausts its attempt or error budget, or the [`CancellationToken`] fires.
//! Budget bookkeeping is delegated to [`PollTask`].

use kiln_core::polling::{AbortReason, FailureKind, PollConfig, PollStep, PollTask, RemoteStatus};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::GenerationProvider;

/// Successful outcome of a poll call.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub result: serde_json::Value,
    pub attempts: u32,
}

/// Terminal, non-successful outcomes of a poll call.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The provider reported the job as failed. Retrying will not help.
    #[error("Task {task_id} failed: {}", .message.as_deref().unwrap_or("no reason given"))]
    RemoteFailed {
        task_id: String,
        message: Option<String>,
        attempts: u32,
    },

    /// A fatal transport/protocol error (not found, unauthorized, server fault).
    #[error("Polling task {task_id} aborted: {last_error}")]
    Fatal {
        task_id: String,
        reason: AbortReason,
        last_error: String,
        attempts: u32,
    },

    /// Too many consecutive transient failures.
    #[error("Polling task {task_id} gave up after {consecutive_errors} consecutive errors: {last_error}")]
    RetriesExhausted {
        task_id: String,
        consecutive_errors: u32,
        last_error: String,
        attempts: u32,
    },

    /// Attempt budget spent while the job was still running remotely.
    #[error("Task {task_id} did not finish within {attempts} status checks")]
    TimedOut { task_id: String, attempts: u32 },

    /// The caller went away.
    #[error("Polling task {task_id} was cancelled")]
    Cancelled { task_id: String, attempts: u32 },
}

impl PollError {
    pub fn task_id(&self) -> &str {
        match self {
            Self::RemoteFailed { task_id, .. }
            | Self::Fatal { task_id, .. }
            | Self::RetriesExhausted { task_id, .. }
            | Self::TimedOut { task_id, .. }
            | Self::Cancelled { task_id, .. } => task_id,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::RemoteFailed { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::RetriesExhausted { attempts, .. }
            | Self::TimedOut { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }
}

/// Poll `task_id` until it reaches a terminal state.
///
/// Each iteration sleeps `config.interval`, then issues one status request.
/// Both the sleep and the request are raced against `cancel`.
pub async fn poll_task<P>(
    provider: &P,
    task_id: &str,
    api_key: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<TaskResult, PollError>
where
    P: GenerationProvider + ?Sized,
{
    let mut task = PollTask::new(task_id, *config);
    let mut last_error = String::new();

    tracing::info!(
        task_id,
        interval_ms = config.interval.as_millis() as u64,
        max_attempts = config.max_attempts,
        max_error_retries = config.max_error_retries,
        "Polling generation task",
    );

    loop {
        if !task.begin_attempt() {
            return Err(PollError::TimedOut {
                task_id: task_id.to_string(),
                attempts: task.attempts(),
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(&task)),
            _ = tokio::time::sleep(config.interval) => {}
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled(&task)),
            r = provider.fetch_status(task_id, api_key) => r,
        };

        let mut payload = None;
        let mut remote_message = None;

        let step = match fetched {
            Ok(response) => match response.remote_status() {
                RemoteStatus::Success if response.result.is_none() => {
                    last_error = "provider reported success without a result".to_string();
                    tracing::warn!(task_id, attempt = task.attempts(), "{last_error}");
                    task.record_failure(FailureKind::Transient)
                }
                remote => {
                    tracing::debug!(
                        task_id,
                        attempt = task.attempts(),
                        status = %response.status,
                        "Task status received",
                    );
                    payload = response.result;
                    remote_message = response.error;
                    task.record_response(remote)
                }
            },
            Err(e) => {
                let kind = e.failure_kind();
                last_error = e.to_string();
                tracing::warn!(
                    task_id,
                    attempt = task.attempts(),
                    consecutive_errors = task.consecutive_errors() + 1,
                    failure = ?kind,
                    error = %e,
                    "Task status request failed",
                );
                task.record_failure(kind)
            }
        };

        match step {
            PollStep::Continue => continue,
            PollStep::Succeeded => {
                tracing::info!(task_id, attempts = task.attempts(), "Task succeeded");
                return Ok(TaskResult {
                    task_id: task_id.to_string(),
                    result: payload.unwrap_or(serde_json::Value::Null),
                    attempts: task.attempts(),
                });
            }
            PollStep::Failed => {
                tracing::warn!(task_id, attempts = task.attempts(), "Task failed remotely");
                return Err(PollError::RemoteFailed {
                    task_id: task_id.to_string(),
                    message: remote_message,
                    attempts: task.attempts(),
                });
            }
            PollStep::TimedOut => {
                tracing::warn!(task_id, attempts = task.attempts(), "Task polling timed out");
                return Err(PollError::TimedOut {
                    task_id: task_id.to_string(),
                    attempts: task.attempts(),
                });
            }
            PollStep::Aborted(AbortReason::RetriesExhausted { consecutive_errors }) => {
                tracing::error!(task_id, consecutive_errors, "Task polling retries exhausted");
                return Err(PollError::RetriesExhausted {
                    task_id: task_id.to_string(),
                    consecutive_errors,
                    last_error,
                    attempts: task.attempts(),
                });
            }
            PollStep::Aborted(reason) => {
                tracing::error!(task_id, reason = ?reason, "Task polling aborted");
                return Err(PollError::Fatal {
                    task_id: task_id.to_string(),
                    reason,
                    last_error,
                    attempts: task.attempts(),
                });
            }
        }
    }
}

fn cancelled(task: &PollTask) -> PollError {
    tracing::info!(task_id = task.task_id(), attempts = task.attempts(), "Task polling cancelled");
    PollError::Cancelled {
        task_id: task.task_id().to_string(),
        attempts: task.attempts(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::api::{ProviderApiError, SubmitRequest, TaskStatusResponse};

    /// Scripted reply for one status request.
    enum Reply {
        Status(&'static str),
        Success(serde_json::Value),
        Http(u16),
        Malformed,
    }

    /// Provider that replays a script, then repeats the fallback forever.
    struct ScriptedProvider {
        script: Mutex<VecDeque<Reply>>,
        fallback: &'static str,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(script: Vec<Reply>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: "pending",
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationProvider for ScriptedProvider {
        async fn submit(&self, _: &SubmitRequest, _: &str) -> Result<String, ProviderApiError> {
            Ok("task-1".into())
        }

        async fn fetch_status(
            &self,
            _task_id: &str,
            _api_key: &str,
        ) -> Result<TaskStatusResponse, ProviderApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.script.lock().unwrap().pop_front();
            let status = |s: &str| TaskStatusResponse {
                status: s.to_string(),
                result: None,
                error: None,
            };
            match reply {
                None => Ok(status(self.fallback)),
                Some(Reply::Status(s)) => Ok(status(s)),
                Some(Reply::Success(v)) => Ok(TaskStatusResponse {
                    status: "success".into(),
                    result: Some(v),
                    error: None,
                }),
                Some(Reply::Http(code)) => Err(ProviderApiError::ApiError {
                    status: code,
                    body: format!("status {code}"),
                }),
                Some(Reply::Malformed) => Err(ProviderApiError::Malformed("truncated".into())),
            }
        }
    }

    fn config(max_attempts: u32, max_error_retries: u32) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(10),
            max_attempts,
            max_error_retries,
            retry_server_errors: false,
        }
    }

    #[tokio::test]
    async fn returns_payload_on_success() {
        let provider = ScriptedProvider::new(vec![
            Reply::Status("pending"),
            Reply::Success(serde_json::json!({"images": ["https://cdn/x.png"]})),
        ]);
        let cancel = CancellationToken::new();
        let result = poll_task(&provider, "t1", "key", &config(10, 3), &cancel)
            .await
            .unwrap();
        assert_eq!(result.attempts, 2);
        assert_eq!(result.result["images"][0], "https://cdn/x.png");
    }

    #[tokio::test]
    async fn all_pending_times_out_after_exact_attempts() {
        let provider = ScriptedProvider::new(vec![]);
        let cancel = CancellationToken::new();
        let err = poll_task(&provider, "t1", "key", &config(5, 3), &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, PollError::TimedOut { attempts: 5, .. });
        assert_eq!(provider.calls(), 5);
    }

    #[tokio::test]
    async fn single_not_found_aborts_immediately() {
        let provider = ScriptedProvider::new(vec![Reply::Http(404)]);
        let cancel = CancellationToken::new();
        let err = poll_task(&provider, "t1", "key", &config(100, 100), &cancel)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            PollError::Fatal {
                reason: AbortReason::NotFound,
                attempts: 1,
                ..
            }
        );
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn unauthorized_aborts_immediately() {
        let provider = ScriptedProvider::new(vec![Reply::Http(401)]);
        let cancel = CancellationToken::new();
        let err = poll_task(&provider, "t1", "bad", &config(10, 3), &cancel)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            PollError::Fatal {
                reason: AbortReason::Unauthorized { status: 401 },
                ..
            }
        );
    }

    #[tokio::test]
    async fn server_error_aborts_immediately() {
        let provider = ScriptedProvider::new(vec![Reply::Http(500)]);
        let cancel = CancellationToken::new();
        let err = poll_task(&provider, "t1", "key", &config(10, 3), &cancel)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            PollError::Fatal {
                reason: AbortReason::ServerError { status: 500 },
                ..
            }
        );
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn remote_failure_is_not_retried() {
        let provider = ScriptedProvider::new(vec![Reply::Status("fail")]);
        let cancel = CancellationToken::new();
        let err = poll_task(&provider, "t1", "key", &config(10, 3), &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, PollError::RemoteFailed { attempts: 1, .. });
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn pending_response_resets_consecutive_errors() {
        let provider = ScriptedProvider::new(vec![
            Reply::Http(429),
            Reply::Malformed,
            Reply::Status("pending"),
            Reply::Http(429),
            Reply::Success(serde_json::json!("ok")),
        ]);
        let cancel = CancellationToken::new();
        let result = poll_task(&provider, "t1", "key", &config(10, 3), &cancel)
            .await
            .unwrap();
        assert_eq!(result.attempts, 5);
    }

    #[tokio::test]
    async fn consecutive_transient_errors_exhaust_retries() {
        let provider = ScriptedProvider::new(vec![
            Reply::Http(429),
            Reply::Malformed,
            Reply::Http(408),
            Reply::Success(serde_json::json!("late")),
        ]);
        let cancel = CancellationToken::new();
        let err = poll_task(&provider, "t1", "key", &config(10, 3), &cancel)
            .await
            .unwrap_err();
        assert_matches!(
            err,
            PollError::RetriesExhausted {
                consecutive_errors: 3,
                attempts: 3,
                ..
            }
        );
    }

    #[tokio::test]
    async fn success_without_result_counts_as_protocol_error() {
        let provider = ScriptedProvider::new(vec![
            Reply::Status("success"),
            Reply::Success(serde_json::json!({"url": "x"})),
        ]);
        let cancel = CancellationToken::new();
        let result = poll_task(&provider, "t1", "key", &config(10, 3), &cancel)
            .await
            .unwrap();
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let provider = ScriptedProvider::new(vec![]);
        let cancel = CancellationToken::new();
        let slow = PollConfig {
            interval: Duration::from_secs(60),
            ..config(10, 3)
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = poll_task(&provider, "t1", "key", &slow, &cancel)
            .await
            .unwrap_err();
        assert_matches!(err, PollError::Cancelled { .. });
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(provider.calls(), 0);
    }

    #[test]
    fn error_accessors() {
        let err = PollError::TimedOut {
            task_id: "t9".into(),
            attempts: 4,
        };
        assert_eq!(err.task_id(), "t9");
        assert_eq!(err.attempts(), 4);
        assert_eq!(err.to_string(), "Task t9 did not finish within 4 status checks");
    }
}
