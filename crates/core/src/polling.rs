//! Remote task polling state machine.
//!
//! [`PollTask`] tracks one poll loop: how many attempts have been made, how
//! many transport/protocol failures happened in a row, and the resulting
//! status. The async driver lives in `kiln-provider`; everything here is
//! synchronous so the budget rules can be unit tested exhaustively.

use std::time::Duration;

use serde::Serialize;

use crate::error::CoreError;

/// Default delay between two status requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Default maximum number of status requests per poll call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;
/// Default number of consecutive failed requests tolerated.
pub const DEFAULT_MAX_ERROR_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Budget for a single poll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
    pub max_error_retries: u32,
    /// Treat HTTP 5xx as transient instead of fatal. Off by default: a
    /// single server-side fault aborts the loop.
    pub retry_server_errors: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_error_retries: DEFAULT_MAX_ERROR_RETRIES,
            retry_server_errors: false,
        }
    }
}

impl PollConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 {
            return Err(CoreError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_error_retries == 0 {
            return Err(CoreError::Validation(
                "max_error_retries must be at least 1".to_string(),
            ));
        }
        if self.interval.is_zero() {
            return Err(CoreError::Validation(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Upper bound on the wall-clock time a poll call may block.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Status and classification
// ---------------------------------------------------------------------------

/// Lifecycle of a poll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Pending,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
    Aborted,
}

impl PollStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Aborted
        )
    }
}

/// Maximum length of a provider task id accepted from callers.
pub const MAX_TASK_ID_LEN: usize = 256;

/// Validate a caller-supplied task id. It is interpolated into the
/// provider's status URL, so only URL-safe characters are accepted.
pub fn validate_task_id(task_id: &str) -> Result<(), CoreError> {
    if task_id.is_empty() || task_id.len() > MAX_TASK_ID_LEN {
        return Err(CoreError::Validation(format!(
            "taskId must be between 1 and {MAX_TASK_ID_LEN} characters"
        )));
    }
    if task_id.chars().all(|c| c == '.')
        || !task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(CoreError::Validation(format!(
            "taskId '{task_id}' contains unsupported characters"
        )));
    }
    Ok(())
}

/// Job status reported by a well-formed status response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Queued or still running.
    Pending,
    Success,
    Fail,
}

impl RemoteStatus {
    /// Map a provider status string. Unknown values are treated as still
    /// running; only explicit terminal words end the loop.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "success" | "succeeded" | "completed" | "done" => Self::Success,
            "fail" | "failed" | "error" | "cancelled" | "canceled" => Self::Fail,
            _ => Self::Pending,
        }
    }
}

/// Classification of a request that did not produce a well-formed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 404: the task will never be found.
    NotFound,
    /// HTTP 401/403: credentials are wrong for the whole session.
    Unauthorized { status: u16 },
    /// HTTP 5xx.
    ServerError { status: u16 },
    /// Network error, timeout, other non-2xx or a malformed body.
    Transient,
}

impl FailureKind {
    /// Classify an HTTP status code that is not a success.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            401 | 403 => Self::Unauthorized { status },
            500..=599 => Self::ServerError { status },
            _ => Self::Transient,
        }
    }
}

/// Why a poll loop was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbortReason {
    NotFound,
    Unauthorized { status: u16 },
    ServerError { status: u16 },
    RetriesExhausted { consecutive_errors: u32 },
}

/// What the driver should do after recording an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Continue,
    Succeeded,
    Failed,
    TimedOut,
    Aborted(AbortReason),
}

// ---------------------------------------------------------------------------
// PollTask
// ---------------------------------------------------------------------------

/// Bookkeeping for a single poll call. Never persisted.
#[derive(Debug, Clone)]
pub struct PollTask {
    task_id: String,
    config: PollConfig,
    attempts: u32,
    consecutive_errors: u32,
    status: PollStatus,
}

impl PollTask {
    pub fn new(task_id: impl Into<String>, config: PollConfig) -> Self {
        Self {
            task_id: task_id.into(),
            config,
            attempts: 0,
            consecutive_errors: 0,
            status: PollStatus::Pending,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn status(&self) -> PollStatus {
        self.status
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Start a new iteration. Returns `false` (and marks the task timed out)
    /// when the attempt budget is already spent.
    pub fn begin_attempt(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.attempts >= self.config.max_attempts {
            self.status = PollStatus::TimedOut;
            return false;
        }
        self.attempts += 1;
        self.status = PollStatus::Polling;
        true
    }

    /// Record a well-formed status response.
    pub fn record_response(&mut self, remote: RemoteStatus) -> PollStep {
        self.consecutive_errors = 0;
        match remote {
            RemoteStatus::Success => {
                self.status = PollStatus::Succeeded;
                PollStep::Succeeded
            }
            RemoteStatus::Fail => {
                self.status = PollStatus::Failed;
                PollStep::Failed
            }
            RemoteStatus::Pending => self.continue_or_time_out(),
        }
    }

    /// Record a transport/protocol-level failure.
    pub fn record_failure(&mut self, kind: FailureKind) -> PollStep {
        self.consecutive_errors += 1;

        let reason = match kind {
            FailureKind::NotFound => Some(AbortReason::NotFound),
            FailureKind::Unauthorized { status } => Some(AbortReason::Unauthorized { status }),
            FailureKind::ServerError { status } if !self.config.retry_server_errors => {
                Some(AbortReason::ServerError { status })
            }
            FailureKind::ServerError { .. } | FailureKind::Transient => {
                if self.consecutive_errors >= self.config.max_error_retries {
                    Some(AbortReason::RetriesExhausted {
                        consecutive_errors: self.consecutive_errors,
                    })
                } else {
                    None
                }
            }
        };

        match reason {
            Some(reason) => {
                self.status = PollStatus::Aborted;
                PollStep::Aborted(reason)
            }
            None => self.continue_or_time_out(),
        }
    }

    fn continue_or_time_out(&mut self) -> PollStep {
        if self.attempts >= self.config.max_attempts {
            self.status = PollStatus::TimedOut;
            PollStep::TimedOut
        } else {
            PollStep::Continue
        }
    }
}
