//! Readiness probing: wait for a session's first playlist.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::registry::ExitWatch;

/// Bounds of the readiness wait.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessProbe {
    pub timeout: Duration,
    pub interval: Duration,
}

impl ReadinessProbe {
    /// Hard cap on waits between probes, independent of the wall clock.
    pub fn max_iterations(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let n = self.timeout.as_millis().div_ceil(self.interval.as_millis());
        u32::try_from(n).unwrap_or(u32::MAX).max(1)
    }
}

/// Poll for `playlist` until it exists, the process exits, the budget runs
/// out or `cancel` fires.
///
/// Each iteration checks for exit first so a dead transcoder is reported as
/// [`RelayError::ProcessExitedEarly`] rather than as a timeout.
pub async fn await_ready(
    session_id: &str,
    pid: u32,
    playlist: &Path,
    exit: &ExitWatch,
    probe: ReadinessProbe,
    cancel: &CancellationToken,
) -> Result<(), RelayError> {
    let started = Instant::now();
    let deadline = started + probe.timeout;
    let max_iterations = probe.max_iterations();
    let mut exit = exit.clone();
    let mut naps = 0u32;

    loop {
        let exited = exit.borrow_and_update().clone();
        if let Some(report) = exited {
            tracing::warn!(
                session_id,
                pid,
                code = ?report.code,
                diagnostics = %report.diagnostics,
                "Transcoder exited before producing output",
            );
            return Err(RelayError::ProcessExitedEarly {
                session_id: session_id.to_string(),
                exit_code: report.code,
                diagnostics: report.diagnostics,
            });
        }

        if tokio::fs::try_exists(playlist).await.unwrap_or(false) {
            tracing::info!(
                session_id,
                pid,
                waited_ms = started.elapsed().as_millis() as u64,
                "Session ready",
            );
            return Ok(());
        }

        // The last probe above ran at or after the deadline.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if naps >= max_iterations || remaining.is_zero() {
            let waited_ms = started.elapsed().as_millis() as u64;
            tracing::warn!(session_id, pid, waited_ms, naps, "Session readiness timed out");
            return Err(RelayError::ReadinessTimeout {
                session_id: session_id.to_string(),
                pid,
                waited_ms,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(session_id, pid, "Readiness wait cancelled");
                return Err(RelayError::Cancelled { session_id: session_id.to_string() });
            }
            Ok(()) = exit.changed() => {}
            _ = tokio::time::sleep(probe.interval.min(remaining)) => naps += 1,
        }
    }
}
