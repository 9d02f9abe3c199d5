use std::io;

use kiln_core::error::CoreError;

/// Errors surfaced by the relay supervisor to start callers.
///
/// Stop never fails; its signal and cleanup problems are logged instead.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Invalid session id or source URL.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The transcoder binary could not be started at all.
    #[error("Failed to start transcoder '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
        hint: String,
    },

    /// The process is alive but produced no playlist within the budget.
    #[error("Session {session_id} produced no output within {waited_ms}ms")]
    ReadinessTimeout {
        session_id: String,
        pid: u32,
        waited_ms: u64,
    },

    /// The process died before writing its first playlist.
    #[error(
        "Transcoder for session {session_id} exited before producing output (exit code {})",
        .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
    )]
    ProcessExitedEarly {
        session_id: String,
        exit_code: Option<i32>,
        /// Tail of the transcoder's stderr.
        diagnostics: String,
    },

    /// The caller went away while waiting for readiness.
    #[error("Start of session {session_id} was cancelled")]
    Cancelled { session_id: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Remediation hint for the UI, when one is known.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::SpawnFailed { hint, .. } => Some(hint),
            Self::ReadinessTimeout { .. } => {
                Some("The source may be slow or unreachable; stop the session and try again")
            }
            Self::ProcessExitedEarly { .. } => {
                Some("Check that the source URL is reachable and serves a supported stream")
            }
            _ => None,
        }
    }
}

/// Build a remediation hint for a failed spawn of `program`.
pub fn spawn_hint(program: &str, err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => format!(
            "'{program}' was not found. Install ffmpeg and make sure it is on PATH, \
             or set TRANSCODER_BIN to its full path"
        ),
        io::ErrorKind::PermissionDenied => {
            format!("'{program}' is not executable by the server user; check its permissions")
        }
        _ => format!("Verify that '{program}' runs from a shell on this host"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_hint_names_dependency() {
        let err = io::Error::new(io::ErrorKind::NotFound, "No such file");
        let hint = spawn_hint("ffmpeg", &err);
        assert!(hint.contains("ffmpeg"));
        assert!(hint.contains("TRANSCODER_BIN"));
    }

    #[test]
    fn spawn_hint_permission() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(spawn_hint("/opt/ff", &err).contains("not executable"));
    }

    #[test]
    fn exited_early_display() {
        let err = RelayError::ProcessExitedEarly {
            session_id: "cam".into(),
            exit_code: Some(1),
            diagnostics: "Connection refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Transcoder for session cam exited before producing output (exit code 1)"
        );
        assert!(err.hint().is_some());
    }

    #[test]
    fn exited_by_signal_display() {
        let err = RelayError::ProcessExitedEarly {
            session_id: "cam".into(),
            exit_code: None,
            diagnostics: String::new(),
        };
        assert!(err.to_string().ends_with("(exit code none)"));
    }
}
