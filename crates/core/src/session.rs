//! Transcoding session lifecycle and request validation.
//!
//! A session moves through `launching -> ready -> running -> stopping ->
//! terminated`. Only the relay supervisor drives transitions; this module
//! holds the rules so they can be tested without spawning processes.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of a caller-supplied session id.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Transport schemes accepted for live sources when none are configured.
pub const DEFAULT_ALLOWED_SCHEMES: &[&str] = &["rtsp", "rtsps"];

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Lifecycle state of a transcoding session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Subprocess spawned, no output observed yet.
    Launching,
    /// First playlist written; the handle is consumable.
    Ready,
    /// Handle has been handed to a caller.
    Running,
    /// A stop request is tearing the session down.
    Stopping,
    /// Process gone and registry entry removed.
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Launching => "launching",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Terminated => "terminated",
        }
    }

    /// Whether a start request for this session may reuse its handle as-is.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    ///
    /// Any non-terminal state may jump straight to `Terminated` because the
    /// subprocess can die on its own at any point.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Launching, Ready)
                | (Launching, Stopping)
                | (Ready, Running)
                | (Ready, Stopping)
                | (Running, Stopping)
                | (Launching | Ready | Running | Stopping, Terminated)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a caller-supplied session id.
///
/// The id names a directory and a marker file, so it is restricted to
/// ASCII alphanumerics, hyphen and underscore.
pub fn validate_session_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation(
            "sessionId must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(CoreError::Validation(format!(
            "sessionId must be at most {MAX_SESSION_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CoreError::Validation(format!(
            "sessionId '{id}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}

/// Extract the lowercase scheme of a URL (`rtsp://host/x` -> `rtsp`).
pub fn url_scheme(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme.is_empty() || rest.is_empty() {
        return None;
    }
    Some(scheme.to_ascii_lowercase())
}

/// Validate that a live source URL uses one of the accepted transport schemes.
pub fn validate_source_url(url: &str, allowed_schemes: &[String]) -> Result<(), CoreError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(
            "sourceUrl must not be empty".to_string(),
        ));
    }
    let scheme = url_scheme(trimmed).ok_or_else(|| {
        CoreError::Validation(format!("sourceUrl '{trimmed}' is not a valid URL"))
    })?;
    if !allowed_schemes.iter().any(|s| s.eq_ignore_ascii_case(&scheme)) {
        return Err(CoreError::Validation(format!(
            "sourceUrl must use one of: {}, got '{scheme}'",
            allowed_schemes.join(", ")
        )));
    }
    Ok(())
}
