//! Best-effort removal of session working directories.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Outcome of removing a working directory. Never surfaced to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupReport {
    Removed { path: PathBuf },
    AlreadyGone { path: PathBuf },
    Failed { path: PathBuf, error: String },
}

/// Remove `path` and everything under it.
pub async fn remove_work_dir(path: &Path) -> CleanupReport {
    let path_buf = path.to_path_buf();
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed session directory");
            CleanupReport::Removed { path: path_buf }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => CleanupReport::AlreadyGone { path: path_buf },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove session directory");
            CleanupReport::Failed {
                path: path_buf,
                error: e.to_string(),
            }
        }
    }
}

/// Remove `path` after `delay` on a background task.
///
/// The delay lets the OS release the dead process's file handles first.
pub fn schedule_cleanup(path: PathBuf, delay: Duration) -> JoinHandle<CleanupReport> {
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        remove_work_dir(&path).await
    })
}

/// Whether `path` sits strictly inside `root`. Cleanup never touches
/// anything else, even when a marker file has been tampered with.
pub fn is_within(root: &Path, path: &Path) -> bool {
    path != root
        && path.starts_with(root)
        && !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}
