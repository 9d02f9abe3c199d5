//! Durable per-session marker files.
//!
//! One JSON file per session id records the OS pid and working directory
//! of its transcoder. Markers outlive the in-memory registry so a stop
//! request handled by a restarted (or different) server process can still
//! find and kill the subprocess.

use std::io;
use std::path::{Path, PathBuf};

use kiln_core::types::Timestamp;
use serde::{Deserialize, Serialize};

const MARKER_EXTENSION: &str = "json";

/// On-disk record of a running session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMarker {
    pub session_id: String,
    pub pid: u32,
    pub work_dir: PathBuf,
    pub url: String,
    pub started_at: Timestamp,
}

/// Directory of marker files keyed by session id.
#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the marker directory if needed.
    pub async fn ensure_dir(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.{MARKER_EXTENSION}"))
    }

    /// Write (or replace) the marker for `marker.session_id`.
    ///
    /// The file is written under a temporary name and renamed into place so
    /// readers never observe a partial record.
    pub async fn write(&self, marker: &SessionMarker) -> io::Result<()> {
        let path = self.path_for(&marker.session_id);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", marker.session_id, marker.pid));
        let bytes = serde_json::to_vec_pretty(marker).map_err(io::Error::other)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    /// Read the marker for `session_id`, if one exists.
    pub async fn read(&self, session_id: &str) -> io::Result<Option<SessionMarker>> {
        match tokio::fs::read(self.path_for(session_id)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete the marker. Returns whether a file was removed.
    pub async fn remove(&self, session_id: &str) -> io::Result<bool> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Load every readable marker. Unreadable files are logged and skipped.
    pub async fn list(&self) -> io::Result<Vec<SessionMarker>> {
        let mut markers = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(markers),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MARKER_EXTENSION) {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.read(session_id).await {
                Ok(Some(marker)) => markers.push(marker),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session marker");
                }
            }
        }

        markers.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(markers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(id: &str, pid: u32) -> SessionMarker {
        SessionMarker {
            session_id: id.into(),
            pid,
            work_dir: PathBuf::from(format!("/data/streams/{id}-x")),
            url: format!("/streams/{id}-x/index.m3u8"),
            started_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        let m = marker("cam-1", 4242);
        store.write(&m).await.unwrap();
        assert_eq!(store.read("cam-1").await.unwrap(), Some(m));
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        assert_eq!(store.read("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        store.write(&marker("cam-1", 1)).await.unwrap();
        assert!(store.remove("cam-1").await.unwrap());
        assert!(!store.remove("cam-1").await.unwrap());
    }

    #[tokio::test]
    async fn overwrite_replaces_pid() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        store.write(&marker("cam-1", 1)).await.unwrap();
        store.write(&marker("cam-1", 2)).await.unwrap();
        assert_eq!(store.read("cam-1").await.unwrap().unwrap().pid, 2);
    }

    #[tokio::test]
    async fn list_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path());
        store.write(&marker("b", 2)).await.unwrap();
        store.write(&marker("a", 1)).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{not json")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"hi").await.unwrap();

        let ids: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.session_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn list_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(dir.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
