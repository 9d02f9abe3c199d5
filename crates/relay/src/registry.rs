//! Session registry: in-memory map plus durable markers.
//!
//! The in-memory map is a cache of the marker files. Every mutation updates
//! both under one lock, so `exists(id)` is never true while the pid is
//! unresolvable, nor the other way round. Lookups prefer memory and fall
//! back to the marker, which is how a restarted server resolves sessions it
//! did not start.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use kiln_core::session::SessionState;
use kiln_core::types::Timestamp;
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::driver::ExitReport;
use crate::marker::{MarkerStore, SessionMarker};

/// Receiver that resolves to `Some` once the session's process has exited.
pub type ExitWatch = watch::Receiver<Option<ExitReport>>;

/// A live session owned by this server process.
#[derive(Debug)]
pub struct SessionEntry {
    pub id: String,
    pub pid: u32,
    pub work_dir: PathBuf,
    pub url: String,
    pub started_at: Timestamp,
    pub state: SessionState,
    pub exit: ExitWatch,
}

impl SessionEntry {
    fn marker(&self) -> SessionMarker {
        SessionMarker {
            session_id: self.id.clone(),
            pid: self.pid,
            work_dir: self.work_dir.clone(),
            url: self.url.clone(),
            started_at: self.started_at,
        }
    }

    fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            id: self.id.clone(),
            pid: self.pid,
            work_dir: self.work_dir.clone(),
            url: self.url.clone(),
            started_at: self.started_at,
            state: self.state,
            origin: DescriptorOrigin::Memory,
        }
    }
}

/// Where a [`SessionDescriptor`] was resolved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorOrigin {
    Memory,
    Marker,
}

/// Snapshot of a session, resolvable with or without the in-memory entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDescriptor {
    pub id: String,
    pub pid: u32,
    pub work_dir: PathBuf,
    pub url: String,
    pub started_at: Timestamp,
    pub state: SessionState,
    pub origin: DescriptorOrigin,
}

impl From<SessionMarker> for SessionDescriptor {
    /// A marker without an in-memory entry belongs to a process this server
    /// did not launch; assume it is running until proven otherwise.
    fn from(m: SessionMarker) -> Self {
        Self {
            id: m.session_id,
            pid: m.pid,
            work_dir: m.work_dir,
            url: m.url,
            started_at: m.started_at,
            state: SessionState::Running,
            origin: DescriptorOrigin::Marker,
        }
    }
}

/// Registry of transcoding sessions keyed by session id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    markers: MarkerStore,
}

impl SessionRegistry {
    pub fn new(markers: MarkerStore) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            markers,
        }
    }

    pub fn markers(&self) -> &MarkerStore {
        &self.markers
    }

    /// Register a session. The marker is written first; if that fails the
    /// map is left untouched.
    pub async fn put(&self, entry: SessionEntry) -> io::Result<()> {
        let mut sessions = self.sessions.lock().await;
        self.markers.write(&entry.marker()).await?;
        sessions.insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Resolve a session, preferring the in-memory entry.
    pub async fn get(&self, id: &str) -> Option<SessionDescriptor> {
        let sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(id) {
            return Some(entry.descriptor());
        }
        self.read_marker(id).await
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.get(id).await.is_some()
    }

    /// Remove both the in-memory entry and the marker. Returns whether
    /// either existed.
    pub async fn remove(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let in_memory = sessions.remove(id).is_some();
        in_memory | self.remove_marker(id).await
    }

    /// Atomically resolve and remove a session for teardown. The returned
    /// descriptor carries the `Stopping` state.
    pub async fn take(&self, id: &str) -> Option<SessionDescriptor> {
        let mut sessions = self.sessions.lock().await;
        let descriptor = match sessions.remove(id) {
            Some(entry) => Some(entry.descriptor()),
            None => self.read_marker(id).await,
        };
        self.remove_marker(id).await;
        descriptor.map(|mut d| {
            d.state = SessionState::Stopping;
            d
        })
    }

    /// Remove the session only if it is still the process `pid`. Used by the
    /// exit path so a late exit never evicts a newer session with the same id.
    /// The returned descriptor is `Terminated`.
    pub async fn remove_if_pid(&self, id: &str, pid: u32) -> Option<SessionDescriptor> {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(id) {
            Some(entry) if entry.pid == pid => {
                let removed = sessions.remove(id).map(|e| e.descriptor());
                self.remove_marker(id).await;
                removed.map(terminated)
            }
            Some(_) => None,
            None => {
                // Marker-only sessions can still match (e.g. adopted after restart).
                match self.read_marker(id).await {
                    Some(d) if d.pid == pid => {
                        self.remove_marker(id).await;
                        Some(terminated(d))
                    }
                    _ => None,
                }
            }
        }
    }

    /// Advance an in-memory session's state. Illegal transitions are
    /// rejected and logged.
    pub async fn set_state(&self, id: &str, next: SessionState) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };
        if entry.state == next {
            return true;
        }
        if !entry.state.can_transition_to(next) {
            tracing::warn!(
                session_id = id,
                from = %entry.state,
                to = %next,
                "Rejected illegal session transition",
            );
            return false;
        }
        tracing::debug!(session_id = id, from = %entry.state, to = %next, "Session transition");
        entry.state = next;
        true
    }

    /// Exit watch of an in-memory session.
    pub async fn exit_watch(&self, id: &str) -> Option<(SessionDescriptor, ExitWatch)> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(id)
            .map(|entry| (entry.descriptor(), entry.exit.clone()))
    }

    /// All sessions: in-memory entries plus markers without one.
    pub async fn list(&self) -> Vec<SessionDescriptor> {
        let sessions = self.sessions.lock().await;
        let mut all: Vec<SessionDescriptor> = sessions.values().map(|e| e.descriptor()).collect();
        match self.markers.list().await {
            Ok(markers) => all.extend(
                markers
                    .into_iter()
                    .filter(|m| !sessions.contains_key(&m.session_id))
                    .map(SessionDescriptor::from),
            ),
            Err(e) => tracing::warn!(error = %e, "Failed to list session markers"),
        }
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Ids of sessions launched by this server process.
    pub async fn in_memory_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // ---- private helpers ----

    async fn read_marker(&self, id: &str) -> Option<SessionDescriptor> {
        match self.markers.read(id).await {
            Ok(marker) => marker.map(SessionDescriptor::from),
            Err(e) => {
                tracing::warn!(session_id = id, error = %e, "Failed to read session marker");
                None
            }
        }
    }

    async fn remove_marker(&self, id: &str) -> bool {
        match self.markers.remove(id).await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(session_id = id, error = %e, "Failed to remove session marker");
                false
            }
        }
    }
}

fn terminated(mut descriptor: SessionDescriptor) -> SessionDescriptor {
    descriptor.state = SessionState::Terminated;
    descriptor
}
