//! Owner of the relay's shared state and background tasks.
//!
//! [`StreamSupervisor`] ties the registry, the process driver and the exit
//! event loop together. Starting and stopping sessions live in
//! [`crate::launcher`] and [`crate::teardown`]; this module covers
//! construction, startup reconciliation and shutdown.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln_core::error::CoreError;
use kiln_core::session::DEFAULT_ALLOWED_SCHEMES;
use kiln_core::transcode::HlsSettings;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cleanup::{is_within, remove_work_dir, schedule_cleanup, CleanupReport};
use crate::driver::ProcessDriver;
use crate::error::RelayError;
use crate::events::{self, SessionEvent};
use crate::launcher::LaunchOutcome;
use crate::marker::MarkerStore;
use crate::readiness::ReadinessProbe;
use crate::registry::SessionRegistry;

/// Default transcoder executable.
pub const DEFAULT_TRANSCODER_BIN: &str = "ffmpeg";

/// Default URL prefix under which the streams root is served.
pub const DEFAULT_PUBLIC_PREFIX: &str = "/streams";

/// Relay tunables, normally built from environment variables by the server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Parent of every session working directory.
    pub streams_root: PathBuf,
    /// Directory holding one marker file per session.
    pub marker_dir: PathBuf,
    pub transcoder_bin: String,
    pub allowed_schemes: Vec<String>,
    pub hls: HlsSettings,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    /// Delay before a stopped session's directory is removed.
    pub cleanup_delay: Duration,
    /// URL prefix prepended to `<dir>/index.m3u8` in handed-out URLs.
    pub public_prefix: String,
}

impl RelayConfig {
    pub fn new(streams_root: impl Into<PathBuf>, marker_dir: impl Into<PathBuf>) -> Self {
        Self {
            streams_root: streams_root.into(),
            marker_dir: marker_dir.into(),
            transcoder_bin: DEFAULT_TRANSCODER_BIN.to_string(),
            allowed_schemes: DEFAULT_ALLOWED_SCHEMES.iter().map(|s| s.to_string()).collect(),
            hls: HlsSettings::default(),
            readiness_timeout: Duration::from_secs(20),
            readiness_interval: Duration::from_millis(200),
            cleanup_delay: Duration::from_secs(1),
            public_prefix: DEFAULT_PUBLIC_PREFIX.to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.readiness_interval.is_zero() {
            return Err(CoreError::Validation(
                "readiness interval must be greater than zero".to_string(),
            ));
        }
        if self.readiness_timeout < self.readiness_interval {
            return Err(CoreError::Validation(
                "readiness timeout must be at least one interval".to_string(),
            ));
        }
        if self.allowed_schemes.is_empty() {
            return Err(CoreError::Validation(
                "at least one source URL scheme must be allowed".to_string(),
            ));
        }
        if self.hls.segment_secs == 0 || self.hls.list_size == 0 {
            return Err(CoreError::Validation(
                "HLS segment duration and list size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn readiness_probe(&self) -> ReadinessProbe {
        ReadinessProbe {
            timeout: self.readiness_timeout,
            interval: self.readiness_interval,
        }
    }
}

/// What startup reconciliation found in the marker directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions whose process is still alive; stop can still kill them.
    pub adopted: Vec<String>,
    /// Sessions whose process is gone; marker and directory removed.
    pub removed: Vec<String>,
    /// Directories of dead markers plus unreferenced directories older than
    /// the readiness timeout.
    pub swept_dirs: usize,
}

pub struct StreamSupervisor {
    pub(crate) config: RelayConfig,
    pub(crate) driver: Arc<dyn ProcessDriver>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
    /// Serializes the check-then-launch sequence of concurrent starts.
    pub(crate) launch_lock: Mutex<()>,
    /// Outcome channels of launches still waiting for readiness, by pid.
    pub(crate) in_flight: std::sync::Mutex<HashMap<u32, watch::Receiver<LaunchOutcome>>>,
    cancel: CancellationToken,
    event_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamSupervisor {
    /// Prepare directories, reconcile leftovers from a previous run and start
    /// the exit event loop. `cancel` stops the loop; [`Self::shutdown`]
    /// cancels it too.
    pub async fn start(
        config: RelayConfig,
        driver: Arc<dyn ProcessDriver>,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, RelayError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.streams_root).await?;
        let markers = MarkerStore::new(&config.marker_dir);
        markers.ensure_dir().await?;

        let registry = Arc::new(SessionRegistry::new(markers));
        let (tx, rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(Self {
            config,
            driver,
            registry: Arc::clone(&registry),
            events: tx,
            launch_lock: Mutex::new(()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            cancel: cancel.clone(),
            event_loop: std::sync::Mutex::new(None),
        });

        let report = supervisor.reconcile().await?;
        tracing::info!(
            adopted = report.adopted.len(),
            removed = report.removed.len(),
            swept_dirs = report.swept_dirs,
            "Relay reconciliation complete",
        );

        let handle = tokio::spawn(events::run_event_loop(
            registry,
            supervisor.config.streams_root.clone(),
            supervisor.config.cleanup_delay,
            rx,
            cancel,
        ));
        if let Ok(mut slot) = supervisor.event_loop.lock() {
            *slot = Some(handle);
        }

        Ok(supervisor)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Kill every session launched by this process and stop the event loop.
    ///
    /// Marker-only sessions adopted at startup are left alone; they were not
    /// started by this process.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let ids = self.registry.in_memory_ids().await;
        tracing::info!(sessions = ids.len(), "Stopping relay sessions");
        for id in ids {
            let exited = match self.registry.exit_watch(&id).await {
                Some((_, exit)) => exit.borrow().is_some(),
                None => continue,
            };
            let Some(descriptor) = self.registry.take(&id).await else {
                continue;
            };
            if !exited {
                if let Err(e) = self.driver.kill(descriptor.pid) {
                    tracing::warn!(session_id = %id, pid = descriptor.pid, error = %e, "Failed to kill transcoder on shutdown");
                }
            }
            if is_within(&self.config.streams_root, &descriptor.work_dir) {
                remove_work_dir(&descriptor.work_dir).await;
            }
        }

        let handle = self.event_loop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("Relay supervisor stopped");
    }

    /// Schedule removal of a session directory, refusing paths outside the
    /// streams root.
    pub(crate) fn schedule_dir_cleanup(&self, path: &Path) -> Option<JoinHandle<CleanupReport>> {
        if !is_within(&self.config.streams_root, path) {
            tracing::warn!(path = %path.display(), "Refusing to clean up directory outside the streams root");
            return None;
        }
        Some(schedule_cleanup(path.to_path_buf(), self.config.cleanup_delay))
    }

    /// Drop markers of dead processes and sweep orphaned directories.
    ///
    /// A launch creates its directory before its marker exists, so an
    /// unreferenced directory younger than the readiness timeout may belong
    /// to another instance's in-flight start and is kept.
    async fn reconcile(&self) -> io::Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let mut live_dirs = HashSet::new();

        for marker in self.registry.markers().list().await? {
            if self.driver.is_alive(marker.pid) {
                tracing::info!(session_id = %marker.session_id, pid = marker.pid, "Adopting running session from marker");
                live_dirs.insert(marker.work_dir);
                report.adopted.push(marker.session_id);
            } else {
                tracing::info!(session_id = %marker.session_id, pid = marker.pid, "Removing stale session marker");
                self.registry.markers().remove(&marker.session_id).await?;
                if is_within(&self.config.streams_root, &marker.work_dir) {
                    if let CleanupReport::Removed { .. } = remove_work_dir(&marker.work_dir).await {
                        report.swept_dirs += 1;
                    }
                }
                report.removed.push(marker.session_id);
            }
        }

        let grace = self.config.readiness_timeout;
        let mut entries = tokio::fs::read_dir(&self.config.streams_root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() || live_dirs.contains(&path) {
                continue;
            }
            let age = entry
                .metadata()
                .await?
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok());
            match age {
                Some(age) if age >= grace => {}
                _ => {
                    tracing::debug!(path = %path.display(), "Keeping recent unreferenced directory");
                    continue;
                }
            }
            if let CleanupReport::Removed { .. } = remove_work_dir(&path).await {
                report.swept_dirs += 1;
            }
        }

        Ok(report)
    }
}
