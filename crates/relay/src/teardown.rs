//! Session stop. Idempotent and infallible from the caller's view.

use kiln_core::session::validate_session_id;
use serde::Serialize;

use crate::driver::is_no_such_process;
use crate::registry::DescriptorOrigin;
use crate::supervisor::StreamSupervisor;

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub session_id: String,
    /// Whether a session (in memory or by marker) was found.
    pub was_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Whether the kill signal was delivered to a live process.
    pub signalled: bool,
}

impl StopOutcome {
    fn not_running(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            was_running: false,
            pid: None,
            signalled: false,
        }
    }
}

impl StreamSupervisor {
    /// Kill session `session_id` and schedule removal of its files.
    ///
    /// The registry entry is gone before this returns, so a duplicate stop
    /// sees "not running" and sends no second signal. Signal and cleanup
    /// failures are logged, never returned.
    pub async fn stop_stream(&self, session_id: &str) -> StopOutcome {
        if validate_session_id(session_id).is_err() {
            // Such an id can never have been registered.
            tracing::debug!(session_id, "Stop for invalid session id");
            return StopOutcome::not_running(session_id);
        }

        let Some(descriptor) = self.registry.take(session_id).await else {
            tracing::info!(session_id, "Stop requested for session that is not running");
            return StopOutcome::not_running(session_id);
        };

        let from_marker = descriptor.origin == DescriptorOrigin::Marker;
        // A marker outlives its process; never signal a pid that is not
        // running.
        let signalled = if from_marker && !self.driver.is_alive(descriptor.pid) {
            tracing::info!(session_id, pid = descriptor.pid, "Marker process is gone, not signalling");
            false
        } else {
            self.kill_transcoder(session_id, descriptor.pid, from_marker)
        };

        self.schedule_dir_cleanup(&descriptor.work_dir);

        StopOutcome {
            session_id: session_id.to_string(),
            was_running: true,
            pid: Some(descriptor.pid),
            signalled,
        }
    }

    fn kill_transcoder(&self, session_id: &str, pid: u32, from_marker: bool) -> bool {
        match self.driver.kill(pid) {
            Ok(()) => {
                tracing::info!(session_id, pid, from_marker, "Transcoder killed");
                true
            }
            Err(e) if is_no_such_process(&e) => {
                tracing::debug!(session_id, pid, "Transcoder already gone");
                false
            }
            Err(e) => {
                tracing::warn!(session_id, pid, error = %e, "Failed to kill transcoder");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::driver::ProcessDriver;
    use crate::test_support::{eventually, test_config, FakeDriver};

    const SOURCE: &str = "rtsp://camera.local/stream1";

    async fn supervisor(root: &std::path::Path) -> (Arc<StreamSupervisor>, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::default());
        let sup = StreamSupervisor::start(
            test_config(root),
            Arc::clone(&driver) as Arc<dyn ProcessDriver>,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (sup, driver)
    }

    #[tokio::test]
    async fn stop_kills_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let (sup, driver) = supervisor(root.path()).await;
        let started = sup
            .start_stream("cam-1", SOURCE, &CancellationToken::new())
            .await
            .unwrap();
        let work_dir = sup.registry().get("cam-1").await.unwrap().work_dir;

        let outcome = sup.stop_stream("cam-1").await;
        assert!(outcome.was_running);
        assert!(outcome.signalled);
        assert_eq!(outcome.pid, Some(started.pid));
        assert_eq!(driver.killed(), vec![started.pid]);
        assert!(!sup.registry().exists("cam-1").await);
        assert!(sup.registry().markers().read("cam-1").await.unwrap().is_none());
        assert!(eventually(|| {
            let work_dir = work_dir.clone();
            async move { !work_dir.exists() }
        })
        .await);
    }

    #[tokio::test]
    async fn second_stop_sends_no_signal() {
        let root = tempfile::tempdir().unwrap();
        let (sup, driver) = supervisor(root.path()).await;
        sup.start_stream("cam-1", SOURCE, &CancellationToken::new())
            .await
            .unwrap();

        assert!(sup.stop_stream("cam-1").await.was_running);
        let again = sup.stop_stream("cam-1").await;
        assert!(!again.was_running);
        assert_eq!(again.pid, None);
        assert_eq!(driver.killed().len(), 1);
    }

    #[tokio::test]
    async fn stop_unknown_or_invalid_is_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        let (sup, driver) = supervisor(root.path()).await;
        assert!(!sup.stop_stream("never-started").await.was_running);
        assert!(!sup.stop_stream("../../etc/passwd").await.was_running);
        assert!(driver.killed().is_empty());
    }

    #[tokio::test]
    async fn concurrent_stops_signal_once() {
        let root = tempfile::tempdir().unwrap();
        let (sup, driver) = supervisor(root.path()).await;
        sup.start_stream("cam-1", SOURCE, &CancellationToken::new())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sup = Arc::clone(&sup);
            handles.push(tokio::spawn(async move { sup.stop_stream("cam-1").await }));
        }
        let mut found = 0;
        for h in handles {
            if h.await.unwrap().was_running {
                found += 1;
            }
        }
        assert_eq!(found, 1);
        assert_eq!(driver.killed().len(), 1);
    }

    #[tokio::test]
    async fn stop_from_another_instance_uses_marker() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let (first, _first_driver) = supervisor(root.path()).await;
        let started = first
            .start_stream("cam-1", SOURCE, &CancellationToken::new())
            .await
            .unwrap();

        let second_driver = Arc::new(FakeDriver::default());
        second_driver.set_external_alive(started.pid);
        let second = StreamSupervisor::start(
            config,
            Arc::clone(&second_driver) as Arc<dyn ProcessDriver>,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let outcome = second.stop_stream("cam-1").await;
        assert!(outcome.was_running);
        assert!(outcome.signalled);
        assert_eq!(second_driver.killed(), vec![started.pid]);
        assert!(!second.registry().exists("cam-1").await);
    }

    #[tokio::test]
    async fn stop_of_dead_marker_pid_still_acknowledges() {
        let root = tempfile::tempdir().unwrap();
        let (sup, driver) = supervisor(root.path()).await;
        sup.registry()
            .markers()
            .write(&crate::marker::SessionMarker {
                session_id: "ghost".into(),
                pid: 31337,
                work_dir: sup.config().streams_root.join("ghost-x"),
                url: "/streams/ghost-x/index.m3u8".into(),
                started_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let outcome = sup.stop_stream("ghost").await;
        assert!(outcome.was_running);
        assert!(!outcome.signalled);
        assert!(driver.killed().is_empty());
        assert!(driver.kill_attempts().is_empty());
        assert!(!sup.registry().exists("ghost").await);
    }

    #[tokio::test]
    async fn start_and_stop_race_leaves_consistent_state() {
        let root = tempfile::tempdir().unwrap();
        let (sup, _driver) = supervisor(root.path()).await;

        let mut handles = Vec::new();
        for i in 0..10 {
            let sup = Arc::clone(&sup);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let _ = sup.start_stream("cam-1", SOURCE, &CancellationToken::new()).await;
                } else {
                    sup.stop_stream("cam-1").await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let in_memory = sup.registry.exit_watch("cam-1").await.map(|(d, _)| d.pid);
        let marker = sup
            .registry()
            .markers()
            .read("cam-1")
            .await
            .unwrap()
            .map(|m| m.pid);
        assert_eq!(in_memory, marker);
    }
}
