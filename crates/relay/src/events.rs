//! Process exit handling.
//!
//! Every launched transcoder gets a forwarder task that waits for the
//! driver's exit report, publishes it on the session's exit watch and sends
//! a [`SessionEvent`] to the supervisor's event loop. The loop deregisters
//! the session and schedules removal of its directory whatever the exit
//! code, so this is the one cleanup path every session goes through.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::cleanup::{is_within, schedule_cleanup};
use crate::driver::ExitReport;
use crate::registry::SessionRegistry;

#[derive(Debug)]
pub enum SessionEvent {
    Exited {
        session_id: String,
        pid: u32,
        work_dir: PathBuf,
        report: ExitReport,
    },
}

/// Wait for `exit`, publish it on `watch_tx`, then notify the event loop.
pub(crate) fn spawn_exit_forwarder(
    session_id: String,
    pid: u32,
    work_dir: PathBuf,
    exit: oneshot::Receiver<ExitReport>,
    watch_tx: watch::Sender<Option<ExitReport>>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    tokio::spawn(async move {
        let report = exit.await.unwrap_or_else(|_| ExitReport {
            diagnostics: "exit status was lost".to_string(),
            ..ExitReport::default()
        });
        watch_tx.send_replace(Some(report.clone()));
        let _ = events.send(SessionEvent::Exited {
            session_id,
            pid,
            work_dir,
            report,
        });
    });
}

/// Consume exit events until `cancel` fires or every sender is gone.
pub async fn run_event_loop(
    registry: Arc<SessionRegistry>,
    streams_root: PathBuf,
    cleanup_delay: Duration,
    mut rx: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
) {
    tracing::debug!("Relay event loop started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                handle_event(&registry, &streams_root, cleanup_delay, event).await;
            }
        }
    }
    tracing::debug!("Relay event loop stopped");
}

async fn handle_event(
    registry: &SessionRegistry,
    streams_root: &std::path::Path,
    cleanup_delay: Duration,
    event: SessionEvent,
) {
    match event {
        SessionEvent::Exited {
            session_id,
            pid,
            work_dir,
            report,
        } => {
            let removed = registry.remove_if_pid(&session_id, pid).await.is_some();
            if removed {
                // Nobody asked for this one to stop.
                tracing::warn!(
                    session_id = %session_id,
                    pid,
                    code = ?report.code,
                    signal = ?report.signal,
                    diagnostics = %report.diagnostics,
                    "Transcoder exited on its own",
                );
            } else {
                tracing::debug!(session_id = %session_id, pid, code = ?report.code, "Transcoder exited");
            }
            if is_within(streams_root, &work_dir) {
                schedule_cleanup(work_dir, cleanup_delay);
            }
        }
    }
}
