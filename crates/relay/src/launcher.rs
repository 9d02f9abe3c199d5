//! Session start: idempotent launch plus readiness wait.

use std::path::PathBuf;

use kiln_core::session::{validate_session_id, validate_source_url, url_scheme, SessionState};
use kiln_core::transcode::{build_hls_args, playlist_path, PLAYLIST_FILENAME};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cleanup::remove_work_dir;
use crate::driver::TranscodeCommand;
use crate::error::{spawn_hint, RelayError};
use crate::events::spawn_exit_forwarder;
use crate::readiness::await_ready;
use crate::registry::{DescriptorOrigin, ExitWatch, SessionDescriptor, SessionEntry};
use crate::supervisor::StreamSupervisor;

/// Handle returned to a start caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedStream {
    pub session_id: String,
    pub url: String,
    pub pid: u32,
    /// `true` when an existing session was returned instead of a new launch.
    pub reused: bool,
}

/// Result of a launch as seen by callers that joined it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LaunchOutcome {
    Pending,
    Ready,
    TimedOut { waited_ms: u64 },
    ExitedEarly { exit_code: Option<i32>, diagnostics: String },
    Cancelled,
}

impl LaunchOutcome {
    fn of(result: &Result<(), RelayError>) -> Self {
        match result {
            Ok(()) => Self::Ready,
            Err(RelayError::ReadinessTimeout { waited_ms, .. }) => Self::TimedOut {
                waited_ms: *waited_ms,
            },
            Err(RelayError::ProcessExitedEarly {
                exit_code,
                diagnostics,
                ..
            }) => Self::ExitedEarly {
                exit_code: *exit_code,
                diagnostics: diagnostics.clone(),
            },
            Err(_) => Self::Cancelled,
        }
    }

    fn into_result(self, session_id: &str, pid: u32) -> Result<(), RelayError> {
        match self {
            Self::Ready => Ok(()),
            Self::TimedOut { waited_ms } => Err(RelayError::ReadinessTimeout {
                session_id: session_id.to_string(),
                pid,
                waited_ms,
            }),
            Self::ExitedEarly {
                exit_code,
                diagnostics,
            } => Err(RelayError::ProcessExitedEarly {
                session_id: session_id.to_string(),
                exit_code,
                diagnostics,
            }),
            Self::Pending | Self::Cancelled => Err(RelayError::Cancelled {
                session_id: session_id.to_string(),
            }),
        }
    }
}

/// Session that still has to pass the readiness wait.
struct PendingLaunch {
    descriptor: SessionDescriptor,
    exit: ExitWatch,
    role: LaunchRole,
}

enum LaunchRole {
    /// Spawned the process; publishes the outcome.
    Owner(watch::Sender<LaunchOutcome>),
    /// Joined another caller's launch. `None` when the owner's channel is
    /// unknown, in which case the joiner probes on its own.
    Joined(Option<watch::Receiver<LaunchOutcome>>),
}

enum Existing {
    Live(StartedStream),
    Launching(PendingLaunch),
    Absent,
}

impl StreamSupervisor {
    /// Start relaying `source_url` as session `session_id` and wait until
    /// its first playlist exists.
    ///
    /// A live session with the same id is returned as-is; a session still
    /// launching is waited on instead of spawning a second process, and its
    /// callers all see the outcome of that one launch.
    pub async fn start_stream(
        &self,
        session_id: &str,
        source_url: &str,
        cancel: &CancellationToken,
    ) -> Result<StartedStream, RelayError> {
        validate_session_id(session_id)?;
        validate_source_url(source_url, &self.config.allowed_schemes)?;

        let pending = {
            let _guard = self.launch_lock.lock().await;
            match self.resolve_existing(session_id).await {
                Existing::Live(started) => {
                    tracing::info!(session_id, pid = started.pid, "Reusing running session");
                    return Ok(started);
                }
                Existing::Launching(pending) => {
                    tracing::debug!(session_id, "Joining in-flight launch");
                    pending
                }
                Existing::Absent => self.launch(session_id, source_url).await?,
            }
        };

        let PendingLaunch {
            descriptor,
            exit,
            role,
        } = pending;
        let joined = matches!(role, LaunchRole::Joined(_));
        let result = match role {
            LaunchRole::Owner(outcome) => self.own_launch(&descriptor, &exit, outcome, cancel).await,
            LaunchRole::Joined(Some(owner)) => {
                self.follow_launch(&descriptor, &exit, owner, cancel).await
            }
            LaunchRole::Joined(None) => self.probe_joined(&descriptor, &exit, cancel).await,
        };

        result.map(|()| StartedStream {
            session_id: session_id.to_string(),
            url: descriptor.url.clone(),
            pid: descriptor.pid,
            reused: joined,
        })
    }

    /// Readiness wait of the caller that spawned the process.
    async fn own_launch(
        &self,
        descriptor: &SessionDescriptor,
        exit: &ExitWatch,
        outcome: watch::Sender<LaunchOutcome>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let result = self.probe(descriptor, exit, cancel).await;
        if result.is_ok() {
            self.mark_running(&descriptor.id).await;
        }
        outcome.send_replace(LaunchOutcome::of(&result));
        self.forget_in_flight(descriptor.pid);
        if result.is_err() {
            self.abort_launch(descriptor, exit).await;
        }
        result
    }

    /// Wait for the owner of a launch to publish its outcome.
    async fn follow_launch(
        &self,
        descriptor: &SessionDescriptor,
        exit: &ExitWatch,
        mut owner: watch::Receiver<LaunchOutcome>,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let published = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RelayError::Cancelled { session_id: descriptor.id.clone() });
            }
            published = owner.wait_for(|o| *o != LaunchOutcome::Pending) => {
                published.map(|o| (*o).clone())
            }
        };
        match published {
            Ok(outcome) => outcome.into_result(&descriptor.id, descriptor.pid),
            // The owner went away without deciding.
            Err(_) => self.probe_joined(descriptor, exit, cancel).await,
        }
    }

    /// Readiness wait of a joined caller with no owner to follow.
    async fn probe_joined(
        &self,
        descriptor: &SessionDescriptor,
        exit: &ExitWatch,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        let result = self.probe(descriptor, exit, cancel).await;
        match &result {
            Ok(()) => self.mark_running(&descriptor.id).await,
            // Leaving must not take the launch down for other callers.
            Err(RelayError::Cancelled { .. }) => {}
            Err(_) => self.abort_launch(descriptor, exit).await,
        }
        result
    }

    async fn probe(
        &self,
        descriptor: &SessionDescriptor,
        exit: &ExitWatch,
        cancel: &CancellationToken,
    ) -> Result<(), RelayError> {
        await_ready(
            &descriptor.id,
            descriptor.pid,
            &playlist_path(&descriptor.work_dir),
            exit,
            self.config.readiness_probe(),
            cancel,
        )
        .await
    }

    /// Promote a launching session through `Ready` to `Running`.
    async fn mark_running(&self, session_id: &str) {
        let launching = self
            .registry
            .exit_watch(session_id)
            .await
            .is_some_and(|(d, _)| d.state == SessionState::Launching);
        if launching && self.registry.set_state(session_id, SessionState::Ready).await {
            self.registry.set_state(session_id, SessionState::Running).await;
        }
    }

    fn forget_in_flight(&self, pid: u32) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&pid);
        }
    }

    fn in_flight_outcome(&self, pid: u32) -> Option<watch::Receiver<LaunchOutcome>> {
        self.in_flight.lock().ok()?.get(&pid).cloned()
    }

    async fn resolve_existing(&self, session_id: &str) -> Existing {
        if let Some((descriptor, exit)) = self.registry.exit_watch(session_id).await {
            let exited = exit.borrow().is_some();
            if exited {
                // The exit event has not been processed yet.
                self.discard_dead(&descriptor).await;
                return Existing::Absent;
            }
            let state = descriptor.state;
            return match state {
                _ if state.is_live() => Existing::Live(StartedStream {
                    session_id: descriptor.id,
                    url: descriptor.url,
                    pid: descriptor.pid,
                    reused: true,
                }),
                SessionState::Launching => {
                    let owner = self.in_flight_outcome(descriptor.pid);
                    Existing::Launching(PendingLaunch {
                        descriptor,
                        exit,
                        role: LaunchRole::Joined(owner),
                    })
                }
                _ => Existing::Absent,
            };
        }

        match self.registry.get(session_id).await {
            Some(descriptor) if descriptor.origin == DescriptorOrigin::Marker => {
                if self.driver.is_alive(descriptor.pid) {
                    tracing::info!(session_id, pid = descriptor.pid, "Session resolved from marker");
                    Existing::Live(StartedStream {
                        session_id: descriptor.id,
                        url: descriptor.url,
                        pid: descriptor.pid,
                        reused: true,
                    })
                } else {
                    tracing::info!(session_id, pid = descriptor.pid, "Discarding stale session marker");
                    self.discard_dead(&descriptor).await;
                    Existing::Absent
                }
            }
            _ => Existing::Absent,
        }
    }

    /// Create the working directory, spawn the transcoder and register the
    /// session as `Launching`.
    async fn launch(&self, session_id: &str, source_url: &str) -> Result<PendingLaunch, RelayError> {
        let dir_name = format!("{session_id}-{}", Uuid::new_v4().simple());
        let work_dir: PathBuf = self.config.streams_root.join(&dir_name);
        tokio::fs::create_dir_all(&work_dir).await?;

        let command = TranscodeCommand {
            session_id: session_id.to_string(),
            program: self.config.transcoder_bin.clone(),
            args: build_hls_args(source_url, &work_dir, &self.config.hls),
            work_dir: work_dir.clone(),
        };

        let spawned = match self.driver.spawn(&command) {
            Ok(spawned) => spawned,
            Err(source) => {
                let hint = spawn_hint(&command.program, &source);
                tracing::error!(
                    session_id,
                    program = %command.program,
                    error = %source,
                    "Failed to spawn transcoder",
                );
                remove_work_dir(&work_dir).await;
                return Err(RelayError::SpawnFailed {
                    program: command.program,
                    source,
                    hint,
                });
            }
        };
        let pid = spawned.pid;

        let url = format!(
            "{}/{dir_name}/{PLAYLIST_FILENAME}",
            self.config.public_prefix.trim_end_matches('/')
        );
        let (watch_tx, watch_rx) = watch::channel(None);
        let entry = SessionEntry {
            id: session_id.to_string(),
            pid,
            work_dir: work_dir.clone(),
            url,
            started_at: chrono::Utc::now(),
            state: SessionState::Launching,
            exit: watch_rx.clone(),
        };

        if let Err(e) = self.registry.put(entry).await {
            tracing::error!(session_id, pid, error = %e, "Failed to register session");
            if let Err(e) = self.driver.kill(pid) {
                tracing::debug!(session_id, pid, error = %e, "Kill after failed registration");
            }
            remove_work_dir(&work_dir).await;
            return Err(e.into());
        }

        // Registered first so the exit path always finds the entry.
        spawn_exit_forwarder(
            session_id.to_string(),
            pid,
            work_dir,
            spawned.exit,
            watch_tx,
            self.events.clone(),
        );

        tracing::info!(
            session_id,
            pid,
            scheme = url_scheme(source_url).as_deref().unwrap_or("unknown"),
            "Transcoder launched",
        );

        let descriptor = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| std::io::Error::other("session vanished right after registration"))?;
        let (outcome_tx, outcome_rx) = watch::channel(LaunchOutcome::Pending);
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.insert(pid, outcome_rx);
        }
        Ok(PendingLaunch {
            descriptor,
            exit: watch_rx,
            role: LaunchRole::Owner(outcome_tx),
        })
    }

    /// Tear down a launch that never became ready.
    async fn abort_launch(&self, descriptor: &SessionDescriptor, exit: &ExitWatch) {
        if exit.borrow().is_none() {
            if let Err(e) = self.driver.kill(descriptor.pid) {
                tracing::debug!(session_id = %descriptor.id, pid = descriptor.pid, error = %e, "Kill after failed launch");
            }
        }
        self.discard_dead(descriptor).await;
    }

    /// Deregister a session whose process is gone and clean up its files.
    async fn discard_dead(&self, descriptor: &SessionDescriptor) {
        self.forget_in_flight(descriptor.pid);
        if self
            .registry
            .remove_if_pid(&descriptor.id, descriptor.pid)
            .await
            .is_some()
        {
            self.schedule_dir_cleanup(&descriptor.work_dir);
        }
    }
}
