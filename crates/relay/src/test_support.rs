//! In-process fake of [`ProcessDriver`] for supervisor tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use kiln_core::transcode::playlist_path;
use tokio::sync::oneshot;

use crate::driver::{ExitReport, ProcessDriver, SpawnedProcess, TranscodeCommand};
use crate::supervisor::RelayConfig;

/// What a fake transcoder does once spawned.
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Write the playlist immediately and keep running.
    WritePlaylist,
    /// Keep running without producing output.
    Silent,
    /// Exit right away with the given code and stderr.
    ExitImmediately { code: i32, diagnostics: String },
    /// Fail to spawn with the given error kind.
    FailSpawn(io::ErrorKind),
}

#[derive(Default)]
struct FakeState {
    running: HashMap<u32, oneshot::Sender<ExitReport>>,
    external: HashSet<u32>,
    spawned: Vec<TranscodeCommand>,
    kill_attempts: Vec<u32>,
    killed: Vec<u32>,
}

pub struct FakeDriver {
    next_pid: AtomicU32,
    behavior: Mutex<FakeBehavior>,
    state: Mutex<FakeState>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new(FakeBehavior::WritePlaylist)
    }
}

impl FakeDriver {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            behavior: Mutex::new(behavior),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Pretend `pid` is a live process this driver did not spawn.
    pub fn set_external_alive(&self, pid: u32) {
        self.state.lock().unwrap().external.insert(pid);
    }

    pub fn spawn_count(&self) -> usize {
        self.state.lock().unwrap().spawned.len()
    }

    pub fn spawned(&self) -> Vec<TranscodeCommand> {
        self.state.lock().unwrap().spawned.clone()
    }

    /// Every pid `kill` was called with, delivered or not.
    pub fn kill_attempts(&self) -> Vec<u32> {
        self.state.lock().unwrap().kill_attempts.clone()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.state.lock().unwrap().killed.clone()
    }

    /// Simulate a crash of a running process.
    pub fn crash(&self, pid: u32, code: i32, diagnostics: &str) {
        if let Some(tx) = self.state.lock().unwrap().running.remove(&pid) {
            let _ = tx.send(ExitReport {
                code: Some(code),
                signal: None,
                diagnostics: diagnostics.to_string(),
            });
        }
    }
}

impl ProcessDriver for FakeDriver {
    fn spawn(&self, command: &TranscodeCommand) -> io::Result<SpawnedProcess> {
        let behavior = self.behavior.lock().unwrap().clone();
        if let FakeBehavior::FailSpawn(kind) = behavior {
            return Err(io::Error::new(kind, "fake spawn failure"));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        state.spawned.push(command.clone());

        match behavior {
            FakeBehavior::WritePlaylist => {
                std::fs::write(playlist_path(&command.work_dir), "#EXTM3U\n")?;
                state.running.insert(pid, tx);
            }
            FakeBehavior::Silent => {
                state.running.insert(pid, tx);
            }
            FakeBehavior::ExitImmediately { code, diagnostics } => {
                let _ = tx.send(ExitReport {
                    code: Some(code),
                    signal: None,
                    diagnostics,
                });
            }
            FakeBehavior::FailSpawn(_) => unreachable!(),
        }

        Ok(SpawnedProcess { pid, exit: rx })
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.kill_attempts.push(pid);
        if let Some(tx) = state.running.remove(&pid) {
            state.killed.push(pid);
            let _ = tx.send(ExitReport {
                code: None,
                signal: Some(9),
                diagnostics: String::new(),
            });
            return Ok(());
        }
        if state.external.remove(&pid) {
            state.killed.push(pid);
            return Ok(());
        }
        Err(io::Error::from_raw_os_error(libc::ESRCH))
    }

    fn is_alive(&self, pid: u32) -> bool {
        let state = self.state.lock().unwrap();
        state.running.contains_key(&pid) || state.external.contains(&pid)
    }
}

/// Relay config rooted in a temporary directory with fast timings.
pub fn test_config(root: &Path) -> RelayConfig {
    let mut config = RelayConfig::new(root.join("streams"), root.join("markers"));
    config.readiness_timeout = Duration::from_millis(300);
    config.readiness_interval = Duration::from_millis(10);
    config.cleanup_delay = Duration::ZERO;
    config
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
