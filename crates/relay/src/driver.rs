//! Process spawning and signalling.
//!
//! [`ProcessDriver`] is the seam between the supervisor and the operating
//! system. [`FfmpegDriver`] is the production implementation built on
//! [`tokio::process`] and `kill(2)`; tests substitute a fake so the state
//! machine can be exercised without real subprocesses.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;

/// Number of stderr lines kept for diagnostics when a process exits.
const STDERR_TAIL_LINES: usize = 20;

/// Fully resolved transcoder invocation.
#[derive(Debug, Clone)]
pub struct TranscodeCommand {
    pub session_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
}

/// How a process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    /// Terminating signal on Unix.
    pub signal: Option<i32>,
    /// Last lines of stderr.
    pub diagnostics: String,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A freshly spawned process. The receiver resolves exactly once, after the
/// process has been reaped.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub exit: oneshot::Receiver<ExitReport>,
}

/// Operating-system operations the supervisor needs.
pub trait ProcessDriver: Send + Sync + 'static {
    /// Spawn the transcoder. Must be called from within a Tokio runtime.
    fn spawn(&self, command: &TranscodeCommand) -> io::Result<SpawnedProcess>;

    /// Forcefully terminate `pid`.
    fn kill(&self, pid: u32) -> io::Result<()>;

    /// Whether `pid` still refers to a live process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Production driver: real subprocesses, `SIGKILL` termination.
#[derive(Debug, Default, Clone)]
pub struct FfmpegDriver;

impl ProcessDriver for FfmpegDriver {
    fn spawn(&self, command: &TranscodeCommand) -> io::Result<SpawnedProcess> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Sessions are resolvable by pid from other server instances, so
            // the process must not die with the handle.
            .kill_on_drop(false)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before its pid could be read"))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = oneshot::channel();
        let session_id = command.session_id.clone();

        tokio::spawn(async move {
            let stdout_task = tokio::spawn(forward_lines(stdout, session_id.clone(), "stdout"));
            let stderr_task = tokio::spawn(forward_lines(stderr, session_id.clone(), "stderr"));

            let status = child.wait().await;
            let diagnostics = stderr_task.await.unwrap_or_default();
            let _ = stdout_task.await;

            let report = match status {
                Ok(status) => ExitReport {
                    code: status.code(),
                    signal: exit_signal(&status),
                    diagnostics,
                },
                Err(e) => ExitReport {
                    code: None,
                    signal: None,
                    diagnostics: format!("failed to wait for transcoder: {e}"),
                },
            };
            tracing::debug!(session_id = %session_id, pid, code = ?report.code, "Transcoder reaped");
            let _ = tx.send(report);
        });

        Ok(SpawnedProcess { pid, exit: rx })
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        send_signal(pid, Signal::Kill)
    }

    fn is_alive(&self, pid: u32) -> bool {
        match send_signal(pid, Signal::Probe) {
            Ok(()) => true,
            // The process exists but belongs to another user.
            Err(e) => e.kind() == io::ErrorKind::PermissionDenied,
        }
    }
}

/// Log every line of a child stream and return the last
/// [`STDERR_TAIL_LINES`] lines. Bytes are decoded lossily and the stream is
/// drained until EOF; closing the pipe early would kill the child on its
/// next write.
async fn forward_lines<R: AsyncRead + Unpin>(
    handle: Option<R>,
    session_id: String,
    stream: &'static str,
) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let Some(handle) = handle else {
        return String::new();
    };
    let mut reader = BufReader::new(handle);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(session_id = %session_id, stream, error = %e, "Stream read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        tracing::debug!(session_id = %session_id, stream, "{line}");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

#[derive(Clone, Copy)]
enum Signal {
    /// Signal 0: existence and permission check only.
    Probe,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    // pid 0 and negative values address process groups.
    let pid: libc::pid_t = match pid.try_into() {
        Ok(p) if p > 0 => p,
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to signal pid {pid}"),
            ))
        }
    };
    let sig = match signal {
        Signal::Probe => 0,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the pid is a
    // positive value so only a single process can be addressed.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process signalling is only supported on Unix",
    ))
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Whether a kill error means the process was already gone.
pub fn is_no_such_process(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        err.kind() == io::ErrorKind::NotFound
    }
}
