//! Shared subprocess plumbing for agent CLIs: bounded output capture,
//! wall-clock timeout, and cooperative cancellation with process-group
//! teardown so child tools are not orphaned.

use crate::errors::{AgentError, AgentResult};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Marker appended when a stream hits its capture ceiling.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Captured output of one CLI run.
#[derive(Debug, Clone)]
pub struct CliCapture {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Run a CLI to completion under `timeout`, capturing stdout up to
/// `stdout_limit` bytes (stderr gets a fixed 1 MB ceiling). The child is
/// spawned in its own process group; timeout or cancellation terminates the
/// whole group, SIGTERM first and SIGKILL after a grace period.
pub async fn run_cli(
    binary: &str,
    args: &[String],
    workdir: &Path,
    timeout: Duration,
    stdout_limit: usize,
    cancel: &CancellationToken,
) -> AgentResult<CliCapture> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| AgentError::SpawnFailed(format!("{}: {}", binary, e)))?;
    let pid = child.id();
    debug!(binary, pid = ?pid, "Agent process spawned");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::SpawnFailed("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AgentError::SpawnFailed("stderr not captured".to_string()))?;

    let stdout_task = tokio::spawn(drain_capped(stdout, stdout_limit));
    let stderr_task = tokio::spawn(drain_capped(stderr, 1024 * 1024));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(timeout) => None,
        _ = cancel.cancelled() => {
            terminate_group(pid, &mut child).await;
            collect_streams(stdout_task, stderr_task).await;
            return Err(AgentError::Cancelled);
        }
    };

    let Some(status) = waited else {
        terminate_group(pid, &mut child).await;
        collect_streams(stdout_task, stderr_task).await;
        return Err(AgentError::Timeout(timeout.as_secs()));
    };

    let status = status?;
    let ((stdout_bytes, stdout_truncated), (stderr_bytes, stderr_truncated)) =
        collect_streams(stdout_task, stderr_task).await;

    let mut stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
    if stdout_truncated {
        stdout.push_str(TRUNCATION_MARKER);
    }
    let mut stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
    if stderr_truncated {
        stderr.push_str(TRUNCATION_MARKER);
    }

    Ok(CliCapture {
        stdout,
        stderr,
        exit_code: status.code(),
        stdout_truncated,
        stderr_truncated,
    })
}

async fn collect_streams(
    stdout_task: tokio::task::JoinHandle<(Vec<u8>, bool)>,
    stderr_task: tokio::task::JoinHandle<(Vec<u8>, bool)>,
) -> ((Vec<u8>, bool), (Vec<u8>, bool)) {
    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    (stdout, stderr)
}

/// Read a stream to EOF, keeping at most `cap` bytes. The stream is drained
/// past the cap so the child never blocks on a full pipe.
async fn drain_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buf.len() < cap {
                    let keep = n.min(cap - buf.len());
                    buf.extend_from_slice(&chunk[..keep]);
                    if keep < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
            Err(_) => break,
        }
    }
    (buf, truncated)
}

/// SIGTERM the child's process group, wait out the grace period, then
/// SIGKILL whatever is left. Always reaps the child.
async fn terminate_group(pid: Option<u32>, child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        let pgid = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            warn!(pid, error = %e, "SIGTERM to process group failed");
        }
        let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
        if graceful.is_err() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    let _ = child.kill().await;
    let _ = child.wait().await;
}
