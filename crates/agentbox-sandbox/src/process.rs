//! Subprocess execution with incremental output capture.
//!
//! Output is drained into shared buffers while the child runs, so a timeout
//! still returns everything written before the kill. On Unix each command
//! leads its own process group and a timeout kills the whole group.

use crate::SandboxExecResult;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exit code reported when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Cap per stream; further output is discarded.
pub const MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;

/// How long to wait for a killed child to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for pipes to reach EOF after the child exits. Grandchildren
/// may keep them open.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Environment applied to every spawned command so tools avoid interactive
/// prompts and colored output.
pub const NON_INTERACTIVE_ENV: &[(&str, &str)] = &[
    ("TERM", "dumb"),
    ("NO_COLOR", "1"),
    ("GIT_TERMINAL_PROMPT", "0"),
    ("DEBIAN_FRONTEND", "noninteractive"),
];

#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

fn append(capture: &SharedCapture, chunk: &[u8]) {
    let mut guard = capture.lock().unwrap_or_else(|p| p.into_inner());
    let room = MAX_CAPTURE_BYTES.saturating_sub(guard.bytes.len());
    if chunk.len() > room {
        guard.truncated = true;
    }
    let take = chunk.len().min(room);
    guard.bytes.extend_from_slice(&chunk[..take]);
}

fn take_text(capture: &SharedCapture) -> String {
    let mut guard = capture.lock().unwrap_or_else(|p| p.into_inner());
    let mut text = String::from_utf8_lossy(&std::mem::take(&mut guard.bytes)).into_owned();
    if guard.truncated {
        text.push_str("\n[output truncated]");
    }
    text
}

fn drain<R>(mut reader: R, sink: SharedCapture) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => append(&sink, &buf[..n]),
                Err(e) => {
                    debug!(error = %e, "Output pipe closed with error");
                    break;
                }
            }
        }
    })
}

async fn finish_drain(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Kill the child and, on Unix, every process in its group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        kill_group(pid);
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Kill after timeout failed");
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers. The child was spawned with
    // process_group(0), so its pid is its group id.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } != 0 {
        debug!(pid, error = %std::io::Error::last_os_error(), "Killing process group failed");
    }
}

/// Spawn `command`, capture its output and wait for it, killing it after
/// `timeout`.
///
/// `label` names the program in spawn-failure messages.
pub async fn run_captured(
    mut command: Command,
    timeout: Option<Duration>,
    label: &str,
) -> SandboxExecResult {
    let started = Instant::now();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program = %label, error = %e, "Failed to spawn command");
            return SandboxExecResult::failure(
                format!("failed to spawn {}: {}", label, e),
                started.elapsed(),
            );
        }
    };

    let stdout: SharedCapture = Arc::default();
    let stderr: SharedCapture = Arc::default();
    let stdout_task = child.stdout.take().map(|s| drain(s, Arc::clone(&stdout)));
    let stderr_task = child.stderr.take().map(|s| drain(s, Arc::clone(&stderr)));

    let waited = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait()).await.ok(),
        None => Some(child.wait().await),
    };

    let mut extra_stderr = None;
    let exit_code = match waited {
        Some(Ok(status)) => exit_code_of(status),
        Some(Err(e)) => {
            extra_stderr = Some(format!("failed to wait for {}: {}", label, e));
            1
        }
        None => {
            let limit = timeout.unwrap_or_default();
            warn!(program = %label, timeout_ms = limit.as_millis() as u64, "Command timed out, killing");
            kill_tree(&mut child);
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                debug!(program = %label, "Killed command not reaped within grace period");
            }
            extra_stderr = Some(format!(
                "[command timed out after {}ms]",
                limit.as_millis()
            ));
            TIMEOUT_EXIT_CODE
        }
    };

    finish_drain(stdout_task).await;
    finish_drain(stderr_task).await;

    let mut stderr_text = take_text(&stderr);
    if let Some(extra) = extra_stderr {
        if !stderr_text.is_empty() && !stderr_text.ends_with('\n') {
            stderr_text.push('\n');
        }
        stderr_text.push_str(&extra);
    }

    SandboxExecResult {
        stdout: take_text(&stdout),
        stderr: stderr_text,
        exit_code,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_both_streams() {
        let result = run_captured(sh("echo out; echo err >&2; exit 3"), None, "sh").await;
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_result() {
        let result = run_captured(
            Command::new("/nonexistent/agentbox-binary"),
            None,
            "agentbox-binary",
        )
        .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("failed to spawn agentbox-binary"));
    }

    #[tokio::test]
    async fn test_timeout_keeps_partial_output() {
        let result = run_captured(
            sh("echo before; sleep 5; echo after"),
            Some(Duration::from_millis(300)),
            "sh",
        )
        .await;
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stdout.contains("before"));
        assert!(!result.stdout.contains("after"));
        assert!(result.stderr.contains("timed out after 300ms"));
        assert!(result.duration_ms < 5000);
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let script = format!("(sleep 1; touch '{}') & echo started; wait", marker.display());

        let result = run_captured(sh(&script), Some(Duration::from_millis(200)), "sh").await;
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stdout.contains("started"));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }
}
