//! Shell subprocess execution with a hard wall-clock timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::environment::ProcessEnv;
use super::process;

/// Output is truncated past this many bytes per stream.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long to wait for pipes to drain once the process group is dead.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct ShellOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ShellOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Runs `command` with `sh -c` in `cwd`. On timeout the whole process
/// group is killed and whatever output was produced so far is returned.
pub async fn run_shell(
    command: &str,
    cwd: &Path,
    env: &ProcessEnv,
    timeout: Duration,
) -> std::io::Result<ShellOutcome> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    env.apply(&mut cmd);
    process::isolate_group(&mut cmd);

    let mut child = cmd.spawn()?;
    debug!("Spawned shell pid={:?}: {command}", child.id());

    let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_capped(s)));
    let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_capped(s)));

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!("Shell command timed out after {}s: {command}", timeout.as_secs());
            process::kill_tree(&mut child).await;
            (None, true)
        }
    };

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;
    Ok(ShellOutcome {
        stdout,
        stderr,
        exit_code,
        timed_out,
    })
}

/// Reads the whole stream, keeping the first `MAX_OUTPUT_BYTES`. The rest
/// is read and discarded so the writer never sees a closed pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut dropped = 0usize;
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Shell output read failed: {e}");
                break;
            }
        };
        let keep = n.min(MAX_OUTPUT_BYTES - buf.len());
        buf.extend_from_slice(&chunk[..keep]);
        dropped += n - keep;
    }
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if dropped > 0 {
        debug!("Shell output truncated, {dropped} byte(s) dropped");
        text.push_str("\n[output truncated]");
    }
    text
}

async fn drain(task: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            debug!("Shell output reader failed: {e}");
            String::new()
        }
        Err(_) => {
            // A detached descendant still holds the pipe open
            task.abort();
            String::new()
        }
    }
}
