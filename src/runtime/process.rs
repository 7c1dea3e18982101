//! Process-group termination for spawned interpreters and shell commands.
//!
//! Every child is spawned as the leader of its own process group
//! (`Command::process_group(0)`), so killing the group also reaches
//! grandchildren such as `sleep` launched from `sh -c`.

use std::io;
use std::time::Duration;

use tokio::process::Child;
use tracing::debug;

/// Grace period between SIGTERM and SIGKILL for a worker being shut down.
pub const GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Puts the child in a fresh process group when supported.
pub fn isolate_group(command: &mut tokio::process::Command) {
    #[cfg(unix)]
    command.process_group(0);
    #[cfg(not(unix))]
    let _ = command;
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let result = unsafe { libc::killpg(pgid as libc::pid_t, signal) };
    if result == -1 {
        let err = io::Error::last_os_error();
        // ESRCH: the group is already gone
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

/// Sends SIGKILL to a whole process group (best-effort).
#[cfg(unix)]
pub fn kill_group(pgid: u32) -> io::Result<()> {
    signal_group(pgid, libc::SIGKILL)
}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32) -> io::Result<()> {
    Ok(())
}

/// Kills the child's process group, then reaps the child.
pub async fn kill_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill_group(pid) {
            debug!("killpg({pid}) failed: {e}");
        }
    }
    // Falls back to killing the leader alone (non-unix, or group already gone)
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// SIGTERM to the group, wait up to `grace`, then SIGKILL.
pub async fn terminate_tree(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if signal_group(pid, libc::SIGTERM).is_ok()
            && tokio::time::timeout(grace, child.wait()).await.is_ok()
        {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    kill_tree(child).await;
}
