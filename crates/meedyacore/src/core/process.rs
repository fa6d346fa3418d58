//! Process helpers for the downloader subprocess
//!
//! Termination is two-phase: a graceful signal first, a forced kill once the
//! grace period runs out.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

use crate::core::error::AppError;

/// Ask a child to stop, then kill it if it is still running after `grace`.
///
/// Returns the exit status once the process is gone.
pub async fn terminate_gracefully(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    match child.id() {
        Some(pid) => send_terminate(pid),
        None => return child.wait().await,
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            log::warn!("Process did not exit within {:?}, killing", grace);
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    if pid == 0 || pid > i32::MAX as u32 {
        log::warn!("Refusing to signal out-of-range pid {}", pid);
        return;
    }
    match std::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .output()
    {
        Ok(out) if out.status.success() => log::debug!("Sent SIGTERM to pid {}", pid),
        Ok(out) => log::debug!(
            "kill -TERM {} exited with {}: {}",
            pid,
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        ),
        Err(e) => log::warn!("Failed to run kill for pid {}: {}", pid, e),
    }
}

// No graceful signal off unix; the grace period just elapses before the kill.
#[cfg(not(unix))]
fn send_terminate(_pid: u32) {}

/// Turn a spawn failure into the engine's error taxonomy.
pub fn spawn_error(program: &str, err: io::Error) -> AppError {
    match err.kind() {
        io::ErrorKind::NotFound => AppError::Spawn(format!("{} not found in PATH or at the configured location", program)),
        io::ErrorKind::PermissionDenied => AppError::Spawn(format!("{} is not executable", program)),
        _ => AppError::Spawn(format!("{}: {}", program, err)),
    }
}
