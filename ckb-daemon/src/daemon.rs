//! C9 — DaemonRoot lifecycle. Owns the daemon's PID file and the
//! start/stop sequence that brings up C5/C6/C7/C8 together and tears them
//! down again within a bounded shutdown window.

use crate::config::DaemonConfig;
use ckb_protocol::{CoreError, CoreResult};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory singleton for HTTP introspection only (spec §3's
/// `DaemonState`) — PID, start time, and a handful of health-check readings
/// the admin `/health` route reports. Nothing here is persisted; it is
/// rebuilt fresh on every start.
#[derive(Clone)]
pub struct DaemonState {
    pub pid: u32,
    started_at: Instant,
}

impl DaemonState {
    pub fn new() -> Self {
        DaemonState {
            pid: std::process::id(),
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves the root directory the daemon keeps its own state in
/// (`~/.ckb/daemon` by default), distinct from any single repo's `.ckb`
/// metadata directory.
pub fn daemon_root_dir() -> CoreResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CoreError::external("could not determine home directory"))?;
    Ok(home.join(".ckb").join("daemon"))
}

pub struct PidFile {
    path: PathBuf,
    held: bool,
}

impl PidFile {
    /// Acquire the PID file at `<daemon_dir>/ckb.pid`. If a PID file already
    /// exists and names a still-live process, this fails — otherwise a
    /// stale file from a crashed prior run is overwritten.
    ///
    /// Liveness is checked with `kill(pid, 0)`, which only verifies the pid
    /// is held by *some* live process, not that it is actually a CKB
    /// daemon — a known platform weakening (harmless: a false "alive"
    /// just refuses to start, it never double-starts).
    pub fn acquire(daemon_dir: &Path) -> CoreResult<Self> {
        fs::create_dir_all(daemon_dir)
            .map_err(|e| CoreError::external(format!("failed to create {:?}: {e}", daemon_dir)))?;
        let path = daemon_dir.join("ckb.pid");

        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                if process_is_alive(pid) {
                    return Err(CoreError::contention(format!(
                        "daemon already running with pid {pid}"
                    )));
                }
                warn!(pid, "removing stale pid file from a prior run");
            }
        }

        fs::write(&path, std::process::id().to_string())
            .map_err(|e| CoreError::external(format!("failed to write pid file: {e}")))?;

        Ok(PidFile { path, held: true })
    }

    pub fn release(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
            self.held = false;
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn process_is_alive(pid: i32) -> bool {
    // signal 0 sends nothing, only checks whether the kernel would accept
    // the send — EPERM still means the process exists.
    unsafe { libc::kill(pid, 0) == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM) }
}

#[cfg(not(unix))]
fn process_is_alive(_pid: i32) -> bool {
    // no portable liveness check outside unix; treat the pid file as
    // always describing a live process, which only makes us too cautious.
    true
}

/// Reads `shutdown_timeout_secs` from config, falling back to a sane default.
pub fn shutdown_timeout(config: &DaemonConfig) -> Duration {
    config
        .shutdown_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT)
}

/// Runs `stop_fn` and fails with a typed timeout error if it doesn't finish
/// within `timeout` — used to bound each stage of shutdown independently so
/// one wedged component can't hang the whole daemon indefinitely.
pub async fn bounded_shutdown<F>(stage: &str, timeout: Duration, stop_fn: F) -> CoreResult<()>
where
    F: std::future::Future<Output = ()>,
{
    match tokio::time::timeout(timeout, stop_fn).await {
        Ok(()) => {
            info!(stage, "shutdown stage completed");
            Ok(())
        }
        Err(_) => Err(CoreError::external(format!(
            "shutdown stage '{stage}' did not complete within {timeout:?}"
        ))),
    }
}
