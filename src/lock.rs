use std::fs;
use std::path::{Path, PathBuf};

use crate::log_warn;

/// A named advisory lock, released on drop.
///
/// Three locks use this mechanism: the per-run writer lock
/// (`run-<run_id>`), the workspace lease (`workspace`), and the pending
/// moves queue lock (`pending-moves`).
#[must_use = "lock is released when LockGuard is dropped"]
pub struct LockGuard {
    lock: fslock::LockFile,
    pid_path: PathBuf,
    name: String,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Warning: Failed to release lock '{}': {}", self.name, e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            log_warn!(
                "Warning: Failed to remove PID file {}: {}",
                self.pid_path.display(),
                e
            );
        }
    }
}

/// Attempt to acquire the named advisory lock under `runtime_dir`.
///
/// Creates `runtime_dir` if missing. The file lock is the mutual exclusion
/// primitive; the PID file exists purely for diagnostics on contention.
///
/// Returns `Err` with an actionable message when another holder is alive.
pub fn try_acquire(runtime_dir: &Path, name: &str) -> Result<LockGuard, String> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let lock_path = runtime_dir.join(format!("{}.lock", name));
    let pid_path = runtime_dir.join(format!("{}.pid", name));

    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let acquired = lock
        .try_lock()
        .map_err(|e| format!("Failed to acquire lock '{}': {}", name, e))?;

    if !acquired {
        let holder_pid = fs::read_to_string(&pid_path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());

        return match holder_pid {
            Some(pid) if is_pid_alive(pid) => Err(format!(
                "Lock '{}' is held by a running process (PID {})",
                name, pid
            )),
            Some(pid) => Err(format!(
                "Lock '{}' is held but recorded PID {} is not alive. \
                 Remove {} and {} to recover",
                name,
                pid,
                lock_path.display(),
                pid_path.display()
            )),
            None => Err(format!(
                "Another process holds lock '{}'. If this is stale, remove {}",
                name,
                lock_path.display()
            )),
        };
    }

    // We hold the lock — safe to write PID
    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| format!("Failed to write PID file: {}", e))?;

    Ok(LockGuard {
        lock,
        pid_path,
        name: name.to_string(),
    })
}

/// Acquire the single-writer lock for a run. A failure here means a second
/// writer exists, which is fatal for the run.
pub fn acquire_run_lock(runtime_dir: &Path, run_id: &str) -> Result<LockGuard, String> {
    try_acquire(runtime_dir, &format!("run-{}", run_id))
}

/// Acquire the exclusive workspace lease held across a governed apply.
pub fn acquire_workspace_lease(runtime_dir: &Path) -> Result<LockGuard, String> {
    try_acquire(runtime_dir, "workspace")
}

fn is_pid_alive(pid: i32) -> bool {
    // signal 0 checks if process exists without sending a signal
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
