//! Daemon lock file using `flock(2)` directly.
//!
//! Uses raw `libc::flock` instead of RAII lock wrappers to avoid the
//! self-referential struct problem: an RAII guard borrows the lock owner,
//! making it impossible to store both in the same struct without lifetime
//! gymnastics. By calling `flock(2)` directly, we only need to own the
//! `File` (which owns the fd). `Drop` calls `flock(fd, LOCK_UN)` to
//! release.
//!
//! The lock file records the daemon PID and the stack it serves so a
//! second `gridctl up` fails with a useful diagnostic.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const LOCK_FILE_NAME: &str = "gridctl.lock";

/// Diagnostic information written into the lock file.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockDiagnostic {
    pub pid: u32,
    pub stack: String,
    pub acquired_at: DateTime<Utc>,
}

/// Daemon lock guard backed by `flock(2)`.
///
/// Holds the open `File` whose fd carries the advisory lock. On `Drop`,
/// the lock is explicitly released via `flock(fd, LOCK_UN)`.
pub struct DaemonLock {
    file: std::fs::File,
    lock_path: PathBuf,
}

impl std::fmt::Debug for DaemonLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // SAFETY: `fd` is a valid file descriptor owned by `self.file`.
        // `LOCK_UN` releases the advisory lock; if the call fails the lock
        // is still released when the fd closes moments later.
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

impl DaemonLock {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Default runtime directory for the lock file: `$XDG_RUNTIME_DIR/gridctl`,
/// falling back to `/tmp/gridctl-<uid>`.
pub fn default_runtime_dir() -> PathBuf {
    if let Some(runtime_dir) = directories::BaseDirs::new().and_then(|dirs| {
        dirs.runtime_dir().map(Path::to_path_buf)
    }) {
        return runtime_dir.join("gridctl");
    }
    PathBuf::from("/tmp").join(format!("gridctl-{}", effective_uid()))
}

fn effective_uid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: `geteuid` has no preconditions and returns caller effective UID.
        unsafe { libc::geteuid() }
    }

    #[cfg(not(unix))]
    {
        0
    }
}

/// Path of the lock file under a runtime directory.
pub fn lock_file_path(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join(LOCK_FILE_NAME)
}

/// Read the holder's diagnostic, if a lock file exists at all.
pub fn read_diagnostic(runtime_dir: &Path) -> Result<Option<LockDiagnostic>> {
    let path = lock_file_path(runtime_dir);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read lock file: {}", path.display()))?;
    let diagnostic = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse lock diagnostic: {}", path.display()))?;
    Ok(Some(diagnostic))
}

/// Acquire the exclusive daemon lock under `runtime_dir`.
///
/// On success the lock file is (re)written with a JSON diagnostic and the
/// file mode is 0600. On contention the holder's diagnostic is read back
/// into the error message.
pub fn acquire(runtime_dir: &Path, stack_name: &str) -> Result<DaemonLock> {
    std::fs::create_dir_all(runtime_dir).with_context(|| {
        format!("failed to create runtime directory: {}", runtime_dir.display())
    })?;

    let lock_path = runtime_dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(&lock_path)
        .with_context(|| format!("failed to open lock file: {}", lock_path.display()))?;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid descriptor from the `File` we just opened;
    // `LOCK_EX | LOCK_NB` requests an exclusive non-blocking lock.
    let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

    if ret == 0 {
        let mut lock = DaemonLock { file, lock_path };

        let diagnostic = LockDiagnostic {
            pid: std::process::id(),
            stack: stack_name.to_string(),
            acquired_at: Utc::now(),
        };
        let json =
            serde_json::to_string(&diagnostic).context("failed to serialize lock diagnostic")?;

        lock.file.set_len(0).context("failed to truncate lock file")?;
        lock.file
            .write_all(json.as_bytes())
            .context("failed to write lock diagnostic")?;
        lock.file.flush().context("failed to flush lock file")?;

        Ok(lock)
    } else {
        let mut contents = String::new();
        let mut holder = std::fs::File::open(&lock_path)
            .with_context(|| format!("failed to read held lock: {}", lock_path.display()))?;
        holder
            .read_to_string(&mut contents)
            .context("failed to read lock file")?;

        let message = if let Ok(diag) = serde_json::from_str::<LockDiagnostic>(&contents) {
            format!(
                "gridctl is already running (pid {}, stack '{}', since {})",
                diag.pid, diag.stack, diag.acquired_at
            )
        } else {
            "gridctl is already running (unable to read lock diagnostic)".to_string()
        };

        Err(anyhow::anyhow!(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    #[test]
    fn acquire_writes_diagnostic_with_own_pid() {
        let dir = tempdir().unwrap();
        let lock = acquire(dir.path(), "demo").expect("lock should succeed");

        let contents = std::fs::read_to_string(lock.lock_path()).unwrap();
        let diag: LockDiagnostic = serde_json::from_str(&contents).unwrap();
        assert_eq!(diag.pid, std::process::id());
        assert_eq!(diag.stack, "demo");
    }

    #[test]
    fn lock_file_is_owner_only() {
        let dir = tempdir().unwrap();
        let lock = acquire(dir.path(), "demo").expect("lock should succeed");

        let mode = std::fs::metadata(lock.lock_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn second_acquire_reports_holder() {
        let dir = tempdir().unwrap();
        let _held = acquire(dir.path(), "demo").expect("first lock should succeed");

        let err = acquire(dir.path(), "other").unwrap_err().to_string();
        assert!(err.contains("already running"), "got: {err}");
        assert!(err.contains(&std::process::id().to_string()), "got: {err}");
        assert!(err.contains("demo"), "got: {err}");
    }

    #[test]
    fn runtime_dir_is_created_on_demand() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("deep").join("runtime");
        assert!(!nested.exists());

        let _lock = acquire(&nested, "demo").expect("lock should succeed");
        assert!(nested.is_dir());
    }
}
