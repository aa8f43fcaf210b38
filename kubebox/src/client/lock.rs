//! Cross-process lock serializing certificate bootstrap.
//!
//! Unix uses `flock(2)` on a sentinel file, polled with `LOCK_NB` until the
//! timeout. Elsewhere an `O_CREAT|O_EXCL` lock file holding the owner's PID
//! is used; files older than [`lock::STALE_AFTER`] are reclaimed.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use kubebox_shared::errors::{KubeboxError, KubeboxResult};

use super::constants::lock;

/// Guard holding the certificate lock.
///
/// The lock is released when this guard is dropped, or when the process
/// exits/crashes (unix).
#[derive(Debug)]
pub struct CertLock {
    #[allow(dead_code)] // Held for lifetime, not directly accessed
    file: File,
    path: PathBuf,
}

impl CertLock {
    /// Acquire the lock at `path`, waiting at most `timeout`.
    ///
    /// # Returns
    /// * `Ok(CertLock)` - Lock held until the guard drops
    /// * `Err(LockAcquireTimeout)` - Another holder kept it past `timeout`
    /// * `Err(Storage)` - The lock file could not be opened
    pub fn acquire(path: &Path, timeout: Duration) -> KubeboxResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KubeboxError::Storage(format!("failed to create lock dir: {}", e))
            })?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(file) = try_lock(path)? {
                tracing::debug!(lock_path = %path.display(), "Acquired certificate lock");
                return Ok(CertLock {
                    file,
                    path: path.to_path_buf(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(KubeboxError::LockAcquireTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(lock::POLL_INTERVAL.min(deadline - now));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(path: &Path) -> KubeboxResult<Option<File>> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(|e| KubeboxError::Storage(format!("failed to open lock file: {}", e)))?;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(Some(file));
    }

    let err = std::io::Error::last_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock {
        Ok(None)
    } else {
        Err(KubeboxError::Storage(format!("failed to acquire lock: {}", err)))
    }
}

#[cfg(not(unix))]
fn try_lock(path: &Path) -> KubeboxResult<Option<File>> {
    use std::io::Write;

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let _ = write!(file, "{}", std::process::id());
            Ok(Some(file))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if is_stale(path) {
                tracing::warn!(lock_path = %path.display(), "Reclaiming stale lock file");
                let _ = std::fs::remove_file(path);
            }
            Ok(None)
        }
        Err(e) => Err(KubeboxError::Storage(format!(
            "failed to create lock file: {}",
            e
        ))),
    }
}

#[cfg(not(unix))]
fn is_stale(path: &Path) -> bool {
    let owner = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    if owner == Some(std::process::id()) {
        return false;
    }
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > lock::STALE_AFTER)
}

impl Drop for CertLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = self.file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = std::fs::remove_file(&self.path);
        }

        tracing::debug!(lock_path = %self.path.display(), "Released certificate lock");
    }
}
