use std::path::{Path, PathBuf};

use kubebox_shared::errors::{KubeboxError, KubeboxResult};

use super::constants::filenames;
use crate::util::fs::ensure_dir;

/// Directory structure constants
pub mod dirs {
    /// Default home directory name under the user's home
    pub const KUBEBOX_DIR: &str = ".kubebox";

    /// Shared CA and client certificates
    pub const CERTS_DIR: &str = "certs";

    /// One subdirectory per machine
    pub const MACHINES_DIR: &str = "machines";

    /// Cross-process lock files
    pub const LOCKS_DIR: &str = "locks";

    /// Log files
    pub const LOGS_DIR: &str = "logs";
}

// ============================================================================
// STORE LAYOUT (home directory)
// ============================================================================

/// Paths under a kubebox home directory.
///
/// ```text
/// <home>/
///   certs/      ca.pem ca-key.pem cert.pem key.pem
///   machines/   <name>/config.json, server.pem, ...
///   locks/      certs.lock
///   logs/       kubebox.log
/// ```
#[derive(Clone, Debug)]
pub struct StoreLayout {
    home_dir: PathBuf,
}

impl StoreLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::CERTS_DIR)
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::MACHINES_DIR)
    }

    pub fn machine_dir(&self, name: &str) -> PathBuf {
        self.machines_dir().join(name)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOCKS_DIR)
    }

    pub fn cert_lock_path(&self) -> PathBuf {
        self.locks_dir().join(filenames::CERT_LOCK)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    /// Create every directory the client writes into.
    pub fn prepare(&self) -> KubeboxResult<()> {
        std::fs::create_dir_all(&self.home_dir).map_err(|e| {
            KubeboxError::Storage(format!(
                "Failed to create home directory {}: {}",
                self.home_dir.display(),
                e
            ))
        })?;
        ensure_dir(&self.certs_dir(), 0o700)?;
        ensure_dir(&self.machines_dir(), 0o700)?;
        ensure_dir(&self.locks_dir(), 0o755)?;
        ensure_dir(&self.logs_dir(), 0o755)?;
        Ok(())
    }
}
