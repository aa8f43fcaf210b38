//! Filesystem helpers with explicit permission bits.

use std::io::Write;
use std::path::Path;

use kubebox_shared::errors::{KubeboxError, KubeboxResult};

/// Create `dir` (and parents) and set its mode.
pub fn ensure_dir(dir: &Path, mode: u32) -> KubeboxResult<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        KubeboxError::Storage(format!(
            "Failed to create directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    set_mode(dir, mode)
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> KubeboxResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
        KubeboxError::Storage(format!(
            "Failed to set mode {:o} on {}: {}",
            mode,
            path.display(),
            e
        ))
    })
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> KubeboxResult<()> {
    Ok(())
}

/// Replace `path` with `contents` so readers see either the old or new file.
///
/// The data goes to a sibling temp file which is synced, chmod'ed and then
/// renamed over the target. Rename is atomic within one filesystem on unix;
/// elsewhere the target is removed first.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> KubeboxResult<()> {
    let parent = path.parent().ok_or_else(|| {
        KubeboxError::Storage(format!("No parent directory for {}", path.display()))
    })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)
        .map_err(|e| {
            KubeboxError::Storage(format!(
                "Failed to create temp file in {}: {}",
                parent.display(),
                e
            ))
        })?;

    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| {
            KubeboxError::Storage(format!(
                "Failed to write temp file for {}: {}",
                path.display(),
                e
            ))
        })?;
    set_mode(tmp.path(), mode)?;

    #[cfg(not(unix))]
    if path.exists() {
        std::fs::remove_file(path)?;
    }

    tmp.persist(path).map_err(|e| {
        KubeboxError::Storage(format!("Failed to rename into {}: {}", path.display(), e))
    })?;
    Ok(())
}

/// Remove a file, treating "already absent" as success.
pub fn remove_if_exists(path: &Path) -> KubeboxResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KubeboxError::Storage(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_atomic_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("config.json");

        write_atomic(&target, b"first", 0o600).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"first");

        write_atomic(&target, b"second", 0o600).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"second");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn modes_are_applied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("a/b");
        ensure_dir(&sub, 0o700).unwrap();
        let file = sub.join("key.pem");
        write_atomic(&file, b"secret", 0o600).unwrap();

        let dir_mode = std::fs::metadata(&sub).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn remove_if_exists_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        remove_if_exists(&dir.path().join("nope")).unwrap();
    }
}
