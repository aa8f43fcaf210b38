pub mod fs;
pub mod process;
pub mod versioncmp;

use std::path::PathBuf;
use std::time::Duration;

use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Find an executable on `PATH`.
///
/// # Returns
/// * `Ok(PathBuf)` - First matching executable
/// * `Err(...)` - Binary not found in any `PATH` entry
pub fn find_binary(binary_name: &str) -> KubeboxResult<PathBuf> {
    let search_path = std::env::var_os("PATH").unwrap_or_default();

    for dir in std::env::split_paths(&search_path) {
        let candidate = dir.join(binary_name);
        tracing::trace!("Finding binary {:?} in path: {:?}", binary_name, candidate);
        if is_executable(&candidate) {
            tracing::debug!(binary = %candidate.display(), "Found binary");
            return Ok(candidate);
        }
    }

    Err(KubeboxError::Driver(format!(
        "Binary '{}' not found in PATH",
        binary_name
    )))
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

/// Name of the user running this process, used as the certificate organization.
pub fn current_username() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "kubebox".to_string())
}

/// Poll `predicate` up to `attempts` times, sleeping `delay` between tries.
///
/// Returns `true` as soon as the predicate holds, `false` once attempts run out.
pub fn wait_for_specific<F>(mut predicate: F, attempts: u32, delay: Duration) -> bool
where
    F: FnMut() -> bool,
{
    for attempt in 0..attempts {
        if predicate() {
            return true;
        }
        if attempt + 1 < attempts {
            std::thread::sleep(delay);
        }
    }
    false
}
