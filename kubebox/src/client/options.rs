//! Configuration for [`KubeboxClient`](super::KubeboxClient).

use std::path::PathBuf;
use std::time::Duration;

use dirs::home_dir;

use super::constants::{envs, lock, wait};
use super::layout::dirs as const_dirs;
use crate::cert::CertSettings;

/// Retry budget for a polling wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl WaitPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Configuration options for KubeboxClient.
///
/// Users can create it with defaults and modify fields as needed.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Root of the store, certificates, locks and logs
    pub home_dir: PathBuf,

    /// Upper bound on waiting for the certificate lock
    pub lock_timeout: Duration,

    pub certs: CertSettings,

    /// Waiting for a machine to reach a power state
    pub machine_wait: WaitPolicy,

    /// Waiting for the runtime API port after power-on
    pub runtime_wait: WaitPolicy,

    /// Install the tracing file subscriber under `home_dir/logs`
    pub file_logging: bool,

    /// TLS-handshake with the guest runtime after create, start and restart,
    /// regenerating certificates once if it is rejected
    pub check_runtime_tls: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let home_dir = std::env::var(envs::KUBEBOX_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
                path.push(const_dirs::KUBEBOX_DIR);
                path
            });

        Self {
            home_dir,
            lock_timeout: lock::ACQUIRE_TIMEOUT,
            certs: CertSettings::default(),
            machine_wait: WaitPolicy::new(wait::STATE_ATTEMPTS, wait::STATE_DELAY),
            runtime_wait: WaitPolicy::new(wait::RUNTIME_ATTEMPTS, wait::RUNTIME_DELAY),
            file_logging: true,
            check_runtime_tls: true,
        }
    }
}

impl ClientOptions {
    /// Defaults rooted at `home_dir`.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ClientOptions::default();
        assert_eq!(opts.lock_timeout, Duration::from_secs(5));
        assert_eq!(opts.machine_wait, WaitPolicy::new(60, Duration::from_secs(3)));
        assert_eq!(opts.runtime_wait, WaitPolicy::new(10, Duration::from_secs(3)));
        assert_eq!(opts.certs.key_bits, 2048);
        assert_eq!(opts.certs.validity, Duration::from_secs(1080 * 24 * 3600));
        assert_eq!(opts.certs.clock_skew, Duration::from_secs(300));
        assert!(opts.check_runtime_tls);
    }

    #[test]
    fn test_with_home() {
        let opts = ClientOptions::with_home("/srv/kubebox");
        assert_eq!(opts.home_dir, PathBuf::from("/srv/kubebox"));
    }
}
