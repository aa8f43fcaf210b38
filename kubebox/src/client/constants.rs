//! Constants for the lifecycle client.

use std::time::Duration;

pub use kubebox_shared::constants::filenames;

pub mod envs {
    pub const KUBEBOX_HOME: &str = "KUBEBOX_HOME";
}

/// Certificate lock timing.
pub mod lock {
    use super::Duration;

    /// How long to wait for another process to finish certificate bootstrap
    pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Interval between non-blocking lock attempts
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Age after which an O_EXCL lock file is considered abandoned
    pub const STALE_AFTER: Duration = Duration::from_secs(30);
}

/// Polling used while waiting on machines.
pub mod wait {
    use super::Duration;

    /// Power-state waits
    pub const STATE_ATTEMPTS: u32 = 60;
    pub const STATE_DELAY: Duration = Duration::from_secs(3);

    /// Waiting for the runtime API port inside the guest
    pub const RUNTIME_ATTEMPTS: u32 = 10;
    pub const RUNTIME_DELAY: Duration = Duration::from_secs(3);
}

/// Names of the steps in the creation pipeline, in execution order.
pub mod steps {
    pub const BOOTSTRAP_CERTS: &str = "bootstrapping certificates";
    pub const PRECREATE: &str = "precreate";
    pub const SAVING: &str = "saving";
    pub const CREATING: &str = "creating";
    pub const WAITING: &str = "waiting";
    pub const PROVISIONING: &str = "provisioning";
    pub const CHECKING_CONNECTION: &str = "checking connection";
}
