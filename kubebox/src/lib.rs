//! Machine-lifecycle engine for local Kubernetes-in-a-VM clusters.
//!
//! A [`KubeboxClient`] drives a [`Driver`](drivers::Driver) chosen from the
//! [`DriverRegistry`] through bootstrap, creation, provisioning and the rest
//! of a machine's life, persisting each machine's descriptor in a
//! [`Filestore`](store::Filestore) under the kubebox home directory.

pub mod cert;
pub mod client;
pub mod drivers;
pub mod machine;
pub mod provision;
pub mod store;
pub mod util;

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub use client::{ClientOptions, KubeboxClient, WaitPolicy};
pub use drivers::{Driver, DriverDef, DriverRegistry, MachineState, Priority, ProbeState};
pub use kubebox_shared::errors::{KubeboxError, KubeboxResult};
pub use machine::{Machine, validate_machine_name};

use client::layout::StoreLayout;
use kubebox_shared::constants::filenames;

/// Keeps the background log writer alive for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Route `tracing` output to `<home>/logs/kubebox.log`.
///
/// Only the first call installs a subscriber; later calls (for other homes or
/// when the host application already set one) are no-ops.
pub fn init_logging_for(layout: &StoreLayout) -> KubeboxResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        KubeboxError::Storage(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::never(&logs_dir, filenames::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("kubebox=info"))
        .map_err(|e| KubeboxError::Config(format!("invalid log filter: {}", e)))?;

    if LOG_GUARD.set(guard).is_ok() {
        util::register_to_tracing(non_blocking, env_filter);
    }
    Ok(())
}
