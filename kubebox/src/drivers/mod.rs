//! Driver capability contract and the backends bundled with kubebox.

pub mod none;
pub mod registry;
pub mod state;

use std::path::PathBuf;

use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use serde::{Deserialize, Serialize};

pub use registry::{DriverDef, DriverRegistry, DriverStatus, Priority, ProbeState};
pub use state::MachineState;

/// Generic machine settings a driver's config factory turns into its raw
/// configuration blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    /// Machine name (also the store directory name)
    pub name: String,

    /// Directory the driver may use for its own artifacts
    pub store_path: PathBuf,

    /// Number of CPUs (default: 2)
    pub cpus: u32,

    /// Memory in MiB (default: 2048)
    pub memory_mib: u32,

    /// Disk size in MiB (default: 20000)
    pub disk_mib: u32,
}

impl MachineConfig {
    pub fn new(name: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            store_path: store_path.into(),
            cpus: 2,
            memory_mib: 2048,
            disk_mib: 20000,
        }
    }

    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_memory_mib(mut self, memory_mib: u32) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn with_disk_mib(mut self, disk_mib: u32) -> Self {
        self.disk_mib = disk_mib;
        self
    }
}

/// The capability set every machine backend implements.
///
/// A driver instance is produced by its registry definition's init factory
/// and then hydrated from the machine's raw driver bytes via
/// [`Driver::load_config`]. The orchestrator never inspects those bytes.
///
/// Power transitions must be synchronous: when `start()` or `restart()`
/// returns `Ok`, `get_state()` reports [`MachineState::Running`]. Calling
/// `start()` on a running machine (or `stop()` on a stopped one) should fail
/// with [`KubeboxError::HostAlreadyInState`].
pub trait Driver: Send {
    /// Registry name of this driver.
    fn driver_name(&self) -> String;

    /// Name of the machine this instance manages.
    fn machine_name(&self) -> String;

    /// Replace this instance's configuration with `raw`.
    fn load_config(&mut self, raw: &[u8]) -> KubeboxResult<()>;

    /// Serialize this instance's configuration for persistence.
    fn config_raw(&self) -> KubeboxResult<Vec<u8>>;

    /// Canonical endpoint of the running machine, `tcp://<ip>:<port>`.
    fn get_url(&self) -> KubeboxResult<String>;

    fn get_ip(&self) -> KubeboxResult<String>;

    fn get_state(&self) -> KubeboxResult<MachineState>;

    /// Validate host preconditions before anything is created.
    fn pre_create_check(&mut self) -> KubeboxResult<()>;

    /// Create the machine and return once SSH is reachable.
    fn create(&mut self) -> KubeboxResult<()>;

    fn start(&mut self) -> KubeboxResult<()>;

    fn stop(&mut self) -> KubeboxResult<()>;

    fn kill(&mut self) -> KubeboxResult<()>;

    fn restart(&mut self) -> KubeboxResult<()>;

    /// Tear the machine down. A machine that no longer exists is success.
    fn remove(&mut self) -> KubeboxResult<()>;

    fn get_ssh_hostname(&self) -> KubeboxResult<String>;

    fn get_ssh_key_path(&self) -> PathBuf;

    fn get_ssh_port(&self) -> KubeboxResult<u16>;

    fn get_ssh_username(&self) -> String;

    /// Run a shell command inside the machine and return its stdout.
    fn run_command(&mut self, cmd: &str) -> KubeboxResult<String>;

    /// Whether this driver manages the host itself rather than an isolated VM.
    fn is_bare_metal(&self) -> bool {
        false
    }
}

/// Report whether the driver currently observes `state`.
///
/// State query failures count as "not in state" so the predicate can be
/// polled while a machine boots.
pub fn machine_in_state(driver: &dyn Driver, state: MachineState) -> bool {
    match driver.get_state() {
        Ok(current) => current == state,
        Err(e) => {
            tracing::debug!(
                driver = %driver.driver_name(),
                error = %e,
                "State query failed while waiting"
            );
            false
        }
    }
}

/// Connection fields most drivers persist alongside their own settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseDriver {
    pub machine_name: String,
    pub store_path: PathBuf,
    pub ip_address: String,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub ssh_key_path: PathBuf,
}

impl BaseDriver {
    pub fn new(machine_name: impl Into<String>, store_path: impl Into<PathBuf>) -> Self {
        Self {
            machine_name: machine_name.into(),
            store_path: store_path.into(),
            ssh_user: "docker".to_string(),
            ssh_port: 22,
            ..Default::default()
        }
    }

    pub fn ip(&self) -> KubeboxResult<String> {
        if self.ip_address.is_empty() {
            return Err(KubeboxError::Driver(format!(
                "IP address is not set for machine {:?}",
                self.machine_name
            )));
        }
        Ok(self.ip_address.clone())
    }
}

/// Register every driver compiled into this crate.
///
/// Safe to call more than once against the same registry.
pub fn register_builtin_drivers(registry: &DriverRegistry) -> KubeboxResult<()> {
    for def in [none::definition()] {
        match registry.register(def) {
            Ok(()) | Err(KubeboxError::DuplicateName(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
