//! Persistence of machine descriptors.

mod filestore;
mod migrate;

use std::path::PathBuf;

use kubebox_shared::errors::KubeboxResult;

use crate::machine::Machine;

pub use filestore::Filestore;
pub use migrate::{config_version, embedded_driver_config, migrate_to_current};

/// Storage backend for machine descriptors.
///
/// Implementations persist everything except the live driver instance;
/// loaded machines come back with `raw_driver` filled and no driver.
pub trait Store: Send + Sync {
    /// Persist `machine`, replacing any previous descriptor atomically.
    fn save(&self, machine: &Machine) -> KubeboxResult<()>;

    /// Read a descriptor, migrating it to the current schema if needed.
    fn load(&self, name: &str) -> KubeboxResult<Machine>;

    /// Whether a descriptor directory exists for `name`.
    fn exists(&self, name: &str) -> bool;

    /// Names of all stored machines.
    fn list(&self) -> KubeboxResult<Vec<String>>;

    /// Delete the machine's directory and everything in it.
    fn remove(&self, name: &str) -> KubeboxResult<()>;

    /// Directory that holds the machine's descriptor and server certificates.
    fn machine_dir(&self, name: &str) -> PathBuf;
}
