//! The machine descriptor: the persisted record of one managed machine.

pub mod options;

use std::sync::OnceLock;

use kubebox_shared::constants::CONFIG_VERSION;
use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use regex::Regex;

use crate::drivers::Driver;
pub use options::{AuthOptions, MachineOptions, RuntimeOptions};

static MACHINE_NAME_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Check a machine name against `^[a-zA-Z0-9][a-zA-Z0-9\-\.]*$`.
pub fn validate_machine_name(name: &str) -> bool {
    MACHINE_NAME_RE
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9\-\.]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

/// One managed machine.
///
/// `raw_driver` is the opaque driver configuration. `driver` is the live
/// instance hydrated from it; it is never persisted and is rebuilt on every
/// load.
pub struct Machine {
    pub config_version: u32,
    pub name: String,
    pub driver_name: String,
    pub machine_options: MachineOptions,
    pub raw_driver: Vec<u8>,
    pub(crate) driver: Option<Box<dyn Driver>>,
}

impl Machine {
    /// A descriptor at the current schema version with no live driver.
    pub fn new(name: impl Into<String>, driver_name: impl Into<String>) -> Self {
        let driver_name = driver_name.into();
        Self {
            config_version: CONFIG_VERSION,
            name: name.into(),
            machine_options: MachineOptions {
                driver: driver_name.clone(),
                ..Default::default()
            },
            driver_name,
            raw_driver: Vec::new(),
            driver: None,
        }
    }

    pub fn auth_options(&self) -> &AuthOptions {
        &self.machine_options.auth_options
    }

    pub fn runtime_options(&self) -> &RuntimeOptions {
        &self.machine_options.runtime_options
    }

    pub fn has_driver(&self) -> bool {
        self.driver.is_some()
    }

    pub fn set_driver(&mut self, driver: Box<dyn Driver>) {
        self.driver = Some(driver);
    }

    pub fn driver(&self) -> KubeboxResult<&dyn Driver> {
        self.driver.as_deref().ok_or_else(|| self.no_driver())
    }

    pub fn driver_mut(&mut self) -> KubeboxResult<&mut dyn Driver> {
        match self.driver.as_deref_mut() {
            Some(driver) => Ok(driver),
            None => Err(KubeboxError::Internal(format!(
                "machine {:?} has no driver loaded",
                self.name
            ))),
        }
    }

    /// Whether the live driver manages the host instead of a VM.
    pub fn is_bare_metal(&self) -> bool {
        self.driver.as_ref().is_some_and(|d| d.is_bare_metal())
    }

    /// Current driver configuration: from the live driver when loaded,
    /// otherwise the last known raw bytes.
    pub fn driver_config(&self) -> KubeboxResult<Vec<u8>> {
        match &self.driver {
            Some(driver) => driver.config_raw(),
            None => Ok(self.raw_driver.clone()),
        }
    }

    fn no_driver(&self) -> KubeboxError {
        KubeboxError::Internal(format!("machine {:?} has no driver loaded", self.name))
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("config_version", &self.config_version)
            .field("name", &self.name)
            .field("driver_name", &self.driver_name)
            .field("machine_options", &self.machine_options)
            .field("raw_driver_len", &self.raw_driver.len())
            .field("driver_loaded", &self.driver.is_some())
            .finish()
    }
}
