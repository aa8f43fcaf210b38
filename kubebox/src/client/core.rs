//! The lifecycle client: owns the store, the certificate lock and the driver
//! registry for one kubebox home.

use std::sync::{Arc, OnceLock};

use kubebox_shared::errors::{KubeboxError, KubeboxResult};

use super::layout::StoreLayout;
use super::lock::CertLock;
use super::options::ClientOptions;
use crate::cert::{self, BootstrapReport};
use crate::drivers::{DriverDef, DriverRegistry, MachineConfig, register_builtin_drivers};
use crate::init_logging_for;
use crate::machine::{AuthOptions, Machine};
use crate::provision::{ProvisionerDetector, StandardDetector};
use crate::store::{Filestore, Store};

// ============================================================================
// GLOBAL DEFAULT CLIENT
// ============================================================================

static DEFAULT_CLIENT: OnceLock<KubeboxClient> = OnceLock::new();

// ============================================================================
// PUBLIC API
// ============================================================================

/// Entry point for creating and managing machines under one home directory.
///
/// Cloning is cheap; all clones share the same store, registry and detector.
/// Operations block the calling thread for their whole duration.
#[derive(Clone)]
pub struct KubeboxClient {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    pub(crate) options: ClientOptions,
    pub(crate) layout: StoreLayout,
    pub(crate) store: Filestore,
    pub(crate) registry: DriverRegistry,
    pub(crate) detector: Arc<dyn ProvisionerDetector>,
}

impl KubeboxClient {
    /// Create a client using the process-wide driver registry and the
    /// standard OS-release provisioner detector.
    pub fn new(options: ClientOptions) -> KubeboxResult<Self> {
        Self::with_parts(
            options,
            DriverRegistry::global().clone(),
            Arc::new(StandardDetector::new()),
        )
    }

    /// Create a client with an explicit registry and provisioner detector.
    ///
    /// Built-in drivers are registered into `registry` if missing.
    ///
    /// # Errors
    ///
    /// Returns error if `home_dir` is relative or its directories cannot be
    /// created.
    pub fn with_parts(
        options: ClientOptions,
        registry: DriverRegistry,
        detector: Arc<dyn ProvisionerDetector>,
    ) -> KubeboxResult<Self> {
        if !options.home_dir.is_absolute() {
            return Err(KubeboxError::Config(format!(
                "home_dir must be absolute path, got: {}",
                options.home_dir.display()
            )));
        }

        let layout = StoreLayout::new(options.home_dir.clone());
        layout.prepare().map_err(|e| {
            KubeboxError::Storage(format!(
                "Failed to initialize filesystem at {}: {}",
                layout.home_dir().display(),
                e
            ))
        })?;

        if options.file_logging {
            init_logging_for(&layout)?;
        }

        register_builtin_drivers(&registry)?;
        let store = Filestore::new(layout.home_dir());

        tracing::debug!(home = %layout.home_dir().display(), "Initialized client");
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                layout,
                store,
                registry,
                detector,
            }),
        })
    }

    /// Create a client with default options.
    pub fn with_defaults() -> KubeboxResult<Self> {
        Self::new(ClientOptions::default())
    }

    /// Get or initialize the process-wide default client.
    pub fn default_client() -> KubeboxResult<&'static KubeboxClient> {
        if let Some(client) = DEFAULT_CLIENT.get() {
            return Ok(client);
        }
        let client = Self::with_defaults()?;
        Ok(DEFAULT_CLIENT.get_or_init(|| client))
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.inner.layout
    }

    pub fn store(&self) -> &dyn Store {
        &self.inner.store
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.inner.registry
    }

    // ========================================================================
    // MACHINE INSTANTIATION
    // ========================================================================

    /// Build an in-memory machine for `driver_name` from raw driver config.
    ///
    /// Nothing is written; call [`create`](Self::create) to bring it up.
    pub fn new_machine(&self, driver_name: &str, raw_driver: &[u8]) -> KubeboxResult<Machine> {
        let def = self.driver_def(driver_name)?;
        let mut driver = instantiate(&def)?;
        driver.load_config(raw_driver)?;

        let name = driver.machine_name();
        let mut machine = Machine::new(name.clone(), def.name.clone());
        machine.machine_options.auth_options =
            AuthOptions::for_machine(&self.layout().certs_dir(), &self.store().machine_dir(&name));
        machine.raw_driver = raw_driver.to_vec();
        machine.set_driver(driver);

        tracing::debug!(machine = %name, driver = %def.name, "Instantiated machine");
        Ok(machine)
    }

    /// Build a machine from generic settings via the driver's config factory.
    pub fn new_machine_from_config(
        &self,
        driver_name: &str,
        config: &MachineConfig,
    ) -> KubeboxResult<Machine> {
        let def = self.driver_def(driver_name)?;
        let factory = def.config.as_ref().ok_or_else(|| {
            KubeboxError::Unsupported(format!(
                "driver {:?} cannot build a config from machine settings",
                def.name
            ))
        })?;
        let raw = factory(config)?;

        let mut machine = self.new_machine(&def.name, &raw)?;
        machine.machine_options.cpus = config.cpus;
        machine.machine_options.memory = config.memory_mib;
        machine.machine_options.disk = config.disk_mib;
        Ok(machine)
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    /// Load a stored machine and rehydrate its driver.
    pub fn load(&self, name: &str) -> KubeboxResult<Machine> {
        let mut machine = self.store().load(name)?;

        let driver_name = if machine.machine_options.driver.is_empty() {
            machine.driver_name.clone()
        } else {
            machine.machine_options.driver.clone()
        };
        let def = self.driver_def(&driver_name)?;
        let mut driver = instantiate(&def)?;
        driver.load_config(&machine.raw_driver)?;
        machine.set_driver(driver);

        tracing::debug!(machine = %name, driver = %def.name, "Loaded machine");
        Ok(machine)
    }

    pub fn save(&self, machine: &Machine) -> KubeboxResult<()> {
        self.store().save(machine)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.store().exists(name)
    }

    pub fn list(&self) -> KubeboxResult<Vec<String>> {
        self.store().list()
    }

    // ========================================================================
    // CERTIFICATES
    // ========================================================================

    /// Create or renew the shared CA and client certificate while holding
    /// the cross-process certificate lock.
    pub fn bootstrap_certificates(&self, auth: &AuthOptions) -> KubeboxResult<BootstrapReport> {
        let _lock = self.lock_certificates()?;
        cert::bootstrap_certificates(auth, &self.options().certs)
    }

    pub(crate) fn lock_certificates(&self) -> KubeboxResult<CertLock> {
        CertLock::acquire(&self.layout().cert_lock_path(), self.options().lock_timeout)
    }

    fn driver_def(&self, name: &str) -> KubeboxResult<DriverDef> {
        let def = self.registry().lookup(name);
        if def.is_empty() {
            return Err(KubeboxError::DriverNotFound(name.to_string()));
        }
        Ok(def)
    }
}

fn instantiate(def: &DriverDef) -> KubeboxResult<Box<dyn crate::drivers::Driver>> {
    let init = def.init.as_ref().ok_or_else(|| {
        KubeboxError::Driver(format!("driver {:?} has no init factory", def.name))
    })?;
    Ok(init())
}

impl std::fmt::Debug for KubeboxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeboxClient")
            .field("home_dir", &self.inner.layout.home_dir())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<KubeboxClient>();
};
