//! Power transitions, upgrade, certificate regeneration and removal.

use kubebox_shared::constants::{
    LAST_RELEASE_BEFORE_CE_VERSIONING, LEGACY_RUNTIME_PACKAGE, RUNTIME_PACKAGE,
};
use kubebox_shared::errors::{KubeboxError, KubeboxResult};

use super::KubeboxClient;
use crate::cert;
use crate::drivers::{Driver, MachineState, machine_in_state};
use crate::machine::{Machine, MachineOptions, validate_machine_name};
use crate::provision::{self, PackageAction, Provisioner, ServiceAction, is_static_iso};
use crate::util::fs::remove_if_exists;
use crate::util::versioncmp;

/// Hosts always present on a machine's server certificate besides its IP.
const LOCAL_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

impl KubeboxClient {
    // ========================================================================
    // POWER
    // ========================================================================

    pub fn state(&self, machine: &Machine) -> KubeboxResult<MachineState> {
        machine.driver()?.get_state()
    }

    /// Power the machine on, wait for its container runtime and check that
    /// the runtime still accepts our certificates.
    pub fn start(&self, machine: &mut Machine) -> KubeboxResult<()> {
        tracing::info!(machine = %machine.name, "Starting machine");
        self.run_action_for_state(machine, MachineState::Running, |d| d.start())?;
        self.wait_for_runtime(machine)?;
        self.check_runtime_certificates(machine)?;
        self.save(machine)
    }

    pub fn stop(&self, machine: &mut Machine) -> KubeboxResult<()> {
        tracing::info!(machine = %machine.name, "Stopping machine");
        self.run_action_for_state(machine, MachineState::Stopped, |d| d.stop())?;
        self.save(machine)
    }

    /// Force the machine off without a guest shutdown.
    pub fn kill(&self, machine: &mut Machine) -> KubeboxResult<()> {
        tracing::info!(machine = %machine.name, "Killing machine");
        self.run_action_for_state(machine, MachineState::Stopped, |d| d.kill())?;
        self.save(machine)
    }

    /// Restart a running machine, or start one that is stopped.
    pub fn restart(&self, machine: &mut Machine) -> KubeboxResult<()> {
        let state = self.state(machine)?;
        if state.can_start() {
            tracing::info!(machine = %machine.name, %state, "Machine not running, starting instead of restarting");
            return self.start(machine);
        }

        tracing::info!(machine = %machine.name, %state, "Restarting machine");
        machine.driver_mut()?.restart()?;
        self.wait_for_running(machine)?;
        self.wait_for_runtime(machine)?;
        self.check_runtime_certificates(machine)?;
        self.save(machine)
    }

    fn run_action_for_state<F>(
        &self,
        machine: &mut Machine,
        goal: MachineState,
        action: F,
    ) -> KubeboxResult<()>
    where
        F: FnOnce(&mut dyn Driver) -> KubeboxResult<()>,
    {
        if machine_in_state(machine.driver()?, goal) {
            return Err(KubeboxError::HostAlreadyInState {
                name: machine.name.clone(),
                state: goal.to_string(),
            });
        }
        action(machine.driver_mut()?)?;
        self.wait_for_state(machine, goal)
    }

    fn wait_for_runtime(&self, machine: &mut Machine) -> KubeboxResult<()> {
        if machine.is_bare_metal() {
            return Ok(());
        }
        let port = machine.runtime_options().port();
        let policy = self.options().runtime_wait;
        tracing::debug!(machine = %machine.name, port, "Waiting for container runtime");
        provision::wait_for_runtime(machine.driver_mut()?, port, policy.attempts, policy.delay)
    }

    // ========================================================================
    // PROVISIONING
    // ========================================================================

    /// Issue the server certificate and configure the runtime in the guest.
    pub(crate) fn provision(&self, machine: &mut Machine) -> KubeboxResult<()> {
        let (driver, _) = split(machine)?;
        let mut provisioner = self.inner.detector.detect(driver)?;
        self.provision_with(machine, provisioner.as_mut())
    }

    fn provision_with(
        &self,
        machine: &mut Machine,
        provisioner: &mut dyn Provisioner,
    ) -> KubeboxResult<()> {
        let ip = machine.driver()?.get_ip()?;
        let mut hosts = vec![ip];
        hosts.extend(LOCAL_HOSTS.iter().map(|h| h.to_string()));
        cert::generate_server_certificate(machine.auth_options(), &hosts, &self.options().certs)?;

        machine.machine_options.runtime_options.auth_options_ref =
            Some(machine.machine_options.auth_options.clone());

        tracing::info!(machine = %machine.name, provisioner = %provisioner.name(), "Provisioning");
        let (driver, options) = split(machine)?;
        provisioner.provision(driver, &options.auth_options, &options.runtime_options)
    }

    /// Move the guest's container runtime to the latest release.
    pub fn upgrade(&self, machine: &mut Machine) -> KubeboxResult<()> {
        if machine.driver()?.get_state()? != MachineState::Running {
            self.start(machine)?;
        }

        let machine_name = machine.name.clone();
        let (driver, _) = split(machine)?;
        let mut provisioner = self.inner.detector.detect(driver)?;
        let version = provision::runtime_version(driver)?;
        let name = provisioner.name();
        tracing::info!(machine = %machine_name, %version, provisioner = %name, "Upgrading container runtime");

        if versioncmp::less_than_or_equal_to(&version, LAST_RELEASE_BEFORE_CE_VERSIONING)
            && !is_static_iso(&name)
        {
            provisioner.package_action(driver, LEGACY_RUNTIME_PACKAGE, PackageAction::Purge)?;
            self.provision_with(machine, provisioner.as_mut())?;
        } else {
            provisioner.package_action(driver, RUNTIME_PACKAGE, PackageAction::Upgrade)?;
            provisioner.service_action(driver, RUNTIME_PACKAGE, ServiceAction::Restart)?;
        }
        self.save(machine)
    }

    // ========================================================================
    // CERTIFICATES
    // ========================================================================

    /// Re-run certificate bootstrap, then reinstall server certificates.
    ///
    /// With `client_certs` the CA and client pairs are discarded first, so
    /// every other machine sharing this home must be regenerated too.
    pub fn regenerate_certs(&self, machine: &mut Machine, client_certs: bool) -> KubeboxResult<()> {
        tracing::info!(machine = %machine.name, client_certs, "Regenerating TLS certificates");
        {
            let _lock = self.lock_certificates()?;
            if client_certs {
                let auth = machine.auth_options();
                for path in [
                    &auth.ca_cert_path,
                    &auth.ca_private_key_path,
                    &auth.client_cert_path,
                    &auth.client_key_path,
                ] {
                    remove_if_exists(path)?;
                }
            }
            cert::bootstrap_certificates(machine.auth_options(), &self.options().certs)?;
        }

        if machine.is_bare_metal() {
            return Ok(());
        }
        self.provision(machine)?;
        self.save(machine)
    }

    /// Check the runtime's TLS endpoint and regenerate once if it is rejected.
    pub fn ensure_certificates(&self, machine: &mut Machine) -> KubeboxResult<()> {
        let url = machine.driver()?.get_url()?;
        match cert::validate_certificate(&url, machine.auth_options()) {
            Ok(true) => return Ok(()),
            Ok(false) => {
                tracing::warn!(machine = %machine.name, url = %url, "Runtime rejected the TLS handshake");
            }
            Err(e) => {
                tracing::warn!(machine = %machine.name, url = %url, error = %e, "Certificate check failed");
            }
        }

        self.regenerate_certs(machine, false)?;
        let cause = match cert::validate_certificate(&url, machine.auth_options()) {
            Ok(true) => return Ok(()),
            Ok(false) => "TLS handshake rejected after regeneration".to_string(),
            Err(e) => e.to_string(),
        };
        Err(KubeboxError::CertInvalid { url, cause })
    }

    /// [`ensure_certificates`](Self::ensure_certificates) unless the machine
    /// has no guest runtime or checks are disabled.
    pub(crate) fn check_runtime_certificates(&self, machine: &mut Machine) -> KubeboxResult<()> {
        if machine.is_bare_metal() || !self.options().check_runtime_tls {
            return Ok(());
        }
        self.ensure_certificates(machine)
    }

    // ========================================================================
    // REMOVAL
    // ========================================================================

    /// Tear down the machine, then delete its descriptor.
    ///
    /// The descriptor survives a failed driver teardown.
    pub fn remove(&self, machine: &mut Machine) -> KubeboxResult<()> {
        if !validate_machine_name(&machine.name) {
            return Err(KubeboxError::InvalidHostname(machine.name.clone()));
        }
        tracing::info!(machine = %machine.name, "Removing machine");
        machine.driver_mut()?.remove()?;
        self.store().remove(&machine.name)
    }

    /// Load and remove `name`; a machine that is already gone is not an error.
    pub fn remove_by_name(&self, name: &str) -> KubeboxResult<()> {
        if !validate_machine_name(name) {
            return Err(KubeboxError::InvalidHostname(name.to_string()));
        }
        if !self.exists(name) {
            tracing::debug!(machine = name, "Machine already removed");
            return Ok(());
        }
        let mut machine = self.load(name)?;
        self.remove(&mut machine)
    }
}

/// Borrow the live driver and the options side by side.
fn split(machine: &mut Machine) -> KubeboxResult<(&mut dyn Driver, &mut MachineOptions)> {
    match machine.driver.as_deref_mut() {
        Some(driver) => Ok((driver, &mut machine.machine_options)),
        None => Err(KubeboxError::Internal(format!(
            "machine {:?} has no driver loaded",
            machine.name
        ))),
    }
}
