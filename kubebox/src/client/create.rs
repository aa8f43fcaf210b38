//! The creation pipeline.

use std::time::Instant;

use kubebox_shared::errors::{KubeboxError, KubeboxResult};

use super::KubeboxClient;
use super::constants::steps;
use crate::drivers::{MachineState, machine_in_state};
use crate::machine::{Machine, validate_machine_name};
use crate::util::wait_for_specific;

impl KubeboxClient {
    /// Bring a freshly instantiated machine into existence.
    ///
    /// Steps run strictly in order and stop at the first failure; each error
    /// is wrapped with the name of the step that raised it. The descriptor is
    /// saved before the driver creates anything, so a failed create leaves a
    /// record that [`remove`](Self::remove) can clean up. Nothing is rolled
    /// back automatically.
    pub fn create(&self, machine: &mut Machine) -> KubeboxResult<()> {
        let started = Instant::now();

        if !validate_machine_name(&machine.name) {
            return Err(KubeboxError::InvalidHostname(machine.name.clone()));
        }
        if self.exists(&machine.name) {
            return Err(KubeboxError::HostAlreadyExists(machine.name.clone()));
        }
        machine.driver()?;

        tracing::info!(machine = %machine.name, driver = %machine.driver_name, "Creating machine");

        // The lock covers certificate bootstrap only.
        self.bootstrap_certificates(machine.auth_options())
            .map_err(|e| e.in_step(steps::BOOTSTRAP_CERTS))?;

        machine
            .driver_mut()?
            .pre_create_check()
            .map_err(|e| KubeboxError::PreCreateFailed(Box::new(e)).in_step(steps::PRECREATE))?;

        self.save(machine).map_err(|e| e.in_step(steps::SAVING))?;

        tracing::info!(machine = %machine.name, "Creating machine with driver");
        machine
            .driver_mut()?
            .create()
            .map_err(|e| e.in_step(steps::CREATING))?;
        self.save(machine).map_err(|e| e.in_step(steps::CREATING))?;

        if machine.is_bare_metal() {
            tracing::debug!(machine = %machine.name, "Bare-metal driver, skipping wait and provisioning");
        } else {
            self.wait_for_running(machine)
                .map_err(|e| e.in_step(steps::WAITING))?;

            tracing::info!(machine = %machine.name, "Provisioning container runtime");
            self.provision(machine)
                .and_then(|()| self.save(machine))
                .map_err(|e| e.in_step(steps::PROVISIONING))?;

            self.check_runtime_certificates(machine)
                .map_err(|e| e.in_step(steps::CHECKING_CONNECTION))?;
        }

        tracing::info!(
            machine = %machine.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Machine created"
        );
        Ok(())
    }

    /// Poll the driver until it reports `Running`.
    pub(crate) fn wait_for_running(&self, machine: &Machine) -> KubeboxResult<()> {
        self.wait_for_state(machine, MachineState::Running)
    }

    pub(crate) fn wait_for_state(&self, machine: &Machine, goal: MachineState) -> KubeboxResult<()> {
        let driver = machine.driver()?;
        let policy = self.options().machine_wait;
        if !wait_for_specific(
            || machine_in_state(driver, goal),
            policy.attempts,
            policy.delay,
        ) {
            return Err(KubeboxError::Timeout(format!(
                "machine {:?} did not reach state {} after {} attempts",
                machine.name, goal, policy.attempts
            )));
        }
        Ok(())
    }
}
