//! Bare-metal driver: manages the host itself instead of a VM.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use kubebox_shared::constants::DEFAULT_RUNTIME_PORT;
use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use serde::{Deserialize, Serialize};

use super::registry::{DriverDef, Priority, ProbeState};
use super::{BaseDriver, Driver, MachineConfig, MachineState};
use crate::util::process::run_with_timeout;
use crate::util::find_binary;

pub const DRIVER_NAME: &str = "none";
pub const DRIVER_ALIAS: &str = "native";

const DOC_URL: &str = "https://minikube.sigs.k8s.io/docs/reference/drivers/none/";
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const LOCALHOST: &str = "127.0.0.1";

/// Registry entry for the bare-metal driver.
pub fn definition() -> DriverDef {
    DriverDef {
        name: DRIVER_NAME.to_string(),
        aliases: vec![DRIVER_ALIAS.to_string()],
        config: Some(Arc::new(|cfg: &MachineConfig| {
            let driver = NoneDriver::from_machine_config(cfg);
            driver.config_raw()
        })),
        init: Some(Arc::new(|| Box::new(NoneDriver::default()) as Box<dyn Driver>)),
        status: Some(Arc::new(probe)),
        priority: Priority::Discouraged,
        default: false,
    }
}

/// Check for systemd and for root or passwordless sudo.
fn probe() -> ProbeState {
    if let Err(e) = find_binary("systemctl") {
        return ProbeState::not_installed(
            e.to_string(),
            "Use a systemd-based Linux distribution",
            DOC_URL,
        );
    }

    if is_root() {
        return ProbeState::healthy();
    }

    let mut sudo = Command::new("sudo");
    sudo.args(["-n", "true"]);
    match run_with_timeout(sudo, PROBE_TIMEOUT) {
        Ok(out) if out.success() => ProbeState::healthy(),
        Ok(out) => ProbeState {
            installed: true,
            running: true,
            error: Some(format!("sudo requires a password: {}", out.stderr.trim())),
            fix_hint: "Run as root or configure passwordless sudo".to_string(),
            doc_url: DOC_URL.to_string(),
            ..Default::default()
        },
        Err(e) => ProbeState {
            installed: true,
            running: true,
            error: Some(e.to_string()),
            fix_hint: "Run as root or configure passwordless sudo".to_string(),
            doc_url: DOC_URL.to_string(),
            reason: "PROVIDER_NONE_SUDO".to_string(),
            ..Default::default()
        },
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Persisted configuration of the bare-metal driver.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct NoneConfig {
    #[serde(flatten)]
    base: BaseDriver,
    /// Set by stop/kill; the host itself never powers off.
    stopped: bool,
}

#[derive(Debug, Default)]
pub struct NoneDriver {
    config: NoneConfig,
}

impl NoneDriver {
    pub fn from_machine_config(cfg: &MachineConfig) -> Self {
        let mut base = BaseDriver::new(&cfg.name, &cfg.store_path);
        base.ip_address = LOCALHOST.to_string();
        Self {
            config: NoneConfig {
                base,
                stopped: false,
            },
        }
    }

    fn set_stopped(&mut self, stopped: bool) -> KubeboxResult<()> {
        let goal = if stopped {
            MachineState::Stopped
        } else {
            MachineState::Running
        };
        if self.config.stopped == stopped {
            return Err(KubeboxError::HostAlreadyInState {
                name: self.config.base.machine_name.clone(),
                state: goal.to_string(),
            });
        }
        self.config.stopped = stopped;
        tracing::debug!(machine = %self.config.base.machine_name, state = %goal, "Bare-metal state changed");
        Ok(())
    }
}

impl Driver for NoneDriver {
    fn driver_name(&self) -> String {
        DRIVER_NAME.to_string()
    }

    fn machine_name(&self) -> String {
        self.config.base.machine_name.clone()
    }

    fn load_config(&mut self, raw: &[u8]) -> KubeboxResult<()> {
        self.config = serde_json::from_slice(raw).map_err(|e| {
            KubeboxError::Config(format!("invalid {} driver config: {}", DRIVER_NAME, e))
        })?;
        if self.config.base.ip_address.is_empty() {
            self.config.base.ip_address = LOCALHOST.to_string();
        }
        Ok(())
    }

    fn config_raw(&self) -> KubeboxResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config)?)
    }

    fn get_url(&self) -> KubeboxResult<String> {
        Ok(format!("tcp://{}:{}", self.get_ip()?, DEFAULT_RUNTIME_PORT))
    }

    fn get_ip(&self) -> KubeboxResult<String> {
        self.config.base.ip()
    }

    fn get_state(&self) -> KubeboxResult<MachineState> {
        Ok(if self.config.stopped {
            MachineState::Stopped
        } else {
            MachineState::Running
        })
    }

    fn pre_create_check(&mut self) -> KubeboxResult<()> {
        let state = probe();
        if !state.installed {
            return Err(KubeboxError::Driver(
                state.error.unwrap_or_else(|| "host is not supported".to_string()),
            ));
        }
        Ok(())
    }

    fn create(&mut self) -> KubeboxResult<()> {
        self.config.stopped = false;
        Ok(())
    }

    fn start(&mut self) -> KubeboxResult<()> {
        self.set_stopped(false)
    }

    fn stop(&mut self) -> KubeboxResult<()> {
        self.set_stopped(true)
    }

    fn kill(&mut self) -> KubeboxResult<()> {
        self.config.stopped = true;
        Ok(())
    }

    fn restart(&mut self) -> KubeboxResult<()> {
        self.config.stopped = false;
        Ok(())
    }

    fn remove(&mut self) -> KubeboxResult<()> {
        // Nothing to tear down on the host.
        Ok(())
    }

    fn get_ssh_hostname(&self) -> KubeboxResult<String> {
        Err(KubeboxError::Unsupported(
            "the none driver does not support ssh".to_string(),
        ))
    }

    fn get_ssh_key_path(&self) -> PathBuf {
        PathBuf::new()
    }

    fn get_ssh_port(&self) -> KubeboxResult<u16> {
        Err(KubeboxError::Unsupported(
            "the none driver does not support ssh".to_string(),
        ))
    }

    fn get_ssh_username(&self) -> String {
        String::new()
    }

    fn run_command(&mut self, cmd: &str) -> KubeboxResult<String> {
        let output = Command::new("sh")
            .args(["-c", cmd])
            .output()
            .map_err(|e| KubeboxError::Driver(format!("failed to run {:?}: {}", cmd, e)))?;
        if !output.status.success() {
            return Err(KubeboxError::Driver(format!(
                "{:?} exited with {}: {}",
                cmd,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn is_bare_metal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> NoneDriver {
        NoneDriver::from_machine_config(&MachineConfig::new("host", "/tmp/host"))
    }

    #[test]
    fn test_config_round_trip() {
        let original = driver();
        let raw = original.config_raw().unwrap();

        let mut restored = NoneDriver::default();
        restored.load_config(&raw).unwrap();
        assert_eq!(restored.machine_name(), "host");
        assert_eq!(restored.get_ip().unwrap(), LOCALHOST);
        assert_eq!(restored.get_url().unwrap(), "tcp://127.0.0.1:2376");
    }

    #[test]
    fn test_empty_config_defaults_ip() {
        let mut d = NoneDriver::default();
        d.load_config(b"{}").unwrap();
        assert_eq!(d.get_ip().unwrap(), LOCALHOST);
    }

    #[test]
    fn test_power_transitions() {
        let mut d = driver();
        assert_eq!(d.get_state().unwrap(), MachineState::Running);
        assert!(matches!(
            d.start(),
            Err(KubeboxError::HostAlreadyInState { .. })
        ));

        d.stop().unwrap();
        assert_eq!(d.get_state().unwrap(), MachineState::Stopped);
        assert!(matches!(
            d.stop(),
            Err(KubeboxError::HostAlreadyInState { .. })
        ));

        d.start().unwrap();
        assert_eq!(d.get_state().unwrap(), MachineState::Running);
    }

    #[test]
    fn test_is_bare_metal() {
        assert!(driver().is_bare_metal());
        assert!(driver().remove().is_ok());
    }

    #[test]
    fn test_definition_shape() {
        let def = definition();
        assert_eq!(def.name, DRIVER_NAME);
        assert_eq!(def.aliases, vec![DRIVER_ALIAS.to_string()]);
        assert!(def.init.is_some());

        let factory = def.config.unwrap();
        let raw = factory(&MachineConfig::new("m1", "/tmp/m1")).unwrap();
        let mut d = (def.init.unwrap())();
        d.load_config(&raw).unwrap();
        assert_eq!(d.machine_name(), "m1");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_locally() {
        let mut d = driver();
        assert_eq!(d.run_command("echo hi").unwrap().trim(), "hi");
        assert!(d.run_command("exit 7").is_err());
    }
}
