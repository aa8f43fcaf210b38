//! Boundary to the collaborators that configure the container runtime
//! inside a machine.
//!
//! kubebox never templates runtime configuration itself. It detects a
//! [`Provisioner`] for the guest OS and delegates to it.

mod detect;

use std::sync::OnceLock;
use std::time::Duration;

use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use regex::Regex;

use crate::drivers::Driver;
use crate::machine::{AuthOptions, RuntimeOptions};
use crate::util::wait_for_specific;

pub use detect::{OsRelease, ProvisionerFactory, RegisteredProvisioner, StandardDetector};

/// Provisioners whose guest OS ships the runtime in a read-only image.
pub const STATIC_ISO_PROVISIONERS: &[&str] = &["rancheros", "boot2docker"];

const LISTENING_CHECK: &str = "if ! type netstat 1>/dev/null; then ss -tln; else netstat -tln; fi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageAction {
    Install,
    Upgrade,
    Purge,
    Remove,
}

impl PackageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageAction::Install => "install",
            PackageAction::Upgrade => "upgrade",
            PackageAction::Purge => "purge",
            PackageAction::Remove => "remove",
        }
    }
}

impl std::fmt::Display for PackageAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
        }
    }
}

impl std::fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distribution-specific configuration of the container runtime.
///
/// Commands reach the guest through the driver passed to each call.
pub trait Provisioner: Send {
    fn name(&self) -> String;

    /// Install and configure the runtime to serve TLS with the material in `auth`.
    fn provision(
        &mut self,
        driver: &mut dyn Driver,
        auth: &AuthOptions,
        runtime: &RuntimeOptions,
    ) -> KubeboxResult<()>;

    fn package_action(
        &mut self,
        driver: &mut dyn Driver,
        package: &str,
        action: PackageAction,
    ) -> KubeboxResult<()>;

    fn service_action(
        &mut self,
        driver: &mut dyn Driver,
        service: &str,
        action: ServiceAction,
    ) -> KubeboxResult<()>;
}

/// Picks the provisioner for whatever OS a machine runs.
pub trait ProvisionerDetector: Send + Sync {
    fn detect(&self, driver: &mut dyn Driver) -> KubeboxResult<Box<dyn Provisioner>>;
}

/// Whether `name` ships the runtime inside a read-only image.
pub fn is_static_iso(name: &str) -> bool {
    STATIC_ISO_PROVISIONERS.contains(&name)
}

/// Whether `ss`/`netstat` output shows something listening on `port`.
pub fn matches_listening_output(output: &str, port: u16) -> bool {
    let pattern = format!(r":{}\s+.*:.*", port);
    let Ok(re) = Regex::new(&pattern) else {
        tracing::warn!(pattern, "Invalid listening pattern");
        return false;
    };
    output
        .lines()
        .any(|line| !line.is_empty() && re.is_match(line))
}

/// Poll the guest until the runtime API accepts connections on `port`.
pub fn wait_for_runtime(
    driver: &mut dyn Driver,
    port: u16,
    attempts: u32,
    delay: Duration,
) -> KubeboxResult<()> {
    let up = wait_for_specific(
        || match driver.run_command(LISTENING_CHECK) {
            Ok(out) => matches_listening_output(&out, port),
            Err(e) => {
                tracing::warn!(error = %e, "Error checking runtime port");
                false
            }
        },
        attempts,
        delay,
    );
    if !up {
        return Err(KubeboxError::Timeout(format!(
            "container runtime is not listening on port {} after {} attempts",
            port, attempts
        )));
    }
    Ok(())
}

static CLIENT_VERSION_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Parse `Docker version 1.12.1, build 7a86f89` into `1.12.1`.
pub fn parse_runtime_version(output: &str) -> KubeboxResult<String> {
    let re = CLIENT_VERSION_RE
        .get_or_init(|| Regex::new(r"^\s*Docker version ([^,\s]+)").ok())
        .as_ref()
        .ok_or_else(|| KubeboxError::Internal("invalid version pattern".to_string()))?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            KubeboxError::Provision(format!(
                "cannot parse version string from {:?}",
                output.trim()
            ))
        })
}

/// Version of the container runtime client installed in the guest.
pub fn runtime_version(driver: &mut dyn Driver) -> KubeboxResult<String> {
    let output = driver.run_command("docker --version")?;
    parse_runtime_version(&output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netstat_missing() {
        let out = "Active Internet connections (servers and established)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN
tcp        0      0 0.0.0.0:237             0.0.0.0:*               LISTEN
tcp6       0      0 :::22                   :::*                    LISTEN
tcp6       0      0 :::23760                :::*                    LISTEN";
        assert!(!matches_listening_output(out, 2376));
    }

    #[test]
    fn test_netstat_present() {
        let out = "Active Internet connections (servers and established)
Proto Recv-Q Send-Q Local Address           Foreign Address         State
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN
tcp6       0      0 :::2376                 :::*                    LISTEN
tcp6       0      0 :::22                   :::*                    LISTEN";
        assert!(matches_listening_output(out, 2376));
    }

    #[test]
    fn test_ss_missing() {
        let out = "State      Recv-Q Send-Q Local Address:Port               Peer Address:Port
LISTEN     0      128          *:22                       *:*
LISTEN     0      128         :::22                      :::*
LISTEN     0      128         :::23760                   :::*                  ";
        assert!(!matches_listening_output(out, 2376));
    }

    #[test]
    fn test_ss_present() {
        let out = "State      Recv-Q Send-Q Local Address:Port               Peer Address:Port
LISTEN     0      128          *:22                       *:*
LISTEN     0      128         :::2376                    :::*                  ";
        assert!(matches_listening_output(out, 2376));
    }

    #[test]
    fn test_parse_runtime_version() {
        assert_eq!(
            parse_runtime_version("Docker version 1.12.1, build 7a86f89\n").unwrap(),
            "1.12.1"
        );
        assert_eq!(
            parse_runtime_version("Docker version 17.06.0-ce, build 02c1d87").unwrap(),
            "17.06.0-ce"
        );
        assert!(parse_runtime_version("podman version 4.0").is_err());
    }

    #[test]
    fn test_static_iso() {
        assert!(is_static_iso("boot2docker"));
        assert!(is_static_iso("rancheros"));
        assert!(!is_static_iso("buildroot"));
    }

    #[test]
    fn test_action_names() {
        assert_eq!(PackageAction::Purge.to_string(), "purge");
        assert_eq!(ServiceAction::Restart.to_string(), "restart");
    }
}
