//! Provisioner detection from the guest's `/etc/os-release`.

use std::collections::HashMap;
use std::sync::Arc;

use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use parking_lot::RwLock;

use super::{Provisioner, ProvisionerDetector};
use crate::drivers::Driver;

/// Parsed `/etc/os-release`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    fields: HashMap<String, String>,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let mut fields = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::debug!(line, "Skipping malformed os-release line");
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            fields.insert(key.trim().to_string(), value.to_string());
        }
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// `ID`, e.g. `ubuntu` or `buildroot`.
    pub fn id(&self) -> &str {
        self.get("ID").unwrap_or_default()
    }

    /// Space separated `ID_LIKE` entries.
    pub fn id_like(&self) -> Vec<&str> {
        self.get("ID_LIKE")
            .map(|v| v.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn version_id(&self) -> &str {
        self.get("VERSION_ID").unwrap_or_default()
    }

    pub fn pretty_name(&self) -> &str {
        self.get("PRETTY_NAME").unwrap_or_default()
    }

    /// Whether `id` is this OS or one it declares itself like.
    pub fn is_like(&self, id: &str) -> bool {
        self.id() == id || self.id_like().contains(&id)
    }
}

pub type ProvisionerFactory = Arc<dyn Fn() -> Box<dyn Provisioner> + Send + Sync>;

/// A provisioner offered to [`StandardDetector`].
#[derive(Clone)]
pub struct RegisteredProvisioner {
    pub name: String,
    /// Does this provisioner handle the given OS?
    pub compatible: Arc<dyn Fn(&OsRelease) -> bool + Send + Sync>,
    pub new: ProvisionerFactory,
}

impl std::fmt::Debug for RegisteredProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvisioner")
            .field("name", &self.name)
            .finish()
    }
}

/// Detects the guest OS and returns the first compatible provisioner, in
/// registration order.
#[derive(Debug, Default)]
pub struct StandardDetector {
    provisioners: RwLock<Vec<RegisteredProvisioner>>,
}

impl StandardDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provisioner: RegisteredProvisioner) {
        tracing::debug!(provisioner = %provisioner.name, "Registering provisioner");
        self.provisioners.write().push(provisioner);
    }

    pub fn registered(&self) -> Vec<String> {
        self.provisioners
            .read()
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }
}

impl ProvisionerDetector for StandardDetector {
    fn detect(&self, driver: &mut dyn Driver) -> KubeboxResult<Box<dyn Provisioner>> {
        tracing::info!(machine = %driver.machine_name(), "Detecting provisioner");
        let content = driver.run_command("cat /etc/os-release").map_err(|e| {
            KubeboxError::Provision(format!("error getting SSH command output: {}", e))
        })?;
        let os = OsRelease::parse(&content);

        let candidates = self.provisioners.read().clone();
        for candidate in candidates {
            if (candidate.compatible)(&os) {
                tracing::debug!(
                    provisioner = %candidate.name,
                    os = %os.pretty_name(),
                    "Found compatible provisioner"
                );
                return Ok((candidate.new)());
            }
        }

        Err(KubeboxError::Provision(format!(
            "no provisioner compatible with {:?} (ID={})",
            os.pretty_name(),
            os.id()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUILDROOT: &str = r#"NAME=Buildroot
VERSION=2023.02.9-dirty
ID=buildroot
VERSION_ID=2023.02.9
PRETTY_NAME="Buildroot 2023.02.9"
"#;

    const UBUNTU: &str = r#"# comment
NAME="Ubuntu"
ID=ubuntu
ID_LIKE=debian
VERSION_ID="22.04"
PRETTY_NAME="Ubuntu 22.04.3 LTS"
broken line
"#;

    #[test]
    fn test_parse_buildroot() {
        let os = OsRelease::parse(BUILDROOT);
        assert_eq!(os.id(), "buildroot");
        assert_eq!(os.version_id(), "2023.02.9");
        assert_eq!(os.pretty_name(), "Buildroot 2023.02.9");
        assert!(os.id_like().is_empty());
    }

    #[test]
    fn test_parse_ubuntu() {
        let os = OsRelease::parse(UBUNTU);
        assert_eq!(os.id(), "ubuntu");
        assert_eq!(os.version_id(), "22.04");
        assert!(os.is_like("debian"));
        assert!(os.is_like("ubuntu"));
        assert!(!os.is_like("fedora"));
        assert_eq!(os.get("NAME"), Some("Ubuntu"));
    }

    #[test]
    fn test_parse_empty() {
        let os = OsRelease::parse("");
        assert_eq!(os.id(), "");
        assert_eq!(os, OsRelease::default());
    }

    #[test]
    fn test_registration_order_kept() {
        let detector = StandardDetector::new();
        for name in ["first", "second"] {
            detector.register(RegisteredProvisioner {
                name: name.to_string(),
                compatible: Arc::new(|_: &OsRelease| true),
                new: Arc::new(|| -> Box<dyn Provisioner> { unreachable!("not constructed") }),
            });
        }
        assert_eq!(detector.registered(), vec!["first", "second"]);
    }
}
