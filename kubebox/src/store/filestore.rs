//! Directory-per-machine store rooted at `<base>/machines`.

use std::path::{Path, PathBuf};

use kubebox_shared::constants::{CONFIG_VERSION, filenames};
use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Store;
use super::migrate::{config_version, embedded_driver_config, migrate_to_current};
use crate::client::layout::dirs;
use crate::machine::{Machine, MachineOptions, validate_machine_name};
use crate::util::fs::{ensure_dir, write_atomic};

const MACHINE_DIR_MODE: u32 = 0o700;
const CONFIG_FILE_MODE: u32 = 0o600;

/// On-disk shape of a descriptor. The driver's configuration is not part of
/// it; its bytes live untouched in a sibling file.
#[derive(Debug, Serialize, Deserialize)]
struct MachineRecord {
    config_version: u32,
    name: String,
    driver_name: String,
    #[serde(default)]
    machine_options: MachineOptions,
}

#[derive(Clone, Debug)]
pub struct Filestore {
    base: PathBuf,
}

impl Filestore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn machines_dir(&self) -> PathBuf {
        self.base.join(dirs::MACHINES_DIR)
    }

    /// The machine's directory, refusing names that could resolve outside
    /// `machines/` (empty, `..`, path separators).
    fn checked_dir(&self, name: &str) -> KubeboxResult<PathBuf> {
        if !validate_machine_name(name) {
            return Err(KubeboxError::InvalidHostname(name.to_string()));
        }
        Ok(self.machine_dir(name))
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.machine_dir(name).join(filenames::MACHINE_CONFIG)
    }

    fn driver_path(&self, name: &str) -> PathBuf {
        self.machine_dir(name).join(filenames::DRIVER_CONFIG)
    }

    /// Raw driver bytes for `name`, falling back to the tree older
    /// descriptors embedded.
    fn read_driver_config(&self, name: &str, descriptor: &Value) -> KubeboxResult<Vec<u8>> {
        let path = self.driver_path(name);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(embedded_driver_config(descriptor)?.unwrap_or_default())
            }
            Err(e) => Err(KubeboxError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn encode(machine: &Machine) -> KubeboxResult<Vec<u8>> {
        let record = MachineRecord {
            config_version: machine.config_version,
            name: machine.name.clone(),
            driver_name: machine.driver_name.clone(),
            machine_options: machine.machine_options.clone(),
        };
        serde_json::to_vec_pretty(&record).map_err(|e| {
            KubeboxError::Storage(format!("failed to encode {:?}: {}", machine.name, e))
        })
    }

    fn decode(name: &str, value: Value, raw_driver: Vec<u8>) -> KubeboxResult<Machine> {
        let record: MachineRecord = serde_json::from_value(value).map_err(|e| {
            KubeboxError::Storage(format!("corrupt descriptor for {:?}: {}", name, e))
        })?;
        if record.name != name {
            return Err(KubeboxError::Storage(format!(
                "descriptor in {:?} names machine {:?}",
                name, record.name
            )));
        }

        Ok(Machine {
            config_version: record.config_version,
            name: record.name,
            driver_name: record.driver_name,
            machine_options: record.machine_options,
            raw_driver,
            driver: None,
        })
    }
}

impl Store for Filestore {
    fn save(&self, machine: &Machine) -> KubeboxResult<()> {
        let dir = self.checked_dir(&machine.name)?;
        let bytes = Self::encode(machine)?;
        let raw_driver = machine.driver_config()?;
        ensure_dir(&dir, MACHINE_DIR_MODE)?;
        write_atomic(&self.driver_path(&machine.name), &raw_driver, CONFIG_FILE_MODE)?;
        write_atomic(&self.config_path(&machine.name), &bytes, CONFIG_FILE_MODE)?;
        tracing::debug!(machine = %machine.name, path = %dir.display(), "Saved machine");
        Ok(())
    }

    fn load(&self, name: &str) -> KubeboxResult<Machine> {
        self.checked_dir(name)?;
        if !self.exists(name) {
            return Err(KubeboxError::HostDoesNotExist(name.to_string()));
        }

        let path = self.config_path(name);
        let bytes = std::fs::read(&path).map_err(|e| {
            KubeboxError::Storage(format!("failed to read {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
            KubeboxError::Storage(format!("corrupt descriptor {}: {}", path.display(), e))
        })?;

        let raw_driver = self.read_driver_config(name, &value)?;

        let version = config_version(&value);
        if version > CONFIG_VERSION {
            tracing::warn!(
                machine = %name,
                version,
                supported = CONFIG_VERSION,
                "Descriptor is newer than this build; loading as-is"
            );
            return Self::decode(name, value, raw_driver);
        }
        if version == CONFIG_VERSION {
            return Self::decode(name, value, raw_driver);
        }

        let backup = self.machine_dir(name).join(filenames::MACHINE_CONFIG_BACKUP);
        write_atomic(&backup, &bytes, CONFIG_FILE_MODE)?;
        let machine = Self::decode(name, migrate_to_current(value)?, raw_driver)?;
        self.save(&machine)?;
        tracing::info!(
            machine = %name,
            from = version,
            to = CONFIG_VERSION,
            backup = %backup.display(),
            "Migrated machine descriptor"
        );
        Ok(machine)
    }

    fn exists(&self, name: &str) -> bool {
        validate_machine_name(name) && self.machine_dir(name).is_dir()
    }

    fn list(&self) -> KubeboxResult<Vec<String>> {
        let dir = self.machines_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(KubeboxError::Storage(format!(
                    "failed to list {}: {}",
                    dir.display(),
                    e
                )));
            }
        };

        let mut names = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn remove(&self, name: &str) -> KubeboxResult<()> {
        let dir = self.checked_dir(name)?;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(machine = %name, "Removed machine directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KubeboxError::Storage(format!(
                "failed to remove {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    fn machine_dir(&self, name: &str) -> PathBuf {
        self.machines_dir().join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::options::AuthOptions;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample(store: &Filestore, name: &str) -> Machine {
        let mut m = Machine::new(name, "none");
        m.machine_options.memory = 4096;
        m.machine_options.cpus = 2;
        m.machine_options.auth_options =
            AuthOptions::for_machine(&store.base().join("certs"), &store.machine_dir(name));
        m.machine_options.runtime_options.label_list = vec!["env=test".into()];
        m.raw_driver = br#"{"machine_name":"dev","ip_address":"10.1.2.3"}"#.to_vec();
        m
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        let original = sample(&store, "dev");

        store.save(&original).unwrap();
        let loaded = store.load("dev").unwrap();

        assert_eq!(loaded.config_version, original.config_version);
        assert_eq!(loaded.name, original.name);
        assert_eq!(loaded.driver_name, original.driver_name);
        assert_eq!(loaded.machine_options, original.machine_options);
        assert!(!loaded.has_driver());

        assert_eq!(loaded.raw_driver, original.raw_driver);
    }

    #[test]
    fn test_raw_driver_bytes_are_opaque() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());

        let mut binary = sample(&store, "bin");
        binary.raw_driver = vec![0x00, 0x01, 0xff, 0x10];
        store.save(&binary).unwrap();
        assert_eq!(store.load("bin").unwrap().raw_driver, vec![0x00, 0x01, 0xff, 0x10]);

        let mut spaced = sample(&store, "spaced");
        spaced.raw_driver = br#"{"b":1,  "a":2}"#.to_vec();
        store.save(&spaced).unwrap();
        assert_eq!(store.load("spaced").unwrap().raw_driver, br#"{"b":1,  "a":2}"#.to_vec());
    }

    #[test]
    fn test_json_shape() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        store.save(&sample(&store, "dev")).unwrap();

        let text = std::fs::read_to_string(store.config_path("dev")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["name"], "dev");
        assert_eq!(value["driver_name"], "none");
        assert!(value.get("driver").is_none());
        assert!(value.get("raw_driver").is_none());
        assert_eq!(
            std::fs::read(store.driver_path("dev")).unwrap(),
            br#"{"machine_name":"dev","ip_address":"10.1.2.3"}"#.to_vec()
        );
        // indented output
        assert!(text.contains("\n  \"name\""));
    }

    #[cfg(unix)]
    #[test]
    fn test_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        store.save(&sample(&store, "dev")).unwrap();
        store.save(&sample(&store, "dev")).unwrap();

        let dir_mode = std::fs::metadata(store.machine_dir("dev")).unwrap().permissions().mode();
        let file_mode = std::fs::metadata(store.config_path("dev")).unwrap().permissions().mode();
        let driver_mode = std::fs::metadata(store.driver_path("dev")).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
        assert_eq!(file_mode & 0o777, 0o600);
        assert_eq!(driver_mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_missing() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        assert!(matches!(
            store.load("ghost"),
            Err(KubeboxError::HostDoesNotExist(ref n)) if n == "ghost"
        ));
        assert!(!store.exists("ghost"));
        assert!(!store.exists(""));
    }

    #[test]
    fn test_list_skips_hidden_and_files() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        assert!(store.list().unwrap().is_empty());

        store.save(&sample(&store, "b")).unwrap();
        store.save(&sample(&store, "a")).unwrap();
        std::fs::create_dir_all(store.machines_dir().join(".trash")).unwrap();
        std::fs::write(store.machines_dir().join("stray.txt"), b"x").unwrap();

        assert_eq!(store.list().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_remove_is_recursive_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        store.save(&sample(&store, "dev")).unwrap();
        std::fs::write(store.machine_dir("dev").join("server.pem"), b"pem").unwrap();

        store.remove("dev").unwrap();
        assert!(!store.machine_dir("dev").exists());
        store.remove("dev").unwrap();
    }

    #[test]
    fn test_names_escaping_machines_dir_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        store.save(&sample(&store, "keep")).unwrap();
        std::fs::create_dir_all(dir.path().join("certs")).unwrap();
        std::fs::write(dir.path().join("certs/ca.pem"), b"pem").unwrap();

        for name in ["", "..", ".", "../certs", "a/b"] {
            assert!(
                matches!(store.remove(name), Err(KubeboxError::InvalidHostname(ref n)) if n == name),
                "remove({name:?}) should be rejected"
            );
            assert!(matches!(store.load(name), Err(KubeboxError::InvalidHostname(_))));
            assert!(!store.exists(name));
        }
        assert!(matches!(
            store.save(&Machine::new("", "none")),
            Err(KubeboxError::InvalidHostname(_))
        ));

        assert_eq!(store.list().unwrap(), vec!["keep".to_string()]);
        assert!(dir.path().join("certs/ca.pem").exists());
    }

    #[test]
    fn test_old_version_is_migrated() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        std::fs::create_dir_all(store.machine_dir("legacy")).unwrap();
        let v1 = serde_json::json!({
            "config_version": 1,
            "name": "legacy",
            "driver_name": "none",
            "machine_options": {
                "driver": "none",
                "engine_options": {"storage_driver": "aufs", "insecure_registry": "r.local"}
            },
            "driver": {"machine_name": "legacy"}
        });
        let original = serde_json::to_vec_pretty(&v1).unwrap();
        std::fs::write(store.config_path("legacy"), &original).unwrap();

        let loaded = store.load("legacy").unwrap();
        assert_eq!(loaded.config_version, CONFIG_VERSION);
        assert_eq!(loaded.runtime_options().storage_driver, "aufs");
        assert_eq!(loaded.runtime_options().insecure_registry_list, vec!["r.local".to_string()]);
        assert_eq!(loaded.raw_driver, br#"{"machine_name":"legacy"}"#.to_vec());
        assert_eq!(
            std::fs::read(store.driver_path("legacy")).unwrap(),
            br#"{"machine_name":"legacy"}"#.to_vec()
        );

        let backup = store.machine_dir("legacy").join(filenames::MACHINE_CONFIG_BACKUP);
        assert_eq!(std::fs::read(&backup).unwrap(), original);

        let rewritten: Value =
            serde_json::from_slice(&std::fs::read(store.config_path("legacy")).unwrap()).unwrap();
        assert_eq!(rewritten["config_version"], CONFIG_VERSION);
        assert!(rewritten.get("driver").is_none());
    }

    #[test]
    fn test_current_version_not_migrated() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        store.save(&sample(&store, "dev")).unwrap();
        let before = std::fs::read(store.config_path("dev")).unwrap();

        store.load("dev").unwrap();

        let backup = store.machine_dir("dev").join(filenames::MACHINE_CONFIG_BACKUP);
        assert!(!backup.exists());
        assert_eq!(std::fs::read(store.config_path("dev")).unwrap(), before);
    }

    #[test]
    fn test_future_version_loads_as_is() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        let mut m = sample(&store, "next");
        m.config_version = CONFIG_VERSION + 1;
        store.save(&m).unwrap();

        let loaded = store.load("next").unwrap();
        assert_eq!(loaded.config_version, CONFIG_VERSION + 1);
    }

    #[test]
    fn test_name_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let store = Filestore::new(dir.path());
        store.save(&sample(&store, "real")).unwrap();
        std::fs::rename(store.machine_dir("real"), store.machine_dir("renamed")).unwrap();
        assert!(store.load("renamed").is_err());
    }

    #[test]
    fn test_concurrent_save_and_load_never_tear() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Filestore::new(dir.path()));
        let mut first = sample(&store, "busy");
        first.machine_options.memory = 1;
        store.save(&first).unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    let mut m = sample(&store, "busy");
                    m.machine_options.memory = i;
                    m.machine_options.runtime_options.label_list =
                        (0..(i % 50)).map(|n| format!("label-{n}")).collect();
                    store.save(&m).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let loaded = store.load("busy").expect("load must never observe a partial file");
            assert_eq!(loaded.name, "busy");
        }
        writer.join().unwrap();
    }
}
