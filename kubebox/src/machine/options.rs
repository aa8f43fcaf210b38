//! Fixed-shape settings carried by every machine descriptor.

use std::path::{Path, PathBuf};

use kubebox_shared::constants::{DEFAULT_RUNTIME_PORT, filenames, remote};
use serde::{Deserialize, Serialize};

/// Settings that apply to the machine as a whole.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineOptions {
    /// Driver registry name
    pub driver: String,

    /// Container runtime installed in the guest
    pub runtime: String,

    /// Memory in MiB
    pub memory: u32,

    /// Disk size in MiB
    pub disk: u32,

    pub cpus: u32,

    pub auth_options: AuthOptions,

    pub runtime_options: RuntimeOptions,
}

/// Filesystem locations of the TLS material for one machine.
///
/// CA and client pairs live in the shared certificate directory; the server
/// pair lives in the machine's own directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthOptions {
    pub cert_dir: PathBuf,
    pub ca_cert_path: PathBuf,
    pub ca_private_key_path: PathBuf,
    pub ca_cert_remote_path: String,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    pub server_cert_path: PathBuf,
    pub server_key_path: PathBuf,
    pub server_cert_remote_path: String,
    pub server_key_remote_path: String,
    /// Extra subject alternative names for the server certificate
    pub server_cert_sans: Vec<String>,
    /// The machine's directory in the store
    pub store_path: PathBuf,
}

impl AuthOptions {
    /// Auth paths for machine `name` rooted at `certs_dir` and `machine_dir`.
    pub fn for_machine(certs_dir: &Path, machine_dir: &Path) -> Self {
        Self {
            cert_dir: certs_dir.to_path_buf(),
            ca_cert_path: certs_dir.join(filenames::CA_CERT),
            ca_private_key_path: certs_dir.join(filenames::CA_KEY),
            ca_cert_remote_path: remote::CA_CERT.to_string(),
            client_cert_path: certs_dir.join(filenames::CLIENT_CERT),
            client_key_path: certs_dir.join(filenames::CLIENT_KEY),
            server_cert_path: machine_dir.join(filenames::SERVER_CERT),
            server_key_path: machine_dir.join(filenames::SERVER_KEY),
            server_cert_remote_path: remote::SERVER_CERT.to_string(),
            server_key_remote_path: remote::SERVER_KEY.to_string(),
            server_cert_sans: Vec::new(),
            store_path: machine_dir.to_path_buf(),
        }
    }
}

/// Configuration of the container runtime inside the guest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    pub storage_driver: String,
    pub tls_verify: bool,
    pub dns_list: Vec<String>,
    pub graph_dir: String,
    pub env_list: Vec<String>,
    pub ipv6: bool,
    pub insecure_registry_list: Vec<String>,
    pub label_list: Vec<String>,
    pub log_level: String,
    pub selinux_enabled: bool,
    pub registry_mirror_list: Vec<String>,
    /// Overrides the default runtime API port
    pub custom_port: Option<u16>,
    pub arbitrary_flag_list: Vec<String>,
    pub install_url: String,
    /// Auth material the runtime configuration points at; filled in right
    /// before provisioning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_options_ref: Option<AuthOptions>,
    /// Directory holding the runtime's configuration inside the guest
    pub runtime_opts_dir: String,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            storage_driver: "overlay2".to_string(),
            tls_verify: true,
            dns_list: Vec::new(),
            graph_dir: String::new(),
            env_list: Vec::new(),
            ipv6: false,
            insecure_registry_list: Vec::new(),
            label_list: Vec::new(),
            log_level: String::new(),
            selinux_enabled: false,
            registry_mirror_list: Vec::new(),
            custom_port: None,
            arbitrary_flag_list: Vec::new(),
            install_url: "https://get.docker.com".to_string(),
            auth_options_ref: None,
            runtime_opts_dir: remote::RUNTIME_CONFIG_DIR.to_string(),
        }
    }
}

impl RuntimeOptions {
    /// Port the runtime API listens on.
    pub fn port(&self) -> u16 {
        self.custom_port.unwrap_or(DEFAULT_RUNTIME_PORT)
    }
}
