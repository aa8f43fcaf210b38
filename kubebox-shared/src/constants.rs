//! On-disk names and well-known values shared across crates.

/// Current schema version of a persisted machine descriptor.
pub const CONFIG_VERSION: u32 = 4;

/// Default TCP port of the container runtime API inside the guest.
pub const DEFAULT_RUNTIME_PORT: u16 = 2376;

/// Container runtime whose packaging changed at the CE split.
pub const RUNTIME_PACKAGE: &str = "docker";

/// Package name used by releases that predate CE versioning.
pub const LEGACY_RUNTIME_PACKAGE: &str = "docker-engine";

/// Last runtime release published before the CE versioning scheme.
pub const LAST_RELEASE_BEFORE_CE_VERSIONING: &str = "1.13.1";

pub mod filenames {
    pub const MACHINE_CONFIG: &str = "config.json";
    pub const MACHINE_CONFIG_BACKUP: &str = "config.json.bak";
    pub const DRIVER_CONFIG: &str = "driver.raw";

    pub const CA_CERT: &str = "ca.pem";
    pub const CA_KEY: &str = "ca-key.pem";
    pub const CLIENT_CERT: &str = "cert.pem";
    pub const CLIENT_KEY: &str = "key.pem";
    pub const SERVER_CERT: &str = "server.pem";
    pub const SERVER_KEY: &str = "server-key.pem";

    pub const CERT_LOCK: &str = "certs.lock";
    pub const LOG_FILE: &str = "kubebox.log";
}

/// Locations of TLS material inside the guest.
pub mod remote {
    pub const RUNTIME_CONFIG_DIR: &str = "/etc/docker";
    pub const CA_CERT: &str = "/etc/docker/ca.pem";
    pub const SERVER_CERT: &str = "/etc/docker/server.pem";
    pub const SERVER_KEY: &str = "/etc/docker/server-key.pem";
}
