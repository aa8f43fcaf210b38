//! Shared fixtures for kubebox integration tests: a scriptable in-memory
//! driver, a recording provisioner and an isolated client home.

use std::fs::File;
use std::io::BufReader;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use kubebox::drivers::{MachineConfig, MachineState};
use kubebox::machine::{AuthOptions, RuntimeOptions};
use kubebox::provision::{
    OsRelease, PackageAction, Provisioner, RegisteredProvisioner, ServiceAction, StandardDetector,
};
use kubebox::{
    ClientOptions, Driver, DriverDef, DriverRegistry, KubeboxClient, Priority, ProbeState,
    WaitPolicy,
};
use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

pub const STUB_DRIVER: &str = "stub";

// ============================================================================
// STUB DRIVER
// ============================================================================

#[derive(Debug)]
struct StubInner {
    state: MachineState,
    bare_metal: bool,
    fail_pre_create: Option<String>,
    fail_create: Option<String>,
    fail_remove: Option<String>,
    fail_get_state: Option<String>,
    runtime_url: Option<String>,
    runtime_listening: bool,
    runtime_version: String,
    os_id: String,
    calls: Vec<String>,
}

impl Default for StubInner {
    fn default() -> Self {
        Self {
            state: MachineState::None,
            bare_metal: false,
            fail_pre_create: None,
            fail_create: None,
            fail_remove: None,
            fail_get_state: None,
            runtime_url: None,
            runtime_listening: true,
            runtime_version: "Docker version 17.06.0-ce, build 02c1d87".to_string(),
            os_id: "ubuntu".to_string(),
            calls: Vec::new(),
        }
    }
}

/// Handle for scripting and inspecting every [`StubDriver`] built from the
/// same definition. Drivers rehydrated by `load` share it too.
#[derive(Clone, Debug, Default)]
pub struct StubControl {
    inner: Arc<Mutex<StubInner>>,
}

impl StubControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MachineState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: MachineState) {
        self.inner.lock().state = state;
    }

    pub fn set_bare_metal(&self, bare_metal: bool) {
        self.inner.lock().bare_metal = bare_metal;
    }

    pub fn fail_pre_create(&self, message: &str) {
        self.inner.lock().fail_pre_create = Some(message.to_string());
    }

    pub fn fail_create(&self, message: &str) {
        self.inner.lock().fail_create = Some(message.to_string());
    }

    pub fn fail_remove(&self, message: Option<&str>) {
        self.inner.lock().fail_remove = message.map(str::to_string);
    }

    pub fn fail_get_state(&self, message: Option<&str>) {
        self.inner.lock().fail_get_state = message.map(str::to_string);
    }

    /// Endpoint reported by `get_url` instead of `tcp://<ip>:2376`.
    pub fn set_runtime_url(&self, url: Option<String>) {
        self.inner.lock().runtime_url = url;
    }

    pub fn set_runtime_listening(&self, listening: bool) {
        self.inner.lock().runtime_listening = listening;
    }

    /// Output the guest prints for `docker --version`.
    pub fn set_runtime_version(&self, output: &str) {
        self.inner.lock().runtime_version = output.to_string();
    }

    pub fn set_os_id(&self, id: &str) {
        self.inner.lock().os_id = id.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.inner.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    fn record(&self, call: impl Into<String>) {
        self.inner.lock().calls.push(call.into());
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StubConfig {
    pub machine_name: String,
    pub ip_address: String,
    pub store_path: PathBuf,
}

impl StubConfig {
    pub fn named(name: &str) -> Self {
        Self {
            machine_name: name.to_string(),
            ip_address: "127.0.0.1".to_string(),
            store_path: PathBuf::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// A driver that keeps its power state in a shared [`StubControl`] and
/// answers guest commands from canned output.
#[derive(Debug)]
pub struct StubDriver {
    name: String,
    config: StubConfig,
    control: StubControl,
}

impl StubDriver {
    pub fn new(name: &str, control: StubControl) -> Self {
        Self {
            name: name.to_string(),
            config: StubConfig::default(),
            control,
        }
    }

    fn scripted_failure(
        &self,
        pick: impl Fn(&StubInner) -> Option<String>,
    ) -> KubeboxResult<()> {
        let inner = self.control.inner.lock();
        match pick(&*inner) {
            Some(message) => Err(KubeboxError::Driver(message)),
            None => Ok(()),
        }
    }
}

impl Driver for StubDriver {
    fn driver_name(&self) -> String {
        self.name.clone()
    }

    fn machine_name(&self) -> String {
        self.config.machine_name.clone()
    }

    fn load_config(&mut self, raw: &[u8]) -> KubeboxResult<()> {
        self.config = serde_json::from_slice(raw)
            .map_err(|e| KubeboxError::Config(format!("invalid stub config: {}", e)))?;
        Ok(())
    }

    fn config_raw(&self) -> KubeboxResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.config)?)
    }

    fn get_url(&self) -> KubeboxResult<String> {
        match self.control.inner.lock().runtime_url.clone() {
            Some(url) => Ok(url),
            None => Ok(format!("tcp://{}:2376", self.config.ip_address)),
        }
    }

    fn get_ip(&self) -> KubeboxResult<String> {
        Ok(self.config.ip_address.clone())
    }

    fn get_state(&self) -> KubeboxResult<MachineState> {
        self.scripted_failure(|i| i.fail_get_state.clone())?;
        Ok(self.control.state())
    }

    fn pre_create_check(&mut self) -> KubeboxResult<()> {
        self.control.record("pre_create_check");
        self.scripted_failure(|i| i.fail_pre_create.clone())
    }

    fn create(&mut self) -> KubeboxResult<()> {
        self.control.record("create");
        self.scripted_failure(|i| i.fail_create.clone())?;
        self.control.set_state(MachineState::Running);
        Ok(())
    }

    fn start(&mut self) -> KubeboxResult<()> {
        self.control.record("start");
        if self.control.state() == MachineState::Running {
            return Err(KubeboxError::HostAlreadyInState {
                name: self.config.machine_name.clone(),
                state: MachineState::Running.to_string(),
            });
        }
        self.control.set_state(MachineState::Running);
        Ok(())
    }

    fn stop(&mut self) -> KubeboxResult<()> {
        self.control.record("stop");
        self.control.set_state(MachineState::Stopped);
        Ok(())
    }

    fn kill(&mut self) -> KubeboxResult<()> {
        self.control.record("kill");
        self.control.set_state(MachineState::Stopped);
        Ok(())
    }

    fn restart(&mut self) -> KubeboxResult<()> {
        self.control.record("restart");
        self.control.set_state(MachineState::Running);
        Ok(())
    }

    fn remove(&mut self) -> KubeboxResult<()> {
        self.control.record("remove");
        self.scripted_failure(|i| i.fail_remove.clone())?;
        self.control.set_state(MachineState::None);
        Ok(())
    }

    fn get_ssh_hostname(&self) -> KubeboxResult<String> {
        self.get_ip()
    }

    fn get_ssh_key_path(&self) -> PathBuf {
        self.config.store_path.join("id_rsa")
    }

    fn get_ssh_port(&self) -> KubeboxResult<u16> {
        Ok(22)
    }

    fn get_ssh_username(&self) -> String {
        "docker".to_string()
    }

    fn run_command(&mut self, cmd: &str) -> KubeboxResult<String> {
        self.control.record(format!("run: {}", cmd));
        let inner = self.control.inner.lock();
        if cmd.contains("netstat") {
            return Ok(if inner.runtime_listening {
                "tcp6       0      0 :::2376                 :::*                    LISTEN\n"
                    .to_string()
            } else {
                "tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN\n"
                    .to_string()
            });
        }
        if cmd == "docker --version" {
            return Ok(format!("{}\n", inner.runtime_version));
        }
        if cmd.contains("/etc/os-release") {
            return Ok(format!(
                "NAME=\"Stub Linux\"\nID={}\nVERSION_ID=\"1.0\"\n",
                inner.os_id
            ));
        }
        Ok(String::new())
    }

    fn is_bare_metal(&self) -> bool {
        self.control.inner.lock().bare_metal
    }
}

/// Registry definition producing [`StubDriver`]s wired to `control`.
pub fn stub_driver_def(name: &str, control: StubControl) -> DriverDef {
    let driver_name = name.to_string();
    DriverDef {
        name: name.to_string(),
        aliases: Vec::new(),
        config: Some(Arc::new(|cfg: &MachineConfig| -> KubeboxResult<Vec<u8>> {
            let config = StubConfig {
                machine_name: cfg.name.clone(),
                ip_address: "127.0.0.1".to_string(),
                store_path: cfg.store_path.clone(),
            };
            Ok(serde_json::to_vec(&config)?)
        })),
        init: Some(Arc::new(move || {
            Box::new(StubDriver::new(&driver_name, control.clone())) as Box<dyn Driver>
        })),
        status: Some(Arc::new(ProbeState::healthy)),
        priority: Priority::Default,
        default: false,
    }
}

// ============================================================================
// RECORDING PROVISIONER
// ============================================================================

/// Ordered log of provisioner calls, shared by every provisioner a
/// [`recording_detector`] hands out.
#[derive(Clone, Debug, Default)]
pub struct ProvisionLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ProvisionLog {
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn push(&self, entry: String) {
        self.entries.lock().push(entry);
    }
}

#[derive(Debug)]
pub struct RecordingProvisioner {
    name: String,
    log: ProvisionLog,
}

impl Provisioner for RecordingProvisioner {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn provision(
        &mut self,
        _driver: &mut dyn Driver,
        auth: &AuthOptions,
        runtime: &RuntimeOptions,
    ) -> KubeboxResult<()> {
        if !auth.server_cert_path.exists() {
            return Err(KubeboxError::Provision(format!(
                "server certificate missing at {}",
                auth.server_cert_path.display()
            )));
        }
        self.log
            .push(format!("{}: provision port {}", self.name, runtime.port()));
        Ok(())
    }

    fn package_action(
        &mut self,
        _driver: &mut dyn Driver,
        package: &str,
        action: PackageAction,
    ) -> KubeboxResult<()> {
        self.log
            .push(format!("{}: package {} {}", self.name, action, package));
        Ok(())
    }

    fn service_action(
        &mut self,
        _driver: &mut dyn Driver,
        service: &str,
        action: ServiceAction,
    ) -> KubeboxResult<()> {
        self.log
            .push(format!("{}: service {} {}", self.name, action, service));
        Ok(())
    }
}

/// A detector offering recording provisioners for `ubuntu` and
/// `boot2docker` guests.
pub fn recording_detector(log: &ProvisionLog) -> StandardDetector {
    let detector = StandardDetector::new();
    for id in ["boot2docker", "ubuntu"] {
        let log = log.clone();
        detector.register(RegisteredProvisioner {
            name: id.to_string(),
            compatible: Arc::new(move |os: &OsRelease| os.is_like(id)),
            new: Arc::new(move || {
                Box::new(RecordingProvisioner {
                    name: id.to_string(),
                    log: log.clone(),
                }) as Box<dyn Provisioner>
            }),
        });
    }
    detector
}

// ============================================================================
// TLS RUNTIME ENDPOINT
// ============================================================================

/// A local TLS listener standing in for the guest's runtime API.
///
/// The certificate and key are read from disk on every accepted connection,
/// so a regenerated server certificate is picked up by the next handshake.
pub struct TlsEndpoint {
    pub url: String,
    accepted: Arc<AtomicUsize>,
}

impl TlsEndpoint {
    /// Serve up to `connections` handshakes, hanging up on the first
    /// `hang_up_first` of them without speaking TLS.
    pub fn serve(cert: PathBuf, key: PathBuf, hang_up_first: usize, connections: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind TLS endpoint");
        let url = format!(
            "tcp://{}",
            listener.local_addr().expect("Failed to read local address")
        );
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        std::thread::spawn(move || {
            for n in 0..connections {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if n < hang_up_first {
                    continue;
                }
                let Some(config) = server_config(&cert, &key) else {
                    continue;
                };
                let Ok(mut conn) = rustls::ServerConnection::new(config) else {
                    continue;
                };
                while conn.is_handshaking() {
                    if conn.complete_io(&mut stream).is_err() {
                        break;
                    }
                }
                while conn.wants_write() {
                    if conn.write_tls(&mut stream).is_err() {
                        break;
                    }
                }
            }
        });

        Self { url, accepted }
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

fn server_config(cert: &Path, key: &Path) -> Option<Arc<rustls::ServerConfig>> {
    let chain = rustls_pemfile::certs(&mut BufReader::new(File::open(cert).ok()?))
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key).ok()?)).ok()??;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .ok()?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .ok()?;
    Some(Arc::new(config))
}

// ============================================================================
// TEST CONTEXT
// ============================================================================

/// Client options with short waits and no file logging, rooted at `home`.
pub fn fast_options(home: impl Into<PathBuf>) -> ClientOptions {
    let mut options = ClientOptions::with_home(home);
    options.file_logging = false;
    options.lock_timeout = Duration::from_secs(5);
    options.machine_wait = WaitPolicy::new(5, Duration::from_millis(10));
    options.runtime_wait = WaitPolicy::new(3, Duration::from_millis(10));
    options.check_runtime_tls = false;
    options
}

/// Isolated home with a private registry holding the stub driver.
pub struct TestContext {
    pub client: KubeboxClient,
    pub control: StubControl,
    pub log: ProvisionLog,
    pub registry: DriverRegistry,
    _temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self::in_dir(temp_dir)
    }

    pub fn in_dir(temp_dir: TempDir) -> Self {
        let control = StubControl::new();
        let log = ProvisionLog::default();
        let registry = DriverRegistry::new();
        registry
            .register(stub_driver_def(STUB_DRIVER, control.clone()))
            .expect("Failed to register stub driver");
        let client = KubeboxClient::with_parts(
            fast_options(temp_dir.path()),
            registry.clone(),
            Arc::new(recording_detector(&log)),
        )
        .expect("Failed to create client");
        Self {
            client,
            control,
            log,
            registry,
            _temp_dir: temp_dir,
        }
    }

    pub fn home(&self) -> PathBuf {
        self.client.layout().home_dir().to_path_buf()
    }

    /// Another client over the same home and registry, as a second caller
    /// in the same process would see it.
    pub fn sibling_client(&self) -> KubeboxClient {
        KubeboxClient::with_parts(
            fast_options(self.home()),
            self.registry.clone(),
            Arc::new(recording_detector(&self.log)),
        )
        .expect("Failed to create client")
    }

    /// Like [`sibling_client`](Self::sibling_client), but handshaking with
    /// the runtime endpoint after create, start and restart.
    pub fn tls_checking_client(&self) -> KubeboxClient {
        let mut options = fast_options(self.home());
        options.check_runtime_tls = true;
        KubeboxClient::with_parts(
            options,
            self.registry.clone(),
            Arc::new(recording_detector(&self.log)),
        )
        .expect("Failed to create client")
    }

    /// An in-memory stub machine called `name`.
    pub fn stub_machine(&self, name: &str) -> kubebox::Machine {
        self.client
            .new_machine(STUB_DRIVER, &StubConfig::named(name).to_bytes())
            .expect("Failed to instantiate stub machine")
    }

    /// A stub machine that went through `create`.
    pub fn created_machine(&self, name: &str) -> kubebox::Machine {
        let mut machine = self.stub_machine(name);
        self.client
            .create(&mut machine)
            .expect("Failed to create stub machine");
        machine
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
