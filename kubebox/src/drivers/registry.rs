//! Process-wide catalog of driver definitions.
//!
//! Drivers are registered explicitly by a composition root (see
//! [`super::register_builtin_drivers`]) instead of self-registering at load
//! time, so registration order is always visible at the call site.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Driver, MachineConfig};

/// Turns generic machine settings into a driver's raw configuration bytes.
pub type ConfigFactory = Arc<dyn Fn(&MachineConfig) -> KubeboxResult<Vec<u8>> + Send + Sync>;

/// Produces a fresh, unconfigured driver instance.
pub type InitFactory = Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// Probes the host for the driver's backend.
pub type StatusProbe = Arc<dyn Fn() -> ProbeState + Send + Sync>;

/// How strongly a driver should be preferred when several are installed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Priority {
    #[default]
    Unknown,
    Discouraged,
    Deprecated,
    Fallback,
    Default,
    Preferred,
    StronglyPreferred,
}

/// Result of probing the host for a driver's backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeState {
    pub installed: bool,
    pub running: bool,
    pub healthy: bool,
    pub error: Option<String>,
    /// What the user can do to fix an unhealthy backend
    pub fix_hint: String,
    pub doc_url: String,
    pub reason: String,
}

impl ProbeState {
    /// State for a backend that is present and usable.
    pub fn healthy() -> Self {
        Self {
            installed: true,
            running: true,
            healthy: true,
            ..Default::default()
        }
    }

    /// State for a backend whose binary could not be found.
    pub fn not_installed(
        error: impl Into<String>,
        fix_hint: impl Into<String>,
        doc_url: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            fix_hint: fix_hint.into(),
            doc_url: doc_url.into(),
            ..Default::default()
        }
    }
}

/// A driver's registration entry.
#[derive(Clone, Default)]
pub struct DriverDef {
    pub name: String,
    pub aliases: Vec<String>,
    pub config: Option<ConfigFactory>,
    pub init: Option<InitFactory>,
    pub status: Option<StatusProbe>,
    pub priority: Priority,
    /// Whether this driver may be picked without the user asking for it
    pub default: bool,
}

impl DriverDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// The sentinel returned by lookups that found nothing.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl std::fmt::Debug for DriverDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverDef")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("priority", &self.priority)
            .field("default", &self.default)
            .field("has_config", &self.config.is_some())
            .field("has_init", &self.init.is_some())
            .field("has_status", &self.status.is_some())
            .finish()
    }
}

/// An installed driver together with its probe result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverStatus {
    pub name: String,
    pub priority: Priority,
    pub state: ProbeState,
}

/// Thread-safe driver catalog.
///
/// Cloning is cheap and every clone shares the same entries. All accessors
/// return snapshots; the lock is never held while a probe runs.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    drivers: HashMap<String, DriverDef>,
    /// alias -> canonical name
    aliases: HashMap<String, String>,
}

static GLOBAL_REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created empty on first use.
    pub fn global() -> &'static DriverRegistry {
        GLOBAL_REGISTRY.get_or_init(DriverRegistry::new)
    }

    /// Register a driver definition.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if the name or any alias collides with an
    /// existing canonical name or alias.
    pub fn register(&self, def: DriverDef) -> KubeboxResult<()> {
        if def.is_empty() {
            return Err(KubeboxError::Config(
                "driver definition must have a name".to_string(),
            ));
        }

        let mut inner = self.inner.lock();
        if inner.drivers.contains_key(&def.name) || inner.aliases.contains_key(&def.name) {
            return Err(KubeboxError::DuplicateName(def.name));
        }
        for alias in &def.aliases {
            if alias == &def.name
                || inner.drivers.contains_key(alias)
                || inner.aliases.contains_key(alias)
            {
                return Err(KubeboxError::DuplicateName(alias.clone()));
            }
        }

        tracing::debug!(
            driver = %def.name,
            aliases = ?def.aliases,
            priority = ?def.priority,
            "Registering driver"
        );
        for alias in &def.aliases {
            inner.aliases.insert(alias.clone(), def.name.clone());
        }
        inner.drivers.insert(def.name.clone(), def);
        Ok(())
    }

    /// Find a definition by canonical name, then by alias.
    ///
    /// Returns an empty definition (see [`DriverDef::is_empty`]) when absent.
    pub fn lookup(&self, name: &str) -> DriverDef {
        let inner = self.inner.lock();
        if let Some(def) = inner.drivers.get(name) {
            return def.clone();
        }
        inner
            .aliases
            .get(name)
            .and_then(|canonical| inner.drivers.get(canonical))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every registered definition, ordered by name.
    pub fn list(&self) -> Vec<DriverDef> {
        let inner = self.inner.lock();
        let mut defs: Vec<DriverDef> = inner.drivers.values().cloned().collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Probe every driver and return those installed on this host.
    ///
    /// Ordered by descending priority, then name.
    pub fn installed(&self) -> Vec<DriverStatus> {
        let mut found = Vec::new();
        for def in self.list() {
            let Some(probe) = def.status.as_ref() else {
                tracing::info!(driver = %def.name, "Driver has no status probe, skipping");
                continue;
            };
            let state = probe();
            if !state.installed {
                tracing::debug!(
                    driver = %def.name,
                    error = ?state.error,
                    "Driver not installed"
                );
                continue;
            }
            found.push(DriverStatus {
                name: def.name.clone(),
                priority: def.priority,
                state,
            });
        }
        found.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        found
    }

    /// Probe a single driver. Unknown drivers report the zero state.
    pub fn status(&self, name: &str) -> ProbeState {
        let def = self.lookup(name);
        match def.status {
            Some(probe) => probe(),
            None => ProbeState::default(),
        }
    }

    /// Pick a driver for a user who didn't name one.
    ///
    /// Prefers healthy drivers flagged as defaults, then any healthy driver,
    /// each in priority order.
    pub fn suggest(&self) -> Option<DriverStatus> {
        let healthy: Vec<DriverStatus> = self
            .installed()
            .into_iter()
            .filter(|s| s.state.healthy && s.priority > Priority::Unknown)
            .collect();

        let first_default = healthy
            .iter()
            .find(|s| self.lookup(&s.name).default)
            .cloned();
        first_default.or_else(|| healthy.into_iter().next())
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.list().into_iter().map(|d| d.name).collect();
        f.debug_struct("DriverRegistry")
            .field("drivers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn probed(name: &str, priority: Priority, state: ProbeState) -> DriverDef {
        DriverDef {
            name: name.to_string(),
            priority,
            status: Some(Arc::new(move || state.clone())),
            ..Default::default()
        }
    }

    #[test]
    fn test_register_then_lookup() {
        let registry = DriverRegistry::new();
        registry.register(DriverDef::new("kvm2")).unwrap();

        assert!(!registry.lookup("kvm2").is_empty());
        assert!(registry.lookup("virtualbox").is_empty());
    }

    #[test]
    fn test_duplicate_register() {
        let registry = DriverRegistry::new();
        registry.register(DriverDef::new("d")).unwrap();

        let err = registry.register(DriverDef::new("d")).unwrap_err();
        assert!(matches!(err, KubeboxError::DuplicateName(ref n) if n == "d"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_alias_resolution() {
        let registry = DriverRegistry::new();
        let mut def = DriverDef::new("none");
        def.aliases = vec!["native".to_string()];
        def.priority = Priority::Discouraged;
        registry.register(def).unwrap();

        let by_alias = registry.lookup("native");
        let by_name = registry.lookup("none");
        assert_eq!(by_alias.name, "none");
        assert_eq!(by_alias.name, by_name.name);
        assert_eq!(by_alias.priority, by_name.priority);
    }

    #[test]
    fn test_alias_collisions() {
        let registry = DriverRegistry::new();
        let mut def = DriverDef::new("none");
        def.aliases = vec!["native".to_string()];
        registry.register(def).unwrap();

        // New name colliding with an existing alias
        assert!(matches!(
            registry.register(DriverDef::new("native")),
            Err(KubeboxError::DuplicateName(_))
        ));

        // New alias colliding with an existing canonical name
        let mut other = DriverDef::new("bare");
        other.aliases = vec!["none".to_string()];
        assert!(matches!(
            registry.register(other),
            Err(KubeboxError::DuplicateName(ref n)) if n == "none"
        ));

        // Failed registrations leave nothing behind
        assert!(registry.lookup("bare").is_empty());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = DriverRegistry::new();
        assert!(registry.register(DriverDef::default()).is_err());
    }

    #[test]
    fn test_installed_filters_and_orders() {
        let registry = DriverRegistry::new();
        registry
            .register(probed("alpha", Priority::Fallback, ProbeState::healthy()))
            .unwrap();
        registry
            .register(probed("beta", Priority::Preferred, ProbeState::healthy()))
            .unwrap();
        registry
            .register(probed(
                "gamma",
                Priority::StronglyPreferred,
                ProbeState::not_installed("gamma not found", "install gamma", "https://example.invalid/gamma"),
            ))
            .unwrap();
        registry.register(DriverDef::new("no-probe")).unwrap();

        let names: Vec<String> = registry.installed().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["beta".to_string(), "alpha".to_string()]);
    }

    #[test]
    fn test_status_of_unknown_is_zero() {
        let registry = DriverRegistry::new();
        assert_eq!(registry.status("missing"), ProbeState::default());
    }

    #[test]
    fn test_status_invokes_probe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = DriverRegistry::new();
        registry
            .register(DriverDef {
                name: "counted".into(),
                status: Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ProbeState::healthy()
                })),
                ..Default::default()
            })
            .unwrap();

        assert!(registry.status("counted").healthy);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_probe_may_use_registry() {
        // A probe that calls back into the registry must not deadlock.
        let registry = DriverRegistry::new();
        let inner = registry.clone();
        registry
            .register(DriverDef {
                name: "reentrant".into(),
                status: Some(Arc::new(move || {
                    let _ = inner.list();
                    ProbeState::healthy()
                })),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(registry.installed().len(), 1);
    }

    #[test]
    fn test_suggest_prefers_default_flag() {
        let registry = DriverRegistry::new();
        registry
            .register(probed("fast", Priority::StronglyPreferred, ProbeState::healthy()))
            .unwrap();
        let mut chosen = probed("steady", Priority::Default, ProbeState::healthy());
        chosen.default = true;
        registry.register(chosen).unwrap();

        assert_eq!(registry.suggest().unwrap().name, "steady");
    }

    #[test]
    fn test_suggest_skips_unhealthy() {
        let registry = DriverRegistry::new();
        let sick = ProbeState {
            installed: true,
            error: Some("service down".into()),
            ..Default::default()
        };
        registry
            .register(probed("sick", Priority::Preferred, sick))
            .unwrap();
        assert!(registry.suggest().is_none());

        registry
            .register(probed("ok", Priority::Fallback, ProbeState::healthy()))
            .unwrap();
        assert_eq!(registry.suggest().unwrap().name, "ok");
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Unknown < Priority::Discouraged);
        assert!(Priority::Discouraged < Priority::Deprecated);
        assert!(Priority::Deprecated < Priority::Fallback);
        assert!(Priority::Fallback < Priority::Default);
        assert!(Priority::Default < Priority::Preferred);
        assert!(Priority::Preferred < Priority::StronglyPreferred);
    }
}
