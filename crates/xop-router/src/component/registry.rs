//! Component registry and auto-loader.
//!
//! Components are made available by name through factory functions registered
//! at startup. The auto-loader instantiates the enabled ones and hands them to
//! the [`ComponentManager`]; a component that fails to load is reported and
//! skipped without affecting the rest.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, info, warn};

use super::{ComponentManager, VirtualComponent};
use crate::config::ComponentsConfig;
use crate::XopError;

/// Free-form per-component settings from configuration.
pub type ComponentSettings = HashMap<String, String>;

/// Builds a component from its settings.
pub type ComponentFactory =
    Arc<dyn Fn(&ComponentSettings) -> Result<Box<dyn VirtualComponent>, XopError> + Send + Sync>;

/// Name to factory table of loadable components.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: BTreeMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ComponentSettings) -> Result<Box<dyn VirtualComponent>, XopError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    /// Check if a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Get the factory registered under `name`.
    pub fn factory(&self, name: &str) -> Option<ComponentFactory> {
        self.factories.get(name).cloned()
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.names())
            .finish()
    }
}

/// Why a component was not loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// No factory is registered under the name
    NotRegistered,
    /// The factory returned an error
    Construct(String),
    /// The factory panicked
    Panicked,
    /// The component's `init` failed
    Init(String),
}

impl fmt::Display for LoadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRegistered => write!(f, "no component registered under this name"),
            Self::Construct(reason) => write!(f, "construction failed: {}", reason),
            Self::Panicked => write!(f, "construction panicked"),
            Self::Init(reason) => write!(f, "initialization failed: {}", reason),
        }
    }
}

/// Outcome of an auto-loader run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Names loaded and registered
    pub loaded: Vec<String>,
    /// Names that failed, with the reason
    pub failed: Vec<(String, LoadFailure)>,
}

/// Instantiates enabled components and registers them with a manager.
pub struct ComponentAutoLoader<'a> {
    registry: &'a ComponentRegistry,
    manager: &'a ComponentManager,
}

impl<'a> ComponentAutoLoader<'a> {
    /// Create a loader over `registry` feeding `manager`.
    pub fn new(registry: &'a ComponentRegistry, manager: &'a ComponentManager) -> Self {
        Self { registry, manager }
    }

    /// Load the components `config` enables; every registered one if the list is empty.
    pub async fn load(&self, config: &ComponentsConfig) -> LoadReport {
        let mut names: Vec<String> = if config.enabled.is_empty() {
            self.registry.names()
        } else {
            config
                .enabled
                .iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect()
        };
        let mut seen = HashSet::new();
        names.retain(|name| seen.insert(name.clone()));

        let mut report = LoadReport::default();
        for name in names {
            match self.load_one(&name, &config.settings_for(&name)).await {
                Ok(()) => {
                    info!(component = %name, "Loaded component");
                    report.loaded.push(name);
                }
                Err(failure) => {
                    warn!(component = %name, reason = %failure, "Unable to load component");
                    report.failed.push((name, failure));
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Component loading finished"
        );
        report
    }

    async fn load_one(&self, name: &str, settings: &ComponentSettings) -> Result<(), LoadFailure> {
        let factory = self
            .registry
            .factory(name)
            .ok_or(LoadFailure::NotRegistered)?;

        let component = match catch_unwind(AssertUnwindSafe(|| factory(settings))) {
            Ok(Ok(component)) => component,
            Ok(Err(e)) => return Err(LoadFailure::Construct(e.to_string())),
            Err(_) => {
                error!(component = %name, "Component factory panicked");
                return Err(LoadFailure::Panicked);
            }
        };

        self.manager
            .add_component(component)
            .await
            .map_err(|e| LoadFailure::Init(e.to_string()))
    }
}
