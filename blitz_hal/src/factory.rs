//! Backend registry and selection.
//!
//! `MachineRegistry` maps backend names to factory functions. It is built
//! at startup and passed by value; there is no global registry.
//! `MachineFactory` picks a backend according to a [`BuildMode`].

use blitz_common::machine::config::MachineConfig;
use blitz_common::machine::error::MachineError;
use blitz_common::machine::io::MachineIo;
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

use crate::drivers::{self, real, simulation};

/// Backend constructor.
pub type MachineFactoryFn = fn(&MachineConfig) -> Result<Box<dyn MachineIo>, MachineError>;

/// Registry of available backends.
pub struct MachineRegistry {
    factories: HashMap<&'static str, MachineFactoryFn>,
}

impl MachineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding the simulation and real backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        drivers::register_builtin(&mut registry);
        registry
    }

    /// Register a backend factory.
    ///
    /// # Panics
    /// Panics if a backend with the same name is already registered.
    pub fn register(&mut self, name: &'static str, factory: MachineFactoryFn) {
        if self.factories.contains_key(name) {
            panic!("Backend '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    pub fn get_factory(&self, name: &str) -> Option<MachineFactoryFn> {
        self.factories.get(name).copied()
    }

    /// Build a backend by name.
    ///
    /// # Errors
    /// `MachineError::Unavailable` for unknown names; otherwise whatever the
    /// backend constructor returns.
    pub fn create(
        &self,
        name: &str,
        config: &MachineConfig,
    ) -> Result<Box<dyn MachineIo>, MachineError> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| MachineError::Unavailable(format!("backend '{name}' not registered")))?;
        factory(config)
    }

    /// All registered backend names.
    pub fn list(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildMode {
    /// Try the real hardware, fall back to simulation on any failure.
    #[default]
    Auto,
    /// Always simulate.
    Simulation,
    /// Real hardware or an error (commissioning).
    Real,
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Simulation => write!(f, "simulation"),
            Self::Real => write!(f, "real"),
        }
    }
}

/// Builds the `MachineIo` backend for a configuration.
pub struct MachineFactory {
    registry: MachineRegistry,
}

impl MachineFactory {
    pub fn new(registry: MachineRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    /// Build with the built-in registry.
    pub fn build(
        config: &MachineConfig,
        mode: BuildMode,
    ) -> Result<Box<dyn MachineIo>, MachineError> {
        Self::default().create(config, mode)
    }

    /// Build a backend according to `mode`.
    ///
    /// # Errors
    /// Only in `Real` mode, or when the simulation itself is not registered.
    pub fn create(
        &self,
        config: &MachineConfig,
        mode: BuildMode,
    ) -> Result<Box<dyn MachineIo>, MachineError> {
        match mode {
            BuildMode::Simulation => self.registry.create(simulation::BACKEND_NAME, config),
            BuildMode::Real => self.registry.create(real::BACKEND_NAME, config),
            BuildMode::Auto => match self.registry.create(real::BACKEND_NAME, config) {
                Ok(machine) => Ok(machine),
                Err(e) => {
                    warn!("Real hardware unavailable ({e}); falling back to simulation");
                    self.registry.create(simulation::BACKEND_NAME, config)
                }
            },
        }
        .inspect(|machine| info!("Using '{}' backend ({mode} mode)", machine.backend_name()))
    }
}

impl Default for MachineFactory {
    fn default() -> Self {
        Self::new(MachineRegistry::with_builtin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(_: &MachineConfig) -> Result<Box<dyn MachineIo>, MachineError> {
        Err(MachineError::Transport("no adapter".to_string()))
    }

    #[test]
    fn builtin_backends_are_registered() {
        let reg = MachineRegistry::with_builtin();
        let mut names = reg.list();
        names.sort();
        assert_eq!(names, vec!["real", "simulation"]);
    }

    #[test]
    fn unknown_backend_is_unavailable() {
        let reg = MachineRegistry::new();
        let result = reg.create("ethercat", &MachineConfig::default());
        assert!(matches!(result, Err(MachineError::Unavailable(_))));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut reg = MachineRegistry::new();
        reg.register("dup", failing);
        reg.register("dup", failing);
    }

    #[test]
    fn auto_falls_back_to_simulation() {
        let mut reg = MachineRegistry::new();
        reg.register(simulation::BACKEND_NAME, simulation::create_machine);
        reg.register(real::BACKEND_NAME, failing);
        let factory = MachineFactory::new(reg);

        let machine = factory
            .create(&MachineConfig::default(), BuildMode::Auto)
            .unwrap();
        assert_eq!(machine.backend_name(), "simulation");
    }

    #[test]
    fn real_mode_fails_hard() {
        let mut reg = MachineRegistry::new();
        reg.register(simulation::BACKEND_NAME, simulation::create_machine);
        reg.register(real::BACKEND_NAME, failing);
        let factory = MachineFactory::new(reg);

        let result = factory.create(&MachineConfig::default(), BuildMode::Real);
        assert!(matches!(result, Err(MachineError::Transport(_))));
    }

    #[test]
    fn real_without_bus_section_is_a_config_error() {
        let result = MachineFactory::build(&MachineConfig::default(), BuildMode::Real);
        assert!(matches!(result, Err(MachineError::Config(_))));
    }

    #[test]
    fn simulation_mode_ignores_hardware() {
        let machine =
            MachineFactory::build(&MachineConfig::default(), BuildMode::Simulation).unwrap();
        assert_eq!(machine.backend_name(), "simulation");
    }
}
