//! `MachineIo` backends.
//!
//! - [`simulation`] - software model, no hardware required
//! - [`real`] - field bus, drive link and motion GPIO
//!
//! # Adding a backend
//!
//! 1. Create a submodule under `drivers/` implementing `MachineIo`
//! 2. Expose a `create_machine(&MachineConfig)` factory function
//! 3. Register it in [`register_builtin`]

pub mod real;
pub mod simulation;

use crate::factory::MachineRegistry;

/// Register every built-in backend.
pub fn register_builtin(registry: &mut MachineRegistry) {
    registry.register(simulation::BACKEND_NAME, simulation::create_machine);
    registry.register(real::BACKEND_NAME, real::create_machine);
}
