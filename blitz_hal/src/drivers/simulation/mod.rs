//! Software simulation backend.
//!
//! Runs the full `MachineIo` surface without a field bus, drive or GPIO.
//! Used for development, for the test suite and as the fallback when the
//! real hardware cannot be opened.

mod machine;

pub use machine::{BACKEND_NAME, SimulationMachine};

use blitz_common::machine::config::MachineConfig;
use blitz_common::machine::error::MachineError;
use blitz_common::machine::io::MachineIo;

/// Factory entry for the backend registry.
pub fn create_machine(config: &MachineConfig) -> Result<Box<dyn MachineIo>, MachineError> {
    Ok(Box::new(SimulationMachine::new(config)))
}
