//! Real-hardware backend.
//!
//! - [`machine`] - `RealMachine` and the shared motion state
//! - [`axis`] - homing steps through pulse generator, drive or model

mod axis;
mod machine;

pub use machine::{BACKEND_NAME, RealMachine, RealParts};

use blitz_common::machine::config::MachineConfig;
use blitz_common::machine::error::MachineError;
use blitz_common::machine::io::MachineIo;

/// Factory entry for the backend registry.
pub fn create_machine(config: &MachineConfig) -> Result<Box<dyn MachineIo>, MachineError> {
    Ok(Box::new(RealMachine::connect(config)?))
}
