//! Prelude module for common re-exports.
//!
//! ```rust
//! use blitz_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig};
pub use crate::homing::HomingConfig;
pub use crate::machine::config::{
    AxisConfig, BusConfig, DriveConfig, DriveMode, MachineConfig, MotionConfig, Parity,
    SimulationConfig,
};

// ─── Machine surface ────────────────────────────────────────────────
pub use crate::machine::error::MachineError;
pub use crate::machine::interlock::{Interlock, InterlockState};
pub use crate::machine::io::{HomingCallback, MachineIo};
pub use crate::machine::types::{
    BusState, HeadAngles, MachineState, MotionCommand, TravelLimits, cut_enable,
};

// ─── Homing ─────────────────────────────────────────────────────────
pub use crate::homing::{HomingOutcome, HomingPhase};

// ─── Signals ────────────────────────────────────────────────────────
pub use crate::io::signal::{Module, Signal, SignalAddress, SignalKind, SignalMap};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::MODULE_WIDTH;
