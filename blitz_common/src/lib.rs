//! Blitz Common Library
//!
//! Shared types for the Blitz profile cutting machine: configuration,
//! the `MachineIo` capability trait, machine state snapshots, interlock
//! flags and field-bus signal naming.
//!
//! # Module Structure
//!
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Machine-wide defaults
//! - [`machine`] - `MachineIo`, `MachineError`, `MachineConfig`, snapshots
//! - [`io`] - Logical signal names and the signal map
//! - [`homing`] - Homing phases, outcome and parameters
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use blitz_common::prelude::*;
//!
//! let config = MachineConfig::default();
//! assert!(config.validate().is_ok());
//! ```

pub mod config;
pub mod consts;
pub mod homing;
pub mod io;
pub mod machine;
pub mod prelude;
