//! # Blitz HAL
//!
//! Machine-control layer of the Blitz two-head profile cutting machine:
//! field bus relay modules, servo drive link, step/direction motion,
//! quadrature feedback, homing, and the two `MachineIo` backends.
//!
//! # Module Structure
//!
//! - [`fieldbus`] - Modbus RTU codec, client and the `IoGateway` mirror
//! - [`drive`] - ASCII line link to the servo driver
//! - [`motion`] - pulse generator, encoder reader, GPIO pins
//! - [`homing`] - homing sequencer shared by both backends
//! - [`drivers`] - `SimulationMachine` and `RealMachine`
//! - [`factory`] - backend registry and `Auto`/`Simulation`/`Real` selection
//! - [`control_loop`] - periodic tick loop with timing statistics
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         blitz_hal                                │
//! │  ┌──────────────┐    ┌──────────────┐    ┌───────────────────┐   │
//! │  │ ControlLoop  │───►│  MachineIo   │◄───│  MachineFactory   │   │
//! │  │  (tick)      │    │  (trait obj) │    │  (registry)       │   │
//! │  └──────────────┘    └──────┬───────┘    └───────────────────┘   │
//! │                             │                                    │
//! │            ┌────────────────┼──────────────────┐                 │
//! │            ▼                ▼                  ▼                 │
//! │     ┌────────────┐   ┌─────────────┐   ┌───────────────────┐     │
//! │     │ IoGateway  │   │  DriveLink  │   │ PulseGenerator /  │     │
//! │     │ (RS485)    │   │  (serial)   │   │ EncoderReader     │     │
//! │     └────────────┘   └─────────────┘   └───────────────────┘     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod control_loop;
pub mod drive;
pub mod drivers;
pub mod factory;
pub mod fieldbus;
pub mod homing;
pub mod motion;

pub use crate::control_loop::{ControlLoop, TimingStats};
pub use crate::drivers::real::RealMachine;
pub use crate::drivers::simulation::SimulationMachine;
pub use crate::factory::{BuildMode, MachineFactory, MachineRegistry};
