//! Machine-wide constants.
//!
//! Defaults for every numeric knob live here so the config layer, the
//! backends and the tests agree on one value.

/// Coils or inputs per field-bus module.
pub const MODULE_WIDTH: usize = 8;

/// Default lower travel limit (machine zero after homing), mm.
pub const DEFAULT_MIN_DISTANCE_MM: f64 = 250.0;

/// Default upper travel limit, mm.
pub const DEFAULT_MAX_CUT_LENGTH_MM: f64 = 4000.0;

/// Default speed for `command_move`, mm/s.
pub const DEFAULT_MOVE_SPEED_MM_S: f64 = 1000.0;

/// Simulated carriage speed, mm/s.
pub const DEFAULT_SIM_SPEED_MM_S: f64 = 2500.0;

/// Transmission ratio of the step/direction axis.
pub const DEFAULT_MM_PER_PULSE: f64 = 0.047125;

/// Step frequency ceiling of the pulse generator.
pub const MAX_PULSE_FREQ_HZ: f64 = 500_000.0;

/// Direction line setup time before the first step, µs.
pub const DIR_SETUP_US: u64 = 5_000;

/// Shortest step pulse the driver accepts, µs.
pub const MIN_PULSE_WIDTH_US: f64 = 1.0;

/// Field-bus poll cadence, ms.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 80;

/// Position advance per tick when no motion hardware is present, mm.
pub const DEFAULT_TICK_STEP_MM: f64 = 5.0;

/// Control loop period, ms.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 20;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/blitz/machine.toml";
