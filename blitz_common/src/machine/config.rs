//! Machine configuration.
//!
//! One `machine.toml` describes the whole installation:
//! - `[shared]` - service name, log level
//! - `[machine]` - travel limits, default speed, start position, tick interval
//! - `[simulation]` - simulated carriage speed
//! - `[bus]` - RS485 Modbus link (optional)
//! - `[drive]` - servo driver serial link (optional)
//! - `[motion]` - step/direction and encoder wiring
//! - `[homing]` - homing distances and step sizes
//! - `[[signals]]` - overrides of the default signal map
//!
//! Every section has defaults, so an empty file yields a runnable
//! simulation setup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::{ConfigError, SharedConfig};
use crate::consts::{
    DEFAULT_MAX_CUT_LENGTH_MM, DEFAULT_MIN_DISTANCE_MM, DEFAULT_MM_PER_PULSE,
    DEFAULT_MOVE_SPEED_MM_S, DEFAULT_POLL_INTERVAL_MS, DEFAULT_SIM_SPEED_MM_S,
    DEFAULT_TICK_INTERVAL_MS, DEFAULT_TICK_STEP_MM, MODULE_WIDTH,
};
use crate::homing::HomingConfig;
use crate::io::signal::{SignalBinding, SignalKind, SignalMap};
use crate::machine::types::TravelLimits;

fn default_min_distance() -> f64 {
    DEFAULT_MIN_DISTANCE_MM
}

fn default_max_cut_length() -> f64 {
    DEFAULT_MAX_CUT_LENGTH_MM
}

fn default_move_speed() -> f64 {
    DEFAULT_MOVE_SPEED_MM_S
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_sim_speed() -> f64 {
    DEFAULT_SIM_SPEED_MM_S
}

fn default_baud() -> u32 {
    115_200
}

fn default_stop_bits() -> u8 {
    1
}

fn default_bus_timeout_ms() -> u64 {
    50
}

fn default_drive_timeout_ms() -> u64 {
    100
}

fn default_unit_a() -> u8 {
    1
}

fn default_unit_b() -> u8 {
    2
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_mm_per_pulse() -> f64 {
    DEFAULT_MM_PER_PULSE
}

fn default_pulse_pin() -> u8 {
    27
}

fn default_dir_pin() -> u8 {
    22
}

fn default_encoder_a() -> u8 {
    17
}

fn default_encoder_b() -> u8 {
    18
}

fn default_tick_step() -> f64 {
    DEFAULT_TICK_STEP_MM
}

fn default_snap_window() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Top-level configuration loaded from `machine.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MachineConfig {
    #[serde(default)]
    pub shared: SharedConfig,

    #[serde(default)]
    pub machine: AxisConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Absent section means no field bus.
    #[serde(default)]
    pub bus: Option<BusConfig>,

    /// Absent section means no servo driver link.
    #[serde(default)]
    pub drive: Option<DriveConfig>,

    #[serde(default)]
    pub motion: MotionConfig,

    #[serde(default)]
    pub homing: HomingConfig,

    #[serde(default)]
    pub signals: Vec<SignalBinding>,
}

/// `[machine]` - the linear axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Lower travel limit and machine zero, mm.
    #[serde(default = "default_min_distance")]
    pub min_distance_mm: f64,

    /// Upper travel limit, mm.
    #[serde(default = "default_max_cut_length")]
    pub max_cut_length_mm: f64,

    /// Speed used by `command_move`, mm/s.
    #[serde(default = "default_move_speed")]
    pub move_speed_mm_s: f64,

    /// Position assumed at startup. Defaults to `min_distance_mm`.
    #[serde(default)]
    pub initial_position_mm: Option<f64>,

    /// Control loop period.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            min_distance_mm: default_min_distance(),
            max_cut_length_mm: default_max_cut_length(),
            move_speed_mm_s: default_move_speed(),
            initial_position_mm: None,
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl AxisConfig {
    pub fn limits(&self) -> TravelLimits {
        TravelLimits::new(self.min_distance_mm, self.max_cut_length_mm)
    }

    /// Clamped start position.
    pub fn start_position(&self) -> f64 {
        self.limits()
            .clamp(self.initial_position_mm.unwrap_or(self.min_distance_mm))
    }
}

/// `[simulation]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_sim_speed")]
    pub speed_mm_s: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            speed_mm_s: default_sim_speed(),
        }
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    #[default]
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

/// `[bus]` - RS485 Modbus RTU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Serial device, e.g. `/dev/ttyUSB0`.
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    #[serde(default)]
    pub parity: Parity,

    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,

    /// Per-transaction read timeout.
    #[serde(default = "default_bus_timeout_ms")]
    pub timeout_ms: u64,

    /// Unit id of module A.
    #[serde(default = "default_unit_a")]
    pub unit_a: u8,

    /// Unit id of module B.
    #[serde(default = "default_unit_b")]
    pub unit_b: u8,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl BusConfig {
    /// Bus settings for `port` with every other field at its default.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: default_baud(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_bus_timeout_ms(),
            unit_a: default_unit_a(),
            unit_b: default_unit_b(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Reply handling of the drive link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveMode {
    /// Each command blocks for one reply line.
    #[default]
    Sync,
    /// A receive worker delivers every line to a callback.
    Async,
}

/// `[drive]` - servo driver serial link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveConfig {
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    #[serde(default = "default_drive_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub mode: DriveMode,

    /// Sent with `SPEED` after connecting.
    #[serde(default)]
    pub speed_mm_s: Option<f64>,

    /// Sent with `ACCEL` after connecting.
    #[serde(default)]
    pub accel_mm_s2: Option<f64>,
}

impl DriveConfig {
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: default_baud(),
            timeout_ms: default_drive_timeout_ms(),
            mode: DriveMode::default(),
            speed_mm_s: None,
            accel_mm_s2: None,
        }
    }
}

/// `[motion]` - step/direction output and quadrature encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Open the pulse generator in the real backend.
    #[serde(default = "default_true")]
    pub pulse_enabled: bool,

    /// Open the encoder reader in the real backend.
    #[serde(default = "default_true")]
    pub encoder_enabled: bool,

    #[serde(default = "default_mm_per_pulse")]
    pub mm_per_pulse: f64,

    /// Encoder resolution. Defaults to `mm_per_pulse`.
    #[serde(default)]
    pub encoder_mm_per_count: Option<f64>,

    #[serde(default = "default_pulse_pin")]
    pub pulse_pin: u8,

    #[serde(default = "default_dir_pin")]
    pub dir_pin: u8,

    /// Driven high at open to enable the drive.
    #[serde(default)]
    pub enable_pin: Option<u8>,

    #[serde(default = "default_encoder_a")]
    pub encoder_a_pin: u8,

    #[serde(default = "default_encoder_b")]
    pub encoder_b_pin: u8,

    /// Optional trapezoidal ramp for pulse moves, mm/s².
    #[serde(default)]
    pub accel_mm_s2: Option<f64>,

    /// Advance per tick of the fallback position model, mm.
    #[serde(default = "default_tick_step")]
    pub tick_step_mm: f64,

    /// Encoder is re-synced to the target when within this distance, mm.
    #[serde(default = "default_snap_window")]
    pub snap_window_mm: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pulse_enabled: true,
            encoder_enabled: true,
            mm_per_pulse: default_mm_per_pulse(),
            encoder_mm_per_count: None,
            pulse_pin: default_pulse_pin(),
            dir_pin: default_dir_pin(),
            enable_pin: None,
            encoder_a_pin: default_encoder_a(),
            encoder_b_pin: default_encoder_b(),
            accel_mm_s2: None,
            tick_step_mm: default_tick_step(),
            snap_window_mm: default_snap_window(),
        }
    }
}

impl MotionConfig {
    pub fn encoder_resolution(&self) -> f64 {
        self.encoder_mm_per_count.unwrap_or(self.mm_per_pulse)
    }
}

impl MachineConfig {
    /// Signal map with `[[signals]]` overrides applied.
    pub fn signal_map(&self) -> SignalMap {
        SignalMap::with_bindings(&self.signals)
    }

    /// Validate the machine configuration.
    ///
    /// # Validation Rules
    /// 1. `min_distance_mm` > 0 and < `max_cut_length_mm`
    /// 2. speeds and `tick_interval_ms` > 0
    /// 3. `mm_per_pulse` (and encoder resolution) > 0
    /// 4. bus unit ids distinct and non-zero
    /// 5. signal indices within the module width
    /// 6. signal names unique; an input name is not rebound as a coil
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        let m = &self.machine;
        if !(m.min_distance_mm > 0.0) {
            return Err(invalid(format!(
                "min_distance_mm must be positive, got {}",
                m.min_distance_mm
            )));
        }
        if !(m.min_distance_mm < m.max_cut_length_mm) {
            return Err(invalid(format!(
                "min_distance_mm ({}) must be below max_cut_length_mm ({})",
                m.min_distance_mm, m.max_cut_length_mm
            )));
        }
        if !(m.move_speed_mm_s > 0.0) || !(self.simulation.speed_mm_s > 0.0) {
            return Err(invalid("speeds must be positive".to_string()));
        }
        if m.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms must be greater than 0".to_string()));
        }

        let mo = &self.motion;
        if !(mo.mm_per_pulse > 0.0) || !(mo.encoder_resolution() > 0.0) {
            return Err(invalid(format!(
                "mm_per_pulse must be positive, got {}",
                mo.mm_per_pulse
            )));
        }
        if !(mo.tick_step_mm > 0.0) {
            return Err(invalid("tick_step_mm must be positive".to_string()));
        }

        if let Some(bus) = &self.bus {
            if bus.unit_a == 0 || bus.unit_b == 0 {
                return Err(invalid("bus unit ids must be non-zero".to_string()));
            }
            if bus.unit_a == bus.unit_b {
                return Err(invalid(format!(
                    "bus unit ids must differ (both {})",
                    bus.unit_a
                )));
            }
            if !(1..=2).contains(&bus.stop_bits) {
                return Err(invalid(format!("stop_bits must be 1 or 2, got {}", bus.stop_bits)));
            }
        }

        self.homing.validate().map_err(invalid)?;

        let mut names = HashSet::new();
        for s in &self.signals {
            if s.index >= MODULE_WIDTH {
                return Err(invalid(format!(
                    "signal '{}' index {} out of range (max {})",
                    s.name,
                    s.index,
                    MODULE_WIDTH - 1
                )));
            }
            if !names.insert(s.name.as_str()) {
                return Err(invalid(format!("Duplicate signal name: {}", s.name)));
            }
            if s.name == "emergency" && s.kind != SignalKind::Input {
                return Err(invalid("signal 'emergency' must be an input".to_string()));
            }
        }

        Ok(())
    }
}

fn invalid(msg: String) -> ConfigError {
    ConfigError::ValidationError(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;
    use crate::io::signal::Module;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_document_is_a_valid_simulation_setup() {
        let cfg = MachineConfig::parse("").unwrap();
        assert!(cfg.validate().is_ok());
        assert!(cfg.bus.is_none());
        assert!(cfg.drive.is_none());
        assert_eq!(cfg.machine.min_distance_mm, 250.0);
        assert_eq!(cfg.machine.max_cut_length_mm, 4000.0);
        assert_eq!(cfg.machine.start_position(), 250.0);
        assert_eq!(cfg.simulation.speed_mm_s, 2500.0);
        assert_eq!(cfg.motion.tick_step_mm, 5.0);
    }

    #[test]
    fn full_file_loads() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[shared]
service_name = "blitz-line-3"

[machine]
min_distance_mm = 300.0
initial_position_mm = 1500.0

[bus]
port = "/dev/ttyUSB0"
parity = "E"
unit_b = 5

[drive]
port = "/dev/ttyUSB1"
mode = "async"
speed_mm_s = 800.0

[motion]
mm_per_pulse = 0.1
enable_pin = 23

[homing]
step_interval_ms = 0

[[signals]]
name = "emergency"
module = "b"
kind = "input"
index = 0
"#
        )
        .unwrap();
        file.flush().unwrap();

        let cfg = MachineConfig::load(file.path()).unwrap();
        cfg.validate().unwrap();

        let bus = cfg.bus.as_ref().unwrap();
        assert_eq!(bus.parity, Parity::Even);
        assert_eq!(bus.unit_a, 1);
        assert_eq!(bus.unit_b, 5);
        assert_eq!(bus.baud, 115_200);
        assert_eq!(bus.poll_interval_ms, 80);

        let drive = cfg.drive.as_ref().unwrap();
        assert_eq!(drive.mode, DriveMode::Async);
        assert_eq!(drive.speed_mm_s, Some(800.0));

        assert_eq!(cfg.motion.enable_pin, Some(23));
        assert_eq!(cfg.motion.encoder_resolution(), 0.1);
        assert_eq!(cfg.machine.start_position(), 1500.0);
        assert_eq!(cfg.homing.step_interval_ms, 0);

        let addr = cfg.signal_map().resolve("emergency").unwrap();
        assert_eq!(addr.module, Module::B);
        assert_eq!(addr.index, 0);
    }

    #[test]
    fn inverted_limits_rejected() {
        let mut cfg = MachineConfig::default();
        cfg.machine.min_distance_mm = 5000.0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(m)) if m.contains("max_cut_length_mm")
        ));
    }

    #[test]
    fn zero_mm_per_pulse_rejected() {
        let mut cfg = MachineConfig::default();
        cfg.motion.mm_per_pulse = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_unit_ids_rejected() {
        let mut cfg = MachineConfig::default();
        let mut bus = BusConfig::for_port("/dev/ttyS0");
        bus.unit_b = bus.unit_a;
        cfg.bus = Some(bus);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn signal_index_out_of_range_rejected() {
        let mut cfg = MachineConfig::default();
        cfg.signals.push(SignalBinding {
            name: "brake".to_string(),
            module: Module::A,
            kind: SignalKind::Coil,
            index: 8,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_signal_rejected() {
        let mut cfg = MachineConfig::default();
        let binding = SignalBinding {
            name: "clutch".to_string(),
            module: Module::B,
            kind: SignalKind::Coil,
            index: 1,
        };
        cfg.signals.push(binding.clone());
        cfg.signals.push(binding);
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ValidationError(m)) if m.contains("Duplicate")
        ));
    }

    #[test]
    fn initial_position_is_clamped() {
        let mut axis = AxisConfig::default();
        axis.initial_position_mm = Some(10_000.0);
        assert_eq!(axis.start_position(), 4000.0);
    }
}
