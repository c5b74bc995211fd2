//! Machine configuration loading tests.
//!
//! Loads whole `machine.toml` documents from disk and checks defaults,
//! overrides and validation errors as a consumer of the crate sees them.

use blitz_common::config::{ConfigError, ConfigLoader, LogLevel};
use blitz_common::io::signal::{Module, SignalKind};
use blitz_common::machine::config::{DriveMode, MachineConfig, Parity};
use std::fs;
use tempfile::TempDir;

fn write(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("machine.toml");
    fs::write(&path, body).unwrap();
    path
}

#[test]
fn bench_installation_config() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        r#"
[shared]
log_level = "debug"
service_name = "blitz-bench"

[machine]
min_distance_mm = 250.0
max_cut_length_mm = 6500.0
move_speed_mm_s = 1200.0

[bus]
port = "/dev/ttyUSB0"
baud = 57600
parity = "O"
stop_bits = 2
poll_interval_ms = 40

[drive]
port = "/dev/ttyUSB1"
timeout_ms = 250

[motion]
mm_per_pulse = 0.05
encoder_mm_per_count = 0.0125
accel_mm_s2 = 4000.0
"#,
    );

    let cfg = MachineConfig::load(&path).unwrap();
    cfg.validate().unwrap();

    assert_eq!(cfg.shared.log_level, LogLevel::Debug);
    assert_eq!(cfg.machine.limits().max_mm, 6500.0);

    let bus = cfg.bus.unwrap();
    assert_eq!((bus.baud, bus.parity, bus.stop_bits), (57600, Parity::Odd, 2));
    assert_eq!(bus.poll_interval_ms, 40);

    let drive = cfg.drive.unwrap();
    assert_eq!(drive.mode, DriveMode::Sync);
    assert_eq!(drive.timeout_ms, 250);

    assert_eq!(cfg.motion.encoder_resolution(), 0.0125);
    assert_eq!(cfg.motion.accel_mm_s2, Some(4000.0));
    assert_eq!(cfg.motion.pulse_pin, 27);
    assert_eq!(cfg.motion.dir_pin, 22);
}

#[test]
fn rewired_signals_resolve() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        r#"
[[signals]]
name = "start_pressed"
module = "b"
kind = "input"
index = 4

[[signals]]
name = "aux_light"
module = "b"
kind = "coil"
index = 7
"#,
    );

    let cfg = MachineConfig::load(&path).unwrap();
    cfg.validate().unwrap();

    let map = cfg.signal_map();
    let start = map.resolve("start_pressed").unwrap();
    assert_eq!((start.module, start.kind, start.index), (Module::B, SignalKind::Input, 4));
    let aux = map.resolve("aux_light").unwrap();
    assert_eq!((aux.module, aux.kind, aux.index), (Module::B, SignalKind::Coil, 7));
    // untouched defaults survive
    assert_eq!(map.resolve("brake").unwrap().index, 0);
}

#[test]
fn emergency_bound_as_coil_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        r#"
[[signals]]
name = "emergency"
module = "a"
kind = "coil"
index = 7
"#,
    );
    let cfg = MachineConfig::load(&path).unwrap();
    assert!(matches!(cfg.validate(), Err(ConfigError::ValidationError(_))));
}

#[test]
fn bus_section_requires_port() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "[bus]\nbaud = 9600\n");
    assert!(matches!(
        MachineConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn unknown_parity_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "[bus]\nport = \"/dev/ttyS0\"\nparity = \"X\"\n");
    assert!(matches!(
        MachineConfig::load(&path),
        Err(ConfigError::ParseError(_))
    ));
}
