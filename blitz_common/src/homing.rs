//! Homing types.
//!
//! Defines `HomingPhase`, `HomingOutcome` and `HomingConfig`. The sequencer
//! itself lives in the HAL crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Homing state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HomingPhase {
    /// Not started.
    #[default]
    Idle,
    /// Coarse steps toward `min_distance + sensor_offset`.
    ApproachSensor,
    /// Retreat by `backoff` (clamped to the upper limit).
    Backoff,
    /// Fine steps down to `min_distance`.
    PreciseReturn,
    /// Reference established.
    Homed,
    /// Emergency seen during the sequence.
    Aborted,
}

impl fmt::Display for HomingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::ApproachSensor => "approach_sensor",
            Self::Backoff => "backoff",
            Self::PreciseReturn => "precise_return",
            Self::Homed => "homed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Final result of a homing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingOutcome {
    /// Sequence ran to completion.
    Homed,
    /// Machine was already homed; nothing moved.
    AlreadyHomed,
    /// Emergency active at entry or raised during the sequence.
    Emergency,
    /// Another motion or homing owns the axis.
    Busy,
    /// A positioning step could not be executed.
    Failed,
}

impl HomingOutcome {
    pub const fn success(&self) -> bool {
        matches!(self, Self::Homed | Self::AlreadyHomed)
    }

    /// Message reported through the completion callback.
    pub const fn message(&self) -> &'static str {
        match self {
            Self::Homed => "HOMING OK",
            Self::AlreadyHomed => "ALREADY HOMED",
            Self::Emergency => "EMERGENCY",
            Self::Busy => "BUSY",
            Self::Failed => "HOMING FAILED",
        }
    }
}

fn default_sensor_offset() -> f64 {
    5.0
}

fn default_backoff() -> f64 {
    10.0
}

fn default_coarse_step() -> f64 {
    50.0
}

fn default_fine_step() -> f64 {
    1.0
}

fn default_step_interval_ms() -> u64 {
    20
}

fn default_homing_speed() -> f64 {
    500.0
}

/// Homing parameters (`[homing]` section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomingConfig {
    /// Approach stops this far above `min_distance`, mm.
    #[serde(default = "default_sensor_offset")]
    pub sensor_offset_mm: f64,

    /// Retreat distance after the approach, mm.
    #[serde(default = "default_backoff")]
    pub backoff_mm: f64,

    /// Step size while approaching, mm.
    #[serde(default = "default_coarse_step")]
    pub coarse_step_mm: f64,

    /// Step size of the precise return, mm.
    #[serde(default = "default_fine_step")]
    pub fine_step_mm: f64,

    /// Pause between steps. Bounds abort latency.
    #[serde(default = "default_step_interval_ms")]
    pub step_interval_ms: u64,

    /// Speed of each step when a pulse generator executes it, mm/s.
    #[serde(default = "default_homing_speed")]
    pub speed_mm_s: f64,
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            sensor_offset_mm: default_sensor_offset(),
            backoff_mm: default_backoff(),
            coarse_step_mm: default_coarse_step(),
            fine_step_mm: default_fine_step(),
            step_interval_ms: default_step_interval_ms(),
            speed_mm_s: default_homing_speed(),
        }
    }
}

impl HomingConfig {
    /// Sanity check of step sizes and distances.
    pub fn validate(&self) -> Result<(), String> {
        if self.coarse_step_mm <= 0.0 || self.fine_step_mm <= 0.0 {
            return Err("homing step sizes must be positive".to_string());
        }
        if self.sensor_offset_mm < 0.0 || self.backoff_mm < 0.0 {
            return Err("homing offsets must not be negative".to_string());
        }
        if self.speed_mm_s <= 0.0 {
            return Err("homing speed must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names() {
        assert_eq!(HomingPhase::default(), HomingPhase::Idle);
        assert_eq!(HomingPhase::PreciseReturn.to_string(), "precise_return");
        assert_eq!(HomingPhase::Aborted.to_string(), "aborted");
    }

    #[test]
    fn outcome_messages() {
        assert_eq!(HomingOutcome::Homed.message(), "HOMING OK");
        assert_eq!(HomingOutcome::AlreadyHomed.message(), "ALREADY HOMED");
        assert_eq!(HomingOutcome::Emergency.message(), "EMERGENCY");
        assert!(HomingOutcome::AlreadyHomed.success());
        assert!(!HomingOutcome::Emergency.success());
    }

    #[test]
    fn config_defaults_from_empty_table() {
        let cfg: HomingConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, HomingConfig::default());
        assert_eq!(cfg.sensor_offset_mm, 5.0);
        assert_eq!(cfg.backoff_mm, 10.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_step_is_invalid() {
        let cfg = HomingConfig {
            fine_step_mm: 0.0,
            ..HomingConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
