//! Command and snapshot types exchanged across the `MachineIo` surface.

use serde::{Deserialize, Serialize};

use crate::consts::MODULE_WIDTH;
use crate::io::signal::{Module, SignalAddress, SignalKind};

/// Head angle setpoints, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadAngles {
    /// Left head.
    pub sx: f64,
    /// Right head.
    pub dx: f64,
}

impl HeadAngles {
    pub const fn new(sx: f64, dx: f64) -> Self {
        Self { sx, dx }
    }
}

/// One positioning request. Never queued; handed to whichever executor
/// (pulse generator or drive link) runs the move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionCommand {
    pub target_mm: f64,
    pub speed_mm_s: f64,
    pub accel_mm_s2: Option<f64>,
}

impl MotionCommand {
    pub fn new(target_mm: f64, speed_mm_s: f64) -> Self {
        Self {
            target_mm,
            speed_mm_s,
            accel_mm_s2: None,
        }
    }
}

/// Travel range of the linear axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TravelLimits {
    pub min_mm: f64,
    pub max_mm: f64,
}

impl TravelLimits {
    pub const fn new(min_mm: f64, max_mm: f64) -> Self {
        Self { min_mm, max_mm }
    }

    /// Clamp a position into range. NaN maps to the lower limit.
    #[inline]
    pub fn clamp(&self, mm: f64) -> f64 {
        if mm.is_nan() {
            return self.min_mm;
        }
        mm.clamp(self.min_mm, self.max_mm)
    }

    #[inline]
    pub fn contains(&self, mm: f64) -> bool {
        mm >= self.min_mm && mm <= self.max_mm
    }
}

/// Mirror of both field-bus modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusState {
    pub coils_a: [bool; MODULE_WIDTH],
    pub coils_b: [bool; MODULE_WIDTH],
    pub inputs_a: [bool; MODULE_WIDTH],
    pub inputs_b: [bool; MODULE_WIDTH],
    /// False after any failed transaction until the next fully good poll.
    pub online: bool,
}

impl BusState {
    pub fn coils(&self, module: Module) -> &[bool; MODULE_WIDTH] {
        match module {
            Module::A => &self.coils_a,
            Module::B => &self.coils_b,
        }
    }

    pub fn coils_mut(&mut self, module: Module) -> &mut [bool; MODULE_WIDTH] {
        match module {
            Module::A => &mut self.coils_a,
            Module::B => &mut self.coils_b,
        }
    }

    pub fn inputs(&self, module: Module) -> &[bool; MODULE_WIDTH] {
        match module {
            Module::A => &self.inputs_a,
            Module::B => &self.inputs_b,
        }
    }

    pub fn inputs_mut(&mut self, module: Module) -> &mut [bool; MODULE_WIDTH] {
        match module {
            Module::A => &mut self.inputs_a,
            Module::B => &mut self.inputs_b,
        }
    }

    /// Read the bit at `addr`. Out-of-range indices read as `false`.
    pub fn read(&self, addr: SignalAddress) -> bool {
        let bank = match addr.kind {
            SignalKind::Coil => self.coils(addr.module),
            SignalKind::Input => self.inputs(addr.module),
        };
        bank.get(addr.index).copied().unwrap_or(false)
    }

    /// Set the bit at `addr`. Out-of-range indices are ignored.
    pub fn write(&mut self, addr: SignalAddress, value: bool) {
        let bank = match addr.kind {
            SignalKind::Coil => self.coils_mut(addr.module),
            SignalKind::Input => self.inputs_mut(addr.module),
        };
        if let Some(bit) = bank.get_mut(addr.index) {
            *bit = value;
        }
    }
}

/// Read-only snapshot returned by `MachineIo::get_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub position_mm: f64,
    pub target_mm: Option<f64>,
    pub moving: bool,
    pub homed: bool,
    pub emergency: bool,
    pub alarm: bool,
    pub brake: bool,
    pub clutch: bool,
    pub presser_left_locked: bool,
    pub presser_right_locked: bool,
    pub blade_inhibit_left: bool,
    pub blade_inhibit_right: bool,
    pub head_angle_sx: f64,
    pub head_angle_dx: f64,
    pub cut_enabled: bool,
    pub bus: BusState,
    pub backend: String,
}

/// Interlock condition for the cut-enable output.
#[inline]
pub fn cut_enable(homed: bool, emergency: bool, alarm: bool, moving: bool) -> bool {
    homed && !emergency && !alarm && !moving
}
