//! Homing steps on the real carriage.

use blitz_common::io::signal::Signal;
use blitz_common::machine::error::MachineError;
use blitz_common::machine::interlock::Interlock;
use blitz_common::machine::types::MotionCommand;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::machine::RealShared;
use crate::homing::HomingAxis;

/// Longest wait for a single homing step.
const STEP_TIMEOUT: Duration = Duration::from_secs(10);

const POLL: Duration = Duration::from_millis(2);

/// Query period of the drive while a step runs.
const DRIVE_POLL: Duration = Duration::from_millis(10);

/// [`HomingAxis`] backed by the pulse generator, the drive link or, with
/// neither present, the position model.
pub(super) struct RealAxis {
    shared: Arc<RealShared>,
}

impl RealAxis {
    pub(super) fn new(shared: Arc<RealShared>) -> Self {
        Self { shared }
    }

    fn set_position(&self, mm: f64) {
        let mut m = self.shared.motion.lock();
        m.position_mm = self.shared.limits.clamp(mm);
        m.target_mm = Some(m.position_mm);
    }

    fn emergency_stop(&self) -> MachineError {
        MachineError::Interlock(Interlock::EMERGENCY)
    }

    fn pulse_step(&self, target_mm: f64) -> Result<(), MachineError> {
        let s = &self.shared;
        let Some(pulse) = s.pulse.as_ref() else {
            return Ok(());
        };
        let current = self.position();
        let command = MotionCommand::new(target_mm, s.homing_speed_mm_s);
        if !pulse.submit(&command, current) {
            return Err(MachineError::ConcurrentMotion);
        }

        let deadline = Instant::now() + STEP_TIMEOUT;
        while pulse.is_moving() {
            if s.interlocks.emergency() {
                pulse.stop(true, Duration::from_secs(1));
                self.set_position(current + pulse.travelled_mm());
                return Err(self.emergency_stop());
            }
            if Instant::now() >= deadline {
                pulse.stop(true, Duration::from_secs(1));
                return Err(MachineError::Protocol("homing step timed out".to_string()));
            }
            thread::sleep(POLL);
        }

        if let Some(encoder) = s.encoder.as_ref() {
            encoder.set_position(target_mm);
        }
        self.set_position(target_mm);
        Ok(())
    }

    fn drive_step(&self, target_mm: f64) -> Result<(), MachineError> {
        let s = &self.shared;
        let Some(drive) = s.drive.as_ref() else {
            return Ok(());
        };
        let command = MotionCommand::new(target_mm, s.homing_speed_mm_s);
        if !drive.lock().submit(&command) {
            return Err(MachineError::Transport("drive rejected homing step".to_string()));
        }

        let deadline = Instant::now() + STEP_TIMEOUT;
        loop {
            if s.interlocks.emergency() {
                drive.lock().stop();
                return Err(self.emergency_stop());
            }
            let (moving, connected) = {
                let mut drive = drive.lock();
                (drive.poll_motion(), drive.is_connected())
            };
            if !connected {
                return Err(MachineError::Transport("drive link lost during homing".to_string()));
            }
            if !moving {
                break;
            }
            if Instant::now() >= deadline {
                drive.lock().stop();
                return Err(MachineError::Protocol("homing step timed out".to_string()));
            }
            thread::sleep(DRIVE_POLL);
        }
        self.set_position(target_mm);
        Ok(())
    }
}

impl HomingAxis for RealAxis {
    fn position(&self) -> f64 {
        let m = self.shared.motion.lock();
        self.shared.live_position(&m)
    }

    fn step_to(&mut self, target_mm: f64) -> Result<(), MachineError> {
        let s = &self.shared;
        if s.pulse.is_some() {
            self.pulse_step(target_mm)
        } else if s.drive.as_ref().is_some_and(|d| d.lock().is_connected()) {
            self.drive_step(target_mm)
        } else {
            self.set_position(target_mm);
            Ok(())
        }
    }

    fn emergency_active(&self) -> bool {
        self.shared.interlocks.emergency()
    }

    fn is_homed(&self) -> bool {
        self.shared.motion.lock().homed
    }

    fn prepare(&mut self) {
        self.shared.write_coil(Signal::Brake, false);
    }

    fn abort(&mut self) {
        self.shared.lock_brake();
        self.shared.update_cut_enable();
    }

    fn complete(&mut self, home_mm: f64) {
        let s = &self.shared;
        {
            let mut m = s.motion.lock();
            m.position_mm = home_mm;
            m.target_mm = Some(home_mm);
            m.homed = true;
        }
        if let Some(encoder) = s.encoder.as_ref() {
            encoder.set_position(home_mm);
        }
        s.write_coil(Signal::Brake, false);
        s.write_coil(Signal::Clutch, true);
        s.update_cut_enable();
        debug!("Reference set at {home_mm:.1} mm");
    }
}
