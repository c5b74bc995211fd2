//! Real-hardware backend.
//!
//! Composes the field bus gateway, the drive link and the step/direction
//! hardware behind `MachineIo`. Motion fields (position, target, moving)
//! sit behind one mutex shared with the homing worker; coil states are
//! never cached here, they are read back from the gateway mirror.
//!
//! Lock order: motion, then drive, then gateway.

use blitz_common::homing::{HomingConfig, HomingOutcome};
use blitz_common::io::signal::Signal;
use blitz_common::machine::config::{DriveMode, MachineConfig};
use blitz_common::machine::error::MachineError;
use blitz_common::machine::interlock::{Interlock, InterlockState};
use blitz_common::machine::io::{HomingCallback, MachineIo};
use blitz_common::machine::types::{
    HeadAngles, MachineState, MotionCommand, TravelLimits, cut_enable,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::axis::RealAxis;
use crate::drive::DriveLink;
use crate::fieldbus::IoGateway;
use crate::homing::{HomingReport, HomingSequencer};
use crate::motion::{EncoderReader, PulseGenerator};

/// Registry name of this backend.
pub const BACKEND_NAME: &str = "real";

/// Which component is executing the current move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MotionSource {
    Pulse,
    Drive,
    TickModel,
}

#[derive(Debug)]
pub(super) struct MotionFields {
    pub(super) position_mm: f64,
    pub(super) target_mm: Option<f64>,
    pub(super) moving: bool,
    pub(super) source: Option<MotionSource>,
    /// Position at the start of a pulse move.
    pub(super) origin_mm: f64,
    pub(super) homed: bool,
    pub(super) homing_active: bool,
    pub(super) angles: HeadAngles,
}

/// Hardware links handed to [`RealMachine::with_parts`].
pub struct RealParts {
    pub gateway: IoGateway,
    pub drive: Option<DriveLink>,
    pub pulse: Option<PulseGenerator>,
    pub encoder: Option<EncoderReader>,
    pub interlocks: Arc<InterlockState>,
}

impl RealParts {
    /// Open every configured link.
    ///
    /// The field bus is mandatory: a missing `[bus]` section or a port that
    /// cannot be opened is an error. Drive, pulse generator and encoder are
    /// optional and left out when they cannot be opened.
    pub fn open(config: &MachineConfig) -> Result<Self, MachineError> {
        let bus = config
            .bus
            .as_ref()
            .ok_or_else(|| MachineError::Config("real backend needs a [bus] section".to_string()))?;

        let gateway = IoGateway::new(config.signal_map());
        if !gateway.connect(bus) {
            return Err(MachineError::Transport(format!(
                "cannot open field bus on {}",
                bus.port
            )));
        }

        let interlocks = Arc::new(InterlockState::new());
        let drive = config.drive.as_ref().and_then(|settings| {
            DriveLink::connect(settings, Arc::clone(&interlocks))
                .map_err(|e| warn!("Drive link unavailable: {e}"))
                .ok()
        });

        let motion = &config.motion;
        let pulse = motion
            .pulse_enabled
            .then(|| PulseGenerator::open(motion))
            .filter(PulseGenerator::is_connected);
        let encoder = motion
            .encoder_enabled
            .then(|| EncoderReader::open(motion))
            .filter(EncoderReader::is_connected);

        Ok(Self {
            gateway,
            drive,
            pulse,
            encoder,
            interlocks,
        })
    }
}

/// State shared between the control thread and the homing worker.
pub(super) struct RealShared {
    pub(super) limits: TravelLimits,
    pub(super) move_speed_mm_s: f64,
    pub(super) accel_mm_s2: Option<f64>,
    pub(super) tick_step_mm: f64,
    pub(super) snap_window_mm: f64,
    pub(super) homing_speed_mm_s: f64,
    pub(super) gateway: IoGateway,
    pub(super) drive: Option<Mutex<DriveLink>>,
    pub(super) pulse: Option<PulseGenerator>,
    pub(super) encoder: Option<EncoderReader>,
    pub(super) interlocks: Arc<InterlockState>,
    pub(super) motion: Mutex<MotionFields>,
}

impl RealShared {
    /// Best available position: encoder, then the executor's own feedback
    /// (pulse count or drive-reported position), then the model.
    pub(super) fn live_position(&self, m: &MotionFields) -> f64 {
        if let Some(mm) = self.encoder.as_ref().and_then(EncoderReader::get_position_mm) {
            return self.limits.clamp(mm);
        }
        match m.source {
            Some(MotionSource::Pulse) => match self.pulse.as_ref() {
                Some(pulse) => self.limits.clamp(m.origin_mm + pulse.travelled_mm()),
                None => m.position_mm,
            },
            Some(MotionSource::Drive) => self
                .drive
                .as_ref()
                .and_then(|d| d.lock().status().position_mm)
                .map_or(m.position_mm, |mm| self.limits.clamp(mm)),
            Some(MotionSource::TickModel) | None => m.position_mm,
        }
    }

    /// Request for a move to `target_mm` at the configured speed.
    pub(super) fn command_to(&self, target_mm: f64, speed_mm_s: f64) -> MotionCommand {
        MotionCommand {
            accel_mm_s2: self.accel_mm_s2,
            ..MotionCommand::new(target_mm, speed_mm_s)
        }
    }

    fn drive_connected(&self) -> bool {
        self.drive.as_ref().is_some_and(|d| d.lock().is_connected())
    }

    pub(super) fn write_coil(&self, signal: Signal, value: bool) -> bool {
        let ok = self.gateway.write_signal(&signal, value);
        if !ok {
            debug!("Coil {signal} <- {value} not confirmed");
        }
        ok
    }

    fn write_coils(&self, writes: &[(Signal, bool)]) -> bool {
        let ok = self.gateway.write_signals(writes);
        if !ok {
            debug!("Coils {writes:?} not confirmed");
        }
        ok
    }

    pub(super) fn lock_brake(&self) -> bool {
        self.write_coil(Signal::Brake, true)
    }

    /// Stop the current move where it is. Returns true if something moved.
    fn halt(&self) -> bool {
        let mut m = self.motion.lock();
        if !m.moving {
            return false;
        }
        match m.source {
            Some(MotionSource::Pulse) => {
                if let Some(pulse) = self.pulse.as_ref() {
                    pulse.stop(false, Duration::ZERO);
                }
            }
            Some(MotionSource::Drive) => {
                if let Some(drive) = self.drive.as_ref() {
                    drive.lock().stop();
                }
            }
            Some(MotionSource::TickModel) | None => {}
        }
        let pos = self.live_position(&m);
        m.position_mm = pos;
        m.target_mm = Some(pos);
        m.moving = false;
        m.source = None;
        info!("Motion halted at {pos:.1} mm");
        true
    }

    /// Advance the current move. Returns true when it ended.
    fn advance(&self) -> bool {
        let mut m = self.motion.lock();
        if !m.moving {
            return false;
        }
        let Some(target) = m.target_mm else {
            m.moving = false;
            return false;
        };

        let end = match m.source {
            Some(MotionSource::Pulse) => self.advance_pulse(&mut m, target),
            Some(MotionSource::Drive) => self.advance_drive(&mut m, target),
            Some(MotionSource::TickModel) | None => {
                let diff = target - m.position_mm;
                if diff.abs() <= self.tick_step_mm {
                    Some(target)
                } else {
                    m.position_mm += diff.signum() * self.tick_step_mm;
                    None
                }
            }
        };

        let Some(end) = end else {
            return false;
        };
        m.position_mm = end;
        m.target_mm = Some(end);
        m.moving = false;
        m.source = None;
        debug!("Move ended at {end:.1} mm");
        true
    }

    /// Final position once the pulse train is done. Snaps to the target.
    fn advance_pulse(&self, m: &mut MotionFields, target: f64) -> Option<f64> {
        let Some(pulse) = self.pulse.as_ref() else {
            return Some(m.position_mm);
        };
        let pos = self.live_position(m);
        m.position_mm = pos;
        if pulse.is_moving() {
            return None;
        }
        let window = self.snap_window_mm.max(pulse.mm_per_pulse());
        let error = target - pos;
        if error.abs() > window {
            warn!("Pulse move ended {error:+.2} mm from target");
        }
        if let Some(encoder) = self.encoder.as_ref() {
            encoder.set_position(target);
        }
        Some(target)
    }

    /// Final position once the drive reports idle. A lost link ends the
    /// move where it is.
    fn advance_drive(&self, m: &mut MotionFields, target: f64) -> Option<f64> {
        let Some(drive) = self.drive.as_ref() else {
            return Some(m.position_mm);
        };
        m.position_mm = self.live_position(m);
        let mut drive = drive.lock();
        if !drive.is_connected() {
            warn!("Drive link lost during move");
            return Some(m.position_mm);
        }
        (!drive.poll_motion()).then_some(target)
    }

    /// Write the cut-enable coil when the interlock condition changed.
    pub(super) fn update_cut_enable(&self) {
        let cut = {
            let m = self.motion.lock();
            let flags = self.interlocks.get();
            cut_enable(
                m.homed,
                flags.contains(Interlock::EMERGENCY),
                flags.contains(Interlock::ALARM),
                m.moving,
            )
        };
        if self.gateway.is_online() && self.gateway.signal(&Signal::CutEnable) != cut {
            self.write_coil(Signal::CutEnable, cut);
        }
    }
}

/// The cutting machine on real hardware.
pub struct RealMachine {
    shared: Arc<RealShared>,
    homing_config: HomingConfig,
    last_tick: Instant,
    homing: Option<JoinHandle<HomingReport>>,
    closed: bool,
}

impl RealMachine {
    /// Open all links and build the backend.
    pub fn connect(config: &MachineConfig) -> Result<Self, MachineError> {
        let parts = RealParts::open(config)?;
        Ok(Self::with_parts(config, parts))
    }

    /// Build on already-open links.
    pub fn with_parts(config: &MachineConfig, parts: RealParts) -> Self {
        let start = config.machine.start_position();
        if let Some(encoder) = parts.encoder.as_ref() {
            encoder.set_position(start);
        }
        info!(
            "Real machine: bus {}, drive {}, pulse {}, encoder {}",
            if parts.gateway.is_online() { "online" } else { "offline" },
            link_label(parts.drive.as_ref().map(DriveLink::is_connected)),
            link_label(parts.pulse.as_ref().map(PulseGenerator::is_connected)),
            link_label(parts.encoder.as_ref().map(EncoderReader::is_connected)),
        );

        let shared = RealShared {
            limits: config.machine.limits(),
            move_speed_mm_s: config.machine.move_speed_mm_s,
            accel_mm_s2: config.motion.accel_mm_s2,
            tick_step_mm: config.motion.tick_step_mm,
            snap_window_mm: config.motion.snap_window_mm,
            homing_speed_mm_s: config.homing.speed_mm_s,
            gateway: parts.gateway,
            drive: parts.drive.map(Mutex::new),
            pulse: parts.pulse,
            encoder: parts.encoder,
            interlocks: parts.interlocks,
            motion: Mutex::new(MotionFields {
                position_mm: start,
                target_mm: None,
                moving: false,
                source: None,
                origin_mm: start,
                homed: false,
                homing_active: false,
                angles: HeadAngles::default(),
            }),
        };

        Self {
            shared: Arc::new(shared),
            homing_config: config.homing.clone(),
            last_tick: Instant::now(),
            homing: None,
            closed: false,
        }
    }

    pub fn interlocks(&self) -> &Arc<InterlockState> {
        &self.shared.interlocks
    }

    pub fn gateway(&self) -> &IoGateway {
        &self.shared.gateway
    }

    /// Wait for a running homing sequence and return its report.
    pub fn wait_homing(&mut self) -> Option<HomingReport> {
        self.homing.take().and_then(|h| h.join().ok())
    }

    fn start_move(&self, m: &mut MotionFields, target: f64) -> Option<MotionSource> {
        let s = &self.shared;
        let current = s.live_position(m);
        let command = s.command_to(target, s.move_speed_mm_s);

        if let Some(pulse) = s.pulse.as_ref() {
            return pulse.submit(&command, current).then(|| {
                m.origin_mm = current;
                MotionSource::Pulse
            });
        }
        if s.drive_connected() {
            let accepted = s
                .drive
                .as_ref()
                .is_some_and(|d| d.lock().submit(&command));
            return accepted.then_some(MotionSource::Drive);
        }
        Some(MotionSource::TickModel)
    }
}

fn link_label(state: Option<bool>) -> &'static str {
    match state {
        Some(true) => "connected",
        Some(false) => "disconnected",
        None => "absent",
    }
}

impl MachineIo for RealMachine {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn get_position(&self) -> Option<f64> {
        let m = self.shared.motion.lock();
        Some(self.shared.live_position(&m))
    }

    fn is_positioning_active(&self) -> bool {
        self.shared.motion.lock().moving
    }

    fn get_input(&self, name: &str) -> bool {
        self.shared.gateway.read_signal(name)
    }

    fn command_move(&mut self, length_mm: f64, angles: HeadAngles) -> bool {
        let s = Arc::clone(&self.shared);
        if s.interlocks.blocks_motion() {
            debug!("Move rejected: interlock {:?}", s.interlocks.get());
            return false;
        }
        let mut m = s.motion.lock();
        if m.moving || m.homing_active {
            debug!("Move rejected: {}", MachineError::ConcurrentMotion);
            return false;
        }

        let target = s.limits.clamp(length_mm);
        m.angles = angles;
        m.target_mm = Some(target);
        if target == s.live_position(&m) {
            m.position_mm = target;
            return true;
        }

        s.write_coil(Signal::Brake, false);
        let Some(source) = self.start_move(&mut m, target) else {
            warn!("Move to {target:.1} mm not accepted");
            m.target_mm = Some(m.position_mm);
            drop(m);
            s.lock_brake();
            return false;
        };
        m.moving = true;
        m.source = Some(source);
        info!(
            "Move {:.1} -> {:.1} mm via {:?} (sx {:.1}, dx {:.1})",
            m.position_mm, target, source, angles.sx, angles.dx
        );
        true
    }

    fn command_stop(&mut self) -> bool {
        self.shared.halt();
        self.shared.lock_brake()
    }

    fn command_lock_brake(&mut self) -> bool {
        self.shared.lock_brake()
    }

    fn command_release_brake(&mut self) -> bool {
        self.shared.write_coil(Signal::Brake, false)
    }

    fn command_set_clutch(&mut self, engaged: bool) -> bool {
        self.shared.write_coil(Signal::Clutch, engaged)
    }

    fn command_set_head_angles(&mut self, angles: HeadAngles) -> bool {
        self.shared.motion.lock().angles = angles;
        true
    }

    fn command_set_presser_locks(&mut self, left: bool, right: bool) -> bool {
        self.shared.write_coils(&[
            (Signal::PresserLeft, left),
            (Signal::PresserRight, right),
        ])
    }

    fn command_set_blade_inhibit(&mut self, left: Option<bool>, right: Option<bool>) -> bool {
        let writes: Vec<(Signal, bool)> = [
            left.map(|v| (Signal::BladeInhibitLeft, v)),
            right.map(|v| (Signal::BladeInhibitRight, v)),
        ]
        .into_iter()
        .flatten()
        .collect();
        self.shared.write_coils(&writes)
    }

    fn do_homing(&mut self, on_done: HomingCallback) {
        {
            let mut m = self.shared.motion.lock();
            if m.moving || m.homing_active {
                drop(m);
                let busy = HomingOutcome::Busy;
                on_done(busy.success(), busy.message().to_string());
                return;
            }
            m.homing_active = true;
        }
        if let Some(previous) = self.homing.take() {
            let _ = previous.join();
        }

        let shared = Arc::clone(&self.shared);
        let callback: HomingCallback = Box::new(move |ok, msg| {
            shared.motion.lock().homing_active = false;
            on_done(ok, msg);
        });
        let axis = RealAxis::new(Arc::clone(&self.shared));
        let sequencer =
            HomingSequencer::new(axis, self.shared.limits, self.homing_config.clone());
        self.homing = sequencer.spawn(callback);
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick);
        self.last_tick = now;
        let s = &self.shared;

        if s.gateway.poll_if_due(dt) {
            if let Some(drive) = s.drive.as_ref() {
                let mut drive = drive.lock();
                if drive.mode() == DriveMode::Sync && drive.is_connected() {
                    drive.read_alarm();
                }
            }
        }

        if s.gateway.signal(&Signal::Emergency) && s.interlocks.raise(Interlock::EMERGENCY) {
            warn!("Emergency input asserted");
            s.halt();
            s.lock_brake();
        }
        if s.interlocks.blocks_motion() && s.halt() {
            s.lock_brake();
        }

        if s.advance() {
            s.lock_brake();
        }
        s.update_cut_enable();
    }

    fn get_state(&self) -> MachineState {
        let s = &self.shared;
        let m = s.motion.lock();
        let flags = s.interlocks.get();
        let emergency = flags.contains(Interlock::EMERGENCY);
        let alarm = flags.contains(Interlock::ALARM);
        let coil = |signal: Signal| s.gateway.signal(&signal);
        MachineState {
            position_mm: s.live_position(&m),
            target_mm: m.target_mm,
            moving: m.moving,
            homed: m.homed,
            emergency,
            alarm,
            brake: coil(Signal::Brake),
            clutch: coil(Signal::Clutch),
            presser_left_locked: coil(Signal::PresserLeft),
            presser_right_locked: coil(Signal::PresserRight),
            blade_inhibit_left: coil(Signal::BladeInhibitLeft),
            blade_inhibit_right: coil(Signal::BladeInhibitRight),
            head_angle_sx: m.angles.sx,
            head_angle_dx: m.angles.dx,
            cut_enabled: cut_enable(m.homed, emergency, alarm, m.moving),
            bus: s.gateway.state(),
            backend: BACKEND_NAME.to_string(),
        }
    }

    fn reset_emergency(&mut self) -> bool {
        let s = &self.shared;
        if !s.gateway.is_online() {
            warn!("Emergency reset refused: field bus offline");
            return false;
        }
        if s.gateway.signal(&Signal::Emergency) {
            warn!("Emergency reset refused: input still asserted");
            return false;
        }
        s.interlocks.clear(Interlock::EMERGENCY);
        info!("Emergency reset");
        true
    }

    fn clear_alarm(&mut self) -> bool {
        let s = &self.shared;
        match s.drive.as_ref() {
            Some(drive) => drive.lock().clear_alarm(),
            None => {
                s.interlocks.clear(Interlock::ALARM);
                true
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let s = &self.shared;
        s.halt();
        if let Some(pulse) = s.pulse.as_ref() {
            pulse.close();
        }
        if let Some(encoder) = s.encoder.as_ref() {
            encoder.close();
        }
        if let Some(drive) = s.drive.as_ref() {
            drive.lock().close();
        }
        s.gateway.close();
        if let Some(handle) = self.homing.take() {
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
        info!("Real machine closed");
    }
}

impl Drop for RealMachine {
    fn drop(&mut self) {
        self.close();
    }
}
