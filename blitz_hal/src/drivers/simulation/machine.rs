//! Simulation backend.
//!
//! The `SimulationMachine` implements `MachineIo` in software: the carriage
//! moves at a constant speed per elapsed time, snaps on arrival and locks
//! the brake; button and blade inputs are synthesized through the `sim_*`
//! hooks. The bus snapshot is rebuilt from the signal map so consumers see
//! the same coil/input layout as on the real machine.

use blitz_common::homing::{HomingConfig, HomingOutcome};
use blitz_common::io::signal::{Signal, SignalMap};
use blitz_common::machine::config::MachineConfig;
use blitz_common::machine::error::MachineError;
use blitz_common::machine::interlock::{Interlock, InterlockState};
use blitz_common::machine::io::{HomingCallback, MachineIo};
use blitz_common::machine::types::{BusState, HeadAngles, MachineState, TravelLimits, cut_enable};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::homing::{HomingAxis, HomingReport, HomingSequencer};

/// Registry name of this backend.
pub const BACKEND_NAME: &str = "simulation";

/// Shortest step applied by `tick()`.
const MIN_TICK: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, Default)]
struct SimInputs {
    blade_pulse: bool,
    start_pressed: bool,
    dx_blade_out: bool,
    emergency: bool,
}

#[derive(Debug)]
struct SimCore {
    position_mm: f64,
    target_mm: Option<f64>,
    moving: bool,
    homed: bool,
    homing_active: bool,
    brake: bool,
    clutch: bool,
    presser_left: bool,
    presser_right: bool,
    blade_inhibit_left: bool,
    blade_inhibit_right: bool,
    angles: HeadAngles,
    inputs: SimInputs,
}

impl SimCore {
    /// Stop where we are and lock the brake.
    fn halt(&mut self) {
        self.moving = false;
        self.target_mm = Some(self.position_mm);
        self.brake = true;
    }

    fn cut_enabled(&self, flags: Interlock) -> bool {
        cut_enable(
            self.homed,
            flags.contains(Interlock::EMERGENCY),
            flags.contains(Interlock::ALARM),
            self.moving,
        )
    }

    fn signal(&self, signal: &Signal, flags: Interlock) -> bool {
        match signal {
            Signal::Brake => self.brake,
            Signal::Clutch => self.clutch,
            Signal::PresserLeft => self.presser_left,
            Signal::PresserRight => self.presser_right,
            Signal::BladeInhibitLeft => self.blade_inhibit_left,
            Signal::BladeInhibitRight => self.blade_inhibit_right,
            Signal::CutEnable => self.cut_enabled(flags),
            Signal::StartPressed => self.inputs.start_pressed,
            Signal::Emergency => self.inputs.emergency,
            Signal::DxBladeOut => self.inputs.dx_blade_out,
            Signal::BladePulse => self.inputs.blade_pulse,
            Signal::Custom(_) => false,
        }
    }
}

/// Software model of the cutting machine.
pub struct SimulationMachine {
    core: Arc<Mutex<SimCore>>,
    interlocks: Arc<InterlockState>,
    limits: TravelLimits,
    speed_mm_s: f64,
    homing_config: HomingConfig,
    signals: SignalMap,
    last_tick: Instant,
    homing: Option<JoinHandle<HomingReport>>,
}

impl SimulationMachine {
    /// Build from configuration. Never fails.
    pub fn new(config: &MachineConfig) -> Self {
        let start = config.machine.start_position();
        info!(
            "Simulation machine at {:.1} mm, {:.0} mm/s, travel {:.0}..{:.0} mm",
            start,
            config.simulation.speed_mm_s,
            config.machine.min_distance_mm,
            config.machine.max_cut_length_mm
        );
        Self {
            core: Arc::new(Mutex::new(SimCore {
                position_mm: start,
                target_mm: None,
                moving: false,
                homed: false,
                homing_active: false,
                brake: false,
                clutch: true,
                presser_left: false,
                presser_right: false,
                blade_inhibit_left: false,
                blade_inhibit_right: false,
                angles: HeadAngles::default(),
                inputs: SimInputs::default(),
            })),
            interlocks: Arc::new(InterlockState::new()),
            limits: config.machine.limits(),
            speed_mm_s: config.simulation.speed_mm_s,
            homing_config: config.homing.clone(),
            signals: config.signal_map(),
            last_tick: Instant::now(),
            homing: None,
        }
    }

    pub fn interlocks(&self) -> &Arc<InterlockState> {
        &self.interlocks
    }

    /// Advance the model by `dt`: latch emergency, move toward the target,
    /// clear one-shot inputs.
    pub fn advance(&mut self, dt: Duration) {
        let mut core = self.core.lock();

        if core.inputs.emergency && self.interlocks.raise(Interlock::EMERGENCY) {
            warn!("Emergency latched");
            core.halt();
        }
        if self.interlocks.blocks_motion() && core.moving {
            debug!("Motion halted by interlock {:?}", self.interlocks.get());
            core.halt();
        }

        if core.moving {
            if let Some(target) = core.target_mm {
                let diff = target - core.position_mm;
                let step = self.speed_mm_s * dt.as_secs_f64();
                if diff.abs() <= step {
                    core.position_mm = target;
                    core.moving = false;
                    core.brake = true;
                    debug!("Arrived at {target:.1} mm");
                } else {
                    core.position_mm = self.limits.clamp(core.position_mm + diff.signum() * step);
                }
            }
        }

        core.inputs.blade_pulse = false;
        core.inputs.start_pressed = false;
    }

    /// Wait for a running homing sequence and return its report.
    pub fn wait_homing(&mut self) -> Option<HomingReport> {
        self.homing.take().and_then(|h| h.join().ok())
    }

    fn bus_snapshot(&self, core: &SimCore, flags: Interlock) -> BusState {
        let mut bus = BusState {
            online: true,
            ..BusState::default()
        };
        for (signal, addr) in self.signals.iter() {
            bus.write(*addr, core.signal(signal, flags));
        }
        bus
    }
}

impl MachineIo for SimulationMachine {
    fn backend_name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn get_position(&self) -> Option<f64> {
        Some(self.core.lock().position_mm)
    }

    fn is_positioning_active(&self) -> bool {
        self.core.lock().moving
    }

    fn get_input(&self, name: &str) -> bool {
        self.core
            .lock()
            .signal(&Signal::from_name(name), self.interlocks.get())
    }

    fn command_move(&mut self, length_mm: f64, angles: HeadAngles) -> bool {
        if self.interlocks.blocks_motion() {
            debug!("Move rejected: interlock {:?}", self.interlocks.get());
            return false;
        }
        let mut core = self.core.lock();
        if core.moving || core.homing_active {
            debug!("Move rejected: {}", MachineError::ConcurrentMotion);
            return false;
        }

        let target = self.limits.clamp(length_mm);
        core.angles = angles;
        core.target_mm = Some(target);
        if target == core.position_mm {
            return true;
        }
        core.moving = true;
        core.brake = false;
        info!(
            "Move {:.1} -> {:.1} mm (sx {:.1}, dx {:.1})",
            core.position_mm, target, angles.sx, angles.dx
        );
        true
    }

    fn command_stop(&mut self) -> bool {
        self.core.lock().halt();
        true
    }

    fn command_lock_brake(&mut self) -> bool {
        self.core.lock().brake = true;
        true
    }

    fn command_release_brake(&mut self) -> bool {
        self.core.lock().brake = false;
        true
    }

    fn command_set_clutch(&mut self, engaged: bool) -> bool {
        self.core.lock().clutch = engaged;
        true
    }

    fn command_set_head_angles(&mut self, angles: HeadAngles) -> bool {
        self.core.lock().angles = angles;
        true
    }

    fn command_set_presser_locks(&mut self, left: bool, right: bool) -> bool {
        let mut core = self.core.lock();
        core.presser_left = left;
        core.presser_right = right;
        true
    }

    fn command_set_blade_inhibit(&mut self, left: Option<bool>, right: Option<bool>) -> bool {
        let mut core = self.core.lock();
        if let Some(l) = left {
            core.blade_inhibit_left = l;
        }
        if let Some(r) = right {
            core.blade_inhibit_right = r;
        }
        true
    }

    fn do_homing(&mut self, on_done: HomingCallback) {
        {
            let mut core = self.core.lock();
            if core.moving || core.homing_active {
                drop(core);
                let busy = HomingOutcome::Busy;
                on_done(busy.success(), busy.message().to_string());
                return;
            }
            core.homing_active = true;
        }
        if let Some(previous) = self.homing.take() {
            let _ = previous.join();
        }

        let core = Arc::clone(&self.core);
        let callback: HomingCallback = Box::new(move |ok, msg| {
            core.lock().homing_active = false;
            on_done(ok, msg);
        });

        let axis = SimAxis {
            core: Arc::clone(&self.core),
            interlocks: Arc::clone(&self.interlocks),
            limits: self.limits,
        };
        let sequencer = HomingSequencer::new(axis, self.limits, self.homing_config.clone());
        self.homing = sequencer.spawn(callback);
    }

    fn tick(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_tick).max(MIN_TICK);
        self.last_tick = now;
        self.advance(dt);
    }

    fn get_state(&self) -> MachineState {
        let core = self.core.lock();
        let flags = self.interlocks.get();
        MachineState {
            position_mm: core.position_mm,
            target_mm: core.target_mm,
            moving: core.moving,
            homed: core.homed,
            emergency: flags.contains(Interlock::EMERGENCY),
            alarm: flags.contains(Interlock::ALARM),
            brake: core.brake,
            clutch: core.clutch,
            presser_left_locked: core.presser_left,
            presser_right_locked: core.presser_right,
            blade_inhibit_left: core.blade_inhibit_left,
            blade_inhibit_right: core.blade_inhibit_right,
            head_angle_sx: core.angles.sx,
            head_angle_dx: core.angles.dx,
            cut_enabled: core.cut_enabled(flags),
            bus: self.bus_snapshot(&core, flags),
            backend: BACKEND_NAME.to_string(),
        }
    }

    fn reset_emergency(&mut self) -> bool {
        if self.core.lock().inputs.emergency {
            warn!("Emergency reset refused: input still asserted");
            return false;
        }
        self.interlocks.clear(Interlock::EMERGENCY);
        info!("Emergency reset");
        true
    }

    fn clear_alarm(&mut self) -> bool {
        self.interlocks.clear(Interlock::ALARM);
        true
    }

    fn close(&mut self) {
        if let Some(handle) = self.homing.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!("Homing still running at close; detaching");
            }
        }
        debug!("Simulation machine closed");
    }

    fn sim_cut_pulse(&mut self) {
        self.core.lock().inputs.blade_pulse = true;
    }

    fn sim_start_pulse(&mut self) {
        self.core.lock().inputs.start_pressed = true;
    }

    fn sim_dx_blade_out(&mut self, on: bool) {
        self.core.lock().inputs.dx_blade_out = on;
    }

    fn sim_set_emergency(&mut self, on: bool) {
        let mut core = self.core.lock();
        core.inputs.emergency = on;
        if on && self.interlocks.raise(Interlock::EMERGENCY) {
            warn!("Emergency latched");
            core.halt();
        }
    }
}

/// Homing access to the simulated carriage.
struct SimAxis {
    core: Arc<Mutex<SimCore>>,
    interlocks: Arc<InterlockState>,
    limits: TravelLimits,
}

impl HomingAxis for SimAxis {
    fn position(&self) -> f64 {
        self.core.lock().position_mm
    }

    fn step_to(&mut self, target_mm: f64) -> Result<(), MachineError> {
        let mut core = self.core.lock();
        core.position_mm = self.limits.clamp(target_mm);
        core.target_mm = Some(core.position_mm);
        Ok(())
    }

    fn emergency_active(&self) -> bool {
        self.interlocks.emergency()
    }

    fn is_homed(&self) -> bool {
        self.core.lock().homed
    }

    fn prepare(&mut self) {
        self.core.lock().brake = false;
    }

    fn abort(&mut self) {
        self.core.lock().brake = true;
    }

    fn complete(&mut self, home_mm: f64) {
        let mut core = self.core.lock();
        core.position_mm = home_mm;
        core.target_mm = Some(home_mm);
        core.homed = true;
        core.brake = false;
        core.clutch = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn machine() -> SimulationMachine {
        let mut config = MachineConfig::default();
        config.machine.initial_position_mm = Some(1500.0);
        config.homing.step_interval_ms = 0;
        SimulationMachine::new(&config)
    }

    fn home(m: &mut SimulationMachine) -> (bool, String) {
        let (tx, rx) = mpsc::channel();
        m.do_homing(Box::new(move |ok, msg| {
            let _ = tx.send((ok, msg));
        }));
        m.wait_homing();
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn move_completes_with_exact_snap() {
        let mut m = machine();
        assert!(m.command_move(2000.0, HeadAngles::new(45.0, 90.0)));
        assert!(m.is_positioning_active());
        assert!(!m.get_state().brake);

        m.advance(Duration::from_millis(100));
        assert_eq!(m.get_position(), Some(1750.0));
        m.advance(Duration::from_millis(100));
        let state = m.get_state();
        assert_eq!(state.position_mm, 2000.0);
        assert!(!state.moving);
        assert!(state.brake);
        assert_eq!(state.head_angle_sx, 45.0);
        assert_eq!(state.backend, "simulation");
    }

    #[test]
    fn targets_are_clamped() {
        let mut m = machine();
        assert!(m.command_move(9000.0, HeadAngles::default()));
        assert_eq!(m.get_state().target_mm, Some(4000.0));
        m.advance(Duration::from_secs(2));
        assert_eq!(m.get_position(), Some(4000.0));
    }

    #[test]
    fn second_move_rejected_while_moving() {
        let mut m = machine();
        assert!(m.command_move(3000.0, HeadAngles::default()));
        assert!(!m.command_move(500.0, HeadAngles::default()));
        assert_eq!(m.get_state().target_mm, Some(3000.0));
    }

    #[test]
    fn emergency_stops_and_rejects_motion() {
        let mut m = machine();
        assert!(m.command_move(3000.0, HeadAngles::default()));
        m.advance(Duration::from_millis(100));

        m.sim_set_emergency(true);
        let state = m.get_state();
        assert!(state.emergency);
        assert!(!state.moving);
        assert!(state.brake);

        let before = m.get_state();
        assert!(!m.command_move(1000.0, HeadAngles::new(10.0, 10.0)));
        assert_eq!(m.get_state(), before);

        assert!(!m.reset_emergency());
        m.sim_set_emergency(false);
        assert!(m.reset_emergency());
        assert!(m.command_move(1000.0, HeadAngles::default()));
    }

    #[test]
    fn one_shot_inputs_clear_on_tick() {
        let mut m = machine();
        m.sim_cut_pulse();
        m.sim_start_pulse();
        m.sim_dx_blade_out(true);
        assert!(m.get_input("blade_pulse"));
        assert!(m.get_input("start_pressed"));
        assert!(m.get_state().bus.inputs_a[3]);

        m.tick();
        assert!(!m.get_input("blade_pulse"));
        assert!(!m.get_input("start_pressed"));
        assert!(m.get_input("dx_blade_out"));
        assert!(!m.get_input("no_such_input"));
    }

    #[test]
    fn homing_from_1500() {
        let mut m = machine();
        assert_eq!(home(&mut m), (true, "HOMING OK".to_string()));

        let state = m.get_state();
        assert_eq!(state.position_mm, 250.0);
        assert!(state.homed);
        assert!(!state.brake);
        assert!(state.clutch);
        assert!(state.cut_enabled);
        assert!(state.bus.coils_a[6]);
    }

    #[test]
    fn homing_when_homed_does_not_move() {
        let mut m = machine();
        home(&mut m);
        assert!(m.command_move(1200.0, HeadAngles::default()));
        m.advance(Duration::from_secs(1));

        assert_eq!(home(&mut m), (true, "ALREADY HOMED".to_string()));
        assert_eq!(m.get_position(), Some(1200.0));
    }

    #[test]
    fn homing_under_emergency_fails() {
        let mut m = machine();
        m.sim_set_emergency(true);
        assert_eq!(home(&mut m), (false, "EMERGENCY".to_string()));
        assert!(!m.get_state().homed);
    }

    #[test]
    fn homing_frees_brake_and_relocks_on_abort() {
        let mut config = MachineConfig::default();
        config.machine.initial_position_mm = Some(1500.0);
        config.homing.step_interval_ms = 20;
        let mut m = SimulationMachine::new(&config);
        m.command_lock_brake();

        let (tx, rx) = mpsc::channel();
        m.do_homing(Box::new(move |ok, msg| {
            let _ = tx.send((ok, msg));
        }));
        std::thread::sleep(Duration::from_millis(60));
        let state = m.get_state();
        assert!(!state.brake, "brake released while homing");
        assert!(state.position_mm < 1500.0);

        m.sim_set_emergency(true);
        m.wait_homing();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            (false, "EMERGENCY".to_string())
        );
        assert!(m.get_state().brake);
        assert!(!m.get_state().homed);
    }

    #[test]
    fn homing_while_moving_is_busy() {
        let mut m = machine();
        assert!(m.command_move(3000.0, HeadAngles::default()));
        assert_eq!(home(&mut m), (false, "BUSY".to_string()));
    }

    #[test]
    fn state_serializes_to_json() {
        let m = machine();
        let json = serde_json::to_value(m.get_state()).unwrap();
        assert_eq!(json["position_mm"], 1500.0);
        assert_eq!(json["backend"], "simulation");
    }
}
