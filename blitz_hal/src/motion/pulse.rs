//! Step/direction pulse train generator.
//!
//! One worker thread per motion. The worker owns the pins for the duration
//! of the motion, sets the direction line, waits the driver's direction
//! setup time and then emits the pulses on a deadline schedule (sleep for
//! long waits, spin close to the edge). Stop is cooperative and checked
//! before every pulse.

use blitz_common::consts::{DIR_SETUP_US, MAX_PULSE_FREQ_HZ, MIN_PULSE_WIDTH_US};
use blitz_common::machine::config::MotionConfig;
use blitz_common::machine::error::MachineError;
use blitz_common::machine::types::MotionCommand;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::gpio::{self, OutputPin};

/// Below this the scheduler spins instead of sleeping.
const SPIN_THRESHOLD: Duration = Duration::from_micros(200);

/// Travel direction of a pulse train.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Increasing position; DIR low.
    Forward,
    /// Decreasing position; DIR high.
    Reverse,
}

impl Direction {
    pub fn of(distance_mm: f64) -> Self {
        if distance_mm >= 0.0 {
            Self::Forward
        } else {
            Self::Reverse
        }
    }

    pub fn sign(self) -> f64 {
        match self {
            Self::Forward => 1.0,
            Self::Reverse => -1.0,
        }
    }

    fn dir_level(self) -> bool {
        matches!(self, Self::Reverse)
    }
}

/// Pulse count and per-pulse timing of one motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseProfile {
    /// Pulses to emit.
    pub pulses: u64,
    mm_per_pulse: f64,
    max_freq_hz: f64,
    accel_mm_s2: Option<f64>,
}

impl PulseProfile {
    pub fn new(distance_mm: f64, speed_mm_s: f64, accel_mm_s2: Option<f64>, mm_per_pulse: f64) -> Self {
        // The epsilon keeps 0.3 / 0.1 at 3 pulses.
        let pulses = (distance_mm.abs() / mm_per_pulse + 1e-9).floor() as u64;
        Self {
            pulses,
            mm_per_pulse,
            max_freq_hz: (speed_mm_s / mm_per_pulse).min(MAX_PULSE_FREQ_HZ),
            accel_mm_s2: accel_mm_s2.filter(|a| *a > 0.0),
        }
    }

    /// Step frequency of pulse `index`.
    ///
    /// Constant without acceleration. With acceleration the speed follows
    /// a symmetric trapezoid, `v = sqrt(2 a d)` measured from the nearer
    /// end of the move, capped at the cruise speed.
    pub fn frequency_hz(&self, index: u64) -> f64 {
        let Some(accel) = self.accel_mm_s2 else {
            return self.max_freq_hz;
        };
        let from_end = index.min(self.pulses.saturating_sub(1).saturating_sub(index)) + 1;
        let travelled = from_end as f64 * self.mm_per_pulse;
        let ramp_hz = (2.0 * accel * travelled).sqrt() / self.mm_per_pulse;
        ramp_hz.min(self.max_freq_hz)
    }

    pub fn period(&self, index: u64) -> Duration {
        Duration::from_nanos((1e9 / self.frequency_hz(index)).round() as u64)
    }

    /// High time of a pulse: half the period, at least the driver minimum.
    pub fn pulse_width(period: Duration) -> Duration {
        let min_width = Duration::from_nanos((MIN_PULSE_WIDTH_US * 1e3).round() as u64);
        (period / 2).max(min_width)
    }
}

#[derive(Debug, Default)]
struct Flags {
    moving: bool,
    stop_requested: bool,
}

#[derive(Debug, Default)]
struct PulseShared {
    flags: Mutex<Flags>,
    emitted: AtomicU64,
    reverse: AtomicBool,
    connected: AtomicBool,
}

struct PulsePins {
    step: Box<dyn OutputPin>,
    dir: Box<dyn OutputPin>,
    enable: Option<Box<dyn OutputPin>>,
}

/// Step/direction generator for the external servo drive.
pub struct PulseGenerator {
    mm_per_pulse: f64,
    shared: Arc<PulseShared>,
    pins: Arc<Mutex<Option<PulsePins>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PulseGenerator {
    /// Open the configured pins. A GPIO failure yields a disconnected
    /// generator.
    pub fn open(config: &MotionConfig) -> Self {
        let opened = (|| {
            let step = gpio::open_output(config.pulse_pin)?;
            let dir = gpio::open_output(config.dir_pin)?;
            let enable = config.enable_pin.map(gpio::open_output).transpose()?;
            Ok::<_, MachineError>((step, dir, enable))
        })();

        match opened {
            Ok((step, dir, enable)) => {
                info!(
                    "Pulse generator on GPIO{} (PUL) / GPIO{} (DIR)",
                    config.pulse_pin, config.dir_pin
                );
                Self::with_pins(step, dir, enable, config.mm_per_pulse)
            }
            Err(e) => {
                warn!("Pulse generator unavailable: {e}");
                Self::disconnected(config.mm_per_pulse)
            }
        }
    }

    /// Generator on already-open pins. The enable line is driven high.
    pub fn with_pins(
        mut step: Box<dyn OutputPin>,
        mut dir: Box<dyn OutputPin>,
        mut enable: Option<Box<dyn OutputPin>>,
        mm_per_pulse: f64,
    ) -> Self {
        step.set_low();
        dir.set_low();
        if let Some(en) = enable.as_mut() {
            en.set_high();
        }
        let generator = Self::disconnected(mm_per_pulse);
        *generator.pins.lock() = Some(PulsePins { step, dir, enable });
        generator.shared.connected.store(true, Ordering::Release);
        generator
    }

    pub fn disconnected(mm_per_pulse: f64) -> Self {
        Self {
            mm_per_pulse,
            shared: Arc::new(PulseShared::default()),
            pins: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_moving(&self) -> bool {
        self.shared.flags.lock().moving
    }

    pub fn mm_per_pulse(&self) -> f64 {
        self.mm_per_pulse
    }

    /// Pulses emitted by the current or last motion.
    pub fn emitted_pulses(&self) -> u64 {
        self.shared.emitted.load(Ordering::Acquire)
    }

    /// Direction of the current or last motion.
    pub fn direction(&self) -> Direction {
        if self.shared.reverse.load(Ordering::Acquire) {
            Direction::Reverse
        } else {
            Direction::Forward
        }
    }

    /// Signed distance covered by the current or last motion.
    pub fn travelled_mm(&self) -> f64 {
        self.emitted_pulses() as f64 * self.mm_per_pulse * self.direction().sign()
    }

    pub fn max_speed_mm_s(&self) -> f64 {
        MAX_PULSE_FREQ_HZ * self.mm_per_pulse
    }

    /// Execute a positioning request from `current_mm`.
    pub fn submit(&self, command: &MotionCommand, current_mm: f64) -> bool {
        self.move_to(
            command.target_mm,
            current_mm,
            command.speed_mm_s,
            command.accel_mm_s2,
        )
    }

    /// Absolute move expressed as a relative one from `current_mm`.
    pub fn move_to(
        &self,
        target_mm: f64,
        current_mm: f64,
        speed_mm_s: f64,
        accel_mm_s2: Option<f64>,
    ) -> bool {
        self.move_relative(target_mm - current_mm, speed_mm_s, accel_mm_s2)
    }

    /// Start a pulse train. False when disconnected, when a motion is in
    /// flight, or for a non-positive speed.
    pub fn move_relative(&self, distance_mm: f64, speed_mm_s: f64, accel_mm_s2: Option<f64>) -> bool {
        if !self.is_connected() {
            warn!("Pulse generator not connected");
            return false;
        }
        if !distance_mm.is_finite() || !(speed_mm_s > 0.0) {
            warn!("Rejected pulse move {distance_mm} mm @ {speed_mm_s} mm/s");
            return false;
        }
        {
            let mut flags = self.shared.flags.lock();
            if flags.moving {
                warn!("Movement already in progress");
                return false;
            }
            flags.moving = true;
            flags.stop_requested = false;
        }

        let profile = PulseProfile::new(distance_mm, speed_mm_s, accel_mm_s2, self.mm_per_pulse);
        let direction = Direction::of(distance_mm);
        self.shared.emitted.store(0, Ordering::Release);
        self.shared
            .reverse
            .store(direction == Direction::Reverse, Ordering::Release);

        let mut worker = self.worker.lock();
        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }

        let shared = Arc::clone(&self.shared);
        let pins = Arc::clone(&self.pins);
        let spawned = thread::Builder::new()
            .name("pulse-train".to_string())
            .spawn(move || execute(&shared, &pins, profile, direction));

        match spawned {
            Ok(handle) => {
                info!(
                    "{:?} {:+.2} mm ({} pulses @ {:.0} Hz)",
                    direction,
                    distance_mm,
                    profile.pulses,
                    profile.frequency_hz(profile.pulses / 2)
                );
                *worker = Some(handle);
                true
            }
            Err(e) => {
                error!("Cannot start pulse worker: {e}");
                self.shared.flags.lock().moving = false;
                false
            }
        }
    }

    /// Request a cooperative stop.
    ///
    /// With `wait`, joins the worker for at most `timeout` and reports
    /// whether it finished. False when disconnected.
    pub fn stop(&self, wait: bool, timeout: Duration) -> bool {
        if !self.is_connected() {
            return false;
        }
        {
            let mut flags = self.shared.flags.lock();
            if !flags.moving {
                return true;
            }
            flags.stop_requested = true;
        }
        info!("Pulse train stop requested");
        if !wait {
            return true;
        }

        let deadline = Instant::now() + timeout;
        let mut worker = self.worker.lock();
        loop {
            match worker.as_ref() {
                None => return !self.is_moving(),
                Some(handle) if handle.is_finished() => {
                    if let Some(handle) = worker.take() {
                        let _ = handle.join();
                    }
                    return true;
                }
                Some(_) if Instant::now() >= deadline => return false,
                Some(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    /// Stop, drive all outputs low and release the pins. Idempotent.
    pub fn close(&self) {
        if !self.is_connected() {
            return;
        }
        if !self.stop(true, Duration::from_secs(2)) {
            warn!("Pulse worker did not stop in time");
        }
        if let Some(mut pins) = self.pins.lock().take() {
            pins.step.set_low();
            pins.dir.set_low();
            if let Some(en) = pins.enable.as_mut() {
                en.set_low();
            }
        }
        self.shared.connected.store(false, Ordering::Release);
        info!("Pulse generator closed");
    }
}

impl Drop for PulseGenerator {
    fn drop(&mut self) {
        self.close();
    }
}

fn execute(shared: &PulseShared, pins: &Mutex<Option<PulsePins>>, profile: PulseProfile, direction: Direction) {
    {
        let mut guard = pins.lock();
        match guard.as_mut() {
            Some(p) => run_train(shared, p, profile, direction),
            None => warn!("Pulse pins released before motion start"),
        }
    }
    let mut flags = shared.flags.lock();
    flags.moving = false;
    flags.stop_requested = false;
}

fn run_train(shared: &PulseShared, pins: &mut PulsePins, profile: PulseProfile, direction: Direction) {
    pins.dir.write(direction.dir_level());
    thread::sleep(Duration::from_micros(DIR_SETUP_US));

    if profile.pulses == 0 {
        debug!("Zero-length move, already at destination");
        return;
    }

    let mut next = Instant::now();
    for index in 0..profile.pulses {
        if shared.flags.lock().stop_requested {
            info!("Pulse train interrupted after {index}/{} pulses", profile.pulses);
            return;
        }
        // No catch-up bursts after an overrun.
        let now = Instant::now();
        if next < now {
            next = now;
        }
        let period = profile.period(index);
        let edge = next;

        pins.step.set_high();
        wait_until(edge + PulseProfile::pulse_width(period));
        pins.step.set_low();
        shared.emitted.fetch_add(1, Ordering::AcqRel);

        next = edge + period;
        wait_until(next);
    }
    debug!("Pulse train complete: {} pulses", profile.pulses);
}

fn wait_until(deadline: Instant) {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        let remaining = deadline - now;
        if remaining > SPIN_THRESHOLD {
            thread::sleep(remaining - SPIN_THRESHOLD);
        } else {
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::gpio::MemoryOutput;

    fn generator(mm_per_pulse: f64) -> (PulseGenerator, MemoryOutput, MemoryOutput, MemoryOutput) {
        let step = MemoryOutput::new();
        let dir = MemoryOutput::new();
        let enable = MemoryOutput::new();
        let pg = PulseGenerator::with_pins(
            Box::new(step.clone()),
            Box::new(dir.clone()),
            Some(Box::new(enable.clone())),
            mm_per_pulse,
        );
        (pg, step, dir, enable)
    }

    fn wait_idle(pg: &PulseGenerator, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while pg.is_moving() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn profile_constant_speed() {
        let p = PulseProfile::new(1000.0, 500.0, None, 0.1);
        assert_eq!(p.pulses, 10_000);
        assert!((p.frequency_hz(0) - 5000.0).abs() < 1e-6);
        assert_eq!(p.frequency_hz(0), p.frequency_hz(9_999));
        assert_eq!(p.period(0), Duration::from_micros(200));
        assert_eq!(PulseProfile::pulse_width(p.period(0)), Duration::from_micros(100));
    }

    #[test]
    fn profile_caps_frequency_and_width() {
        let p = PulseProfile::new(10.0, 1e9, None, 0.001);
        assert_eq!(p.frequency_hz(3), MAX_PULSE_FREQ_HZ);
        assert_eq!(PulseProfile::pulse_width(Duration::from_nanos(500)), Duration::from_micros(1));
        assert_eq!(PulseProfile::new(0.3, 10.0, None, 0.1).pulses, 3);
        assert_eq!(PulseProfile::new(-0.25, 10.0, None, 0.1).pulses, 2);
    }

    #[test]
    fn profile_trapezoid_is_symmetric() {
        let p = PulseProfile::new(100.0, 200.0, Some(1000.0), 0.1);
        let n = p.pulses;
        assert_eq!(p.frequency_hz(0), p.frequency_hz(n - 1));
        assert_eq!(p.frequency_hz(10), p.frequency_hz(n - 11));
        assert!(p.frequency_hz(0) < p.frequency_hz(10));
        assert!((p.frequency_hz(n / 2) - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn emits_one_pulse_per_step_forward() {
        let (pg, step, dir, enable) = generator(0.1);
        assert!(enable.level());
        assert!(pg.move_relative(1000.0, 500.0, None));
        assert!(pg.is_moving());
        assert!(wait_idle(&pg, Duration::from_secs(20)));

        assert_eq!(pg.emitted_pulses(), 10_000);
        assert_eq!(step.rising_edges(), 10_000);
        assert_eq!(pg.direction(), Direction::Forward);
        assert!(!dir.level());
        assert!((pg.travelled_mm() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn reverse_sets_dir_high() {
        let (pg, step, dir, _) = generator(0.5);
        assert!(pg.move_to(240.0, 250.0, 1000.0, None));
        assert!(wait_idle(&pg, Duration::from_secs(5)));
        assert!(dir.level());
        assert_eq!(step.rising_edges(), 20);
        assert_eq!(pg.direction(), Direction::Reverse);
        assert!((pg.travelled_mm() + 10.0).abs() < 1e-9);
    }

    #[test]
    fn second_move_leaves_running_train_untouched() {
        let (pg, step, dir, _) = generator(0.1);
        assert!(pg.move_relative(50.0, 1000.0, None));
        assert!(!pg.move_relative(-5.0, 10.0, None));
        assert!(!pg.submit(&MotionCommand::new(0.0, 10.0), 50.0));
        assert!(pg.is_moving());

        assert!(wait_idle(&pg, Duration::from_secs(5)));
        assert_eq!(pg.emitted_pulses(), 500);
        assert_eq!(step.rising_edges(), 500);
        assert_eq!(pg.direction(), Direction::Forward);
        assert!(!dir.level());
    }

    #[test]
    fn stop_interrupts_train() {
        let (pg, _, _, _) = generator(0.1);
        assert!(pg.move_relative(1000.0, 10.0, None));
        assert!(pg.stop(true, Duration::from_secs(2)));
        assert!(!pg.is_moving());
        assert!(pg.emitted_pulses() < 10_000);
    }

    #[test]
    fn submit_moves_to_absolute_target() {
        let (pg, step, dir, _) = generator(0.5);
        let cmd = MotionCommand {
            accel_mm_s2: Some(5000.0),
            ..MotionCommand::new(300.0, 500.0)
        };
        assert!(pg.submit(&cmd, 310.0));
        assert!(wait_idle(&pg, Duration::from_secs(5)));
        assert_eq!(step.rising_edges(), 20);
        assert!(dir.level());
    }

    #[test]
    fn zero_length_move_completes() {
        let (pg, step, _, _) = generator(0.1);
        assert!(pg.move_relative(0.05, 100.0, None));
        assert!(wait_idle(&pg, Duration::from_secs(1)));
        assert_eq!(step.rising_edges(), 0);
    }

    #[test]
    fn disconnected_rejects_everything() {
        let pg = PulseGenerator::disconnected(0.1);
        assert!(!pg.is_connected());
        assert!(!pg.move_relative(10.0, 100.0, None));
        assert!(!pg.stop(true, Duration::from_millis(10)));
        assert_eq!(pg.max_speed_mm_s(), MAX_PULSE_FREQ_HZ * 0.1);
    }

    #[test]
    fn close_drives_outputs_low() {
        let (pg, step, dir, enable) = generator(0.1);
        assert!(pg.move_relative(-1000.0, 10.0, None));
        pg.close();
        assert!(!pg.is_connected());
        assert!(!pg.is_moving());
        assert!(!step.level() && !dir.level() && !enable.level());
        assert!(!pg.move_relative(1.0, 10.0, None));
    }
}
