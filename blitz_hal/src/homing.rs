//! Homing state machine.
//!
//! `Idle -> ApproachSensor -> Backoff -> PreciseReturn -> Homed`, with
//! `Aborted` reachable from every moving phase when the emergency interlock
//! is seen. The sequencer only decides where to go next; executing a step
//! and finishing the reference are delegated to a [`HomingAxis`], so both
//! backends run the same sequence.
//!
//! Abort latency is one step: emergency is checked before each step.

use blitz_common::homing::{HomingConfig, HomingOutcome, HomingPhase};
use blitz_common::machine::error::MachineError;
use blitz_common::machine::io::HomingCallback;
use blitz_common::machine::types::TravelLimits;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Axis operations the sequencer needs.
pub trait HomingAxis: Send {
    /// Current position, mm.
    fn position(&self) -> f64;

    /// Execute one positioning step and return when it is done.
    fn step_to(&mut self, target_mm: f64) -> Result<(), MachineError>;

    fn emergency_active(&self) -> bool;

    fn is_homed(&self) -> bool;

    /// Before the first step: free the carriage (brake off).
    fn prepare(&mut self) {}

    /// The sequence ended without a reference: secure the carriage.
    fn abort(&mut self) {}

    /// Final phase: snap to `home_mm`, mark homed, release the brake,
    /// engage the clutch and recompute cut enable.
    fn complete(&mut self, home_mm: f64);
}

/// Outcome of a sequence plus the end position of each phase.
#[derive(Debug, Clone, PartialEq)]
pub struct HomingReport {
    pub outcome: HomingOutcome,
    /// Last phase entered.
    pub phase: HomingPhase,
    pub approach_end_mm: Option<f64>,
    pub backoff_end_mm: Option<f64>,
    pub final_mm: Option<f64>,
    /// Positioning steps executed.
    pub steps: u32,
}

impl HomingReport {
    fn new(outcome: HomingOutcome, phase: HomingPhase) -> Self {
        Self {
            outcome,
            phase,
            approach_end_mm: None,
            backoff_end_mm: None,
            final_mm: None,
            steps: 0,
        }
    }

    pub fn message(&self) -> &'static str {
        self.outcome.message()
    }
}

/// Runs the homing sequence on one axis.
pub struct HomingSequencer<A> {
    axis: A,
    limits: TravelLimits,
    config: HomingConfig,
}

impl<A: HomingAxis> HomingSequencer<A> {
    pub fn new(axis: A, limits: TravelLimits, config: HomingConfig) -> Self {
        Self {
            axis,
            limits,
            config,
        }
    }

    pub fn axis(&self) -> &A {
        &self.axis
    }

    /// Outcome decided before anything moves, if any.
    fn entry_guard(&self) -> Option<HomingOutcome> {
        if self.axis.emergency_active() {
            Some(HomingOutcome::Emergency)
        } else if self.axis.is_homed() {
            Some(HomingOutcome::AlreadyHomed)
        } else {
            None
        }
    }

    /// Run the whole sequence on the calling thread.
    pub fn run(&mut self) -> HomingReport {
        if let Some(outcome) = self.entry_guard() {
            debug!("Homing not started: {}", outcome.message());
            return HomingReport::new(outcome, HomingPhase::Idle);
        }

        let mut report = HomingReport::new(HomingOutcome::Failed, HomingPhase::Idle);
        self.axis.prepare();
        report.outcome = self.sequence(&mut report);
        if report.outcome != HomingOutcome::Homed {
            self.axis.abort();
        }
        match report.outcome {
            HomingOutcome::Homed => info!("Homing complete at {:.1} mm", self.limits.min_mm),
            HomingOutcome::Emergency => {
                warn!("Homing aborted by emergency in {}", report.phase);
                report.phase = HomingPhase::Aborted;
            }
            other => warn!("Homing ended in {}: {}", report.phase, other.message()),
        }
        report
    }

    fn sequence(&mut self, report: &mut HomingReport) -> HomingOutcome {
        let home = self.limits.min_mm;
        let sensor = self.limits.clamp(home + self.config.sensor_offset_mm);
        let mut pos = self.limits.clamp(self.axis.position());
        info!("Homing from {pos:.1} mm");

        report.phase = HomingPhase::ApproachSensor;
        while pos > sensor {
            pos = (pos - self.config.coarse_step_mm).max(sensor);
            if let Err(outcome) = self.step(pos, report) {
                return outcome;
            }
        }
        report.approach_end_mm = Some(pos);

        report.phase = HomingPhase::Backoff;
        pos = (pos + self.config.backoff_mm).min(self.limits.max_mm);
        if let Err(outcome) = self.step(pos, report) {
            return outcome;
        }
        report.backoff_end_mm = Some(pos);

        report.phase = HomingPhase::PreciseReturn;
        while pos > home {
            pos = (pos - self.config.fine_step_mm).max(home);
            if let Err(outcome) = self.step(pos, report) {
                return outcome;
            }
        }

        if self.axis.emergency_active() {
            return HomingOutcome::Emergency;
        }
        self.axis.complete(home);
        report.phase = HomingPhase::Homed;
        report.final_mm = Some(home);
        HomingOutcome::Homed
    }

    fn step(&mut self, target: f64, report: &mut HomingReport) -> Result<(), HomingOutcome> {
        if self.axis.emergency_active() {
            return Err(HomingOutcome::Emergency);
        }
        if let Err(e) = self.axis.step_to(target) {
            if let MachineError::Interlock(_) = e {
                return Err(HomingOutcome::Emergency);
            }
            error!("Homing step to {target:.1} mm failed: {e}");
            return Err(HomingOutcome::Failed);
        }
        report.steps += 1;
        if self.config.step_interval_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.step_interval_ms));
        }
        Ok(())
    }
}

impl<A: HomingAxis + 'static> HomingSequencer<A> {
    /// Run on a background thread and report through `callback`.
    ///
    /// The entry guard is evaluated on the caller's thread; when it decides
    /// the outcome the callback runs immediately and no thread is started.
    pub fn spawn(mut self, callback: HomingCallback) -> Option<JoinHandle<HomingReport>> {
        if let Some(outcome) = self.entry_guard() {
            callback(outcome.success(), outcome.message().to_string());
            return None;
        }

        let slot = Arc::new(Mutex::new(Some(callback)));
        let worker_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name("homing".to_string())
            .spawn(move || {
                let report = self.run();
                if let Some(cb) = worker_slot.lock().take() {
                    cb(report.outcome.success(), report.message().to_string());
                }
                report
            });

        match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("Cannot start homing thread: {e}");
                if let Some(cb) = slot.lock().take() {
                    let outcome = HomingOutcome::Failed;
                    cb(outcome.success(), outcome.message().to_string());
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    #[derive(Default)]
    struct TestAxis {
        pos: f64,
        homed: bool,
        emergency: Arc<AtomicBool>,
        trail: Vec<f64>,
        raise_emergency_after: Option<usize>,
        fail_after: Option<usize>,
        completed: bool,
        prepared_at: Option<usize>,
        aborted: bool,
    }

    impl TestAxis {
        fn at(pos: f64) -> Self {
            Self {
                pos,
                ..Self::default()
            }
        }
    }

    impl HomingAxis for TestAxis {
        fn position(&self) -> f64 {
            self.pos
        }

        fn step_to(&mut self, target_mm: f64) -> Result<(), MachineError> {
            if self.fail_after == Some(self.trail.len()) {
                return Err(MachineError::Transport("drive offline".to_string()));
            }
            self.pos = target_mm;
            self.trail.push(target_mm);
            if self.raise_emergency_after == Some(self.trail.len()) {
                self.emergency.store(true, Ordering::SeqCst);
            }
            Ok(())
        }

        fn emergency_active(&self) -> bool {
            self.emergency.load(Ordering::SeqCst)
        }

        fn is_homed(&self) -> bool {
            self.homed
        }

        fn prepare(&mut self) {
            self.prepared_at = Some(self.trail.len());
        }

        fn abort(&mut self) {
            self.aborted = true;
        }

        fn complete(&mut self, home_mm: f64) {
            self.pos = home_mm;
            self.homed = true;
            self.completed = true;
        }
    }

    fn config() -> HomingConfig {
        HomingConfig {
            step_interval_ms: 0,
            ..HomingConfig::default()
        }
    }

    fn limits() -> TravelLimits {
        TravelLimits::new(250.0, 4000.0)
    }

    #[test]
    fn full_sequence_from_1500() {
        let mut seq = HomingSequencer::new(TestAxis::at(1500.0), limits(), config());
        let report = seq.run();

        assert_eq!(report.outcome, HomingOutcome::Homed);
        assert_eq!(report.phase, HomingPhase::Homed);
        assert_eq!(report.approach_end_mm, Some(255.0));
        assert_eq!(report.backoff_end_mm, Some(265.0));
        assert_eq!(report.final_mm, Some(250.0));
        assert_eq!(report.message(), "HOMING OK");

        let axis = seq.axis();
        assert!(axis.completed && axis.homed);
        assert_eq!(axis.prepared_at, Some(0));
        assert!(!axis.aborted);
        assert_eq!(axis.pos, 250.0);
        assert_eq!(axis.trail.first(), Some(&1450.0));
        let backoff_at = axis.trail.iter().position(|p| *p == 265.0).unwrap();
        assert_eq!(axis.trail[backoff_at - 1], 255.0);
        assert_eq!(axis.trail.last(), Some(&250.0));
        assert_eq!(report.steps as usize, axis.trail.len());
    }

    #[test]
    fn backoff_is_clamped_to_upper_limit() {
        let mut seq = HomingSequencer::new(
            TestAxis::at(258.0),
            TravelLimits::new(250.0, 260.0),
            config(),
        );
        let report = seq.run();
        assert_eq!(report.approach_end_mm, Some(255.0));
        assert_eq!(report.backoff_end_mm, Some(260.0));
        assert_eq!(report.outcome, HomingOutcome::Homed);
    }

    #[test]
    fn emergency_at_entry_moves_nothing() {
        let axis = TestAxis::at(1500.0);
        axis.emergency.store(true, Ordering::SeqCst);
        let mut seq = HomingSequencer::new(axis, limits(), config());
        let report = seq.run();
        assert_eq!(report.outcome, HomingOutcome::Emergency);
        assert_eq!(report.message(), "EMERGENCY");
        assert!(seq.axis().trail.is_empty());
        assert!(!seq.axis().homed);
        assert_eq!(seq.axis().prepared_at, None);
        assert!(!seq.axis().aborted);
    }

    #[test]
    fn already_homed_succeeds_without_motion() {
        let mut axis = TestAxis::at(1234.0);
        axis.homed = true;
        let mut seq = HomingSequencer::new(axis, limits(), config());
        let report = seq.run();
        assert_eq!(report.outcome, HomingOutcome::AlreadyHomed);
        assert!(report.outcome.success());
        assert_eq!(seq.axis().pos, 1234.0);
        assert_eq!(report.steps, 0);
    }

    #[test]
    fn emergency_during_approach_aborts() {
        let mut axis = TestAxis::at(1500.0);
        axis.raise_emergency_after = Some(3);
        let mut seq = HomingSequencer::new(axis, limits(), config());
        let report = seq.run();

        assert_eq!(report.outcome, HomingOutcome::Emergency);
        assert_eq!(report.phase, HomingPhase::Aborted);
        assert_eq!(report.approach_end_mm, None);
        assert_eq!(seq.axis().trail.len(), 3);
        assert!(!seq.axis().homed);
        assert!(seq.axis().aborted);
    }

    #[test]
    fn step_failure_reports_failed() {
        let mut axis = TestAxis::at(400.0);
        axis.fail_after = Some(1);
        let mut seq = HomingSequencer::new(axis, limits(), config());
        let report = seq.run();
        assert_eq!(report.outcome, HomingOutcome::Failed);
        assert_eq!(report.phase, HomingPhase::ApproachSensor);
        assert!(!seq.axis().homed);
        assert!(seq.axis().aborted);
    }

    #[test]
    fn spawn_reports_through_callback() {
        let (tx, rx) = mpsc::channel();
        let seq = HomingSequencer::new(TestAxis::at(600.0), limits(), config());
        let handle = seq
            .spawn(Box::new(move |ok, msg| {
                let _ = tx.send((ok, msg));
            }))
            .unwrap();

        let report = handle.join().unwrap();
        assert_eq!(report.final_mm, Some(250.0));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            (true, "HOMING OK".to_string())
        );
    }

    #[test]
    fn spawn_guard_answers_inline() {
        let (tx, rx) = mpsc::channel();
        let axis = TestAxis::at(600.0);
        axis.emergency.store(true, Ordering::SeqCst);
        let seq = HomingSequencer::new(axis, limits(), config());
        let handle = seq.spawn(Box::new(move |ok, msg| {
            let _ = tx.send((ok, msg));
        }));
        assert!(handle.is_none());
        assert_eq!(rx.try_recv().unwrap(), (false, "EMERGENCY".to_string()));
    }
}
