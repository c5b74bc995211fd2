//! Periodic control loop.
//!
//! `ControlLoop` owns the active `MachineIo` backend and calls `tick()` at
//! the configured interval until the running flag is cleared. It tracks
//! cycle timing and logs the machine state periodically.

use blitz_common::machine::io::MachineIo;
use blitz_common::machine::types::MachineState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cycle timing statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimingStats {
    /// Cycles executed.
    pub cycle_count: u64,
    /// Cycles that overran the tick interval.
    pub timing_violations: u64,
    pub max_cycle_time_us: u64,
    pub total_cycle_time_us: u64,
}

impl TimingStats {
    fn record(&mut self, cycle_time_us: u64, target_us: u64) -> bool {
        self.cycle_count += 1;
        self.total_cycle_time_us += cycle_time_us;
        self.max_cycle_time_us = self.max_cycle_time_us.max(cycle_time_us);
        if cycle_time_us > target_us {
            self.timing_violations += 1;
            return true;
        }
        false
    }

    pub fn average_cycle_time_us(&self) -> u64 {
        self.total_cycle_time_us
            .checked_div(self.cycle_count)
            .unwrap_or(0)
    }
}

/// Drives a machine backend at a fixed period.
pub struct ControlLoop {
    machine: Box<dyn MachineIo>,
    running: Arc<AtomicBool>,
    tick_interval: Duration,
    state_interval: Option<Duration>,
    stats: TimingStats,
}

impl ControlLoop {
    pub fn new(machine: Box<dyn MachineIo>, tick_interval: Duration) -> Self {
        info!(
            "Control loop for '{}' backend, tick {} ms",
            machine.backend_name(),
            tick_interval.as_millis()
        );
        Self {
            machine,
            running: Arc::new(AtomicBool::new(true)),
            tick_interval,
            state_interval: None,
            stats: TimingStats::default(),
        }
    }

    /// Log the machine state as JSON every `interval`.
    pub fn with_state_interval(mut self, interval: Option<Duration>) -> Self {
        self.state_interval = interval.filter(|d| !d.is_zero());
        self
    }

    /// Flag that keeps [`run`](Self::run) going; clear it to stop. Set from
    /// construction, so a stop requested before `run` is honoured.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn machine(&self) -> &dyn MachineIo {
        self.machine.as_ref()
    }

    pub fn machine_mut(&mut self) -> &mut dyn MachineIo {
        self.machine.as_mut()
    }

    pub fn stats(&self) -> TimingStats {
        self.stats
    }

    /// Execute one cycle without sleeping.
    pub fn step(&mut self) {
        let start = Instant::now();
        self.machine.tick();
        let cycle_time_us = start.elapsed().as_micros() as u64;

        let target_us = self.tick_interval.as_micros() as u64;
        if self.stats.record(cycle_time_us, target_us) {
            let violations = self.stats.timing_violations;
            if violations <= 10 || violations % 1000 == 0 {
                warn!(
                    "Timing violation #{violations}: cycle took {cycle_time_us}us (target {target_us}us)"
                );
            }
        }

        if self.stats.cycle_count % 1000 == 0 {
            debug!(
                "Control loop: {} cycles, avg={}us, max={}us, violations={}",
                self.stats.cycle_count,
                self.stats.average_cycle_time_us(),
                self.stats.max_cycle_time_us,
                self.stats.timing_violations
            );
        }
    }

    /// Run until the running flag is cleared.
    pub fn run(&mut self) {
        if detect_rt_mode() {
            info!("Running in real-time mode");
        } else {
            info!("Running in standard (non-RT) mode");
        }

        let mut last_state_log = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            let cycle_start = Instant::now();
            self.step();

            if let Some(interval) = self.state_interval {
                if last_state_log.elapsed() >= interval {
                    last_state_log = Instant::now();
                    log_state(&self.machine.get_state());
                }
            }

            let elapsed = cycle_start.elapsed();
            if elapsed < self.tick_interval {
                std::thread::sleep(self.tick_interval - elapsed);
            }
        }

        info!(
            "Control loop stopped after {} cycles (violations: {})",
            self.stats.cycle_count, self.stats.timing_violations
        );
    }

    /// Stop the loop and close the backend.
    pub fn shutdown(&mut self) {
        info!("Shutdown requested");
        self.running.store(false, Ordering::SeqCst);
        self.machine.close();
    }
}

fn log_state(state: &MachineState) {
    match serde_json::to_string(state) {
        Ok(json) => info!(target: "blitz_hal::state", "{json}"),
        Err(e) => warn!("Cannot serialize machine state: {e}"),
    }
}

/// True when the process runs under a real-time scheduling policy.
fn detect_rt_mode() -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{SCHED_FIFO, SCHED_RR, sched_getscheduler};
        // SAFETY: sched_getscheduler(0) only queries the calling process.
        let policy = unsafe { sched_getscheduler(0) };
        policy == SCHED_FIFO || policy == SCHED_RR
    }
    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
