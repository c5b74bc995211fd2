//! `MachineIo` capability trait.
//!
//! Both backends (simulation, real hardware) implement this trait and the
//! orchestration layer drives the machine through it alone.
//!
//! # Threading
//!
//! `tick()` and every `command_*` call come from one control thread.
//! Backends compose with their own workers (pulse loop, drive receive
//! loop, encoder interrupts, homing) internally.
//!
//! # Failure reporting
//!
//! Link errors are logged once inside the backend and surface here as
//! `false` / `None`. Nothing on this surface panics or returns an error.

use crate::machine::types::{HeadAngles, MachineState};

/// Homing completion callback: `(success, message)`.
pub type HomingCallback = Box<dyn FnOnce(bool, String) + Send + 'static>;

/// Command and query surface of the cutting machine.
pub trait MachineIo: Send {
    /// Backend identifier (e.g. `"simulation"`, `"real"`).
    fn backend_name(&self) -> &'static str;

    /// Current carriage position in mm. `None` if it cannot be determined.
    fn get_position(&self) -> Option<f64>;

    /// True while a positioning move is in flight.
    fn is_positioning_active(&self) -> bool;

    /// Logical input by name. Unknown names read `false`.
    fn get_input(&self, name: &str) -> bool;

    /// Position the carriage at `length_mm` (clamped to the travel range)
    /// and set the head angles. Releases the brake.
    ///
    /// Rejected while an interlock is active or another motion is in flight.
    fn command_move(&mut self, length_mm: f64, angles: HeadAngles) -> bool;

    /// Stop any motion and lock the brake.
    fn command_stop(&mut self) -> bool;

    fn command_lock_brake(&mut self) -> bool;

    fn command_release_brake(&mut self) -> bool;

    fn command_set_clutch(&mut self, engaged: bool) -> bool;

    fn command_set_head_angles(&mut self, angles: HeadAngles) -> bool;

    fn command_set_presser_locks(&mut self, left: bool, right: bool) -> bool;

    /// `None` leaves that side unchanged.
    fn command_set_blade_inhibit(&mut self, left: Option<bool>, right: Option<bool>) -> bool;

    /// Start the homing sequence in the background. `on_done` is invoked
    /// exactly once, possibly before this call returns.
    fn do_homing(&mut self, on_done: HomingCallback);

    /// Periodic update: poll inputs, advance position models, re-evaluate
    /// interlocks.
    fn tick(&mut self);

    /// Fresh snapshot of the machine.
    fn get_state(&self) -> MachineState;

    /// Clear the emergency latch. Fails while the emergency input is still
    /// asserted.
    fn reset_emergency(&mut self) -> bool;

    /// Clear a drive alarm.
    fn clear_alarm(&mut self) -> bool {
        false
    }

    /// Release serial and GPIO handles and stop workers. Idempotent.
    fn close(&mut self);

    // ── Simulation hooks ────────────────────────────────────────────
    // No-ops on hardware backends.

    /// Synthesize one blade pulse, cleared on the next tick.
    fn sim_cut_pulse(&mut self) {}

    /// Synthesize one start button press, cleared on the next tick.
    fn sim_start_pulse(&mut self) {}

    /// Set the right-blade-out level input.
    fn sim_dx_blade_out(&mut self, _on: bool) {}

    /// Assert or release the emergency input.
    fn sim_set_emergency(&mut self, _on: bool) {}
}
