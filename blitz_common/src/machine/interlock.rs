//! Interlock flags.
//!
//! Emergency and drive alarm each gate every motion-issuing operation.
//! The flags are written from the control thread, the drive receive worker
//! and the homing worker, so they live in one atomic word.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU8, Ordering};

bitflags! {
    /// Active interlocks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interlock: u8 {
        /// Emergency input seen. Latched until an explicit reset.
        const EMERGENCY = 0x01;
        /// Drive reported an alarm.
        const ALARM     = 0x02;
    }
}

/// Lock-free holder for [`Interlock`] flags.
#[derive(Debug, Default)]
pub struct InterlockState {
    bits: AtomicU8,
}

impl InterlockState {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current flags.
    pub fn get(&self) -> Interlock {
        Interlock::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    /// Raise `flags`. Returns true if any of them was not already set.
    pub fn raise(&self, flags: Interlock) -> bool {
        let prev = self.bits.fetch_or(flags.bits(), Ordering::AcqRel);
        prev & flags.bits() != flags.bits()
    }

    /// Clear `flags`.
    pub fn clear(&self, flags: Interlock) {
        self.bits.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// True if any interlock is active.
    pub fn blocks_motion(&self) -> bool {
        !self.get().is_empty()
    }

    pub fn emergency(&self) -> bool {
        self.get().contains(Interlock::EMERGENCY)
    }

    pub fn alarm(&self) -> bool {
        self.get().contains(Interlock::ALARM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn raise_reports_new_flags_only() {
        let state = InterlockState::new();
        assert!(state.raise(Interlock::EMERGENCY));
        assert!(!state.raise(Interlock::EMERGENCY));
        assert!(state.raise(Interlock::EMERGENCY | Interlock::ALARM));
        assert!(state.emergency());
        assert!(state.alarm());
    }

    #[test]
    fn clear_is_per_flag() {
        let state = InterlockState::new();
        state.raise(Interlock::all());
        state.clear(Interlock::ALARM);
        assert!(state.emergency());
        assert!(!state.alarm());
        state.clear(Interlock::EMERGENCY);
        assert!(!state.blocks_motion());
    }

    #[test]
    fn visible_across_threads() {
        let state = Arc::new(InterlockState::new());
        let worker = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                state.raise(Interlock::ALARM);
            })
        };
        worker.join().unwrap();
        assert_eq!(state.get(), Interlock::ALARM);
    }
}
