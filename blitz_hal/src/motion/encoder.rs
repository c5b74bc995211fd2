//! Quadrature x4 encoder reader.
//!
//! Both channels raise an interrupt on every edge. The decoder keeps the
//! last A/B levels and the signed count in atomics because edge handlers
//! run on the GPIO library's interrupt threads, one per pin.
//!
//! Decoding rule, with the new level of the channel that moved:
//!
//! | edge on | new level vs other channel | count |
//! |---------|----------------------------|-------|
//! | A       | equal                      | -1    |
//! | A       | different                  | +1    |
//! | B       | equal                      | +1    |
//! | B       | different                  | -1    |
//!
//! An event whose level matches the stored level is a bounce and ignored.

use blitz_common::machine::config::MotionConfig;
use blitz_common::machine::error::MachineError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use tracing::{info, warn};

use super::gpio::{self, InputPin};

const LEVEL_A: u8 = 0b01;
const LEVEL_B: u8 = 0b10;

/// Lock-free quadrature decoder.
#[derive(Debug, Default)]
pub struct QuadratureDecoder {
    levels: AtomicU8,
    count: AtomicI64,
}

impl QuadratureDecoder {
    /// Decoder starting from the given channel levels.
    pub fn new(a: bool, b: bool) -> Self {
        let decoder = Self::default();
        decoder.set_levels(a, b);
        decoder
    }

    pub fn set_levels(&self, a: bool, b: bool) {
        let bits = if a { LEVEL_A } else { 0 } | if b { LEVEL_B } else { 0 };
        self.levels.store(bits, Ordering::Release);
    }

    /// Edge on channel A.
    #[inline]
    pub fn on_a(&self, level: bool) {
        self.edge(LEVEL_A, level);
    }

    /// Edge on channel B.
    #[inline]
    pub fn on_b(&self, level: bool) {
        self.edge(LEVEL_B, level);
    }

    fn edge(&self, channel: u8, level: bool) {
        let other = if channel == LEVEL_A { LEVEL_B } else { LEVEL_A };
        let mut delta = 0i64;
        let _ = self
            .levels
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                if (bits & channel != 0) == level {
                    delta = 0;
                    return None;
                }
                let other_level = bits & other != 0;
                delta = match (channel == LEVEL_A, level == other_level) {
                    (true, true) => -1,
                    (true, false) => 1,
                    (false, true) => 1,
                    (false, false) => -1,
                };
                Some(bits ^ channel)
            });
        if delta != 0 {
            self.count.fetch_add(delta, Ordering::AcqRel);
        }
    }

    #[inline]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn set_count(&self, count: i64) {
        self.count.store(count, Ordering::Release);
    }
}

struct EncoderPins {
    a: Box<dyn InputPin>,
    b: Box<dyn InputPin>,
}

/// Position feedback from a quadrature encoder.
pub struct EncoderReader {
    decoder: Arc<QuadratureDecoder>,
    mm_per_count: f64,
    pins: Mutex<Option<EncoderPins>>,
}

impl EncoderReader {
    /// Open the configured pins with pull-ups. Failure yields a
    /// disconnected reader.
    pub fn open(config: &MotionConfig) -> Self {
        let resolution = config.encoder_resolution();
        let opened = gpio::open_input_pullup(config.encoder_a_pin).and_then(|a| {
            gpio::open_input_pullup(config.encoder_b_pin).map(|b| (a, b))
        });
        let result = opened.and_then(|(a, b)| Self::with_pins(a, b, resolution));
        match result {
            Ok(reader) => {
                info!(
                    "Encoder on GPIO{}/GPIO{} ({} mm/count)",
                    config.encoder_a_pin, config.encoder_b_pin, resolution
                );
                reader
            }
            Err(e) => {
                warn!("Encoder unavailable: {e}");
                Self::disconnected(resolution)
            }
        }
    }

    /// Reader on already-open inputs. Registers both edge handlers.
    pub fn with_pins(
        mut a: Box<dyn InputPin>,
        mut b: Box<dyn InputPin>,
        mm_per_count: f64,
    ) -> Result<Self, MachineError> {
        let decoder = Arc::new(QuadratureDecoder::new(a.is_high(), b.is_high()));

        let on_a = Arc::clone(&decoder);
        a.watch_edges(Box::new(move |level| on_a.on_a(level)))?;
        let on_b = Arc::clone(&decoder);
        if let Err(e) = b.watch_edges(Box::new(move |level| on_b.on_b(level))) {
            a.unwatch();
            return Err(e);
        }

        Ok(Self {
            decoder,
            mm_per_count,
            pins: Mutex::new(Some(EncoderPins { a, b })),
        })
    }

    pub fn disconnected(mm_per_count: f64) -> Self {
        Self {
            decoder: Arc::new(QuadratureDecoder::default()),
            mm_per_count,
            pins: Mutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pins.lock().is_some()
    }

    /// `None` when disconnected.
    pub fn get_position_mm(&self) -> Option<f64> {
        self.is_connected()
            .then(|| self.decoder.count() as f64 * self.mm_per_count)
    }

    pub fn pulse_count(&self) -> i64 {
        self.decoder.count()
    }

    pub fn reset(&self) {
        self.decoder.set_count(0);
        info!("Encoder reset");
    }

    /// Calibrate the counter so the current position reads `position_mm`.
    pub fn set_position(&self, position_mm: f64) {
        self.decoder
            .set_count((position_mm / self.mm_per_count).round() as i64);
    }

    /// Unregister the interrupts and release the pins. Idempotent.
    pub fn close(&self) {
        if let Some(mut pins) = self.pins.lock().take() {
            pins.a.unwatch();
            pins.b.unwatch();
            info!("Encoder closed");
        }
    }
}

impl Drop for EncoderReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::gpio::MemoryInput;

    /// Gray sequence for forward motion: 00 -> 10 -> 11 -> 01 -> 00 (A, B).
    const FORWARD: [(bool, bool); 4] = [(false, false), (true, false), (true, true), (false, true)];

    #[test]
    fn all_single_edge_transitions() {
        // (start A, start B, channel moved is A, expected delta)
        let table = [
            (false, false, true, 1),
            (true, false, false, 1),
            (true, true, true, 1),
            (false, true, false, 1),
            (false, false, false, -1),
            (false, true, true, -1),
            (true, true, false, -1),
            (true, false, true, -1),
        ];
        for (a, b, on_a, expected) in table {
            let dec = QuadratureDecoder::new(a, b);
            if on_a {
                dec.on_a(!a);
            } else {
                dec.on_b(!b);
            }
            assert_eq!(dec.count(), expected, "from ({a}, {b}) edge on A={on_a}");
        }
    }

    #[test]
    fn full_cycles_count_four_per_period() {
        let dec = QuadratureDecoder::new(false, false);
        for _ in 0..3 {
            for (a, b) in FORWARD.iter().cycle().skip(1).take(4) {
                dec.on_a(*a);
                dec.on_b(*b);
            }
        }
        assert_eq!(dec.count(), 12);

        for _ in 0..3 {
            for (a, b) in FORWARD.iter().rev() {
                dec.on_b(*b);
                dec.on_a(*a);
            }
        }
        assert_eq!(dec.count(), 0);
    }

    #[test]
    fn bounce_is_ignored() {
        let dec = QuadratureDecoder::new(false, false);
        dec.on_a(true);
        dec.on_a(true);
        dec.on_a(true);
        dec.on_b(false);
        assert_eq!(dec.count(), 1);
    }

    #[test]
    fn reader_converts_counts_to_mm() {
        let a = MemoryInput::new(false);
        let b = MemoryInput::new(false);
        let enc = EncoderReader::with_pins(Box::new(a.clone()), Box::new(b.clone()), 0.5).unwrap();
        assert!(enc.is_connected());

        for _ in 0..10 {
            a.set_level(true);
            b.set_level(true);
            a.set_level(false);
            b.set_level(false);
        }
        assert_eq!(enc.pulse_count(), 40);
        assert_eq!(enc.get_position_mm(), Some(20.0));

        enc.set_position(250.2);
        assert_eq!(enc.pulse_count(), 500);
        enc.reset();
        assert_eq!(enc.get_position_mm(), Some(0.0));
    }

    #[test]
    fn close_unregisters_interrupts() {
        let a = MemoryInput::new(true);
        let b = MemoryInput::new(true);
        let enc = EncoderReader::with_pins(Box::new(a.clone()), Box::new(b.clone()), 0.1).unwrap();
        assert!(a.is_watched() && b.is_watched());

        enc.close();
        assert!(!a.is_watched() && !b.is_watched());
        assert_eq!(enc.get_position_mm(), None);
        a.set_level(false);
        assert_eq!(enc.pulse_count(), 0);
    }

    #[cfg(not(feature = "rpi"))]
    #[test]
    fn open_without_gpio_degrades() {
        let enc = EncoderReader::open(&MotionConfig::default());
        assert!(!enc.is_connected());
        assert_eq!(enc.get_position_mm(), None);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn count_tracks_net_quarter_steps(steps in proptest::collection::vec(any::<bool>(), 0..400)) {
                let dec = QuadratureDecoder::new(false, false);
                let mut phase = 0usize;
                let mut net = 0i64;
                for forward in steps {
                    let (a, b) = FORWARD[phase];
                    phase = if forward { (phase + 1) % 4 } else { (phase + 3) % 4 };
                    let (na, nb) = FORWARD[phase];
                    if na != a {
                        dec.on_a(na);
                    } else {
                        dec.on_b(nb);
                    }
                    net += if forward { 1 } else { -1 };
                }
                prop_assert_eq!(dec.count(), net);
            }
        }
    }
}
