//! GPIO seam for the pulse generator and the encoder reader.
//!
//! Production pins come from `rppal` (feature `rpi`). Without the feature
//! [`open_output`] and [`open_input_pullup`] return
//! [`MachineError::Unavailable`] and the motion hardware stays disconnected.
//! [`MemoryOutput`] and [`MemoryInput`] stand in for real pins in tests.

use blitz_common::machine::error::MachineError;
use parking_lot::Mutex;
use std::sync::Arc;

/// Digital output.
pub trait OutputPin: Send {
    fn write(&mut self, high: bool);

    fn set_high(&mut self) {
        self.write(true);
    }

    fn set_low(&mut self) {
        self.write(false);
    }
}

/// Edge callback; receives the level after the edge.
pub type EdgeHandler = Box<dyn FnMut(bool) + Send + 'static>;

/// Digital input with edge interrupts.
pub trait InputPin: Send {
    fn is_high(&self) -> bool;

    /// Deliver both edges to `handler` on the interrupt thread.
    fn watch_edges(&mut self, handler: EdgeHandler) -> Result<(), MachineError>;

    /// Unregister the edge handler. Idempotent.
    fn unwatch(&mut self);
}

#[cfg(feature = "rpi")]
mod rpi {
    use super::{EdgeHandler, InputPin, OutputPin};
    use blitz_common::machine::error::MachineError;
    use rppal::gpio::{Event, Gpio, Trigger};

    fn gpio_err(pin: u8, e: rppal::gpio::Error) -> MachineError {
        MachineError::Transport(format!("GPIO{pin}: {e}"))
    }

    pub struct RpiOutput(rppal::gpio::OutputPin);

    impl OutputPin for RpiOutput {
        fn write(&mut self, high: bool) {
            if high {
                self.0.set_high();
            } else {
                self.0.set_low();
            }
        }
    }

    pub struct RpiInput {
        pin: rppal::gpio::InputPin,
        number: u8,
    }

    impl InputPin for RpiInput {
        fn is_high(&self) -> bool {
            self.pin.is_high()
        }

        fn watch_edges(&mut self, mut handler: EdgeHandler) -> Result<(), MachineError> {
            let number = self.number;
            self.pin
                .set_async_interrupt(Trigger::Both, None, move |event: Event| {
                    handler(matches!(event.trigger, Trigger::RisingEdge));
                })
                .map_err(|e| gpio_err(number, e))
        }

        fn unwatch(&mut self) {
            let _ = self.pin.clear_async_interrupt();
        }
    }

    pub fn open_output(pin: u8) -> Result<RpiOutput, MachineError> {
        let gpio = Gpio::new().map_err(|e| gpio_err(pin, e))?;
        let mut out = gpio.get(pin).map_err(|e| gpio_err(pin, e))?.into_output();
        out.set_low();
        Ok(RpiOutput(out))
    }

    pub fn open_input_pullup(pin: u8) -> Result<RpiInput, MachineError> {
        let gpio = Gpio::new().map_err(|e| gpio_err(pin, e))?;
        let input = gpio.get(pin).map_err(|e| gpio_err(pin, e))?.into_input_pullup();
        Ok(RpiInput {
            pin: input,
            number: pin,
        })
    }
}

/// Open a BCM pin as output, driven low.
#[cfg(feature = "rpi")]
pub fn open_output(pin: u8) -> Result<Box<dyn OutputPin>, MachineError> {
    Ok(Box::new(rpi::open_output(pin)?))
}

/// Open a BCM pin as output, driven low.
#[cfg(not(feature = "rpi"))]
pub fn open_output(pin: u8) -> Result<Box<dyn OutputPin>, MachineError> {
    Err(MachineError::Unavailable(format!(
        "GPIO{pin}: built without the `rpi` feature"
    )))
}

/// Open a BCM pin as input with the internal pull-up.
#[cfg(feature = "rpi")]
pub fn open_input_pullup(pin: u8) -> Result<Box<dyn InputPin>, MachineError> {
    Ok(Box::new(rpi::open_input_pullup(pin)?))
}

/// Open a BCM pin as input with the internal pull-up.
#[cfg(not(feature = "rpi"))]
pub fn open_input_pullup(pin: u8) -> Result<Box<dyn InputPin>, MachineError> {
    Err(MachineError::Unavailable(format!(
        "GPIO{pin}: built without the `rpi` feature"
    )))
}

#[derive(Debug, Default)]
struct OutputLog {
    level: bool,
    rising_edges: u64,
    writes: u64,
}

/// Recording output pin. Clones observe the same pin.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    log: Arc<Mutex<OutputLog>>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> bool {
        self.log.lock().level
    }

    /// Low-to-high transitions seen so far.
    pub fn rising_edges(&self) -> u64 {
        self.log.lock().rising_edges
    }

    pub fn writes(&self) -> u64 {
        self.log.lock().writes
    }
}

impl OutputPin for MemoryOutput {
    fn write(&mut self, high: bool) {
        let mut log = self.log.lock();
        if high && !log.level {
            log.rising_edges += 1;
        }
        log.level = high;
        log.writes += 1;
    }
}

#[derive(Default)]
struct InputShared {
    level: bool,
    handler: Option<EdgeHandler>,
}

/// Input pin driven from test code. Clones share the pin.
#[derive(Clone, Default)]
pub struct MemoryInput {
    shared: Arc<Mutex<InputShared>>,
}

impl MemoryInput {
    /// Pin idling at `level`.
    pub fn new(level: bool) -> Self {
        let pin = Self::default();
        pin.shared.lock().level = level;
        pin
    }

    /// Set the level and raise an interrupt, even when unchanged
    /// (contact bounce).
    pub fn set_level(&self, level: bool) {
        let mut shared = self.shared.lock();
        shared.level = level;
        if let Some(handler) = shared.handler.as_mut() {
            handler(level);
        }
    }

    pub fn is_watched(&self) -> bool {
        self.shared.lock().handler.is_some()
    }
}

impl InputPin for MemoryInput {
    fn is_high(&self) -> bool {
        self.shared.lock().level
    }

    fn watch_edges(&mut self, handler: EdgeHandler) -> Result<(), MachineError> {
        self.shared.lock().handler = Some(handler);
        Ok(())
    }

    fn unwatch(&mut self) {
        self.shared.lock().handler = None;
    }
}
