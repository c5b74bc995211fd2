//! Raw motion hardware: step/direction output and quadrature feedback.
//!
//! - [`pulse`] - `PulseGenerator`, one worker thread per motion
//! - [`encoder`] - `EncoderReader` and the lock-free `QuadratureDecoder`
//! - [`gpio`] - pin traits, `rppal` backing (feature `rpi`) and test pins

pub mod encoder;
pub mod gpio;
pub mod pulse;

pub use encoder::{EncoderReader, QuadratureDecoder};
pub use gpio::{InputPin, MemoryInput, MemoryOutput, OutputPin};
pub use pulse::{Direction, PulseGenerator, PulseProfile};
