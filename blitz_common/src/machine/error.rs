//! Runtime error type for links and backends.

use crate::config::ConfigError;
use crate::machine::interlock::Interlock;
use thiserror::Error;

/// Failure kinds of the machine-control layer.
///
/// Internally every link returns `Result<_, MachineError>`; the `MachineIo`
/// boundary logs the error once and reports `false` / `None` upward.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MachineError {
    /// Serial or GPIO open failure, or an I/O error on an open link.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or missing reply, CRC mismatch, Modbus exception.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Emergency or drive alarm blocks the request.
    #[error("Interlock active: {0:?}")]
    Interlock(Interlock),

    /// A motion is already in flight.
    #[error("Motion already in progress")]
    ConcurrentMotion,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Hardware support not compiled in, or backend not registered.
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for MachineError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<ConfigError> for MachineError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_transport() {
        let err: MachineError =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out").into();
        assert!(matches!(err, MachineError::Transport(ref m) if m.contains("timed out")));
    }

    #[test]
    fn interlock_message_names_the_flag() {
        let err = MachineError::Interlock(Interlock::EMERGENCY);
        assert!(err.to_string().contains("EMERGENCY"));
    }
}
