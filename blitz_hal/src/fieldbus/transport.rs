//! Bus transports.
//!
//! A transport performs one half-duplex exchange: write a request frame,
//! then collect reply bytes until the expected length arrives, an
//! exception header is recognised, or the read timeout expires.

use blitz_common::machine::config::{BusConfig, Parity};
use blitz_common::machine::error::MachineError;
use serialport::{ClearBuffer, DataBits, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, trace};

use super::rtu::{EXCEPTION_FLAG, EXCEPTION_LEN};

/// One request/reply exchange on the bus.
pub trait BusTransport: Send {
    /// Send `request` and return up to `expected_len` reply bytes.
    ///
    /// A silent slave yields an empty vector, not an error. Errors are
    /// reserved for I/O failures of the link itself.
    fn transact(&mut self, request: &[u8], expected_len: usize) -> Result<Vec<u8>, MachineError>;

    /// Human-readable endpoint name for logs.
    fn endpoint(&self) -> String;
}

/// RS485 adapter opened with `serialport`.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open the configured serial device, 8 data bits.
    pub fn open(settings: &BusConfig) -> Result<Self, MachineError> {
        let parity = match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        };
        let stop_bits = if settings.stop_bits == 2 {
            StopBits::Two
        } else {
            StopBits::One
        };

        let port = serialport::new(&settings.port, settings.baud)
            .data_bits(DataBits::Eight)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(settings.timeout_ms))
            .open()
            .map_err(|e| MachineError::Transport(format!("{}: {e}", settings.port)))?;

        debug!(
            "Opened bus {} @ {} baud ({:?}, {} stop)",
            settings.port, settings.baud, settings.parity, settings.stop_bits
        );
        Ok(Self {
            port,
            name: settings.port.clone(),
        })
    }
}

impl BusTransport for SerialTransport {
    fn transact(&mut self, request: &[u8], expected_len: usize) -> Result<Vec<u8>, MachineError> {
        // Stale bytes from an earlier timed-out exchange would desync framing.
        if let Err(e) = self.port.clear(ClearBuffer::Input) {
            trace!("clear input on {} failed: {e}", self.name);
        }
        self.port.write_all(request)?;
        self.port.flush()?;

        let mut buf = vec![0u8; expected_len];
        let mut filled = 0;
        let mut want = expected_len;
        while filled < want {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled >= 2 && buf[1] & EXCEPTION_FLAG != 0 {
                        want = EXCEPTION_LEN.min(expected_len);
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled.min(want));
        trace!("{} tx {:02X?} rx {:02X?}", self.name, request, buf);
        Ok(buf)
    }

    fn endpoint(&self) -> String {
        self.name.clone()
    }
}
