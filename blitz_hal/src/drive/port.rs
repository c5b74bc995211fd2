//! Line-oriented byte ports for the drive link.
//!
//! [`SerialLine`] wraps a `serialport` handle; [`MemoryLine`] is an
//! in-memory duplex used for tests and dry runs, optionally answering each
//! written line through a responder closure.

use blitz_common::machine::error::MachineError;
use parking_lot::{Condvar, Mutex};
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Byte stream to the drive that can hand out a second handle for a
/// dedicated reader thread.
pub trait LinePort: Read + Write + Send {
    fn try_clone_line(&self) -> Result<Box<dyn LinePort>, MachineError>;

    fn name(&self) -> String;
}

/// Serial device opened through `serialport`.
pub struct SerialLine {
    port: Box<dyn SerialPort>,
}

impl SerialLine {
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self, MachineError> {
        let port = serialport::new(path, baud)
            .timeout(timeout)
            .open()
            .map_err(|e| MachineError::Transport(format!("{path}: {e}")))?;
        Ok(Self { port })
    }
}

impl Read for SerialLine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl LinePort for SerialLine {
    fn try_clone_line(&self) -> Result<Box<dyn LinePort>, MachineError> {
        let port = self
            .port
            .try_clone()
            .map_err(|e| MachineError::Transport(format!("clone drive port: {e}")))?;
        Ok(Box::new(Self { port }))
    }

    fn name(&self) -> String {
        self.port.name().unwrap_or_else(|| "serial".to_string())
    }
}

/// Produces the device's reply to one host line, if any.
pub type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

#[derive(Default)]
struct LineState {
    rx: VecDeque<u8>,
    partial: Vec<u8>,
    written: Vec<String>,
    responder: Option<Responder>,
    hung_up: bool,
}

struct LineShared {
    state: Mutex<LineState>,
    ready: Condvar,
}

/// In-memory drive line. Clones share the same buffers.
#[derive(Clone)]
pub struct MemoryLine {
    shared: Arc<LineShared>,
    read_timeout: Duration,
}

impl Default for MemoryLine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLine {
    /// Silent device, 20 ms read timeout.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LineShared {
                state: Mutex::new(LineState::default()),
                ready: Condvar::new(),
            }),
            read_timeout: Duration::from_millis(20),
        }
    }

    /// Device answering each host line through `responder`.
    pub fn with_responder(responder: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        let line = Self::new();
        line.shared.state.lock().responder = Some(Box::new(responder));
        line
    }

    /// Device sends `text` followed by CRLF.
    pub fn push_line(&self, text: &str) {
        self.push_bytes(format!("{text}\r\n").as_bytes());
    }

    /// Device sends raw bytes.
    pub fn push_bytes(&self, bytes: &[u8]) {
        let mut state = self.shared.state.lock();
        state.rx.extend(bytes);
        self.shared.ready.notify_all();
    }

    /// Lines the host has written, without terminators.
    pub fn written(&self) -> Vec<String> {
        self.shared.state.lock().written.clone()
    }

    /// Subsequent reads and writes fail with `BrokenPipe`.
    pub fn hang_up(&self) {
        self.shared.state.lock().hung_up = true;
        self.shared.ready.notify_all();
    }
}

impl Read for MemoryLine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.rx.is_empty() && !state.hung_up {
            let _ = self.shared.ready.wait_for(&mut state, self.read_timeout);
        }
        if state.hung_up {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line hung up"));
        }
        if state.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        let n = buf.len().min(state.rx.len());
        for (dst, src) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for MemoryLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        if state.hung_up {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "line hung up"));
        }
        state.partial.extend_from_slice(buf);
        while let Some(pos) = state.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = state.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            let reply = state.responder.as_mut().and_then(|r| r(&line));
            state.written.push(line);
            if let Some(reply) = reply {
                state.rx.extend(format!("{reply}\r\n").as_bytes());
                self.shared.ready.notify_all();
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LinePort for MemoryLine {
    fn try_clone_line(&self) -> Result<Box<dyn LinePort>, MachineError> {
        Ok(Box::new(self.clone()))
    }

    fn name(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_answers_each_line() {
        let mut line = MemoryLine::with_responder(|cmd| Some(format!("OK {cmd}")));
        line.write_all(b"ST\r\n?POS\r\n").unwrap();
        assert_eq!(line.written(), vec!["ST", "?POS"]);

        let mut buf = [0u8; 64];
        let n = line.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"OK ST\r\nOK ?POS\r\n");
    }

    #[test]
    fn empty_read_times_out() {
        let mut line = MemoryLine::new();
        let mut buf = [0u8; 8];
        let err = line.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn clones_share_buffers() {
        let line = MemoryLine::new();
        let mut reader = line.try_clone_line().unwrap();
        line.push_line("ALARM 12");
        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ALARM 12\r\n");
    }

    #[test]
    fn hang_up_breaks_the_pipe() {
        let mut line = MemoryLine::new();
        line.hang_up();
        assert_eq!(
            line.write(b"ST\r\n").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
