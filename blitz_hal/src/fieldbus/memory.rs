//! In-memory relay modules.
//!
//! `MemoryBus` answers Modbus RTU frames the way the physical 8-channel
//! modules do, so the gateway and the real backend can run without a
//! serial adapter. Handles are cheap clones sharing one slave image;
//! faults (dead link, silent unit) are injected at runtime.

use blitz_common::consts::MODULE_WIDTH;
use blitz_common::machine::error::MachineError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::rtu::{self, FrameError, ILLEGAL_DATA_ADDRESS, READ_COILS, Request};
use super::transport::BusTransport;

#[derive(Debug, Clone, Copy, Default)]
struct UnitImage {
    coils: [bool; MODULE_WIDTH],
    inputs: [bool; MODULE_WIDTH],
}

#[derive(Debug, Default)]
struct SlaveSet {
    units: BTreeMap<u8, UnitImage>,
    silent: BTreeSet<u8>,
    link_down: bool,
    transactions: u64,
}

/// Shared handle to a set of simulated slaves.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<SlaveSet>>,
}

impl MemoryBus {
    /// Slaves answering at the given unit ids, all bits clear.
    pub fn new(units: &[u8]) -> Self {
        let set = SlaveSet {
            units: units.iter().map(|&u| (u, UnitImage::default())).collect(),
            ..SlaveSet::default()
        };
        Self {
            inner: Arc::new(Mutex::new(set)),
        }
    }

    /// Transport endpoint for an `RtuClient`.
    pub fn transport(&self) -> Box<dyn BusTransport> {
        Box::new(MemoryPort { bus: self.clone() })
    }

    pub fn set_input(&self, unit: u8, index: usize, value: bool) {
        if let Some(bit) = self
            .inner
            .lock()
            .units
            .get_mut(&unit)
            .and_then(|u| u.inputs.get_mut(index))
        {
            *bit = value;
        }
    }

    pub fn set_coil(&self, unit: u8, index: usize, value: bool) {
        if let Some(bit) = self
            .inner
            .lock()
            .units
            .get_mut(&unit)
            .and_then(|u| u.coils.get_mut(index))
        {
            *bit = value;
        }
    }

    pub fn coil(&self, unit: u8, index: usize) -> bool {
        self.inner
            .lock()
            .units
            .get(&unit)
            .and_then(|u| u.coils.get(index).copied())
            .unwrap_or(false)
    }

    pub fn coils(&self, unit: u8) -> [bool; MODULE_WIDTH] {
        self.inner
            .lock()
            .units
            .get(&unit)
            .map(|u| u.coils)
            .unwrap_or_default()
    }

    /// Every exchange fails with an I/O error while set.
    pub fn set_link_down(&self, down: bool) {
        self.inner.lock().link_down = down;
    }

    /// The unit stops answering while set.
    pub fn set_unit_silent(&self, unit: u8, silent: bool) {
        let mut set = self.inner.lock();
        if silent {
            set.silent.insert(unit);
        } else {
            set.silent.remove(&unit);
        }
    }

    /// Exchanges seen so far, including failed ones.
    pub fn transactions(&self) -> u64 {
        self.inner.lock().transactions
    }

    fn serve(&self, frame: &[u8]) -> Result<Vec<u8>, MachineError> {
        let mut set = self.inner.lock();
        set.transactions += 1;
        if set.link_down {
            return Err(MachineError::Transport("bus link down".to_string()));
        }

        let request = match rtu::parse_request(frame) {
            Ok(r) => r,
            Err(FrameError::Exception { function, code }) => {
                return Ok(rtu::exception_reply(frame[0], function, code));
            }
            // Garbage is ignored on a real line.
            Err(_) => return Ok(Vec::new()),
        };

        let unit = request.unit();
        if set.silent.contains(&unit) {
            return Ok(Vec::new());
        }
        let Some(image) = set.units.get_mut(&unit) else {
            return Ok(Vec::new());
        };

        let in_range = |start: u16, count: usize| usize::from(start) + count <= MODULE_WIDTH;

        let reply = match request {
            Request::ReadBits {
                function,
                start,
                count,
                ..
            } => {
                if !in_range(start, usize::from(count)) {
                    rtu::exception_reply(unit, function, ILLEGAL_DATA_ADDRESS)
                } else {
                    let bank = if function == READ_COILS {
                        &image.coils
                    } else {
                        &image.inputs
                    };
                    let from = usize::from(start);
                    rtu::read_reply(unit, function, &bank[from..from + usize::from(count)])
                }
            }
            Request::WriteCoil { index, on, .. } => {
                if !in_range(index, 1) {
                    rtu::exception_reply(unit, rtu::WRITE_SINGLE_COIL, ILLEGAL_DATA_ADDRESS)
                } else {
                    image.coils[usize::from(index)] = on;
                    rtu::write_reply(frame)
                }
            }
            Request::WriteCoils { start, values, .. } => {
                if !in_range(start, values.len()) {
                    rtu::exception_reply(unit, rtu::WRITE_MULTIPLE_COILS, ILLEGAL_DATA_ADDRESS)
                } else {
                    let from = usize::from(start);
                    image.coils[from..from + values.len()].copy_from_slice(&values);
                    rtu::write_reply(frame)
                }
            }
        };
        Ok(reply)
    }
}

struct MemoryPort {
    bus: MemoryBus,
}

impl BusTransport for MemoryPort {
    fn transact(&mut self, request: &[u8], expected_len: usize) -> Result<Vec<u8>, MachineError> {
        let mut reply = self.bus.serve(request)?;
        reply.truncate(expected_len);
        Ok(reply)
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}
