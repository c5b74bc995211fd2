//! Modbus RTU master.

use blitz_common::machine::error::MachineError;

use super::rtu::{self, READ_COILS, READ_DISCRETE_INPUTS, WRITE_REPLY_LEN};
use super::transport::BusTransport;

/// Modbus master over one transport. Callers serialize access.
pub struct RtuClient {
    transport: Box<dyn BusTransport>,
}

impl RtuClient {
    pub fn new(transport: Box<dyn BusTransport>) -> Self {
        Self { transport }
    }

    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Function 0x01.
    pub fn read_coils(&mut self, unit: u8, start: u16, count: u16) -> Result<Vec<bool>, MachineError> {
        self.read_bits(unit, READ_COILS, start, count)
    }

    /// Function 0x02.
    pub fn read_discrete_inputs(
        &mut self,
        unit: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, MachineError> {
        self.read_bits(unit, READ_DISCRETE_INPUTS, start, count)
    }

    fn read_bits(
        &mut self,
        unit: u8,
        function: u8,
        start: u16,
        count: u16,
    ) -> Result<Vec<bool>, MachineError> {
        let request = rtu::read_request(unit, function, start, count);
        let reply = self
            .transport
            .transact(&request, rtu::read_reply_len(count))?;
        Ok(rtu::parse_read_reply(&reply, unit, function, count)?)
    }

    /// Function 0x05. `Ok` only when the slave echoed the request.
    pub fn write_single_coil(&mut self, unit: u8, index: u16, on: bool) -> Result<(), MachineError> {
        let request = rtu::write_coil_request(unit, index, on);
        let reply = self.transport.transact(&request, WRITE_REPLY_LEN)?;
        Ok(rtu::check_write_reply(&reply, &request)?)
    }

    /// Function 0x0F.
    pub fn write_multiple_coils(
        &mut self,
        unit: u8,
        start: u16,
        values: &[bool],
    ) -> Result<(), MachineError> {
        let request = rtu::write_coils_request(unit, start, values);
        let reply = self.transport.transact(&request, WRITE_REPLY_LEN)?;
        Ok(rtu::check_write_reply(&reply, &request)?)
    }
}
