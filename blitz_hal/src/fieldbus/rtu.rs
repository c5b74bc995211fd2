//! Modbus RTU frame codec.
//!
//! Only the function codes the relay modules implement:
//! 0x01 read coils, 0x02 read discrete inputs, 0x05 write single coil,
//! 0x0F write multiple coils.
//!
//! ```text
//! request  : unit | fn | start (u16 BE) | count or value (u16 BE) | crc (u16 LE)
//! read rsp : unit | fn | byte_count | data ... | crc (u16 LE)
//! write rsp: echo of the request header | crc
//! exception: unit | fn | 0x80 | code | crc
//! ```
//!
//! Bits are packed LSB-first within each data byte.

use blitz_common::machine::error::MachineError;
use thiserror::Error;

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Set on the function code of an exception reply.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Exception: function not supported.
pub const ILLEGAL_FUNCTION: u8 = 0x01;
/// Exception: address out of range.
pub const ILLEGAL_DATA_ADDRESS: u8 = 0x02;
/// Exception: bad value or count.
pub const ILLEGAL_DATA_VALUE: u8 = 0x03;

pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Length of an exception reply, also the shortest valid reply.
pub const EXCEPTION_LEN: usize = 5;

/// Length of a write reply (0x05 and 0x0F).
pub const WRITE_REPLY_LEN: usize = 8;

/// Frame-level decode failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("no reply")]
    NoReply,

    #[error("short frame ({0} bytes)")]
    Short(usize),

    #[error("CRC mismatch (got {got:#06x}, computed {computed:#06x})")]
    Crc { got: u16, computed: u16 },

    #[error("reply from unit {got}, expected {expected}")]
    Unit { got: u8, expected: u8 },

    #[error("reply function {got:#04x}, expected {expected:#04x}")]
    Function { got: u8, expected: u8 },

    #[error("modbus exception {code:#04x} on function {function:#04x}")]
    Exception { function: u8, code: u8 },

    #[error("byte count {got}, expected {expected}")]
    ByteCount { got: usize, expected: usize },

    #[error("write echo mismatch")]
    EchoMismatch,

    #[error("unsupported function {0:#04x}")]
    Unsupported(u8),
}

impl From<FrameError> for MachineError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::NoReply | FrameError::Short(_) => {
                MachineError::Transport(format!("bus timeout: {e}"))
            }
            other => MachineError::Protocol(other.to_string()),
        }
    }
}

/// CRC-16/MODBUS (init 0xFFFF, reflected poly 0xA001).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn seal(mut frame: Vec<u8>) -> Vec<u8> {
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

fn verify_crc(frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() < 3 {
        return Err(FrameError::Short(frame.len()));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let got = u16::from_le_bytes([tail[0], tail[1]]);
    let computed = crc16(body);
    if got != computed {
        return Err(FrameError::Crc { got, computed });
    }
    Ok(())
}

/// Number of data bytes carrying `count` bits.
#[inline]
pub const fn bytes_for(count: u16) -> usize {
    (count as usize).div_ceil(8)
}

/// Pack bits LSB-first.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpack `count` bits LSB-first. Missing bytes read as `false`.
pub fn unpack_bits(data: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| data.get(i / 8).is_some_and(|b| (b >> (i % 8)) & 0x01 != 0))
        .collect()
}

// ─── Master side ────────────────────────────────────────────────────

/// 0x01 / 0x02 request.
pub fn read_request(unit: u8, function: u8, start: u16, count: u16) -> Vec<u8> {
    let mut frame = vec![unit, function];
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&count.to_be_bytes());
    seal(frame)
}

/// 0x05 request.
pub fn write_coil_request(unit: u8, index: u16, on: bool) -> Vec<u8> {
    let value = if on { COIL_ON } else { COIL_OFF };
    let mut frame = vec![unit, WRITE_SINGLE_COIL];
    frame.extend_from_slice(&index.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    seal(frame)
}

/// 0x0F request.
pub fn write_coils_request(unit: u8, start: u16, values: &[bool]) -> Vec<u8> {
    let data = pack_bits(values);
    let mut frame = vec![unit, WRITE_MULTIPLE_COILS];
    frame.extend_from_slice(&start.to_be_bytes());
    frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
    frame.push(data.len() as u8);
    frame.extend_from_slice(&data);
    seal(frame)
}

/// Expected length of a read reply for `count` bits.
#[inline]
pub const fn read_reply_len(count: u16) -> usize {
    3 + bytes_for(count) + 2
}

fn check_exception(frame: &[u8], function: u8) -> Result<(), FrameError> {
    if frame.len() >= EXCEPTION_LEN && frame[1] == function | EXCEPTION_FLAG {
        verify_crc(&frame[..EXCEPTION_LEN])?;
        return Err(FrameError::Exception {
            function,
            code: frame[2],
        });
    }
    Ok(())
}

/// Decode a 0x01 / 0x02 reply into `count` bits.
pub fn parse_read_reply(
    frame: &[u8],
    unit: u8,
    function: u8,
    count: u16,
) -> Result<Vec<bool>, FrameError> {
    if frame.is_empty() {
        return Err(FrameError::NoReply);
    }
    if frame.len() < EXCEPTION_LEN {
        return Err(FrameError::Short(frame.len()));
    }
    check_exception(frame, function)?;

    let expected = bytes_for(count);
    let byte_count = usize::from(frame[2]);
    if byte_count != expected {
        return Err(FrameError::ByteCount {
            got: byte_count,
            expected,
        });
    }
    let total = 3 + byte_count + 2;
    if frame.len() < total {
        return Err(FrameError::Short(frame.len()));
    }
    let frame = &frame[..total];
    verify_crc(frame)?;

    if frame[0] != unit {
        return Err(FrameError::Unit {
            got: frame[0],
            expected: unit,
        });
    }
    if frame[1] != function {
        return Err(FrameError::Function {
            got: frame[1],
            expected: function,
        });
    }
    Ok(unpack_bits(&frame[3..3 + byte_count], usize::from(count)))
}

/// Confirm a write reply echoes the request header.
pub fn check_write_reply(frame: &[u8], request: &[u8]) -> Result<(), FrameError> {
    if frame.is_empty() {
        return Err(FrameError::NoReply);
    }
    if request.len() < 6 {
        return Err(FrameError::Short(request.len()));
    }
    if frame.len() < EXCEPTION_LEN {
        return Err(FrameError::Short(frame.len()));
    }
    check_exception(frame, request[1])?;
    if frame.len() < WRITE_REPLY_LEN {
        return Err(FrameError::Short(frame.len()));
    }
    let frame = &frame[..WRITE_REPLY_LEN];
    verify_crc(frame)?;
    if frame[..6] != request[..6] {
        return Err(FrameError::EchoMismatch);
    }
    Ok(())
}

// ─── Slave side ─────────────────────────────────────────────────────

/// Decoded master request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadBits {
        unit: u8,
        function: u8,
        start: u16,
        count: u16,
    },
    WriteCoil {
        unit: u8,
        index: u16,
        on: bool,
    },
    WriteCoils {
        unit: u8,
        start: u16,
        values: Vec<bool>,
    },
}

impl Request {
    pub fn unit(&self) -> u8 {
        match self {
            Self::ReadBits { unit, .. } | Self::WriteCoil { unit, .. } | Self::WriteCoils { unit, .. } => {
                *unit
            }
        }
    }
}

/// Decode a request frame. A bad single-coil value is reported as an
/// exception with `ILLEGAL_DATA_VALUE`.
pub fn parse_request(frame: &[u8]) -> Result<Request, FrameError> {
    if frame.len() < 8 {
        return Err(FrameError::Short(frame.len()));
    }
    let unit = frame[0];
    let function = frame[1];
    let start = u16::from_be_bytes([frame[2], frame[3]]);
    let word = u16::from_be_bytes([frame[4], frame[5]]);

    match function {
        READ_COILS | READ_DISCRETE_INPUTS => {
            verify_crc(&frame[..8])?;
            Ok(Request::ReadBits {
                unit,
                function,
                start,
                count: word,
            })
        }
        WRITE_SINGLE_COIL => {
            verify_crc(&frame[..8])?;
            let on = match word {
                COIL_ON => true,
                COIL_OFF => false,
                _ => {
                    return Err(FrameError::Exception {
                        function,
                        code: ILLEGAL_DATA_VALUE,
                    });
                }
            };
            Ok(Request::WriteCoil {
                unit,
                index: start,
                on,
            })
        }
        WRITE_MULTIPLE_COILS => {
            let byte_count = usize::from(frame[6]);
            let total = 7 + byte_count + 2;
            if frame.len() < total {
                return Err(FrameError::Short(frame.len()));
            }
            verify_crc(&frame[..total])?;
            if byte_count != bytes_for(word) {
                return Err(FrameError::ByteCount {
                    got: byte_count,
                    expected: bytes_for(word),
                });
            }
            Ok(Request::WriteCoils {
                unit,
                start,
                values: unpack_bits(&frame[7..7 + byte_count], usize::from(word)),
            })
        }
        other => Err(FrameError::Unsupported(other)),
    }
}

/// Reply to a 0x01 / 0x02 request.
pub fn read_reply(unit: u8, function: u8, bits: &[bool]) -> Vec<u8> {
    let data = pack_bits(bits);
    let mut frame = vec![unit, function, data.len() as u8];
    frame.extend_from_slice(&data);
    seal(frame)
}

/// Reply to a write request: echo of its first six bytes.
pub fn write_reply(request: &[u8]) -> Vec<u8> {
    seal(request[..6.min(request.len())].to_vec())
}

/// Exception reply.
pub fn exception_reply(unit: u8, function: u8, code: u8) -> Vec<u8> {
    seal(vec![unit, function | EXCEPTION_FLAG, code])
}
