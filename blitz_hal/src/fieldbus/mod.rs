//! RS485 field bus.
//!
//! Two 8-channel relay/input modules answer Modbus RTU on one serial line.
//!
//! - [`rtu`] - frame codec and CRC-16/MODBUS
//! - [`client`] - request/reply transactions over a [`transport::BusTransport`]
//! - [`transport`] - serial transport and the transport trait
//! - [`memory`] - in-memory slave pair for tests and bench setups
//! - [`gateway`] - named-signal mirror of both modules with online tracking

pub mod client;
pub mod gateway;
pub mod memory;
pub mod rtu;
pub mod transport;

pub use client::RtuClient;
pub use gateway::IoGateway;
pub use memory::MemoryBus;
pub use transport::{BusTransport, SerialTransport};
