//! Machine control surface shared by every backend.
//!
//! - [`io`] - the `MachineIo` capability trait
//! - [`types`] - command and snapshot types
//! - [`interlock`] - emergency/alarm flags shared across threads
//! - [`error`] - `MachineError`
//! - [`config`] - `MachineConfig` and its sections

pub mod config;
pub mod error;
pub mod interlock;
pub mod io;
pub mod types;
