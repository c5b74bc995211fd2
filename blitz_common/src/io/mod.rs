//! Field-bus signal naming.
//!
//! Backends never address coils by raw index; they go through the
//! [`signal::SignalMap`] built once from the configuration.

pub mod signal;
