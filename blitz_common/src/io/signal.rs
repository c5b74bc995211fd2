//! Logical signal names.
//!
//! `Signal` maps a name like `"emergency"` to a typed variant. The
//! [`SignalMap`] resolves each signal to a `(module, kind, index)` address
//! on the field bus. Unknown names become `Custom` and read as `false`
//! unless the configuration binds them.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::consts::MODULE_WIDTH;

// ─── Module ─────────────────────────────────────────────────────────

/// One of the two relay/input boards on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    A,
    B,
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "a"),
            Self::B => write!(f, "b"),
        }
    }
}

// ─── SignalKind ─────────────────────────────────────────────────────

/// Coil (writable output) or discrete input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Coil,
    Input,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coil => write!(f, "coil"),
            Self::Input => write!(f, "input"),
        }
    }
}

// ─── Signal ─────────────────────────────────────────────────────────

/// Functional signal of the cutting machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signal {
    // ── Coils ───────────────────────
    Brake,
    Clutch,
    PresserLeft,
    PresserRight,
    BladeInhibitLeft,
    BladeInhibitRight,
    CutEnable,

    // ── Inputs ──────────────────────
    StartPressed,
    Emergency,
    DxBladeOut,
    BladePulse,

    // ── Installation-specific ───────
    Custom(String),
}

impl Signal {
    /// Every built-in signal, in default-map order.
    pub const BUILTIN: [Signal; 11] = [
        Signal::Brake,
        Signal::Clutch,
        Signal::PresserLeft,
        Signal::PresserRight,
        Signal::BladeInhibitLeft,
        Signal::BladeInhibitRight,
        Signal::CutEnable,
        Signal::StartPressed,
        Signal::Emergency,
        Signal::DxBladeOut,
        Signal::BladePulse,
    ];

    /// Snake-case name used in configuration and `get_input`.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Brake => "brake",
            Self::Clutch => "clutch",
            Self::PresserLeft => "presser_left",
            Self::PresserRight => "presser_right",
            Self::BladeInhibitLeft => "blade_inhibit_left",
            Self::BladeInhibitRight => "blade_inhibit_right",
            Self::CutEnable => "cut_enable",
            Self::StartPressed => "start_pressed",
            Self::Emergency => "emergency",
            Self::DxBladeOut => "dx_blade_out",
            Self::BladePulse => "blade_pulse",
            Self::Custom(name) => name,
        }
    }
}

impl Signal {
    /// Parse a name. Never fails: unknown names become `Custom`.
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        Self::BUILTIN
            .iter()
            .find(|sig| sig.as_str() == name)
            .cloned()
            .unwrap_or_else(|| Self::Custom(name.to_string()))
    }
}

impl FromStr for Signal {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_name(s))
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Addressing ─────────────────────────────────────────────────────

/// Physical location of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalAddress {
    pub module: Module,
    pub kind: SignalKind,
    /// Bit index within the module, `0..MODULE_WIDTH`.
    pub index: usize,
}

impl SignalAddress {
    pub const fn new(module: Module, kind: SignalKind, index: usize) -> Self {
        Self {
            module,
            kind,
            index,
        }
    }
}

/// One `[[signals]]` entry of the machine configuration.
///
/// ```toml
/// [[signals]]
/// name = "emergency"
/// module = "b"
/// kind = "input"
/// index = 7
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalBinding {
    pub name: String,
    pub module: Module,
    pub kind: SignalKind,
    pub index: usize,
}

/// Name → address table.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMap {
    by_signal: HashMap<Signal, SignalAddress>,
}

impl Default for SignalMap {
    /// Factory wiring: everything on module A.
    fn default() -> Self {
        use Module::A;
        use SignalKind::{Coil, Input};

        let entries = [
            (Signal::Brake, SignalAddress::new(A, Coil, 0)),
            (Signal::Clutch, SignalAddress::new(A, Coil, 1)),
            (Signal::PresserLeft, SignalAddress::new(A, Coil, 2)),
            (Signal::PresserRight, SignalAddress::new(A, Coil, 3)),
            (Signal::BladeInhibitLeft, SignalAddress::new(A, Coil, 4)),
            (Signal::BladeInhibitRight, SignalAddress::new(A, Coil, 5)),
            (Signal::CutEnable, SignalAddress::new(A, Coil, 6)),
            (Signal::StartPressed, SignalAddress::new(A, Input, 0)),
            (Signal::Emergency, SignalAddress::new(A, Input, 1)),
            (Signal::DxBladeOut, SignalAddress::new(A, Input, 2)),
            (Signal::BladePulse, SignalAddress::new(A, Input, 3)),
        ];
        Self {
            by_signal: entries.into_iter().collect(),
        }
    }
}

impl SignalMap {
    /// Default map with configuration overrides applied on top.
    ///
    /// Indices are assumed validated (see `MachineConfig::validate`).
    pub fn with_bindings(bindings: &[SignalBinding]) -> Self {
        let mut map = Self::default();
        for b in bindings {
            map.by_signal.insert(
                Signal::from_name(&b.name),
                SignalAddress::new(b.module, b.kind, b.index),
            );
        }
        map
    }

    /// Address of a typed signal.
    pub fn address(&self, signal: &Signal) -> Option<SignalAddress> {
        self.by_signal.get(signal).copied()
    }

    /// Address of a signal by name. `None` for unknown names.
    pub fn resolve(&self, name: &str) -> Option<SignalAddress> {
        self.address(&Signal::from_name(name))
    }

    /// Number of bound signals.
    pub fn len(&self) -> usize {
        self.by_signal.len()
    }

    /// True if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.by_signal.is_empty()
    }

    /// Iterate over all bindings.
    pub fn iter(&self) -> impl Iterator<Item = (&Signal, &SignalAddress)> {
        self.by_signal.iter()
    }
}

/// Check a single binding's index against the module width.
pub fn index_in_range(index: usize) -> bool {
    index < MODULE_WIDTH
}
