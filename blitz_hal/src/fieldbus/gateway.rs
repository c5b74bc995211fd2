//! IoGateway: named-signal view of the two relay/input modules.
//!
//! The gateway owns the only `RtuClient` and the coil/input mirror. Every
//! mutation of the mirror happens in `poll()` or a coil write under the
//! gateway lock, so callers on other threads (homing) see a consistent
//! snapshot.
//!
//! # Failure handling
//!
//! Nothing here returns an error. A failed exchange marks the bus offline
//! and keeps the last known arrays; the next fully successful poll brings
//! it back online. The online/offline transition is logged once.

use blitz_common::consts::MODULE_WIDTH;
use blitz_common::io::signal::{Module, Signal, SignalKind, SignalMap};
use blitz_common::machine::config::BusConfig;
use blitz_common::machine::error::MachineError;
use blitz_common::machine::types::BusState;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::RtuClient;
use super::transport::{BusTransport, SerialTransport};

const WIDTH: u16 = MODULE_WIDTH as u16;

struct GatewayInner {
    client: Option<RtuClient>,
    state: BusState,
    unit_a: u8,
    unit_b: u8,
    poll_interval: Duration,
    since_poll: Duration,
}

impl GatewayInner {
    fn unit(&self, module: Module) -> u8 {
        match module {
            Module::A => self.unit_a,
            Module::B => self.unit_b,
        }
    }

    fn set_online(&mut self, online: bool, reason: Option<&MachineError>) {
        if self.state.online == online {
            return;
        }
        self.state.online = online;
        if online {
            info!("Field bus online");
        } else if let Some(e) = reason {
            warn!("Field bus offline: {e}");
        } else {
            warn!("Field bus offline");
        }
    }

    fn poll_module(&mut self, module: Module) -> Result<(), MachineError> {
        let unit = self.unit(module);
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| MachineError::Transport("bus not connected".to_string()))?;

        let inputs = client.read_discrete_inputs(unit, 0, WIDTH);
        let coils = client.read_coils(unit, 0, WIDTH);

        let mut first_err = None;
        match inputs {
            Ok(bits) => copy_bits(self.state.inputs_mut(module), &bits),
            Err(e) => first_err = Some(e),
        }
        match coils {
            Ok(bits) => copy_bits(self.state.coils_mut(module), &bits),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

fn copy_bits(dst: &mut [bool; MODULE_WIDTH], src: &[bool]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *s;
    }
}

/// Coil/input mirror of both modules behind named signals.
pub struct IoGateway {
    inner: Mutex<GatewayInner>,
    signals: SignalMap,
}

impl IoGateway {
    /// Disconnected gateway. All signals read `false` until a poll succeeds.
    pub fn new(signals: SignalMap) -> Self {
        Self {
            inner: Mutex::new(GatewayInner {
                client: None,
                state: BusState::default(),
                unit_a: 1,
                unit_b: 2,
                poll_interval: Duration::from_millis(
                    blitz_common::consts::DEFAULT_POLL_INTERVAL_MS,
                ),
                since_poll: Duration::ZERO,
            }),
            signals,
        }
    }

    /// Open the serial line described by `settings` and poll once.
    ///
    /// Returns false (and stays disconnected) if the port cannot be opened.
    pub fn connect(&self, settings: &BusConfig) -> bool {
        match SerialTransport::open(settings) {
            Ok(transport) => {
                self.attach(Box::new(transport), settings);
                true
            }
            Err(e) => {
                warn!("Field bus unavailable: {e}");
                false
            }
        }
    }

    /// Use an already-open transport.
    pub fn attach(&self, transport: Box<dyn BusTransport>, settings: &BusConfig) {
        {
            let mut inner = self.inner.lock();
            let client = RtuClient::new(transport);
            info!(
                "Field bus on {} (units {}/{}, poll {} ms)",
                client.endpoint(),
                settings.unit_a,
                settings.unit_b,
                settings.poll_interval_ms
            );
            inner.client = Some(client);
            inner.unit_a = settings.unit_a;
            inner.unit_b = settings.unit_b;
            inner.poll_interval = Duration::from_millis(settings.poll_interval_ms);
            inner.since_poll = Duration::ZERO;
        }
        self.poll();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().client.is_some()
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().state.online
    }

    /// Read inputs and coils of both modules.
    ///
    /// Modules are polled independently; a failure on one does not skip
    /// the other. Any failure leaves the affected arrays untouched and
    /// marks the bus offline.
    pub fn poll(&self) {
        let mut inner = self.inner.lock();
        if inner.client.is_none() {
            inner.set_online(false, None);
            return;
        }
        inner.since_poll = Duration::ZERO;

        let a = inner.poll_module(Module::A);
        let b = inner.poll_module(Module::B);
        match a.err().or(b.err()) {
            None => inner.set_online(true, None),
            Some(e) => {
                debug!("Bus poll failed: {e}");
                inner.set_online(false, Some(&e));
            }
        }
    }

    /// Poll when `dt` pushes the time since the last poll past the
    /// configured interval. Returns true if a poll ran.
    pub fn poll_if_due(&self, dt: Duration) -> bool {
        {
            let mut inner = self.inner.lock();
            inner.since_poll += dt;
            if inner.since_poll < inner.poll_interval {
                return false;
            }
        }
        self.poll();
        true
    }

    /// Write one coil. The mirror is updated only on a confirmed echo.
    pub fn write_coil(&self, module: Module, index: usize, value: bool) -> bool {
        if index >= MODULE_WIDTH {
            return false;
        }
        let mut inner = self.inner.lock();
        let unit = inner.unit(module);
        let result = match inner.client.as_mut() {
            Some(client) => client.write_single_coil(unit, index as u16, value),
            None => return false,
        };
        match result {
            Ok(()) => {
                inner.state.coils_mut(module)[index] = value;
                true
            }
            Err(e) => {
                debug!("Coil {module}{index} <- {value} failed: {e}");
                inner.set_online(false, Some(&e));
                false
            }
        }
    }

    /// Write several coils of one module in a single 0x0F exchange. Coils
    /// not named in `bits` are sent with their mirrored value.
    fn write_module_coils(&self, module: Module, bits: &[(usize, bool)]) -> bool {
        let mut inner = self.inner.lock();
        let unit = inner.unit(module);
        let mut values = *inner.state.coils(module);
        for &(index, value) in bits {
            values[index] = value;
        }
        let result = match inner.client.as_mut() {
            Some(client) => client.write_multiple_coils(unit, 0, &values),
            None => return false,
        };
        match result {
            Ok(()) => {
                *inner.state.coils_mut(module) = values;
                true
            }
            Err(e) => {
                debug!("Coils {module} <- {values:?} failed: {e}");
                inner.set_online(false, Some(&e));
                false
            }
        }
    }

    /// Write a named coil. Inputs and unknown names fail.
    pub fn write_signal(&self, signal: &Signal, value: bool) -> bool {
        match self.signals.address(signal) {
            Some(addr) if addr.kind == SignalKind::Coil => {
                self.write_coil(addr.module, addr.index, value)
            }
            _ => false,
        }
    }

    /// Write a group of named coils. Each module gets one exchange: a
    /// single-coil write for one change, a multi-coil write otherwise.
    /// Fails if any name is not a coil or any exchange fails.
    pub fn write_signals(&self, writes: &[(Signal, bool)]) -> bool {
        let mut ok = true;
        for module in [Module::A, Module::B] {
            let bits: Vec<(usize, bool)> = writes
                .iter()
                .filter_map(|(signal, value)| {
                    self.signals
                        .address(signal)
                        .filter(|a| a.kind == SignalKind::Coil && a.module == module)
                        .map(|a| (a.index, *value))
                })
                .filter(|(index, _)| *index < MODULE_WIDTH)
                .collect();
            ok &= match bits.as_slice() {
                [] => true,
                [(index, value)] => self.write_coil(module, *index, *value),
                _ => self.write_module_coils(module, &bits),
            };
        }
        let all_coils = writes.iter().all(|(signal, _)| {
            matches!(self.signals.address(signal), Some(a) if a.kind == SignalKind::Coil)
        });
        ok && all_coils
    }

    /// Mirrored value of a named signal. Unknown names read `false`.
    pub fn read_signal(&self, name: &str) -> bool {
        self.signals
            .resolve(name)
            .map(|addr| self.inner.lock().state.read(addr))
            .unwrap_or(false)
    }

    /// Mirrored value of a typed signal.
    pub fn signal(&self, signal: &Signal) -> bool {
        self.signals
            .address(signal)
            .map(|addr| self.inner.lock().state.read(addr))
            .unwrap_or(false)
    }

    pub fn signal_map(&self) -> &SignalMap {
        &self.signals
    }

    /// Copy of the mirror.
    pub fn state(&self) -> BusState {
        self.inner.lock().state
    }

    /// Drop the transport and mark offline. The mirror is kept.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.client.take().is_some() {
            info!("Field bus closed");
        }
        inner.state.online = false;
    }
}
