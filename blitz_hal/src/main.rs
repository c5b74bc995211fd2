//! # Blitz HAL Binary
//!
//! Runs the machine-control loop of the Blitz cutting machine.
//!
//! # Usage
//!
//! ```bash
//! # Real hardware if available, simulation otherwise
//! blitz_hal --config /etc/blitz/machine.toml
//!
//! # Force the simulation
//! blitz_hal -c config/machine.toml --simulate
//!
//! # Commissioning: fail if the hardware cannot be opened
//! blitz_hal -c config/machine.toml --real -v
//!
//! # Print the effective configuration and exit
//! blitz_hal -c config/machine.toml --print-config
//! ```

use blitz_common::config::ConfigLoader;
use blitz_common::consts::DEFAULT_CONFIG_PATH;
use blitz_common::machine::config::MachineConfig;
use blitz_hal::{BuildMode, ControlLoop, MachineFactory};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Blitz HAL - machine control for the two-head profile cutting machine
#[derive(Parser, Debug)]
#[command(name = "blitz_hal")]
#[command(version)]
#[command(about = "Machine-control loop with simulation and real-hardware backends")]
#[command(long_about = None)]
struct Args {
    /// Path to the machine configuration file (machine.toml)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Force the simulation backend
    #[arg(short = 's', long, conflicts_with = "real")]
    simulate: bool,

    /// Require the real hardware backend (no fallback)
    #[arg(short = 'r', long)]
    real: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Log the machine state every N milliseconds (0 disables)
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    state_interval_ms: u64,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn build_mode(&self) -> BuildMode {
        if self.simulate {
            BuildMode::Simulation
        } else if self.real {
            BuildMode::Real
        } else {
            BuildMode::Auto
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("HAL startup failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let missing = !args.config.exists();
    let loaded = if missing {
        Ok(MachineConfig::default())
    } else {
        MachineConfig::load(&args.config)
    };

    let level = match &loaded {
        Ok(config) => config.shared.log_level.as_filter(),
        Err(_) => "info",
    };
    setup_tracing(&args, level);
    info!("Blitz HAL v{} starting...", env!("CARGO_PKG_VERSION"));
    if missing {
        warn!("No configuration at {:?}; using defaults", args.config);
    }

    let config = loaded?;
    config.validate()?;

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mode = args.build_mode();
    info!("Service '{}', backend mode {}", config.shared.service_name, mode);
    let machine = MachineFactory::build(&config, mode)?;

    let tick = Duration::from_millis(config.machine.tick_interval_ms);
    let mut control = ControlLoop::new(machine, tick)
        .with_state_interval(Some(Duration::from_millis(args.state_interval_ms)));

    let running = control.running_flag();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        running.store(false, Ordering::SeqCst);
    })?;

    control.run();
    control.shutdown();

    info!("Blitz HAL shutdown complete");
    Ok(())
}

/// Setup tracing subscriber. `RUST_LOG` overrides both `-v` and the
/// configured level.
fn setup_tracing(args: &Args, configured: &str) {
    let level = if args.verbose { "debug" } else { configured };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
