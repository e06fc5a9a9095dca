//! Command-line interface.

use crate::app::CollectOptions;
use crate::config::DEFAULT_CONFIG_PATH;
use crate::probe::SensorIdentity;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "probe-daq")]
#[command(about = "pH and conductivity probe acquisition and calibration", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (TOML). Missing files fall back to defaults.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Use simulated probes instead of the I2C buses
    #[arg(long)]
    pub simulate: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Mode to run
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operating modes.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Interactive operator menu (default)
    Menu,

    /// Run a collection session
    Collect {
        /// Session length in seconds
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Stop after this many rounds
        #[arg(long)]
        rounds: Option<u64>,
    },

    /// Calibrate every probe in turn
    CalibrateAll,

    /// Calibrate one probe (ph1..ph3, ec1..ec3)
    Calibrate {
        /// Probe to calibrate
        probe: SensorIdentity,
    },

    /// Print live readings until a key is pressed
    DryRun,

    /// Print the effective configuration and exit
    PrintConfig,
}

impl Cli {
    /// Selected command, defaulting to the menu.
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Menu)
    }
}

impl Command {
    /// Collection overrides carried by `collect`.
    pub fn collect_options(&self) -> CollectOptions {
        match self {
            Command::Collect {
                duration_secs,
                rounds,
            } => CollectOptions {
                duration: duration_secs.map(Duration::from_secs),
                rounds: *rounds,
            },
            _ => CollectOptions::default(),
        }
    }
}
