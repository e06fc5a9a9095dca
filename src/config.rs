//! Configuration System using Figment
//!
//! Configuration is loaded from (in order of precedence, highest last):
//! 1. Built-in defaults (the six-probe wiring of the rig)
//! 2. TOML configuration file (default: `config/probe_daq.toml`, optional)
//! 3. Environment variables prefixed with `PROBEDAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! PROBEDAQ_APPLICATION__LOG_LEVEL=debug
//! PROBEDAQ_ACQUISITION__SESSION_DURATION_SECONDS=600
//! PROBEDAQ_PUBLISHER__FORMAT=json
//! ```
//!
//! # Example
//!
//! ```no_run
//! use probe_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Controller: {}", settings.application.controller_id);
//! println!("Settle delay: {:?}", settings.acquisition.settle_delay());
//! # Ok::<(), probe_daq::error::DaqError>(())
//! ```

use crate::error::DaqError;
use crate::probe::{Position, SensorIdentity, SensorKind};
use crate::record::MissingFieldPolicy;
use crate::session::RoundPacing;
use crate::sink::BusFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/probe_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PROBEDAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Round scheduling and timing
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Calibration timing
    #[serde(default)]
    pub calibration: CalibrationConfig,
    /// CSV output
    #[serde(default)]
    pub storage: StorageConfig,
    /// Message-bus output
    #[serde(default)]
    pub publisher: PublisherConfig,
    /// Probe table
    #[serde(default = "default_probes")]
    pub probes: Vec<ProbeDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Identifies this controller in published messages
    #[serde(default = "default_controller_id")]
    pub controller_id: String,
}

/// Acquisition scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Length of a collection session
    #[serde(default = "default_session_duration")]
    pub session_duration_seconds: u64,
    /// Wait between rounds (or round period, see `pacing`)
    #[serde(default = "default_inter_round_delay")]
    pub inter_round_delay_ms: u64,
    /// Wait between a read command and reading the response
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// How `inter_round_delay_ms` is applied
    #[serde(default)]
    pub pacing: RoundPacing,
    /// Stop after this many rounds even if the session window is still open
    #[serde(default)]
    pub max_rounds: Option<u64>,
    /// What happens to a record with a missing position
    #[serde(default)]
    pub missing_field_policy: MissingFieldPolicy,
    /// Query every probe before the first mode runs
    #[serde(default = "default_true")]
    pub verify_on_start: bool,
}

/// Calibration timing
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CalibrationConfig {
    /// Replace every per-step post-command delay with this value
    #[serde(default)]
    pub command_delay_ms: Option<u64>,
}

/// CSV storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Enable the CSV sink
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Output directory for data files
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// pH file name
    #[serde(default = "default_ph_file")]
    pub ph_file: String,
    /// Conductivity file name
    #[serde(default = "default_conductivity_file")]
    pub conductivity_file: String,
}

/// Message-bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Enable the bus publisher
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Socket address subscribers connect to
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Message format
    #[serde(default)]
    pub format: BusFormat,
}

/// One probe in the probe table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeDefinition {
    /// Probe kind
    pub kind: SensorKind,
    /// Position within its kind
    pub position: Position,
    /// I2C bus number (`/dev/i2c-<bus>`)
    pub bus: u8,
    /// 7-bit I2C address
    pub address: u8,
}

impl ProbeDefinition {
    /// Identity of the probe.
    pub fn identity(&self) -> SensorIdentity {
        SensorIdentity::new(self.kind, self.position)
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "probe-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_controller_id() -> String {
    "C001".to_string()
}

fn default_session_duration() -> u64 {
    3600
}

fn default_inter_round_delay() -> u64 {
    9200
}

fn default_settle_delay() -> u64 {
    800
}

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_ph_file() -> String {
    "data_ph.csv".to_string()
}

fn default_conductivity_file() -> String {
    "data_c.csv".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:5556".to_string()
}

/// Original wiring: two buses, addresses 0x61..0x66.
fn default_probes() -> Vec<ProbeDefinition> {
    let probe = |kind, position, bus, address| ProbeDefinition {
        kind,
        position: Position::new(position).unwrap_or(Position::FIRST),
        bus,
        address,
    };
    vec![
        probe(SensorKind::Ph, 1, 1, 0x61),
        probe(SensorKind::Ph, 2, 0, 0x62),
        probe(SensorKind::Ph, 3, 0, 0x63),
        probe(SensorKind::Conductivity, 1, 0, 0x64),
        probe(SensorKind::Conductivity, 2, 1, 0x65),
        probe(SensorKind::Conductivity, 3, 1, 0x66),
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            acquisition: AcquisitionConfig::default(),
            calibration: CalibrationConfig::default(),
            storage: StorageConfig::default(),
            publisher: PublisherConfig::default(),
            probes: default_probes(),
        }
    }
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            controller_id: default_controller_id(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            session_duration_seconds: default_session_duration(),
            inter_round_delay_ms: default_inter_round_delay(),
            settle_delay_ms: default_settle_delay(),
            pacing: RoundPacing::default(),
            max_rounds: None,
            missing_field_policy: MissingFieldPolicy::default(),
            verify_on_start: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_output_dir(),
            ph_file: default_ph_file(),
            conductivity_file: default_conductivity_file(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_bind(),
            format: BusFormat::default(),
        }
    }
}

impl AcquisitionConfig {
    /// Session length.
    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session_duration_seconds)
    }

    /// Pause between rounds.
    pub fn inter_round_delay(&self) -> Duration {
        Duration::from_millis(self.inter_round_delay_ms)
    }

    /// Write-to-read settle delay.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl CalibrationConfig {
    /// Post-command delay override, if configured.
    pub fn command_delay(&self) -> Option<Duration> {
        self.command_delay_ms.map(Duration::from_millis)
    }
}

impl StorageConfig {
    /// Full path of the pH file.
    pub fn ph_path(&self) -> PathBuf {
        self.output_dir.join(&self.ph_file)
    }

    /// Full path of the conductivity file.
    pub fn conductivity_path(&self) -> PathBuf {
        self.output_dir.join(&self.conductivity_file)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load from the default file location and environment.
    pub fn load() -> Result<Self, DaqError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, DaqError> {
        let settings: Self = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Provider stack used by [`Settings::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, DaqError> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Settle delay is non-zero
    /// - Every (kind, position) pair is configured exactly once
    /// - Addresses are 7-bit, non-reserved, and unique per bus
    /// - Output file names are non-empty
    pub fn validate(&self) -> Result<(), DaqError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.acquisition.settle_delay_ms == 0 {
            return Err(DaqError::Configuration(
                "settle_delay_ms must be > 0".to_string(),
            ));
        }

        if self.storage.ph_file.is_empty() || self.storage.conductivity_file.is_empty() {
            return Err(DaqError::Configuration(
                "storage file names cannot be empty".to_string(),
            ));
        }

        let mut identities = HashSet::new();
        let mut endpoints = HashSet::new();
        for probe in &self.probes {
            if !identities.insert(probe.identity()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate probe: '{}'",
                    probe.identity()
                )));
            }
            if !(0x03..=0x77).contains(&probe.address) {
                return Err(DaqError::Configuration(format!(
                    "Probe '{}': address 0x{:02x} outside 0x03..=0x77",
                    probe.identity(),
                    probe.address
                )));
            }
            if !endpoints.insert((probe.bus, probe.address)) {
                return Err(DaqError::Configuration(format!(
                    "Probe '{}': bus {} address 0x{:02x} already in use",
                    probe.identity(),
                    probe.bus,
                    probe.address
                )));
            }
        }

        let missing: Vec<String> = SensorIdentity::all()
            .filter(|id| !identities.contains(id))
            .map(|id| id.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Missing probes: {}",
                missing.join(", ")
            )));
        }

        Ok(())
    }

    /// Definition of the probe `identity`.
    pub fn probe(&self, identity: SensorIdentity) -> Option<&ProbeDefinition> {
        self.probes.iter().find(|p| p.identity() == identity)
    }
}
