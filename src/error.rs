//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, together with the two
//! narrower error types that cross module seams: `TransportError` for anything
//! that goes wrong talking to a probe, and `SinkError` for record output.
//!
//! ## Error Hierarchy
//!
//! - **`TransportError`**: bus or device unreachable. Fatal when it happens while
//!   the probe array is being opened; mid-round it only drops that probe's
//!   contribution to the current record.
//! - **`SinkError`**: CSV or message-bus write failure. Always logged and counted,
//!   never propagated out of a running session.
//! - **`DaqError`**: everything a mode (collection, calibration, dry-run) can fail
//!   with. Transport failures are wrapped with the probe they happened on.
//!
//! Pending and malformed readings are not errors; see
//! [`crate::reading::InterpretedReading`].

use crate::probe::SensorIdentity;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failure talking to a probe.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bus error on {target}: {reason}")]
    Bus { target: String, reason: String },

    #[error("Failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("I2C support not enabled. Rebuild with --features hardware_i2c")]
    FeatureDisabled,

    #[error("Channel state poisoned by a panicked worker")]
    Poisoned,
}

/// Failure writing a completed record to a sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors a mode can fail with.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error on {probe}: {source}")]
    Transport {
        probe: SensorIdentity,
        #[source]
        source: TransportError,
    },

    #[error("Probe {probe} is in use by '{owner}', requested by '{requested_by}'")]
    ChannelBusy {
        probe: SensorIdentity,
        owner: String,
        requested_by: String,
    },

    #[error("Probe {0} is not configured")]
    UnknownProbe(SensorIdentity),

    #[error("Startup failed: {} probe(s) unreachable", .0.len())]
    Startup(Vec<DaqError>),

    #[error("Terminal error: {0}")]
    Terminal(String),

    #[error("Interrupted by operator")]
    Interrupted,
}

impl DaqError {
    /// Wrap a transport failure with the probe it happened on.
    pub fn transport(probe: SensorIdentity, source: TransportError) -> Self {
        DaqError::Transport { probe, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Position, SensorKind};

    #[test]
    fn test_error_display() {
        let probe = SensorIdentity::new(SensorKind::Ph, Position::FIRST);
        let err = DaqError::transport(
            probe,
            TransportError::Bus {
                target: "/dev/i2c-1@0x61".into(),
                reason: "NoAcknowledge".into(),
            },
        );
        assert_eq!(
            err.to_string(),
            "Transport error on ph1: Bus error on /dev/i2c-1@0x61: NoAcknowledge"
        );
    }

    #[test]
    fn test_startup_error_counts_probes() {
        let probe = SensorIdentity::new(SensorKind::Conductivity, Position::LAST);
        let err = DaqError::Startup(vec![
            DaqError::transport(probe, TransportError::FeatureDisabled),
            DaqError::transport(probe, TransportError::Poisoned),
        ]);
        assert_eq!(err.to_string(), "Startup failed: 2 probe(s) unreachable");
    }
}
