//! Core library for the probe-daq application.
//!
//! Polls three pH and three conductivity probes over I2C in rounds, assembles
//! their readings into timestamped records and hands those to the CSV and
//! message-bus sinks. Probes can also be calibrated interactively, one at a
//! time, while no collection session holds them.
//!
//! # Module layout
//!
//! - [`probe`] - probe identity (kind and position)
//! - [`hardware`] - transports, shared channels and the probe array
//! - [`reading`] - status byte interpretation
//! - [`record`] - per-round record assembly
//! - [`session`] - clock, session window and round pacing
//! - [`scheduler`] - the round-based acquisition loop
//! - [`calibration`] - interactive calibration and dry run
//! - [`keypress`] - operator keypress polling
//! - [`sink`] - CSV and message-bus output
//! - [`app`] - mode dispatcher and operator menu
//! - [`config`] - figment-based settings
//! - [`error`] - error types

pub mod app;
pub mod calibration;
pub mod cli;
pub mod config;
pub mod error;
pub mod hardware;
pub mod keypress;
pub mod probe;
pub mod reading;
pub mod record;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use error::{AppResult, DaqError};
pub use probe::{Position, SensorIdentity, SensorKind};
