//! probe-daq entry point
//!
//! # Usage
//!
//! Interactive menu on the real probes:
//! ```bash
//! probe-daq
//! ```
//!
//! One-hour collection against simulated probes:
//! ```bash
//! probe-daq --simulate collect --duration-secs 3600
//! ```
//!
//! Calibrate a single probe:
//! ```bash
//! probe-daq calibrate ph2
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use probe_daq::app::App;
use probe_daq::cli::{Cli, Command};
use probe_daq::config::Settings;
use probe_daq::error::DaqError;
use probe_daq::keypress::KeypressPoll;
use std::io::Write;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    init_tracing(&settings.application.log_level, cli.log_json);
    let command = cli.command();

    if command == Command::PrintConfig {
        print!("{}", settings.to_toml()?);
        return Ok(());
    }

    tracing::info!(
        name = %settings.application.name,
        controller = %settings.application.controller_id,
        simulate = cli.simulate,
        "Starting"
    );
    let app = App::open(settings, cli.simulate).context("opening probes")?;

    let mut stdout = std::io::stdout();
    match command {
        Command::Collect { .. } => {
            let summary = app
                .collect_until(command.collect_options(), ctrl_c())
                .await?;
            println!(
                "Collection finished: {} round(s), {} record(s) written, {} incomplete, {} sink failure(s)",
                summary.rounds, summary.records_emitted, summary.records_dropped, summary.sink_failures
            );
        }
        Command::Menu => {
            let mut keys = terminal_keys()?;
            interactive(app.run_menu(keys.as_mut(), &mut stdout).await)?;
        }
        Command::CalibrateAll => {
            let mut keys = terminal_keys()?;
            if let Some(results) = interactive(app.calibrate_all(keys.as_mut(), &mut stdout))? {
                for (probe, outcome) in results {
                    writeln!(stdout, "{}: {:?}", probe, outcome)?;
                }
            }
        }
        Command::Calibrate { probe } => {
            let mut keys = terminal_keys()?;
            if let Some(outcome) = interactive(app.calibrate(probe, keys.as_mut(), &mut stdout))? {
                writeln!(stdout, "{}: {:?}", probe, outcome)?;
            }
        }
        Command::DryRun => {
            let mut keys = terminal_keys()?;
            interactive(app.dry_run(keys.as_mut(), &mut stdout))?;
        }
        Command::PrintConfig => {}
    }

    Ok(())
}

/// Resolves on the first Ctrl-C; the collection then stops after its current round.
async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::warn!("Interrupted, stopping after the current round"),
        Err(e) => {
            tracing::error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }
}

/// Treat an operator Ctrl-C in an interactive mode as a clean exit.
fn interactive<T>(result: Result<T, DaqError>) -> Result<Option<T>, DaqError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(DaqError::Interrupted) => {
            tracing::warn!("Interrupted by operator");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[cfg(unix)]
fn terminal_keys() -> Result<Box<dyn KeypressPoll>, DaqError> {
    Ok(Box::new(probe_daq::keypress::TerminalKeypress::open()?))
}

#[cfg(not(unix))]
fn terminal_keys() -> Result<Box<dyn KeypressPoll>, DaqError> {
    Err(DaqError::Terminal(
        "interactive modes need a unix terminal".to_string(),
    ))
}
