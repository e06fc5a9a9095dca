//! Mode dispatcher.
//!
//! [`App`] owns the loaded settings and the opened probe array and runs one
//! mode at a time: collection, calibration of all probes or one probe, or a
//! dry run. Modes share the probe array; the channel owner lock keeps them
//! from overlapping on a probe.

use crate::calibration::{live_sample, CalibrationOutcome, CalibrationSession};
use crate::config::Settings;
use crate::error::DaqError;
use crate::hardware::{ProbeArray, SharedChannel};
use crate::keypress::KeypressPoll;
use crate::probe::SensorIdentity;
use crate::scheduler::{AcquisitionScheduler, AcquisitionTiming, SessionSummary};
use crate::session::{Clock, SessionWindow, SystemClock};
use crate::sink::{BusPublisher, CsvSink, SinkSet};
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// How often a menu-started collection checks for the stop key.
const STOP_KEY_POLL: Duration = Duration::from_millis(100);

/// Operator menu entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Leave the menu.
    Exit,
    /// Calibrate every probe in turn.
    CalibrateAll,
    /// Calibrate a single probe.
    CalibrateOne,
    /// Print live readings until a key is pressed.
    DryRun,
    /// Run a collection session.
    Collect,
}

impl Mode {
    /// Menu entries in display order.
    pub const ALL: [Mode; 5] = [
        Mode::Exit,
        Mode::CalibrateAll,
        Mode::CalibrateOne,
        Mode::DryRun,
        Mode::Collect,
    ];

    /// Menu key of this entry.
    pub fn key(self) -> char {
        match self {
            Mode::Exit => '0',
            Mode::CalibrateAll => '1',
            Mode::CalibrateOne => '2',
            Mode::DryRun => '3',
            Mode::Collect => '4',
        }
    }

    /// Entry selected by `key`.
    pub fn from_key(key: char) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.key() == key)
    }

    fn label(self) -> &'static str {
        match self {
            Mode::Exit => "Exit",
            Mode::CalibrateAll => "Calibrate all probes",
            Mode::CalibrateOne => "Calibrate one probe",
            Mode::DryRun => "Dry run (live readings)",
            Mode::Collect => "Start collection",
        }
    }
}

/// Per-run overrides of the configured session limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectOptions {
    /// Session length instead of `session_duration_seconds`.
    pub duration: Option<Duration>,
    /// Round limit instead of `max_rounds`.
    pub rounds: Option<u64>,
}

/// Loaded settings plus the opened probes.
pub struct App {
    settings: Settings,
    probes: ProbeArray,
    clock: Arc<dyn Clock>,
}

impl App {
    /// Wrap an already opened probe array.
    pub fn new(settings: Settings, probes: ProbeArray) -> Self {
        Self {
            settings,
            probes,
            clock: Arc::new(SystemClock),
        }
    }

    /// Open every configured probe and, if configured, check it answers.
    pub fn open(settings: Settings, simulate: bool) -> Result<Self, DaqError> {
        let probes = ProbeArray::open(&settings.probes, simulate)?;
        if settings.acquisition.verify_on_start {
            probes.verify(settings.acquisition.settle_delay())?;
        }
        Ok(Self::new(settings, probes))
    }

    /// Replace the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Probe array in use.
    pub fn probes(&self) -> &ProbeArray {
        &self.probes
    }

    /// Sinks enabled in the configuration.
    pub async fn build_sinks(&self) -> Result<SinkSet, DaqError> {
        let mut sinks = SinkSet::new();
        let storage = &self.settings.storage;
        if storage.enabled {
            sinks.push(Box::new(CsvSink::new(
                storage.ph_path(),
                storage.conductivity_path(),
            )));
        }
        let publisher = &self.settings.publisher;
        if publisher.enabled {
            let bus = BusPublisher::bind(
                &publisher.bind,
                publisher.format,
                self.settings.application.controller_id.clone(),
            )
            .await?;
            sinks.push(Box::new(bus));
        }
        Ok(sinks)
    }

    /// Run a collection session into the configured sinks, ending early once
    /// `shutdown` resolves. The round in flight still completes and the sinks
    /// are shut down either way.
    pub async fn collect_until<F>(
        &self,
        options: CollectOptions,
        shutdown: F,
    ) -> Result<SessionSummary, DaqError>
    where
        F: Future<Output = ()>,
    {
        let mut sinks = self.build_sinks().await?;
        let summary = self.collect_into(&mut sinks, options, shutdown).await;
        sinks.shutdown().await;
        summary
    }

    /// Run a collection session into `sinks` until the window closes, the
    /// round limit is reached or `shutdown` resolves.
    pub async fn collect_into<F>(
        &self,
        sinks: &mut SinkSet,
        options: CollectOptions,
        shutdown: F,
    ) -> Result<SessionSummary, DaqError>
    where
        F: Future<Output = ()>,
    {
        let acquisition = &self.settings.acquisition;
        let mut timing = AcquisitionTiming::from_config(acquisition);
        if options.rounds.is_some() {
            timing.max_rounds = options.rounds;
        }
        let duration = options
            .duration
            .unwrap_or_else(|| acquisition.session_duration());
        let window = SessionWindow::open(self.clock.as_ref(), duration);

        let scheduler = AcquisitionScheduler::new(
            timing,
            self.clock.clone(),
            acquisition.missing_field_policy,
        );
        scheduler
            .run_until(&self.probes, sinks, window, shutdown)
            .await
    }

    /// Collection started from the menu; any key stops it after the current
    /// round. Ctrl-C stops it the same way and then leaves the menu.
    async fn collect_from_menu(
        &self,
        keys: &mut dyn KeypressPoll,
        out: &mut dyn Write,
    ) -> Result<SessionSummary, DaqError> {
        writeln!(out, "Collecting. Press any key to stop after the current round.")?;
        out.flush()?;
        keys.discard_pending();
        let summary = self
            .collect_until(CollectOptions::default(), async {
                while !keys.poll_nonblocking() {
                    tokio::time::sleep(STOP_KEY_POLL).await;
                }
            })
            .await;
        if keys.poll_nonblocking() {
            let stop = keys.consume_blocking();
            if matches!(stop, Err(DaqError::Interrupted)) {
                tracing::warn!("Interrupted, collection stopped");
                return Err(DaqError::Interrupted);
            }
        }
        summary
    }

    /// Calibrate one probe interactively.
    pub fn calibrate(
        &self,
        identity: SensorIdentity,
        keys: &mut dyn KeypressPoll,
        out: &mut dyn Write,
    ) -> Result<CalibrationOutcome, DaqError> {
        let channel = self.probes.channel(identity)?;
        let mut session = CalibrationSession::begin(channel)?
            .with_sample_settle(self.settings.acquisition.settle_delay())
            .with_command_delay(self.settings.calibration.command_delay());
        session.run(keys, out)
    }

    /// Calibrate every probe in turn, pH first.
    ///
    /// Stops at the first probe the operator aborts; later probes are left
    /// untouched.
    pub fn calibrate_all(
        &self,
        keys: &mut dyn KeypressPoll,
        out: &mut dyn Write,
    ) -> Result<Vec<(SensorIdentity, CalibrationOutcome)>, DaqError> {
        let mut results = Vec::new();
        for identity in SensorIdentity::all() {
            let outcome = self.calibrate(identity, keys, out)?;
            results.push((identity, outcome));
            if outcome != CalibrationOutcome::Completed {
                writeln!(out, "Skipping remaining probes.")?;
                break;
            }
        }
        Ok(results)
    }

    /// Print live readings from every probe until a key is pressed.
    pub fn dry_run(&self, keys: &mut dyn KeypressPoll, out: &mut dyn Write) -> Result<usize, DaqError> {
        let channels: Vec<SharedChannel> = self.probes.channels().cloned().collect();
        live_sample(&channels, keys, out, self.settings.acquisition.settle_delay())
    }

    /// Interactive menu. Returns when the operator picks Exit.
    ///
    /// A failing mode is reported and the menu is shown again. Calibration and
    /// dry runs block the calling task while they wait for the operator.
    pub async fn run_menu(
        &self,
        keys: &mut dyn KeypressPoll,
        out: &mut dyn Write,
    ) -> Result<(), DaqError> {
        loop {
            writeln!(out, "\n{}", self.settings.application.name)?;
            for mode in Mode::ALL {
                writeln!(out, "  {}  {}", mode.key(), mode.label())?;
            }
            write!(out, "Select: ")?;
            out.flush()?;

            keys.discard_pending();
            let key = keys.consume_blocking()?;
            writeln!(out, "{}", key)?;
            let Some(mode) = Mode::from_key(key) else {
                writeln!(out, "Unknown option '{}'", key)?;
                continue;
            };

            let result = match mode {
                Mode::Exit => return Ok(()),
                Mode::CalibrateAll => self.calibrate_all(keys, out).map(|results| {
                    let done = results
                        .iter()
                        .filter(|(_, o)| *o == CalibrationOutcome::Completed)
                        .count();
                    format!("{} of {} probe(s) calibrated", done, self.probes.len())
                }),
                Mode::CalibrateOne => self
                    .select_probe(keys, out)
                    .and_then(|identity| self.calibrate(identity, keys, out))
                    .map(|outcome| format!("Calibration {:?}", outcome)),
                Mode::DryRun => self
                    .dry_run(keys, out)
                    .map(|reads| format!("Dry run finished after {} read(s)", reads)),
                Mode::Collect => self
                    .collect_from_menu(keys, out)
                    .await
                    .map(|s| format!(
                        "Collection finished: {} round(s), {} record(s) written, {} incomplete",
                        s.rounds, s.records_emitted, s.records_dropped
                    )),
            };

            match result {
                Ok(message) => writeln!(out, "{}", message)?,
                Err(e @ (DaqError::Io(_) | DaqError::Terminal(_) | DaqError::Interrupted)) => {
                    return Err(e)
                }
                Err(e) => {
                    tracing::error!(mode = ?mode, error = %e, "Mode failed");
                    writeln!(out, "Error: {}", e)?;
                }
            }
        }
    }

    fn select_probe(
        &self,
        keys: &mut dyn KeypressPoll,
        out: &mut dyn Write,
    ) -> Result<SensorIdentity, DaqError> {
        let probes: Vec<SensorIdentity> = SensorIdentity::all().collect();
        writeln!(out, "Select probe:")?;
        for (n, identity) in probes.iter().enumerate() {
            writeln!(out, "  {}  {}", n + 1, identity)?;
        }
        out.flush()?;

        keys.discard_pending();
        loop {
            let key = keys.consume_blocking()?;
            let choice = key
                .to_digit(10)
                .and_then(|d| (d as usize).checked_sub(1))
                .and_then(|i| probes.get(i));
            match choice {
                Some(identity) => return Ok(*identity),
                None => writeln!(out, "Pick 1-{}", probes.len())?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypress::{ScriptedKeypress, INTERRUPT_KEY};

    fn simulated_app() -> App {
        let mut settings = Settings::default();
        settings.acquisition.settle_delay_ms = 1;
        settings.calibration.command_delay_ms = Some(0);
        settings.storage.enabled = false;
        settings.publisher.enabled = false;
        App::open(settings, true).unwrap()
    }

    #[test]
    fn test_mode_keys() {
        assert_eq!(Mode::from_key('0'), Some(Mode::Exit));
        assert_eq!(Mode::from_key('4'), Some(Mode::Collect));
        assert_eq!(Mode::from_key('9'), None);
    }

    #[tokio::test]
    async fn test_collect_with_round_override() {
        let app = simulated_app();
        let mut sinks = SinkSet::new();
        let summary = app
            .collect_into(
                &mut sinks,
                CollectOptions {
                    duration: None,
                    rounds: Some(2),
                },
                std::future::pending(),
            )
            .await
            .unwrap();
        assert_eq!(summary.rounds, 2);
        assert_eq!(summary.records_emitted, 4);
    }

    #[tokio::test]
    async fn test_menu_dry_run_then_exit() {
        let app = simulated_app();
        let mut keys = ScriptedKeypress::new().key('3').idle(2).key(' ').key('0');
        let mut out = Vec::new();

        app.run_menu(&mut keys, &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Dry run finished after 3 read(s)"));
        assert!(app.probes().channels().all(SharedChannel::is_available));
    }

    #[tokio::test]
    async fn test_menu_rejects_unknown_option() {
        let app = simulated_app();
        let mut keys = ScriptedKeypress::new().key('x').key('0');
        let mut out = Vec::new();

        app.run_menu(&mut keys, &mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().contains("Unknown option 'x'"));
    }

    #[tokio::test]
    async fn test_menu_collection_stops_on_key() {
        let mut app = simulated_app();
        app.settings.acquisition.max_rounds = None;
        app.settings.acquisition.inter_round_delay_ms = 50;
        let mut keys = ScriptedKeypress::new().key('4').idle(3).key(' ').key('0');
        let mut out = Vec::new();

        app.run_menu(&mut keys, &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Collecting. Press any key to stop"));
        assert!(text.contains("Collection finished"));
        assert!(app.probes().channels().all(SharedChannel::is_available));
    }

    #[tokio::test]
    async fn test_menu_interrupt_leaves_menu() {
        let app = simulated_app();
        let mut keys = ScriptedKeypress::new().key(INTERRUPT_KEY);
        let mut out = Vec::new();

        let err = app.run_menu(&mut keys, &mut out).await.unwrap_err();
        assert!(matches!(err, DaqError::Interrupted));
    }

    #[test]
    fn test_calibrate_all_stops_at_first_abort() {
        let app = simulated_app();
        let mut keys = ScriptedKeypress::new().key('q');
        let mut out = Vec::new();

        let results = app.calibrate_all(&mut keys, &mut out).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.to_string(), "ph1");
    }
}
