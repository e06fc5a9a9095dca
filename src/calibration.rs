//! Interactive probe calibration.
//!
//! A calibration session walks one probe through a fixed sequence of steps:
//!
//! - pH: clear, mid point (7.00), low point (4.00), high point (10.00)
//! - conductivity: clear, dry, low point (12900), high point (50000)
//!
//! Each step shows live readings so the operator can watch the probe settle
//! in the reference solution. The key that stops sampling confirms the step
//! and its calibration command is sent; `q` instead ends the session, and the
//! steps not yet committed keep whatever calibration the device already has.
//! Keys typed ahead of a step's prompt are discarded, so one multi-byte key
//! cannot confirm a step and start the next.
//!
//! The session holds the probe's channel guard from [`CalibrationSession::begin`]
//! until it finishes, so a collection session cannot start on that probe in
//! the meantime.

use crate::error::DaqError;
use crate::hardware::{ChannelGuard, SharedChannel, READ_COMMAND};
use crate::keypress::KeypressPoll;
use crate::probe::{SensorIdentity, SensorKind};
use crate::reading::{interpret_for, STATUS_READY};
use std::fmt;
use std::io::Write;
use std::time::Duration;

/// Owner name calibration sessions acquire channels under.
pub const CALIBRATION_OWNER: &str = "calibration";

/// Owner name the dry run acquires channels under.
pub const DRY_RUN_OWNER: &str = "dry-run";

/// Key that aborts a calibration step.
pub const ABORT_KEY: char = 'q';

/// Default wait between a live-sample read command and its response.
pub const DEFAULT_SAMPLE_SETTLE: Duration = Duration::from_millis(800);

const PH_STEPS: [CalibrationStep; 4] = [
    CalibrationStep::Clear,
    CalibrationStep::Mid,
    CalibrationStep::Low,
    CalibrationStep::High,
];

const CONDUCTIVITY_STEPS: [CalibrationStep; 4] = [
    CalibrationStep::Clear,
    CalibrationStep::Dry,
    CalibrationStep::Low,
    CalibrationStep::High,
];

/// One calibration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationStep {
    /// Erase the stored calibration.
    Clear,
    /// Conductivity dry calibration.
    Dry,
    /// pH mid point.
    Mid,
    /// Low reference point.
    Low,
    /// High reference point.
    High,
}

impl CalibrationStep {
    /// Step order for probes of `kind`.
    pub fn sequence(kind: SensorKind) -> &'static [CalibrationStep] {
        match kind {
            SensorKind::Ph => &PH_STEPS,
            SensorKind::Conductivity => &CONDUCTIVITY_STEPS,
        }
    }

    /// Reference value the probe must sit in, if any.
    pub fn reference(self, kind: SensorKind) -> Option<&'static str> {
        match (kind, self) {
            (_, CalibrationStep::Clear) | (_, CalibrationStep::Dry) => None,
            (SensorKind::Ph, CalibrationStep::Mid) => Some("7.00"),
            (SensorKind::Ph, CalibrationStep::Low) => Some("4.00"),
            (SensorKind::Ph, CalibrationStep::High) => Some("10.00"),
            (SensorKind::Conductivity, CalibrationStep::Mid) => None,
            (SensorKind::Conductivity, CalibrationStep::Low) => Some("12900"),
            (SensorKind::Conductivity, CalibrationStep::High) => Some("50000"),
        }
    }

    /// Device command committing this step.
    pub fn command(self, kind: SensorKind) -> String {
        match self.reference(kind) {
            Some(value) => format!("cal,{},{}", self, value),
            None => format!("cal,{}", self),
        }
    }

    /// Time the device needs after the command before it answers.
    pub fn default_settle(self, kind: SensorKind) -> Duration {
        match (self, kind) {
            (CalibrationStep::Clear, _) => Duration::from_millis(300),
            (_, SensorKind::Ph) => Duration::from_millis(900),
            (_, SensorKind::Conductivity) => Duration::from_millis(600),
        }
    }

    fn instruction(self, kind: SensorKind) -> String {
        match (self, self.reference(kind)) {
            (CalibrationStep::Clear, _) => "Clear the stored calibration".to_string(),
            (CalibrationStep::Dry, _) => "Keep the probe dry and in open air".to_string(),
            (_, Some(value)) => format!("Place the probe in the {} reference solution", value),
            (_, None) => format!("Prepare the {} point", self),
        }
    }
}

impl fmt::Display for CalibrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalibrationStep::Clear => "clear",
            CalibrationStep::Dry => "dry",
            CalibrationStep::Mid => "mid",
            CalibrationStep::Low => "low",
            CalibrationStep::High => "high",
        };
        f.write_str(name)
    }
}

/// Where a session is in its sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    /// Waiting to run `step`.
    At(CalibrationStep),
    /// Every step committed.
    Done,
    /// Operator quit (or a command failed) at `at`.
    Aborted {
        /// Step that was not committed.
        at: CalibrationStep,
    },
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// All steps committed.
    Completed,
    /// Stopped before committing `at`.
    Aborted {
        /// First step left uncommitted.
        at: CalibrationStep,
    },
}

/// Calibration of one probe.
pub struct CalibrationSession {
    identity: SensorIdentity,
    endpoint: String,
    guard: Option<ChannelGuard>,
    steps: &'static [CalibrationStep],
    index: usize,
    state: CalibrationState,
    sample_settle: Duration,
    command_delay: Option<Duration>,
}

impl CalibrationSession {
    /// Take exclusive ownership of `channel` for calibration.
    ///
    /// Fails with [`DaqError::ChannelBusy`] while a collection session or
    /// another calibration holds the channel.
    pub fn begin(channel: &SharedChannel) -> Result<Self, DaqError> {
        let guard = channel.acquire(CALIBRATION_OWNER)?;
        let identity = channel.identity();
        let steps = CalibrationStep::sequence(identity.kind);
        tracing::info!(probe = %identity, "Calibration session started");

        Ok(Self {
            identity,
            endpoint: channel.endpoint().to_string(),
            guard: Some(guard),
            steps,
            index: 0,
            state: CalibrationState::At(steps[0]),
            sample_settle: DEFAULT_SAMPLE_SETTLE,
            command_delay: None,
        })
    }

    /// Settle delay used while live sampling.
    pub fn with_sample_settle(mut self, settle: Duration) -> Self {
        self.sample_settle = settle;
        self
    }

    /// Replace every step's post-command delay.
    pub fn with_command_delay(mut self, delay: Option<Duration>) -> Self {
        self.command_delay = delay;
        self
    }

    /// Probe being calibrated.
    pub fn identity(&self) -> SensorIdentity {
        self.identity
    }

    /// Step waiting to run, `None` once the session has ended.
    pub fn step(&self) -> Option<CalibrationStep> {
        match self.state {
            CalibrationState::At(step) => Some(step),
            _ => None,
        }
    }

    /// Current state.
    pub fn state(&self) -> CalibrationState {
        self.state
    }

    /// Run the remaining steps interactively.
    ///
    /// Prompts and live values are written to `out`. Returns once every step is
    /// committed or the operator quits. The channel is released however the
    /// session ends; on an error the session is left aborted at the step that
    /// was running.
    pub fn run(
        &mut self,
        keys: &mut dyn KeypressPoll,
        out: &mut dyn Write,
    ) -> Result<CalibrationOutcome, DaqError> {
        if let Some(outcome) = self.outcome() {
            return Ok(outcome);
        }

        let result = self.run_steps(keys, out);
        if result.is_err() {
            if let CalibrationState::At(at) = self.state {
                self.state = CalibrationState::Aborted { at };
            }
            self.guard = None;
        }
        result
    }

    fn run_steps(
        &mut self,
        keys: &mut dyn KeypressPoll,
        out: &mut dyn Write,
    ) -> Result<CalibrationOutcome, DaqError> {
        writeln!(
            out,
            "Calibrating {} ({}), {} steps. Press '{}' at any prompt to quit.",
            self.identity,
            self.endpoint,
            self.steps.len(),
            ABORT_KEY
        )?;

        while let Some(step) = self.step() {
            let kind = self.identity.kind;
            writeln!(
                out,
                "\nStep {}/{} [{}]: {}. Press any key to start sampling.",
                self.index + 1,
                self.steps.len(),
                step,
                step.instruction(kind)
            )?;
            out.flush()?;
            keys.discard_pending();
            if keys.consume_blocking()? == ABORT_KEY {
                return self.abort(step, out);
            }

            self.sample_until_key(step, keys, out)?;
            if keys.consume_blocking()? == ABORT_KEY {
                return self.abort(step, out);
            }

            self.commit(step, out)?;
            self.advance();
        }

        writeln!(out, "Calibration of {} complete.", self.identity)?;
        tracing::info!(probe = %self.identity, "Calibration completed");
        Ok(CalibrationOutcome::Completed)
    }

    fn outcome(&self) -> Option<CalibrationOutcome> {
        match self.state {
            CalibrationState::At(_) => None,
            CalibrationState::Done => Some(CalibrationOutcome::Completed),
            CalibrationState::Aborted { at } => Some(CalibrationOutcome::Aborted { at }),
        }
    }

    fn sample_until_key(
        &mut self,
        step: CalibrationStep,
        keys: &mut dyn KeypressPoll,
        out: &mut dyn Write,
    ) -> Result<(), DaqError> {
        let kind = self.identity.kind;
        let Some(guard) = self.guard.as_mut() else {
            return Ok(());
        };
        writeln!(
            out,
            "Sampling. Press any key to send '{}' once the reading is stable, '{}' to quit.",
            step.command(kind),
            ABORT_KEY
        )?;
        loop {
            print_sample(guard, self.sample_settle, out)?;
            if keys.poll_nonblocking() {
                return Ok(());
            }
        }
    }

    fn commit(&mut self, step: CalibrationStep, out: &mut dyn Write) -> Result<(), DaqError> {
        let kind = self.identity.kind;
        let command = step.command(kind);
        let delay = self.command_delay.unwrap_or_else(|| step.default_settle(kind));

        let reply = match self.guard.as_mut() {
            Some(guard) => guard.query(command.as_bytes(), delay),
            None => return Ok(()),
        };

        match reply {
            Ok(raw) => {
                // A bare ready status is the device's acknowledgement
                let status = if raw.first() == Some(&STATUS_READY) {
                    "accepted".to_string()
                } else {
                    interpret_for(kind, &raw).status_label()
                };
                writeln!(out, "Sent '{}': {}", command, status)?;
                tracing::info!(probe = %self.identity, %command, %status, "Calibration command sent");
                Ok(())
            }
            Err(e) => {
                tracing::error!(probe = %self.identity, %command, error = %e, "Calibration command failed");
                writeln!(out, "Sending '{}' failed: {}", command, e)?;
                Err(DaqError::transport(self.identity, e))
            }
        }
    }

    fn advance(&mut self) {
        self.index += 1;
        match self.steps.get(self.index) {
            Some(next) => self.state = CalibrationState::At(*next),
            None => {
                self.state = CalibrationState::Done;
                self.guard = None;
            }
        }
    }

    fn abort(
        &mut self,
        at: CalibrationStep,
        out: &mut dyn Write,
    ) -> Result<CalibrationOutcome, DaqError> {
        self.state = CalibrationState::Aborted { at };
        self.guard = None;
        writeln!(
            out,
            "Calibration of {} stopped before '{}'. Remaining steps were not sent.",
            self.identity, at
        )?;
        tracing::warn!(probe = %self.identity, step = %at, "Calibration aborted by operator");
        Ok(CalibrationOutcome::Aborted { at })
    }
}

/// Read once and print the value or status. Transport errors are shown and
/// do not stop sampling.
fn print_sample(
    guard: &mut ChannelGuard,
    settle: Duration,
    out: &mut dyn Write,
) -> Result<(), DaqError> {
    let identity = guard.identity();
    match guard.query(READ_COMMAND, settle) {
        Ok(raw) => {
            let reading = interpret_for(identity.kind, &raw);
            writeln!(out, "  {}: {}", identity, reading.status_label())?;
        }
        Err(e) => {
            tracing::warn!(probe = %identity, error = %e, "Sample read failed");
            writeln!(out, "  {}: read failed ({})", identity, e)?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Dry run: cycle through `channels` printing readings until a key is pressed.
///
/// Every channel is acquired first, so the dry run is rejected while any of
/// them is in use. The key that ends the run is consumed.
pub fn live_sample(
    channels: &[SharedChannel],
    keys: &mut dyn KeypressPoll,
    out: &mut dyn Write,
    settle: Duration,
) -> Result<usize, DaqError> {
    let mut guards = channels
        .iter()
        .map(|channel| channel.acquire(DRY_RUN_OWNER))
        .collect::<Result<Vec<_>, _>>()?;

    writeln!(out, "Dry run on {} probe(s). Press any key to stop.", guards.len())?;
    let mut reads = 0;
    'cycle: loop {
        for guard in &mut guards {
            print_sample(guard, settle, out)?;
            reads += 1;
            if keys.poll_nonblocking() {
                break 'cycle;
            }
        }
        if guards.is_empty() {
            break;
        }
    }

    keys.consume_blocking()?;
    tracing::info!(reads, "Dry run finished");
    Ok(reads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockTransport;
    use crate::keypress::ScriptedKeypress;
    use crate::probe::Position;

    fn channel(kind: SensorKind) -> (SharedChannel, MockTransport) {
        let mock = MockTransport::new("mock").with_default_response(b"\x017.00");
        let id = SensorIdentity::new(kind, Position::FIRST);
        (SharedChannel::new(id, Box::new(mock.clone())), mock)
    }

    fn calibration_commands(mock: &MockTransport) -> Vec<String> {
        mock.commands().into_iter().filter(|c| c != "R").collect()
    }

    #[test]
    fn test_step_commands() {
        let ph = SensorKind::Ph;
        let ec = SensorKind::Conductivity;
        assert_eq!(CalibrationStep::Clear.command(ph), "cal,clear");
        assert_eq!(CalibrationStep::Mid.command(ph), "cal,mid,7.00");
        assert_eq!(CalibrationStep::Low.command(ph), "cal,low,4.00");
        assert_eq!(CalibrationStep::High.command(ph), "cal,high,10.00");
        assert_eq!(CalibrationStep::Dry.command(ec), "cal,dry");
        assert_eq!(CalibrationStep::Low.command(ec), "cal,low,12900");
        assert_eq!(CalibrationStep::High.command(ec), "cal,high,50000");
    }

    #[test]
    fn test_default_settle_times() {
        assert_eq!(
            CalibrationStep::Clear.default_settle(SensorKind::Ph),
            Duration::from_millis(300)
        );
        assert_eq!(
            CalibrationStep::Mid.default_settle(SensorKind::Ph),
            Duration::from_millis(900)
        );
        assert_eq!(
            CalibrationStep::Dry.default_settle(SensorKind::Conductivity),
            Duration::from_millis(600)
        );
    }

    #[test]
    fn test_full_conductivity_sequence() {
        let (channel, mock) = channel(SensorKind::Conductivity);
        let mut session = CalibrationSession::begin(&channel)
            .unwrap()
            .with_sample_settle(Duration::ZERO)
            .with_command_delay(Some(Duration::ZERO));
        assert_eq!(session.step(), Some(CalibrationStep::Clear));

        // Start, one idle poll, confirm; four times over
        let mut keys = ScriptedKeypress::new();
        for _ in 0..4 {
            keys = keys.key('\n').idle(1).key('\n');
        }
        let mut out = Vec::new();
        let outcome = session.run(&mut keys, &mut out).unwrap();

        assert_eq!(outcome, CalibrationOutcome::Completed);
        assert_eq!(session.state(), CalibrationState::Done);
        assert_eq!(session.step(), None);
        assert_eq!(
            calibration_commands(&mock),
            vec!["cal,clear", "cal,dry", "cal,low,12900", "cal,high,50000"]
        );
        assert!(channel.is_available());
    }

    #[test]
    fn test_abort_before_first_sample() {
        let (channel, mock) = channel(SensorKind::Ph);
        let mut session = CalibrationSession::begin(&channel).unwrap();
        let mut keys = ScriptedKeypress::new().key('q');
        let mut out = Vec::new();

        let outcome = session.run(&mut keys, &mut out).unwrap();
        assert_eq!(
            outcome,
            CalibrationOutcome::Aborted {
                at: CalibrationStep::Clear
            }
        );
        assert!(mock.commands().is_empty());
        assert!(channel.is_available());
    }

    #[test]
    fn test_abort_at_confirmation_sends_nothing_for_that_step() {
        let (channel, mock) = channel(SensorKind::Ph);
        let mut session = CalibrationSession::begin(&channel)
            .unwrap()
            .with_sample_settle(Duration::ZERO)
            .with_command_delay(Some(Duration::ZERO));
        // Commit clear, then quit at the mid point confirmation
        let mut keys = ScriptedKeypress::new()
            .key('\n')
            .key('\n')
            .key('\n')
            .idle(2)
            .key('q');
        let mut out = Vec::new();

        let outcome = session.run(&mut keys, &mut out).unwrap();
        assert_eq!(
            outcome,
            CalibrationOutcome::Aborted {
                at: CalibrationStep::Mid
            }
        );
        assert_eq!(calibration_commands(&mock), vec!["cal,clear"]);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("  ph1: 7.00"));
    }

    #[test]
    fn test_sampling_survives_transport_error() {
        let (channel, mock) = channel(SensorKind::Ph);
        mock.fail_next_read();
        let mut session = CalibrationSession::begin(&channel)
            .unwrap()
            .with_sample_settle(Duration::ZERO)
            .with_command_delay(Some(Duration::ZERO));
        let mut keys = ScriptedKeypress::new().key('\n').idle(1).key('q');
        let mut out = Vec::new();

        session.run(&mut keys, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("read failed"));
        assert!(text.contains("  ph1: 7.00"));
    }

    /// Injects a write failure once sampling has been stopped.
    struct FailAfterSample {
        keys: ScriptedKeypress,
        mock: MockTransport,
    }

    impl KeypressPoll for FailAfterSample {
        fn poll_nonblocking(&mut self) -> bool {
            let hit = self.keys.poll_nonblocking();
            if hit {
                self.mock.fail_next_write();
            }
            hit
        }

        fn consume_blocking(&mut self) -> Result<char, DaqError> {
            self.keys.consume_blocking()
        }

        fn discard_pending(&mut self) {
            self.keys.discard_pending();
        }
    }

    #[test]
    fn test_command_failure_aborts_session() {
        let (channel, mock) = channel(SensorKind::Ph);
        let mut session = CalibrationSession::begin(&channel)
            .unwrap()
            .with_sample_settle(Duration::ZERO)
            .with_command_delay(Some(Duration::ZERO));
        let mut keys = FailAfterSample {
            keys: ScriptedKeypress::new().key('\n').key('\n'),
            mock: mock.clone(),
        };
        let mut out = Vec::new();

        let err = session.run(&mut keys, &mut out).unwrap_err();
        assert!(matches!(err, DaqError::Transport { probe, .. } if probe == channel.identity()));
        assert_eq!(
            session.state(),
            CalibrationState::Aborted {
                at: CalibrationStep::Clear
            }
        );
        assert!(calibration_commands(&mock).is_empty());
        assert!(channel.is_available());
    }

    #[test]
    fn test_bare_ready_reply_is_accepted() {
        let mock = MockTransport::new("mock").with_default_response(b"\x01\0\0");
        let id = SensorIdentity::new(SensorKind::Ph, Position::FIRST);
        let channel = SharedChannel::new(id, Box::new(mock.clone()));
        let mut session = CalibrationSession::begin(&channel)
            .unwrap()
            .with_sample_settle(Duration::ZERO)
            .with_command_delay(Some(Duration::ZERO));
        let mut keys = ScriptedKeypress::new().key('\n').key('\n').key('q');
        let mut out = Vec::new();

        session.run(&mut keys, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Sent 'cal,clear': accepted"));
        assert!(text.contains("  ph1: empty response"));
    }

    #[test]
    fn test_interrupt_releases_channel() {
        let (channel, mock) = channel(SensorKind::Ph);
        let mut session = CalibrationSession::begin(&channel)
            .unwrap()
            .with_sample_settle(Duration::ZERO);
        let mut keys = ScriptedKeypress::new()
            .key('\n')
            .idle(1)
            .key(crate::keypress::INTERRUPT_KEY);
        let mut out = Vec::new();

        let err = session.run(&mut keys, &mut out).unwrap_err();
        assert!(matches!(err, DaqError::Interrupted));
        assert_eq!(
            session.state(),
            CalibrationState::Aborted {
                at: CalibrationStep::Clear
            }
        );
        assert!(calibration_commands(&mock).is_empty());
        assert!(channel.is_available());
    }

    #[test]
    fn test_begin_rejected_while_channel_held() {
        let (channel, _mock) = channel(SensorKind::Ph);
        let _scheduler = channel.acquire("scheduler").unwrap();
        assert!(matches!(
            CalibrationSession::begin(&channel),
            Err(DaqError::ChannelBusy { .. })
        ));
    }

    #[test]
    fn test_live_sample_cycles_until_key() {
        let (ph, ph_mock) = channel(SensorKind::Ph);
        let ec_mock = MockTransport::new("ec").with_default_response(b"\x011413,763,0.70");
        let ec = SharedChannel::new(
            SensorIdentity::new(SensorKind::Conductivity, Position::FIRST),
            Box::new(ec_mock.clone()),
        );
        let mut keys = ScriptedKeypress::new().idle(3).key('x');
        let mut out = Vec::new();

        let reads = live_sample(&[ph.clone(), ec.clone()], &mut keys, &mut out, Duration::ZERO).unwrap();

        assert_eq!(reads, 4);
        assert_eq!(ph_mock.commands().len(), 2);
        assert_eq!(ec_mock.commands().len(), 2);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("ec1: 1413"));
        assert!(ph.is_available() && ec.is_available());
    }
}
