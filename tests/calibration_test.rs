//! Interactive calibration against scripted probes and keys.

use probe_daq::calibration::{
    live_sample, CalibrationOutcome, CalibrationSession, CalibrationState, CalibrationStep,
};
use probe_daq::hardware::{MockTransport, SharedChannel};
use probe_daq::keypress::{KeypressPoll, ScriptedKeypress};
use probe_daq::probe::SensorIdentity;
use probe_daq::DaqError;
use std::time::Duration;

fn ph_channel() -> (SharedChannel, MockTransport) {
    let mock = MockTransport::new("ph1").with_default_response(b"\x016.98");
    let channel = SharedChannel::new("ph1".parse().unwrap(), Box::new(mock.clone()));
    (channel, mock)
}

fn session(channel: &SharedChannel) -> CalibrationSession {
    CalibrationSession::begin(channel)
        .unwrap()
        .with_sample_settle(Duration::ZERO)
        .with_command_delay(Some(Duration::ZERO))
}

/// Start, sample `samples` extra times, confirm; once per step.
fn confirm_every_step(steps: usize, samples: usize) -> ScriptedKeypress {
    (0..steps).fold(ScriptedKeypress::new(), |keys, _| {
        keys.key('\n').idle(samples).key('y')
    })
}

/// Keys that also try to start a collection on the channel whenever polled.
struct ContendingKeys {
    keys: ScriptedKeypress,
    channel: SharedChannel,
    rejected: usize,
    granted: usize,
}

impl KeypressPoll for ContendingKeys {
    fn poll_nonblocking(&mut self) -> bool {
        match self.channel.acquire("scheduler") {
            Err(DaqError::ChannelBusy { .. }) => self.rejected += 1,
            _ => self.granted += 1,
        }
        self.keys.poll_nonblocking()
    }

    fn consume_blocking(&mut self) -> Result<char, DaqError> {
        self.keys.consume_blocking()
    }

    fn discard_pending(&mut self) {
        self.keys.discard_pending();
    }
}

#[test]
fn test_ph_sequence_is_clear_mid_low_high() {
    let (channel, mock) = ph_channel();
    let mut session = session(&channel);
    assert_eq!(session.state(), CalibrationState::At(CalibrationStep::Clear));

    let mut keys = confirm_every_step(4, 1);
    let mut out = Vec::new();
    let outcome = session.run(&mut keys, &mut out).unwrap();

    assert_eq!(outcome, CalibrationOutcome::Completed);
    assert_eq!(session.state(), CalibrationState::Done);
    let sent: Vec<String> = mock
        .commands()
        .into_iter()
        .filter(|c| c.starts_with("cal,"))
        .collect();
    assert_eq!(
        sent,
        vec!["cal,clear", "cal,mid,7.00", "cal,low,4.00", "cal,high,10.00"]
    );

    // Each step: two samples before its command
    let all = mock.commands();
    let first_cal = all.iter().position(|c| c == "cal,clear").unwrap();
    assert_eq!(&all[..first_cal], ["R", "R"]);
}

#[test]
fn test_channel_locked_for_whole_session() {
    let (channel, _mock) = ph_channel();
    let mut session = session(&channel);
    let mut keys = ContendingKeys {
        keys: confirm_every_step(4, 2),
        channel: channel.clone(),
        rejected: 0,
        granted: 0,
    };
    let mut out = Vec::new();

    session.run(&mut keys, &mut out).unwrap();

    assert!(keys.rejected > 0);
    assert_eq!(keys.granted, 0);
    assert!(channel.is_available());
}

#[test]
fn test_quit_mid_sequence_keeps_remaining_steps_unsent() {
    let (channel, mock) = ph_channel();
    let mut session = session(&channel);
    // Clear and mid committed, quit when asked to start low
    let mut keys = confirm_every_step(2, 0).key('q');
    let mut out = Vec::new();

    let outcome = session.run(&mut keys, &mut out).unwrap();

    assert_eq!(
        outcome,
        CalibrationOutcome::Aborted {
            at: CalibrationStep::Low
        }
    );
    assert_eq!(session.step(), None);
    assert!(!mock.commands().iter().any(|c| c.starts_with("cal,low")));
    assert!(channel.is_available());

    // Running an ended session reports the same outcome without touching the probe
    let before = mock.commands().len();
    let again = session.run(&mut ScriptedKeypress::new(), &mut Vec::new()).unwrap();
    assert_eq!(again, outcome);
    assert_eq!(mock.commands().len(), before);
}

#[test]
fn test_arrow_key_commits_at_most_one_step() {
    let (channel, mock) = ph_channel();
    let mut session = session(&channel);
    // Up arrow (ESC [ A) stops the clear sampling; its tail is already buffered
    let mut keys = ScriptedKeypress::new()
        .key('\n')
        .idle(3)
        .key('\u{1b}')
        .typed_ahead("[A")
        .idle(100)
        .key('q');
    let mut out = Vec::new();

    let outcome = session.run(&mut keys, &mut out).unwrap();

    assert_eq!(
        outcome,
        CalibrationOutcome::Aborted {
            at: CalibrationStep::Mid
        }
    );
    assert_eq!(mock.commands(), vec!["R", "R", "R", "R", "cal,clear"]);
}

#[test]
fn test_live_values_shown_while_waiting() {
    let (channel, mock) = ph_channel();
    mock.push_pending();
    let mut session = session(&channel);
    let mut keys = ScriptedKeypress::new().key('\n').idle(1).key('q');
    let mut out = Vec::new();

    session.run(&mut keys, &mut out).unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("ph1: still processing"));
    assert!(text.contains("ph1: 6.98"));
}

#[test]
fn test_dry_run_rejected_while_calibrating() {
    let (channel, _mock) = ph_channel();
    let _session = session(&channel);
    let ec: SensorIdentity = "ec1".parse().unwrap();
    let other = SharedChannel::new(ec, Box::new(MockTransport::new("ec1")));

    let result = live_sample(
        &[other.clone(), channel.clone()],
        &mut ScriptedKeypress::new(),
        &mut Vec::new(),
        Duration::ZERO,
    );

    assert!(matches!(result, Err(DaqError::ChannelBusy { .. })));
    assert!(other.is_available());
}
