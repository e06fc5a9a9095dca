//! Mock and simulated probe transports.
//!
//! - [`MockTransport`] - scripted responses, failure injection and a command
//!   log for test verification.
//! - [`SimulatedProbe`] - a free-running fake probe that answers read, info and
//!   calibration commands with plausible data. Backs the `--simulate` flag.

use crate::error::TransportError;
use crate::hardware::transport::{SensorTransport, MAX_RESPONSE_LEN};
use crate::probe::SensorKind;
use crate::reading::{STATUS_PENDING, STATUS_READY, STATUS_SYNTAX_ERROR};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct MockState {
    responses: VecDeque<Vec<u8>>,
    default_response: Vec<u8>,
    commands: Vec<String>,
}

/// Scripted transport for tests.
///
/// Clones share state, so a test can keep one handle and give another to a
/// channel.
///
/// # Example
///
/// ```
/// use probe_daq::hardware::{MockTransport, SensorTransport};
///
/// let mock = MockTransport::new("ph1");
/// mock.push_response(b"\x017.00");
/// let mut transport = mock.clone();
/// transport.write_command(b"R").unwrap();
/// let raw = transport.read_response(32).unwrap();
/// assert_eq!(&raw[..5], b"\x017.00");
/// assert_eq!(mock.commands(), vec!["R".to_string()]);
/// ```
#[derive(Clone)]
pub struct MockTransport {
    name: String,
    state: Arc<Mutex<MockState>>,
    fail_next_write: Arc<AtomicBool>,
    fail_next_read: Arc<AtomicBool>,
    latency: Arc<Mutex<Duration>>,
}

impl MockTransport {
    /// Create a mock whose unscripted reads report "still processing".
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MockState {
                default_response: vec![STATUS_PENDING],
                ..Default::default()
            })),
            fail_next_write: Arc::new(AtomicBool::new(false)),
            fail_next_read: Arc::new(AtomicBool::new(false)),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Set the response returned once the scripted queue is empty.
    pub fn with_default_response(self, raw: &[u8]) -> Self {
        self.with_state(|state| state.default_response = raw.to_vec());
        self
    }

    /// Simulated per-call latency.
    pub fn with_latency(self, latency: Duration) -> Self {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
        self
    }

    /// Queue a raw response (status byte + payload).
    pub fn push_response(&self, raw: &[u8]) {
        self.with_state(|state| state.responses.push_back(raw.to_vec()));
    }

    /// Queue a successful reading carrying `payload`.
    pub fn push_ready(&self, payload: &str) {
        let mut raw = vec![STATUS_READY];
        raw.extend_from_slice(payload.as_bytes());
        self.push_response(&raw);
    }

    /// Queue a "still processing" response.
    pub fn push_pending(&self) {
        self.push_response(&[STATUS_PENDING]);
    }

    /// Inject a failure for the next write.
    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    /// Inject a failure for the next read.
    pub fn fail_next_read(&self) {
        self.fail_next_read.store(true, Ordering::SeqCst);
    }

    /// Every command written so far, decoded as text.
    pub fn commands(&self) -> Vec<String> {
        self.with_state(|state| state.commands.clone())
    }

    /// Clear the command log.
    pub fn clear_log(&self) {
        self.with_state(|state| state.commands.clear());
    }

    fn with_state<R: Default>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        match self.state.lock() {
            Ok(mut state) => f(&mut state),
            Err(_) => R::default(),
        }
    }

    fn simulate_latency(&self) {
        let latency = self.latency.lock().map(|l| *l).unwrap_or_default();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }

    fn injected(&self, flag: &AtomicBool) -> Result<(), TransportError> {
        if flag.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Bus {
                target: self.name.clone(),
                reason: "Injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl SensorTransport for MockTransport {
    fn write_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        self.simulate_latency();
        self.injected(&self.fail_next_write)?;
        let text = String::from_utf8_lossy(cmd).into_owned();
        self.with_state(|state| state.commands.push(text));
        Ok(())
    }

    fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.simulate_latency();
        self.injected(&self.fail_next_read)?;
        let mut raw = self.with_state(|state| {
            state
                .responses
                .pop_front()
                .unwrap_or_else(|| state.default_response.clone())
        });
        // Devices always return a full, NUL padded buffer
        raw.resize(max_len.min(MAX_RESPONSE_LEN), 0);
        Ok(raw)
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Free-running fake probe.
///
/// Answers `R` with a reading around a nominal value, `i` with a device info
/// string and any `cal,...` command with a bare success status.
pub struct SimulatedProbe {
    kind: SensorKind,
    name: String,
    nominal: f64,
    last_command: Option<String>,
}

impl SimulatedProbe {
    /// Create a fake probe of `kind`.
    pub fn new(kind: SensorKind, name: impl Into<String>) -> Self {
        let nominal = match kind {
            SensorKind::Ph => 7.0,
            SensorKind::Conductivity => 1413.0,
        };
        Self {
            kind,
            name: name.into(),
            nominal,
            last_command: None,
        }
    }

    fn reading(&self) -> String {
        let mut rng = rand::thread_rng();
        match self.kind {
            SensorKind::Ph => format!("{:.2}", self.nominal + rng.gen_range(-0.05..0.05)),
            SensorKind::Conductivity => {
                let ec = self.nominal + rng.gen_range(-15.0..15.0);
                // EC, TDS, salinity, specific gravity
                format!("{:.0},{:.0},{:.2},1.000", ec, ec * 0.54, ec / 2000.0)
            }
        }
    }

    fn respond(&self) -> Vec<u8> {
        let command = self.last_command.as_deref().unwrap_or_default();
        let (status, payload) = if command.eq_ignore_ascii_case("r") {
            (STATUS_READY, self.reading())
        } else if command.eq_ignore_ascii_case("i") {
            let device = match self.kind {
                SensorKind::Ph => "pH",
                SensorKind::Conductivity => "EC",
            };
            (STATUS_READY, format!("?i,{},2.10", device))
        } else if command.to_ascii_lowercase().starts_with("cal,") {
            (STATUS_READY, String::new())
        } else {
            (STATUS_SYNTAX_ERROR, String::new())
        };

        let mut raw = vec![status];
        raw.extend_from_slice(payload.as_bytes());
        raw
    }
}

impl SensorTransport for SimulatedProbe {
    fn write_command(&mut self, cmd: &[u8]) -> Result<(), TransportError> {
        self.last_command = Some(String::from_utf8_lossy(cmd).into_owned());
        Ok(())
    }

    fn read_response(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut raw = self.respond();
        raw.resize(max_len.min(MAX_RESPONSE_LEN), 0);
        Ok(raw)
    }

    fn describe(&self) -> String {
        format!("simulated:{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_scripted_then_default() {
        let mut mock = MockTransport::new("m");
        mock.push_ready("7.01");

        let first = mock.read_response(32).unwrap();
        assert_eq!(first[0], STATUS_READY);
        assert_eq!(&first[1..5], b"7.01");
        assert_eq!(first.len(), 32);

        let second = mock.read_response(32).unwrap();
        assert_eq!(second[0], STATUS_PENDING);
    }

    #[test]
    fn test_mock_failure_injection() {
        let mut mock = MockTransport::new("m");
        mock.fail_next_write();
        assert!(mock.write_command(b"R").is_err());
        // Failure should be consumed
        assert!(mock.write_command(b"R").is_ok());
        assert_eq!(mock.commands().len(), 1);
    }

    #[test]
    fn test_mock_clear_log() {
        let mut mock = MockTransport::new("m");
        mock.write_command(b"cal,clear").unwrap();
        assert_eq!(mock.commands(), vec!["cal,clear".to_string()]);
        mock.clear_log();
        assert!(mock.commands().is_empty());
    }

    #[test]
    fn test_simulated_probe_answers() {
        let mut probe = SimulatedProbe::new(SensorKind::Conductivity, "ec1");

        probe.write_command(b"R").unwrap();
        let raw = probe.read_response(32).unwrap();
        assert_eq!(raw[0], STATUS_READY);
        let text = String::from_utf8_lossy(&raw[1..]);
        assert_eq!(text.trim_end_matches('\0').split(',').count(), 4);

        probe.write_command(b"cal,dry").unwrap();
        assert_eq!(probe.read_response(32).unwrap()[0], STATUS_READY);

        probe.write_command(b"bogus").unwrap();
        assert_eq!(probe.read_response(32).unwrap()[0], STATUS_SYNTAX_ERROR);
    }
}
