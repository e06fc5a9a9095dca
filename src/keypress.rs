//! Operator keypress capability.
//!
//! Calibration and dry-run loops keep sampling while waiting for the operator,
//! so they need a check that never blocks and never eats the key it saw. The
//! key itself is read afterwards with [`KeypressPoll::consume_blocking`].
//!
//! Keys typed ahead of a prompt (the tail of an arrow-key escape sequence, a
//! double press) are dropped with [`KeypressPoll::discard_pending`] before the
//! prompt is shown, so one keystroke never answers two prompts.

use crate::error::DaqError;
use std::collections::VecDeque;

/// Ctrl-C as read from a terminal in key-at-a-time mode.
pub const INTERRUPT_KEY: char = '\u{3}';

/// Non-blocking keypress detection plus a blocking read.
pub trait KeypressPoll {
    /// True if a key is waiting. Must not block and must not consume it.
    fn poll_nonblocking(&mut self) -> bool;

    /// Block until a key is available and return it.
    ///
    /// Ctrl-C fails with [`DaqError::Interrupted`].
    fn consume_blocking(&mut self) -> Result<char, DaqError>;

    /// Drop every key already waiting.
    fn discard_pending(&mut self);
}

fn checked_key(key: char) -> Result<char, DaqError> {
    if key == INTERRUPT_KEY {
        Err(DaqError::Interrupted)
    } else {
        Ok(key)
    }
}

/// Scripted keypresses.
///
/// Each entry in the script is either a number of polls that report "no key"
/// before a key becomes visible, or the key itself. Keys added with
/// [`ScriptedKeypress::typed_ahead`] are already buffered when the program
/// next looks, and are dropped by [`KeypressPoll::discard_pending`].
///
/// # Example
///
/// ```
/// use probe_daq::keypress::{KeypressPoll, ScriptedKeypress};
///
/// // Start immediately, sample twice, then confirm with Enter.
/// let mut keys = ScriptedKeypress::new().key('\n').idle(2).key('\n');
/// assert_eq!(keys.consume_blocking().unwrap(), '\n');
/// assert!(!keys.poll_nonblocking());
/// assert!(!keys.poll_nonblocking());
/// assert!(keys.poll_nonblocking());
/// assert_eq!(keys.consume_blocking().unwrap(), '\n');
/// ```
#[derive(Debug, Default)]
pub struct ScriptedKeypress {
    script: VecDeque<ScriptEntry>,
    polls: usize,
}

#[derive(Debug)]
enum ScriptEntry {
    Idle(usize),
    Key(char),
    Buffered(char),
}

impl ScriptedKeypress {
    /// Empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report no key for the next `polls` polls.
    pub fn idle(mut self, polls: usize) -> Self {
        self.script.push_back(ScriptEntry::Idle(polls));
        self
    }

    /// Make `key` available.
    pub fn key(mut self, key: char) -> Self {
        self.script.push_back(ScriptEntry::Key(key));
        self
    }

    /// Make `keys` available at once, as if typed ahead of the next prompt.
    pub fn typed_ahead(mut self, keys: &str) -> Self {
        self.script.extend(keys.chars().map(ScriptEntry::Buffered));
        self
    }

    /// Total polls observed.
    pub fn polls(&self) -> usize {
        self.polls
    }

    fn skip_exhausted_idles(&mut self) {
        while let Some(ScriptEntry::Idle(0)) = self.script.front() {
            self.script.pop_front();
        }
    }
}

impl KeypressPoll for ScriptedKeypress {
    fn poll_nonblocking(&mut self) -> bool {
        self.polls += 1;
        self.skip_exhausted_idles();
        match self.script.front_mut() {
            Some(ScriptEntry::Idle(remaining)) => {
                *remaining -= 1;
                false
            }
            Some(ScriptEntry::Key(_) | ScriptEntry::Buffered(_)) => true,
            // An exhausted script behaves like an operator pressing Enter
            None => true,
        }
    }

    fn consume_blocking(&mut self) -> Result<char, DaqError> {
        loop {
            match self.script.pop_front() {
                Some(ScriptEntry::Key(key) | ScriptEntry::Buffered(key)) => return checked_key(key),
                Some(ScriptEntry::Idle(_)) => continue,
                None => return Ok('\n'),
            }
        }
    }

    fn discard_pending(&mut self) {
        self.skip_exhausted_idles();
        while let Some(ScriptEntry::Buffered(_)) = self.script.front() {
            self.script.pop_front();
        }
    }
}

#[cfg(unix)]
pub use terminal::TerminalKeypress;

#[cfg(unix)]
mod terminal {
    use super::KeypressPoll;
    use crate::error::DaqError;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::termios::{
        self, FlushArg, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
    };
    use std::fs::{File, OpenOptions};
    use std::io::Read;
    use std::os::fd::AsFd;

    /// Keypress source on the controlling terminal.
    ///
    /// Switches `/dev/tty` to non-canonical, no-echo mode for its lifetime so
    /// single keys are visible without Enter. Signal generation is off as
    /// well: Ctrl-C arrives as a key and surfaces as
    /// [`DaqError::Interrupted`], so the previous mode is always restored on
    /// drop. The tty is read unbuffered, so a poll never misses bytes hidden in
    /// a userspace buffer.
    pub struct TerminalKeypress {
        tty: File,
        saved: Termios,
    }

    impl TerminalKeypress {
        /// Open the controlling terminal and enter key-at-a-time mode.
        pub fn open() -> Result<Self, DaqError> {
            let tty = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/tty")
                .map_err(|e| DaqError::Terminal(format!("cannot open /dev/tty: {}", e)))?;

            let saved = termios::tcgetattr(tty.as_fd())
                .map_err(|e| DaqError::Terminal(format!("tcgetattr failed: {}", e)))?;

            let mut raw = saved.clone();
            raw.local_flags
                .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
            raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
            raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
            termios::tcsetattr(tty.as_fd(), SetArg::TCSANOW, &raw)
                .map_err(|e| DaqError::Terminal(format!("tcsetattr failed: {}", e)))?;

            Ok(Self { tty, saved })
        }
    }

    impl KeypressPoll for TerminalKeypress {
        fn poll_nonblocking(&mut self) -> bool {
            let mut fds = [PollFd::new(self.tty.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::ZERO) {
                Ok(n) if n > 0 => fds[0]
                    .revents()
                    .map_or(false, |events| events.contains(PollFlags::POLLIN)),
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!(error = %e, "Keypress poll failed");
                    false
                }
            }
        }

        fn consume_blocking(&mut self) -> Result<char, DaqError> {
            let mut byte = [0u8; 1];
            self.tty
                .read_exact(&mut byte)
                .map_err(|e| DaqError::Terminal(format!("read from /dev/tty failed: {}", e)))?;
            super::checked_key(char::from(byte[0]))
        }

        fn discard_pending(&mut self) {
            if let Err(e) = termios::tcflush(self.tty.as_fd(), FlushArg::TCIFLUSH) {
                tracing::warn!(error = %e, "Failed to discard pending keys");
            }
        }
    }

    impl Drop for TerminalKeypress {
        fn drop(&mut self) {
            if let Err(e) = termios::tcsetattr(self.tty.as_fd(), SetArg::TCSANOW, &self.saved) {
                tracing::warn!(error = %e, "Failed to restore terminal mode");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_does_not_consume() {
        let mut keys = ScriptedKeypress::new().key('y');
        assert!(keys.poll_nonblocking());
        assert!(keys.poll_nonblocking());
        assert_eq!(keys.consume_blocking().unwrap(), 'y');
    }

    #[test]
    fn test_idle_then_key() {
        let mut keys = ScriptedKeypress::new().idle(3).key('q');
        let misses = (0..3).filter(|_| !keys.poll_nonblocking()).count();
        assert_eq!(misses, 3);
        assert!(keys.poll_nonblocking());
        assert_eq!(keys.polls(), 4);
        assert_eq!(keys.consume_blocking().unwrap(), 'q');
    }

    #[test]
    fn test_consume_skips_pending_idle() {
        let mut keys = ScriptedKeypress::new().idle(5).key('a');
        assert_eq!(keys.consume_blocking().unwrap(), 'a');
    }

    #[test]
    fn test_discard_drops_only_typed_ahead_keys() {
        let mut keys = ScriptedKeypress::new()
            .typed_ahead("[A")
            .idle(2)
            .key('y');
        assert!(keys.poll_nonblocking());
        keys.discard_pending();
        assert!(!keys.poll_nonblocking());
        assert!(!keys.poll_nonblocking());
        assert!(keys.poll_nonblocking());
        keys.discard_pending();
        assert_eq!(keys.consume_blocking().unwrap(), 'y');
    }

    #[test]
    fn test_ctrl_c_interrupts() {
        let mut keys = ScriptedKeypress::new().key(INTERRUPT_KEY);
        assert!(keys.poll_nonblocking());
        assert!(matches!(keys.consume_blocking(), Err(DaqError::Interrupted)));
    }

    #[test]
    fn test_exhausted_script_presses_enter() {
        let mut keys = ScriptedKeypress::new();
        assert!(keys.poll_nonblocking());
        assert_eq!(keys.consume_blocking().unwrap(), '\n');
    }
}
