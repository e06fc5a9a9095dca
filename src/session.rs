//! Session timing: wall clock, session window and round pacing.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Wall-clock source for record timestamps and the session deadline.
pub trait Clock: Send + Sync {
    /// Current local time.
    fn now(&self) -> DateTime<Local>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock that advances by a fixed step on every read.
///
/// Useful for driving the session deadline deterministically.
#[derive(Debug)]
pub struct SteppingClock {
    next: Mutex<DateTime<Local>>,
    step: chrono::Duration,
}

impl SteppingClock {
    /// Start at `start`, advance by `step` after each call to [`Clock::now`].
    pub fn new(start: DateTime<Local>, step: Duration) -> Self {
        Self {
            next: Mutex::new(start),
            step: chrono::Duration::from_std(step).unwrap_or(chrono::Duration::zero()),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Local> {
        match self.next.lock() {
            Ok(mut next) => {
                let current = *next;
                *next = current + self.step;
                current
            }
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Time span a collection session may start rounds in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionWindow {
    /// Session start.
    pub start: DateTime<Local>,
    /// No round starts at or after this instant.
    pub end: DateTime<Local>,
}

impl SessionWindow {
    /// Window of `duration` beginning at `start`.
    pub fn starting_at(start: DateTime<Local>, duration: Duration) -> Self {
        let span = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let end = start.checked_add_signed(span).unwrap_or(start);
        Self { start, end }
    }

    /// Window of `duration` beginning now.
    pub fn open(clock: &dyn Clock, duration: Duration) -> Self {
        Self::starting_at(clock.now(), duration)
    }

    /// Whether a new round may start at `now`.
    pub fn admits(&self, now: DateTime<Local>) -> bool {
        now < self.end
    }
}

/// How the wait between rounds is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPacing {
    /// Fixed sleep after each round.
    #[default]
    Delay,
    /// Fixed period from round start to round start.
    Period,
}

impl RoundPacing {
    /// Sleep to insert after a round that took `elapsed`.
    pub fn pause_after(self, interval: Duration, elapsed: Duration) -> Duration {
        match self {
            RoundPacing::Delay => interval,
            RoundPacing::Period => interval.saturating_sub(elapsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_window_admits_until_end() {
        let window = SessionWindow::starting_at(t0(), Duration::from_secs(60));
        assert!(window.admits(t0()));
        assert!(window.admits(t0() + chrono::Duration::seconds(59)));
        assert!(!window.admits(t0() + chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_zero_window_admits_nothing() {
        let window = SessionWindow::starting_at(t0(), Duration::ZERO);
        assert!(!window.admits(t0()));
    }

    #[test]
    fn test_stepping_clock() {
        let clock = SteppingClock::new(t0(), Duration::from_secs(5));
        assert_eq!(clock.now(), t0());
        assert_eq!(clock.now(), t0() + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_pacing() {
        let interval = Duration::from_secs(15);
        let elapsed = Duration::from_secs(4);
        assert_eq!(RoundPacing::Delay.pause_after(interval, elapsed), interval);
        assert_eq!(
            RoundPacing::Period.pause_after(interval, elapsed),
            Duration::from_secs(11)
        );
        assert_eq!(
            RoundPacing::Period.pause_after(interval, Duration::from_secs(20)),
            Duration::ZERO
        );
    }
}
