//! Round-based acquisition scheduler.
//!
//! A session is a sequence of rounds. A round visits positions 1, 2 and 3 in
//! order; at each position the pH and conductivity probes are read by two
//! blocking workers running side by side, and both are joined before the next
//! position starts. Each worker owns its channel guard and its kind's
//! [`RoundRecord`] while it runs and hands both back when it finishes, so no
//! lock protects the records.
//!
//! After position 3 the two records are completed and handed to the sinks,
//! then the inter-round pause runs. The deadline and the shutdown signal are
//! only checked between rounds: a round that has started always finishes.

use crate::config::AcquisitionConfig;
use crate::error::DaqError;
use crate::hardware::{ChannelGuard, ProbeArray, READ_COMMAND};
use crate::probe::{Position, SensorIdentity, SensorKind};
use crate::reading::{interpret_for, InterpretedReading};
use crate::record::{contribute, MissingFieldPolicy, RoundRecord};
use crate::session::{Clock, RoundPacing, SessionWindow};
use crate::sink::SinkSet;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Owner name the scheduler acquires channels under.
pub const SCHEDULER_OWNER: &str = "scheduler";

/// Timing parameters of a collection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionTiming {
    /// Wait between the read command and reading the response.
    pub settle: Duration,
    /// Pause between rounds (see `pacing`).
    pub inter_round_delay: Duration,
    /// How the pause is measured.
    pub pacing: RoundPacing,
    /// Stop after this many rounds.
    pub max_rounds: Option<u64>,
}

impl AcquisitionTiming {
    /// Timing from the acquisition configuration.
    pub fn from_config(config: &AcquisitionConfig) -> Self {
        Self {
            settle: config.settle_delay(),
            inter_round_delay: config.inter_round_delay(),
            pacing: config.pacing,
            max_rounds: config.max_rounds,
        }
    }

    fn limit_reached(&self, rounds: u64) -> bool {
        self.max_rounds.is_some_and(|max| rounds >= max)
    }
}

/// What a finished session did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Rounds started (and therefore finished).
    pub rounds: u64,
    /// Records handed to the sinks.
    pub records_emitted: u64,
    /// Records withheld because a position was missing.
    pub records_dropped: u64,
    /// Individual sink writes that failed.
    pub sink_failures: u64,
}

/// Drives collection rounds until the session window closes.
pub struct AcquisitionScheduler {
    timing: AcquisitionTiming,
    clock: Arc<dyn Clock>,
    policy: MissingFieldPolicy,
}

/// One worker's belongings, moved into the worker and handed back.
struct Slot {
    guard: Option<ChannelGuard>,
    record: Option<RoundRecord>,
}

impl AcquisitionScheduler {
    /// Create a scheduler.
    pub fn new(timing: AcquisitionTiming, clock: Arc<dyn Clock>, policy: MissingFieldPolicy) -> Self {
        Self {
            timing,
            clock,
            policy,
        }
    }

    /// Run one collection session.
    ///
    /// Every channel is acquired up front; if any is held elsewhere (for
    /// example by a calibration session) the session does not start and
    /// [`DaqError::ChannelBusy`] is returned. All channels are released when
    /// the session ends.
    pub async fn run(
        &self,
        probes: &ProbeArray,
        sinks: &mut SinkSet,
        window: SessionWindow,
    ) -> Result<SessionSummary, DaqError> {
        self.run_until(probes, sinks, window, std::future::pending())
            .await
    }

    /// Run one collection session that also ends once `shutdown` resolves.
    ///
    /// The signal is honoured between rounds and during the inter-round
    /// pause; a round in flight when it fires still completes and its
    /// records reach the sinks.
    pub async fn run_until<F>(
        &self,
        probes: &ProbeArray,
        sinks: &mut SinkSet,
        window: SessionWindow,
        shutdown: F,
    ) -> Result<SessionSummary, DaqError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut guards = HashMap::new();
        for identity in SensorIdentity::all() {
            let guard = probes.channel(identity)?.acquire(SCHEDULER_OWNER)?;
            guards.insert(identity, guard);
        }

        tracing::info!(
            start = %window.start.format("%Y-%m-%d %H:%M:%S"),
            end = %window.end.format("%Y-%m-%d %H:%M:%S"),
            settle_ms = self.timing.settle.as_millis() as u64,
            "Collection session started"
        );

        let mut summary = SessionSummary::default();
        let mut stopping = false;
        loop {
            if !stopping {
                stopping = tokio::select! {
                    biased;
                    () = &mut shutdown => true,
                    () = std::future::ready(()) => false,
                };
            }
            if stopping {
                tracing::info!(rounds = summary.rounds, "Shutdown requested");
                break;
            }
            if self.timing.limit_reached(summary.rounds) {
                tracing::info!(rounds = summary.rounds, "Round limit reached");
                break;
            }
            let round_start = self.clock.now();
            if !window.admits(round_start) {
                tracing::info!(rounds = summary.rounds, "Session deadline reached");
                break;
            }

            summary.rounds += 1;
            let started = Instant::now();
            self.reacquire_lost(probes, &mut guards);
            self.run_round(summary.rounds, round_start, &mut guards, sinks, &mut summary)
                .await;

            if self.timing.limit_reached(summary.rounds) || !window.admits(self.clock.now()) {
                continue;
            }
            let pause = self
                .timing
                .pacing
                .pause_after(self.timing.inter_round_delay, started.elapsed());
            if !pause.is_zero() {
                tracing::debug!(pause_ms = pause.as_millis() as u64, "Waiting for next round");
                tokio::select! {
                    () = tokio::time::sleep(pause) => {}
                    () = &mut shutdown => stopping = true,
                }
            }
        }

        tracing::info!(
            rounds = summary.rounds,
            emitted = summary.records_emitted,
            dropped = summary.records_dropped,
            sink_failures = summary.sink_failures,
            "Collection session finished"
        );
        Ok(summary)
    }

    /// Re-acquire channels whose guard was lost with a panicked worker.
    fn reacquire_lost(&self, probes: &ProbeArray, guards: &mut HashMap<SensorIdentity, ChannelGuard>) {
        for identity in SensorIdentity::all() {
            if guards.contains_key(&identity) {
                continue;
            }
            match probes
                .channel(identity)
                .and_then(|channel| channel.acquire(SCHEDULER_OWNER))
            {
                Ok(guard) => {
                    tracing::info!(probe = %identity, "Channel re-acquired");
                    guards.insert(identity, guard);
                }
                Err(e) => tracing::warn!(probe = %identity, error = %e, "Channel still unavailable"),
            }
        }
    }

    async fn run_round(
        &self,
        round: u64,
        timestamp: DateTime<Local>,
        guards: &mut HashMap<SensorIdentity, ChannelGuard>,
        sinks: &mut SinkSet,
        summary: &mut SessionSummary,
    ) {
        tracing::debug!(round, "Round started");
        let mut ph_record = Some(RoundRecord::new(SensorKind::Ph));
        let mut ec_record = Some(RoundRecord::new(SensorKind::Conductivity));

        for position in Position::ALL {
            let ph_id = SensorIdentity::new(SensorKind::Ph, position);
            let ec_id = SensorIdentity::new(SensorKind::Conductivity, position);

            let ph = Slot {
                guard: guards.remove(&ph_id),
                record: ph_record.take(),
            };
            let ec = Slot {
                guard: guards.remove(&ec_id),
                record: ec_record.take(),
            };

            let (ph, ec) = tokio::join!(
                self.read_slot(ph_id, ph, timestamp, round),
                self.read_slot(ec_id, ec, timestamp, round),
            );

            for (identity, slot, record) in [(ph_id, ph, &mut ph_record), (ec_id, ec, &mut ec_record)] {
                if let Some(guard) = slot.guard {
                    guards.insert(identity, guard);
                }
                *record = slot.record;
            }
        }

        for (kind, record) in [(SensorKind::Ph, ph_record), (SensorKind::Conductivity, ec_record)] {
            let missing: Vec<u8> = record
                .as_ref()
                .map(|r| r.missing_positions().into_iter().map(Position::get).collect())
                .unwrap_or_default();
            match record.and_then(|r| r.complete(self.policy)) {
                Some(completed) => {
                    tracing::debug!(round, kind = %kind, line = %completed.to_line(), "Record completed");
                    summary.sink_failures += sinks.emit(completed).await as u64;
                    summary.records_emitted += 1;
                }
                None => {
                    tracing::info!(round, kind = %kind, ?missing, "Record incomplete, not written");
                    summary.records_dropped += 1;
                }
            }
        }
    }

    /// Read one probe on a blocking worker and fold the result into its record.
    async fn read_slot(
        &self,
        identity: SensorIdentity,
        slot: Slot,
        timestamp: DateTime<Local>,
        round: u64,
    ) -> Slot {
        let position = identity.position;
        let Slot { guard, record } = slot;
        let Some(mut record) = record else {
            return Slot {
                guard,
                record: None,
            };
        };
        let Some(mut guard) = guard else {
            tracing::warn!(probe = %identity, round, position = position.get(), "No channel, position skipped");
            record.skip(position, timestamp);
            return Slot {
                guard: None,
                record: Some(record),
            };
        };

        let settle = self.timing.settle;
        let worker = tokio::task::spawn_blocking(move || {
            match guard.query(READ_COMMAND, settle) {
                Ok(raw) => {
                    let reading = interpret_for(identity.kind, &raw);
                    log_reading(identity, round, &reading);
                    contribute(&mut record, identity.kind, position, timestamp, &reading);
                }
                Err(e) => {
                    tracing::warn!(
                        probe = %identity,
                        round,
                        position = position.get(),
                        error = %e,
                        "Transport error, position skipped"
                    );
                    record.skip(position, timestamp);
                }
            }
            (guard, record)
        });

        match worker.await {
            Ok((guard, record)) => Slot {
                guard: Some(guard),
                record: Some(record),
            },
            Err(e) => {
                tracing::error!(probe = %identity, round, error = %e, "Read worker failed");
                Slot {
                    guard: None,
                    record: None,
                }
            }
        }
    }
}

fn log_reading(identity: SensorIdentity, round: u64, reading: &InterpretedReading) {
    let position = identity.position.get();
    match reading {
        InterpretedReading::Ready(value) => {
            tracing::debug!(probe = %identity, round, position, value = %value, "Reading");
        }
        InterpretedReading::Pending => {
            tracing::info!(probe = %identity, round, position, "Probe still processing, position left empty");
        }
        InterpretedReading::Malformed(reason) => {
            tracing::warn!(probe = %identity, round, position, %reason, "Malformed reading, position left empty");
        }
    }
}
