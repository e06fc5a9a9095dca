//! Round record assembly.
//!
//! One [`RoundRecord`] exists per probe kind per round. Each position of the
//! round contributes at most one field; the timestamp is taken at position 1
//! and reused for the rest of the round. After position 3 the record is either
//! turned into a [`CompletedRecord`] for the sinks or withheld, depending on
//! the [`MissingFieldPolicy`].

use crate::probe::{Position, SensorKind};
use crate::reading::InterpretedReading;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Record timestamp format: date and time as two CSV columns.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d,%H:%M";

/// What to do with a record that is missing a position after the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFieldPolicy {
    /// Withhold the record entirely. Sinks only ever see full records.
    #[default]
    Drop,
    /// Emit the record with an empty field for each missing position.
    EmptyField,
}

/// Record under construction for one probe kind and one round.
#[derive(Debug, Clone)]
pub struct RoundRecord {
    kind: SensorKind,
    timestamp: Option<DateTime<Local>>,
    fields: [Option<String>; Position::COUNT],
}

impl RoundRecord {
    /// Empty record for `kind`.
    pub fn new(kind: SensorKind) -> Self {
        Self {
            kind,
            timestamp: None,
            fields: Default::default(),
        }
    }

    /// Probe kind this record collects.
    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Timestamp stamped at position 1, if reached.
    pub fn timestamp(&self) -> Option<DateTime<Local>> {
        self.timestamp
    }

    /// Field contributed at `position`, if any.
    pub fn field(&self, position: Position) -> Option<&str> {
        self.fields[position.index()].as_deref()
    }

    /// Add the reading taken at `position`.
    ///
    /// Position 1 stamps the record. Only `Ready` readings fill a field; a
    /// pending or malformed reading leaves the position empty. Returns whether
    /// a field was filled.
    pub fn contribute(
        &mut self,
        position: Position,
        timestamp: DateTime<Local>,
        reading: &InterpretedReading,
    ) -> bool {
        self.stamp_if_first(position, timestamp);
        match reading.payload() {
            Some(payload) => {
                self.fields[position.index()] = Some(payload.to_string());
                true
            }
            None => false,
        }
    }

    /// Record that `position` produced nothing (e.g. the transport failed).
    pub fn skip(&mut self, position: Position, timestamp: DateTime<Local>) {
        self.stamp_if_first(position, timestamp);
    }

    fn stamp_if_first(&mut self, position: Position, timestamp: DateTime<Local>) {
        if position == Position::FIRST {
            self.timestamp = Some(timestamp);
        }
    }

    /// Positions that have not contributed a field.
    pub fn missing_positions(&self) -> Vec<Position> {
        Position::ALL
            .into_iter()
            .filter(|p| self.fields[p.index()].is_none())
            .collect()
    }

    /// Whether every position has contributed.
    pub fn is_full(&self) -> bool {
        self.timestamp.is_some() && self.fields.iter().all(Option::is_some)
    }

    /// Finish the round.
    ///
    /// Returns `None` when the record must not reach a sink: it was never
    /// stamped, or a position is missing under [`MissingFieldPolicy::Drop`].
    pub fn complete(self, policy: MissingFieldPolicy) -> Option<CompletedRecord> {
        let timestamp = self.timestamp?;
        if policy == MissingFieldPolicy::Drop && !self.is_full() {
            return None;
        }

        Some(CompletedRecord {
            kind: self.kind,
            timestamp,
            fields: self
                .fields
                .into_iter()
                .map(Option::unwrap_or_default)
                .collect(),
        })
    }
}

/// Contribute a reading from the probe of `kind` at `position` to `record`.
pub fn contribute(
    record: &mut RoundRecord,
    kind: SensorKind,
    position: Position,
    timestamp: DateTime<Local>,
    reading: &InterpretedReading,
) -> bool {
    debug_assert_eq!(record.kind(), kind, "reading routed to the wrong record");
    record.contribute(position, timestamp, reading)
}

/// A finished record, ready for the sinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRecord {
    /// Probe kind.
    pub kind: SensorKind,
    /// Time the round started (position 1).
    pub timestamp: DateTime<Local>,
    /// One field per position, in position order.
    pub fields: Vec<String>,
}

/// Bus payload in JSON form.
#[derive(Debug, Serialize)]
struct RecordMessage<'a> {
    controller_id: &'a str,
    kind: &'static str,
    date: String,
    time: String,
    data1: &'a str,
    data2: &'a str,
    data3: &'a str,
}

impl CompletedRecord {
    /// `YYYY-MM-DD`
    pub fn date(&self) -> String {
        self.timestamp.format("%Y-%m-%d").to_string()
    }

    /// `HH:MM`
    pub fn time(&self) -> String {
        self.timestamp.format("%H:%M").to_string()
    }

    /// `YYYY-MM-DD,HH:MM`
    pub fn timestamp_text(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// `YYYY-MM-DD,HH:MM,f1,f2,f3`
    pub fn to_line(&self) -> String {
        let mut line = self.timestamp_text();
        for field in &self.fields {
            line.push(',');
            line.push_str(field);
        }
        line
    }

    /// JSON message tagged with the controller id.
    pub fn to_json(&self, controller_id: &str) -> Result<String, serde_json::Error> {
        let field = |i: usize| self.fields.get(i).map(String::as_str).unwrap_or_default();
        serde_json::to_string(&RecordMessage {
            controller_id,
            kind: self.kind.label(),
            date: self.date(),
            time: self.time(),
            data1: field(0),
            data2: field(1),
            data3: field(2),
        })
    }
}
