//! Probe identity.
//!
//! A probe is named by its kind and its position (1, 2 or 3) within that kind.
//! The position doubles as the field index of the probe in an output record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of chemical probe attached to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// pH probe.
    Ph,
    /// Electrical conductivity probe.
    #[serde(alias = "ec")]
    Conductivity,
}

impl SensorKind {
    /// Both kinds, in record emission order.
    pub const ALL: [SensorKind; 2] = [SensorKind::Ph, SensorKind::Conductivity];

    /// Short label used in probe names and JSON payloads.
    pub fn label(self) -> &'static str {
        match self {
            SensorKind::Ph => "ph",
            SensorKind::Conductivity => "ec",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Ph => write!(f, "pH"),
            SensorKind::Conductivity => write!(f, "conductivity"),
        }
    }
}

/// Position of a probe within its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Position(u8);

impl Position {
    /// Number of probes of each kind.
    pub const COUNT: usize = 3;

    /// Positions in round order.
    pub const ALL: [Position; 3] = [Position(1), Position(2), Position(3)];

    /// First position of a round; the record timestamp is taken here.
    pub const FIRST: Position = Position(1);

    /// Last position of a round; records complete here.
    pub const LAST: Position = Position(3);

    /// Create a position, rejecting anything outside 1..=3.
    pub fn new(value: u8) -> Option<Self> {
        (1..=Self::COUNT as u8).contains(&value).then_some(Self(value))
    }

    /// One-based value.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based slot index.
    pub fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl TryFrom<u8> for Position {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Position::new(value).ok_or_else(|| format!("position must be 1, 2 or 3, got {}", value))
    }
}

impl From<Position> for u8 {
    fn from(position: Position) -> Self {
        position.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one physical probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SensorIdentity {
    /// Probe kind.
    pub kind: SensorKind,
    /// Position within the kind.
    pub position: Position,
}

impl SensorIdentity {
    /// Build an identity.
    pub fn new(kind: SensorKind, position: Position) -> Self {
        Self { kind, position }
    }

    /// All six identities, pH first.
    pub fn all() -> impl Iterator<Item = SensorIdentity> {
        SensorKind::ALL
            .into_iter()
            .flat_map(|kind| Position::ALL.into_iter().map(move |p| SensorIdentity::new(kind, p)))
    }
}

impl fmt::Display for SensorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.label(), self.position)
    }
}

impl FromStr for SensorIdentity {
    type Err = String;

    /// Parses `ph1`..`ph3` and `ec1`..`ec3` (case-insensitive).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, rest) = if let Some(rest) = lower.strip_prefix("ph") {
            (SensorKind::Ph, rest)
        } else if let Some(rest) = lower.strip_prefix("ec") {
            (SensorKind::Conductivity, rest)
        } else {
            return Err(format!("unknown probe '{}', expected ph1..ph3 or ec1..ec3", s));
        };

        let position = rest
            .parse::<u8>()
            .ok()
            .and_then(Position::new)
            .ok_or_else(|| format!("unknown probe '{}', expected ph1..ph3 or ec1..ec3", s))?;

        Ok(SensorIdentity::new(kind, position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_bounds() {
        assert!(Position::new(0).is_none());
        assert!(Position::new(4).is_none());
        assert_eq!(Position::new(2).map(Position::index), Some(1));
    }

    #[test]
    fn test_identity_display_and_parse() {
        let id: SensorIdentity = "EC2".parse().unwrap();
        assert_eq!(id.kind, SensorKind::Conductivity);
        assert_eq!(id.position.get(), 2);
        assert_eq!(id.to_string(), "ec2");
        assert!("ph4".parse::<SensorIdentity>().is_err());
        assert!("do1".parse::<SensorIdentity>().is_err());
    }

    #[test]
    fn test_all_identities() {
        let all: Vec<String> = SensorIdentity::all().map(|id| id.to_string()).collect();
        assert_eq!(all, ["ph1", "ph2", "ph3", "ec1", "ec2", "ec3"]);
    }
}
