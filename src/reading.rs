//! Reading interpretation.
//!
//! A raw probe response is a status byte followed by a NUL padded ASCII
//! payload. [`interpret`] classifies it; [`interpret_for`] additionally applies
//! the per-kind payload rule (conductivity keeps only its first field).

use crate::probe::SensorKind;
use std::fmt;

/// Status byte: reading complete, payload follows.
pub const STATUS_READY: u8 = 1;
/// Status byte: command not understood.
pub const STATUS_SYNTAX_ERROR: u8 = 2;
/// Status byte: conversion still running.
pub const STATUS_PENDING: u8 = 254;
/// Status byte: nothing to send.
pub const STATUS_NO_DATA: u8 = 255;

/// Outcome of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpretedReading {
    /// Reading complete.
    Ready(String),
    /// Device has not finished converting; retry on the next poll.
    Pending,
    /// Anything else. Scheduled like `Pending`.
    Malformed(MalformedReason),
}

/// Why a response could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// Zero-length response or a ready status with no payload.
    Empty,
    /// Device rejected the command.
    SyntaxError,
    /// Device had nothing to report.
    NoData,
    /// Unexpected leading byte.
    UnknownStatus(u8),
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::Empty => write!(f, "empty response"),
            MalformedReason::SyntaxError => write!(f, "error {}", STATUS_SYNTAX_ERROR),
            MalformedReason::NoData => write!(f, "error {}", STATUS_NO_DATA),
            MalformedReason::UnknownStatus(code) => write!(f, "error {}", code),
        }
    }
}

impl InterpretedReading {
    /// Payload of a ready reading.
    pub fn payload(&self) -> Option<&str> {
        match self {
            InterpretedReading::Ready(payload) => Some(payload),
            _ => None,
        }
    }

    /// Short text for operator display.
    pub fn status_label(&self) -> String {
        match self {
            InterpretedReading::Ready(payload) => payload.clone(),
            InterpretedReading::Pending => "still processing".to_string(),
            InterpretedReading::Malformed(reason) => reason.to_string(),
        }
    }
}

/// Classify a raw response.
pub fn interpret(raw: &[u8]) -> InterpretedReading {
    let Some((&status, body)) = raw.split_first() else {
        return InterpretedReading::Malformed(MalformedReason::Empty);
    };

    match status {
        STATUS_READY => ready(decode_payload(body)),
        STATUS_PENDING => InterpretedReading::Pending,
        STATUS_SYNTAX_ERROR => InterpretedReading::Malformed(MalformedReason::SyntaxError),
        STATUS_NO_DATA => InterpretedReading::Malformed(MalformedReason::NoData),
        other => InterpretedReading::Malformed(MalformedReason::UnknownStatus(other)),
    }
}

/// Classify a raw response from a probe of `kind`.
///
/// Conductivity probes report `EC,TDS,salinity,...`; only the EC field is kept.
pub fn interpret_for(kind: SensorKind, raw: &[u8]) -> InterpretedReading {
    match interpret(raw) {
        InterpretedReading::Ready(payload) if kind == SensorKind::Conductivity => {
            let first = payload.split(',').next().unwrap_or_default();
            ready(first.trim().to_string())
        }
        other => other,
    }
}

fn ready(payload: String) -> InterpretedReading {
    if payload.is_empty() {
        InterpretedReading::Malformed(MalformedReason::Empty)
    } else {
        InterpretedReading::Ready(payload)
    }
}

/// Payload up to the first NUL, as 7-bit ASCII.
fn decode_payload(body: &[u8]) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    // The Pi's I2C controller occasionally sets the high bit on stretched bytes
    body[..end]
        .iter()
        .map(|b| char::from(b & 0x7f))
        .collect::<String>()
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_cut_at_first_nul() {
        let raw = b"\x017.01\0\0garbage\0";
        assert_eq!(interpret(raw), InterpretedReading::Ready("7.01".into()));
    }

    #[test]
    fn test_ready_without_padding() {
        assert_eq!(interpret(b"\x014.00"), InterpretedReading::Ready("4.00".into()));
    }

    #[test]
    fn test_pending() {
        let mut raw = vec![STATUS_PENDING];
        raw.resize(32, 0);
        assert_eq!(interpret(&raw), InterpretedReading::Pending);
        assert_eq!(interpret(&raw).status_label(), "still processing");
    }

    #[test]
    fn test_malformed_variants() {
        assert_eq!(
            interpret(&[]),
            InterpretedReading::Malformed(MalformedReason::Empty)
        );
        assert_eq!(
            interpret(b"\x02"),
            InterpretedReading::Malformed(MalformedReason::SyntaxError)
        );
        assert_eq!(
            interpret(b"\xff"),
            InterpretedReading::Malformed(MalformedReason::NoData)
        );
        assert_eq!(
            interpret(b"\x077.00"),
            InterpretedReading::Malformed(MalformedReason::UnknownStatus(7))
        );
        assert_eq!(interpret(b"\x02").status_label(), "error 2");
    }

    #[test]
    fn test_high_bit_masked() {
        let raw = [STATUS_READY, b'7' | 0x80, b'.', b'0', b'0' | 0x80, 0];
        assert_eq!(interpret(&raw), InterpretedReading::Ready("7.00".into()));
    }

    #[test]
    fn test_conductivity_keeps_first_field() {
        let raw = b"\x011413,10.2,0.7\0\0";
        assert_eq!(
            interpret_for(SensorKind::Conductivity, raw),
            InterpretedReading::Ready("1413".into())
        );
    }

    #[test]
    fn test_ph_passes_through() {
        assert_eq!(
            interpret_for(SensorKind::Ph, b"\x017.00\0"),
            InterpretedReading::Ready("7.00".into())
        );
    }

    #[test]
    fn test_ready_without_payload_is_malformed() {
        let empty = InterpretedReading::Malformed(MalformedReason::Empty);
        assert_eq!(interpret(&[STATUS_READY]), empty);
        assert_eq!(interpret(&[STATUS_READY, 0, 0, 0]), empty);
        assert_eq!(interpret(b"\x01  \0"), empty);
    }

    #[test]
    fn test_conductivity_empty_first_field_is_malformed() {
        assert_eq!(
            interpret_for(SensorKind::Conductivity, b"\x01,10.2,0.7\0"),
            InterpretedReading::Malformed(MalformedReason::Empty)
        );
    }

    #[test]
    fn test_truncation_does_not_touch_pending() {
        assert_eq!(
            interpret_for(SensorKind::Conductivity, &[STATUS_PENDING]),
            InterpretedReading::Pending
        );
    }
}
