//! IPv6 test traffic: message framing, traffic class parsing, transmission
//! schedules and the generator and sink runtimes.

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub mod dscp;
pub mod generator;
pub mod schedule;
pub mod sink;
pub mod wire;

/// Invalid tool configuration, reported before any socket is opened.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("cannot set the period without also setting the frequency or interval")]
    AmbiguousPeriod,
    #[error("{name} must be positive, got {value}")]
    NotPositive { name: &'static str, value: f64 },
    #[error("{name} {value} is larger than the supported maximum {max}")]
    TooLarge {
        name: &'static str,
        value: f64,
        max: f64,
    },
    #[error("bad number of packets to transmit: {0}")]
    Count(i64),
    #[error("bad preload value {0}, should be 0..=255")]
    Preload(i64),
    #[error("insufficient number of transmissions in one period, cannot {0} transmissions")]
    TooFewSlots(&'static str),
    #[error("slot {slot} is outside the {slots} transmissions in one period")]
    Slot { slot: i64, slots: usize },
    #[error("payload size must be between {min} and {max} bytes, got {size}")]
    Size { size: i64, min: usize, max: usize },
    #[error("negative offsets are not supported")]
    NegativeOffset,
    #[error(transparent)]
    TrafficClass(#[from] dscp::TrafficClassError),
    #[error("flow label {0:#x} does not fit in 20 bits")]
    FlowLabel(i64),
    #[error("capture size must be between {min} and {max} bytes, got {size}")]
    CaptureSize { size: usize, min: usize, max: usize },
    #[error("invalid port {0}")]
    Port(String),
    #[error("bad payload pattern: {0}")]
    Pattern(String),
}

/// Parse an integer the way the tools accept them: decimal, or hex, octal
/// and binary with a `0x`, `0o` or `0b` prefix, optionally signed.
pub fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let lower = digits.to_ascii_lowercase();
    let value = if let Some(hex) = lower.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(oct) = lower.strip_prefix("0o") {
        i64::from_str_radix(oct, 8).ok()?
    } else if let Some(bin) = lower.strip_prefix("0b") {
        i64::from_str_radix(bin, 2).ok()?
    } else {
        lower.parse::<i64>().ok()?
    };
    Some(if negative { -value } else { value })
}

/// Wall clock seconds since the UNIX epoch, the timestamp carried on the wire.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_prefixed_integers() {
        assert_eq!(parse_int("42"), Some(42));
        assert_eq!(parse_int("0x2E"), Some(46));
        assert_eq!(parse_int("0o17"), Some(15));
        assert_eq!(parse_int("0b101"), Some(5));
        assert_eq!(parse_int("-3"), Some(-3));
        assert_eq!(parse_int("0xg"), None);
        assert_eq!(parse_int("AF11"), None);
        assert_eq!(parse_int(""), None);
    }
}
