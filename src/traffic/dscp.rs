//! Traffic class values from DSCP names or numbers.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use thiserror::Error;

use super::parse_int;

/// ECN bits sit below the DSCP in the traffic class octet.
const ECN_SHIFT: u8 = 2;
/// Low nibble for experimental code points (`xxxx11`) with ECN cleared.
const EXPERIMENTAL_LOW_BITS: u8 = 0x0c;

/// DSCP code point names: class selectors, assured forwarding, EF and BE.
static DSCP_NAMES: Lazy<HashMap<String, u8>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for cs in 0..8u8 {
        table.insert(format!("CS{}", cs), cs << 3);
    }
    for drop in 1..4u8 {
        for class in 1..5u8 {
            table.insert(format!("AF{}{}", class, drop), (class << 3) + (drop << 1));
        }
    }
    table.insert("EF".to_string(), 46);
    table.insert("BE".to_string(), 0);
    table
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrafficClassError {
    #[error("traffic class must be a value between 0 (0x00) and 255 (0xff), got {0}")]
    Range(i64),
    #[error("invalid DSCP code point: {0}")]
    Unknown(String),
}

/// The 6-bit DSCP value for a code point name such as `AF21`.
pub fn dscp_by_name(name: &str) -> Option<u8> {
    DSCP_NAMES.get(&name.to_ascii_uppercase()).copied()
}

/// Turn user input into a full traffic class octet.
///
/// Names map to their DSCP with ECN cleared. Numbers `0..=15` are taken as
/// experimental code points and land in `0x0c..=0xfc`; larger numbers are the
/// literal traffic class including the ECN bits.
pub fn parse_traffic_class(input: &str) -> Result<u8, TrafficClassError> {
    if let Some(dscp) = dscp_by_name(input) {
        return Ok(dscp << ECN_SHIFT);
    }
    let value = parse_int(input).ok_or_else(|| TrafficClassError::Unknown(input.to_string()))?;
    match value {
        0..=15 => Ok(((value as u8) << 4) + EXPERIMENTAL_LOW_BITS),
        16..=255 => Ok(value as u8),
        _ => Err(TrafficClassError::Range(value)),
    }
}
