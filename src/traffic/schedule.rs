//! When to send and what to send in each slot of a period.

use std::{collections::BTreeSet, time::Duration};

use bytes::Bytes;

use super::{ConfigError, wire::MAX_MESSAGE_SIZE};

/// Sequence numbers wrap before reaching this value and never use zero.
const SEQUENCE_MODULUS: u64 = 0xffff;

/// Transmission rate over a period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    /// Transmissions per period.
    pub hz: f64,
    /// Seconds between transmissions.
    pub interval: f64,
    /// Seconds in one period.
    pub period: f64,
}

impl Rate {
    /// Derive the rate from whichever of interval or frequency was given.
    ///
    /// A period alone is ambiguous: `-P 5` could mean five sends a period or
    /// one send every five seconds.
    pub fn resolve(
        period: Option<f64>,
        interval: Option<f64>,
        frequency: Option<f64>,
    ) -> Result<Rate, ConfigError> {
        let period = seconds("period", positive("period", period.unwrap_or(1.0))?)?;
        let rate = match (interval, frequency) {
            (Some(interval), _) => {
                let interval = seconds("interval", positive("interval", interval)?)?;
                Rate {
                    hz: period / interval,
                    interval,
                    period,
                }
            }
            (None, Some(hz)) => {
                let hz = positive("frequency", hz)?;
                Rate {
                    hz,
                    interval: period / hz,
                    period,
                }
            }
            (None, None) if period != 1.0 => return Err(ConfigError::AmbiguousPeriod),
            (None, None) => Rate {
                hz: 1.0,
                interval: 1.0,
                period,
            },
        };
        at_most("frequency", rate.hz, MAX_SLOTS as f64)?;
        seconds("interval", rate.interval)?;
        Ok(rate)
    }

    /// Whole slots per period, at least one.
    pub fn slots(&self) -> usize {
        if self.hz < 1.0 { 1 } else { self.hz as usize }
    }

    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval).unwrap_or(Duration::MAX)
    }
}

/// Upper bound for any time value in seconds (one day).
pub const MAX_SECONDS: f64 = 86_400.0;
/// Upper bound for transmissions per period.
pub const MAX_SLOTS: usize = u16::MAX as usize;

/// Check a time value in seconds against [`MAX_SECONDS`].
pub fn seconds(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    at_most(name, value, MAX_SECONDS)
}

fn at_most(name: &'static str, value: f64, max: f64) -> Result<f64, ConfigError> {
    if value <= max {
        Ok(value)
    } else {
        Err(ConfigError::TooLarge { name, value, max })
    }
}

fn positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(ConfigError::NotPositive { name, value })
    }
}

/// A payload size override for some slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adjustment {
    /// Total message size including the prefix.
    pub size: usize,
    pub slots: Vec<usize>,
}

/// Which slot sends what, and which slots stay silent.
#[derive(Debug, Clone)]
pub struct SlotPlan {
    payloads: Vec<Bytes>,
    skip: BTreeSet<usize>,
    variable_size: bool,
}

impl SlotPlan {
    /// Lay out the payloads for `slots` slots.
    ///
    /// `size` is the default total message size and `prefix_len` the header
    /// bytes in front of each payload. Sizes were validated by the caller.
    pub fn new(
        slots: usize,
        size: usize,
        prefix_len: usize,
        pattern: &[u8],
        adjustments: &[Adjustment],
        skip: BTreeSet<usize>,
    ) -> SlotPlan {
        let default = fill_payload(pattern, size - prefix_len);
        let mut payloads = vec![default; slots];
        for adj in adjustments {
            let payload = fill_payload(pattern, adj.size - prefix_len);
            for &slot in &adj.slots {
                if let Some(p) = payloads.get_mut(slot - 1) {
                    *p = payload.clone();
                }
            }
        }
        SlotPlan {
            payloads,
            skip,
            variable_size: !adjustments.is_empty(),
        }
    }

    pub fn slots(&self) -> usize {
        self.payloads.len()
    }

    /// Payload for 1-based `slot`.
    pub fn payload(&self, slot: usize) -> &Bytes {
        &self.payloads[slot - 1]
    }

    pub fn is_skipped(&self, slot: usize) -> bool {
        self.skip.contains(&slot)
    }

    /// Whether any slot deviates from the default size.
    pub fn variable_size(&self) -> bool {
        self.variable_size
    }
}

/// `len` bytes of `pattern` repeated, or zeros without a pattern.
pub fn fill_payload(pattern: &[u8], len: usize) -> Bytes {
    if pattern.is_empty() {
        return Bytes::from(vec![0u8; len]);
    }
    pattern.iter().copied().cycle().take(len).collect::<Vec<u8>>().into()
}

/// Turn `--only` slots into the complementary skip set.
pub fn only_to_skip(only: &[usize], slots: usize) -> BTreeSet<usize> {
    (1..=slots).filter(|s| !only.contains(s)).collect()
}

/// Check skip slots against the period.
pub fn validate_skip(skip: &[i64], rate: &Rate) -> Result<BTreeSet<usize>, ConfigError> {
    if rate.hz <= 1.0 {
        return Err(ConfigError::TooFewSlots("skip"));
    }
    skip.iter()
        .map(|&slot| {
            if slot <= 0 || slot as f64 > rate.hz {
                Err(ConfigError::Slot {
                    slot,
                    slots: rate.slots(),
                })
            } else {
                Ok(slot as usize)
            }
        })
        .collect()
}

/// Check `(size, slot...)` rules. Rules without slots are dropped.
pub fn validate_adjustments(
    rules: &[Vec<i64>],
    prefix_len: usize,
    rate: &Rate,
) -> Result<Vec<Adjustment>, ConfigError> {
    let mut adjustments = Vec::new();
    for rule in rules {
        let Some((&size, slots)) = rule.split_first() else {
            continue;
        };
        if slots.is_empty() {
            log::warn!("nothing to adjust, ignoring rule {:?}", rule);
            continue;
        }
        let size = validate_size(size, prefix_len)?;
        let slots = slots
            .iter()
            .map(|&slot| {
                if slot <= 0 || slot as f64 > rate.hz {
                    Err(ConfigError::Slot {
                        slot,
                        slots: rate.slots(),
                    })
                } else {
                    Ok(slot as usize)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        adjustments.push(Adjustment { size, slots });
    }
    Ok(adjustments)
}

pub fn validate_size(size: i64, prefix_len: usize) -> Result<usize, ConfigError> {
    if size < prefix_len as i64 || size > MAX_MESSAGE_SIZE as i64 {
        return Err(ConfigError::Size {
            size,
            min: prefix_len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(size as usize)
}

/// Sequence number of the `tx_count`-th transmission (1-based), cycling
/// through `1..=0xffff`.
pub fn sequence_number(tx_count: u64) -> u16 {
    ((tx_count - 1) % SEQUENCE_MODULUS + 1) as u16
}

/// Slot of the `tx_count`-th transmission within its period (1-based).
pub fn cycle_slot(tx_count: u64, slots: usize) -> usize {
    ((tx_count - 1) % slots as u64 + 1) as usize
}

/// Keeps transmissions on a fixed grid despite oversleeping.
///
/// Times are wall clock seconds. Waking late pulls the next deadline in by
/// the same amount; falling behind entirely sends straight away.
#[derive(Debug, Clone)]
pub struct Pacer {
    interval: f64,
    next: f64,
}

impl Pacer {
    pub fn new(interval: f64, start: f64) -> Pacer {
        Pacer {
            interval,
            next: start,
        }
    }

    /// First deadline: `offset` seconds past the next whole second.
    pub fn start_at(now: f64, offset: Option<f64>) -> f64 {
        match offset {
            Some(offset) => now.ceil() + offset,
            None => now,
        }
    }

    /// Record a wake-up at `now` and schedule the following transmission.
    /// Returns how late (positive) or early (negative) the wake-up was.
    pub fn wake(&mut self, now: f64) -> f64 {
        let fudge = now - self.next;
        self.next = round_micros(now + self.interval - fudge);
        fudge
    }

    /// After sending, how long to sleep before the next transmission.
    ///
    /// `None` means send again right away, either because the deadline has
    /// already passed or because `preloading` is still in effect.
    pub fn delay(&mut self, now: f64, preloading: bool) -> Option<Duration> {
        if now > self.next || preloading {
            self.next = now;
            return None;
        }
        Some(Duration::try_from_secs_f64(self.next - now).unwrap_or(Duration::MAX))
    }

    pub fn next(&self) -> f64 {
        self.next
    }
}

fn round_micros(t: f64) -> f64 {
    (t * 1e6).round() / 1e6
}
