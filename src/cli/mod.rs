//! Command line front ends for the traffic tools.

use log::LevelFilter;

use crate::traffic::parse_int;

pub mod generator;
pub mod sink;

/// Verbosity flags shared by both tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    pub debug: bool,
    /// Number of `-v` flags.
    pub verbose: u8,
    pub quiet: bool,
}

impl Verbosity {
    pub fn level(&self) -> LevelFilter {
        if self.debug {
            LevelFilter::Debug
        } else if self.quiet {
            LevelFilter::Error
        } else if self.verbose >= 1 {
            LevelFilter::Info
        } else {
            LevelFilter::Error
        }
    }
}

/// Set up env_logger at the level picked by the flags. `RUST_LOG` still wins.
pub fn init_logging(verbosity: Verbosity) {
    env_logger::Builder::new()
        .filter_level(verbosity.level())
        .format_timestamp_micros()
        .parse_default_env()
        .init();
}

/// clap value parser for integers with an optional radix prefix.
pub fn any_int(s: &str) -> Result<i64, String> {
    parse_int(s).ok_or_else(|| format!("invalid integer: {}", s))
}

/// Decode backslash escapes in a payload pattern, e.g. `\x00\xff`, `\012`
/// or `ab\n`. Octal escapes take up to three digits.
pub fn unescape(s: &str) -> Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut utf8 = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            continue;
        }
        let byte = match chars.next() {
            Some('n') => b'\n',
            Some('r') => b'\r',
            Some('t') => b'\t',
            Some(first @ '0'..='7') => {
                let mut value = first as u32 - '0' as u32;
                for _ in 0..2 {
                    match chars.peek() {
                        Some(&digit @ '0'..='7') => {
                            value = value * 8 + (digit as u32 - '0' as u32);
                            chars.next();
                        }
                        _ => break,
                    }
                }
                u8::try_from(value)
                    .map_err(|_| format!("octal escape \\{:o} out of range in {:?}", value, s))?
            }
            Some('a') => 0x07,
            Some('b') => 0x08,
            Some('f') => 0x0c,
            Some('v') => 0x0b,
            Some('\\') => b'\\',
            Some('\'') => b'\'',
            Some('"') => b'"',
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                if hex.len() != 2 {
                    return Err(format!("truncated \\x escape in {:?}", s));
                }
                u8::from_str_radix(&hex, 16)
                    .map_err(|_| format!("invalid \\x escape \\x{} in {:?}", hex, s))?
            }
            Some(other) => return Err(format!("unknown escape \\{} in {:?}", other, s)),
            None => return Err(format!("trailing backslash in {:?}", s)),
        };
        out.push(byte);
    }
    Ok(out)
}
