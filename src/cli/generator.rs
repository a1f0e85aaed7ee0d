use std::{collections::BTreeSet, ffi::OsString};

use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};

use super::{Verbosity, any_int, unescape};
use crate::{
    flowlabel::{FLOW_LABEL_MAX, FlowLabel},
    traffic::{
        ConfigError,
        dscp::parse_traffic_class,
        generator::{Family, GeneratorConfig, Transport},
        schedule::{
            Rate, SlotPlan, only_to_skip, seconds, validate_adjustments, validate_size,
            validate_skip,
        },
        wire::prefix_len,
    },
};

/// Send paced, sequenced IPv6 test messages over UDP or TCP, marking each
/// with a traffic class and optionally a flow label.
#[derive(Parser, Debug)]
#[command(name = "traffic_generator", version, about)]
pub struct GeneratorArgs {
    /// Extra debugging information
    #[arg(short = 'D', long)]
    pub debug: bool,

    /// Increase verboseness of messages
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Disable any extra dialog
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Use UDP (default)
    #[arg(short, long, conflicts_with = "tcp")]
    pub udp: bool,

    /// Use TCP
    #[arg(short, long)]
    pub tcp: bool,

    /// Send IPv4 traffic instead of IPv6
    #[arg(short = '4', long)]
    pub ipv4: bool,

    /// Embed the send time in every message
    #[arg(short = 'T', long)]
    pub timestamp: bool,

    /// Send UDP without binding or connecting, ignoring ICMP errors
    #[arg(short, long)]
    pub blind: bool,

    /// Number of packets to transmit, forever by default
    #[arg(short, long, value_name = "COUNT", value_parser = any_int, allow_negative_numbers = true)]
    pub count: Option<i64>,

    /// Transmissions per period
    #[arg(short, long, value_name = "HZ", conflicts_with = "interval")]
    pub frequency: Option<f64>,

    /// IPv6 flow label, 0 lets the kernel pick one
    #[arg(short = 'F', long = "flowlabel", value_name = "LABEL", value_parser = any_int)]
    pub flow_label: Option<i64>,

    /// Seconds between transmissions
    #[arg(short, long, value_name = "SECONDS")]
    pub interval: Option<f64>,

    /// Use message size SIZE for the listed slots of every period
    ///
    /// clap keeps the values flat; [`GeneratorArgs::try_parse_args`] groups
    /// them per occurrence into `adjust`.
    #[arg(
        id = "adjust",
        short = 'A',
        long = "adjust",
        value_name = "SIZE SLOT",
        num_args = 1..,
        action = ArgAction::Append,
        value_parser = any_int,
    )]
    pub adjust_values: Vec<i64>,

    /// `-A` rules, one `[size, slot...]` entry per occurrence.
    #[arg(skip)]
    pub adjust: Vec<Vec<i64>>,

    /// Packets sent back to back before pacing starts
    #[arg(short = 'l', long, value_name = "COUNT", default_value = "0", value_parser = any_int)]
    pub preload: i64,

    /// Start at this many seconds past the next whole second
    #[arg(short, long, value_name = "SECONDS", allow_negative_numbers = true)]
    pub offset: Option<f64>,

    /// Payload fill pattern, backslash escapes allowed
    #[arg(short, long, value_name = "PATTERN")]
    pub pattern: Option<String>,

    /// Seconds in one period
    #[arg(short = 'P', long, value_name = "SECONDS")]
    pub period: Option<f64>,

    /// Traffic class: a DSCP name, 0-15 for experimental code points, or
    /// 16-255 for the literal value
    #[arg(short = 'Q', long = "qos", visible_alias = "dscp", value_name = "TCLASS")]
    pub traffic_class: Option<String>,

    /// Total message size in bytes, header included
    #[arg(short, long, value_name = "BYTES", default_value = "56", value_parser = any_int)]
    pub size: i64,

    /// Slots of each period not to transmit in
    #[arg(short = 'S', long, value_name = "SLOT", num_args = 1.., value_parser = any_int, conflicts_with = "only")]
    pub skip: Option<Vec<i64>>,

    /// Only transmit in these slots of each period
    #[arg(short = 'O', long, value_name = "SLOT", num_args = 1.., value_parser = any_int)]
    pub only: Option<Vec<i64>>,

    /// Destination host or address
    pub host: String,

    /// Destination port
    pub port: u16,
}

impl GeneratorArgs {
    /// Parse the process arguments, exiting with usage on error.
    pub fn parse_args() -> Self {
        Self::try_parse_args(std::env::args_os()).unwrap_or_else(|e| e.exit())
    }

    /// Parse `argv`, keeping the values of each `-A` occurrence together.
    pub fn try_parse_args<I, T>(argv: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(argv)?;
        let mut args = Self::from_arg_matches(&matches)?;
        args.adjust = matches
            .get_occurrences::<i64>("adjust")
            .map(|rules| rules.map(|rule| rule.copied().collect()).collect())
            .unwrap_or_default();
        Ok(args)
    }

    pub fn verbosity(&self) -> Verbosity {
        Verbosity {
            debug: self.debug,
            verbose: self.verbose,
            quiet: self.quiet,
        }
    }
}

impl TryFrom<GeneratorArgs> for GeneratorConfig {
    type Error = ConfigError;

    fn try_from(args: GeneratorArgs) -> Result<Self, Self::Error> {
        let rate = Rate::resolve(args.period, args.interval, args.frequency)?;
        let prefix_len = prefix_len(args.timestamp);

        let count = match args.count {
            Some(count) if count <= 0 => return Err(ConfigError::Count(count)),
            count => count.map(|c| c as u64),
        };
        if !(0..=255).contains(&args.preload) {
            return Err(ConfigError::Preload(args.preload));
        }

        let skip = match (&args.only, &args.skip) {
            (Some(only), _) => {
                if rate.hz <= 1.0 {
                    return Err(ConfigError::TooFewSlots("limit"));
                }
                let only: Vec<usize> = only
                    .iter()
                    .filter(|&&slot| slot > 0)
                    .map(|&slot| slot as usize)
                    .collect();
                only_to_skip(&only, rate.slots())
            }
            (None, Some(skip)) => validate_skip(skip, &rate)?,
            (None, None) => BTreeSet::new(),
        };

        let traffic_class = match &args.traffic_class {
            Some(tc) => parse_traffic_class(tc)?,
            None => 0,
        };
        let size = validate_size(args.size, prefix_len)?;
        if let Some(offset) = args.offset {
            if offset < 0.0 {
                return Err(ConfigError::NegativeOffset);
            }
            seconds("offset", offset)?;
        }
        let adjustments = validate_adjustments(&args.adjust, prefix_len, &rate)?;

        let flow_label = match args.flow_label {
            Some(label) if (0..=FLOW_LABEL_MAX as i64).contains(&label) => {
                FlowLabel::new(label as u32)
            }
            Some(label) => return Err(ConfigError::FlowLabel(label)),
            None => None,
        };

        let pattern = match &args.pattern {
            Some(p) => unescape(p).map_err(ConfigError::Pattern)?,
            None => Vec::new(),
        };
        let plan = SlotPlan::new(
            rate.slots(),
            size,
            prefix_len,
            &pattern,
            &adjustments,
            skip,
        );

        Ok(GeneratorConfig {
            host: args.host,
            port: args.port,
            transport: if args.tcp { Transport::Tcp } else { Transport::Udp },
            family: if args.ipv4 { Family::V4 } else { Family::V6 },
            blind: args.blind,
            timestamp: args.timestamp,
            count,
            preload: args.preload as u64,
            offset: args.offset,
            flow_label,
            traffic_class,
            rate,
            plan,
            quiet: args.quiet,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<GeneratorConfig, ConfigError> {
        let mut argv = vec!["traffic_generator"];
        argv.extend_from_slice(args);
        GeneratorConfig::try_from(GeneratorArgs::try_parse_args(argv).unwrap())
    }

    #[test]
    fn defaults() {
        let config = parse(&["::1", "5000"]).unwrap();
        assert_eq!(config.transport, Transport::Udp);
        assert_eq!(config.family, Family::V6);
        assert_eq!(config.count, None);
        assert_eq!(config.traffic_class, 0);
        assert_eq!(config.rate.interval, 1.0);
        assert_eq!(config.plan.slots(), 1);
        assert_eq!(config.plan.payload(1).len(), 56 - 5);
        assert_eq!(config.flow_label, None);
    }

    #[test]
    fn full_option_set() {
        let config = parse(&[
            "-t", "-T", "-c", "10", "-f", "4", "-Q", "EF", "-F", "0x12345", "-s", "100", "-p",
            r"\xab", "-S", "2", "--", "host.example", "9",
        ])
        .unwrap();
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.count, Some(10));
        assert_eq!(config.rate.interval, 0.25);
        assert_eq!(config.traffic_class, 0xb8);
        assert_eq!(config.flow_label, FlowLabel::new(0x12345));
        assert!(config.plan.is_skipped(2));
        assert_eq!(config.plan.payload(1).len(), 100 - 13);
        assert!(config.plan.payload(1).iter().all(|&b| b == 0xab));
    }

    #[test]
    fn only_becomes_skip() {
        let config = parse(&["-f", "4", "-O", "1", "3", "--", "::1", "1"]).unwrap();
        let skipped: Vec<usize> = (1..=4).filter(|&s| config.plan.is_skipped(s)).collect();
        assert_eq!(skipped, vec![2, 4]);

        assert_eq!(
            parse(&["-O", "1", "--", "::1", "1"]).unwrap_err(),
            ConfigError::TooFewSlots("limit")
        );
    }

    #[test]
    fn adjustments_per_slot() {
        let config = parse(&["-f", "2", "-A", "20", "2", "-A", "30", "--", "::1", "1"]).unwrap();
        assert_eq!(config.plan.payload(1).len(), 56 - 5);
        assert_eq!(config.plan.payload(2).len(), 20 - 5);
    }

    #[test]
    fn adjustments_with_timestamps() {
        let config = parse(&[
            "-T", "-f", "3", "-A", "13", "1", "3", "-A", "40", "2", "--", "::1", "1",
        ])
        .unwrap();
        assert_eq!(config.plan.payload(1).len(), 0);
        assert_eq!(config.plan.payload(2).len(), 40 - 13);
        assert_eq!(config.plan.payload(3).len(), 0);
        assert!(config.plan.variable_size());

        // below the timestamped header
        assert!(matches!(
            parse(&["-T", "-f", "2", "-A", "12", "1", "--", "::1", "1"]).unwrap_err(),
            ConfigError::Size { size: 12, min: 13, .. }
        ));
    }

    #[test]
    fn adjust_values_stay_grouped() {
        let args = GeneratorArgs::try_parse_args([
            "traffic_generator",
            "-A",
            "20",
            "1",
            "2",
            "-A",
            "0x20",
            "3",
            "--",
            "::1",
            "1",
        ])
        .unwrap();
        assert_eq!(args.adjust, vec![vec![20, 1, 2], vec![32, 3]]);
    }

    #[test]
    fn dscp_alias() {
        let config = parse(&["--dscp", "AF11", "::1", "1"]).unwrap();
        assert_eq!(config.traffic_class, 0x28);
    }

    #[test]
    fn oversized_times_are_rejected() {
        assert!(matches!(
            parse(&["-i", "1e20", "::1", "1"]).unwrap_err(),
            ConfigError::TooLarge { name: "interval", .. }
        ));
        assert!(matches!(
            parse(&["-o", "1e20", "::1", "1"]).unwrap_err(),
            ConfigError::TooLarge { name: "offset", .. }
        ));
        assert!(matches!(
            parse(&["-o", "inf", "::1", "1"]).unwrap_err(),
            ConfigError::TooLarge { name: "offset", .. }
        ));
        assert!(matches!(
            parse(&["-f", "1e13", "::1", "1"]).unwrap_err(),
            ConfigError::TooLarge { name: "frequency", .. }
        ));
        assert!(parse(&["-o", "0.5", "::1", "1"]).is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(parse(&["-c", "0", "::1", "1"]).unwrap_err(), ConfigError::Count(0));
        assert_eq!(
            parse(&["-l", "256", "::1", "1"]).unwrap_err(),
            ConfigError::Preload(256)
        );
        assert_eq!(
            parse(&["-F", "0x100000", "::1", "1"]).unwrap_err(),
            ConfigError::FlowLabel(0x100000)
        );
        assert_eq!(
            parse(&["-o", "-1", "::1", "1"]).unwrap_err(),
            ConfigError::NegativeOffset
        );
        assert!(matches!(
            parse(&["-T", "-s", "12", "::1", "1"]).unwrap_err(),
            ConfigError::Size { size: 12, min: 13, .. }
        ));
        assert!(matches!(
            parse(&["-Q", "XX", "::1", "1"]).unwrap_err(),
            ConfigError::TrafficClass(_)
        ));
        assert_eq!(
            parse(&["-P", "5", "::1", "1"]).unwrap_err(),
            ConfigError::AmbiguousPeriod
        );
    }

    #[test]
    fn conflicting_flags() {
        for argv in [
            vec!["traffic_generator", "-u", "-t", "::1", "1"],
            vec!["traffic_generator", "-f", "2", "-i", "1", "::1", "1"],
            vec!["traffic_generator", "-S", "1", "-O", "2", "--", "::1", "1"],
        ] {
            assert!(GeneratorArgs::try_parse_from(argv).is_err());
        }
    }

    #[test]
    fn verbosity_from_flags() {
        let args = GeneratorArgs::try_parse_from(["traffic_generator", "-vv", "::1", "1"]).unwrap();
        assert_eq!(args.verbosity().verbose, 2);
        assert!(GeneratorArgs::try_parse_from(["traffic_generator", "-v", "-q", "::1", "1"]).is_err());
    }
}
