use clap::{ArgAction, Parser};

use super::Verbosity;
use crate::traffic::{
    ConfigError,
    generator::Family,
    sink::{DEFAULT_CAPTURE_SIZE, MAX_CAPTURE_SIZE, MIN_CAPTURE_SIZE, SinkConfig},
};

/// Listen for IPv6 UDP and TCP test traffic on a port and log reception
/// time and the IPv6 traffic class of every message.
#[derive(Parser, Debug)]
#[command(name = "traffic_sink", version, about)]
pub struct SinkArgs {
    /// Extra debugging information
    #[arg(short = 'D', long)]
    pub debug: bool,

    /// Increase verboseness of messages
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Disable any extra dialog
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Listen on UDP only
    #[arg(short, long, conflicts_with = "tcp")]
    pub udp: bool,

    /// Listen on TCP only
    #[arg(short, long)]
    pub tcp: bool,

    /// Receive IPv4 traffic instead of IPv6
    #[arg(short = '4', long)]
    pub ipv4: bool,

    /// Log the payload received
    #[arg(short, long)]
    pub payload: bool,

    /// Capture length in bytes
    #[arg(short, long, value_name = "BYTES", default_value_t = DEFAULT_CAPTURE_SIZE)]
    pub size: usize,

    /// Address to listen on (wildcard by default) and port
    #[arg(value_name = "[HOST] PORT", num_args = 1..=2, required = true)]
    pub endpoint: Vec<String>,
}

impl SinkArgs {
    pub fn verbosity(&self) -> Verbosity {
        Verbosity {
            debug: self.debug,
            verbose: self.verbose,
            quiet: self.quiet,
        }
    }
}

impl TryFrom<SinkArgs> for SinkConfig {
    type Error = ConfigError;

    fn try_from(args: SinkArgs) -> Result<Self, Self::Error> {
        if !(MIN_CAPTURE_SIZE..=MAX_CAPTURE_SIZE).contains(&args.size) {
            return Err(ConfigError::CaptureSize {
                size: args.size,
                min: MIN_CAPTURE_SIZE,
                max: MAX_CAPTURE_SIZE,
            });
        }
        let family = if args.ipv4 { Family::V4 } else { Family::V6 };
        let (host, port) = match args.endpoint.as_slice() {
            [port] => (SinkConfig::default_host(family).to_string(), port),
            [host, port] => (host.clone(), port),
            _ => return Err(ConfigError::Port(args.endpoint.join(" "))),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::Port(port.clone()))?;

        Ok(SinkConfig {
            host,
            port,
            // neither flag means both transports
            udp: !args.tcp,
            tcp: !args.udp,
            family,
            show_payload: args.payload,
            capture_size: args.size,
        })
    }
}
