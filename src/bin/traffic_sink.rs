use clap::Parser;
use ipv6::{
    cli::{init_logging, sink::SinkArgs},
    traffic::sink::{self, SinkConfig},
};
use std::io::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let args = SinkArgs::parse();
    init_logging(args.verbosity());

    let config = match SinkConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    };
    log::debug!("options: {:?}", config);

    tokio::select! {
        res = sink::run(config) => {
            res.inspect_err(|e| log::error!("fatal error: {e}"))?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            log::debug!("interrupted, closing sockets");
        }
    }
    Ok(())
}
