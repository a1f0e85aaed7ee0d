use ipv6::{
    cli::{generator::GeneratorArgs, init_logging},
    traffic::generator::{self, GeneratorConfig},
};
use std::io::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let args = GeneratorArgs::parse_args();
    init_logging(args.verbosity());

    let config = match GeneratorConfig::try_from(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2);
        }
    };
    log::debug!("options: {:?}", config);

    tokio::select! {
        res = generator::run(&config) => {
            res.inspect_err(|e| log::error!("fatal error: {e}"))?;
        }
        _ = tokio::signal::ctrl_c() => {
            println!();
            log::debug!("interrupted, closing sockets");
            std::process::exit(2);
        }
    }
    Ok(())
}
