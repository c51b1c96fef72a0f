mod cli;
mod core;
mod platform;
mod util;

use std::process;

use tracing_subscriber::EnvFilter;

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let args = cli::parse();
    init_logging(args.verbose);

    if let Err(e) = cli::commands::dispatch(args) {
        eprintln!("craterun: {e:#}");
        process::exit(1);
    }
}
