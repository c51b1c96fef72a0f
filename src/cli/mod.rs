pub mod commands;

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{ArgAction, Parser, Subcommand};

use crate::core::config::{
    DEFAULT_EXTERNAL_IFACE, DEFAULT_HOSTNAME, MAX_CPU_PERCENT, MAX_IO_WEIGHT, MAX_MEMORY_BYTES,
    MAX_PIDS, MIN_CPU_PERCENT, MIN_IO_WEIGHT, MIN_PIDS,
};

/// CrateRun: a minimal Linux container runtime.
#[derive(Parser, Debug)]
#[command(name = "craterun", version, about)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container, run a command in it and wait for it to exit.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Path to the root filesystem (e.g. an extracted Alpine minirootfs).
    #[arg(long)]
    pub rootfs: PathBuf,

    /// Hostname to set inside the container.
    #[arg(long, default_value = DEFAULT_HOSTNAME)]
    pub hostname: String,

    /// Memory limit in bytes, for user and kernel memory alike.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_MEMORY_BYTES))]
    pub memory: Option<u64>,

    /// CPU share as a percentage of one CPU (1-100).
    #[arg(long, value_parser = clap::value_parser!(u64).range(MIN_CPU_PERCENT..=MAX_CPU_PERCENT))]
    pub cpu: Option<u64>,

    /// Maximum number of processes (10-32768).
    #[arg(long, value_parser = clap::value_parser!(u64).range(MIN_PIDS..=MAX_PIDS))]
    pub pids: Option<u64>,

    /// Block I/O weight (10-1000).
    #[arg(long, value_parser = clap::value_parser!(u64).range(MIN_IO_WEIGHT..=MAX_IO_WEIGHT))]
    pub io_weight: Option<u64>,

    /// Run unprivileged in a new user namespace (root inside maps to host uid 100000).
    #[arg(long)]
    pub userns: bool,

    /// Host interface the container traffic is masqueraded through.
    #[arg(long, default_value = DEFAULT_EXTERNAL_IFACE)]
    pub external_iface: String,

    /// The command (and arguments) to execute inside the container.
    /// Everything after `--` is treated as the command.
    #[arg(last = true, required = true)]
    pub cmd: Vec<String>,
}

/// Parse CLI arguments. Called from `main`. Usage errors exit 1 like every
/// other fatal error; help and version exit 0.
pub fn parse() -> Cli {
    Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(usage_exit_code(e.kind()));
    })
}

fn usage_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(extra: &[&str]) -> Result<RunArgs, clap::Error> {
        let mut argv = vec!["craterun", "run", "--rootfs", "/srv/alpine"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["--", "/bin/sh"]);
        Cli::try_parse_from(argv).map(|cli| match cli.command {
            Command::Run(args) => args,
        })
    }

    #[test]
    fn defaults() {
        let args = run_args(&[]).unwrap();
        assert_eq!(args.hostname, "craterun");
        assert_eq!(args.external_iface, "eth0");
        assert!(!args.userns);
        assert_eq!(args.memory, None);
        assert_eq!(args.cmd, vec!["/bin/sh"]);
    }

    #[test]
    fn limits_at_the_bounds_are_accepted() {
        let args = run_args(&[
            "--memory", "4294967296", "--cpu", "1", "--pids", "32768", "--io-weight", "10",
        ])
        .unwrap();
        assert_eq!(args.memory, Some(4_294_967_296));
        assert_eq!(args.cpu, Some(1));
        assert_eq!(args.pids, Some(32768));
        assert_eq!(args.io_weight, Some(10));
    }

    #[test]
    fn limits_out_of_range_are_rejected() {
        for bad in [
            ["--memory", "4294967297"],
            ["--memory", "0"],
            ["--cpu", "0"],
            ["--cpu", "101"],
            ["--pids", "9"],
            ["--pids", "32769"],
            ["--io-weight", "9"],
            ["--io-weight", "1001"],
        ] {
            assert!(run_args(&bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn usage_errors_share_the_fatal_exit_code() {
        let err = run_args(&["--cpu", "0"]).unwrap_err();
        assert_eq!(usage_exit_code(err.kind()), 1);
        let err = Cli::try_parse_from(["craterun", "run", "--", "true"]).unwrap_err();
        assert_eq!(usage_exit_code(err.kind()), 1);
    }

    #[test]
    fn help_and_version_exit_cleanly() {
        for flag in ["--help", "--version"] {
            let err = Cli::try_parse_from(["craterun", flag]).unwrap_err();
            assert_eq!(usage_exit_code(err.kind()), 0, "{flag}");
        }
    }

    #[test]
    fn verbosity_is_counted() {
        let cli = Cli::try_parse_from(["craterun", "-vv", "run", "--rootfs", "/r", "--", "true"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
