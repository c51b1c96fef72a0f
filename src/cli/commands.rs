use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::cli::{Cli, Command, RunArgs};
use crate::core::error::ValidationFault;
use crate::core::model::{LaunchSpec, ResourceSpec};

/// Dispatch a parsed CLI command to the appropriate handler.
pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => cmd_run(args),
    }
}

// ─── run ────────────────────────────────────────────────────────────────────

fn cmd_run(args: RunArgs) -> Result<()> {
    let spec = launch_spec(args)?;

    #[cfg(not(target_os = "linux"))]
    {
        let _ = spec;
        anyhow::bail!("craterun only runs on Linux");
    }

    #[cfg(target_os = "linux")]
    {
        let code = crate::platform::linux::process::launch(&spec)?;
        std::process::exit(code);
    }
}

/// Turn validated arguments into a launch request.
fn launch_spec(args: RunArgs) -> Result<LaunchSpec, ValidationFault> {
    if args.cmd.is_empty() {
        return Err(ValidationFault::EmptyCommand);
    }
    let rootfs = validate_rootfs(&args.rootfs)?;

    let resources = ResourceSpec {
        memory_bytes: args.memory,
        cpu_percent: args.cpu,
        max_pids: args.pids,
        io_weight: args.io_weight,
    };

    Ok(LaunchSpec {
        rootfs,
        cmd: args.cmd,
        hostname: args.hostname,
        resources: (!resources.is_empty()).then_some(resources),
        userns: args.userns,
        external_iface: args.external_iface,
    })
}

/// Validate that the rootfs path is safe and looks correct. Returns the
/// canonical path.
fn validate_rootfs(rootfs: &Path) -> Result<PathBuf, ValidationFault> {
    if rootfs.as_os_str().is_empty() {
        return Err(ValidationFault::EmptyRootfs);
    }

    let canon =
        fs::canonicalize(rootfs).map_err(|_| ValidationFault::MissingRootfs(rootfs.to_path_buf()))?;

    if canon == Path::new("/") {
        return Err(ValidationFault::HostRoot);
    }

    // Check it looks like a filesystem root (has bin/ or usr/ or etc/).
    let looks_like_root = ["bin", "usr", "etc"]
        .iter()
        .any(|dir| canon.join(dir).is_dir());
    if !looks_like_root {
        return Err(ValidationFault::NotARootfs(canon));
    }

    Ok(canon)
}
