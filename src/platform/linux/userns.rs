use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::core::model::IdMapping;
use crate::util::fs::write_once;

/// Write the UID and GID maps of a child living in a new user namespace.
pub fn map(child: Pid, mapping: &IdMapping) -> Result<()> {
    map_in(Path::new("/proc"), child, &mapping.to_string())
}

/// Same as [`map`], against an arbitrary procfs root and a raw mapping.
///
/// Commas in `mapping` separate records.
pub fn map_in(proc_root: &Path, child: Pid, mapping: &str) -> Result<()> {
    let dir = proc_root.join(child.to_string());
    let records = mapping.replace(',', "\n");

    write_once(&dir.join("uid_map"), &records)
        .with_context(|| format!("failed to write uid_map of {child}"))?;
    deny_setgroups(&dir.join("setgroups"))?;
    write_once(&dir.join("gid_map"), &records)
        .with_context(|| format!("failed to write gid_map of {child}"))?;

    debug!(pid = %child, mapping = %mapping, "identity mapped");
    Ok(())
}

/// Required before an unprivileged gid_map write. Kernels older than 3.19
/// have no such file and no such requirement.
fn deny_setgroups(path: &Path) -> Result<()> {
    let mut file = match OpenOptions::new().write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "setgroups control file absent, skipping");
            return Ok(());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open {}", path.display()));
        }
    };
    let written = file
        .write(b"deny")
        .with_context(|| format!("failed to write {}", path.display()))?;
    if written != 4 {
        bail!("short write to {}", path.display());
    }
    Ok(())
}
