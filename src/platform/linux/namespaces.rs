use anyhow::{Context, Result};
use nix::sched::CloneFlags;

/// Namespace flags for a new container.
///
/// Mount, UTS, IPC, PID and network are always isolated. A cgroup namespace
/// is added when resource limits are applied, a user namespace on request.
pub fn clone_flags(with_resources: bool, userns: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET;
    if with_resources {
        flags |= CloneFlags::CLONE_NEWCGROUP;
    }
    if userns {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    flags
}

/// Set the hostname inside a UTS namespace.
pub fn set_hostname(name: &str) -> Result<()> {
    nix::unistd::sethostname(name).with_context(|| format!("sethostname({name}) failed"))?;
    Ok(())
}
