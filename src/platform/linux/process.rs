use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::sched::clone;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execve, setresgid, setresuid, Gid, Pid, Uid};
use tracing::{debug, error, info, warn};

use crate::core::config::{CONTAINER_PATH, STACK_SIZE};
use crate::core::id;
use crate::core::model::LaunchSpec;
use crate::platform::linux::cgroups::Cgroups;
use crate::platform::linux::sync::ReleaseSignal;
use crate::platform::linux::{capabilities, mounts, namespaces, network, seccomp, userns};

/// Run one container to completion and return the exit code of its command
/// (`128 + signal` when it was killed).
pub fn launch(spec: &LaunchSpec) -> Result<i32> {
    let name = id::container_name();
    info!(container = %name, cmd = ?spec.cmd, userns = spec.userns, "launching container");

    let mut signal = ReleaseSignal::new()?;
    let mut stack = vec![0u8; STACK_SIZE];
    let flags = namespaces::clone_flags(spec.resources.is_some(), spec.userns);

    let cgroups = match &spec.resources {
        Some(resources) => {
            let mut cgroups = Cgroups::new(resources, &name);
            let owner = spec.userns.then(|| {
                let outside = spec.id_mapping().outside;
                (Uid::from_raw(outside), Gid::from_raw(outside))
            });
            cgroups.apply(owner)?;
            Some(cgroups)
        }
        None => None,
    };

    let child = {
        let cgroups = cgroups.as_ref();
        let signal = &mut signal;
        let entry = Box::new(move || child_main(spec, cgroups, signal));
        // SAFETY: the runtime is single-threaded here, and without CLONE_VM
        // the child runs on its own copy of the address space.
        unsafe { clone(entry, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
            .context("clone failed. Are you running as root?")?
    };
    info!(container = %name, pid = %child, "container process created");

    if let Err(e) = prepare_child(spec, child, &mut signal) {
        abort_child(child);
        return Err(e);
    }

    let code = wait_for_child(child)?;
    info!(container = %name, code, "container exited");
    drop(cgroups);
    Ok(code)
}

/// Host-side setup that must finish before the child may continue.
fn prepare_child(spec: &LaunchSpec, child: Pid, signal: &mut ReleaseSignal) -> Result<()> {
    network::wire(child, &spec.external_iface).context("failed to set up container network")?;
    if spec.userns {
        userns::map(child, &spec.id_mapping())?;
    }
    signal.release();
    debug!(pid = %child, "child released");
    Ok(())
}

/// Kill and reap a child whose setup could not be completed.
fn abort_child(child: Pid) {
    if let Err(e) = kill(child, Signal::SIGKILL) {
        warn!(pid = %child, error = %e, "failed to kill container process");
        return;
    }
    if let Err(e) = waitpid(child, None) {
        warn!(pid = %child, error = %e, "failed to reap container process");
    }
}

/// Entry point of the cloned child. Only returns on failure.
fn child_main(spec: &LaunchSpec, cgroups: Option<&Cgroups>, signal: &mut ReleaseSignal) -> isize {
    match init_container(spec, cgroups, signal) {
        Ok(never) => match never {},
        Err(e) => {
            error!("container init failed: {e:#}");
            1
        }
    }
}

fn init_container(
    spec: &LaunchSpec,
    cgroups: Option<&Cgroups>,
    signal: &mut ReleaseSignal,
) -> Result<Infallible> {
    signal.wait()?;

    if spec.userns {
        let root_gid = Gid::from_raw(0);
        let root_uid = Uid::from_raw(0);
        setresgid(root_gid, root_gid, root_gid).context("setresgid(0) failed")?;
        setresuid(root_uid, root_uid, root_uid).context("setresuid(0) failed")?;
    }

    if let Some(cgroups) = cgroups {
        cgroups.join()?;
    }

    namespaces::set_hostname(&spec.hostname)?;
    mounts::jail(&spec.rootfs, !spec.userns)?;

    capabilities::drop_capabilities()?;
    seccomp::install()?;

    exec(spec)
}

/// Replace the process image with the container command.
fn exec(spec: &LaunchSpec) -> Result<Infallible> {
    let Some(command) = spec.cmd.first() else {
        bail!("no command specified");
    };
    let program = resolve_command(command, CONTAINER_PATH, Path::new("/"))
        .with_context(|| format!("{command}: command not found"))?;

    let program = CString::new(program.as_os_str().as_encoded_bytes())
        .with_context(|| format!("invalid command: '{command}'"))?;
    let args: Vec<CString> = spec
        .cmd
        .iter()
        .map(|a| CString::new(a.as_str()).with_context(|| format!("invalid argument: '{a}'")))
        .collect::<Result<_>>()?;
    let env: Vec<CString> = container_env(&spec.hostname)
        .into_iter()
        .map(|var| CString::new(var).context("invalid environment variable"))
        .collect::<Result<_>>()?;

    debug!(program = ?program, "exec");
    execve(&program, &args, &env).with_context(|| format!("execve '{command}' failed"))?;
    unreachable!("execve returned without an error")
}

/// The minimal environment handed to the container command.
fn container_env(hostname: &str) -> Vec<String> {
    vec![
        format!("PATH={CONTAINER_PATH}"),
        format!("HOSTNAME={hostname}"),
        "TERM=xterm".to_string(),
        "HOME=/root".to_string(),
    ]
}

/// Look up `command` the way a shell would: names containing `/` are used
/// as they are, others are searched in `search_path` below `root`.
fn resolve_command(command: &str, search_path: &str, root: &Path) -> Option<PathBuf> {
    if command.contains('/') {
        return Some(PathBuf::from(command));
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(command))
        .find(|candidate| {
            let on_disk = root.join(candidate.strip_prefix("/").unwrap_or(candidate));
            on_disk
                .metadata()
                .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
                .unwrap_or(false)
        })
}

/// Wait for a child process and return its exit code.
fn wait_for_child(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn executable(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn paths_are_taken_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            resolve_command("./run.sh", CONTAINER_PATH, tmp.path()),
            Some(PathBuf::from("./run.sh"))
        );
        assert_eq!(
            resolve_command("/bin/sh", CONTAINER_PATH, tmp.path()),
            Some(PathBuf::from("/bin/sh"))
        );
    }

    #[test]
    fn bare_names_follow_path_order() {
        let tmp = tempfile::tempdir().unwrap();
        executable(tmp.path(), "bin/ls");
        executable(tmp.path(), "usr/bin/ls");
        assert_eq!(
            resolve_command("ls", CONTAINER_PATH, tmp.path()),
            Some(PathBuf::from("/usr/bin/ls"))
        );
    }

    #[test]
    fn non_executables_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("usr/bin")).unwrap();
        fs::write(tmp.path().join("usr/bin/tool"), "").unwrap();
        executable(tmp.path(), "bin/tool");
        assert_eq!(
            resolve_command("tool", CONTAINER_PATH, tmp.path()),
            Some(PathBuf::from("/bin/tool"))
        );
        assert_eq!(resolve_command("missing", CONTAINER_PATH, tmp.path()), None);
    }

    #[test]
    fn environment_is_minimal() {
        let env = container_env("box");
        assert_eq!(env.len(), 4);
        assert!(env.contains(&"HOSTNAME=box".to_string()));
        assert!(env.iter().any(|v| v.starts_with("PATH=/usr/local/sbin")));
    }
}
