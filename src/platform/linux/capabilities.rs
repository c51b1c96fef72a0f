use anyhow::{Context, Result};
use caps::{CapSet, Capability};
use tracing::debug;

/// Capabilities removed from the container's bounding and inheritable sets.
pub const DROPPED: [Capability; 28] = [
    Capability::CAP_NET_BROADCAST,
    Capability::CAP_SYS_MODULE,
    Capability::CAP_SYS_RAWIO,
    Capability::CAP_SYS_PACCT,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_NICE,
    Capability::CAP_SYS_RESOURCE,
    Capability::CAP_SYS_TIME,
    Capability::CAP_SYS_TTY_CONFIG,
    Capability::CAP_AUDIT_CONTROL,
    Capability::CAP_MAC_OVERRIDE,
    Capability::CAP_MAC_ADMIN,
    Capability::CAP_NET_ADMIN,
    Capability::CAP_SYSLOG,
    Capability::CAP_DAC_READ_SEARCH,
    Capability::CAP_LINUX_IMMUTABLE,
    Capability::CAP_IPC_LOCK,
    Capability::CAP_IPC_OWNER,
    Capability::CAP_SYS_PTRACE,
    Capability::CAP_SYS_BOOT,
    Capability::CAP_LEASE,
    Capability::CAP_WAKE_ALARM,
    Capability::CAP_BLOCK_SUSPEND,
    Capability::CAP_MKNOD,
    Capability::CAP_AUDIT_READ,
    Capability::CAP_AUDIT_WRITE,
    Capability::CAP_FSETID,
    Capability::CAP_SETFCAP,
];

/// Drop [`DROPPED`] from the bounding set, then clear it from the
/// inheritable set of the calling thread.
pub fn drop_capabilities() -> Result<()> {
    for cap in DROPPED {
        caps::drop(None, CapSet::Bounding, cap)
            .with_context(|| format!("failed to drop {cap} from the bounding set"))?;
    }

    let mut inheritable =
        caps::read(None, CapSet::Inheritable).context("failed to read inheritable capabilities")?;
    for cap in &DROPPED {
        inheritable.remove(cap);
    }
    caps::set(None, CapSet::Inheritable, &inheritable)
        .context("failed to commit inheritable capabilities")?;

    debug!(dropped = DROPPED.len(), "capabilities dropped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn drop_set_has_no_duplicates() {
        let unique: HashSet<_> = DROPPED.iter().collect();
        assert_eq!(unique.len(), DROPPED.len());
    }

    #[test]
    fn survivable_set_is_kept() {
        for kept in [
            Capability::CAP_CHOWN,
            Capability::CAP_DAC_OVERRIDE,
            Capability::CAP_FOWNER,
            Capability::CAP_KILL,
            Capability::CAP_SETGID,
            Capability::CAP_SETUID,
            Capability::CAP_SETPCAP,
            Capability::CAP_NET_BIND_SERVICE,
            Capability::CAP_NET_RAW,
            Capability::CAP_SYS_CHROOT,
        ] {
            assert!(!DROPPED.contains(&kept), "{kept} must survive");
        }
    }

    #[test]
    fn escalation_paths_are_dropped() {
        for cap in [
            Capability::CAP_SYS_ADMIN,
            Capability::CAP_SYS_MODULE,
            Capability::CAP_SYS_PTRACE,
            Capability::CAP_SYS_RAWIO,
            Capability::CAP_NET_ADMIN,
            Capability::CAP_MKNOD,
        ] {
            assert!(DROPPED.contains(&cap));
        }
    }
}
