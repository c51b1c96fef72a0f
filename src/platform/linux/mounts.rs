use std::fs::{self, File, Permissions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{self, makedev, Mode, SFlag};
use nix::unistd::{chdir, fchdir, pivot_root, ttyname};
use tracing::{debug, warn};

use crate::util::fs::{ensure_dir, touch};

/// A filesystem mounted inside the new root before the pivot.
#[derive(Debug, Clone, Copy)]
pub struct Filesystem {
    /// Mount point relative to the new root.
    pub path: &'static str,
    pub fstype: &'static str,
    pub flags: MsFlags,
    pub data: Option<&'static str>,
}

/// A character device exposed under the container's `/dev`.
#[derive(Debug, Clone, Copy)]
pub struct Device {
    /// Node path relative to the new root.
    pub path: &'static str,
    pub major: u64,
    pub minor: u64,
}

pub const FILESYSTEMS: [Filesystem; 6] = [
    Filesystem {
        path: "proc",
        fstype: "proc",
        flags: MsFlags::MS_NOEXEC.union(MsFlags::MS_NOSUID).union(MsFlags::MS_NODEV),
        data: None,
    },
    Filesystem {
        path: "dev",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOEXEC.union(MsFlags::MS_STRICTATIME),
        data: Some("mode=755"),
    },
    Filesystem {
        path: "dev/shm",
        fstype: "tmpfs",
        flags: MsFlags::MS_NOEXEC.union(MsFlags::MS_NOSUID).union(MsFlags::MS_NODEV),
        data: Some("mode=1777,size=65536k"),
    },
    Filesystem {
        path: "dev/mqueue",
        fstype: "mqueue",
        flags: MsFlags::MS_NOEXEC.union(MsFlags::MS_NOSUID).union(MsFlags::MS_NODEV),
        data: None,
    },
    Filesystem {
        path: "dev/pts",
        fstype: "devpts",
        flags: MsFlags::MS_NOEXEC.union(MsFlags::MS_NOSUID),
        data: Some("newinstance,ptmxmode=0666,mode=620"),
    },
    Filesystem {
        path: "sys",
        fstype: "sysfs",
        flags: MsFlags::MS_NOEXEC
            .union(MsFlags::MS_NOSUID)
            .union(MsFlags::MS_NODEV)
            .union(MsFlags::MS_RDONLY),
        data: None,
    },
];

pub const DEVICES: [Device; 7] = [
    Device { path: "dev/null", major: 1, minor: 3 },
    Device { path: "dev/zero", major: 1, minor: 5 },
    Device { path: "dev/full", major: 1, minor: 7 },
    Device { path: "dev/tty", major: 5, minor: 0 },
    Device { path: "dev/random", major: 1, minor: 8 },
    Device { path: "dev/urandom", major: 1, minor: 9 },
    Device { path: "dev/console", major: 5, minor: 1 },
];

const CONSOLE: &str = "dev/console";

/// `(link, target)` pairs created under the new root.
pub const SYMLINKS: [(&str, &str); 5] = [
    ("dev/fd", "/proc/self/fd"),
    ("dev/stdin", "/proc/self/fd/0"),
    ("dev/stdout", "/proc/self/fd/1"),
    ("dev/stderr", "/proc/self/fd/2"),
    ("dev/ptmx", "pts/ptmx"),
];

const DEVICE_MODE: u32 = 0o666;

/// The privileged filesystem operations the jail is built from.
pub trait MountOps {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;

    fn mkdir(&mut self, path: &Path) -> Result<()>;

    fn mknod(&mut self, path: &Path, major: u64, minor: u64) -> Result<()>;

    fn touch(&mut self, path: &Path) -> Result<()>;

    fn symlink(&mut self, target: &Path, link: &Path) -> Result<()>;

    /// Make `root` the process root and discard the old one.
    fn pivot(&mut self, root: &Path) -> Result<()>;
}

/// [`MountOps`] against the calling process's mount namespace.
#[derive(Debug, Default)]
pub struct HostMounts;

impl MountOps for HostMounts {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data).with_context(|| {
            format!(
                "failed to mount {} on {} ({flags:?})",
                source.or(fstype.map(Path::new)).unwrap_or(Path::new("none")).display(),
                target.display()
            )
        })
    }

    fn mkdir(&mut self, path: &Path) -> Result<()> {
        ensure_dir(path, 0o755)
    }

    fn mknod(&mut self, path: &Path, major: u64, minor: u64) -> Result<()> {
        stat::mknod(
            path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(DEVICE_MODE),
            makedev(major, minor),
        )
        .with_context(|| format!("mknod {} failed", path.display()))?;
        // mknod honours the umask
        fs::set_permissions(path, Permissions::from_mode(DEVICE_MODE))
            .with_context(|| format!("failed to chmod {}", path.display()))
    }

    fn touch(&mut self, path: &Path) -> Result<()> {
        touch(path)
    }

    fn symlink(&mut self, target: &Path, link: &Path) -> Result<()> {
        symlink(target, link).with_context(|| {
            format!("failed to link {} -> {}", link.display(), target.display())
        })
    }

    fn pivot(&mut self, root: &Path) -> Result<()> {
        let old_root = File::open("/").context("failed to open old root")?;
        let new_root = File::open(root)
            .with_context(|| format!("failed to open new root {}", root.display()))?;

        fchdir(new_root.as_raw_fd()).context("fchdir into new root")?;
        // The old root ends up stacked on top of the new one at "/".
        pivot_root(".", ".").with_context(|| format!("pivot_root into {} failed", root.display()))?;

        fchdir(old_root.as_raw_fd()).context("fchdir into old root")?;
        mount(
            None::<&str>,
            ".",
            None::<&str>,
            MsFlags::MS_SLAVE | MsFlags::MS_REC,
            None::<&str>,
        )
        .context("failed to make old root a slave mount")?;
        umount2(".", MntFlags::MNT_DETACH).context("failed to detach old root")?;

        drop(new_root);
        drop(old_root);
        chdir("/").context("chdir / after pivot_root")?;
        Ok(())
    }
}

/// The filesystem view of one container.
#[derive(Debug, Clone)]
pub struct Jail {
    root: PathBuf,
    privileged: bool,
    console: Option<PathBuf>,
}

impl Jail {
    /// `privileged` selects `mknod` device nodes; otherwise host devices are
    /// bind-mounted over placeholder files.
    ///
    /// `/dev/console` is bound to the terminal behind stdin. When stdin is
    /// not a terminal the bind is skipped with a warning and `/dev/console`
    /// is left unbound: a `mknod`'d node when privileged, absent otherwise.
    pub fn new(root: &Path, privileged: bool) -> Self {
        Self {
            root: root.to_path_buf(),
            privileged,
            console: controlling_terminal(),
        }
    }

    /// Replace the terminal bound onto `/dev/console`.
    pub fn with_console(mut self, console: Option<PathBuf>) -> Self {
        self.console = console;
        self
    }

    fn at(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Run every jail step in order, ending inside the new root.
    pub fn enter(&self, ops: &mut impl MountOps) -> Result<()> {
        self.isolate_propagation(ops)?;
        self.bind_root(ops)?;
        self.mount_filesystems(ops)?;
        self.populate_dev(ops)?;
        self.bind_console(ops)?;
        self.link_dev(ops)?;
        ops.pivot(&self.root)?;
        debug!(root = %self.root.display(), "pivoted into new root");
        Ok(())
    }

    fn isolate_propagation(&self, ops: &mut impl MountOps) -> Result<()> {
        let host_root = Path::new("/");
        ops.mount(None, host_root, None, MsFlags::MS_SLAVE | MsFlags::MS_REC, None)?;
        ops.mount(None, host_root, None, MsFlags::MS_PRIVATE | MsFlags::MS_REC, None)
    }

    fn bind_root(&self, ops: &mut impl MountOps) -> Result<()> {
        ops.mount(
            Some(&self.root),
            &self.root,
            None,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None,
        )
    }

    fn mount_filesystems(&self, ops: &mut impl MountOps) -> Result<()> {
        for fs in &FILESYSTEMS {
            let target = self.at(fs.path);
            ops.mkdir(&target)?;
            ops.mount(
                Some(Path::new(fs.fstype)),
                &target,
                Some(fs.fstype),
                fs.flags,
                fs.data,
            )?;
            debug!(path = fs.path, fstype = fs.fstype, "mounted");
        }
        Ok(())
    }

    fn populate_dev(&self, ops: &mut impl MountOps) -> Result<()> {
        for dev in &DEVICES {
            let target = self.at(dev.path);
            if self.privileged {
                ops.mknod(&target, dev.major, dev.minor)?;
            } else if dev.path != CONSOLE {
                // mknod is refused inside a user namespace whatever the capabilities.
                let host = Path::new("/").join(dev.path);
                ops.touch(&target)?;
                ops.mount(Some(&host), &target, None, MsFlags::MS_BIND, None)?;
            }
        }
        debug!(privileged = self.privileged, "device nodes ready");
        Ok(())
    }

    fn bind_console(&self, ops: &mut impl MountOps) -> Result<()> {
        let Some(tty) = &self.console else {
            warn!("stdin is not a terminal, /dev/console left unbound");
            return Ok(());
        };
        let target = self.at(CONSOLE);
        if !self.privileged {
            ops.touch(&target)?;
        }
        ops.mount(Some(tty), &target, None, MsFlags::MS_BIND, None)
    }

    fn link_dev(&self, ops: &mut impl MountOps) -> Result<()> {
        for (link, target) in SYMLINKS {
            ops.symlink(Path::new(target), &self.at(link))?;
        }
        Ok(())
    }
}

/// The terminal attached to stdin, if any.
fn controlling_terminal() -> Option<PathBuf> {
    ttyname(std::io::stdin()).ok()
}

/// Jail the calling process into `root`.
pub fn jail(root: &Path, privileged: bool) -> Result<()> {
    Jail::new(root, privileged).enter(&mut HostMounts)
}
