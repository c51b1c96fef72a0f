use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Create a single directory with the given mode. An existing directory is
/// accepted; any other failure is returned.
pub fn ensure_dir(path: &Path, mode: u32) -> Result<()> {
    match DirBuilder::new().mode(mode).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to create directory {}", path.display())),
    }
}

/// Write `contents` to a file with exactly one `write(2)` call.
///
/// Kernel control files (`uid_map`, cgroup settings) interpret each write as
/// one transaction, so a short write is an error instead of being retried.
pub fn write_once(path: &Path, contents: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let written = file
        .write(contents.as_bytes())
        .with_context(|| format!("failed to write '{}' to {}", contents.trim_end(), path.display()))?;
    if written != contents.len() {
        bail!(
            "short write to {}: {written} of {} bytes",
            path.display(),
            contents.len()
        );
    }
    Ok(())
}

/// Create an empty regular file to serve as a bind-mount target.
pub fn touch(path: &Path) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok(())
}

/// Remove an empty directory, treating "already gone" as success.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_dir_accepts_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("a");
        ensure_dir(&dir, 0o755).unwrap();
        ensure_dir(&dir, 0o755).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn ensure_dir_reports_missing_parent() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(ensure_dir(&tmp.path().join("x/y"), 0o755).is_err());
    }

    #[test]
    fn write_once_writes_whole_value() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("pids.max");
        write_once(&file, "100").unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "100");
    }

    #[test]
    fn write_once_fails_without_parent() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(write_once(&tmp.path().join("missing/pids.max"), "100").is_err());
    }

    #[test]
    fn touch_creates_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("null");
        touch(&file).unwrap();
        touch(&file).unwrap();
        assert_eq!(fs::metadata(&file).unwrap().len(), 0);
    }

    #[test]
    fn remove_missing_dir_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        remove_dir_if_exists(&tmp.path().join("gone")).unwrap();
    }
}
