use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd::{chown, Gid, Uid};
use tracing::{debug, warn};

use crate::core::config::{CGROUP_ROOT, CGROUP_TASKS_FILE};
use crate::core::model::ResourceSpec;
use crate::util::fs::{ensure_dir, remove_dir_if_exists, write_once};

/// One control file and the value written to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting {
    pub file: &'static str,
    pub value: String,
}

/// One cgroup v1 subsystem directory and its ordered settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupController {
    pub subsystem: &'static str,
    pub settings: Vec<Setting>,
}

impl CgroupController {
    fn new(subsystem: &'static str, settings: &[(&'static str, String)]) -> Self {
        Self {
            subsystem,
            settings: settings
                .iter()
                .map(|(file, value)| Setting {
                    file: *file,
                    value: value.clone(),
                })
                .collect(),
        }
    }
}

/// Build one controller per resource that was actually requested.
pub fn build(spec: &ResourceSpec) -> Vec<CgroupController> {
    let mut controllers = Vec::new();

    if let Some(bytes) = spec.memory_bytes {
        let limit = bytes.to_string();
        controllers.push(CgroupController::new(
            "memory",
            &[
                ("memory.limit_in_bytes", limit.clone()),
                ("memory.kmem.limit_in_bytes", limit),
            ],
        ));
    }

    if let Some(shares) = spec.cpu_shares() {
        controllers.push(CgroupController::new(
            "cpu",
            &[("cpu.shares", shares.to_string())],
        ));
    }

    if let Some(pids) = spec.max_pids {
        controllers.push(CgroupController::new(
            "pids",
            &[("pids.max", pids.to_string())],
        ));
    }

    if let Some(weight) = spec.io_weight {
        controllers.push(CgroupController::new(
            "blkio",
            &[("blkio.weight", weight.to_string())],
        ));
    }

    controllers
}

/// The controllers of one container and the directories created for them.
///
/// Directories created by [`Cgroups::apply`] are removed when the value is
/// dropped, whatever the container's outcome.
#[derive(Debug)]
pub struct Cgroups {
    root: PathBuf,
    name: String,
    controllers: Vec<CgroupController>,
    created: Vec<PathBuf>,
}

impl Cgroups {
    pub fn new(spec: &ResourceSpec, name: &str) -> Self {
        Self::with_root(Path::new(CGROUP_ROOT), spec, name)
    }

    pub fn with_root(root: &Path, spec: &ResourceSpec, name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            name: name.to_string(),
            controllers: build(spec),
            created: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn controllers(&self) -> &[CgroupController] {
        &self.controllers
    }

    /// `<root>/<subsystem>/<container-name>`.
    pub fn path(&self, controller: &CgroupController) -> PathBuf {
        self.root.join(controller.subsystem).join(&self.name)
    }

    /// Create every controller directory and write its settings.
    ///
    /// When `owner` is given, the task-membership file is handed to that
    /// host uid/gid so a user-namespaced child can register itself.
    pub fn apply(&mut self, owner: Option<(Uid, Gid)>) -> Result<()> {
        for controller in &self.controllers {
            let dir = self.path(controller);
            let existed = dir.is_dir();
            ensure_dir(&dir, 0o755).with_context(|| {
                format!(
                    "failed to create {} cgroup. Is the cgroup v1 {} hierarchy mounted?",
                    dir.display(),
                    controller.subsystem
                )
            })?;
            if !existed {
                self.created.push(dir.clone());
            }

            for setting in &controller.settings {
                write_once(&dir.join(setting.file), &setting.value)
                    .with_context(|| format!("failed to set {}", setting.file))?;
            }

            if let Some((uid, gid)) = owner {
                let tasks = dir.join(CGROUP_TASKS_FILE);
                chown(&tasks, Some(uid), Some(gid)).with_context(|| {
                    format!("failed to chown {} to {uid}:{gid}", tasks.display())
                })?;
            }

            debug!(
                subsystem = controller.subsystem,
                path = %dir.display(),
                settings = controller.settings.len(),
                "cgroup controller applied"
            );
        }
        Ok(())
    }

    /// Register the calling process with every controller.
    ///
    /// Writes "0" (the writer itself) to each task-membership file, so it must
    /// run in the process that will exec the container command.
    pub fn join(&self) -> Result<()> {
        for controller in &self.controllers {
            let tasks = self.path(controller).join(CGROUP_TASKS_FILE);
            write_once(&tasks, "0").with_context(|| {
                format!("failed to join {} cgroup", controller.subsystem)
            })?;
        }
        Ok(())
    }

    /// Remove the directories this value created. Failures are logged only.
    pub fn release(&mut self) {
        for dir in self.created.drain(..).rev() {
            match remove_dir_if_exists(&dir) {
                Ok(()) => debug!(path = %dir.display(), "cgroup removed"),
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove cgroup"),
            }
        }
    }
}

impl Drop for Cgroups {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn full_spec() -> ResourceSpec {
        ResourceSpec {
            memory_bytes: Some(536_870_912),
            cpu_percent: Some(50),
            max_pids: Some(100),
            io_weight: Some(20),
        }
    }

    fn flatten(controllers: &[CgroupController]) -> Vec<(&str, &str, &str)> {
        controllers
            .iter()
            .flat_map(|c| {
                c.settings
                    .iter()
                    .map(move |s| (c.subsystem, s.file, s.value.as_str()))
            })
            .collect()
    }

    #[test]
    fn builds_expected_settings() {
        let controllers = build(&full_spec());
        assert_eq!(
            flatten(&controllers),
            vec![
                ("memory", "memory.limit_in_bytes", "536870912"),
                ("memory", "memory.kmem.limit_in_bytes", "536870912"),
                ("cpu", "cpu.shares", "512"),
                ("pids", "pids.max", "100"),
                ("blkio", "blkio.weight", "20"),
            ]
        );
    }

    #[test]
    fn unset_resources_get_no_controller() {
        let spec = ResourceSpec {
            max_pids: Some(64),
            ..Default::default()
        };
        let subsystems: Vec<_> = build(&spec).iter().map(|c| c.subsystem).collect();
        assert_eq!(subsystems, vec!["pids"]);
        assert!(build(&ResourceSpec::default()).is_empty());
    }

    #[test]
    fn apply_join_release_in_tempdir() {
        let tmp = tempfile::tempdir().unwrap();
        for sub in ["memory", "cpu", "pids", "blkio"] {
            fs::create_dir(tmp.path().join(sub)).unwrap();
        }

        let mut cgroups = Cgroups::with_root(tmp.path(), &full_spec(), "abc");
        cgroups.apply(None).unwrap();

        let cpu = tmp.path().join("cpu/abc");
        assert_eq!(fs::read_to_string(cpu.join("cpu.shares")).unwrap(), "512");
        assert_eq!(
            fs::read_to_string(tmp.path().join("memory/abc/memory.kmem.limit_in_bytes")).unwrap(),
            "536870912"
        );
        assert!(!cpu.join(CGROUP_TASKS_FILE).exists());

        cgroups.join().unwrap();
        assert_eq!(fs::read_to_string(cpu.join(CGROUP_TASKS_FILE)).unwrap(), "0");

        // Real cgroupfs directories vanish with their control files; emulate it.
        for controller in cgroups.controllers().to_vec() {
            let dir = cgroups.path(&controller);
            for entry in fs::read_dir(&dir).unwrap() {
                fs::remove_file(entry.unwrap().path()).unwrap();
            }
        }
        drop(cgroups);
        assert!(!cpu.exists());
        assert!(tmp.path().join("cpu").exists());
    }

    #[test]
    fn apply_writes_where_join_registers() {
        let tmp = tempfile::tempdir().unwrap();
        for sub in ["memory", "cpu", "pids", "blkio"] {
            fs::create_dir(tmp.path().join(sub)).unwrap();
        }

        let mut cgroups = Cgroups::with_root(tmp.path(), &full_spec(), "xyz");
        cgroups.apply(None).unwrap();
        cgroups.join().unwrap();
        for controller in cgroups.controllers() {
            let dir = cgroups.path(controller);
            assert!(cgroups.created.contains(&dir), "{} not tracked", dir.display());
            assert_eq!(fs::read_to_string(dir.join(CGROUP_TASKS_FILE)).unwrap(), "0");
            for setting in &controller.settings {
                assert!(dir.join(setting.file).is_file(), "{} missing", setting.file);
            }
        }
        // leave cleanup to the tempdir
        cgroups.created.clear();
    }

    #[test]
    fn apply_fails_without_hierarchy() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cgroups = Cgroups::with_root(tmp.path(), &full_spec(), "abc");
        assert!(cgroups.apply(None).is_err());
    }

    #[test]
    fn join_before_apply_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let cgroups = Cgroups::with_root(tmp.path(), &full_spec(), "abc");
        assert!(cgroups.join().is_err());
    }
}
