use std::fmt;
use std::path::PathBuf;

use super::config::{CPU_SHARES_UNIT, ID_MAP_INSIDE, ID_MAP_LENGTH, ID_MAP_OUTSIDE};

/// Declared resource limits for one container.
///
/// A field is `Some` only when the limit was supplied on the command line
/// and passed range validation. Values are never changed after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    /// Memory limit in bytes, applied to user and kernel memory alike.
    pub memory_bytes: Option<u64>,
    /// CPU share as a percentage (1-100) of one CPU's `cpu.shares`.
    pub cpu_percent: Option<u64>,
    /// Maximum number of processes.
    pub max_pids: Option<u64>,
    /// Block I/O weight (10-1000).
    pub io_weight: Option<u64>,
}

impl ResourceSpec {
    pub fn has_memory(&self) -> bool {
        self.memory_bytes.is_some()
    }

    pub fn has_cpu(&self) -> bool {
        self.cpu_percent.is_some()
    }

    pub fn has_pids(&self) -> bool {
        self.max_pids.is_some()
    }

    pub fn has_io(&self) -> bool {
        self.io_weight.is_some()
    }

    /// True when no limit at all was requested.
    pub fn is_empty(&self) -> bool {
        !(self.has_memory() || self.has_cpu() || self.has_pids() || self.has_io())
    }

    /// `cpu.shares` value for the requested percentage.
    pub fn cpu_shares(&self) -> Option<u64> {
        self.cpu_percent.map(|pct| pct * CPU_SHARES_UNIT / 100)
    }
}

/// One record of a `uid_map`/`gid_map` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub inside: u32,
    pub outside: u32,
    pub length: u32,
}

impl Default for IdMapping {
    fn default() -> Self {
        Self {
            inside: ID_MAP_INSIDE,
            outside: ID_MAP_OUTSIDE,
            length: ID_MAP_LENGTH,
        }
    }
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.inside, self.outside, self.length)
    }
}

/// A single container invocation, built from validated CLI input.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Canonical path to the container's root filesystem.
    pub rootfs: PathBuf,
    /// The command and its arguments.
    pub cmd: Vec<String>,
    pub hostname: String,
    /// Resource limits; `None` when no limit flag was given.
    pub resources: Option<ResourceSpec>,
    /// Run the container in a new user namespace (unprivileged mode).
    pub userns: bool,
    /// Host uplink for the NAT and forwarding rules.
    pub external_iface: String,
}

impl LaunchSpec {
    /// Identity mapping applied when `userns` is set.
    pub fn id_mapping(&self) -> IdMapping {
        IdMapping::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_follow_supplied_values() {
        let spec = ResourceSpec {
            memory_bytes: Some(1024),
            io_weight: Some(10),
            ..Default::default()
        };
        assert!(spec.has_memory());
        assert!(!spec.has_cpu());
        assert!(!spec.has_pids());
        assert!(spec.has_io());
        assert!(!spec.is_empty());
        assert!(ResourceSpec::default().is_empty());
    }

    #[test]
    fn cpu_percentage_rescales_to_shares() {
        let shares = |pct| {
            ResourceSpec {
                cpu_percent: Some(pct),
                ..Default::default()
            }
            .cpu_shares()
        };
        assert_eq!(shares(50), Some(512));
        assert_eq!(shares(100), Some(1024));
        assert_eq!(shares(1), Some(10));
        assert_eq!(ResourceSpec::default().cpu_shares(), None);
    }

    #[test]
    fn default_mapping_record() {
        assert_eq!(IdMapping::default().to_string(), "0 100000 65536");
    }
}
