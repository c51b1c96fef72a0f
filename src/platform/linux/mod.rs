pub mod capabilities;
pub mod cgroups;
pub mod firewall;
pub mod mounts;
pub mod namespaces;
pub mod netlink;
pub mod network;
pub mod process;
pub mod seccomp;
pub mod sync;
pub mod userns;
