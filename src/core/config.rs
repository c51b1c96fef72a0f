use std::net::Ipv4Addr;

/// Hostname set inside the container when none is given.
pub const DEFAULT_HOSTNAME: &str = "craterun";

/// Size of the dedicated stack handed to the cloned child (1 MiB).
pub const STACK_SIZE: usize = 1024 * 1024;

/// Root of the cgroup v1 hierarchy. Each subsystem is a directory below it.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Per-subsystem file that registers a task with a cgroup.
pub const CGROUP_TASKS_FILE: &str = "tasks";

/// Upper bound for `--memory`, in bytes (4 GiB).
pub const MAX_MEMORY_BYTES: u64 = 4_294_967_296;
/// Bounds for `--cpu`, as a percentage of one CPU's shares.
pub const MIN_CPU_PERCENT: u64 = 1;
pub const MAX_CPU_PERCENT: u64 = 100;
/// Bounds for `--pids`.
pub const MIN_PIDS: u64 = 10;
pub const MAX_PIDS: u64 = 32768;
/// Bounds for `--io-weight`.
pub const MIN_IO_WEIGHT: u64 = 10;
pub const MAX_IO_WEIGHT: u64 = 1000;

/// Kernel denominator for `cpu.shares`.
pub const CPU_SHARES_UNIT: u64 = 1024;

/// Identity mapping for user-namespace mode: namespace id 0 maps to this
/// host id, for `ID_MAP_LENGTH` consecutive ids.
pub const ID_MAP_INSIDE: u32 = 0;
pub const ID_MAP_OUTSIDE: u32 = 100_000;
pub const ID_MAP_LENGTH: u32 = 65_536;

/// Host side of the veth pair.
pub const VETH_HOST: &str = "veth0";
/// Container side of the veth pair.
pub const VETH_PEER: &str = "veth1";
/// Default uplink used for NAT and forwarding rules.
pub const DEFAULT_EXTERNAL_IFACE: &str = "eth0";

pub const HOST_ADDR: Ipv4Addr = Ipv4Addr::new(172, 16, 1, 1);
pub const PEER_ADDR: Ipv4Addr = Ipv4Addr::new(172, 16, 1, 2);
pub const SUBNET_PREFIX: u8 = 24;
/// Container subnet in CIDR notation, matched by the MASQUERADE rule.
pub const SUBNET_CIDR: &str = "172.16.1.0/24";

/// Receive buffer for netlink responses.
pub const NETLINK_RECV_BUF: usize = 8192;

/// PATH searched for the container command and exported to it.
pub const CONTAINER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
