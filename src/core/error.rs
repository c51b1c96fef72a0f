use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// A netlink exchange that did not end in a clean acknowledgement.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolFault {
    #[error("netlink socket returned end of stream")]
    EndOfStream,

    #[error("netlink response truncated ({len} bytes do not fit the receive buffer)")]
    Truncated { len: usize },

    #[error("malformed netlink response: nlmsg_len={declared}, received {received} bytes")]
    Malformed { declared: usize, received: usize },

    #[error("RTNETLINK answers: {errno}")]
    Kernel { errno: Errno },

    #[error("unexpected netlink message type {msg_type}")]
    UnexpectedType { msg_type: u16 },

    #[error("netlink response for sequence {got}, expected {expected}")]
    SequenceMismatch { expected: u32, got: u32 },
}

/// Failures of the packet-filter table transaction.
#[derive(Debug, Error)]
pub enum FirewallFault {
    #[error("cannot open {table} table: {source}")]
    Init {
        table: String,
        #[source]
        source: std::io::Error,
    },

    #[error("chain {chain} is not a built-in chain of table {table}")]
    UnknownChain { table: String, chain: String },

    #[error("chain {chain} is not hooked in table {table}")]
    ChainNotHooked { table: String, chain: String },

    #[error("corrupt entry at offset {offset} in {table} table")]
    CorruptTable { table: String, offset: usize },

    #[error("commit of {table} table failed: {source}")]
    Commit {
        table: String,
        #[source]
        source: std::io::Error,
    },

    #[error("interface name '{0}' is longer than 15 bytes")]
    InterfaceName(String),

    #[error("invalid CIDR '{0}'")]
    Cidr(String),
}

/// Input rejected before any namespace or process is created.
#[derive(Debug, Error)]
pub enum ValidationFault {
    #[error("rootfs path must not be empty")]
    EmptyRootfs,

    #[error("rootfs path '{0}' does not exist")]
    MissingRootfs(PathBuf),

    #[error("refusing to use '/' as rootfs: this would expose the host filesystem")]
    HostRoot,

    #[error(
        "rootfs '{0}' does not look like a filesystem root (no bin/, usr/, or etc/ found)"
    )]
    NotARootfs(PathBuf),

    #[error("no command specified")]
    EmptyCommand,
}
