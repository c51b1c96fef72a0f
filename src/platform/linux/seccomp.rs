//! Syscall deny-list installed right before the container command runs.
//!
//! Everything not listed is allowed. Listed calls fail with `EPERM` so the
//! contained program sees an ordinary error instead of a `SIGSYS` kill.
//! `clone3` gets a second filter answering `ENOSYS`: its flags live in
//! user memory where BPF cannot inspect them, and libc falls back to
//! `clone` on that errno.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use tracing::debug;

#[cfg(target_arch = "x86_64")]
const ARCH: TargetArch = TargetArch::x86_64;
#[cfg(target_arch = "aarch64")]
const ARCH: TargetArch = TargetArch::aarch64;

/// Deny only when `(args[index] & mask) == mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgMask {
    pub index: u8,
    pub mask: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeniedSyscall {
    pub name: &'static str,
    pub nr: i64,
    /// Any of these matching denies the call; empty denies it outright.
    pub when: &'static [ArgMask],
}

const SET_ID_BITS_ARG1: &[ArgMask] = &[
    ArgMask { index: 1, mask: libc::S_ISUID as u64 },
    ArgMask { index: 1, mask: libc::S_ISGID as u64 },
];
const SET_ID_BITS_ARG2: &[ArgMask] = &[
    ArgMask { index: 2, mask: libc::S_ISUID as u64 },
    ArgMask { index: 2, mask: libc::S_ISGID as u64 },
];
const NEW_USER_NS_ARG0: &[ArgMask] = &[ArgMask {
    index: 0,
    mask: libc::CLONE_NEWUSER as u64,
}];

/// Same number on x86_64 and aarch64 (Linux 6.6+).
const SYS_FCHMODAT2: i64 = 452;

const fn deny(name: &'static str, nr: i64) -> DeniedSyscall {
    DeniedSyscall { name, nr, when: &[] }
}

const fn deny_when(name: &'static str, nr: i64, when: &'static [ArgMask]) -> DeniedSyscall {
    DeniedSyscall { name, nr, when }
}

/// The container's syscall deny-list.
pub fn denied_syscalls() -> Vec<DeniedSyscall> {
    let mut list = Vec::with_capacity(32);
    // aarch64 only has fchmodat
    #[cfg(target_arch = "x86_64")]
    list.push(deny_when("chmod", libc::SYS_chmod, SET_ID_BITS_ARG1));
    list.extend([
        deny_when("fchmod", libc::SYS_fchmod, SET_ID_BITS_ARG1),
        deny_when("fchmodat", libc::SYS_fchmodat, SET_ID_BITS_ARG2),
        deny_when("fchmodat2", SYS_FCHMODAT2, SET_ID_BITS_ARG2),
        deny_when("unshare", libc::SYS_unshare, NEW_USER_NS_ARG0),
        deny_when("clone", libc::SYS_clone, NEW_USER_NS_ARG0),
        deny("keyctl", libc::SYS_keyctl),
        deny("add_key", libc::SYS_add_key),
        deny("request_key", libc::SYS_request_key),
        deny("ptrace", libc::SYS_ptrace),
        deny("mount", libc::SYS_mount),
        deny("umount2", libc::SYS_umount2),
        deny("pivot_root", libc::SYS_pivot_root),
        deny("reboot", libc::SYS_reboot),
        deny("swapon", libc::SYS_swapon),
        deny("swapoff", libc::SYS_swapoff),
        deny("kexec_load", libc::SYS_kexec_load),
        deny("kexec_file_load", libc::SYS_kexec_file_load),
        deny("init_module", libc::SYS_init_module),
        deny("finit_module", libc::SYS_finit_module),
        deny("delete_module", libc::SYS_delete_module),
        deny("quotactl", libc::SYS_quotactl),
        deny("acct", libc::SYS_acct),
        deny("setns", libc::SYS_setns),
        deny("personality", libc::SYS_personality),
        deny("perf_event_open", libc::SYS_perf_event_open),
        deny("bpf", libc::SYS_bpf),
        deny("open_by_handle_at", libc::SYS_open_by_handle_at),
        deny("lookup_dcookie", libc::SYS_lookup_dcookie),
    ]);
    list
}

fn rules_for(syscall: &DeniedSyscall) -> Result<Vec<SeccompRule>> {
    syscall
        .when
        .iter()
        .map(|arg| {
            let cond = SeccompCondition::new(
                arg.index,
                SeccompCmpArgLen::Dword,
                SeccompCmpOp::MaskedEq(arg.mask),
                arg.mask,
            )
            .map_err(|e| anyhow!("invalid condition for {}: {e}", syscall.name))?;
            SeccompRule::new(vec![cond])
                .map_err(|e| anyhow!("invalid rule for {}: {e}", syscall.name))
        })
        .collect()
}

fn compile(
    rules: BTreeMap<i64, Vec<SeccompRule>>,
    on_match: SeccompAction,
) -> Result<BpfProgram> {
    let filter = SeccompFilter::new(rules, SeccompAction::Allow, on_match, ARCH)
        .map_err(|e| anyhow!("failed to build seccomp filter: {e}"))?;
    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| anyhow!("failed to compile seccomp filter: {e}"))
}

/// BPF program for [`denied_syscalls`].
pub fn deny_list_program() -> Result<BpfProgram> {
    let mut rules = BTreeMap::new();
    for syscall in denied_syscalls() {
        rules.insert(syscall.nr, rules_for(&syscall)?);
    }
    compile(rules, SeccompAction::Errno(libc::EPERM as u32))
}

/// BPF program answering `clone3` with `ENOSYS`.
pub fn clone3_program() -> Result<BpfProgram> {
    let rules = BTreeMap::from([(libc::SYS_clone3, Vec::new())]);
    compile(rules, SeccompAction::Errno(libc::ENOSYS as u32))
}

/// Load both filters into the calling thread. Sets `no_new_privs`.
pub fn install() -> Result<()> {
    let deny = deny_list_program()?;
    let clone3 = clone3_program()?;

    seccompiler::apply_filter(&deny).map_err(|e| anyhow!("failed to load seccomp filter: {e}"))?;
    seccompiler::apply_filter(&clone3)
        .map_err(|e| anyhow!("failed to load clone3 seccomp filter: {e}"))?;

    debug!(denied = denied_syscalls().len(), "seccomp filter installed");
    Ok(())
}
