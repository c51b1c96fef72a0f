//! IPv4 packet-filter rules committed through the `ip_tables` socket options.
//!
//! A [`FirewallRule`] is encoded into the kernel's `ipt_entry` layout: a fixed
//! 112-byte header carrying the match criteria, followed by a target block.
//! [`Table`] fetches the current table blob, splices the entry in front of the
//! chain's policy entry, and replaces the whole table in one `setsockopt`.

use std::ffi::c_void;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::core::error::FirewallFault;

const IPT_SO_SET_REPLACE: libc::c_int = 64;
const IPT_SO_SET_ADD_COUNTERS: libc::c_int = 65;
const IPT_SO_GET_INFO: libc::c_int = 64;
const IPT_SO_GET_ENTRIES: libc::c_int = 65;

const TABLE_NAME_LEN: usize = 32;
const IFNAMSIZ: usize = 16;
const TARGET_NAME_LEN: usize = 29;
const NUM_HOOKS: usize = 5;

/// `sizeof(struct ipt_entry)`.
const ENTRY_SIZE: usize = 112;
/// `sizeof(struct xt_entry_target)`.
const TARGET_HEADER_SIZE: usize = 32;
/// `XT_ALIGN(sizeof(struct xt_standard_target))`.
const STANDARD_TARGET_SIZE: usize = 40;
/// `XT_ALIGN(sizeof(struct nf_nat_ipv4_multi_range_compat))`.
const NAT_RANGE_SIZE: usize = 24;

const GETINFO_SIZE: usize = 84;
const GET_ENTRIES_HEADER: usize = 40;
const REPLACE_HEADER: usize = 96;
const COUNTERS_INFO_HEADER: usize = 40;
const COUNTER_SIZE: usize = 16;

// Offsets inside `struct ipt_entry`.
const OFF_SRC: usize = 0;
const OFF_DST: usize = 4;
const OFF_SMSK: usize = 8;
const OFF_DMSK: usize = 12;
const OFF_INIFACE: usize = 16;
const OFF_OUTIFACE: usize = 32;
const OFF_INIFACE_MASK: usize = 48;
const OFF_OUTIFACE_MASK: usize = 64;
const OFF_TARGET_OFFSET: usize = 88;
const OFF_NEXT_OFFSET: usize = 90;

const NF_ACCEPT: i32 = 1;

/// An IPv4 network in `a.b.c.d/len` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::MAX.checked_shl(32 - u32::from(self.prefix_len)).unwrap_or(0))
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.mask()))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = FirewallFault;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FirewallFault::Cidr(s.to_string());
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr = addr.parse().map_err(|_| invalid())?;
        let prefix_len: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix_len > 32 {
            return Err(invalid());
        }
        Ok(Self { addr, prefix_len })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// What a matching packet is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Accept,
    Masquerade,
}

impl Target {
    fn name(self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Masquerade => "MASQUERADE",
        }
    }

    /// Name carried in `xt_entry_target`; verdicts use the unnamed standard target.
    fn wire_name(self) -> &'static str {
        match self {
            Self::Accept => "",
            Self::Masquerade => "MASQUERADE",
        }
    }

    /// Size of the target block, including its `xt_entry_target` header.
    fn size(self) -> usize {
        match self {
            Self::Accept => STANDARD_TARGET_SIZE,
            Self::Masquerade => TARGET_HEADER_SIZE + NAT_RANGE_SIZE,
        }
    }
}

/// One packet-filter entry to append to a built-in chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub table: &'static str,
    pub chain: &'static str,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub src: Option<Ipv4Cidr>,
    pub dst: Option<Ipv4Cidr>,
    pub target: Target,
}

impl FirewallRule {
    /// `-t nat -A POSTROUTING -s <src> -o <out> -j MASQUERADE`
    pub fn masquerade(src: Ipv4Cidr, out_iface: &str) -> Self {
        Self {
            table: "nat",
            chain: "POSTROUTING",
            in_iface: None,
            out_iface: Some(out_iface.to_string()),
            src: Some(src),
            dst: None,
            target: Target::Masquerade,
        }
    }

    /// `-t filter -A FORWARD -i <in> -o <out> -j ACCEPT`
    pub fn forward_accept(in_iface: &str, out_iface: &str) -> Self {
        Self {
            table: "filter",
            chain: "FORWARD",
            in_iface: Some(in_iface.to_string()),
            out_iface: Some(out_iface.to_string()),
            src: None,
            dst: None,
            target: Target::Accept,
        }
    }

    /// Encode the rule as an `ipt_entry` followed by its target.
    pub fn encode(&self) -> Result<Vec<u8>, FirewallFault> {
        let total = ENTRY_SIZE + self.target.size();
        let mut e = vec![0u8; total];

        if let Some(src) = self.src {
            e[OFF_SRC..OFF_SRC + 4].copy_from_slice(&src.network().octets());
            e[OFF_SMSK..OFF_SMSK + 4].copy_from_slice(&src.mask().octets());
        }
        if let Some(dst) = self.dst {
            e[OFF_DST..OFF_DST + 4].copy_from_slice(&dst.network().octets());
            e[OFF_DMSK..OFF_DMSK + 4].copy_from_slice(&dst.mask().octets());
        }
        if let Some(name) = &self.in_iface {
            put_iface(&mut e, OFF_INIFACE, OFF_INIFACE_MASK, name)?;
        }
        if let Some(name) = &self.out_iface {
            put_iface(&mut e, OFF_OUTIFACE, OFF_OUTIFACE_MASK, name)?;
        }

        e[OFF_TARGET_OFFSET..OFF_TARGET_OFFSET + 2].copy_from_slice(&(ENTRY_SIZE as u16).to_ne_bytes());
        e[OFF_NEXT_OFFSET..OFF_NEXT_OFFSET + 2].copy_from_slice(&(total as u16).to_ne_bytes());

        let t = ENTRY_SIZE;
        e[t..t + 2].copy_from_slice(&(self.target.size() as u16).to_ne_bytes());
        let name = self.target.wire_name().as_bytes();
        debug_assert!(name.len() < TARGET_NAME_LEN);
        e[t + 2..t + 2 + name.len()].copy_from_slice(name);

        match self.target {
            Target::Accept => {
                let verdict = -NF_ACCEPT - 1;
                e[t + TARGET_HEADER_SIZE..t + TARGET_HEADER_SIZE + 4]
                    .copy_from_slice(&verdict.to_ne_bytes());
            }
            Target::Masquerade => {
                // rangesize = 1, single empty range: use the egress address.
                e[t + TARGET_HEADER_SIZE..t + TARGET_HEADER_SIZE + 4]
                    .copy_from_slice(&1u32.to_ne_bytes());
            }
        }
        Ok(e)
    }
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} -A {}", self.table, self.chain)?;
        if let Some(src) = &self.src {
            write!(f, " -s {src}")?;
        }
        if let Some(dst) = &self.dst {
            write!(f, " -d {dst}")?;
        }
        if let Some(i) = &self.in_iface {
            write!(f, " -i {i}")?;
        }
        if let Some(o) = &self.out_iface {
            write!(f, " -o {o}")?;
        }
        write!(f, " -j {}", self.target.name())
    }
}

/// Write an interface name and a mask covering the name and its terminator.
fn put_iface(e: &mut [u8], at: usize, mask_at: usize, name: &str) -> Result<(), FirewallFault> {
    if name.is_empty() || name.len() >= IFNAMSIZ {
        return Err(FirewallFault::InterfaceName(name.to_string()));
    }
    e[at..at + name.len()].copy_from_slice(name.as_bytes());
    e[mask_at..mask_at + name.len() + 1].fill(0xff);
    Ok(())
}

fn hook_of(chain: &str) -> Option<usize> {
    match chain {
        "PREROUTING" => Some(0),
        "INPUT" => Some(1),
        "FORWARD" => Some(2),
        "OUTPUT" => Some(3),
        "POSTROUTING" => Some(4),
        _ => None,
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_ne_bytes());
}

fn table_name(name: &str) -> [u8; TABLE_NAME_LEN] {
    let mut out = [0u8; TABLE_NAME_LEN];
    let n = name.len().min(TABLE_NAME_LEN - 1);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

/// `struct ipt_getinfo` minus the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TableInfo {
    pub valid_hooks: u32,
    pub hook_entry: [u32; NUM_HOOKS],
    pub underflow: [u32; NUM_HOOKS],
    pub num_entries: u32,
    pub size: u32,
}

/// A table's entries as fetched from the kernel, with pending appends.
#[derive(Debug, Clone)]
pub struct TableBlob {
    name: String,
    info: TableInfo,
    entries: Vec<u8>,
    /// For each current entry, its index in the fetched table (None if new).
    origin: Vec<Option<usize>>,
    old_entries: usize,
}

impl TableBlob {
    pub fn new(name: &str, info: TableInfo, entries: Vec<u8>) -> Self {
        let old_entries = info.num_entries as usize;
        Self {
            name: name.to_string(),
            info,
            entries,
            origin: (0..old_entries).map(Some).collect(),
            old_entries,
        }
    }

    #[cfg(test)]
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[u8] {
        &self.entries
    }

    fn corrupt(&self, offset: usize) -> FirewallFault {
        FirewallFault::CorruptTable {
            table: self.name.clone(),
            offset,
        }
    }

    fn offsets(&self) -> Result<Vec<usize>, FirewallFault> {
        let mut offsets = Vec::new();
        let mut off = 0;
        while off < self.entries.len() {
            if off + ENTRY_SIZE > self.entries.len() {
                return Err(self.corrupt(off));
            }
            let next = read_u16(&self.entries, off + OFF_NEXT_OFFSET) as usize;
            if next < ENTRY_SIZE || off + next > self.entries.len() {
                return Err(self.corrupt(off));
            }
            offsets.push(off);
            off += next;
        }
        Ok(offsets)
    }

    /// Append `entry` to the end of built-in `chain`, ahead of its policy.
    pub fn append(&mut self, chain: &str, entry: &[u8]) -> Result<(), FirewallFault> {
        let hook = hook_of(chain).ok_or_else(|| FirewallFault::UnknownChain {
            table: self.name.clone(),
            chain: chain.to_string(),
        })?;
        if self.info.valid_hooks & (1 << hook) == 0 {
            return Err(FirewallFault::ChainNotHooked {
                table: self.name.clone(),
                chain: chain.to_string(),
            });
        }

        let at = self.info.underflow[hook] as usize;
        let offsets = self.offsets()?;
        let index = offsets
            .iter()
            .position(|&off| off == at)
            .ok_or_else(|| self.corrupt(at))?;
        let shift = entry.len() as u32;

        // Standard-target jumps are absolute offsets into the blob.
        for &off in &offsets {
            let t = off + read_u16(&self.entries, off + OFF_TARGET_OFFSET) as usize;
            if t + STANDARD_TARGET_SIZE > self.entries.len() {
                continue;
            }
            let target_size = read_u16(&self.entries, t) as usize;
            let standard = self.entries[t + 2] == 0;
            if standard && target_size >= TARGET_HEADER_SIZE + 4 {
                let verdict = read_u32(&self.entries, t + TARGET_HEADER_SIZE) as i32;
                if verdict >= 0 && verdict as usize >= at {
                    write_u32(&mut self.entries, t + TARGET_HEADER_SIZE, verdict as u32 + shift);
                }
            }
        }

        for h in 0..NUM_HOOKS {
            if self.info.valid_hooks & (1 << h) == 0 {
                continue;
            }
            if self.info.hook_entry[h] as usize > at {
                self.info.hook_entry[h] += shift;
            }
            if self.info.underflow[h] as usize >= at {
                self.info.underflow[h] += shift;
            }
        }

        self.entries.splice(at..at, entry.iter().copied());
        self.origin.insert(index, None);
        self.info.num_entries += 1;
        self.info.size += shift;
        Ok(())
    }

    /// `struct ipt_replace` followed by the entries.
    fn replace_payload(&self, counters: &mut [u8]) -> Vec<u8> {
        let mut b = vec![0u8; REPLACE_HEADER];
        b[..TABLE_NAME_LEN].copy_from_slice(&table_name(&self.name));
        write_u32(&mut b, 32, self.info.valid_hooks);
        write_u32(&mut b, 36, self.info.num_entries);
        write_u32(&mut b, 40, self.info.size);
        for h in 0..NUM_HOOKS {
            write_u32(&mut b, 44 + 4 * h, self.info.hook_entry[h]);
            write_u32(&mut b, 64 + 4 * h, self.info.underflow[h]);
        }
        write_u32(&mut b, 84, self.old_entries as u32);
        let ptr = counters.as_mut_ptr() as u64;
        b[88..96].copy_from_slice(&ptr.to_ne_bytes());
        b.extend_from_slice(&self.entries);
        b
    }

    /// `struct xt_counters_info` restoring the old counters at their new indices.
    fn counters_payload(&self, old: &[u8]) -> Vec<u8> {
        let mut b = vec![0u8; COUNTERS_INFO_HEADER + self.origin.len() * COUNTER_SIZE];
        b[..TABLE_NAME_LEN].copy_from_slice(&table_name(&self.name));
        write_u32(&mut b, 32, self.origin.len() as u32);
        for (new, origin) in self.origin.iter().enumerate() {
            if let Some(old_index) = origin {
                let src = &old[old_index * COUNTER_SIZE..(old_index + 1) * COUNTER_SIZE];
                let dst = COUNTERS_INFO_HEADER + new * COUNTER_SIZE;
                b[dst..dst + COUNTER_SIZE].copy_from_slice(src);
            }
        }
        b
    }
}

/// An open `ip_tables` handle on one table.
///
/// Nothing reaches the kernel until [`Table::commit`]; dropping the handle
/// discards every pending append.
#[derive(Debug)]
pub struct Table {
    sock: OwnedFd,
    blob: TableBlob,
}

impl Table {
    pub fn open(name: &str) -> Result<Self, FirewallFault> {
        let init = |source| FirewallFault::Init {
            table: name.to_string(),
            source,
        };

        // SAFETY: plain socket(2); the descriptor is owned immediately.
        let raw = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, libc::IPPROTO_RAW) };
        if raw < 0 {
            return Err(init(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a fresh, valid descriptor owned by nobody else.
        let sock = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut info_buf = [0u8; GETINFO_SIZE];
        info_buf[..TABLE_NAME_LEN].copy_from_slice(&table_name(name));
        getsockopt(&sock, IPT_SO_GET_INFO, &mut info_buf).map_err(init)?;

        let mut info = TableInfo {
            valid_hooks: read_u32(&info_buf, 32),
            num_entries: read_u32(&info_buf, 76),
            size: read_u32(&info_buf, 80),
            ..Default::default()
        };
        for h in 0..NUM_HOOKS {
            info.hook_entry[h] = read_u32(&info_buf, 36 + 4 * h);
            info.underflow[h] = read_u32(&info_buf, 56 + 4 * h);
        }

        let mut entries_buf = vec![0u8; GET_ENTRIES_HEADER + info.size as usize];
        entries_buf[..TABLE_NAME_LEN].copy_from_slice(&table_name(name));
        write_u32(&mut entries_buf, 32, info.size);
        getsockopt(&sock, IPT_SO_GET_ENTRIES, &mut entries_buf).map_err(init)?;
        let entries = entries_buf.split_off(GET_ENTRIES_HEADER);

        debug!(table = name, entries = info.num_entries, size = info.size, "firewall table loaded");
        Ok(Self {
            sock,
            blob: TableBlob::new(name, info, entries),
        })
    }

    pub fn append(&mut self, rule: &FirewallRule) -> Result<(), FirewallFault> {
        let entry = rule.encode()?;
        self.blob.append(rule.chain, &entry)
    }

    /// Replace the kernel table with the pending one in a single call.
    pub fn commit(self) -> Result<(), FirewallFault> {
        let mut old_counters = vec![0u8; self.blob.old_entries * COUNTER_SIZE];
        let payload = self.blob.replace_payload(&mut old_counters);
        setsockopt(&self.sock, IPT_SO_SET_REPLACE, &payload).map_err(|source| {
            FirewallFault::Commit {
                table: self.blob.name.clone(),
                source,
            }
        })?;

        let counters = self.blob.counters_payload(&old_counters);
        if let Err(e) = setsockopt(&self.sock, IPT_SO_SET_ADD_COUNTERS, &counters) {
            warn!(table = %self.blob.name, error = %e, "failed to restore rule counters");
        }
        Ok(())
    }
}

fn getsockopt(sock: &OwnedFd, opt: libc::c_int, buf: &mut [u8]) -> io::Result<()> {
    let mut len = buf.len() as libc::socklen_t;
    // SAFETY: `buf` is valid for `len` bytes for the duration of the call.
    let rc = unsafe {
        libc::getsockopt(
            sock.as_raw_fd(),
            libc::SOL_IP,
            opt,
            buf.as_mut_ptr() as *mut c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn setsockopt(sock: &OwnedFd, opt: libc::c_int, buf: &[u8]) -> io::Result<()> {
    // SAFETY: `buf` is valid for its whole length for the duration of the call.
    let rc = unsafe {
        libc::setsockopt(
            sock.as_raw_fd(),
            libc::SOL_IP,
            opt,
            buf.as_ptr() as *const c_void,
            buf.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Append one rule to its table and commit the table.
pub fn apply_rule(rule: &FirewallRule) -> Result<(), FirewallFault> {
    let mut table = Table::open(rule.table)?;
    table.append(rule)?;
    table.commit()?;
    debug!(rule = %rule, "firewall rule installed");
    Ok(())
}
