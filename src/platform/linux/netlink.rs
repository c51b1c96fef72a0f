//! Synchronous `NETLINK_ROUTE` request/acknowledge transport.
//!
//! Messages are assembled by [`MessageBuilder`], which appends 4-byte aligned
//! segments and patches nested attribute lengths when a nest is closed. Every
//! request carries `NLM_F_ACK` and the socket blocks until the matching
//! acknowledgement (or error) has been read before the next request goes out.

use std::io::IoSliceMut;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::socket::{
    bind, recvmsg, send, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol,
    SockType,
};
use tracing::trace;

use crate::core::config::NETLINK_RECV_BUF;
use crate::core::error::ProtocolFault;

pub const NLMSG_HDRLEN: usize = 16;
const NLMSG_ERROR: u16 = 2;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_NEWROUTE: u16 = 24;

pub const NLM_F_REQUEST: u16 = 0x001;
pub const NLM_F_ACK: u16 = 0x004;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

const IFLA_IFNAME: u16 = 3;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_FD: u16 = 28;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const VETH_INFO_PEER: u16 = 1;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_BROADCAST: u16 = 4;

const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// `struct ifinfomsg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfInfoMsg {
    pub family: u8,
    pub kind: u16,
    pub index: i32,
    pub flags: u32,
    pub change: u32,
}

impl IfInfoMsg {
    pub fn to_bytes(self) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0] = self.family;
        b[2..4].copy_from_slice(&self.kind.to_ne_bytes());
        b[4..8].copy_from_slice(&self.index.to_ne_bytes());
        b[8..12].copy_from_slice(&self.flags.to_ne_bytes());
        b[12..16].copy_from_slice(&self.change.to_ne_bytes());
        b
    }
}

/// `struct ifaddrmsg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfAddrMsg {
    pub family: u8,
    pub prefix_len: u8,
    pub flags: u8,
    pub scope: u8,
    pub index: u32,
}

impl IfAddrMsg {
    pub fn to_bytes(self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.family;
        b[1] = self.prefix_len;
        b[2] = self.flags;
        b[3] = self.scope;
        b[4..8].copy_from_slice(&self.index.to_ne_bytes());
        b
    }
}

/// `struct rtmsg`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RtMsg {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub kind: u8,
    pub flags: u32,
}

impl RtMsg {
    pub fn to_bytes(self) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[..8].copy_from_slice(&[
            self.family,
            self.dst_len,
            self.src_len,
            self.tos,
            self.table,
            self.protocol,
            self.scope,
            self.kind,
        ]);
        b[8..12].copy_from_slice(&self.flags.to_ne_bytes());
        b
    }
}

/// Start offset of an open nested attribute.
#[must_use = "a nest must be closed with MessageBuilder::end_nest"]
#[derive(Debug)]
pub struct Nest(usize);

/// Length-prefixed attribute tree over a single netlink message.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[4..6].copy_from_slice(&msg_type.to_ne_bytes());
        buf[6..8].copy_from_slice(&flags.to_ne_bytes());
        Self { buf }
    }

    /// Append a fixed family header (or any raw payload), padded to 4 bytes.
    pub fn push(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self.buf.resize(align(self.buf.len()), 0);
        self
    }

    pub fn attr(&mut self, kind: u16, data: &[u8]) -> &mut Self {
        debug_assert!(4 + data.len() <= usize::from(u16::MAX));
        let len = (4 + data.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.push(data)
    }

    /// NUL-terminated string attribute.
    pub fn attr_str(&mut self, kind: u16, value: &str) -> &mut Self {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.attr(kind, &data)
    }

    pub fn attr_u32(&mut self, kind: u16, value: u32) -> &mut Self {
        self.attr(kind, &value.to_ne_bytes())
    }

    pub fn attr_ipv4(&mut self, kind: u16, addr: Ipv4Addr) -> &mut Self {
        self.attr(kind, &addr.octets())
    }

    pub fn begin_nest(&mut self, kind: u16) -> Nest {
        let start = self.buf.len();
        self.attr(kind, &[]);
        Nest(start)
    }

    pub fn end_nest(&mut self, nest: Nest) -> &mut Self {
        let len = (self.buf.len() - nest.0) as u16;
        self.buf[nest.0..nest.0 + 2].copy_from_slice(&len.to_ne_bytes());
        self
    }

    /// Patch the total length and sequence number and return the wire bytes.
    pub fn finish(mut self, seq: u32) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decode the response to a request that asked for an acknowledgement.
pub fn decode_ack(buf: &[u8], expected_seq: u32) -> Result<(), ProtocolFault> {
    if buf.len() < NLMSG_HDRLEN {
        return Err(ProtocolFault::Malformed {
            declared: 0,
            received: buf.len(),
        });
    }

    let declared = read_u32(buf, 0) as usize;
    if declared < NLMSG_HDRLEN || declared > buf.len() {
        return Err(ProtocolFault::Malformed {
            declared,
            received: buf.len(),
        });
    }

    let msg_type = read_u16(buf, 4);
    if msg_type != NLMSG_ERROR {
        return Err(ProtocolFault::UnexpectedType { msg_type });
    }

    let seq = read_u32(buf, 8);
    if seq != expected_seq {
        return Err(ProtocolFault::SequenceMismatch {
            expected: expected_seq,
            got: seq,
        });
    }

    if declared < NLMSG_HDRLEN + 4 {
        return Err(ProtocolFault::Malformed {
            declared,
            received: buf.len(),
        });
    }

    match read_u32(buf, NLMSG_HDRLEN) as i32 {
        0 => Ok(()),
        code => Err(ProtocolFault::Kernel {
            errno: Errno::from_raw(-code),
        }),
    }
}

/// `ip link add <name> type veth peer name <peer>`
pub fn veth_request(name: &str, peer: &str) -> MessageBuilder {
    let mut msg = MessageBuilder::new(
        RTM_NEWLINK,
        NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK,
    );
    msg.push(&IfInfoMsg::default().to_bytes())
        .attr_str(IFLA_IFNAME, name);

    let link_info = msg.begin_nest(IFLA_LINKINFO);
    msg.attr_str(IFLA_INFO_KIND, "veth");
    let info_data = msg.begin_nest(IFLA_INFO_DATA);
    let peer_info = msg.begin_nest(VETH_INFO_PEER);
    msg.push(&IfInfoMsg::default().to_bytes())
        .attr_str(IFLA_IFNAME, peer);
    msg.end_nest(peer_info)
        .end_nest(info_data)
        .end_nest(link_info);
    msg
}

/// `ip addr add <addr>/<prefix> brd <broadcast> dev <index>`
pub fn address_request(index: u32, addr: Ipv4Addr, prefix_len: u8) -> MessageBuilder {
    let host_mask = u32::MAX.checked_shr(u32::from(prefix_len)).unwrap_or(0);
    let broadcast = Ipv4Addr::from(u32::from(addr) | host_mask);

    let mut msg = MessageBuilder::new(
        RTM_NEWADDR,
        NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK,
    );
    msg.push(
        &IfAddrMsg {
            family: libc::AF_INET as u8,
            prefix_len,
            scope: RT_SCOPE_UNIVERSE,
            index,
            ..Default::default()
        }
        .to_bytes(),
    )
    .attr_ipv4(IFA_LOCAL, addr)
    .attr_ipv4(IFA_ADDRESS, addr)
    .attr_ipv4(IFA_BROADCAST, broadcast);
    msg
}

/// `ip link set dev <index> up`
pub fn link_up_request(index: u32) -> MessageBuilder {
    let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
    msg.push(
        &IfInfoMsg {
            index: index as i32,
            flags: libc::IFF_UP as u32,
            change: libc::IFF_UP as u32,
            ..Default::default()
        }
        .to_bytes(),
    );
    msg
}

/// `ip link set dev <index> netns <fd>`
pub fn move_to_netns_request(index: u32, netns_fd: RawFd) -> MessageBuilder {
    let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
    msg.push(
        &IfInfoMsg {
            index: index as i32,
            ..Default::default()
        }
        .to_bytes(),
    )
    .attr_u32(IFLA_NET_NS_FD, netns_fd as u32);
    msg
}

/// `ip route add default via <gateway> dev <index>`
pub fn default_route_request(gateway: Ipv4Addr, index: u32) -> MessageBuilder {
    let mut msg = MessageBuilder::new(
        RTM_NEWROUTE,
        NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK,
    );
    msg.push(
        &RtMsg {
            family: libc::AF_INET as u8,
            table: RT_TABLE_MAIN,
            protocol: RTPROT_BOOT,
            scope: RT_SCOPE_UNIVERSE,
            kind: RTN_UNICAST,
            ..Default::default()
        }
        .to_bytes(),
    )
    .attr_ipv4(RTA_GATEWAY, gateway)
    .attr_u32(RTA_OIF, index);
    msg
}

/// A raw routing socket bound to the network namespace it was opened in.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkSocket {
    pub fn open() -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkRoute,
        )
        .context("cannot open NETLINK_ROUTE socket")?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0)).context("cannot bind netlink socket")?;
        Ok(Self { fd, seq: 0 })
    }

    /// Wrap an already connected datagram socket.
    #[cfg(test)]
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self { fd, seq: 0 }
    }

    /// Send one request and consume its acknowledgement.
    pub fn request(&mut self, msg: MessageBuilder) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let bytes = msg.finish(seq);

        let sent = send(self.fd.as_raw_fd(), &bytes, MsgFlags::empty())
            .context("cannot talk to rtnetlink")?;
        if sent != bytes.len() {
            bail!("short netlink send: {sent} of {} bytes", bytes.len());
        }
        trace!(seq, len = bytes.len(), "netlink request sent");

        let mut buf = vec![0u8; NETLINK_RECV_BUF];
        let (len, truncated) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<NetlinkAddr>(
                self.fd.as_raw_fd(),
                &mut iov,
                None,
                MsgFlags::empty(),
            )
            .context("netlink receive error")?;
            (msg.bytes, msg.flags.contains(MsgFlags::MSG_TRUNC))
        };

        if len == 0 {
            return Err(ProtocolFault::EndOfStream.into());
        }
        if truncated {
            return Err(ProtocolFault::Truncated { len }.into());
        }
        decode_ack(&buf[..len], seq)?;
        trace!(seq, "netlink request acknowledged");
        Ok(())
    }

    pub fn create_veth(&mut self, name: &str, peer: &str) -> Result<()> {
        self.request(veth_request(name, peer))
            .with_context(|| format!("failed to create veth pair {name}/{peer}"))
    }

    pub fn add_address(&mut self, index: u32, addr: Ipv4Addr, prefix_len: u8) -> Result<()> {
        self.request(address_request(index, addr, prefix_len))
            .with_context(|| format!("failed to assign {addr}/{prefix_len} to link {index}"))
    }

    pub fn set_link_up(&mut self, index: u32) -> Result<()> {
        self.request(link_up_request(index))
            .with_context(|| format!("failed to bring link {index} up"))
    }

    pub fn move_to_netns(&mut self, index: u32, netns_fd: RawFd) -> Result<()> {
        self.request(move_to_netns_request(index, netns_fd))
            .with_context(|| format!("failed to move link {index} to another network namespace"))
    }

    pub fn add_default_route(&mut self, gateway: Ipv4Addr, index: u32) -> Result<()> {
        self.request(default_route_request(gateway, index))
            .with_context(|| format!("failed to add default route via {gateway}"))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{ack, reply, requests_seen, socket_pair};
    use super::*;

    #[test]
    fn attributes_are_padded_and_counted() {
        let mut msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST);
        msg.attr_str(IFLA_IFNAME, "lo");
        let bytes = msg.finish(7);
        // header + rtattr(4) + "lo\0" padded to 4
        assert_eq!(bytes.len(), 24);
        assert_eq!(read_u32(&bytes, 0), 24);
        assert_eq!(read_u32(&bytes, 8), 7);
        assert_eq!(read_u16(&bytes, 16), 7);
        assert_eq!(read_u16(&bytes, 18), IFLA_IFNAME);
        assert_eq!(&bytes[20..24], b"lo\0\0");
    }

    #[test]
    fn veth_request_nests_peer_info() {
        let bytes = veth_request("veth0", "veth1").finish(1);
        assert_eq!(bytes.len(), 96);
        assert_eq!(read_u16(&bytes, 4), RTM_NEWLINK);
        assert_eq!(
            read_u16(&bytes, 6),
            NLM_F_REQUEST | NLM_F_CREATE | NLM_F_EXCL | NLM_F_ACK
        );

        // IFLA_IFNAME "veth0"
        assert_eq!(read_u16(&bytes, 32), 10);
        assert_eq!(&bytes[36..42], b"veth0\0");
        // IFLA_LINKINFO spans to the end of the message
        assert_eq!(read_u16(&bytes, 44), 52);
        assert_eq!(read_u16(&bytes, 46), IFLA_LINKINFO);
        // IFLA_INFO_KIND "veth"
        assert_eq!(read_u16(&bytes, 48), 9);
        assert_eq!(&bytes[52..57], b"veth\0");
        // IFLA_INFO_DATA
        assert_eq!(read_u16(&bytes, 60), 36);
        assert_eq!(read_u16(&bytes, 62), IFLA_INFO_DATA);
        // VETH_INFO_PEER: ifinfomsg + IFLA_IFNAME
        assert_eq!(read_u16(&bytes, 64), 32);
        assert_eq!(read_u16(&bytes, 66), VETH_INFO_PEER);
        assert_eq!(read_u16(&bytes, 84), 10);
        assert_eq!(&bytes[88..94], b"veth1\0");
    }

    #[test]
    fn address_request_carries_broadcast() {
        let bytes = address_request(5, Ipv4Addr::new(172, 16, 1, 1), 24).finish(2);
        assert_eq!(read_u16(&bytes, 4), RTM_NEWADDR);
        assert_eq!(bytes[16], libc::AF_INET as u8);
        assert_eq!(bytes[17], 24);
        assert_eq!(read_u32(&bytes, 20), 5);
        // three 8-byte address attributes after the 8-byte ifaddrmsg
        assert_eq!(bytes.len(), 16 + 8 + 3 * 8);
        assert_eq!(read_u16(&bytes, 42), IFA_BROADCAST);
        assert_eq!(&bytes[44..48], &[172, 16, 1, 255]);
    }

    #[test]
    fn route_request_points_at_gateway() {
        let bytes = default_route_request(Ipv4Addr::new(172, 16, 1, 1), 3).finish(3);
        assert_eq!(read_u16(&bytes, 4), RTM_NEWROUTE);
        assert_eq!(bytes[16 + 4], RT_TABLE_MAIN);
        assert_eq!(bytes[16 + 7], RTN_UNICAST);
        assert_eq!(read_u16(&bytes, 30), RTA_GATEWAY);
        assert_eq!(&bytes[32..36], &[172, 16, 1, 1]);
        assert_eq!(read_u16(&bytes, 38), RTA_OIF);
        assert_eq!(read_u32(&bytes, 40), 3);
    }

    #[test]
    fn link_up_sets_flag_and_change_mask() {
        let bytes = link_up_request(9).finish(4);
        assert_eq!(bytes.len(), 32);
        assert_eq!(read_u32(&bytes, 20), 9);
        assert_eq!(read_u32(&bytes, 24), libc::IFF_UP as u32);
        assert_eq!(read_u32(&bytes, 28), libc::IFF_UP as u32);
    }

    #[test]
    fn zero_error_is_ack() {
        assert_eq!(decode_ack(&ack(4, 0), 4), Ok(()));
    }

    #[test]
    fn negative_error_maps_to_errno() {
        assert_eq!(
            decode_ack(&ack(4, -libc::EEXIST), 4),
            Err(ProtocolFault::Kernel {
                errno: Errno::EEXIST
            })
        );
    }

    #[test]
    fn stale_sequence_is_rejected() {
        assert_eq!(
            decode_ack(&ack(3, 0), 4),
            Err(ProtocolFault::SequenceMismatch {
                expected: 4,
                got: 3
            })
        );
    }

    #[test]
    fn other_message_types_are_unexpected() {
        let mut bytes = ack(1, 0);
        bytes[4..6].copy_from_slice(&RTM_NEWLINK.to_ne_bytes());
        assert_eq!(
            decode_ack(&bytes, 1),
            Err(ProtocolFault::UnexpectedType {
                msg_type: RTM_NEWLINK
            })
        );
    }

    #[test]
    fn short_or_overlong_messages_are_malformed() {
        assert!(matches!(
            decode_ack(&[0u8; 8], 1),
            Err(ProtocolFault::Malformed { .. })
        ));
        let mut bytes = ack(1, 0);
        bytes[0..4].copy_from_slice(&200u32.to_ne_bytes());
        assert!(matches!(
            decode_ack(&bytes, 1),
            Err(ProtocolFault::Malformed { declared: 200, .. })
        ));
    }

    fn fault(err: &anyhow::Error) -> Option<&ProtocolFault> {
        err.downcast_ref::<ProtocolFault>()
    }

    #[test]
    fn request_consumes_its_ack() {
        let (mut nl, peer) = socket_pair();
        reply(&peer, &ack(1, 0));
        nl.request(link_up_request(2)).unwrap();
        reply(&peer, &ack(2, 0));
        nl.request(link_up_request(2)).unwrap();
        assert_eq!(requests_seen(&peer), 2);
    }

    #[test]
    fn empty_read_is_end_of_stream() {
        let (mut nl, peer) = socket_pair();
        reply(&peer, &[]);
        let err = nl.request(link_up_request(2)).unwrap_err();
        assert_eq!(fault(&err), Some(&ProtocolFault::EndOfStream));
    }

    #[test]
    fn oversized_reply_is_truncated() {
        let (mut nl, peer) = socket_pair();
        reply(&peer, &vec![0u8; NETLINK_RECV_BUF * 2]);
        let err = nl.request(link_up_request(2)).unwrap_err();
        assert!(
            matches!(fault(&err), Some(ProtocolFault::Truncated { .. })),
            "got {err:#}"
        );
    }

    #[test]
    fn kernel_error_fails_the_request() {
        let (mut nl, peer) = socket_pair();
        reply(&peer, &ack(1, -libc::EEXIST));
        let err = nl.create_veth("veth0", "veth1").unwrap_err();
        assert_eq!(
            fault(&err),
            Some(&ProtocolFault::Kernel {
                errno: Errno::EEXIST
            })
        );
        assert!(format!("{err:#}").contains("veth0/veth1"));
    }
}
