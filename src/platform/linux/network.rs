use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};

use anyhow::{Context, Result};
use nix::net::if_::if_nametoindex;
use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;
use tracing::{debug, info};

use super::firewall::{self, FirewallRule, Ipv4Cidr};
use super::netlink::NetlinkSocket;
use crate::core::config::{HOST_ADDR, PEER_ADDR, SUBNET_CIDR, SUBNET_PREFIX, VETH_HOST, VETH_PEER};

fn link_index(name: &str) -> Result<u32> {
    if_nametoindex(name).with_context(|| format!("no such network interface: {name}"))
}

/// Connect the child's network namespace to the host through a veth pair
/// and NAT it out of `external_iface`.
pub fn wire(child: Pid, external_iface: &str) -> Result<()> {
    let mut nl = NetlinkSocket::open()?;

    nl.create_veth(VETH_HOST, VETH_PEER)?;
    let host = link_index(VETH_HOST)?;
    nl.add_address(host, HOST_ADDR, SUBNET_PREFIX)?;

    let host_ns = File::open("/proc/self/ns/net").context("failed to open host network namespace")?;
    let child_ns_path = format!("/proc/{child}/ns/net");
    let child_ns = File::open(&child_ns_path)
        .with_context(|| format!("failed to open {child_ns_path}"))?;

    let peer = link_index(VETH_PEER)?;
    nl.move_to_netns(peer, child_ns.as_raw_fd())?;
    nl.set_link_up(host)?;
    debug!(host = VETH_HOST, peer = VETH_PEER, "veth pair created");

    setns(child_ns.as_fd(), CloneFlags::CLONE_NEWNET)
        .with_context(|| format!("failed to enter network namespace of {child}"))?;
    let inside = configure_peer();
    setns(host_ns.as_fd(), CloneFlags::CLONE_NEWNET)
        .context("failed to return to the host network namespace")?;
    inside?;

    for rule in firewall_rules(external_iface)? {
        firewall::apply_rule(&rule).with_context(|| format!("failed to install `{rule}`"))?;
    }

    info!(
        host = %HOST_ADDR,
        container = %PEER_ADDR,
        prefix = SUBNET_PREFIX,
        uplink = external_iface,
        "container network ready"
    );
    Ok(())
}

/// Runs inside the child's network namespace. Sockets stay bound to the
/// namespace they were opened in, so this one is opened here.
fn configure_peer() -> Result<()> {
    let mut nl = NetlinkSocket::open()?;
    configure_links(&mut nl, link_index(VETH_PEER)?, link_index("lo")?)?;
    debug!(peer = VETH_PEER, gateway = %HOST_ADDR, "container side configured");
    Ok(())
}

/// Address the peer, bring it and loopback up, route through the host end.
/// Stops at the first refused request.
fn configure_links(nl: &mut NetlinkSocket, peer: u32, lo: u32) -> Result<()> {
    nl.add_address(peer, PEER_ADDR, SUBNET_PREFIX)?;
    nl.set_link_up(peer)?;
    nl.set_link_up(lo)?;
    nl.add_default_route(HOST_ADDR, peer)
}

/// NAT for the container subnet plus forwarding in both directions.
pub fn firewall_rules(external_iface: &str) -> Result<Vec<FirewallRule>> {
    let subnet: Ipv4Cidr = SUBNET_CIDR.parse()?;
    Ok(vec![
        FirewallRule::masquerade(subnet, external_iface),
        FirewallRule::forward_accept(VETH_HOST, external_iface),
        FirewallRule::forward_accept(external_iface, VETH_HOST),
    ])
}
