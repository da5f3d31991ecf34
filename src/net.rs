//! Interface discovery and multicast socket setup for the PTP engine
//! (spec §4.4).

use anyhow::{anyhow, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

#[cfg(unix)]
use nix::sys::socket::{setsockopt, sockopt};

pub const PTP_MULTICAST_GROUP: &str = "224.0.1.129";
pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;

/// Picks the first suitable non-loopback IPv4 interface, preferring wired
/// over wireless-looking names, the same preference order the teacher's
/// `pnet_datalink`-based scan used, rebuilt on `if-addrs`.
pub fn get_default_interface() -> Result<(String, Ipv4Addr)> {
    let addrs = if_addrs::get_if_addrs()?;
    let mut fallback: Option<(String, Ipv4Addr)> = None;

    for iface in &addrs {
        if iface.is_loopback() {
            continue;
        }
        let ipv4 = match iface.ip() {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(_) => continue,
        };

        let name_lower = iface.name.to_lowercase();
        let is_wireless = name_lower.contains("wlan") || name_lower.contains("wifi") || name_lower.contains("wireless");

        if !is_wireless {
            return Ok((iface.name.clone(), ipv4));
        }
        if fallback.is_none() {
            fallback = Some((iface.name.clone(), ipv4));
        }
    }

    fallback.ok_or_else(|| anyhow!("no suitable network interface found"))
}

/// Resolves a named interface to its IPv4 address.
pub fn resolve_interface(name: &str) -> Result<Ipv4Addr> {
    let addrs = if_addrs::get_if_addrs()?;
    addrs
        .iter()
        .find(|i| i.name == name && !i.is_loopback())
        .and_then(|i| match i.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("interface '{name}' not found or has no IPv4 address"))
}

/// Creates a UDP socket bound to `port`, joined to the PTP multicast group
/// on `interface_ip`, with multicast loopback disabled, a bounded read
/// timeout (spec §5 "no task can block indefinitely"), and (on Unix) kernel
/// RX timestamping requested.
pub fn create_multicast_socket(port: u16, interface_ip: Ipv4Addr, read_timeout: std::time::Duration) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;

    let group: Ipv4Addr = PTP_MULTICAST_GROUP.parse()?;
    socket.join_multicast_v4(&group, &interface_ip)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_read_timeout(Some(read_timeout))?;

    let udp_socket: UdpSocket = socket.into();

    #[cfg(unix)]
    {
        match setsockopt(&udp_socket, sockopt::ReceiveTimestampns, &true) {
            Ok(_) => log::info!("kernel timestamping (SO_TIMESTAMPNS) enabled on port {port}"),
            Err(e) => log::warn!("failed to enable kernel timestamping on port {port}: {e}"),
        }
    }

    Ok(udp_socket)
}
