//! Socket helpers for port fallback binding and broadcast addresses.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info};

use crate::error::NetworkError;

/// Ports tried in order: `preferred .. preferred + attempts`, then ephemeral.
///
/// A preferred port of `0` means ephemeral only.
pub fn candidate_ports(preferred: u16, attempts: u16) -> Vec<u16> {
    if preferred == 0 {
        return vec![0];
    }
    let mut ports: Vec<u16> = (0..attempts.max(1))
        .filter_map(|offset| preferred.checked_add(offset))
        .collect();
    ports.push(0);
    ports
}

/// Bind a UDP socket with broadcast enabled, scanning for a free port.
pub async fn bind_udp(
    ip: IpAddr,
    preferred: u16,
    attempts: u16,
) -> Result<UdpSocket, NetworkError> {
    for port in candidate_ports(preferred, attempts) {
        match UdpSocket::bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => {
                socket.set_broadcast(true)?;
                info!("UDP socket bound on {}", socket.local_addr()?);
                return Ok(socket);
            }
            Err(e) => debug!("UDP bind on {ip}:{port} failed: {e}"),
        }
    }
    Err(exhausted("UDP", preferred, attempts))
}

/// Bind a TCP listener, scanning for a free port.
pub async fn bind_tcp(
    ip: IpAddr,
    preferred: u16,
    attempts: u16,
) -> Result<TcpListener, NetworkError> {
    for port in candidate_ports(preferred, attempts) {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => {
                info!("TCP listener bound on {}", listener.local_addr()?);
                return Ok(listener);
            }
            Err(e) => debug!("TCP bind on {ip}:{port} failed: {e}"),
        }
    }
    Err(exhausted("TCP", preferred, attempts))
}

fn exhausted(protocol: &'static str, preferred: u16, attempts: u16) -> NetworkError {
    NetworkError::PortExhausted {
        protocol,
        first: preferred,
        last: preferred.saturating_add(attempts.saturating_sub(1)),
    }
}

/// Directed broadcast address of the subnet `ip` lives in.
pub fn subnet_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// The limited broadcast address plus one directed broadcast per active
/// non-loopback IPv4 interface, without duplicates.
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addrs = vec![Ipv4Addr::BROADCAST];

    match if_addrs::get_if_addrs() {
        Ok(ifaces) => {
            for iface in ifaces.iter().filter(|i| !i.is_loopback()) {
                if let if_addrs::IfAddr::V4(v4) = &iface.addr {
                    if v4.ip.is_loopback() {
                        continue;
                    }
                    let bcast = subnet_broadcast(v4.ip, v4.netmask);
                    if !addrs.contains(&bcast) {
                        addrs.push(bcast);
                    }
                }
            }
        }
        Err(e) => debug!("Interface enumeration failed, using global broadcast only: {e}"),
    }

    addrs
}

/// Every `(address, port)` an announcement is sent to.
pub fn announcement_targets(
    broadcast: &[Ipv4Addr],
    static_targets: &[IpAddr],
    base_port: u16,
    window: u16,
) -> Vec<SocketAddr> {
    let ips = broadcast
        .iter()
        .copied()
        .map(IpAddr::V4)
        .chain(static_targets.iter().copied());

    let mut targets = Vec::new();
    for ip in ips {
        for offset in 0..window.max(1) {
            if let Some(port) = base_port.checked_add(offset) {
                let target = SocketAddr::new(ip, port);
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
        }
    }
    targets
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
