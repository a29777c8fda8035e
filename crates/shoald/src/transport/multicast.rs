//! IPv4 multicast datagram transport.
//!
//! One socket joins the cluster group and feeds inbound datagrams through
//! the duplicate filter into the dispatcher. A second, unbound socket sends
//! broadcasts and point-to-point datagrams.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use shoal_core::config::NetworkConfig;
use shoal_core::wire::{decode_datagram, MAX_DATAGRAM};

use super::dedup::PacketFilter;
use crate::dispatch::EventDispatcher;

/// Multicast group destination from config.
pub fn group_addr(network: &NetworkConfig) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(network.multicast_addr, network.multicast_port))
}

/// Create the sending socket. Loopback stays on so nodes sharing a host
/// hear each other.
pub fn sender_socket(network: &NetworkConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket
        .set_multicast_ttl_v4(network.multicast_ttl)
        .context("IP_MULTICAST_TTL")?;
    socket
        .set_multicast_if_v4(&network.interface_addr)
        .context("IP_MULTICAST_IF")?;
    socket.set_multicast_loop_v4(true).context("IP_MULTICAST_LOOP")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&bind.into()).context("bind()")?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

/// Create a socket bound to the group port and joined to the group.
pub fn listener_socket(network: &NetworkConfig) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;
    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, network.multicast_port);
    socket
        .bind(&bind.into())
        .with_context(|| format!("failed to bind multicast port {}", network.multicast_port))?;
    socket
        .join_multicast_v4(&network.multicast_addr, &network.interface_addr)
        .context("IP_ADD_MEMBERSHIP")?;

    UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
}

/// Receive datagrams until shutdown. Receive errors are logged and the
/// socket keeps running.
pub async fn listen_loop(
    socket: UdpSocket,
    mut filter: PacketFilter,
    dispatcher: Arc<EventDispatcher>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    tracing::info!(addr = ?socket.local_addr().ok(), "multicast listener starting");

    loop {
        let (len, from) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
            },
            _ = shutdown.recv() => {
                tracing::info!("multicast listener stopped");
                return;
            }
        };

        let packet = &buf[..len];
        if !filter.admit(from, packet) {
            tracing::trace!(%from, len, "duplicate datagram dropped");
            continue;
        }

        match decode_datagram(packet) {
            Ok(event) => {
                dispatcher.dispatch(from, &event);
            }
            Err(e) => tracing::debug!(%from, error = %e, "undecodable datagram"),
        }
    }
}
