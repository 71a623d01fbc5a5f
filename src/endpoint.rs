// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 udprelay contributors
//
// Replaces the original's global mutable state (`mode`, `chan_tab`,
// `fwd_addr`, `channel_semaphore`) with a single value threaded through
// every worker. Both relay ends run the identical worker set; only the
// mode and the forwarding address differ.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use socket2::{Domain, Socket, Type};

use crate::channel_table::ChannelTable;
use crate::consts::UDP_SOCKET_BUF;
use crate::error::RelayPanic;

/// Which side of the relay this process is acting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Accepts TCP connections locally and relays them over UDP.
    Target,
    /// Receives relayed UDP traffic and opens a TCP connection per
    /// channel to a fixed forwarding address.
    Forward,
}

/// Shared context every worker thread needs: the multiplexed UDP socket,
/// the channel table, and mode-specific addressing.
pub struct Endpoint {
    pub mode: RelayMode,
    pub udp: UdpSocket,
    pub table: Arc<ChannelTable>,
    /// Forward mode only: the TCP address each activated channel connects
    /// to on receiving a fresh epoch.
    pub fwd_addr: Option<SocketAddr>,
}

impl Endpoint {
    /// Bind a UDP socket to `base_port`, connect it to `peer_addr` (UDP
    /// "connection" -- just a default destination, no handshake), and
    /// enlarge its send/receive buffers the way the original single
    /// multiplexed socket does.
    pub fn bind(base_port: u16, peer_addr: SocketAddr, mode: RelayMode, fwd_addr: Option<SocketAddr>) -> Result<Self, RelayPanic> {
        let domain = if peer_addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let sock = Socket::new(domain, Type::DGRAM, None)?;
        sock.set_send_buffer_size(UDP_SOCKET_BUF)?;
        sock.set_recv_buffer_size(UDP_SOCKET_BUF)?;
        let bind_addr: SocketAddr = if peer_addr.is_ipv6() {
            format!("[::]:{base_port}").parse().unwrap()
        } else {
            format!("0.0.0.0:{base_port}").parse().unwrap()
        };
        sock.bind(&bind_addr.into())?;
        sock.connect(&peer_addr.into())?;
        let udp: UdpSocket = sock.into();

        Ok(Self {
            mode,
            udp,
            table: Arc::new(ChannelTable::new()),
            fwd_addr,
        })
    }
}
