// Copyright (c) 2026 The TSCTP Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;

use log::trace;

use super::SocketState;
use crate::packet::PacketInfo;
use crate::Result;
use crate::DEFAULT_PATH_MTU;
use crate::MIN_PATH_MTU;

/// Address family of a peer transport address. It determines the network
/// header room reserved ahead of the SCTP common header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    /// IPv4.
    Ipv4,

    /// IPv6.
    Ipv6,
}

impl AddressFamily {
    /// Return the network header length of the family.
    pub fn net_header_len(self) -> usize {
        match self {
            AddressFamily::Ipv4 => 20,
            AddressFamily::Ipv6 => 40,
        }
    }
}

/// Capabilities of the device behind a cached route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouteCaps {
    /// The device can compute the SCTP CRC32-C itself.
    pub sctp_crc_offload: bool,

    /// A transform (e.g. IPsec) will rewrite the payload after us, which
    /// invalidates checksum offload.
    pub xfrm: bool,

    /// The device supports generic segmentation offload.
    pub gso: bool,

    /// Largest super-packet the device accepts when `gso` is set.
    pub gso_max_size: usize,
}

/// A cached route to the peer transport address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    /// Path MTU reported by the route.
    pub pmtu: usize,

    /// Whether the cached entry has been invalidated and must be looked
    /// up again before use.
    pub expired: bool,

    /// Device capabilities of the route.
    pub caps: RouteCaps,
}

/// Handler for outgoing datagrams and the routing queries that precede
/// them. The network layer below the association implements it.
pub trait PacketSendHandler {
    /// Resolve a route to the given peer address.
    fn route(&mut self, remote: SocketAddr) -> Option<Route>;

    /// Mark the sending socket ECN capable, so outgoing datagrams carry
    /// the ECT bit.
    /// See RFC 3168 Section 5
    fn ecn_capable(&mut self, sock: &mut SocketState);

    /// Hand one assembled datagram to the network layer.
    ///
    /// For a GSO super-packet `info.segment_sizes` holds the boundaries of
    /// the self-contained sub-packets inside `buf`.
    fn on_packet_send(&mut self, buf: &[u8], info: &PacketInfo) -> Result<()>;
}

/// A peer transport address and the sender-side state kept per path:
/// congestion window, bytes in flight and the cached route.
#[derive(Debug)]
pub struct Transport {
    /// The peer transport address.
    pub remote_addr: SocketAddr,

    /// Address family of the path.
    pub af: AddressFamily,

    /// Current path MTU.
    pub pathmtu: usize,

    /// Congestion window of the path, in bytes.
    pub cwnd: usize,

    /// When non-zero, the congestion window before burst limiting was
    /// applied; `cwnd` is temporarily clamped.
    pub burst_limited: usize,

    /// Bytes sent over this path and not yet acknowledged.
    pub flight_size: usize,

    /// Whether an RTT measurement is in progress on the path.
    pub rto_pending: bool,

    /// Incremented by SACK processing; compared against the peer's
    /// generation to detect a SACK that is already out of date.
    pub sack_generation: u32,

    /// Cached route to the peer.
    dst: Option<Route>,
}

impl Transport {
    /// Create a transport for the given peer address.
    pub fn new(remote_addr: SocketAddr, af: AddressFamily) -> Self {
        Transport {
            remote_addr,
            af,
            pathmtu: DEFAULT_PATH_MTU,
            // The initial cwnd of min(4*MTU, max(2*MTU, 4380)) bytes.
            // See RFC 4960 Section 7.2.1
            cwnd: std::cmp::min(4 * DEFAULT_PATH_MTU, std::cmp::max(2 * DEFAULT_PATH_MTU, 4380)),
            burst_limited: 0,
            flight_size: 0,
            rto_pending: false,
            sack_generation: 0,
            dst: None,
        }
    }

    /// Return the cached route.
    pub fn dst(&self) -> Option<&Route> {
        self.dst.as_ref()
    }

    /// Install a route, adopting its path MTU.
    pub fn set_dst(&mut self, route: Route) {
        self.pathmtu = std::cmp::max(MIN_PATH_MTU, route.pmtu);
        self.dst = Some(route);
    }

    /// Return whether the cached route is still usable.
    pub fn dst_check(&self) -> bool {
        self.dst.map_or(false, |d| !d.expired)
    }

    /// Look the route up again through the handler.
    pub fn route(&mut self, handler: &mut dyn PacketSendHandler) {
        match handler.route(self.remote_addr) {
            Some(route) => self.set_dst(route),
            None => self.dst = None,
        }
        trace!(
            "transport {:?} route refresh pathmtu={} found={}",
            self.remote_addr,
            self.pathmtu,
            self.dst.is_some()
        );
    }

    /// Clamp the congestion window for one burst, remembering the old
    /// value. A zero `max_burst` disables limiting.
    pub fn burst_limit(&mut self, max_burst: usize) {
        if self.burst_limited != 0 || max_burst == 0 {
            return;
        }

        let max_burst_bytes = max_burst * self.pathmtu;
        if max_burst_bytes < self.cwnd {
            self.burst_limited = self.cwnd;
            self.cwnd = max_burst_bytes;
        }
    }

    /// Restore the congestion window after a burst-limited send.
    pub fn burst_reset(&mut self) {
        if self.burst_limited != 0 {
            self.cwnd = self.burst_limited;
            self.burst_limited = 0;
        }
    }
}
