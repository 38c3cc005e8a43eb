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
use std::time::Duration;
use std::time::Instant;

use rand::RngCore;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use strum::EnumCount;
use strum_macros::EnumCount;
use strum_macros::EnumIter;

use crate::auth::AuthContext;
use crate::chunk::Chunk;
use crate::chunk::ChunkType;
use crate::ranges::RangeSet;
use crate::MIN_PATH_MTU;

use self::transport::Transport;

/// SCTP association states.
/// See RFC 4960 Section 4
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    /// No association exists.
    #[default]
    Closed,

    /// An INIT has been sent.
    CookieWait,

    /// A COOKIE ECHO has been sent.
    CookieEchoed,

    /// The association is established.
    Established,

    /// The upper layer requested shutdown, outstanding data remains.
    ShutdownPending,

    /// A SHUTDOWN chunk has been sent.
    ShutdownSent,

    /// A SHUTDOWN chunk has been received.
    ShutdownReceived,

    /// A SHUTDOWN ACK has been sent.
    ShutdownAckSent,
}

/// Association-level timers the output path interacts with.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, EnumIter, EnumCount)]
pub enum Timer {
    /// When to retransmit unacknowledged DATA.
    T3Rtx,

    /// When a delayed SACK must be sent at the latest.
    Sack,

    /// When to probe an idle destination address.
    Heartbeat,

    /// When to close an idle established association.
    Autoclose,
}

/// Associated timeout values with each `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub struct TimerTable {
    expires: [Option<Instant>; Timer::COUNT],
}

impl TimerTable {
    /// Set expiration time for the given timer
    pub fn set(&mut self, timer: Timer, time: Instant) {
        self.expires[timer as usize] = Some(time);
    }

    /// Get expiration time for the given timer
    pub fn get(&self, timer: Timer) -> Option<Instant> {
        self.expires[timer as usize]
    }

    /// Cancel the given timer
    pub fn stop(&mut self, timer: Timer) {
        self.expires[timer as usize] = None;
    }

    /// Get the minimum expiration time of all timers
    pub fn next_timeout(&self) -> Option<Instant> {
        self.expires.iter().filter_map(|&x| x).min()
    }

    /// Check whether the given timer is expired
    pub fn is_expired(&self, timer: Timer, after: Instant) -> bool {
        self.expires[timer as usize].map_or(false, |x| x <= after)
    }
}

/// The sender's view of the peer endpoint.
#[derive(Debug)]
pub struct PeerInfo {
    /// The receiver window advertised by the peer, reduced by the data we
    /// put in flight since the last SACK.
    pub rwnd: u32,

    /// Whether an acknowledgment is owed to the peer.
    pub sack_needed: bool,

    /// Incremented when a SACK is built, so per-transport state can detect
    /// an out-of-date SACK.
    pub sack_generation: u32,

    /// Whether the peer negotiated partial reliability.
    pub prsctp_capable: bool,

    /// Whether the peer negotiated chunk authentication.
    pub auth_capable: bool,

    /// The transport address the last packet was sent to.
    pub last_sent_to: Option<SocketAddr>,
}

impl Default for PeerInfo {
    fn default() -> Self {
        PeerInfo {
            rwnd: crate::DEFAULT_RWND,
            sack_needed: false,
            sack_generation: 0,
            prsctp_capable: false,
            auth_capable: false,
            last_sent_to: None,
        }
    }
}

/// Counters of the outbound queue feeding the packetizer.
#[derive(Debug, Default)]
pub struct OutQueue {
    /// Bytes of DATA sent to the peer and not yet acknowledged, across all
    /// transports.
    pub outstanding_bytes: usize,

    /// Bytes of user data still queued, waiting to be packetized.
    pub out_qlen: usize,
}

/// Association statistics.
#[derive(Debug, Default)]
pub struct AssocStats {
    /// Packets handed to the network layer.
    pub opackets: u64,

    /// SACK chunks sent.
    pub osacks: u64,

    /// Emissions abandoned for lack of a route.
    pub out_no_routes: u64,
}

/// The slice of socket state the output path consults.
#[derive(Debug, Default)]
pub struct SocketState {
    /// Nagle is disabled on the socket.
    pub nodelay: bool,

    /// The socket may build super-packets for segmentation offload.
    pub can_gso: bool,

    /// The socket error slot. Fatal output errors deposit an errno here;
    /// zero means none.
    pub err: i64,
}

/// Map of TSNs received from the peer, kept as offsets from the initial
/// TSN so the sequence space survives 32-bit wrap. It yields the
/// cumulative ack point, gap ack blocks and the duplicate report of an
/// outgoing SACK.
#[derive(Debug)]
pub struct TsnMap {
    /// The TSN at offset zero.
    base: u32,

    /// Offset of the next expected in-order TSN.
    next_off: u64,

    /// Offsets received beyond the cumulative ack point.
    pending: RangeSet,

    /// TSNs received more than once since the last SACK.
    duplicates: FxHashSet<u32>,
}

impl TsnMap {
    /// Create a map expecting `initial_tsn` as the first TSN.
    pub fn new(initial_tsn: u32) -> Self {
        TsnMap {
            base: initial_tsn,
            next_off: 0,
            pending: RangeSet::new(),
            duplicates: FxHashSet::default(),
        }
    }

    /// Record a received TSN. Return false if it was a duplicate.
    pub fn record(&mut self, tsn: u32) -> bool {
        let off = tsn.wrapping_sub(self.base) as u64;
        // Serially at or before the cumulative ack point (including TSNs
        // from before the window that wrap to huge offsets), or already
        // recorded: a duplicate either way.
        if off < self.next_off
            || off.wrapping_sub(self.next_off) >= 1 << 31
            || self.pending.contains(off)
        {
            self.duplicates.insert(tsn);
            return false;
        }

        self.pending.add_elem(off);
        while let Some(r) = self.pending.peek_min() {
            if r.start != self.next_off {
                break;
            }
            self.next_off = r.end;
            self.pending.remove_until(r.end - 1);
        }
        true
    }

    /// Return the cumulative TSN ack point.
    pub fn cumulative_tsn_ack(&self) -> u32 {
        self.base.wrapping_add(self.next_off as u32).wrapping_sub(1)
    }

    /// Return the gap ack blocks as start/end offsets relative to the
    /// cumulative TSN ack point.
    /// See RFC 4960 Section 3.3.4
    pub fn gap_ack_blocks(&self) -> Vec<(u16, u16)> {
        // Pending ranges start strictly beyond the ack point, so both
        // offsets are at least one. Blocks out of u16 range are left for
        // a later SACK, after the ack point has advanced.
        self.pending
            .iter()
            .filter(|r| r.end - self.next_off <= u16::MAX as u64)
            .map(|r| {
                (
                    (r.start - self.next_off + 1) as u16,
                    (r.end - self.next_off) as u16,
                )
            })
            .collect()
    }

    /// Drain the duplicate TSN report, sorted for a stable wire image.
    pub fn take_duplicates(&mut self) -> Vec<u32> {
        let mut dups: Vec<u32> = self.duplicates.drain().collect();
        dups.sort_unstable();
        dups
    }
}

/// The association state the output path reads and mutates. Ownership of
/// transports and of the outbound queue proper stays with the caller; this
/// type carries the shared counters, sequence allocators and timers.
#[derive(Debug)]
pub struct Association {
    /// Current state of the association.
    pub state: State,

    /// Association path MTU: the smallest PMTU across the peer's
    /// transports.
    pub pathmtu: usize,

    /// Whether path MTU discovery is enabled.
    pub pmtud_enable: bool,

    /// Limit on packets sent in one burst, in PMTU units. Zero disables
    /// burst limiting.
    pub max_burst: usize,

    /// Our receive window.
    pub rwnd: u32,

    /// The receive window last advertised to the peer.
    pub a_rwnd: u32,

    /// The verification tag committed into outgoing packets.
    pub peer_vtag: u32,

    /// The sender's view of the peer.
    pub peer: PeerInfo,

    /// Outbound queue counters.
    pub outqueue: OutQueue,

    /// Statistics.
    pub stats: AssocStats,

    /// Association timers.
    pub timers: TimerTable,

    /// AUTOCLOSE timeout, when armed by the upper layer.
    pub autoclose: Option<Duration>,

    /// Chunk authentication state, present when negotiated.
    pub auth: Option<AuthContext>,

    /// Next TSN to assign to outgoing DATA.
    next_tsn: u32,

    /// Next SSN per outgoing stream.
    ssn: FxHashMap<u16, u16>,

    /// TSNs received from the peer, feeding outgoing SACKs.
    tsn_map: TsnMap,

    /// An ECNE report is owed to the peer.
    need_ecne: bool,

    /// Lowest TSN seen with a congestion experienced mark.
    last_ecne_tsn: u32,
}

impl Association {
    /// Create an association. `initial_tsn` seeds the outgoing TSN
    /// allocator and `peer_initial_tsn` the received-TSN map.
    pub fn new(initial_tsn: u32, peer_initial_tsn: u32) -> Self {
        Association {
            state: State::Closed,
            pathmtu: crate::DEFAULT_PATH_MTU,
            pmtud_enable: true,
            max_burst: crate::DEFAULT_MAX_BURST,
            rwnd: crate::DEFAULT_RWND,
            a_rwnd: crate::DEFAULT_RWND,
            peer_vtag: 0,
            peer: PeerInfo::default(),
            outqueue: OutQueue::default(),
            stats: AssocStats::default(),
            timers: TimerTable::default(),
            autoclose: None,
            auth: None,
            next_tsn: initial_tsn,
            ssn: FxHashMap::default(),
            tsn_map: TsnMap::new(peer_initial_tsn),
            need_ecne: false,
            last_ecne_tsn: 0,
        }
    }

    /// Create an association with random initial TSN and verification tag.
    pub fn with_random_tags(peer_initial_tsn: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut asoc = Association::new(rng.next_u32(), peer_initial_tsn);
        asoc.peer_vtag = rng.next_u32();
        asoc
    }

    /// Return whether the association is established.
    pub fn is_established(&self) -> bool {
        self.state == State::Established
    }

    /// Assign the next TSN to a DATA chunk. A chunk that already carries a
    /// TSN (a retransmission) keeps it.
    /// See RFC 4960 Section 6.1
    pub fn assign_tsn(&mut self, chunk: &mut Chunk) {
        if chunk.has_tsn {
            return;
        }
        chunk.set_tsn(self.next_tsn);
        self.next_tsn = self.next_tsn.wrapping_add(1);
    }

    /// Assign the per-stream sequence number to a DATA chunk. Unordered
    /// chunks carry SSN zero.
    /// See RFC 4960 Section 6.6
    pub fn assign_ssn(&mut self, chunk: &mut Chunk) {
        // The U bit in the DATA chunk flag byte.
        if chunk.bytes()[1] & 0x04 != 0 {
            chunk.set_ssn(0);
            return;
        }

        let ssn = self.ssn.entry(chunk.stream_id()).or_insert(0);
        chunk.set_ssn(*ssn);
        *ssn = ssn.wrapping_add(1);
    }

    /// Record a TSN received from the peer.
    pub fn record_tsn(&mut self, tsn: u32) -> bool {
        self.tsn_map.record(tsn)
    }

    /// Build a SACK reflecting the current received-TSN map and the
    /// committed `a_rwnd`, and bump the SACK generation.
    pub fn make_sack(&mut self) -> Chunk {
        let gaps = self.tsn_map.gap_ack_blocks();
        let dups = self.tsn_map.take_duplicates();
        self.peer.sack_generation = self.peer.sack_generation.wrapping_add(1);
        Chunk::new_sack(self.tsn_map.cumulative_tsn_ack(), self.a_rwnd, &gaps, &dups)
    }

    /// Return whether a delayed SACK is pending.
    pub fn sack_timer_pending(&self) -> bool {
        self.timers.get(Timer::Sack).is_some()
    }

    /// Note a congestion experienced mark on the given TSN, so the next
    /// empty packet leads with an ECNE chunk.
    pub fn note_ecn_ce(&mut self, lowest_tsn: u32) {
        self.need_ecne = true;
        self.last_ecne_tsn = lowest_tsn;
    }

    /// Take the pending ECNE chunk, if an ECNE report is owed.
    pub fn take_ecne_prepend(&mut self) -> Option<Chunk> {
        if !self.need_ecne {
            return None;
        }
        self.need_ecne = false;
        Some(Chunk::new_ecne(self.last_ecne_tsn))
    }

    /// Resynchronize the association PMTU from a transport whose route
    /// changed. With a single transport the association PMTU follows it;
    /// multi-homed callers invoke this per transport and the smallest
    /// value wins.
    pub fn sync_pmtu(&mut self, tp: &Transport) {
        let pmtu = std::cmp::max(MIN_PATH_MTU, tp.pathmtu);
        if self.pathmtu > pmtu || self.peer.last_sent_to.is_none() {
            self.pathmtu = pmtu;
        }
    }

    /// Return whether the peer asked for the given chunk type to be sent
    /// under authentication.
    pub fn chunk_requires_auth(&self, chunk_type: ChunkType) -> bool {
        if !self.peer.auth_capable {
            return false;
        }
        self.auth
            .as_ref()
            .map_or(false, |a| a.requires_auth(chunk_type))
    }
}

pub mod transport;
