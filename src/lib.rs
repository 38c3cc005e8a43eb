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

//! TSCTP is an implementation of the outbound packetization engine of the
//! [SCTP transport protocol](https://www.rfc-editor.org/rfc/rfc4960).
//!
//! It takes individually queued protocol chunks destined for a peer
//! transport address and assembles them into wire-format SCTP packets:
//!
//! * **Admission control**: congestion window, receiver window and Nagle
//!   checks for DATA, PMTU and segmentation-offload caps for everything.
//! * **Bundling**: opportunistic SACK piggybacking on outgoing DATA and
//!   AUTH insertion ahead of chunks the peer wants authenticated
//!   (RFC 4895).
//! * **Serialization**: common header, 4-byte chunk padding, CRC32-C (or
//!   checksum offload), HMAC back-patching, and GSO-style splitting of
//!   over-sized accumulations into PMTU-sized sub-packets.
//! * **Retransmission bookkeeping**: TSN/SSN assignment, flight-size and
//!   rwnd accounting, RTT sample arming, and return of DATA chunk
//!   ownership to the retransmission queue after emission.
//!
//! Chunk scheduling, the association state machine and socket I/O stay
//! with the caller; they appear here only through the narrow collaborator
//! types in [`association`] and the [`PacketSendHandler`] hand-off.

#![allow(dead_code)]

pub use crate::error::Error;

/// A specialized [`Result`] type for quick returns.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// The default path MTU assumed before any route is known.
pub const DEFAULT_PATH_MTU: usize = 1500;

/// The smallest path MTU the engine will operate with. Routes reporting
/// less are clamped.
pub const MIN_PATH_MTU: usize = 512;

/// The receiver window assumed for a peer before it advertises one.
pub const DEFAULT_RWND: u32 = 65535;

/// The default limit on packets sent in one burst, in PMTU units.
/// See RFC 4960 Section 7.2.4
pub const DEFAULT_MAX_BURST: usize = 4;

pub use crate::association::transport::AddressFamily;
pub use crate::association::transport::PacketSendHandler;
pub use crate::association::transport::Route;
pub use crate::association::transport::RouteCaps;
pub use crate::association::transport::Transport;
pub use crate::association::Association;
pub use crate::association::SocketState;
pub use crate::auth::AuthContext;
pub use crate::auth::HmacAlgorithm;
pub use crate::chunk::Chunk;
pub use crate::chunk::ChunkType;
pub use crate::packet::Packet;
pub use crate::packet::PacketInfo;
pub use crate::packet::Verdict;

#[path = "association/association.rs"]
pub mod association;

pub mod auth;
pub mod checksum;
pub mod chunk;
mod codec;
pub mod error;
pub mod packet;
mod ranges;
