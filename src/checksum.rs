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

//! CRC32-C packet checksum.
//! See RFC 4960 Section 6.8 and Appendix B

use crate::association::transport::Route;
use crate::Error;
use crate::Result;

/// Offset of the checksum field within the SCTP common header.
const CHECKSUM_OFFSET: usize = 8;

/// Compute the CRC32-C of an assembled packet with the checksum field
/// treated as zero.
pub fn compute(pkt: &[u8]) -> Result<u32> {
    if pkt.len() < CHECKSUM_OFFSET + 4 {
        return Err(Error::BufferTooShort);
    }

    let crc = crc32c::crc32c(&pkt[..CHECKSUM_OFFSET]);
    let crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    Ok(crc32c::crc32c_append(crc, &pkt[CHECKSUM_OFFSET + 4..]))
}

/// Compute the packet checksum and store it into the common header.
///
/// The CRC32-C value is stored in reflected (little-endian) byte order.
pub fn fill(pkt: &mut [u8]) -> Result<()> {
    let crc = compute(pkt)?;
    pkt[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Check the checksum of a received packet.
pub fn verify(pkt: &[u8]) -> bool {
    let crc = match compute(pkt) {
        Ok(v) => v,
        Err(_) => return false,
    };

    let mut stored = [0_u8; 4];
    stored.copy_from_slice(&pkt[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
    u32::from_le_bytes(stored) == crc
}

/// Return whether the checksum may be left to the device.
///
/// Offload is usable only when the route's device can checksum SCTP, no
/// transform will rewrite the payload, and the packet will not be
/// fragmented by the IP layer.
pub fn offload_usable(route: &Route, ipfragok: bool) -> bool {
    route.caps.sctp_crc_offload && !route.caps.xfrm && !ipfragok
}
