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

//! Chunk authentication per RFC 4895.

use ring::hmac;
use rustc_hash::FxHashSet;

use crate::chunk::Chunk;
use crate::chunk::ChunkType;
use crate::chunk::AUTH_CHUNK_HDR_SIZE;
use crate::Error;
use crate::Result;

/// HMAC algorithm negotiated for chunk authentication.
/// See RFC 4895 Section 8.2
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HmacAlgorithm {
    /// HMAC using SHA-1, mandatory to implement.
    #[default]
    Sha1,

    /// HMAC using SHA-256.
    Sha256,
}

impl HmacAlgorithm {
    /// Return the wire HMAC identifier.
    pub fn ident(self) -> u16 {
        match self {
            HmacAlgorithm::Sha1 => 1,
            HmacAlgorithm::Sha256 => 3,
        }
    }

    /// Return the length of the MAC produced by the algorithm.
    pub fn mac_len(self) -> usize {
        match self {
            HmacAlgorithm::Sha1 => 20,
            HmacAlgorithm::Sha256 => 32,
        }
    }

    fn ring_alg(self) -> hmac::Algorithm {
        match self {
            HmacAlgorithm::Sha1 => hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            HmacAlgorithm::Sha256 => hmac::HMAC_SHA256,
        }
    }
}

/// Authentication state of an association: the endpoint-pair shared key,
/// the negotiated algorithm and the set of chunk types the peer asked to
/// receive under authentication.
#[derive(Debug, Default)]
pub struct AuthContext {
    /// The association shared key derived from the endpoint-pair shared
    /// key per RFC 4895 Section 6.1.
    shared_key: Vec<u8>,

    /// Identifier of the shared key in use.
    active_key_id: u16,

    /// Negotiated HMAC algorithm.
    algorithm: HmacAlgorithm,

    /// Chunk types the peer listed in its Chunk List parameter.
    peer_chunks: FxHashSet<ChunkType>,
}

impl AuthContext {
    /// Create an authentication context.
    pub fn new(shared_key: &[u8], active_key_id: u16, algorithm: HmacAlgorithm) -> Self {
        AuthContext {
            shared_key: shared_key.to_vec(),
            active_key_id,
            algorithm,
            peer_chunks: FxHashSet::default(),
        }
    }

    /// Record that the peer asked for the given chunk type to be sent
    /// under authentication.
    pub fn require_auth(&mut self, chunk_type: ChunkType) {
        self.peer_chunks.insert(chunk_type);
    }

    /// Return whether the peer asked for the given chunk type to be sent
    /// under authentication.
    pub fn requires_auth(&self, chunk_type: ChunkType) -> bool {
        self.peer_chunks.contains(&chunk_type)
    }

    /// Return the negotiated HMAC algorithm.
    pub fn algorithm(&self) -> HmacAlgorithm {
        self.algorithm
    }

    /// Construct an AUTH chunk with a zeroed MAC, sized for the negotiated
    /// algorithm.
    pub fn make_auth(&self) -> Chunk {
        Chunk::new_auth(
            self.active_key_id,
            self.algorithm.ident(),
            self.algorithm.mac_len(),
        )
    }

    /// Compute and patch the MAC of the AUTH chunk found at `auth_offset`
    /// within the assembled packet.
    ///
    /// The MAC input is the AUTH chunk with its HMAC field set to zero,
    /// followed by all chunks placed after the AUTH chunk in the packet.
    /// See RFC 4895 Section 6.3
    pub fn calculate_hmac(&self, pkt: &mut [u8], auth_offset: usize) -> Result<()> {
        let mac_len = self.algorithm.mac_len();
        let mac_start = auth_offset + AUTH_CHUNK_HDR_SIZE;
        let mac_end = mac_start + mac_len;
        if mac_end > pkt.len() {
            return Err(Error::BufferTooShort);
        }

        pkt[mac_start..mac_end].fill(0);

        let key = hmac::Key::new(self.algorithm.ring_alg(), &self.shared_key);
        let tag = hmac::sign(&key, &pkt[auth_offset..]);
        pkt[mac_start..mac_end].copy_from_slice(&tag.as_ref()[..mac_len]);
        Ok(())
    }
}
