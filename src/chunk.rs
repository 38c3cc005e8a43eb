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
use std::time::Instant;

use bytes::BufMut;
use bytes::BytesMut;
use enumflags2::bitflags;
use enumflags2::BitFlags;
use strum_macros::EnumIter;

use crate::codec::Decoder;
use crate::Error;
use crate::Result;

/// The fixed part of every chunk: type, flags, length.
/// See RFC 4960 Section 3.2
pub const CHUNK_HDR_SIZE: usize = 4;

/// The fixed part of a DATA chunk: chunk header, TSN, stream identifier,
/// stream sequence number, payload protocol identifier.
/// See RFC 4960 Section 3.3.1
pub const DATA_CHUNK_HDR_SIZE: usize = 16;

/// The fixed part of an AUTH chunk: chunk header, shared key identifier,
/// HMAC identifier. The HMAC itself follows.
/// See RFC 4895 Section 4.1
pub const AUTH_CHUNK_HDR_SIZE: usize = 8;

/// Round `len` up to the next 4-byte boundary.
///
/// The total length of a chunk must be a multiple of 4 bytes; the sender
/// pads with zero bytes which are not reflected in the chunk length field.
/// See RFC 4960 Section 3.2
pub fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// SCTP chunk type.
/// See RFC 4960 Section 3.2, RFC 4895, RFC 3758
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumIter)]
#[repr(u8)]
pub enum ChunkType {
    /// Payload data.
    Data = 0,

    /// Initiation of an association.
    Init = 1,

    /// Acknowledgment of an initiation.
    InitAck = 2,

    /// Selective acknowledgment of received DATA.
    Sack = 3,

    /// Reachability probe for a destination transport address.
    Heartbeat = 4,

    /// Response to a HEARTBEAT.
    HeartbeatAck = 5,

    /// Immediate association teardown.
    Abort = 6,

    /// Graceful association shutdown.
    Shutdown = 7,

    /// Acknowledgment of a SHUTDOWN.
    ShutdownAck = 8,

    /// Operation error report.
    OperationError = 9,

    /// State cookie echoed back during association establishment.
    CookieEcho = 10,

    /// Acknowledgment of a COOKIE ECHO.
    CookieAck = 11,

    /// Explicit congestion notification echo.
    Ecne = 12,

    /// Congestion window reduced notification.
    Cwr = 13,

    /// Completion of a graceful shutdown.
    ShutdownComplete = 14,

    /// Authentication chunk carrying an HMAC over the chunks that follow.
    /// See RFC 4895 Section 4.1
    Auth = 15,

    /// Forward cumulative TSN, used by partial reliability.
    /// See RFC 3758 Section 3.2
    ForwardTsn = 192,
}

impl ChunkType {
    /// Build a chunk type from its wire identifier.
    pub fn from_u8(v: u8) -> Result<ChunkType> {
        match v {
            0 => Ok(ChunkType::Data),
            1 => Ok(ChunkType::Init),
            2 => Ok(ChunkType::InitAck),
            3 => Ok(ChunkType::Sack),
            4 => Ok(ChunkType::Heartbeat),
            5 => Ok(ChunkType::HeartbeatAck),
            6 => Ok(ChunkType::Abort),
            7 => Ok(ChunkType::Shutdown),
            8 => Ok(ChunkType::ShutdownAck),
            9 => Ok(ChunkType::OperationError),
            10 => Ok(ChunkType::CookieEcho),
            11 => Ok(ChunkType::CookieAck),
            12 => Ok(ChunkType::Ecne),
            13 => Ok(ChunkType::Cwr),
            14 => Ok(ChunkType::ShutdownComplete),
            15 => Ok(ChunkType::Auth),
            192 => Ok(ChunkType::ForwardTsn),
            _ => Err(Error::InvalidPacket),
        }
    }

    /// Return whether the chunk type carries user payload.
    pub fn is_data(self) -> bool {
        self == ChunkType::Data
    }
}

/// Flag bits of a DATA chunk header.
/// See RFC 4960 Section 3.3.1 and RFC 7053 Section 3
#[bitflags]
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataChunkFlags {
    /// Last fragment of a user message.
    Ending = 0b0000_0001,

    /// First fragment of a user message.
    Beginning = 0b0000_0010,

    /// Unordered delivery; the SSN field is ignored by the receiver.
    Unordered = 0b0000_0100,

    /// The receiver should not delay the acknowledgment of this chunk.
    Immediate = 0b0000_1000,
}

/// Fast retransmission state of a DATA chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FastRetransmit {
    /// The chunk may be fast retransmitted if marked by SACK processing.
    #[default]
    Capable,

    /// SACK processing marked the chunk for fast retransmission. Such a
    /// chunk ignores the congestion window when admitted.
    Needed,

    /// The chunk has used up its fast retransmission.
    Disabled,
}

/// Hints inherited from the user message a DATA chunk belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsgHints {
    /// Whether the message tolerates Nagle-style delay. Fragmented large
    /// writes clear it so their tail is not held back.
    pub can_delay: bool,

    /// Whether the message may still be abandoned under partial
    /// reliability. Cleared on first transmission when the peer is not
    /// PR-SCTP capable.
    pub can_abandon: bool,
}

impl Default for MsgHints {
    fn default() -> Self {
        MsgHints {
            can_delay: true,
            can_abandon: true,
        }
    }
}

/// A parsed chunk header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    /// The type of the chunk.
    pub chunk_type: ChunkType,

    /// The chunk flag byte; meaning depends on the chunk type.
    pub flags: u8,

    /// The chunk length in bytes, trailing padding excluded.
    pub length: u16,
}

impl ChunkHeader {
    /// Decode a chunk header from the front of the given buffer.
    pub fn from_bytes(mut buf: &[u8]) -> Result<ChunkHeader> {
        let chunk_type = ChunkType::from_u8(buf.read_u8()?)?;
        let flags = buf.read_u8()?;
        let length = buf.read_u16()?;
        if (length as usize) < CHUNK_HDR_SIZE {
            return Err(Error::InvalidPacket);
        }
        Ok(ChunkHeader {
            chunk_type,
            flags,
            length,
        })
    }
}

/// An outbound SCTP chunk: the raw wire bytes plus the bookkeeping the
/// output path reads and writes.
///
/// The buffer holds the chunk exactly as it appears on the wire, without
/// trailing padding; padding is produced at serialization time.
#[derive(Debug)]
pub struct Chunk {
    /// The wire bytes of the chunk, unpadded.
    buf: BytesMut,

    /// The type of the chunk, redundant with the first buffer byte.
    chunk_type: ChunkType,

    /// The peer asked for this chunk type to be authenticated.
    pub auth_required: bool,

    /// Fast retransmission state, meaningful for DATA only.
    pub fast_retransmit: FastRetransmit,

    /// Whether the chunk has been retransmitted before. A resent chunk is
    /// never used for an RTT measurement.
    pub resent: bool,

    /// When the chunk was last admitted into a packet.
    pub sent_at: Option<Instant>,

    /// How many times the chunk has been admitted. Drives PR-SCTP
    /// retransmission policies.
    pub sent_count: u32,

    /// Whether this chunk is the one being timed for an RTT sample on its
    /// transport.
    pub rtt_in_progress: bool,

    /// Whether a TSN has been assigned yet.
    pub has_tsn: bool,

    /// The peer transport address the chunk was admitted for. Set when the
    /// chunk enters a packet; it matches the packet's transport.
    pub transport: Option<SocketAddr>,

    /// Message-level hints, meaningful for DATA only.
    pub msg: MsgHints,

    /// Stream identifier, meaningful for DATA only.
    stream_id: u16,
}

impl Chunk {
    fn from_buf(buf: BytesMut, chunk_type: ChunkType) -> Chunk {
        Chunk {
            buf,
            chunk_type,
            auth_required: false,
            fast_retransmit: FastRetransmit::default(),
            resent: false,
            sent_at: None,
            sent_count: 0,
            rtt_in_progress: false,
            has_tsn: false,
            transport: None,
            msg: MsgHints::default(),
            stream_id: 0,
        }
    }

    /// Create a DATA chunk. The TSN and SSN fields are left zero until the
    /// chunk is admitted into a packet.
    /// See RFC 4960 Section 3.3.1
    pub fn new_data(
        stream_id: u16,
        ppid: u32,
        flags: BitFlags<DataChunkFlags>,
        payload: &[u8],
    ) -> Chunk {
        let len = DATA_CHUNK_HDR_SIZE + payload.len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(ChunkType::Data as u8);
        buf.put_u8(flags.bits());
        buf.put_u16(len as u16);
        buf.put_u32(0); // TSN, assigned on admission
        buf.put_u16(stream_id);
        buf.put_u16(0); // SSN, assigned on admission
        buf.put_u32(ppid);
        buf.put_slice(payload);

        let mut chunk = Chunk::from_buf(buf, ChunkType::Data);
        chunk.stream_id = stream_id;
        chunk
    }

    /// Create a SACK chunk.
    /// See RFC 4960 Section 3.3.4
    pub fn new_sack(
        cumulative_tsn_ack: u32,
        a_rwnd: u32,
        gap_ack_blocks: &[(u16, u16)],
        duplicate_tsns: &[u32],
    ) -> Chunk {
        let len = CHUNK_HDR_SIZE + 12 + gap_ack_blocks.len() * 4 + duplicate_tsns.len() * 4;
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(ChunkType::Sack as u8);
        buf.put_u8(0);
        buf.put_u16(len as u16);
        buf.put_u32(cumulative_tsn_ack);
        buf.put_u32(a_rwnd);
        buf.put_u16(gap_ack_blocks.len() as u16);
        buf.put_u16(duplicate_tsns.len() as u16);
        for (start, end) in gap_ack_blocks {
            buf.put_u16(*start);
            buf.put_u16(*end);
        }
        for tsn in duplicate_tsns {
            buf.put_u32(*tsn);
        }

        Chunk::from_buf(buf, ChunkType::Sack)
    }

    /// Create an AUTH chunk with a zeroed HMAC of `mac_len` bytes. The MAC
    /// is patched in place at serialization time.
    /// See RFC 4895 Section 4.1
    pub fn new_auth(shared_key_id: u16, hmac_ident: u16, mac_len: usize) -> Chunk {
        let len = AUTH_CHUNK_HDR_SIZE + mac_len;
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(ChunkType::Auth as u8);
        buf.put_u8(0);
        buf.put_u16(len as u16);
        buf.put_u16(shared_key_id);
        buf.put_u16(hmac_ident);
        buf.put_bytes(0, mac_len);

        Chunk::from_buf(buf, ChunkType::Auth)
    }

    /// Create a COOKIE ECHO chunk.
    /// See RFC 4960 Section 3.3.11
    pub fn new_cookie_echo(cookie: &[u8]) -> Chunk {
        Chunk::new_control(ChunkType::CookieEcho, 0, cookie)
    }

    /// Create a HEARTBEAT chunk wrapping the given sender-specific info in
    /// a Heartbeat Info parameter.
    /// See RFC 4960 Section 3.3.5
    pub fn new_heartbeat(info: &[u8]) -> Chunk {
        let param_len = 4 + info.len();
        let len = CHUNK_HDR_SIZE + param_len;
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(ChunkType::Heartbeat as u8);
        buf.put_u8(0);
        buf.put_u16(len as u16);
        buf.put_u16(1); // Heartbeat Info parameter type
        buf.put_u16(param_len as u16);
        buf.put_slice(info);

        Chunk::from_buf(buf, ChunkType::Heartbeat)
    }

    /// Create an ECNE chunk reporting the lowest TSN received with a
    /// congestion experienced mark.
    /// See RFC 4960 Appendix A
    pub fn new_ecne(lowest_tsn: u32) -> Chunk {
        let mut body = [0_u8; 4];
        body.copy_from_slice(&lowest_tsn.to_be_bytes());
        Chunk::new_control(ChunkType::Ecne, 0, &body)
    }

    /// Create an ABORT chunk with no error causes.
    /// See RFC 4960 Section 3.3.7
    pub fn new_abort() -> Chunk {
        Chunk::new_control(ChunkType::Abort, 0, &[])
    }

    /// Create a control chunk of the given type around an opaque value.
    pub fn new_control(chunk_type: ChunkType, flags: u8, value: &[u8]) -> Chunk {
        let len = CHUNK_HDR_SIZE + value.len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(chunk_type as u8);
        buf.put_u8(flags);
        buf.put_u16(len as u16);
        buf.put_slice(value);

        Chunk::from_buf(buf, chunk_type)
    }

    /// Return the type of the chunk.
    pub fn chunk_type(&self) -> ChunkType {
        self.chunk_type
    }

    /// Return whether the chunk carries user payload.
    pub fn is_data(&self) -> bool {
        self.chunk_type.is_data()
    }

    /// Return the wire length of the chunk, trailing padding excluded.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Return whether the chunk is empty. A well-formed chunk never is.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Return the wire length of the chunk rounded up to a 4-byte boundary.
    pub fn padded_len(&self) -> usize {
        pad4(self.buf.len())
    }

    /// Return the user payload size of a DATA chunk.
    pub fn data_size(&self) -> usize {
        debug_assert!(self.is_data());
        self.buf.len().saturating_sub(DATA_CHUNK_HDR_SIZE)
    }

    /// Return the raw wire bytes, unpadded.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Return the stream identifier of a DATA chunk.
    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Write the assigned TSN into the DATA chunk header.
    pub(crate) fn set_tsn(&mut self, tsn: u32) {
        debug_assert!(self.is_data());
        self.buf[4..8].copy_from_slice(&tsn.to_be_bytes());
        self.has_tsn = true;
    }

    /// Write the assigned SSN into the DATA chunk header.
    pub(crate) fn set_ssn(&mut self, ssn: u16) {
        debug_assert!(self.is_data());
        self.buf[10..12].copy_from_slice(&ssn.to_be_bytes());
    }

    /// Return the TSN of a DATA chunk, if one has been assigned.
    pub fn tsn(&self) -> Option<u32> {
        if !self.has_tsn {
            return None;
        }
        let mut tsn = [0_u8; 4];
        tsn.copy_from_slice(&self.buf[4..8]);
        Some(u32::from_be_bytes(tsn))
    }

    /// Return the SSN of a DATA chunk.
    pub fn ssn(&self) -> u16 {
        let mut ssn = [0_u8; 2];
        ssn.copy_from_slice(&self.buf[10..12]);
        u16::from_be_bytes(ssn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn chunk_type_round_trip() -> Result<()> {
        for t in ChunkType::iter() {
            assert_eq!(ChunkType::from_u8(t as u8)?, t);
        }
        assert!(ChunkType::from_u8(99).is_err());
        Ok(())
    }

    #[test]
    fn chunk_header_decode() -> Result<()> {
        let buf = [0x03_u8, 0x00, 0x00, 0x10];
        let hdr = ChunkHeader::from_bytes(&buf)?;
        assert_eq!(hdr.chunk_type, ChunkType::Sack);
        assert_eq!(hdr.flags, 0);
        assert_eq!(hdr.length, 16);

        // A length below the fixed header size is malformed.
        let buf = [0x03_u8, 0x00, 0x00, 0x02];
        assert!(ChunkHeader::from_bytes(&buf).is_err());
        Ok(())
    }

    #[test]
    fn data_chunk() -> Result<()> {
        let payload = [0xab_u8; 5];
        let mut chunk = Chunk::new_data(
            7,
            0x1020,
            DataChunkFlags::Beginning | DataChunkFlags::Ending,
            &payload,
        );

        assert!(chunk.is_data());
        assert_eq!(chunk.len(), DATA_CHUNK_HDR_SIZE + 5);
        assert_eq!(chunk.padded_len(), DATA_CHUNK_HDR_SIZE + 8);
        assert_eq!(chunk.data_size(), 5);
        assert_eq!(chunk.stream_id(), 7);
        assert_eq!(chunk.tsn(), None);

        let hdr = ChunkHeader::from_bytes(chunk.bytes())?;
        assert_eq!(hdr.chunk_type, ChunkType::Data);
        assert_eq!(hdr.flags, 0x03);
        assert_eq!(hdr.length as usize, chunk.len());

        chunk.set_tsn(0x01020304);
        chunk.set_ssn(0x0a0b);
        assert_eq!(chunk.tsn(), Some(0x01020304));
        assert_eq!(chunk.ssn(), 0x0a0b);
        assert_eq!(&chunk.bytes()[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&chunk.bytes()[10..12], &[0x0a, 0x0b]);
        Ok(())
    }

    #[test]
    fn sack_chunk() -> Result<()> {
        let chunk = Chunk::new_sack(0x01000000, 65535, &[(1, 3), (5, 5)], &[0x01000002]);

        let hdr = ChunkHeader::from_bytes(chunk.bytes())?;
        assert_eq!(hdr.chunk_type, ChunkType::Sack);
        assert_eq!(hdr.length as usize, CHUNK_HDR_SIZE + 12 + 8 + 4);

        let mut body = &chunk.bytes()[4..];
        assert_eq!(body.read_u32()?, 0x01000000); // cumulative tsn ack
        assert_eq!(body.read_u32()?, 65535); // a_rwnd
        assert_eq!(body.read_u16()?, 2); // gap blocks
        assert_eq!(body.read_u16()?, 1); // dup tsns
        assert_eq!(body.read_u16()?, 1);
        assert_eq!(body.read_u16()?, 3);
        assert_eq!(body.read_u16()?, 5);
        assert_eq!(body.read_u16()?, 5);
        assert_eq!(body.read_u32()?, 0x01000002);
        Ok(())
    }

    #[test]
    fn auth_chunk() -> Result<()> {
        let chunk = Chunk::new_auth(1, 3, 32);

        let hdr = ChunkHeader::from_bytes(chunk.bytes())?;
        assert_eq!(hdr.chunk_type, ChunkType::Auth);
        assert_eq!(hdr.length as usize, AUTH_CHUNK_HDR_SIZE + 32);

        let mut body = &chunk.bytes()[4..];
        assert_eq!(body.read_u16()?, 1); // shared key id
        assert_eq!(body.read_u16()?, 3); // hmac identifier
        assert_eq!(body.read(32)?, vec![0; 32]); // zeroed mac
        Ok(())
    }

    #[test]
    fn control_chunks() -> Result<()> {
        for (chunk, chunk_type, len) in [
            (
                Chunk::new_cookie_echo(&[0xcc; 33]),
                ChunkType::CookieEcho,
                CHUNK_HDR_SIZE + 33,
            ),
            (
                Chunk::new_heartbeat(&[0x11; 6]),
                ChunkType::Heartbeat,
                CHUNK_HDR_SIZE + 4 + 6,
            ),
            (Chunk::new_ecne(42), ChunkType::Ecne, CHUNK_HDR_SIZE + 4),
            (Chunk::new_abort(), ChunkType::Abort, CHUNK_HDR_SIZE),
        ] {
            assert_eq!(chunk.chunk_type(), chunk_type);
            assert!(!chunk.is_data());
            assert_eq!(chunk.len(), len);

            let hdr = ChunkHeader::from_bytes(chunk.bytes())?;
            assert_eq!(hdr.chunk_type, chunk_type);
            assert_eq!(hdr.length as usize, len);
        }
        Ok(())
    }

    #[test]
    fn padded_len_not_in_length_field() -> Result<()> {
        let chunk = Chunk::new_cookie_echo(&[0xcc; 5]);
        assert_eq!(chunk.len(), 9);
        assert_eq!(chunk.padded_len(), 12);

        let hdr = ChunkHeader::from_bytes(chunk.bytes())?;
        assert_eq!(hdr.length, 9);
        Ok(())
    }
}
