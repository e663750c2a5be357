//! Status packet construction and reply decoding.
//!
//! The status packet is a fixed 64-byte probe used to check whether a
//! target is reachable and speaks IPbus: the status packet header followed
//! by 15 zero words. The target echoes the header and fills in a snapshot
//! of its buffer state.

use bytes::{Buf, BufMut, BytesMut};

use super::wire_format::{first_word, PacketHeader, PacketType, WORD_SIZE};

/// Size of a status packet in bytes.
pub const STATUS_PACKET_SIZE: usize = 64;

/// Size of a status packet in words.
pub const STATUS_PACKET_WORDS: usize = STATUS_PACKET_SIZE / WORD_SIZE;

/// The status packet header word, `0x200000F1`.
pub const STATUS_REQUEST_HEADER: u32 = PacketHeader::new(PacketType::Status, 0).encode();

/// Build the 64-byte status request datagram, little-endian.
pub fn status_request() -> [u8; STATUS_PACKET_SIZE] {
    let mut datagram = [0u8; STATUS_PACKET_SIZE];
    datagram[..WORD_SIZE].copy_from_slice(&STATUS_REQUEST_HEADER.to_le_bytes());
    datagram
}

/// Whether a datagram looks like a status reply (or a stale status reply
/// surfacing during a control exchange).
pub fn is_status_reply(datagram: &[u8]) -> bool {
    datagram.len() == STATUS_PACKET_SIZE && first_word(datagram) == Some(STATUS_REQUEST_HEADER)
}

/// Target state snapshot carried in a status reply.
///
/// Words 1-3 of the reply hold the target's MTU, the number of response
/// buffers it keeps for resend requests, and the packet ID it expects
/// next. All three are diagnostics here; the client does not act on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusInfo {
    /// Maximum packet size the target accepts, in bytes.
    pub mtu: u32,
    /// Number of buffered responses held for resend.
    pub response_buffers: u32,
    /// Packet ID the target expects in the next reliability-tracked packet.
    pub next_packet_id: u32,
}

impl StatusInfo {
    /// Decode a status reply. Returns `None` unless the datagram has the
    /// status layout and header.
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        if !is_status_reply(datagram) {
            return None;
        }
        let mut words = &datagram[WORD_SIZE..];
        Some(Self {
            mtu: words.get_u32_le(),
            response_buffers: words.get_u32_le(),
            next_packet_id: words.get_u32_le(),
        })
    }
}

/// Build a status reply datagram; used by tests standing in for a target.
pub fn status_reply(info: &StatusInfo) -> [u8; STATUS_PACKET_SIZE] {
    let mut buf = BytesMut::with_capacity(STATUS_PACKET_SIZE);
    buf.put_u32_le(STATUS_REQUEST_HEADER);
    buf.put_u32_le(info.mtu);
    buf.put_u32_le(info.response_buffers);
    buf.put_u32_le(info.next_packet_id);
    buf.resize(STATUS_PACKET_SIZE, 0);
    let mut datagram = [0u8; STATUS_PACKET_SIZE];
    datagram.copy_from_slice(&buf);
    datagram
}
