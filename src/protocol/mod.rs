//! Protocol module - header codec, packet assembly, status probing.
//!
//! This module implements the IPbus v2.0 wire protocol:
//! - 32-bit packet and transaction header encoding/decoding
//! - Control packet builder and response validator
//! - The fixed 64-byte status probe

mod packet;
mod status;
mod wire_format;

pub use packet::ControlPacket;
pub use status::{
    is_status_reply, status_reply, status_request, StatusInfo, STATUS_PACKET_SIZE,
    STATUS_PACKET_WORDS, STATUS_REQUEST_HEADER,
};
pub use wire_format::{
    first_word, info_code_str, PacketHeader, PacketType, TransactionHeader, TransactionType,
    BYTE_ORDER_MARKER, MAX_PACKET_WORDS, PROTOCOL_VERSION, WORD_SIZE,
};
