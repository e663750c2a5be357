//! IPbus v2.0 header encoding and decoding.
//!
//! Implements the two 32-bit header words of the protocol:
//!
//! ```text
//! Packet header (bit 31 .. bit 0):
//! ┌─────────┬──────────┬───────────┬────────────┬─────────────┐
//! │ Version │ Reserved │ Packet ID │ Byte order │ Packet type │
//! │ 4 bits  │ 4 bits   │ 16 bits   │ 4 bits     │ 4 bits      │
//! │ = 0x2   │          │           │ = 0xF      │             │
//! └─────────┴──────────┴───────────┴────────────┴─────────────┘
//!
//! Transaction header (bit 31 .. bit 0):
//! ┌─────────┬────────────────┬─────────┬─────────┬───────────┐
//! │ Version │ Transaction ID │ Words   │ Type ID │ Info code │
//! │ 4 bits  │ 12 bits        │ 8 bits  │ 4 bits  │ 4 bits    │
//! │ = 0x2   │                │         │         │           │
//! └─────────┴────────────────┴─────────┴─────────┴───────────┘
//! ```
//!
//! Header words travel little-endian on the wire (the native ordering of
//! the FPGA targets). This module is the only place where bit positions
//! appear; everything here is done with explicit shifts and masks, never
//! through memory layout tricks.

use crate::error::{IpbusError, Result};

/// Size of one protocol word in bytes.
pub const WORD_SIZE: usize = 4;

/// Maximum packet size in words.
///
/// Bounded by the 1500-byte Ethernet MTU: 1472 bytes of UDP payload after
/// the IP and UDP headers, i.e. 368 words.
pub const MAX_PACKET_WORDS: usize = 368;

/// Protocol version carried in both header words.
pub const PROTOCOL_VERSION: u8 = 2;

/// Byte-order marker carried in every packet header.
pub const BYTE_ORDER_MARKER: u8 = 0xF;

/// Packet type field of a packet header.
///
/// Values 0x3-0xF are reserved by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Carries one or more transactions.
    Control = 0,
    /// Connectivity probe; fixed 64-byte layout.
    Status = 1,
    /// Request to resend a lost control response.
    Resend = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = IpbusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::Control),
            1 => Ok(PacketType::Status),
            2 => Ok(PacketType::Resend),
            other => Err(IpbusError::Protocol(format!(
                "unknown packet type {other:#X}"
            ))),
        }
    }
}

/// Transaction type field of a transaction header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionType {
    /// Address-incrementing read.
    Read = 0,
    /// Address-incrementing write.
    Write = 1,
    /// Repeated read of a single address (FIFO drain).
    NonIncrementingRead = 2,
    /// Repeated write to a single address (FIFO fill).
    NonIncrementingWrite = 3,
    /// Atomic `new = (old & and_mask) | or_mask`, returns the old value.
    RmwBits = 4,
    /// Atomic `new = old + addend`, returns the old value.
    RmwSum = 5,
    /// Read of the target's configuration address space.
    ConfigurationRead = 6,
    /// Write to the target's configuration address space.
    ConfigurationWrite = 7,
}

impl TransactionType {
    /// Whether the response carries the declared number of payload words.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            TransactionType::Read
                | TransactionType::NonIncrementingRead
                | TransactionType::ConfigurationRead
        )
    }

    /// Whether the request carries the declared number of payload words.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            TransactionType::Write
                | TransactionType::NonIncrementingWrite
                | TransactionType::ConfigurationWrite
        )
    }

    /// Whether this is one of the two read-modify-write forms.
    pub fn is_rmw(self) -> bool {
        matches!(self, TransactionType::RmwBits | TransactionType::RmwSum)
    }
}

impl TryFrom<u8> for TransactionType {
    type Error = IpbusError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(TransactionType::Read),
            1 => Ok(TransactionType::Write),
            2 => Ok(TransactionType::NonIncrementingRead),
            3 => Ok(TransactionType::NonIncrementingWrite),
            4 => Ok(TransactionType::RmwBits),
            5 => Ok(TransactionType::RmwSum),
            6 => Ok(TransactionType::ConfigurationRead),
            7 => Ok(TransactionType::ConfigurationWrite),
            other => Err(IpbusError::Protocol(format!(
                "unknown transaction type {other:#X}"
            ))),
        }
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type (control, status, resend).
    pub packet_type: PacketType,
    /// Packet ID; always 0 for the control traffic issued here.
    pub packet_id: u16,
}

impl PacketHeader {
    /// Create a header for a packet of the given type and ID.
    pub const fn new(packet_type: PacketType, packet_id: u16) -> Self {
        Self {
            packet_type,
            packet_id,
        }
    }

    /// Encode to the 32-bit header word.
    ///
    /// # Example
    ///
    /// ```
    /// use ipbus_client::protocol::{PacketHeader, PacketType};
    ///
    /// let control = PacketHeader::new(PacketType::Control, 0);
    /// assert_eq!(control.encode(), 0x200000F0);
    /// ```
    pub const fn encode(&self) -> u32 {
        ((PROTOCOL_VERSION as u32) << 28)
            | ((self.packet_id as u32) << 8)
            | ((BYTE_ORDER_MARKER as u32) << 4)
            | (self.packet_type as u32)
    }

    /// Decode a header word.
    ///
    /// Returns `None` when the version nibble, the byte-order marker, or
    /// the packet type is not an IPbus v2.0 value.
    pub fn decode(word: u32) -> Option<Self> {
        let version = (word >> 28) as u8;
        let byte_order = ((word >> 4) & 0xF) as u8;
        if version != PROTOCOL_VERSION || byte_order != BYTE_ORDER_MARKER {
            return None;
        }
        let packet_type = PacketType::try_from((word & 0xF) as u8).ok()?;
        Some(Self {
            packet_type,
            packet_id: ((word >> 8) & 0xFFFF) as u16,
        })
    }
}

/// Decoded transaction header.
///
/// Decoding is total: the raw field values are handed back as-is and
/// semantic checks (version, expected ID, expected type) are left to the
/// response validator, which has the request for comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    /// Protocol version nibble; 2 on a well-formed header.
    pub version: u8,
    /// Transaction ID, 0-based and monotonic within one packet.
    pub transaction_id: u16,
    /// Declared number of payload words.
    pub words: u8,
    /// Raw 4-bit type field; may name no known [`TransactionType`].
    pub type_id: u8,
    /// 4-bit status; 0 in requests and in successful responses.
    pub info_code: u8,
}

impl TransactionHeader {
    /// Encode a request header (info code 0).
    ///
    /// # Example
    ///
    /// ```
    /// use ipbus_client::protocol::{TransactionHeader, TransactionType};
    ///
    /// let word = TransactionHeader::request(TransactionType::Read, 1, 0);
    /// assert_eq!(word, 0x20000100);
    /// ```
    pub fn request(kind: TransactionType, words: u8, transaction_id: u16) -> u32 {
        Self {
            version: PROTOCOL_VERSION,
            transaction_id,
            words,
            type_id: kind as u8,
            info_code: 0,
        }
        .encode()
    }

    /// Encode to the 32-bit header word.
    pub fn encode(&self) -> u32 {
        (u32::from(self.version & 0xF) << 28)
            | (u32::from(self.transaction_id & 0xFFF) << 16)
            | (u32::from(self.words) << 8)
            | (u32::from(self.type_id & 0xF) << 4)
            | u32::from(self.info_code & 0xF)
    }

    /// Decode a header word. Total; never fails.
    pub fn decode(word: u32) -> Self {
        Self {
            version: (word >> 28) as u8,
            transaction_id: ((word >> 16) & 0xFFF) as u16,
            words: ((word >> 8) & 0xFF) as u8,
            type_id: ((word >> 4) & 0xF) as u8,
            info_code: (word & 0xF) as u8,
        }
    }
}

/// Human-readable mnemonic for a response info code.
pub fn info_code_str(info_code: u8) -> &'static str {
    match info_code {
        0x0 => "successful request",
        0x1 => "bad header",
        0x4 => "IPbus read error",
        0x5 => "IPbus write error",
        0x6 => "IPbus read timeout",
        0x7 => "IPbus write timeout",
        0xF => "outbound request",
        _ => "unknown info code",
    }
}

/// First little-endian word of a datagram, if it holds one.
pub fn first_word(datagram: &[u8]) -> Option<u32> {
    let bytes = datagram.get(..WORD_SIZE)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
