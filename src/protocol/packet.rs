//! Control packet assembly and response validation.
//!
//! A [`ControlPacket`] accumulates transactions into two parallel word
//! buffers: `request` holds exactly what will go on the wire, `response`
//! reserves the layout the target is expected to send back. Keeping both
//! lets the validator check that the reply has the predicted shape *and*
//! that every transaction header declares the word count the request asked
//! for.
//!
//! Word 0 of both buffers is the packet header; transactions follow as
//! `header, address, payload...`. Buffers are preallocated to the MTU word
//! cap and never grow.
//!
//! # Example
//!
//! ```
//! use ipbus_client::protocol::{ControlPacket, TransactionType};
//!
//! let mut dest = [0u32; 2];
//! let mut packet = ControlPacket::new();
//! packet.add_word_write(0x1000, 0xCAFE).unwrap();
//! packet.add_read(TransactionType::Read, 0x2000, 2, Some(&mut dest)).unwrap();
//! assert_eq!(packet.transaction_count(), 2);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, IpbusError, Result};
use crate::signal::{Signal, SignalHub};

use super::wire_format::{
    info_code_str, PacketHeader, PacketType, TransactionHeader, TransactionType,
    MAX_PACKET_WORDS, PROTOCOL_VERSION, WORD_SIZE,
};

/// One accumulated transaction.
///
/// Buffer positions are word offsets into the request/response buffers,
/// recorded at build time so the validator never recomputes the layout.
struct Transaction<'buf> {
    kind: TransactionType,
    address: u32,
    request_header_offset: usize,
    response_header_offset: usize,
    response_payload_offset: usize,
    expected_words: u8,
    destination: Option<&'buf mut [u32]>,
}

/// A single IPbus control packet: builder and response validator.
///
/// The lifetime ties the packet to the caller-owned destination buffers
/// registered for read transactions; they are released when the packet is
/// dropped.
pub struct ControlPacket<'buf> {
    request: [u32; MAX_PACKET_WORDS],
    response: [u32; MAX_PACKET_WORDS],
    request_size: usize,
    response_size: usize,
    transactions: Vec<Transaction<'buf>>,
}

impl<'buf> ControlPacket<'buf> {
    /// Create an empty packet holding only the control packet header.
    pub fn new() -> Self {
        let mut request = [0u32; MAX_PACKET_WORDS];
        request[0] = PacketHeader::new(PacketType::Control, 0).encode();
        Self {
            request,
            response: [0u32; MAX_PACKET_WORDS],
            request_size: 1,
            response_size: 1,
            transactions: Vec::new(),
        }
    }

    /// Append a read-class transaction.
    ///
    /// Reserves `nwords` response payload words. When `dest` is given the
    /// validator copies the received words into it; without a destination
    /// the data stays readable through [`ControlPacket::response_payload`].
    ///
    /// # Errors
    ///
    /// `Logic` for a non-read `kind`, a word count outside 1..=255, or a
    /// destination shorter than `nwords`; `PacketOverflow` when either
    /// buffer would exceed the MTU cap. A rejected call leaves the packet
    /// unchanged.
    pub fn add_read(
        &mut self,
        kind: TransactionType,
        address: u32,
        nwords: u8,
        dest: Option<&'buf mut [u32]>,
    ) -> Result<()> {
        if !kind.is_read() {
            return Err(IpbusError::Logic(format!(
                "{kind:?} is not a read transaction"
            )));
        }
        if nwords == 0 {
            return Err(IpbusError::Logic("read of zero words".into()));
        }
        if let Some(dest) = &dest {
            if dest.len() < usize::from(nwords) {
                return Err(IpbusError::Logic(format!(
                    "destination holds {} words, {} required",
                    dest.len(),
                    nwords
                )));
            }
        }
        self.check_capacity(2, 1 + usize::from(nwords))?;
        let mut txn = self.push_headers(kind, address, nwords);
        txn.destination = dest;
        self.response_size += usize::from(nwords);
        self.transactions.push(txn);
        Ok(())
    }

    /// Append a write-class transaction carrying `data`.
    ///
    /// # Errors
    ///
    /// `Logic` for a non-write `kind` or a payload outside 1..=255 words;
    /// `PacketOverflow` when the request would exceed the MTU cap.
    pub fn add_write(&mut self, kind: TransactionType, address: u32, data: &[u32]) -> Result<()> {
        if !kind.is_write() {
            return Err(IpbusError::Logic(format!(
                "{kind:?} is not a write transaction"
            )));
        }
        if data.is_empty() || data.len() > usize::from(u8::MAX) {
            return Err(IpbusError::Logic(format!(
                "write of {} words, 1..=255 supported",
                data.len()
            )));
        }
        self.check_capacity(2 + data.len(), 1)?;
        let txn = self.push_headers(kind, address, data.len() as u8);
        for &word in data {
            self.push_request(word);
        }
        self.transactions.push(txn);
        Ok(())
    }

    /// Append an atomic `new = (old & and_mask) | or_mask` transaction.
    ///
    /// The pre-modification value comes back as one response word,
    /// readable through [`ControlPacket::response_payload`].
    pub fn add_rmw_bits(&mut self, address: u32, and_mask: u32, or_mask: u32) -> Result<()> {
        self.check_capacity(4, 2)?;
        let txn = self.push_headers(TransactionType::RmwBits, address, 1);
        self.push_request(and_mask);
        self.push_request(or_mask);
        self.response_size += 1;
        self.transactions.push(txn);
        Ok(())
    }

    /// Append an atomic `new = old + addend` transaction.
    pub fn add_rmw_sum(&mut self, address: u32, addend: u32) -> Result<()> {
        self.check_capacity(3, 2)?;
        let txn = self.push_headers(TransactionType::RmwSum, address, 1);
        self.push_request(addend);
        self.response_size += 1;
        self.transactions.push(txn);
        Ok(())
    }

    /// Append a single-word write.
    pub fn add_word_write(&mut self, address: u32, value: u32) -> Result<()> {
        self.add_write(TransactionType::Write, address, &[value])
    }

    /// Append a transaction changing `nbits` bits at `shift` to `data`.
    ///
    /// A full 32-bit field becomes a plain write; anything narrower
    /// becomes an RMW-bits transaction with the masks derived from the
    /// field position.
    pub fn add_bit_change(&mut self, address: u32, data: u32, nbits: u8, shift: u8) -> Result<()> {
        if nbits == 0 || nbits > 32 {
            return Err(IpbusError::Logic(format!(
                "bit field of {nbits} bits, 1..=32 supported"
            )));
        }
        if nbits == 32 {
            return self.add_word_write(address, data);
        }
        if u32::from(nbits) + u32::from(shift) > 32 {
            return Err(IpbusError::Logic(format!(
                "bit field of {nbits} bits shifted by {shift} leaves the register"
            )));
        }
        let mask = (1u32 << nbits) - 1; // e.g. 0x00000FFF for nbits == 12
        self.add_rmw_bits(address, !(mask << shift), (data & mask) << shift)
    }

    /// Drop all transactions and restore both sizes to the bare header.
    ///
    /// Idempotent; the packet header word stays in place.
    pub fn reset(&mut self) {
        self.transactions.clear();
        self.request_size = 1;
        self.response_size = 1;
    }

    /// Whether the packet holds nothing but the packet header.
    pub fn is_empty(&self) -> bool {
        self.request_size <= 1
    }

    /// Current request size in words.
    pub fn request_size(&self) -> usize {
        self.request_size
    }

    /// Current response size in words: the reserved layout before an
    /// exchange, the received word count after one.
    pub fn response_size(&self) -> usize {
        self.response_size
    }

    /// Number of accumulated transactions.
    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// The populated request words.
    pub fn request_words(&self) -> &[u32] {
        &self.request[..self.request_size]
    }

    /// The populated response words.
    pub fn response_words(&self) -> &[u32] {
        &self.response[..self.response_size]
    }

    /// Response payload words of transaction `index`, clipped to what the
    /// target actually sent. Empty until a response is loaded.
    pub fn response_payload(&self, index: usize) -> Option<&[u32]> {
        let txn = self.transactions.get(index)?;
        let start = txn.response_payload_offset.min(self.response_size);
        let end = (txn.response_payload_offset + usize::from(txn.expected_words))
            .min(self.response_size);
        Some(&self.response[start..end])
    }

    /// Serialise the request as a little-endian datagram.
    pub fn request_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.request_size * WORD_SIZE);
        for &word in self.request_words() {
            buf.put_u32_le(word);
        }
        buf.freeze()
    }

    /// Store a received datagram as the response.
    ///
    /// Rejects datagrams that are empty, not a whole number of words,
    /// longer than the reserved response layout, or that echo a different
    /// packet header than the request carries. On success the response
    /// size becomes the received word count; the response may legitimately
    /// be shorter than reserved when a transaction failed at the target.
    pub fn load_response(&mut self, datagram: &[u8]) -> Result<()> {
        let len = datagram.len();
        let nwords = len / WORD_SIZE;
        if len == 0 || len % WORD_SIZE != 0 || nwords > self.response_size {
            return Err(IpbusError::Network(format!("incorrect response ({len} bytes)")));
        }
        let mut buf = datagram;
        for slot in self.response[..nwords].iter_mut() {
            *slot = buf.get_u32_le();
        }
        if self.response[0] != self.request[0] {
            return Err(IpbusError::Network(format!("incorrect response ({len} bytes)")));
        }
        self.response_size = nwords;
        Ok(())
    }

    /// Validate the loaded response against the accumulated transactions.
    ///
    /// Walks the transactions in request order: checks each response
    /// header (version, ID, type), copies read data to the registered
    /// destinations, and emits `ReadSucceeded`/`WriteSucceeded` per
    /// transaction. Stops at the first failure; later transactions are
    /// neither validated nor reported. A truncated read still copies the
    /// words that did arrive before failing, so the caller may inspect
    /// partial data.
    pub fn process_response(&mut self, signals: &SignalHub) -> Result<()> {
        let request = &self.request;
        let response = &self.response;
        let response_size = self.response_size;

        for (index, txn) in self.transactions.iter_mut().enumerate() {
            let raw = response[txn.response_header_offset];
            let header = TransactionHeader::decode(raw);
            if header.version != PROTOCOL_VERSION
                || usize::from(header.transaction_id) != index
                || header.type_id != txn.kind as u8
            {
                let expected = request[txn.request_header_offset] & 0xFFFF_FFF0;
                let message =
                    format!("unexpected transaction header: {raw:08X}, expected: {expected:08X}");
                signals.emit_error(&message, ErrorKind::Ipbus);
                return Err(IpbusError::Protocol(message));
            }

            let words = usize::from(header.words);
            if words > 0 {
                if txn.kind.is_read() {
                    let available = response_size.saturating_sub(txn.response_payload_offset);
                    let delivered = words.min(available);
                    if let Some(dest) = txn.destination.as_deref_mut() {
                        dest[..delivered].copy_from_slice(
                            &response[txn.response_payload_offset
                                ..txn.response_payload_offset + delivered],
                        );
                    }
                    signals.emit(Signal::ReadSucceeded {
                        words: delivered as u8,
                    });
                    if words > available && header.info_code == 0 {
                        // The target declared more words than it sent.
                        let message = format!(
                            "read transaction from {:08X} truncated: {}/{} words received",
                            txn.address, available, words
                        );
                        signals.emit_error(&message, ErrorKind::Ipbus);
                        return Err(IpbusError::Protocol(message));
                    }
                } else if txn.kind.is_rmw() {
                    if words != 1 {
                        let message = format!("malformed RMW transaction: {words} words in response");
                        signals.emit_error(&message, ErrorKind::Ipbus);
                        return Err(IpbusError::Protocol(message));
                    }
                    signals.emit(Signal::ReadSucceeded { words: 1 });
                    signals.emit(Signal::WriteSucceeded { words: 1 });
                } else {
                    signals.emit(Signal::WriteSucceeded { words: header.words });
                }
            }

            if header.info_code != 0 {
                let message = format!(
                    "{}, address: {:08X}",
                    info_code_str(header.info_code),
                    txn.address
                );
                signals.emit_error(&message, ErrorKind::Ipbus);
                return Err(IpbusError::Protocol(message));
            }
        }
        Ok(())
    }

    /// Hex dump of both word buffers, one word per line.
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::from("request:");
        for word in self.request_words() {
            let _ = write!(out, "\n  {word:08X}");
        }
        out.push_str("\nresponse:");
        for word in self.response_words() {
            let _ = write!(out, "\n  {word:08X}");
        }
        out
    }

    fn check_capacity(&self, request_words: usize, response_words: usize) -> Result<()> {
        if self.request_size + request_words > MAX_PACKET_WORDS
            || self.response_size + response_words > MAX_PACKET_WORDS
        {
            return Err(IpbusError::PacketOverflow);
        }
        Ok(())
    }

    /// Write the transaction header and address words, reserve the
    /// response header slot, and record all offsets. Capacity must have
    /// been checked by the caller.
    fn push_headers(&mut self, kind: TransactionType, address: u32, nwords: u8) -> Transaction<'buf> {
        let transaction_id = self.transactions.len() as u16;
        let request_header_offset = self.request_size;
        self.push_request(TransactionHeader::request(kind, nwords, transaction_id));
        self.push_request(address);
        let response_header_offset = self.response_size;
        self.response_size += 1;
        Transaction {
            kind,
            address,
            request_header_offset,
            response_header_offset,
            response_payload_offset: response_header_offset + 1,
            expected_words: nwords,
            destination: None,
        }
    }

    fn push_request(&mut self, word: u32) {
        self.request[self.request_size] = word;
        self.request_size += 1;
    }
}

impl Default for ControlPacket<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ControlPacket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPacket")
            .field("request_size", &self.request_size)
            .field("response_size", &self.response_size)
            .field("transactions", &self.transactions.len())
            .finish()
    }
}
