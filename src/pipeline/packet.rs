//! Zero-copy packet views over immutable raw buffers.
//!
//! A [`RawBuffer`] is a published, immutable byte region. A [`Packet`] is a
//! cheap view (`Bytes` slice) into one, so forwarding a packet never copies
//! payload bytes.
//!
//! # Wire layout
//!
//! Every packet starts with a 16 byte little-endian header:
//!
//! ```text
//!  0               4       6       8               12              16
//! +---------------+-------+-------+---------------+---------------+----------
//! | total_length  | kind  | flags | routing_id    | sequence      | payload
//! +---------------+-------+-------+---------------+---------------+----------
//! ```
//!
//! `total_length` includes the header itself.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Message kind discriminator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketKind(pub u16);

impl fmt::Debug for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketKind(0x{:04x})", self.0)
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl From<u16> for PacketKind {
    fn from(value: u16) -> Self {
        PacketKind(value)
    }
}

/// Per-packet flag bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PacketFlags(pub u16);

impl PacketFlags {
    /// High priority handling requested by the sender.
    pub const PRIORITY: PacketFlags = PacketFlags(0x0001);
    /// Sender detected an error while producing this packet.
    pub const ERROR: PacketFlags = PacketFlags(0x0002);
    /// Packet was produced by a transform stage, not by the source.
    pub const DERIVED: PacketFlags = PacketFlags(0x0004);

    /// Bits with a defined meaning. Everything else must be zero on the wire.
    pub const KNOWN: u16 = 0x0007;

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    #[inline]
    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn with(self, other: PacketFlags) -> Self {
        PacketFlags(self.0 | other.0)
    }

    /// Reserved bits that are set.
    #[inline]
    pub fn reserved_bits(self) -> u16 {
        self.0 & !Self::KNOWN
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketFlags(0x{:04x})", self.0)
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub total_length: u32,
    pub kind: PacketKind,
    pub flags: PacketFlags,
    pub routing_id: u32,
    pub sequence: u32,
}

impl PacketHeader {
    /// Header for a packet carrying `payload_len` bytes of payload.
    pub fn new(kind: PacketKind, payload_len: usize) -> Self {
        Self {
            total_length: (HEADER_SIZE + payload_len) as u32,
            kind,
            flags: PacketFlags::empty(),
            routing_id: 0,
            sequence: 0,
        }
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_routing_id(mut self, routing_id: u32) -> Self {
        self.routing_id = routing_id;
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// Read only the length field. `None` when fewer than 4 bytes are given.
    #[inline]
    pub fn peek_length(data: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = data.get(0..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Decode a header. `None` when fewer than [`HEADER_SIZE`] bytes are given.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([data[i], data[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        Some(Self {
            total_length: u32_at(0),
            kind: PacketKind(u16_at(4)),
            flags: PacketFlags(u16_at(6)),
            routing_id: u32_at(8),
            sequence: u32_at(12),
        })
    }

    /// Append the encoded header to `out`.
    pub fn encode(&self, out: &mut impl BufMut) {
        out.put_u32_le(self.total_length);
        out.put_u16_le(self.kind.0);
        out.put_u16_le(self.flags.0);
        out.put_u32_le(self.routing_id);
        out.put_u32_le(self.sequence);
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.total_length as usize).saturating_sub(HEADER_SIZE)
    }
}

/// Immutable byte region packets are sliced from.
///
/// Cloning is a reference count increment; the bytes are never mutated once
/// a `RawBuffer` exists.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RawBuffer(Bytes);

impl RawBuffer {
    pub fn new(bytes: Bytes) -> Self {
        RawBuffer(bytes)
    }

    /// Publish storage owned by someone else (e.g. a pooled scratch buffer).
    /// The owner is dropped once the last view into it goes away.
    pub fn from_owner<T>(owner: T) -> Self
    where
        T: AsRef<[u8]> + Send + 'static,
    {
        RawBuffer(Bytes::from_owner(owner))
    }

    pub fn from_static(bytes: &'static [u8]) -> Self {
        RawBuffer(Bytes::from_static(bytes))
    }

    /// Zero-copy sub-view.
    pub fn slice(&self, range: std::ops::Range<usize>) -> RawBuffer {
        RawBuffer(self.0.slice(range))
    }

    pub fn bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Deref for RawBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for RawBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for RawBuffer {
    fn from(bytes: Bytes) -> Self {
        RawBuffer(bytes)
    }
}

impl From<Vec<u8>> for RawBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        RawBuffer(Bytes::from(bytes))
    }
}

impl fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBuffer").field("len", &self.0.len()).finish()
    }
}

/// One validated packet: decoded header plus a view of its full wire bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    data: Bytes,
}

impl Packet {
    /// Build a view over `data`, which must hold exactly one packet whose
    /// header has already been validated by the framer.
    pub(crate) fn from_validated(header: PacketHeader, data: Bytes) -> Self {
        debug_assert_eq!(header.total_length as usize, data.len());
        Self { header, data }
    }

    /// Encode a standalone packet into freshly allocated storage.
    pub fn encode(header: PacketHeader, payload: &[u8]) -> Packet {
        let mut header = header;
        header.total_length = (HEADER_SIZE + payload.len()) as u32;
        let mut buf = BytesMut::with_capacity(header.total_length as usize);
        header.encode(&mut buf);
        buf.put_slice(payload);
        Packet {
            header,
            data: buf.freeze(),
        }
    }

    #[inline]
    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    #[inline]
    pub fn kind(&self) -> PacketKind {
        self.header.kind
    }

    #[inline]
    pub fn flags(&self) -> PacketFlags {
        self.header.flags
    }

    #[inline]
    pub fn routing_id(&self) -> u32 {
        self.header.routing_id
    }

    #[inline]
    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    /// Declared total length, header included.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false for a validated packet; provided for API symmetry.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Full wire bytes (header + payload).
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Payload bytes only.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[HEADER_SIZE..]
    }

    /// Shared handle to the wire bytes; no copy.
    pub fn to_bytes(&self) -> Bytes {
        self.data.clone()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("kind", &self.header.kind)
            .field("len", &self.data.len())
            .field("routing_id", &self.header.routing_id)
            .field("sequence", &self.header.sequence)
            .finish()
    }
}

/// Append one encoded packet to `out`. Returns the packet's total length.
pub fn write_packet(out: &mut impl BufMut, header: PacketHeader, payload: &[u8]) -> usize {
    let mut header = header;
    header.total_length = (HEADER_SIZE + payload.len()) as u32;
    header.encode(out);
    out.put_slice(payload);
    header.total_length as usize
}
