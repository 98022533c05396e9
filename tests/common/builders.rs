//! Test data builders for packet streams

use bytes::BytesMut;
use pktflow::pipeline::{write_packet, PacketFlags, PacketHeader, PacketKind, RawBuffer, HEADER_SIZE};

/// Builder for a contiguous stream of well-formed packets
#[derive(Default)]
pub struct StreamBuilder {
    buf: BytesMut,
    sequence: u32,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a packet of `total_length` bytes
    pub fn packet(self, kind: u16, total_length: usize) -> Self {
        self.packet_with(kind, total_length, 0, PacketFlags::default())
    }

    pub fn packet_with(mut self, kind: u16, total_length: usize, routing_id: u32, flags: PacketFlags) -> Self {
        assert!(total_length >= HEADER_SIZE);
        let header = PacketHeader::new(PacketKind(kind), 0)
            .with_routing_id(routing_id)
            .with_flags(flags)
            .with_sequence(self.sequence);
        let payload: Vec<u8> = (0..total_length - HEADER_SIZE).map(|i| i as u8).collect();
        write_packet(&mut self.buf, header, &payload);
        self.sequence += 1;
        self
    }

    /// Append packets of the given total lengths, all of `kind`
    pub fn packets(mut self, kind: u16, lengths: &[usize]) -> Self {
        for len in lengths {
            self = self.packet(kind, *len);
        }
        self
    }

    /// Append raw bytes, e.g. a truncated packet
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn build(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    pub fn build_raw(self) -> RawBuffer {
        RawBuffer::new(self.buf.freeze())
    }
}

/// A header declaring `total_length` with no payload behind it
pub fn header_only(kind: u16, total_length: usize) -> Vec<u8> {
    let mut buf = BytesMut::new();
    PacketHeader::new(PacketKind(kind), total_length - HEADER_SIZE).encode(&mut buf);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_builder() {
        let stream = StreamBuilder::new().packets(1, &[24, 40]).build();
        assert_eq!(stream.len(), 64);
        assert_eq!(&stream[0..4], &24u32.to_le_bytes());
    }
}
