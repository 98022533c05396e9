//! Framer: splits a contiguous byte region into validated packet views.
//!
//! Parsing walks the region front to back and stops cleanly at the first
//! packet that is not fully present. Three outcomes are possible:
//!
//! - every byte belongs to an accepted packet: complete;
//! - the tail is a partial packet (or a later candidate fails validation
//!   after at least one packet was accepted): incomplete, benign;
//! - the very first candidate fails validation: [`FramingError::Corrupt`].
//!   No attempt is made to resynchronize on a guessed boundary.

use crate::pipeline::packet::{Packet, PacketHeader, RawBuffer, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Framing failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FramingError {
    /// No valid packet boundary at the start of the region.
    #[error("no valid packet at offset {offset}: {reason}")]
    Corrupt { offset: usize, reason: String },
}

/// Validation limits applied to every candidate packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramingLimits {
    /// Smallest acceptable `total_length`; never below [`HEADER_SIZE`].
    pub min_packet_size: u32,
    /// Largest acceptable `total_length`.
    pub max_packet_size: u32,
    /// `total_length` must be a multiple of this (1 disables the check).
    pub alignment: u32,
    /// Reject packets with reserved flag bits set.
    pub strict_flags: bool,
}

impl Default for FramingLimits {
    fn default() -> Self {
        Self {
            min_packet_size: HEADER_SIZE as u32,
            max_packet_size: 4096,
            alignment: 4,
            strict_flags: true,
        }
    }
}

impl FramingLimits {
    pub fn with_max_packet_size(mut self, max: u32) -> Self {
        self.max_packet_size = max;
        self
    }

    fn min(&self) -> u32 {
        self.min_packet_size.max(HEADER_SIZE as u32)
    }

    /// Length rules, applied to full headers and to a lone length field.
    fn check_length(&self, len: u32) -> Result<(), String> {
        if len < self.min() {
            return Err(format!("length {} below minimum {}", len, self.min()));
        }
        if len > self.max_packet_size {
            return Err(format!(
                "length {} above maximum {}",
                len, self.max_packet_size
            ));
        }
        if self.alignment > 1 && len % self.alignment != 0 {
            return Err(format!(
                "length {} not aligned to {}",
                len, self.alignment
            ));
        }
        Ok(())
    }

    /// Check one decoded header against the limits.
    fn check(&self, header: &PacketHeader) -> Result<(), String> {
        self.check_length(header.total_length)?;
        if self.strict_flags && header.flags.reserved_bits() != 0 {
            return Err(format!(
                "reserved flag bits 0x{:04x} set",
                header.flags.reserved_bits()
            ));
        }
        Ok(())
    }
}

/// Result of one framing pass.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    /// Accepted packets, in arrival order.
    pub packets: Vec<Packet>,
    /// Sum of accepted packets' declared lengths.
    pub consumed: usize,
    /// The region ends with bytes that do not form an accepted packet.
    pub incomplete: bool,
}

/// Stateless packet framer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Framer {
    limits: FramingLimits,
}

impl Framer {
    pub fn new(limits: FramingLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &FramingLimits {
        &self.limits
    }

    /// Frame `raw` into a fresh outcome.
    pub fn frame(&self, raw: &RawBuffer) -> Result<FrameOutcome, FramingError> {
        let mut outcome = FrameOutcome::default();
        self.frame_into(raw, &mut outcome.packets).map(|(consumed, incomplete)| {
            outcome.consumed = consumed;
            outcome.incomplete = incomplete;
            outcome
        })
    }

    /// Frame `raw`, appending accepted packets to `out`.
    ///
    /// Returns `(consumed, incomplete)`. `out` is left with whatever was
    /// accepted before an error, which is nothing for [`FramingError`].
    pub fn frame_into(
        &self,
        raw: &RawBuffer,
        out: &mut Vec<Packet>,
    ) -> Result<(usize, bool), FramingError> {
        let data: &[u8] = raw;
        let mut offset = 0usize;
        let mut accepted = 0usize;

        loop {
            let remaining = data.len() - offset;
            if remaining == 0 {
                return Ok((offset, false));
            }
            if remaining < HEADER_SIZE {
                // Can't even see a full header yet. A length field that is
                // already readable and breaks the length rules still counts
                // as corrupt when nothing was accepted.
                if accepted == 0 {
                    if let Some(len) = PacketHeader::peek_length(&data[offset..]) {
                        self.limits
                            .check_length(len)
                            .map_err(|reason| FramingError::Corrupt { offset, reason })?;
                    }
                }
                return Ok((offset, true));
            }

            // remaining >= HEADER_SIZE, decode cannot fail
            let Some(header) = PacketHeader::decode(&data[offset..]) else {
                return Ok((offset, true));
            };

            if let Err(reason) = self.limits.check(&header) {
                if accepted == 0 {
                    return Err(FramingError::Corrupt { offset, reason });
                }
                // Conservative: assume a straddling boundary, not corruption
                tracing::trace!(offset, %reason, "stopping at invalid candidate");
                return Ok((offset, true));
            }

            let len = header.total_length as usize;
            if len > remaining {
                return Ok((offset, true));
            }

            let view = raw.bytes().slice(offset..offset + len);
            out.push(Packet::from_validated(header, view));
            offset += len;
            accepted += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::packet::{write_packet, PacketFlags, PacketKind};
    use bytes::BytesMut;
    use proptest::prelude::*;

    fn stream(lengths: &[usize]) -> BytesMut {
        let mut buf = BytesMut::new();
        for (i, len) in lengths.iter().enumerate() {
            let header = PacketHeader::new(PacketKind(i as u16 % 3), 0).with_sequence(i as u32);
            write_packet(&mut buf, header, &vec![0xAB; len - HEADER_SIZE]);
        }
        buf
    }

    #[test]
    fn test_three_packets_complete() {
        let raw = RawBuffer::new(stream(&[24, 40, 16]).freeze());
        let outcome = Framer::default().frame(&raw).unwrap();
        assert_eq!(outcome.packets.len(), 3);
        assert_eq!(outcome.consumed, 80);
        assert!(!outcome.incomplete);
        let seqs: Vec<u32> = outcome.packets.iter().map(|p| p.sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_oversized_first_packet_is_corrupt() {
        let mut buf = BytesMut::new();
        PacketHeader::new(PacketKind(1), 9000 - HEADER_SIZE).encode(&mut buf);
        let raw = RawBuffer::new(buf.freeze());
        let framer = Framer::new(FramingLimits::default().with_max_packet_size(4096));
        match framer.frame(&raw) {
            Err(FramingError::Corrupt { offset, reason }) => {
                assert_eq!(offset, 0);
                assert!(reason.contains("9000"));
            }
            other => panic!("expected corrupt framing, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_later_packet_is_incomplete() {
        let mut buf = stream(&[24]);
        PacketHeader::new(PacketKind(1), 9000 - HEADER_SIZE).encode(&mut buf);
        let raw = RawBuffer::new(buf.freeze());
        let outcome = Framer::default().frame(&raw).unwrap();
        assert_eq!(outcome.packets.len(), 1);
        assert_eq!(outcome.consumed, 24);
        assert!(outcome.incomplete);
    }

    #[test]
    fn test_partial_header_is_incomplete() {
        let mut buf = stream(&[24]);
        buf.extend_from_slice(&[40, 0, 0, 0, 1, 0]);
        let outcome = Framer::default().frame(&RawBuffer::new(buf.freeze())).unwrap();
        assert_eq!(outcome.packets.len(), 1);
        assert_eq!(outcome.consumed, 24);
        assert!(outcome.incomplete);
    }

    #[test]
    fn test_partial_header_with_bad_length_is_corrupt() {
        let raw = RawBuffer::from(vec![0xFF, 0xFF, 0xFF, 0x7F, 0x00]);
        assert!(Framer::default().frame(&raw).is_err());
    }

    #[test]
    fn test_partial_header_with_misaligned_length_is_corrupt() {
        let raw = RawBuffer::from(vec![18, 0, 0, 0, 1, 0]);
        match Framer::default().frame(&raw) {
            Err(FramingError::Corrupt { offset, reason }) => {
                assert_eq!(offset, 0);
                assert!(reason.contains("not aligned"));
            }
            other => panic!("expected corrupt framing, got {:?}", other),
        }

        let relaxed = FramingLimits {
            alignment: 1,
            ..Default::default()
        };
        let outcome = Framer::new(relaxed).frame(&raw).unwrap();
        assert_eq!(outcome.consumed, 0);
        assert!(outcome.incomplete);

        let aligned = RawBuffer::from(vec![20, 0, 0, 0, 1, 0]);
        assert!(Framer::default().frame(&aligned).unwrap().incomplete);
    }

    #[test]
    fn test_empty_region() {
        let outcome = Framer::default().frame(&RawBuffer::default()).unwrap();
        assert!(outcome.packets.is_empty());
        assert_eq!(outcome.consumed, 0);
        assert!(!outcome.incomplete);
    }

    #[test]
    fn test_zero_length_is_corrupt() {
        let raw = RawBuffer::from(vec![0u8; 32]);
        assert!(matches!(
            Framer::default().frame(&raw),
            Err(FramingError::Corrupt { offset: 0, .. })
        ));
    }

    #[test]
    fn test_misaligned_length_is_corrupt() {
        let mut buf = BytesMut::new();
        write_packet(&mut buf, PacketHeader::new(PacketKind(1), 0), &[0u8; 5]);
        let raw = RawBuffer::new(buf.freeze());
        assert!(Framer::default().frame(&raw).is_err());

        let relaxed = FramingLimits {
            alignment: 1,
            ..Default::default()
        };
        let outcome = Framer::new(relaxed).frame(&raw).unwrap();
        assert_eq!(outcome.consumed, 21);
    }

    #[test]
    fn test_reserved_flags() {
        let mut buf = BytesMut::new();
        let header = PacketHeader::new(PacketKind(1), 0).with_flags(PacketFlags(0x8000));
        write_packet(&mut buf, header, &[0u8; 8]);
        let raw = RawBuffer::new(buf.freeze());
        assert!(Framer::default().frame(&raw).is_err());

        let lenient = FramingLimits {
            strict_flags: false,
            ..Default::default()
        };
        assert_eq!(Framer::new(lenient).frame(&raw).unwrap().packets.len(), 1);
    }

    #[test]
    fn test_packets_are_views() {
        let raw = RawBuffer::new(stream(&[24, 40]).freeze());
        let outcome = Framer::default().frame(&raw).unwrap();
        let base = raw.as_ptr();
        assert_eq!(outcome.packets[0].as_bytes().as_ptr(), base);
        assert_eq!(outcome.packets[1].as_bytes().as_ptr(), base.wrapping_add(24));
    }

    proptest! {
        #[test]
        fn test_truncated_tail_never_consumed(
            sizes in prop::collection::vec(4usize..64, 1..20),
            cut in 1usize..64
        ) {
            let lengths: Vec<usize> = sizes.iter().map(|s| HEADER_SIZE + s * 4).collect();
            let full = stream(&lengths);
            let last = *lengths.last().unwrap();
            let cut = cut.min(last - 1);
            let truncated = full.len() - cut;
            let raw = RawBuffer::new(full.freeze().slice(0..truncated));

            let outcome = Framer::default().frame(&raw).unwrap();
            let expected: usize = lengths[..lengths.len() - 1].iter().sum();
            prop_assert_eq!(outcome.packets.len(), lengths.len() - 1);
            prop_assert_eq!(outcome.consumed, expected);
            prop_assert!(outcome.incomplete);
        }

        #[test]
        fn test_framer_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Framer::default().frame(&RawBuffer::from(bytes));
        }
    }
}
