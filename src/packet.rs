//! Descriptors for the DEFLATE packets found in a damaged stream.
//!
//! The locator produces a chain of these (stream order); the corruption
//! detector annotates them; the decoder consumes them.

use std::io::{self, Read, Write};

use crate::deflate::PacketKind;

/// Which detector flagged a corrupted span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
    RepeatedBytes,
    LanguageModel,
    WordModel,
    WordLengthModel,
    DecodeFailure,
}

impl core::fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CorruptionKind::RepeatedBytes => write!(f, "repeated-byte run"),
            CorruptionKind::LanguageModel => write!(f, "language-model score drop"),
            CorruptionKind::WordModel => write!(f, "unknown-word ratio"),
            CorruptionKind::WordLengthModel => write!(f, "word-length distribution shift"),
            CorruptionKind::DecodeFailure => write!(f, "symbol decoding failure"),
        }
    }
}

/// One located packet, addressed in bits relative to the scanned window.
#[derive(Clone, Debug)]
pub struct PacketDescriptor {
    pub kind: PacketKind,
    /// First bit of the stream this packet belongs to.
    pub stream_start: usize,
    /// First bit of the packet header.
    pub bit_start: usize,
    /// One bit past the packet's final bit.
    pub bit_end: usize,
    pub is_last: bool,
    pub deflate64: bool,
    /// Offset of this packet's first output byte in the uncompressed data.
    pub uncompressed_offset: u64,
    pub uncompressed_size: u64,
    /// Corrupted byte range within the packet's compressed body, start > end
    /// when clean.
    pub corruption_start: u64,
    pub corruption_end: u64,
    /// The corruption extends to the end of the packet.
    pub corruption_end_unknown: bool,
    /// Which detector flagged the span, when one did.
    pub corruption_kind: Option<CorruptionKind>,
}

impl PacketDescriptor {
    pub fn new(
        kind: PacketKind,
        stream_start: usize,
        bit_start: usize,
        bit_end: usize,
        is_last: bool,
        deflate64: bool,
    ) -> PacketDescriptor {
        PacketDescriptor {
            kind,
            stream_start,
            bit_start,
            bit_end,
            is_last,
            deflate64,
            uncompressed_offset: 0,
            uncompressed_size: 0,
            corruption_start: 1,
            corruption_end: 0,
            corruption_end_unknown: false,
            corruption_kind: None,
        }
    }

    pub fn contains_corruption(&self) -> bool {
        self.corruption_end >= self.corruption_start
    }

    pub fn length_bits(&self) -> usize {
        self.bit_end.saturating_sub(self.bit_start)
    }

    pub fn is_uncompressed(&self) -> bool {
        self.kind == PacketKind::Uncompressed
    }

    /// Record a corrupted byte range, widening any existing one.
    pub fn update_corruption(&mut self, start: u64, end: u64) {
        if self.contains_corruption() {
            self.corruption_start = self.corruption_start.min(start);
            self.corruption_end = self.corruption_end.max(end);
        } else {
            self.corruption_start = start;
            self.corruption_end = end;
        }
    }

    pub fn clear_corruption(&mut self) {
        self.corruption_start = 1;
        self.corruption_end = 0;
        self.corruption_end_unknown = false;
        self.corruption_kind = None;
    }

    /// The packet lost its tail (corruption to end of packet).
    pub fn missing_end(&mut self) {
        self.corruption_end_unknown = true;
        let len = (self.length_bits() / 8) as u64;
        if !self.contains_corruption() {
            self.corruption_start = len;
        }
        self.corruption_end = len;
    }

    /// Chain uncompressed offsets along a packet list.
    pub fn set_uncompressed_offset(&mut self, prev: Option<&PacketDescriptor>) {
        self.uncompressed_offset = match prev {
            Some(p) => p.uncompressed_offset + p.uncompressed_size,
            None => 0,
        };
    }

    /// Debug/test persistence format: fixed little-endian fields followed by
    /// the bit pointers.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(&self.uncompressed_offset.to_le_bytes())?;
        out.write_all(&(self.uncompressed_size as u32).to_le_bytes())?;
        out.write_all(&(self.length_bits() as u32).to_le_bytes())?;
        out.write_all(&(self.corruption_start as u32).to_le_bytes())?;
        out.write_all(&(self.corruption_end as u32).to_le_bytes())?;
        out.write_all(&[self.is_last as u8, self.deflate64 as u8])?;
        out.write_all(&(self.stream_start as u64).to_le_bytes())?;
        out.write_all(&(self.bit_start as u64).to_le_bytes())?;
        out.write_all(&(self.bit_end as u64).to_le_bytes())?;
        let kind = match self.kind {
            PacketKind::Uncompressed => 0u8,
            PacketKind::FixedHuffman => 1,
            PacketKind::DynamicHuffman => 2,
            PacketKind::Invalid => 3,
        };
        out.write_all(&[kind])?;
        Ok(())
    }

    pub fn read_from<R: Read>(input: &mut R) -> io::Result<PacketDescriptor> {
        fn read_u64<R: Read>(input: &mut R) -> io::Result<u64> {
            let mut buf = [0u8; 8];
            input.read_exact(&mut buf)?;
            Ok(u64::from_le_bytes(buf))
        }
        fn read_u32<R: Read>(input: &mut R) -> io::Result<u32> {
            let mut buf = [0u8; 4];
            input.read_exact(&mut buf)?;
            Ok(u32::from_le_bytes(buf))
        }
        let uncompressed_offset = read_u64(input)?;
        let uncompressed_size = read_u32(input)? as u64;
        let _stream_len = read_u32(input)?;
        let corruption_start = read_u32(input)? as u64;
        let corruption_end = read_u32(input)? as u64;
        let mut flags = [0u8; 2];
        input.read_exact(&mut flags)?;
        let stream_start = read_u64(input)? as usize;
        let bit_start = read_u64(input)? as usize;
        let bit_end = read_u64(input)? as usize;
        let mut kind = [0u8; 1];
        input.read_exact(&mut kind)?;
        let kind = match kind[0] {
            0 => PacketKind::Uncompressed,
            1 => PacketKind::FixedHuffman,
            2 => PacketKind::DynamicHuffman,
            _ => PacketKind::Invalid,
        };
        Ok(PacketDescriptor {
            kind,
            stream_start,
            bit_start,
            bit_end,
            is_last: flags[0] != 0,
            deflate64: flags[1] != 0,
            uncompressed_offset,
            uncompressed_size,
            corruption_start,
            corruption_end,
            corruption_end_unknown: false,
            corruption_kind: None,
        })
    }
}

impl core::fmt::Display for PacketDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} packet at {}.{}..{}.{}{}",
            self.kind,
            self.bit_start / 8,
            self.bit_start % 8,
            self.bit_end / 8,
            self.bit_end % 8,
            if self.is_last { " (last)" } else { "" }
        )?;
        if self.contains_corruption() {
            write!(
                f,
                ", corrupt bytes {}..{}",
                self.corruption_start, self.corruption_end
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_tracking() {
        let mut p = PacketDescriptor::new(PacketKind::DynamicHuffman, 0, 0, 4096, false, false);
        assert!(!p.contains_corruption());
        p.update_corruption(100, 200);
        assert!(p.contains_corruption());
        p.update_corruption(50, 150);
        assert_eq!(p.corruption_start, 50);
        assert_eq!(p.corruption_end, 200);
        p.clear_corruption();
        assert!(!p.contains_corruption());
    }

    #[test]
    fn offsets_chain() {
        let mut a = PacketDescriptor::new(PacketKind::FixedHuffman, 0, 0, 100, false, false);
        a.uncompressed_size = 500;
        let mut b = PacketDescriptor::new(PacketKind::FixedHuffman, 0, 100, 200, true, false);
        b.set_uncompressed_offset(Some(&a));
        assert_eq!(b.uncompressed_offset, 500);
    }

    #[test]
    fn wire_format_round_trip() {
        let mut p = PacketDescriptor::new(PacketKind::DynamicHuffman, 3, 17, 9999, true, false);
        p.uncompressed_offset = 12345;
        p.uncompressed_size = 777;
        p.update_corruption(12, 90);
        let mut buf = Vec::new();
        p.write_to(&mut buf).unwrap();
        let q = PacketDescriptor::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(q.kind, p.kind);
        assert_eq!(q.bit_start, 17);
        assert_eq!(q.bit_end, 9999);
        assert!(q.is_last);
        assert_eq!(q.uncompressed_offset, 12345);
        assert_eq!(q.corruption_start, 12);
        assert_eq!(q.corruption_end, 90);
    }
}
