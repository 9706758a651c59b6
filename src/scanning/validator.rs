//! Verifies whether a candidate bit offset starts a well-formed packet.
//!
//! A candidate is only accepted after the whole packet validates: header
//! consistency, Huffman tree construction, an end-of-data code aligned with
//! the packet end, and a successful symbolic walk over every symbol in
//! between.

use crate::bits::BitCursor;
use crate::deflate::{
    header_is_last, PacketKind, END_OF_DATA, MAX_UNCOMP_PACKET_BYTES, MIN_FIXED_SCAN_BITS,
    PACKET_HEADER_BITS,
};
use crate::symtab::{default_tables, SymbolTable};

/// Probe length for the quick fixed-Huffman header check, in bits.
const FIXED_PROBE_BITS: usize = 800;

/// Tree-data allowance for the quick dynamic header check, in bits.
const DYNAMIC_PROBE_BITS: usize = 4000;

/// Check the stored-packet frame: byte-aligned 16-bit size and one's
/// complement, optionally requiring the payload to fill the rest of the
/// window exactly.
fn valid_literal_packet(pos: &BitCursor<'_>, end: &BitCursor<'_>, full_size: bool) -> bool {
    if full_size && pos.bytes_to(end) > MAX_UNCOMP_PACKET_BYTES {
        return false;
    }
    let mut start = *pos;
    start.advance(PACKET_HEADER_BITS);
    start.advance_to_byte();
    if !start.in_bounds(end, 32) {
        return false;
    }
    let size1 = start.next_bits(16);
    let size2 = start.next_bits(16);
    // size2 must be the one's complement of size1; a zero-length packet is
    // unusual but legal (zlib flush points, pigz alignment)
    if (size1 ^ size2) != 0xFFFF {
        return false;
    }
    if full_size && start.bytes_to(end) != size1 as usize {
        return false;
    }
    true
}

/// Walk every symbol of a compressed packet body. Returns `true` when the
/// walk reaches an end-of-data code positioned at the packet end (within the
/// final byte when `exact_end` is false) and decoded at least one byte.
fn check_compressed_stream(
    symtab: &SymbolTable,
    cursor: &mut BitCursor<'_>,
    end: &BitCursor<'_>,
    exact_end: bool,
    start_of_stream: bool,
) -> bool {
    let mut end_byte = *end;
    if !exact_end {
        end_byte.retreat(7);
    }
    let mut nonempty = false;
    let mut output_len = 0u64;
    while *cursor < *end {
        let symbol = match symtab.next_symbol(cursor, end) {
            Ok(s) => s,
            Err(_) => return false,
        };
        if symbol == END_OF_DATA {
            // an end-of-data anywhere but the end of the packet is an error
            return nonempty && *cursor >= end_byte && *cursor <= *end;
        }
        nonempty = true;
        if symbol > END_OF_DATA {
            let length = match symtab.length(symbol, cursor) {
                Some(l) => l,
                None => return false,
            };
            let distance = match symtab.distance(cursor, end) {
                Some(d) => d,
                None => return false,
            };
            if start_of_stream && distance as u64 > output_len {
                // reference prior to the start of the original file
                return false;
            }
            output_len += length as u64;
        } else {
            output_len += 1;
        }
    }
    false
}

/// Check a candidate compressed packet: the final symbol must be the
/// end-of-data code, then the whole body must decode.
fn valid_compressed_packet(
    symtab: &SymbolTable,
    pos: &BitCursor<'_>,
    end: &BitCursor<'_>,
    exact_end: bool,
    start_of_stream: bool,
) -> bool {
    let eod = symtab.eod();
    if eod.is_empty() {
        return false;
    }
    // cheap test first: does an end-of-data code end the packet?
    let have_eod = if exact_end {
        let mut tail = *end;
        tail.prev_bits_reversed(eod.length()) == eod.value()
    } else {
        (0..8).any(|i| {
            let mut tail = *end;
            tail.retreat(i);
            tail.prev_bits_reversed(eod.length()) == eod.value()
        })
    };
    if !have_eod {
        return false;
    }
    let mut cursor = *pos;
    check_compressed_stream(symtab, &mut cursor, end, exact_end, start_of_stream)
}

/// Quick probe used when resynchronizing: decode up to 100 bytes with the
/// fixed tables and reject anything inconsistent with a stream start.
fn valid_fixed_packet(pos: &BitCursor<'_>, deflate64: bool) -> bool {
    let symtab = default_tables(deflate64);
    let mut cursor = *pos;
    let window_end = BitCursor::at_end(pos.source());
    let mut end = *pos;
    end.advance(FIXED_PROBE_BITS);
    let end = end.min(window_end);
    let mut num_bytes = 0u64;
    while cursor < end {
        let symbol = match symtab.next_symbol(&mut cursor, &end) {
            Ok(s) => s,
            Err(_) => break,
        };
        if symbol == END_OF_DATA {
            return num_bytes > 0;
        }
        if symbol > END_OF_DATA {
            let length = match symtab.length(symbol, &mut cursor) {
                Some(l) => l,
                None => return false,
            };
            let distance = match symtab.distance(&mut cursor, &end) {
                Some(d) => d,
                None => return false,
            };
            // empty back-references make no sense, and at a stream start a
            // reference cannot reach before the first byte
            if distance as u64 > num_bytes {
                return false;
            }
            num_bytes += length as u64;
        } else {
            num_bytes += 1;
        }
    }
    true
}

/// Fast header plausibility check at a byte-aligned position, used by the
/// forward splitter when resynchronizing.
pub fn valid_packet_header(pos: &BitCursor<'_>, deflate64: bool, allow_fixed: bool) -> bool {
    let header = pos.get_bits(PACKET_HEADER_BITS);
    let window_end = BitCursor::at_end(pos.source());
    match PacketKind::from_header(header) {
        PacketKind::Uncompressed => valid_literal_packet(pos, &window_end, false),
        PacketKind::FixedHuffman => {
            // no fast way to rule these out, so probe if they are allowed
            if !allow_fixed {
                return false;
            }
            let mut body = *pos;
            body.advance(PACKET_HEADER_BITS);
            valid_fixed_packet(&body, deflate64)
        }
        PacketKind::DynamicHuffman => {
            let mut body = *pos;
            body.advance(PACKET_HEADER_BITS);
            let mut probe_end = body;
            probe_end.advance(DYNAMIC_PROBE_BITS);
            let probe_end = probe_end.min(window_end);
            SymbolTable::parse(&mut body, &probe_end, deflate64).is_ok()
        }
        PacketKind::Invalid => false,
    }
}

/// Classify the candidate bit offset `pos` as the start of a packet ending
/// exactly at `end`. `want_final` selects whether the last-packet flag must
/// be set; `exact_bit` relaxes the end-of-data position check by up to seven
/// padding bits.
pub fn classify_packet(
    pos: &BitCursor<'_>,
    stream_start: &BitCursor<'_>,
    end: &BitCursor<'_>,
    want_final: bool,
    exact_bit: bool,
    deflate64: bool,
) -> Option<PacketKind> {
    let header = pos.get_bits(PACKET_HEADER_BITS);
    let is_last = header_is_last(header);
    // only the terminal packet may carry the last flag
    if want_final != is_last {
        return None;
    }
    let kind = PacketKind::from_header(header);
    let start_of_stream = pos == stream_start;
    match kind {
        PacketKind::Invalid => None,
        PacketKind::Uncompressed => {
            if valid_literal_packet(pos, end, true) {
                Some(PacketKind::Uncompressed)
            } else {
                None
            }
        }
        PacketKind::FixedHuffman => {
            // ignore fixed-tree packets unless they cover enough bits to
            // keep the false-positive rate down, or span the whole stream
            if pos.bits_to(end) < MIN_FIXED_SCAN_BITS && (!is_last || !start_of_stream) {
                return None;
            }
            let mut body = *pos;
            body.advance(PACKET_HEADER_BITS);
            let symtab = default_tables(deflate64);
            if valid_compressed_packet(symtab, &body, end, exact_bit, start_of_stream) {
                Some(PacketKind::FixedHuffman)
            } else {
                None
            }
        }
        PacketKind::DynamicHuffman => {
            let mut body = *pos;
            body.advance(PACKET_HEADER_BITS);
            let symtab = match SymbolTable::parse(&mut body, end, deflate64) {
                Ok(t) => t,
                Err(_) => return None,
            };
            if valid_compressed_packet(&symtab, &body, end, exact_bit, start_of_stream) {
                Some(PacketKind::DynamicHuffman)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitCursor;

    // stored packet: header 001 (last, uncompressed), pad to byte,
    // size=5, ~size, then "Hello"
    const STORED: [u8; 10] = [0x01, 0x05, 0x00, 0xFA, 0xFF, b'H', b'e', b'l', b'l', b'o'];

    #[test]
    fn stored_packet_classifies() {
        let pos = BitCursor::new(&STORED);
        let end = BitCursor::at_end(&STORED);
        assert_eq!(
            classify_packet(&pos, &pos, &end, true, true, false),
            Some(PacketKind::Uncompressed)
        );
        // wrong finality
        assert_eq!(classify_packet(&pos, &pos, &end, false, true, false), None);
    }

    #[test]
    fn stored_packet_size_mismatch_rejected() {
        let mut bad = STORED;
        bad[3] = 0x00; // break the complement
        let pos = BitCursor::new(&bad);
        let end = BitCursor::at_end(&bad);
        assert_eq!(classify_packet(&pos, &pos, &end, true, true, false), None);
    }

    #[test]
    fn quick_header_check_accepts_stored() {
        let pos = BitCursor::new(&STORED);
        assert!(valid_packet_header(&pos, false, true));
    }

    #[test]
    fn fixed_packet_classifies_at_stream_start() {
        // "aaaa" under fixed codes: header 011, 4 x 'a' (10010001), EOD 0000000
        let mut bits: Vec<bool> = Vec::new();
        bits.push(true); // last
        bits.push(true); // type 01 read LSB-first
        bits.push(false);
        for _ in 0..4 {
            for i in (0..8).rev() {
                bits.push((0b1001_0001u32 >> i) & 1 != 0);
            }
        }
        for _ in 0..7 {
            bits.push(false);
        }
        let mut data = vec![0u8; (bits.len() + 7) / 8];
        for (i, b) in bits.iter().enumerate() {
            if *b {
                data[i / 8] |= 1 << (i % 8);
            }
        }
        let pos = BitCursor::new(&data);
        let mut end = pos;
        end.advance(bits.len());
        assert_eq!(
            classify_packet(&pos, &pos, &end, true, true, false),
            Some(PacketKind::FixedHuffman)
        );
    }
}
