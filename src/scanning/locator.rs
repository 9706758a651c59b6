//! Segments a byte window into a chain of DEFLATE packets.
//!
//! The locator works backwards from a known stream end: each accepted packet
//! start becomes the end bound for the next search. A forward splitter
//! handles the opposite case, a known stream start whose end is uncertain.

use crate::bits::BitCursor;
use crate::deflate::{header_is_last, PacketKind, END_OF_DATA, MIN_PACKET_SIZE_BITS,
    PACKET_HEADER_BITS};
use crate::packet::PacketDescriptor;
use crate::scanning::validator::{classify_packet, valid_packet_header};
use crate::symtab::{default_tables, SymbolTable};

/// Upper bound on the compressed size of a single packet considered while
/// scanning backwards.
pub const MAX_PACKET_SIZE: usize = 2 * 1024 * 1024;

/// Find a packet start by sliding one bit at a time from `from` back toward
/// `stream_start`, asking the validator to confirm a packet that ends at
/// `end`.
fn find_packet_start(
    from: &BitCursor<'_>,
    stream_start: &BitCursor<'_>,
    end: &BitCursor<'_>,
    want_final: bool,
    exact_bit: bool,
    deflate64: bool,
) -> Option<(usize, PacketKind)> {
    let mut lower = *stream_start;
    if stream_start.bytes_to(end) > MAX_PACKET_SIZE {
        lower = *end;
        lower.retreat(8 * MAX_PACKET_SIZE);
    }
    let mut pos = *from;
    loop {
        if pos < lower {
            return None;
        }
        if let Some(kind) = classify_packet(&pos, stream_start, end, want_final, exact_bit, deflate64)
        {
            let mut found = pos;
            // an uncompressed packet starting in the very first byte of the
            // stream scans as starting at bit 5; snap it back to the byte
            if kind == PacketKind::Uncompressed && found.byte_index() == stream_start.byte_index()
            {
                found.retreat_to_byte();
            }
            return Some((found.bit_offset(), kind));
        }
        match pos.checked_retreat(1) {
            Some(p) => pos = p,
            None => return None,
        }
    }
}

/// Scan backwards from `end_bit` and segment `window` into packets. The
/// returned chain is in stream order; only its terminal packet may carry the
/// last flag.
pub fn locate_packets(
    window: &[u8],
    start_bit: usize,
    end_bit: usize,
    deflate64: bool,
) -> Vec<PacketDescriptor> {
    let stream_start = BitCursor::at_bit(window, start_bit);
    let mut packets: Vec<PacketDescriptor> = Vec::new();
    let mut curr_end = BitCursor::at_bit(window, end_bit);
    let mut str_pos = curr_end;
    let mut exact_bit = false;

    while str_pos > stream_start {
        str_pos.retreat(MIN_PACKET_SIZE_BITS);
        let (found_bit, kind) = match find_packet_start(
            &str_pos,
            &stream_start,
            &curr_end,
            packets.is_empty(),
            exact_bit,
            deflate64,
        ) {
            Some(hit) => hit,
            None => break,
        };
        // the header of a non-final uncompressed packet is 000 and its
        // byte-alignment padding is also zeros, so the boundary with the
        // preceding packet is ambiguous: allow its EOD check to test
        // several bit positions
        exact_bit = kind != PacketKind::Uncompressed || packets.is_empty();
        let desc = PacketDescriptor::new(
            kind,
            start_bit,
            found_bit,
            curr_end.bit_offset(),
            packets.is_empty(),
            deflate64,
        );
        packets.push(desc);
        str_pos = BitCursor::at_bit(window, found_bit);
        curr_end = str_pos;
    }
    packets.reverse();
    packets
}

/// Skip over a stored packet: align, check the size fields, jump the
/// payload.
fn advance_over_literal_packet(
    cursor: &mut BitCursor<'_>,
    end: &BitCursor<'_>,
    offset: &mut u64,
) -> bool {
    cursor.advance_to_byte();
    if !cursor.in_bounds(end, 32) {
        return false;
    }
    let size1 = cursor.next_bits(16);
    let size2 = cursor.next_bits(16);
    if (size1 ^ size2) != 0xFFFF {
        return false;
    }
    if cursor.bytes_to(end) < size1 as usize {
        return false;
    }
    cursor.advance_bytes(size1 as usize);
    *offset += size1 as u64;
    true
}

/// Walk a compressed packet symbol by symbol until its end-of-data code.
fn advance_over_packet(
    symtab: &SymbolTable,
    cursor: &mut BitCursor<'_>,
    end: &BitCursor<'_>,
    offset: &mut u64,
) -> bool {
    if symtab.eod().is_empty() {
        return false;
    }
    while *cursor < *end {
        let symbol = match symtab.next_symbol(cursor, end) {
            Ok(s) => s,
            Err(_) => return false,
        };
        if symbol == END_OF_DATA {
            return true;
        }
        if symbol > END_OF_DATA {
            let length = match symtab.length(symbol, cursor) {
                Some(l) => l,
                None => return false,
            };
            let distance = match symtab.distance(cursor, end) {
                Some(d) => d,
                None => return false,
            };
            if distance as u64 > *offset {
                return false;
            }
            *offset += length as u64;
        } else {
            *offset += 1;
        }
    }
    false
}

/// Brute-force forward scan for the next believable packet header.
fn skip_to_valid_packet(cursor: &mut BitCursor<'_>, end: &BitCursor<'_>, deflate64: bool) -> bool {
    while *cursor < *end {
        if valid_packet_header(cursor, deflate64, false) {
            return true;
        }
        cursor.advance(1);
    }
    false
}

/// Walk forward from a known packet start and split the region into
/// packets. On a mid-packet failure the affected packet is marked as losing
/// its end and the scan resynchronizes bit by bit.
pub fn split_into_packets(
    window: &[u8],
    start_bit: usize,
    end_bit: usize,
    deflate64: bool,
) -> Vec<PacketDescriptor> {
    let end = BitCursor::at_bit(window, end_bit);
    let mut cursor = BitCursor::at_bit(window, start_bit);
    let mut packets = Vec::new();
    let mut offset = 0u64;

    while cursor < end {
        let packet_start = cursor.bit_offset();
        let header = cursor.next_bits(PACKET_HEADER_BITS);
        let is_last = header_is_last(header);
        let kind = PacketKind::from_header(header);
        let ok = match kind {
            PacketKind::Invalid => false,
            PacketKind::Uncompressed => advance_over_literal_packet(&mut cursor, &end, &mut offset),
            PacketKind::FixedHuffman => {
                advance_over_packet(default_tables(deflate64), &mut cursor, &end, &mut offset)
            }
            PacketKind::DynamicHuffman => match SymbolTable::parse(&mut cursor, &end, deflate64) {
                Ok(symtab) => advance_over_packet(&symtab, &mut cursor, &end, &mut offset),
                Err(_) => false,
            },
        };
        if ok {
            let mut desc =
                PacketDescriptor::new(kind, start_bit, packet_start, cursor.bit_offset(), is_last,
                    deflate64);
            desc.uncompressed_offset = 0;
            packets.push(desc);
            if is_last {
                break;
            }
        } else {
            // mid-packet failure: close off the broken packet at the point
            // where a plausible header resumes
            let found = skip_to_valid_packet(&mut cursor, &end, deflate64);
            let mut desc = PacketDescriptor::new(
                kind,
                start_bit,
                packet_start,
                cursor.bit_offset(),
                false,
                deflate64,
            );
            desc.missing_end();
            packets.push(desc);
            if !found {
                break;
            }
        }
    }
    packets
}
