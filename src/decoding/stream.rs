//! Drives decompression over a located packet chain, skipping corrupted
//! spans and resynchronizing the bitstream afterwards.

use std::collections::BTreeSet;

use crate::bits::BitCursor;
use crate::decoding::decodebuffer::{DecodeBuffer, CONFIDENCE_LEVELS, CONFIDENCE_UNKNOWN};
use crate::deflate::{PacketKind, END_OF_DATA, MAX_CODE_EXTENSION_BITS, PACKET_HEADER_BITS};
use crate::packet::PacketDescriptor;
use crate::partial::search::longest_suffix_with_trees;
use crate::symtab::SymbolTable;

/// Notice appended when the stream ends without a final packet.
const TRUNCATION_BANNER: &[u8] = b"\n\n\
    *******************************************\n\
    ***                                     ***\n\
    ***      End of Compressed Stream       ***\n\
    ***                                     ***\n\
    *******************************************\n\n";

/// Decode symbols until end-of-data. Returns `true` when the packet ends
/// cleanly with its EOD at the expected position.
fn decompress_body(
    symtab: &SymbolTable,
    cursor: &mut BitCursor<'_>,
    end: &BitCursor<'_>,
    buffer: &mut DecodeBuffer,
    start_of_stream: bool,
    exact_end: bool,
) -> bool {
    let mut saw_eod = false;
    while *cursor < *end {
        let code = match symtab.next_value(cursor, end) {
            Ok(c) => c,
            Err(_) => return false,
        };
        if code < END_OF_DATA {
            buffer.push_literal(code as u8, CONFIDENCE_LEVELS);
        } else if code == END_OF_DATA {
            saw_eod = true;
            break;
        } else {
            let length = match symtab.length(code, cursor) {
                Some(l) => l,
                None => return false,
            };
            let distance = match symtab.distance(cursor, end) {
                Some(d) => d,
                None => return false,
            };
            if start_of_stream && distance as u64 > buffer.len() as u64 {
                // reference prior to the start of the original file
                return false;
            }
            if buffer.copy_reference(length, distance).is_err() {
                return false;
            }
        }
    }
    if !saw_eod {
        return false;
    }
    if !exact_end {
        cursor.advance_to_byte();
        return *cursor == *end;
    }
    true
}

/// Find where decoding reconverges after a corrupted span when the packet's
/// trees are known: walk a candidate set of bit offsets, advancing the
/// earliest by one symbol at a time, until a single position remains.
pub fn resynchronize(
    window: &[u8],
    start_bit: usize,
    end_bit: usize,
    symtab: &SymbolTable,
) -> usize {
    // the longest possible code is two maximal Huffman codes plus maximal
    // length and distance extra bits
    let num_positions = MAX_CODE_EXTENSION_BITS;
    let mut positions: BTreeSet<usize> = (0..num_positions)
        .map(|i| start_bit + i)
        .filter(|&b| b < end_bit)
        .collect();
    let end = BitCursor::at_bit(window, end_bit);
    while positions.len() > 1 {
        let earliest = *positions.iter().next().unwrap();
        positions.remove(&earliest);
        let mut cursor = BitCursor::at_bit(window, earliest);
        if symtab.advance(&mut cursor, &end) && cursor.bit_offset() < end_bit {
            positions.insert(cursor.bit_offset());
        }
    }
    positions.into_iter().next().unwrap_or(end_bit)
}

/// Decode one packet, handling an annotated corruption span: decode up to
/// the span, emit a discontinuity, then resume at the resynchronization
/// point with the same trees.
fn decompress_packet(
    window: &[u8],
    packet: &PacketDescriptor,
    buffer: &mut DecodeBuffer,
    known_start: bool,
    reconstruct_partial: bool,
) -> bool {
    let mut cursor = BitCursor::at_bit(window, packet.bit_start);
    let mut end = BitCursor::at_bit(window, packet.bit_end);
    if packet.contains_corruption() {
        let mut stop = BitCursor::at_bit(window, packet.bit_start);
        stop.advance_to_byte();
        stop.advance_bytes(packet.corruption_start as usize);
        end = end.min(stop);
    }
    let header = cursor.next_bits(PACKET_HEADER_BITS);
    let _ = header;
    let exact_end = !packet.is_last;
    let start_of_stream = known_start && packet.bit_start == packet.stream_start;

    let symtab = match packet.kind {
        PacketKind::Invalid => None,
        PacketKind::Uncompressed => {
            cursor.advance_to_byte();
            let size1 = cursor.next_bits(16);
            let size2 = cursor.next_bits(16);
            let full_end = BitCursor::at_bit(window, packet.bit_end);
            if (size1 ^ size2) == 0xFFFF {
                let take = (size1 as usize).min(cursor.bytes_to(&full_end));
                for _ in 0..take {
                    buffer.push_literal(cursor.next_bits(8) as u8, CONFIDENCE_LEVELS);
                }
                return true;
            }
            return false;
        }
        PacketKind::FixedHuffman => Some(SymbolTable::fixed(packet.deflate64)),
        PacketKind::DynamicHuffman => {
            SymbolTable::parse(&mut cursor, &end, packet.deflate64).ok()
        }
    };
    let symtab = match symtab {
        Some(t) => t,
        None => {
            buffer.push_discontinuity(buffer.reference_window(), false);
            return false;
        }
    };

    let mut success = decompress_body(
        &symtab,
        &mut cursor,
        &end,
        buffer,
        start_of_stream,
        exact_end || packet.contains_corruption(),
    );
    if packet.contains_corruption() {
        success = false;
    }

    if !success {
        let clear = packet.uncompressed_offset > 0;
        buffer.push_discontinuity(buffer.reference_window(), clear);

        // resume past the corrupted span using the trees from the packet
        // header
        let mut resume = BitCursor::at_bit(window, packet.bit_start);
        resume.advance_to_byte();
        resume.advance_bytes(packet.corruption_end as usize);
        let resume = resume.max(cursor);
        if resume < BitCursor::at_bit(window, packet.bit_end) {
            let resync_bit = if reconstruct_partial {
                longest_suffix_with_trees(window, resume.bit_offset(), packet.bit_end, &symtab)
                    .unwrap_or(packet.bit_end)
            } else {
                resynchronize(window, resume.bit_offset(), packet.bit_end, &symtab)
            };
            if resync_bit < packet.bit_end {
                let mut tail_cursor = BitCursor::at_bit(window, resync_bit);
                let tail_end = BitCursor::at_bit(window, packet.bit_end);
                decompress_body(
                    &symtab,
                    &mut tail_cursor,
                    &tail_end,
                    buffer,
                    false,
                    exact_end,
                );
            }
        }
    }
    success
}

/// Decode an entire packet chain into the buffer. Returns `true` when every
/// packet decoded cleanly.
pub fn decompress_packets(
    window: &[u8],
    packets: &[PacketDescriptor],
    buffer: &mut DecodeBuffer,
    known_start: bool,
    reconstruct_partial: bool,
) -> bool {
    if !known_start {
        // the prefix of the stream is missing, reserve a window so early
        // back-references stay addressable
        buffer.push_discontinuity(buffer.reference_window(), false);
    }
    let mut success = true;
    let mut hit_last = false;
    for packet in packets {
        if !decompress_packet(window, packet, buffer, known_start, reconstruct_partial) {
            success = false;
        }
        hit_last = packet.is_last;
    }
    if !hit_last {
        buffer.push_string(TRUNCATION_BANNER, CONFIDENCE_UNKNOWN);
    }
    success
}
