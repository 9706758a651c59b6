//! Detects corruption hiding inside otherwise well-formed packets.
//!
//! Three independent signals, combined with OR semantics: long runs of one
//! byte value in the compressed stream (an unreadable sector, typically
//! zero- or 0xFF-filled), a collapse of the language-identification score
//! over a sliding window of decoded output, and a spike in the fraction of
//! decoded words missing from the word model. A ring of checkpoints bounds
//! how far the damage can reach back once a detector fires.

use std::collections::VecDeque;

use crate::bits::BitCursor;
use crate::deflate::{PacketKind, END_OF_DATA, PACKET_HEADER_BITS, REFERENCE_WINDOW,
    REFERENCE_WINDOW_64};
use crate::models::pstrie::PackedTrie;
use crate::models::words::{is_whitespace, is_word_boundary, WordLengthModel};
use crate::packet::{CorruptionKind, PacketDescriptor};
use crate::symtab::SymbolTable;

/// Minimum run of identical bytes in the compressed stream to declare a
/// corrupt region.
const MIN_REPETITIONS: usize = 128;

const LANGIDENT_WINDOW: usize = 256;
const LANGIDENT_WINDOW_SLIDE: usize = 128;

const WORDMODEL_WINDOW: usize = 512;
const WORDMODEL_WINDOW_SLIDE: usize = 64;

const LENMODEL_WINDOW: usize = 512;
const LENMODEL_WINDOW_SLIDE: usize = 128;

/// How far the best language score may fall relative to the previous window
/// before corruption is declared.
const LANGID_THRESHOLD: f64 = 0.2;

/// Fraction of unknown words that triggers the word-model detector.
const WORDMODEL_THRESHOLD: f64 = 0.4;

/// Word-length-distribution similarity below which corruption is declared.
const LENMODEL_THRESHOLD: f64 = 0.8;

/// Placeholder for bytes whose value is not yet known.
const UNKNOWN_BYTE: u8 = 0x7F;

/// Scores a window of text against a set of language models. Language
/// identification itself lives outside this crate; recovery only needs the
/// best score.
pub trait LanguageScorer {
    fn best_score(&self, text: &[u8]) -> f64;
}

/// External signals available to the detector.
#[derive(Default)]
pub struct DetectorContext<'a> {
    pub language: Option<&'a dyn LanguageScorer>,
    pub word_model: Option<&'a PackedTrie>,
    pub use_length_model: bool,
}

impl<'a> DetectorContext<'a> {
    pub fn is_empty(&self) -> bool {
        self.language.is_none() && self.word_model.is_none() && !self.use_length_model
    }
}

/// Ring of cursors saved every window slide; rewinding to the oldest bounds
/// the corrupted region.
struct CheckPoints<'a> {
    ring: VecDeque<BitCursor<'a>>,
    capacity: usize,
}

impl<'a> CheckPoints<'a> {
    fn new(start: BitCursor<'a>, capacity: usize) -> CheckPoints<'a> {
        let mut ring = VecDeque::with_capacity(capacity.max(1));
        ring.push_back(start);
        CheckPoints {
            ring,
            capacity: capacity.max(1),
        }
    }

    fn add(&mut self, checkpoint: BitCursor<'a>) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(checkpoint);
    }

    fn oldest(&self) -> BitCursor<'a> {
        *self.ring.front().unwrap()
    }
}

/// Keeps the tail of the decoded output so the windowed detectors can see
/// recent text without the caller holding the whole file.
struct TailWindow {
    data: Vec<u8>,
    keep: usize,
}

impl TailWindow {
    fn new(keep: usize) -> TailWindow {
        TailWindow {
            data: Vec::new(),
            keep,
        }
    }

    fn push(&mut self, byte: u8) {
        self.data.push(byte);
        if self.data.len() > 2 * self.keep {
            let cut = self.data.len() - self.keep;
            self.data.drain(..cut);
        }
    }

    fn copy_reference(&mut self, length: usize, distance: usize) {
        for _ in 0..length {
            let byte = if distance <= self.data.len() {
                self.data[self.data.len() - distance]
            } else {
                UNKNOWN_BYTE
            };
            self.push(byte);
        }
    }

    /// Copy the most recent `n` bytes into `out` (padded with the unknown
    /// placeholder when fewer are available).
    fn tail(&self, out: &mut [u8]) {
        let n = out.len();
        let have = self.data.len().min(n);
        for slot in out.iter_mut().take(n - have) {
            *slot = UNKNOWN_BYTE;
        }
        out[n - have..].copy_from_slice(&self.data[self.data.len() - have..]);
    }
}

fn corrupted_language(
    tail: &TailWindow,
    scorer: &dyn LanguageScorer,
    prev_best: &mut Option<f64>,
) -> bool {
    let mut text = [0u8; LANGIDENT_WINDOW];
    tail.tail(&mut text);
    let score = scorer.best_score(&text);
    let corrupted = match *prev_best {
        Some(prev) => score < LANGID_THRESHOLD * prev,
        None => false,
    };
    *prev_best = Some(score);
    corrupted
}

fn corrupted_words(tail: &TailWindow, word_model: &PackedTrie) -> bool {
    let mut text = [0u8; WORDMODEL_WINDOW + 1];
    // sentinel so the first real byte can terminate a partial word
    text[0] = b'a';
    let len = text.len();
    tail.tail(&mut text[1..len]);
    // skip the potentially-partial first word
    let mut pos = 1;
    while pos < text.len() && !is_word_boundary(&text, pos) {
        pos += 1;
    }
    let mut prev_word = pos;
    let mut known = 0usize;
    let mut unknown = 0usize;
    while pos + 1 < text.len() {
        pos += 1;
        if !is_word_boundary(&text, pos) {
            continue;
        }
        if !is_whitespace(&text, prev_word, pos)
            && !text[prev_word..pos].contains(&UNKNOWN_BYTE)
            && pos - prev_word > 1
        {
            match word_model.find(&text[prev_word..pos]) {
                Some(freq) if freq != 0 && freq != u32::MAX => known += 1,
                _ => unknown += 1,
            }
        }
        prev_word = pos;
    }
    let total = known + unknown;
    total >= 8 && unknown as f64 / total as f64 >= WORDMODEL_THRESHOLD
}

fn corrupted_word_lengths(tail: &TailWindow, running: &mut WordLengthModel) -> bool {
    let mut text = [0u8; LENMODEL_WINDOW];
    tail.tail(&mut text);
    let mut current = WordLengthModel::new();
    current.add_words(&text);
    let mut corrupted = false;
    if running.total_count() > 4.0 * running.max_length() as f64 && current.total_count() > 0.0 {
        corrupted = running.similarity(&current) < LENMODEL_THRESHOLD;
    }
    running.scale(0.75);
    running.combine(&current);
    corrupted
}

/// Decode the packet body while sliding the configured detector over the
/// output. On detection, records the corrupted compressed-byte range on the
/// descriptor and returns false. Always records the decoded output size.
fn check_compressed_packet(
    window: &[u8],
    packet: &mut PacketDescriptor,
    ctx: &DetectorContext<'_>,
    tail: &mut TailWindow,
    previous_corruption: bool,
) -> bool {
    let mut cursor = BitCursor::at_bit(window, packet.bit_start);
    let end = BitCursor::at_bit(window, packet.bit_end);
    let header = cursor.next_bits(PACKET_HEADER_BITS);
    let _ = header;
    let symtab = match packet.kind {
        PacketKind::Invalid => return false,
        PacketKind::Uncompressed => {
            cursor.advance_to_byte();
            packet.uncompressed_size = cursor.get_bits(16) as u64;
            return true;
        }
        PacketKind::FixedHuffman => SymbolTable::fixed(packet.deflate64),
        PacketKind::DynamicHuffman => match SymbolTable::parse(&mut cursor, &end, packet.deflate64)
        {
            Ok(t) => t,
            Err(_) => return false,
        },
    };

    // an internal packet ends on an exact bit; only the last one may
    // carry padding after its end-of-data marker
    let mut end_byte = end;
    if packet.is_last {
        end_byte.retreat(7);
    }

    // pick the active windowed detector; the word model is too likely to
    // give a false positive right after corruption in an earlier packet
    let (mut highwater, slide, checkpoints_len) = if ctx.language.is_some() {
        (
            LANGIDENT_WINDOW as u64,
            LANGIDENT_WINDOW_SLIDE as u64,
            LANGIDENT_WINDOW / LANGIDENT_WINDOW_SLIDE,
        )
    } else if ctx.word_model.is_some() {
        (
            if previous_corruption {
                u64::MAX
            } else {
                WORDMODEL_WINDOW as u64
            },
            WORDMODEL_WINDOW_SLIDE as u64,
            WORDMODEL_WINDOW / WORDMODEL_WINDOW_SLIDE,
        )
    } else {
        (
            LENMODEL_WINDOW as u64,
            LENMODEL_WINDOW_SLIDE as u64,
            LENMODEL_WINDOW / LENMODEL_WINDOW_SLIDE,
        )
    };

    let mut checkpoints = CheckPoints::new(cursor, checkpoints_len);
    let mut prev_best: Option<f64> = None;
    let mut running_lengths = WordLengthModel::new();
    let mut offset = 0u64;
    let mut correct = false;
    let mut detector_window = 0u64;
    let mut kind = CorruptionKind::DecodeFailure;

    while cursor < end {
        let before = cursor;
        let symbol = match symtab.next_symbol(&mut cursor, &end) {
            Ok(s) => s,
            Err(_) => {
                cursor = before;
                correct = false;
                break;
            }
        };
        if symbol == END_OF_DATA {
            if !(cursor >= end_byte && cursor <= end) {
                correct = false;
            }
            break;
        }
        correct = true;
        if symbol > END_OF_DATA {
            let length = symtab.length(symbol, &mut cursor);
            let distance = symtab.distance(&mut cursor, &end);
            match (length, distance) {
                (Some(len), Some(dist))
                    if (dist as u64) <= offset + packet.uncompressed_offset =>
                {
                    tail.copy_reference(len as usize, dist as usize);
                    offset += len as u64;
                }
                _ => {
                    offset += 1;
                    cursor = before;
                    correct = false;
                    break;
                }
            }
        } else {
            tail.push(symbol as u8);
            offset += 1;
        }
        if offset >= highwater {
            highwater = offset + slide;
            let (fired, which, size) = if let Some(scorer) = ctx.language {
                (
                    corrupted_language(tail, scorer, &mut prev_best),
                    CorruptionKind::LanguageModel,
                    (LANGIDENT_WINDOW + LANGIDENT_WINDOW_SLIDE) as u64,
                )
            } else if let Some(words) = ctx.word_model {
                (
                    corrupted_words(tail, words),
                    CorruptionKind::WordModel,
                    (WORDMODEL_WINDOW + WORDMODEL_WINDOW_SLIDE) as u64,
                )
            } else if ctx.use_length_model {
                (
                    corrupted_word_lengths(tail, &mut running_lengths),
                    CorruptionKind::WordLengthModel,
                    (LENMODEL_WINDOW + LENMODEL_WINDOW_SLIDE) as u64,
                )
            } else {
                (false, CorruptionKind::DecodeFailure, 0)
            };
            if fired {
                kind = which;
                detector_window = size;
                correct = false;
                break;
            }
            checkpoints.add(cursor);
        }
    }
    packet.uncompressed_size = offset;

    if !correct {
        // rewind to the oldest checkpoint to bound the damaged region
        let rewound = if detector_window > 0 {
            checkpoints.oldest()
        } else {
            cursor
        };
        let start_byte = BitCursor::at_bit(window, packet.bit_start)
            .bytes_to(&rewound)
            .saturating_sub(1) as u64;
        let size = if detector_window > 0 { detector_window } else { 1 };
        packet.update_corruption(start_byte, start_byte + size);
        if packet.corruption_kind.is_none() {
            packet.corruption_kind = Some(kind);
        }
    }
    correct
}

/// Scan every packet for repeated-byte runs, then decode each one under the
/// windowed detectors. Returns true when any packet carries corruption.
pub fn locate_corrupt_segments(
    window: &[u8],
    packets: &mut [PacketDescriptor],
    ctx: &DetectorContext<'_>,
) -> bool {
    let mut corruption_found = false;
    let refwindow = if packets.iter().any(|p| p.deflate64) {
        REFERENCE_WINDOW_64
    } else {
        REFERENCE_WINDOW
    };
    let mut tail = TailWindow::new(refwindow);
    for i in 0..packets.len() {
        if i > 0 {
            let (head, rest) = packets.split_at_mut(i);
            rest[0].set_uncompressed_offset(head.last());
        }
        let packet = &mut packets[i];
        if packet.is_uncompressed() {
            let mut cursor = BitCursor::at_bit(window, packet.bit_start);
            cursor.advance(PACKET_HEADER_BITS);
            cursor.advance_to_byte();
            let size = cursor.next_bits(16) as usize;
            cursor.advance(16);
            packet.uncompressed_size = size as u64;
            for _ in 0..size.min(cursor.bytes_to(&BitCursor::at_end(window))) {
                tail.push(cursor.next_bits(8) as u8);
            }
            continue;
        }

        // long runs of one byte value are unreadable sectors, not data
        let body_start = packet.bit_start / 8;
        let body_end = (packet.bit_end / 8).min(window.len());
        let body = &window[body_start..body_end];
        let mut p = 0usize;
        while p + MIN_REPETITIONS < body.len() {
            if body[p] != body[p + 1] {
                p += 1;
                continue;
            }
            let mut count = 1;
            while p + count < body.len() && body[p] == body[p + count] {
                count += 1;
            }
            if count >= MIN_REPETITIONS {
                packet.update_corruption(p as u64, (p + count) as u64);
                packet.corruption_kind = Some(CorruptionKind::RepeatedBytes);
            }
            p += count;
        }

        check_compressed_packet(window, packet, ctx, &mut tail, corruption_found);
        if packet.contains_corruption() {
            corruption_found = true;
        }
    }
    corruption_found
}
