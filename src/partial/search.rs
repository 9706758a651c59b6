//! Reconstruction of a packet whose header is missing: a best-/breadth-
//! first search over joint (literal, distance) tree hypotheses, walking
//! backwards from a presumed end-of-data marker.

use crate::bits::BitCursor;
use crate::deflate::{DIST_CODE_BITS, DIST_CODE_OFFSET, END_OF_DATA, LENGTH_CODE_OFFSET};
use crate::partial::hypothesis::Hypothesis;
use crate::partial::queue::{HypothesisDirectory, SearchMode, SearchQueue, DEFAULT_MAX_SEARCH};
use crate::partial::tree_hypothesis::{
    canonicalize, TreeDirectory, TreeHypothesis, EXTRA_LITERAL, EXTRA_MAXLEN, MAX_BITLENGTH,
    MIN_DIST_BITS, MIN_LIT_BITS,
};
use crate::symtab::SymbolTable;

/// Keep no un-extendable stream shorter than this.
pub const KEEP_NONE_THRESHOLD: u32 = 1024;

/// Keep every consistent stream at least this long.
pub const KEEP_ALL_THRESHOLD: u32 = 16384;

/// Below the keep-all threshold, retain only this many of the longest.
pub const MAX_LONGEST: usize = 100;

/// Emit a progress tick this often (attempted expansions).
pub const EXPANSION_REPORT_INTERVAL: u64 = 1_000_000;

/// Candidate end-of-data code lengths: EOD is one of the two longest codes
/// of a valid packet; seven is included because a fixed-Huffman tree
/// extended upward may place it there.
const EOD_LENGTHS: core::ops::RangeInclusive<usize> = 7..=15;

const MAX_DIST_EXTRA: u8 = 13;
const MAX_DIST_EXTRA_64: u8 = 14;

pub struct SearchConfig {
    pub mode: SearchMode,
    pub capacity: usize,
    pub keep_none_threshold: u32,
    pub keep_all_threshold: u32,
    pub max_longest: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            mode: SearchMode::BreadthFirst,
            capacity: DEFAULT_MAX_SEARCH,
            keep_none_threshold: KEEP_NONE_THRESHOLD,
            keep_all_threshold: KEEP_ALL_THRESHOLD,
            max_longest: MAX_LONGEST,
        }
    }
}

/// One decoded item of a reconstructed packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketEvent {
    /// A literal whose byte value is unknown; all occurrences of the same
    /// class hold the same value.
    UnknownLiteral { class: u16 },
    /// A back-reference with concrete length and distance.
    Match { length: u32, distance: u32 },
}

/// The winning reconstruction of a headerless packet.
pub struct RecoveredPacket {
    /// First bit of the recovered suffix.
    pub start_bit: usize,
    pub end_bit: usize,
    pub bit_count: u32,
    /// Number of distinct unknown-literal classes.
    pub literal_classes: u16,
    pub events: Vec<PacketEvent>,
}

struct Retained {
    longest: Vec<Hypothesis>,
    keep_none: u32,
    keep_all: u32,
    max_longest: usize,
}

impl Retained {
    fn new(config: &SearchConfig) -> Retained {
        Retained {
            longest: Vec::new(),
            keep_none: config.keep_none_threshold,
            keep_all: config.keep_all_threshold,
            max_longest: config.max_longest,
        }
    }

    fn retire(&mut self, hyp: Hypothesis) {
        if hyp.bit_count < self.keep_none {
            return;
        }
        self.longest.push(hyp);
        if self.longest.len() > 8 * self.max_longest {
            self.prune();
        }
    }

    fn prune(&mut self) {
        self.longest.sort_by(|a, b| b.bit_count.cmp(&a.bit_count));
        let keep_all = self.keep_all;
        let above = self.longest.iter().filter(|h| h.bit_count >= keep_all).count();
        self.longest.truncate(above.max(self.max_longest));
    }

    fn best(mut self) -> Option<Hypothesis> {
        self.prune();
        self.longest.into_iter().next()
    }
}

struct Searcher<'a> {
    window: &'a [u8],
    start_bit: usize,
    end_bit: usize,
    deflate64: bool,
    trees: TreeDirectory,
    queue: SearchQueue,
    directory: HypothesisDirectory,
    retained: Retained,
    expansions: u64,
}

impl<'a> Searcher<'a> {
    /// Read the code of `len` bits ending at `end` (exclusive), in Huffman
    /// code order.
    fn read_code(&self, end: usize, len: usize) -> Option<u32> {
        let start = end.checked_sub(len)?;
        if start < self.start_bit {
            return None;
        }
        Some(BitCursor::at_bit(self.window, start).get_bits_reversed(len))
    }

    fn max_dist_extra(&self) -> u8 {
        if self.deflate64 {
            MAX_DIST_EXTRA_64
        } else {
            MAX_DIST_EXTRA
        }
    }

    /// Bits a length-code class consumes beyond the code itself.
    fn length_class_bits(&self, class: u8) -> usize {
        if class == EXTRA_MAXLEN {
            if self.deflate64 {
                16
            } else {
                0
            }
        } else {
            class as usize
        }
    }

    fn offer(&mut self, hyp: Hypothesis) {
        if self.directory.admit(&hyp) {
            self.queue.push(hyp);
        }
    }

    /// Generate every legal backward extension. Returns how many were
    /// produced.
    fn extend(&mut self, hyp: &Hypothesis) -> usize {
        let mut produced = 0;
        if hyp.in_backref {
            // the distance code is in hand; the item before it must be the
            // matching length code, with its extra bits in between
            let classes: &[u8] = &[0, 1, 2, 3, 4, 5, EXTRA_MAXLEN];
            for &class in classes {
                let extra_bits = self.length_class_bits(class);
                for len in hyp.lit.min_length()..=hyp.lit.max_length() {
                    let total = extra_bits + len;
                    let code_end = match hyp.bit_pos.checked_sub(extra_bits) {
                        Some(e) => e,
                        None => continue,
                    };
                    let code = match self.read_code(code_end, len) {
                        Some(c) => c,
                        None => continue,
                    };
                    if let Some(tree) = hyp.lit.insert(code, len, class, false) {
                        let mut next = hyp.clone();
                        next.lit = self.trees.intern(tree);
                        next.bit_pos -= total;
                        next.bit_count += total as u32;
                        next.in_backref = false;
                        next.last_literal = 0;
                        next.last_literal_len = 0;
                        next.last_literal_repeat = 0;
                        produced += 1;
                        self.offer(next);
                    }
                }
            }
            return produced;
        }

        // a literal code directly before the suffix
        for len in hyp.lit.min_length()..=hyp.lit.max_length() {
            let code = match self.read_code(hyp.bit_pos, len) {
                Some(c) => c,
                None => continue,
            };
            let canon = canonicalize(code, len);
            if hyp.excessive_repeats(canon, len as u8) {
                continue;
            }
            if let Some(tree) = hyp.lit.insert(code, len, EXTRA_LITERAL, false) {
                let mut next = hyp.clone();
                next.lit = self.trees.intern(tree);
                next.bit_pos -= len;
                next.bit_count += len as u32;
                if next.last_literal == canon && next.last_literal_len == len as u8 {
                    next.last_literal_repeat += 1;
                } else {
                    next.last_literal = canon;
                    next.last_literal_len = len as u8;
                    next.last_literal_repeat = 1;
                }
                produced += 1;
                self.offer(next);
            }
        }

        // or the tail of a back-reference: distance extra bits preceded by
        // the distance code
        for class in 0..=self.max_dist_extra() {
            let extra_bits = class as usize;
            for len in hyp.dist.min_length()..=hyp.dist.max_length() {
                let total = extra_bits + len;
                let code_end = match hyp.bit_pos.checked_sub(extra_bits) {
                    Some(e) => e,
                    None => continue,
                };
                let code = match self.read_code(code_end, len) {
                    Some(c) => c,
                    None => continue,
                };
                if let Some(tree) = hyp.dist.insert(code, len, class, false) {
                    let mut next = hyp.clone();
                    next.dist = self.trees.intern(tree);
                    next.bit_pos -= total;
                    next.bit_count += total as u32;
                    next.in_backref = true;
                    produced += 1;
                    self.offer(next);
                }
            }
        }
        produced
    }

    fn seed(&mut self) {
        for eod_len in EOD_LENGTHS {
            if self.end_bit < self.start_bit + eod_len {
                continue;
            }
            let code = match self.read_code(self.end_bit, eod_len) {
                Some(c) => c,
                None => continue,
            };
            // codes one longer than the end-of-data code may still exist
            let max_lit = (eod_len + 1).min(MAX_BITLENGTH);
            let lit = TreeHypothesis::empty(false, self.deflate64, MIN_LIT_BITS, max_lit);
            let lit = match lit.insert(code, eod_len, 0, true) {
                Some(t) => t,
                None => continue,
            };
            let dist =
                TreeHypothesis::empty(true, self.deflate64, MIN_DIST_BITS, MAX_BITLENGTH);
            let hyp = Hypothesis::seed(
                self.trees.intern(lit),
                self.trees.intern(dist),
                self.end_bit - eod_len,
                eod_len as u32,
            );
            self.offer(hyp);
        }
    }

    fn run(mut self, tick: Option<&dyn Fn(u64)>) -> Option<Hypothesis> {
        self.seed();
        while let Some(hyp) = self.queue.pop() {
            self.expansions += 1;
            if self.expansions % EXPANSION_REPORT_INTERVAL == 0 {
                if let Some(tick) = tick {
                    tick(self.expansions);
                }
            }
            let produced = if hyp.bit_pos > self.start_bit {
                self.extend(&hyp)
            } else {
                0
            };
            if produced == 0 {
                self.retained.retire(hyp);
            }
        }
        self.retained.best()
    }
}

/// Search `window[start_bit..end_bit]` for the longest suffix consistent
/// with some pair of Huffman trees whose final symbol is end-of-data.
pub fn search_partial_packet(
    window: &[u8],
    start_bit: usize,
    end_bit: usize,
    deflate64: bool,
    config: &SearchConfig,
    tick: Option<&dyn Fn(u64)>,
) -> Option<RecoveredPacket> {
    let searcher = Searcher {
        window,
        start_bit,
        end_bit,
        deflate64,
        trees: TreeDirectory::new(),
        queue: SearchQueue::new(config.mode, config.capacity),
        directory: HypothesisDirectory::new(),
        retained: Retained::new(config),
        expansions: 0,
    };
    let best = searcher.run(tick)?;
    decode_hypothesis(window, end_bit, &best, deflate64)
}

/// First symbol of each extra-bit class in the length alphabet.
fn length_class_base(class: u8) -> u16 {
    match class {
        0 => 257,
        1 => 265,
        2 => 269,
        3 => 273,
        4 => 277,
        5 => 281,
        _ => 285,
    }
}

fn length_class_size(class: u8) -> u16 {
    match class {
        0 => 8,
        1..=5 => 4,
        _ => 1,
    }
}

/// Map each code of the winning tree to a concrete symbol: within a class,
/// canonical rank picks consecutive class symbols. Literal codes become
/// unknown-byte classes instead.
fn assign_symbols(tree: &TreeHypothesis, is_distance: bool) -> Vec<Option<u16>> {
    let mut class_rank = [0u16; 17];
    let mut literal_class = 0u16;
    tree.codes()
        .iter()
        .map(|entry| {
            if entry.is_eod {
                Some(END_OF_DATA)
            } else if entry.extra == EXTRA_LITERAL {
                let class = literal_class;
                literal_class += 1;
                // literal classes are reported through the event stream
                Some(0x8000 | class)
            } else {
                let class = entry.extra.min(16) as usize;
                let rank = class_rank[class];
                class_rank[class] += 1;
                if is_distance {
                    let symbol = if entry.extra == 0 {
                        rank
                    } else {
                        2 * entry.extra as u16 + 2 + rank
                    };
                    if symbol < 32 {
                        Some(symbol)
                    } else {
                        None
                    }
                } else if rank < length_class_size(entry.extra) {
                    Some(length_class_base(entry.extra) + rank)
                } else {
                    None
                }
            }
        })
        .collect()
}

/// Forward-decode the recovered suffix with the hypothesis trees.
fn decode_hypothesis(
    window: &[u8],
    end_bit: usize,
    best: &Hypothesis,
    deflate64: bool,
) -> Option<RecoveredPacket> {
    let lit_symbols = assign_symbols(&best.lit, false);
    let dist_symbols = assign_symbols(&best.dist, true);
    let find = |tree: &TreeHypothesis, canon: u32, len: usize| -> Option<usize> {
        tree.codes()
            .iter()
            .position(|e| e.canon == canon && e.len as usize == len)
    };

    let mut events = Vec::new();
    let mut cursor = BitCursor::at_bit(window, best.bit_pos);
    let end = BitCursor::at_bit(window, end_bit);
    let mut literal_classes = 0u16;
    loop {
        // decode one literal/length code by extending the prefix bitwise
        let mut code = 0u32;
        let mut len = 0usize;
        let mut idx = None;
        while len < MAX_BITLENGTH {
            if !cursor.in_bounds(&end, 1) {
                return None;
            }
            code = (code << 1) | cursor.next_bit();
            len += 1;
            if let Some(i) = find(&best.lit, canonicalize(code, len), len) {
                idx = Some(i);
                break;
            }
        }
        let idx = idx?;
        let entry = best.lit.codes()[idx];
        let symbol = lit_symbols[idx]?;
        if entry.is_eod {
            break;
        }
        if symbol & 0x8000 != 0 {
            let class = symbol & 0x7FFF;
            literal_classes = literal_classes.max(class + 1);
            events.push(PacketEvent::UnknownLiteral { class });
            continue;
        }
        // a length code: extra bits then the distance code
        let length = match symbol {
            257..=264 => symbol as u32 - 254,
            265..=284 => {
                let code = symbol as u32 - 261;
                let hi = code & 3;
                let bucket = code >> 2;
                let extra = cursor.next_bits(bucket as usize);
                LENGTH_CODE_OFFSET[bucket as usize] + ((hi << bucket) | extra)
            }
            285 => {
                if deflate64 {
                    3 + cursor.next_bits(16)
                } else {
                    258
                }
            }
            _ => return None,
        };
        let mut dcode = 0u32;
        let mut dlen = 0usize;
        let mut didx = None;
        while dlen < MAX_BITLENGTH {
            if !cursor.in_bounds(&end, 1) {
                return None;
            }
            dcode = (dcode << 1) | cursor.next_bit();
            dlen += 1;
            if let Some(i) = find(&best.dist, canonicalize(dcode, dlen), dlen) {
                didx = Some(i);
                break;
            }
        }
        let dsym = dist_symbols[didx?]? as usize;
        let distance = if dsym < 4 {
            DIST_CODE_OFFSET[dsym]
        } else {
            DIST_CODE_OFFSET[dsym] + cursor.next_bits(DIST_CODE_BITS[dsym] as usize)
        };
        events.push(PacketEvent::Match { length, distance });
    }

    Some(RecoveredPacket {
        start_bit: best.bit_pos,
        end_bit,
        bit_count: best.bit_count,
        literal_classes,
        events,
    })
}

/// When the trees are known but the symbol stream is lost mid-packet, find
/// the earliest bit from which decoding stays consistent all the way to the
/// packet's end-of-data. Dynamic programming backwards over bit positions:
/// a position is good when one decoded symbol lands on a good position, or
/// is the end-of-data marker at the packet end.
pub fn longest_suffix_with_trees(
    window: &[u8],
    start_bit: usize,
    end_bit: usize,
    symtab: &SymbolTable,
) -> Option<usize> {
    if end_bit <= start_bit {
        return None;
    }
    let span = end_bit - start_bit;
    let mut good = vec![false; span + 1];
    let end = BitCursor::at_bit(window, end_bit);
    let mut earliest = None;
    for p in (start_bit..end_bit).rev() {
        let mut cursor = BitCursor::at_bit(window, p);
        let symbol = match symtab.next_symbol(&mut cursor, &end) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let ok = if symbol == END_OF_DATA {
            // tolerate up to seven bits of padding after the marker
            cursor.bit_offset() + 7 >= end_bit && cursor.bit_offset() <= end_bit
        } else if symbol > END_OF_DATA {
            match (
                symtab.length(symbol, &mut cursor),
                symtab.distance(&mut cursor, &end),
            ) {
                (Some(_), Some(_)) => {
                    cursor.bit_offset() <= end_bit && good[cursor.bit_offset() - start_bit]
                }
                _ => false,
            }
        } else {
            cursor.bit_offset() <= end_bit && good[cursor.bit_offset() - start_bit]
        };
        if ok {
            good[p - start_bit] = true;
            earliest = Some(p);
        }
    }
    earliest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::huffman::HuffmanTree;

    /// Write `code` MSB-first into the bit vec.
    fn push_code(bits: &mut Vec<bool>, value: u32, len: usize) {
        for i in (0..len).rev() {
            bits.push((value >> i) & 1 != 0);
        }
    }

    fn to_bytes(bits: &[bool]) -> Vec<u8> {
        let mut out = vec![0u8; (bits.len() + 7) / 8];
        for (i, b) in bits.iter().enumerate() {
            if *b {
                out[i / 8] |= 1 << (i % 8);
            }
        }
        out
    }

    #[test]
    fn search_covers_whole_headerless_packet() {
        // alphabet: three literals at 3 bits, end-of-data at 7; the body
        // is short so the breadth-first frontier stays small
        let mut lengths = vec![0u8; 257];
        lengths[b'x' as usize] = 3;
        lengths[b'y' as usize] = 3;
        lengths[b'z' as usize] = 3;
        lengths[256] = 7;
        let tree = HuffmanTree::from_lengths(&lengths).unwrap();
        let mut bits = Vec::new();
        for &b in b"xyzx" {
            let code = tree.code_for(b as u16).unwrap();
            push_code(&mut bits, code.value(), code.length());
        }
        let eod = tree.code_for(256).unwrap();
        push_code(&mut bits, eod.value(), eod.length());
        let window = to_bytes(&bits);

        let config = SearchConfig {
            mode: SearchMode::BreadthFirst,
            capacity: 200_000,
            keep_none_threshold: 8,
            keep_all_threshold: 1 << 30,
            max_longest: 16,
        };
        let recovered =
            search_partial_packet(&window, 0, bits.len(), false, &config, None).unwrap();
        // the true chain reaches the window start, so the winner must too
        assert_eq!(recovered.bit_count as usize, bits.len());
        assert_eq!(recovered.start_bit, 0);
        assert!(!recovered.events.is_empty());
    }

    #[test]
    fn true_hypothesis_decodes_with_shared_classes() {
        // build the true tree hypothesis by hand and check symbol
        // assignment and equivalence classes of the decoded events
        let mut lengths = vec![0u8; 257];
        lengths[b'x' as usize] = 3;
        lengths[b'y' as usize] = 3;
        lengths[b'z' as usize] = 3;
        lengths[256] = 7;
        let tree = HuffmanTree::from_lengths(&lengths).unwrap();
        let body = b"xyzzyxzyxyzx";
        let mut bits = Vec::new();
        for &b in body.iter() {
            let code = tree.code_for(b as u16).unwrap();
            push_code(&mut bits, code.value(), code.length());
        }
        let eod = tree.code_for(256).unwrap();
        push_code(&mut bits, eod.value(), eod.length());
        let window = to_bytes(&bits);

        let mut lit = TreeHypothesis::empty(false, false, MIN_LIT_BITS, MAX_BITLENGTH);
        for &sym in &[b'x' as u16, b'y' as u16, b'z' as u16] {
            let code = tree.code_for(sym).unwrap();
            lit = lit
                .insert(code.value(), code.length(), EXTRA_LITERAL, false)
                .unwrap();
        }
        lit = lit.insert(eod.value(), eod.length(), 0, true).unwrap();
        let dist = TreeHypothesis::empty(true, false, MIN_DIST_BITS, MAX_BITLENGTH);
        let mut dir = TreeDirectory::new();
        let hyp = Hypothesis::seed(
            dir.intern(lit),
            dir.intern(dist),
            0,
            bits.len() as u32,
        );
        let recovered = decode_hypothesis(&window, bits.len(), &hyp, false).unwrap();
        assert_eq!(recovered.events.len(), body.len());
        assert_eq!(recovered.literal_classes, 3);
        let classes: Vec<u16> = recovered
            .events
            .iter()
            .map(|e| match e {
                PacketEvent::UnknownLiteral { class } => *class,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        for (i, &a) in body.iter().enumerate() {
            for (j, &b) in body.iter().enumerate() {
                assert_eq!(a == b, classes[i] == classes[j]);
            }
        }
    }

    #[test]
    fn matches_decode_with_concrete_lengths() {
        // fixed-tree-shaped hypothesis: literal 'A' (8 bits), a match of
        // length 4 distance 1, end-of-data
        let symtab = SymbolTable::fixed(false);
        let lit_tree = symtab.literal_tree();
        let mut bits = Vec::new();
        let a = lit_tree.code_for(b'A' as u16).unwrap();
        push_code(&mut bits, a.value(), a.length());
        let len258 = lit_tree.code_for(258).unwrap(); // length 4
        push_code(&mut bits, len258.value(), len258.length());
        let d0 = symtab.distance_tree().unwrap().code_for(0).unwrap(); // distance 1
        push_code(&mut bits, d0.value(), d0.length());
        let eod = symtab.eod();
        push_code(&mut bits, eod.value(), eod.length());
        let window = to_bytes(&bits);

        let mut lit = TreeHypothesis::empty(false, false, MIN_LIT_BITS, MAX_BITLENGTH);
        lit = lit.insert(a.value(), a.length(), EXTRA_LITERAL, false).unwrap();
        // canonical rank 1 within class 0 corresponds to symbol 258 once
        // 257's code is present as well
        let len257 = lit_tree.code_for(257).unwrap();
        lit = lit.insert(len257.value(), len257.length(), 0, false).unwrap();
        lit = lit.insert(len258.value(), len258.length(), 0, false).unwrap();
        lit = lit.insert(eod.value(), eod.length(), 0, true).unwrap();
        let mut dist = TreeHypothesis::empty(true, false, MIN_DIST_BITS, MAX_BITLENGTH);
        dist = dist.insert(d0.value(), d0.length(), 0, false).unwrap();
        let mut dir = TreeDirectory::new();
        let hyp = Hypothesis::seed(
            dir.intern(lit),
            dir.intern(dist),
            0,
            bits.len() as u32,
        );
        let recovered = decode_hypothesis(&window, bits.len(), &hyp, false).unwrap();
        assert_eq!(
            recovered.events,
            vec![
                PacketEvent::UnknownLiteral { class: 0 },
                PacketEvent::Match {
                    length: 4,
                    distance: 1
                },
            ]
        );
    }

    #[test]
    fn known_tree_resync_finds_suffix() {
        let symtab = SymbolTable::fixed(false);
        let mut bits = Vec::new();
        for &b in b"resynchronization target text, long enough to matter" {
            let code = symtab.literal_tree().code_for(b as u16).unwrap();
            push_code(&mut bits, code.value(), code.length());
        }
        let eod = symtab.eod();
        push_code(&mut bits, eod.value(), eod.length());
        let window = to_bytes(&bits);
        let found = longest_suffix_with_trees(&window, 0, bits.len(), &symtab).unwrap();
        // from the true start the whole packet is consistent
        assert_eq!(found, 0);
        // starting the scan mid-way still yields a consistent suffix
        let found = longest_suffix_with_trees(&window, 100, bits.len(), &symtab).unwrap();
        assert!(found >= 100);
        assert!(found < bits.len() - eod.length());
    }
}
