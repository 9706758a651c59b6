//! Incremental reconstruction of a canonical Huffman tree from observed
//! codes.
//!
//! A tree hypothesis is an immutable, sorted vector of codes in canonical
//! order. Each code is stored left-aligned in a 15-bit space, so a length-l
//! code occupies a span of `2^(15-l)` units. Canonical Huffman structure
//! then reduces to geometry: spans are disjoint, lengths never decrease
//! along the space, and the whole tree fits below `2^15`. Every insertion
//! re-checks those facts plus the DEFLATE alphabet bounds, and interning
//! makes structurally equal trees share storage.

use std::collections::HashMap;
use std::rc::Rc;

use twox_hash::XxHash64;

/// Longest permitted Huffman code.
pub const MAX_BITLENGTH: usize = 15;

/// Marker in the extra-bits slot: this code is a literal byte.
pub const EXTRA_LITERAL: u8 = 0xFF;

/// Class of the maximal length symbol (285), which carries 16 extra bits
/// under DEFLATE64 and none otherwise.
pub const EXTRA_MAXLEN: u8 = 16;

/// No more than four identical literals in a row; a longer run would have
/// been encoded as a back-reference.
pub const MAX_LITERAL_REPEATS: u8 = 4;

/// Floors on code lengths: a literal shorter than 3 bits would claim over
/// an eighth of the code space, a distance shorter than 2 over a quarter.
pub const MIN_LIT_BITS: usize = 3;
pub const MIN_DIST_BITS: usize = 2;

const SEED: u64 = 0x5a69_7052_6563_6f76;

pub fn canonicalize(code: u32, length: usize) -> u32 {
    code << (MAX_BITLENGTH - length)
}

fn span(length: u8) -> u32 {
    1u32 << (MAX_BITLENGTH - length as usize)
}

/// Ordering rank of a code class within one code length: literals first,
/// then end-of-data, then length/distance codes by ascending extra bits,
/// with the maximal-length class last.
fn class_rank(extra: u8, is_eod: bool) -> u32 {
    if extra == EXTRA_LITERAL {
        0
    } else if is_eod {
        1
    } else if extra == EXTRA_MAXLEN {
        255
    } else {
        2 + extra as u32
    }
}

/// How many codes of one extra-bit class the DEFLATE alphabets allow.
fn class_cap(extra: u8, is_distance: bool, deflate64: bool) -> u16 {
    if is_distance {
        match extra {
            0 => 4,
            1..=13 => 2,
            14 if deflate64 => 2,
            _ => 0,
        }
    } else {
        match extra {
            EXTRA_LITERAL => 256,
            // 256 (end-of-data) plus 257..=264
            0 => 9,
            1..=5 => 4,
            EXTRA_MAXLEN => 1,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeEntry {
    /// Left-aligned canonical value (`code << (15 - len)`).
    pub canon: u32,
    pub len: u8,
    /// Extra-bit class, [`EXTRA_LITERAL`] for literal bytes.
    pub extra: u8,
    pub is_eod: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Consistency {
    /// The exact code is already part of the tree.
    AlreadyPresent,
    /// The code can be added.
    Insertable,
    /// The code contradicts the tree.
    Inconsistent,
}

/// An immutable, interned partial canonical Huffman tree.
pub struct TreeHypothesis {
    codes: Vec<CodeEntry>,
    /// Canonical value of the end-of-data code, once seen.
    eod_canon: Option<u32>,
    /// Total codes the alphabet permits (forced gap fillers count).
    max_codes: u16,
    is_distance: bool,
    deflate64: bool,
    min_length: u8,
    max_length: u8,
    /// Codes per extra-bit class, indexed 0..=16; literals counted apart.
    class_counts: [u16; 17],
    literal_count: u16,
    hash: u64,
}

impl PartialEq for TreeHypothesis {
    fn eq(&self, other: &Self) -> bool {
        self.eod_canon == other.eod_canon && self.codes == other.codes
    }
}

impl Eq for TreeHypothesis {}

impl TreeHypothesis {
    pub fn empty(
        is_distance: bool,
        deflate64: bool,
        min_length: usize,
        max_length: usize,
    ) -> TreeHypothesis {
        let max_codes = if is_distance {
            if deflate64 {
                32
            } else {
                30
            }
        } else {
            286
        };
        let mut tree = TreeHypothesis {
            codes: Vec::new(),
            eod_canon: None,
            max_codes,
            is_distance,
            deflate64,
            min_length: min_length as u8,
            max_length: max_length as u8,
            class_counts: [0; 17],
            literal_count: 0,
            hash: 0,
        };
        tree.rehash();
        tree
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn codes(&self) -> &[CodeEntry] {
        &self.codes
    }

    pub fn min_length(&self) -> usize {
        self.min_length as usize
    }

    pub fn max_length(&self) -> usize {
        self.max_length as usize
    }

    pub fn eod_canon(&self) -> Option<u32> {
        self.eod_canon
    }

    pub fn is_eod(&self, code: u32, length: usize) -> bool {
        self.eod_canon == Some(canonicalize(code, length))
    }

    fn rehash(&mut self) {
        let mut bytes = Vec::with_capacity(self.codes.len() * 4 + 4);
        for c in &self.codes {
            bytes.extend_from_slice(&(c.canon as u16).to_le_bytes());
            bytes.push(c.len);
            bytes.push(if c.is_eod { c.extra ^ 0x80 } else { c.extra });
        }
        bytes.extend_from_slice(&self.eod_canon.unwrap_or(u32::MAX).to_le_bytes());
        self.hash = XxHash64::oneshot(SEED, &bytes);
    }

    /// Index of the entry with this canonical value, or the insertion point.
    fn position(&self, canon: u32) -> Result<usize, usize> {
        self.codes.binary_search_by(|e| e.canon.cmp(&canon))
    }

    /// Minimal number of codes needed to fill a gap of `gap` canonical
    /// units using lengths in `[left_len, right_len]`, or `None` when the
    /// gap cannot be filled at all.
    fn min_fillers(gap: u32, left_len: u8, right_len: u8) -> Option<u32> {
        if gap == 0 {
            return Some(0);
        }
        let small = span(right_len);
        if gap % small != 0 {
            return None;
        }
        let big = span(left_len);
        Some(gap / big + (gap % big).count_ones())
    }

    /// Check `(code, length, extra)` against the tree.
    pub fn consistent(&self, code: u32, length: usize, extra: u8, is_eod: bool) -> Consistency {
        if length < self.min_length as usize || length > self.max_length as usize {
            return Consistency::Inconsistent;
        }
        if is_eod && self.eod_canon.is_some() {
            // at most one end-of-data code
            return if self.is_eod(code, length) {
                Consistency::AlreadyPresent
            } else {
                Consistency::Inconsistent
            };
        }
        let canon = canonicalize(code, length);
        match self.position(canon) {
            Ok(idx) => {
                let entry = self.codes[idx];
                if entry.len == length as u8 && entry.extra == extra && entry.is_eod == is_eod {
                    Consistency::AlreadyPresent
                } else {
                    Consistency::Inconsistent
                }
            }
            Err(idx) => {
                if self.check_insertion(canon, length as u8, extra, is_eod, idx) {
                    Consistency::Insertable
                } else {
                    Consistency::Inconsistent
                }
            }
        }
    }

    fn check_insertion(&self, canon: u32, len: u8, extra: u8, is_eod: bool, idx: usize) -> bool {
        let rank = class_rank(extra, is_eod);
        if let Some(left) = idx.checked_sub(1).map(|i| self.codes[i]) {
            // lengths never decrease along the canonical space
            if left.len > len {
                return false;
            }
            if canon < left.canon + span(left.len) {
                return false;
            }
            if left.len == len && class_rank(left.extra, left.is_eod) > rank {
                return false;
            }
        }
        if let Some(right) = self.codes.get(idx) {
            if right.len < len {
                return false;
            }
            if canon + span(len) > right.canon {
                return false;
            }
            if right.len == len && class_rank(right.extra, right.is_eod) < rank {
                return false;
            }
        }
        if canon + span(len) > 1 << MAX_BITLENGTH {
            return false;
        }

        // class occupancy, counting the candidate itself plus any codes a
        // same-length same-class neighbor forces into existence
        if extra == EXTRA_LITERAL {
            if self.literal_count + 1 > class_cap(extra, self.is_distance, self.deflate64) {
                return false;
            }
        } else {
            let cap = class_cap(extra, self.is_distance, self.deflate64);
            let mut class_total = self.class_counts[extra.min(16) as usize] as u32 + 1;
            if !is_eod {
                if let Some(left) = idx.checked_sub(1).map(|i| self.codes[i]) {
                    if left.len == len && left.extra == extra && !left.is_eod {
                        class_total += (canon - (left.canon + span(len))) / span(len);
                    }
                }
                if let Some(right) = self.codes.get(idx) {
                    if right.len == len && right.extra == extra && !right.is_eod {
                        class_total += (right.canon - (canon + span(len))) / span(len);
                    }
                }
            }
            if class_total > cap as u32 {
                return false;
            }
        }

        // Kraft feasibility with the candidate in place: walk the spans and
        // total the minimal forced codes
        let mut total = self.codes.len() as u32 + 1;
        let mut prev: Option<(u32, u8)> = None;
        let mut i = 0usize;
        let mut candidate_done = false;
        loop {
            let (c, l) = if !candidate_done && (i >= self.codes.len() || canon < self.codes[i].canon)
            {
                candidate_done = true;
                (canon, len)
            } else if i < self.codes.len() {
                let e = self.codes[i];
                i += 1;
                (e.canon, e.len)
            } else {
                break;
            };
            if let Some((pc, pl)) = prev {
                let gap = c - (pc + span(pl));
                match Self::min_fillers(gap, pl, l) {
                    Some(fill) => total += fill,
                    None => return false,
                }
            } else {
                // leading space must be fillable by codes of length <= l
                match Self::min_fillers(c, 1, l) {
                    Some(fill) => total += fill,
                    None => return false,
                }
            }
            prev = Some((c, l));
        }
        total <= self.max_codes as u32
    }

    /// Produce the augmented tree, materializing forced codes between
    /// same-length, same-class neighbors.
    pub fn insert(&self, code: u32, length: usize, extra: u8, is_eod: bool) -> Option<TreeHypothesis> {
        match self.consistent(code, length, extra, is_eod) {
            Consistency::Inconsistent => return None,
            Consistency::AlreadyPresent => {
                return Some(self.clone_tree());
            }
            Consistency::Insertable => {}
        }
        let canon = canonicalize(code, length);
        let idx = match self.position(canon) {
            Err(i) => i,
            Ok(_) => unreachable!("insertable code cannot be present"),
        };
        let mut tree = self.clone_tree();
        let entry = CodeEntry {
            canon,
            len: length as u8,
            extra,
            is_eod,
        };
        tree.codes.insert(idx, entry);
        if is_eod {
            tree.eod_canon = Some(canon);
        }
        if extra == EXTRA_LITERAL {
            tree.literal_count += 1;
        } else {
            tree.class_counts[extra.min(16) as usize] += 1;
        }
        tree.materialize_forced(idx);
        tree.rehash();
        Some(tree)
    }

    fn clone_tree(&self) -> TreeHypothesis {
        TreeHypothesis {
            codes: self.codes.clone(),
            eod_canon: self.eod_canon,
            max_codes: self.max_codes,
            is_distance: self.is_distance,
            deflate64: self.deflate64,
            min_length: self.min_length,
            max_length: self.max_length,
            class_counts: self.class_counts,
            literal_count: self.literal_count,
            hash: self.hash,
        }
    }

    /// When the new entry and a neighbor share length and class, the codes
    /// between them are fully determined; add them now so equal trees
    /// reached by different paths intern to one node.
    fn materialize_forced(&mut self, idx: usize) {
        let mut additions: Vec<CodeEntry> = Vec::new();
        let entry = self.codes[idx];
        if entry.extra == EXTRA_LITERAL || entry.is_eod {
            // literal fillers would pin unknown byte values; leave gaps open
            return;
        }
        for &(a, b) in &[(idx.wrapping_sub(1), idx), (idx, idx + 1)] {
            if a == usize::MAX || b >= self.codes.len() {
                continue;
            }
            let left = self.codes[a];
            let right = self.codes[b];
            if left.len != right.len
                || left.extra != right.extra
                || left.is_eod
                || right.is_eod
                || left.extra == EXTRA_LITERAL
            {
                continue;
            }
            let step = span(left.len);
            let mut c = left.canon + step;
            while c < right.canon {
                additions.push(CodeEntry {
                    canon: c,
                    len: left.len,
                    extra: left.extra,
                    is_eod: false,
                });
                c += step;
            }
        }
        for add in additions {
            if let Err(i) = self.position(add.canon) {
                if self.class_counts[add.extra.min(16) as usize]
                    < class_cap(add.extra, self.is_distance, self.deflate64)
                {
                    self.codes.insert(i, add);
                    self.class_counts[add.extra.min(16) as usize] += 1;
                }
            }
        }
    }
}

/// Content-addressed store of tree hypotheses. Augmenting a tree often
/// reproduces one already seen; interning makes those share a node so
/// hypothesis deduplication can compare pointers.
pub struct TreeDirectory {
    map: HashMap<u64, Vec<Rc<TreeHypothesis>>>,
}

impl TreeDirectory {
    pub fn new() -> TreeDirectory {
        TreeDirectory {
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|v| v.len()).sum()
    }

    pub fn intern(&mut self, tree: TreeHypothesis) -> Rc<TreeHypothesis> {
        let bucket = self.map.entry(tree.hash()).or_insert_with(Vec::new);
        for existing in bucket.iter() {
            if **existing == tree {
                return Rc::clone(existing);
            }
        }
        let shared = Rc::new(tree);
        bucket.push(Rc::clone(&shared));
        shared
    }
}

impl Default for TreeDirectory {
    fn default() -> Self {
        TreeDirectory::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit_tree() -> TreeHypothesis {
        TreeHypothesis::empty(false, false, MIN_LIT_BITS, MAX_BITLENGTH)
    }

    #[test]
    fn first_insert_accepts_aligned_codes() {
        let tree = lit_tree();
        assert_eq!(
            tree.consistent(0, 7, 0, true),
            Consistency::Insertable,
            "EOD at the all-zero code"
        );
        // any canonical value works as a first code: shorter codes can
        // always fill the space to its left
        assert_eq!(tree.consistent(1, 7, 0, true), Consistency::Insertable);
    }

    #[test]
    fn prefix_overlap_rejected() {
        let tree = lit_tree()
            .insert(0b000, 3, EXTRA_LITERAL, false)
            .unwrap();
        // 0b0001... of length 4 lies inside the span of 0b000
        assert_eq!(
            tree.consistent(0b0001, 4, EXTRA_LITERAL, false),
            Consistency::Inconsistent
        );
        // the sibling span is fine
        assert_eq!(
            tree.consistent(0b0010, 4, EXTRA_LITERAL, false),
            Consistency::Insertable
        );
    }

    #[test]
    fn length_monotonicity_enforced() {
        let tree = lit_tree()
            .insert(0b0100, 4, EXTRA_LITERAL, false)
            .unwrap();
        // a shorter code cannot sit to the right of a longer one
        assert_eq!(
            tree.consistent(0b011, 3, EXTRA_LITERAL, false),
            Consistency::Inconsistent
        );
        // but to the left it can
        assert_eq!(
            tree.consistent(0b000, 3, EXTRA_LITERAL, false),
            Consistency::Insertable
        );
    }

    #[test]
    fn duplicate_eod_rejected() {
        let tree = lit_tree().insert(0b1111111, 7, 0, true).unwrap();
        assert_eq!(tree.consistent(0b1111110, 7, 0, true), Consistency::Inconsistent);
        assert_eq!(tree.consistent(0b1111111, 7, 0, true), Consistency::AlreadyPresent);
    }

    #[test]
    fn class_ordering_within_length() {
        // a literal and a length code of the same length: the literal must
        // come first in canonical order
        let tree = lit_tree().insert(0b0000, 4, 0, false).unwrap();
        assert_eq!(
            tree.consistent(0b0001, 4, EXTRA_LITERAL, false),
            Consistency::Inconsistent,
            "literal after a length code of the same length"
        );
        assert_eq!(
            tree.consistent(0b0001, 4, 1, false),
            Consistency::Insertable
        );
        assert_eq!(
            tree.consistent(0b0001, 4, 0, false),
            Consistency::Insertable
        );
    }

    #[test]
    fn class_caps_enforced() {
        // distance tree: only four codes may carry zero extra bits
        let mut tree =
            TreeHypothesis::empty(true, false, MIN_DIST_BITS, MAX_BITLENGTH);
        for code in 0..4u32 {
            tree = tree.insert(code, 4, 0, false).unwrap();
        }
        assert_eq!(tree.consistent(4, 4, 0, false), Consistency::Inconsistent);
        assert_eq!(tree.consistent(4, 4, 1, false), Consistency::Insertable);
    }

    #[test]
    fn unfillable_gap_rejected() {
        // two length-3 codes with a gap of half a span between them can
        // never be completed by codes of length <= 3
        let tree = lit_tree()
            .insert(0b000, 3, EXTRA_LITERAL, false)
            .unwrap();
        // gap from end of 0b000's span to 0b100 at length 3 is fine
        assert_eq!(
            tree.consistent(0b010, 3, EXTRA_LITERAL, false),
            Consistency::Insertable
        );
        // a length-4 code at 0b0100 then a length-3 right after is the
        // monotonicity violation covered elsewhere; here check trailing
        // alignment: a length-3 code at canon not divisible by its span
        assert_eq!(
            tree.consistent(0b011, 3, EXTRA_LITERAL, false),
            Consistency::Insertable
        );
    }

    #[test]
    fn forced_codes_respect_class_caps() {
        let tree = TreeHypothesis::empty(true, false, MIN_DIST_BITS, MAX_BITLENGTH)
            .insert(0b000, 3, 1, false)
            .unwrap();
        // adjacent same-class code forces nothing
        let tree2 = tree.insert(0b001, 3, 1, false).unwrap();
        assert_eq!(tree2.len(), 2);
        // a third code of the class would exceed the cap of two
        assert_eq!(tree2.consistent(0b010, 3, 1, false), Consistency::Inconsistent);
        // a gap that forces a same-class middle code busts the cap as well
        assert_eq!(tree.consistent(0b010, 3, 1, false), Consistency::Inconsistent);
    }

    #[test]
    fn forced_codes_materialize_between_same_class_neighbors() {
        // two class-3 distance codes one span apart force the middle code
        let tree = TreeHypothesis::empty(true, false, MIN_DIST_BITS, MAX_BITLENGTH)
            .insert(0b000, 3, 0, false)
            .unwrap();
        let tree = tree.insert(0b001, 3, 0, false).unwrap();
        let tree = tree.insert(0b011, 3, 0, false).unwrap();
        // 0b010 is forced: neighbors 0b001 and 0b011 share length and class
        assert_eq!(tree.len(), 4);
        assert_eq!(
            tree.consistent(0b010, 3, 0, false),
            Consistency::AlreadyPresent
        );
    }

    #[test]
    fn interning_shares_equal_trees() {
        let mut dir = TreeDirectory::new();
        let a = dir.intern(
            lit_tree().insert(0b000, 3, EXTRA_LITERAL, false).unwrap(),
        );
        let b = dir.intern(
            lit_tree().insert(0b000, 3, EXTRA_LITERAL, false).unwrap(),
        );
        assert!(Rc::ptr_eq(&a, &b));
        let c = dir.intern(
            lit_tree().insert(0b001, 3, EXTRA_LITERAL, false).unwrap(),
        );
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn kraft_totals_bound_alphabet() {
        // two 15-bit codes at opposite ends of the space would force tens
        // of thousands of codes between them, far past any alphabet
        let tree = TreeHypothesis::empty(true, false, 1, MAX_BITLENGTH)
            .insert(0, 15, 0, false)
            .unwrap();
        assert_eq!(
            tree.consistent(0b111_1111_1111_1111, 15, 1, false),
            Consistency::Inconsistent
        );
        // the adjacent 15-bit code is fine
        assert_eq!(tree.consistent(1, 15, 0, false), Consistency::Insertable);
    }
}
