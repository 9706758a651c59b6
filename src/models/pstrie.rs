//! A static packed trie over the 256-way byte alphabet.
//!
//! Nodes live in one contiguous region: a 32-bit frequency, a 32-bit
//! first-child index, a 256-bit child-presence bitmap as four 64-bit words,
//! and running popcounts per word for O(1) child ranking. Leaf-only nodes
//! are stored in a compact terminal array holding just the frequency, and
//! are addressed by setting the high bit of the index. The whole structure
//! is read directly out of a byte region, which may be an owned buffer or
//! a memory-mapped file.

use std::io::{self, Write};

use crate::reconstruct::wildcards::WildcardSet;

pub const TRIE_SIGNATURE: &[u8; 11] = b"PackedTrie\0";
pub const TRIE_FORMAT_VERSION: u8 = 1;
pub const BITS_PER_LEVEL: u8 = 8;
pub const ROOT_INDEX: u32 = 0;
pub const TERMINAL_MASK: u32 = 0x8000_0000;

const HEADER_SIZE: usize = 32;
const NODE_SIZE: usize = 44;
const TERMINAL_SIZE: usize = 4;

#[derive(Debug)]
pub enum TrieError {
    BadSignature,
    UnsupportedVersion(u8),
    Truncated,
}

impl core::fmt::Display for TrieError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TrieError::BadSignature => write!(f, "missing PackedTrie signature"),
            TrieError::UnsupportedVersion(v) => {
                write!(f, "unsupported PackedTrie format version {}", v)
            }
            TrieError::Truncated => write!(f, "PackedTrie data is truncated"),
        }
    }
}

impl std::error::Error for TrieError {}

#[derive(Debug)]
enum TrieData {
    Owned(Vec<u8>),
    #[cfg(feature = "mmap")]
    Mapped(memmap::Mmap),
}

impl TrieData {
    fn bytes(&self) -> &[u8] {
        match self {
            TrieData::Owned(v) => v,
            #[cfg(feature = "mmap")]
            TrieData::Mapped(m) => m,
        }
    }
}

/// A match produced by wildcard-aware enumeration.
#[derive(Clone, Debug)]
pub struct TrieMatch {
    pub node: u32,
    pub key: Vec<u8>,
}

#[derive(Debug)]
pub struct PackedTrie {
    data: TrieData,
    node_count: u32,
    terminal_count: u32,
    max_key_len: u32,
    nodes_offset: usize,
    terminals_offset: usize,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

impl PackedTrie {
    /// Parse a trie from an owned byte buffer (for example one section of a
    /// language-model file).
    pub fn from_bytes(bytes: Vec<u8>) -> Result<PackedTrie, TrieError> {
        Self::build(TrieData::Owned(bytes))
    }

    /// Map `path` and parse the region in place.
    #[cfg(feature = "mmap")]
    pub fn open_mapped(path: &std::path::Path) -> io::Result<PackedTrie> {
        let file = std::fs::File::open(path)?;
        let map = unsafe { memmap::Mmap::map(&file)? };
        Self::build(TrieData::Mapped(map))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    fn build(data: TrieData) -> Result<PackedTrie, TrieError> {
        let bytes = data.bytes();
        if bytes.len() < HEADER_SIZE {
            return Err(TrieError::Truncated);
        }
        if &bytes[..TRIE_SIGNATURE.len()] != TRIE_SIGNATURE {
            return Err(TrieError::BadSignature);
        }
        let version = bytes[11];
        if version != TRIE_FORMAT_VERSION {
            return Err(TrieError::UnsupportedVersion(version));
        }
        let node_count = read_u32(bytes, 16);
        let max_key_len = read_u32(bytes, 20);
        let terminal_count = read_u32(bytes, 24);
        let nodes_offset = HEADER_SIZE;
        let terminals_offset = nodes_offset + node_count as usize * NODE_SIZE;
        let needed = terminals_offset + terminal_count as usize * TERMINAL_SIZE;
        if bytes.len() < needed {
            return Err(TrieError::Truncated);
        }
        Ok(PackedTrie {
            data,
            node_count,
            terminal_count,
            max_key_len,
            nodes_offset,
            terminals_offset,
        })
    }

    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    pub fn terminal_count(&self) -> u32 {
        self.terminal_count
    }

    /// Longest key stored in the trie.
    pub fn longest_key(&self) -> usize {
        self.max_key_len as usize
    }

    pub fn is_terminal(index: u32) -> bool {
        index & TERMINAL_MASK != 0
    }

    fn node_offset(&self, index: u32) -> usize {
        self.nodes_offset + index as usize * NODE_SIZE
    }

    /// Frequency of any node, full or terminal.
    pub fn frequency(&self, index: u32) -> u32 {
        let bytes = self.data.bytes();
        if Self::is_terminal(index) {
            let i = (index & !TERMINAL_MASK) as usize;
            read_u32(bytes, self.terminals_offset + i * TERMINAL_SIZE)
        } else {
            read_u32(bytes, self.node_offset(index))
        }
    }

    fn first_child(&self, index: u32) -> u32 {
        read_u32(self.data.bytes(), self.node_offset(index) + 4)
    }

    fn bitmap_word(&self, index: u32, word: usize) -> u64 {
        read_u64(self.data.bytes(), self.node_offset(index) + 8 + word * 8)
    }

    fn popcount_before(&self, index: u32, word: usize) -> u32 {
        self.data.bytes()[self.node_offset(index) + 40 + word] as u32
    }

    pub fn child_present(&self, index: u32, byte: u8) -> bool {
        if Self::is_terminal(index) || index >= self.node_count {
            return false;
        }
        self.bitmap_word(index, byte as usize / 64) >> (byte % 64) & 1 != 0
    }

    /// Index of the child reached over `byte`, terminal bit included.
    pub fn child(&self, index: u32, byte: u8) -> Option<u32> {
        if !self.child_present(index, byte) {
            return None;
        }
        let word = byte as usize / 64;
        let below = self.bitmap_word(index, word) & ((1u64 << (byte % 64)) - 1);
        let rank = self.popcount_before(index, word) + below.count_ones();
        let first = self.first_child(index);
        if first & TERMINAL_MASK != 0 {
            Some(((first & !TERMINAL_MASK) + rank) | TERMINAL_MASK)
        } else {
            Some(first + rank)
        }
    }

    /// Advance `node` by one key byte in place.
    pub fn extend_key(&self, node: &mut u32, byte: u8) -> bool {
        match self.child(*node, byte) {
            Some(next) => {
                *node = next;
                true
            }
            None => false,
        }
    }

    /// Node reached over the whole key.
    pub fn find_node(&self, key: &[u8]) -> Option<u32> {
        let mut node = ROOT_INDEX;
        for &b in key {
            if !self.extend_key(&mut node, b) {
                return None;
            }
        }
        Some(node)
    }

    /// Frequency of the exact key, when present.
    pub fn find(&self, key: &[u8]) -> Option<u32> {
        self.find_node(key).map(|n| self.frequency(n))
    }

    /// Visit all children of a full node.
    pub fn for_each_child<F: FnMut(u8, u32)>(&self, index: u32, mut f: F) {
        if Self::is_terminal(index) || index >= self.node_count {
            return;
        }
        for byte in 0..=255u8 {
            if let Some(child) = self.child(index, byte) {
                f(byte, child);
            }
        }
    }

    /// Add each child's frequency, scaled by `weight`, to the score slot of
    /// its byte.
    pub fn add_to_scores(&self, index: u32, scores: &mut [f32; 256], weight: f64) {
        self.for_each_child(index, |byte, child| {
            scores[byte as usize] += (self.frequency(child) as f64 * weight) as f32;
        });
    }

    /// Enumerate nodes matching `key` where unresolved positions range over
    /// their wildcard sets. Returns `None` when more than `max_matches`
    /// nodes match (the context is too ambiguous to be useful).
    pub fn enumerate(
        &self,
        key: &[u8],
        contexts: &[Option<&WildcardSet>],
        max_matches: usize,
        require_extensible: bool,
    ) -> Option<Vec<TrieMatch>> {
        let mut matches = Vec::new();
        let mut prefix = Vec::with_capacity(key.len());
        let overflow = self.enumerate_inner(
            ROOT_INDEX,
            key,
            contexts,
            max_matches,
            require_extensible,
            &mut prefix,
            &mut matches,
        );
        if overflow {
            None
        } else {
            Some(matches)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enumerate_inner(
        &self,
        node: u32,
        key: &[u8],
        contexts: &[Option<&WildcardSet>],
        max_matches: usize,
        require_extensible: bool,
        prefix: &mut Vec<u8>,
        matches: &mut Vec<TrieMatch>,
    ) -> bool {
        if prefix.len() == key.len() {
            if require_extensible && Self::is_terminal(node) {
                return false;
            }
            matches.push(TrieMatch {
                node,
                key: prefix.clone(),
            });
            return matches.len() > max_matches;
        }
        let depth = prefix.len();
        match contexts[depth] {
            None => {
                if let Some(child) = self.child(node, key[depth]) {
                    prefix.push(key[depth]);
                    let overflow = self.enumerate_inner(
                        child,
                        key,
                        contexts,
                        max_matches,
                        require_extensible,
                        prefix,
                        matches,
                    );
                    prefix.pop();
                    if overflow {
                        return true;
                    }
                }
            }
            Some(set) => {
                for byte in set.iter() {
                    if let Some(child) = self.child(node, byte) {
                        prefix.push(byte);
                        let overflow = self.enumerate_inner(
                            child,
                            key,
                            contexts,
                            max_matches,
                            require_extensible,
                            prefix,
                            matches,
                        );
                        prefix.pop();
                        if overflow {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Count matching keys without collecting them.
    pub fn count_matches(
        &self,
        key: &[u8],
        contexts: &[Option<&WildcardSet>],
        max_matches: usize,
    ) -> usize {
        match self.enumerate(key, contexts, max_matches, false) {
            Some(matches) => matches.len(),
            None => max_matches + 1,
        }
    }

    /// Visit every stored key with its frequency.
    pub fn enumerate_keys<F: FnMut(&[u8], u32)>(&self, mut f: F) {
        let mut prefix = Vec::new();
        self.enumerate_keys_inner(ROOT_INDEX, &mut prefix, &mut f);
    }

    fn enumerate_keys_inner<F: FnMut(&[u8], u32)>(
        &self,
        node: u32,
        prefix: &mut Vec<u8>,
        f: &mut F,
    ) {
        self.for_each_child(node, |byte, child| {
            prefix.push(byte);
            f(prefix, self.frequency(child));
            self.enumerate_keys_inner(child, prefix, f);
            prefix.pop();
        });
    }

    /// Per-depth (node count, total frequency), for average-frequency
    /// statistics.
    pub fn level_statistics(&self) -> Vec<(u64, u64)> {
        let mut stats = vec![(0u64, 0u64); self.longest_key() + 1];
        self.level_stats_inner(ROOT_INDEX, 1, &mut stats);
        stats
    }

    fn level_stats_inner(&self, node: u32, depth: usize, stats: &mut Vec<(u64, u64)>) {
        self.for_each_child(node, |_, child| {
            if depth < stats.len() {
                stats[depth].0 += 1;
                stats[depth].1 += self.frequency(child) as u64;
            }
            self.level_stats_inner(child, depth + 1, stats);
        });
    }

    /// Serialize in the on-disk layout (also used for sections inside a
    /// language-model file).
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(self.data.bytes())
    }

    /// Assemble the serialized form from raw parts (used by the builder).
    pub(crate) fn from_parts(
        nodes: &[RawNode],
        terminals: &[u32],
        max_key_len: u32,
    ) -> PackedTrie {
        let mut bytes =
            Vec::with_capacity(HEADER_SIZE + nodes.len() * NODE_SIZE + terminals.len() * 4);
        bytes.extend_from_slice(TRIE_SIGNATURE);
        bytes.push(TRIE_FORMAT_VERSION);
        bytes.push(BITS_PER_LEVEL);
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&(nodes.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&max_key_len.to_le_bytes());
        bytes.extend_from_slice(&(terminals.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        debug_assert_eq!(bytes.len(), HEADER_SIZE);
        for node in nodes {
            bytes.extend_from_slice(&node.freq.to_le_bytes());
            bytes.extend_from_slice(&node.first_child.to_le_bytes());
            for w in &node.bitmap {
                bytes.extend_from_slice(&w.to_le_bytes());
            }
            let mut running = 0u32;
            for w in &node.bitmap {
                bytes.push(running.min(255) as u8);
                running += w.count_ones();
            }
        }
        for &t in terminals {
            bytes.extend_from_slice(&t.to_le_bytes());
        }
        PackedTrie::from_bytes(bytes).expect("builder output is well-formed")
    }
}

/// In-memory node used while packing.
pub(crate) struct RawNode {
    pub freq: u32,
    pub first_child: u32,
    pub bitmap: [u64; 4],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::builder::TrieBuilder;

    fn sample_trie() -> PackedTrie {
        let mut builder = TrieBuilder::new();
        builder.insert(b"he", 10);
        builder.insert(b"her", 6);
        builder.insert(b"hat", 3);
        builder.insert(b"ha", 5);
        builder.insert(b"xe", 2);
        builder.pack()
    }

    #[test]
    fn finds_inserted_keys() {
        let trie = sample_trie();
        assert_eq!(trie.find(b"her"), Some(6));
        assert_eq!(trie.find(b"hat"), Some(3));
        assert_eq!(trie.find(b"xe"), Some(2));
        assert_eq!(trie.find(b"zz"), None);
    }

    #[test]
    fn prefix_frequencies_aggregate() {
        let trie = sample_trie();
        // "he" was inserted directly and extended by "her"
        assert_eq!(trie.find(b"he"), Some(16));
        // "h" aggregates everything below it
        assert_eq!(trie.find(b"h"), Some(24));
    }

    #[test]
    fn extend_key_walks_incrementally() {
        let trie = sample_trie();
        let mut node = ROOT_INDEX;
        assert!(trie.extend_key(&mut node, b'h'));
        assert!(trie.extend_key(&mut node, b'e'));
        assert_eq!(trie.frequency(node), 16);
        assert!(!trie.extend_key(&mut node, b'q'));
    }

    #[test]
    fn wildcard_enumeration() {
        let trie = sample_trie();
        let mut set = WildcardSet::new(false);
        set.add(b'a');
        set.add(b'e');
        let contexts: Vec<Option<&WildcardSet>> = vec![None, Some(&set)];
        let matches = trie.enumerate(b"h?", &contexts, 8, false).unwrap();
        let mut keys: Vec<Vec<u8>> = matches.iter().map(|m| m.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec![b"ha".to_vec(), b"he".to_vec()]);
    }

    #[test]
    fn enumeration_overflow_reports_ambiguity() {
        let trie = sample_trie();
        let all = WildcardSet::new(true);
        let contexts: Vec<Option<&WildcardSet>> = vec![Some(&all)];
        assert!(trie.enumerate(b"?", &contexts, 1, false).is_none());
        assert_eq!(trie.count_matches(b"?", &contexts, 1), 2);
    }

    #[test]
    fn scores_distribute_over_children() {
        let trie = sample_trie();
        let node = trie.find_node(b"h").unwrap();
        let mut scores = [0.0f32; 256];
        trie.add_to_scores(node, &mut scores, 1.0);
        assert_eq!(scores[b'e' as usize], 16.0);
        assert_eq!(scores[b'a' as usize], 8.0);
        assert_eq!(scores[b'x' as usize], 0.0);
    }

    #[test]
    fn round_trips_through_serialization() {
        let trie = sample_trie();
        let mut bytes = Vec::new();
        trie.write_to(&mut bytes).unwrap();
        let reloaded = PackedTrie::from_bytes(bytes).unwrap();
        assert_eq!(reloaded.find(b"her"), Some(6));
        assert_eq!(reloaded.longest_key(), 3);
        assert_eq!(reloaded.node_count(), trie.node_count());
    }

    #[test]
    fn rejects_corrupt_headers() {
        assert!(matches!(
            PackedTrie::from_bytes(b"NotATrie\0\0\0\0\0\0\0\0".to_vec()),
            Err(TrieError::BadSignature) | Err(TrieError::Truncated)
        ));
    }
}
