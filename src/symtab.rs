//! DEFLATE symbol tables: the literal/length and distance trees of one
//! packet plus the extra-bit decoding that turns symbols into byte values
//! and (length, distance) pairs.

use std::sync::OnceLock;

use crate::bits::{BitCursor, VarBits};
use crate::deflate::{
    length_extra_bits, BIT_LENGTH_ORDER, DIST_CODES, DIST_CODES_64, DIST_CODE_BITS,
    DIST_CODE_OFFSET, END_OF_DATA, LENGTH_CODE_OFFSET, MAX_LITERAL_CODES, NUM_BIT_LENGTHS,
};
use crate::huffman::{HuffmanError, HuffmanLengthTable, HuffmanTree};

#[derive(Debug, PartialEq, Eq)]
pub enum SymbolTableError {
    /// The dynamic header's counts are out of range, or distances are
    /// declared without any length literals.
    InvalidHeader,
    /// A bit-length vector cannot form a canonical tree.
    InvalidTree(HuffmanError),
    /// The run-length-encoded bit lengths are inconsistent.
    InvalidBitLengths,
    /// The header extends past the end of the packet.
    UnexpectedEnd,
}

impl core::fmt::Display for SymbolTableError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SymbolTableError::InvalidHeader => write!(f, "dynamic packet header is inconsistent"),
            SymbolTableError::InvalidTree(e) => write!(f, "cannot build Huffman tree: {}", e),
            SymbolTableError::InvalidBitLengths => {
                write!(f, "run-length-encoded bit lengths are invalid")
            }
            SymbolTableError::UnexpectedEnd => {
                write!(f, "packet header extends past end of stream")
            }
        }
    }
}

impl std::error::Error for SymbolTableError {}

impl From<HuffmanError> for SymbolTableError {
    fn from(e: HuffmanError) -> Self {
        match e {
            HuffmanError::UnexpectedEnd => SymbolTableError::UnexpectedEnd,
            other => SymbolTableError::InvalidTree(other),
        }
    }
}

/// The decoding tables of a single packet.
#[derive(Debug)]
pub struct SymbolTable {
    literal_tree: HuffmanTree,
    distance_tree: Option<HuffmanTree>,
    eod: VarBits,
    deflate64: bool,
}

impl SymbolTable {
    /// Parse a dynamic-Huffman packet header. On entry the cursor sits just
    /// past the 3-bit packet header; on success it sits on the first symbol.
    pub fn parse(
        cursor: &mut BitCursor<'_>,
        end: &BitCursor<'_>,
        deflate64: bool,
    ) -> Result<SymbolTable, SymbolTableError> {
        let num_lit_codes = cursor.next_bits(5) as usize + 257;
        if num_lit_codes > MAX_LITERAL_CODES && !deflate64 {
            return Err(SymbolTableError::InvalidHeader);
        }
        let num_dist_codes = cursor.next_bits(5) as usize + 1;
        if num_dist_codes > DIST_CODES && !deflate64 {
            return Err(SymbolTableError::InvalidHeader);
        }
        if num_lit_codes == 257 && num_dist_codes > 1 {
            // distance codes make no sense without any length codes
            return Err(SymbolTableError::InvalidHeader);
        }
        let num_len_codes = cursor.next_bits(4) as usize + 4;

        let mut bit_lengths = HuffmanLengthTable::new();
        let mut lengths = [0u8; NUM_BIT_LENGTHS];
        for i in 0..num_len_codes {
            lengths[BIT_LENGTH_ORDER[i]] = cursor.next_bits(3) as u8;
            if *cursor > *end {
                return Err(SymbolTableError::UnexpectedEnd);
            }
        }
        for (sym, &len) in lengths.iter().enumerate() {
            bit_lengths.add_symbol(sym as u16, len);
        }
        let bit_length_tree = bit_lengths.build()?;

        let mut lit_lengths = HuffmanLengthTable::new();
        let mut dist_lengths = HuffmanLengthTable::new();
        decode_bit_lengths(
            num_lit_codes,
            &mut lit_lengths,
            num_dist_codes,
            &mut dist_lengths,
            &bit_length_tree,
            cursor,
            end,
        )?;

        let literal_tree = lit_lengths.build()?;
        let distance_tree = dist_lengths.build().ok();
        let eod = literal_tree
            .code_for(END_OF_DATA)
            .ok_or(SymbolTableError::InvalidHeader)?;
        Ok(SymbolTable {
            literal_tree,
            distance_tree,
            eod,
            deflate64,
        })
    }

    /// The fixed tables of RFC 1951 §3.2.6.
    pub fn fixed(deflate64: bool) -> SymbolTable {
        let mut lit = HuffmanLengthTable::new();
        lit.make_default_literals();
        let mut dist = HuffmanLengthTable::new();
        dist.make_default_distances();
        let literal_tree = lit.build().expect("fixed literal table is valid");
        let distance_tree = dist.build().expect("fixed distance table is valid");
        let eod = literal_tree.code_for(END_OF_DATA).unwrap();
        SymbolTable {
            literal_tree,
            distance_tree: Some(distance_tree),
            eod,
            deflate64,
        }
    }

    /// Build from already-decoded trees (used when reconstructing a packet
    /// whose header is missing).
    pub fn from_trees(
        literal_tree: HuffmanTree,
        distance_tree: Option<HuffmanTree>,
        deflate64: bool,
    ) -> Option<SymbolTable> {
        let eod = literal_tree.code_for(END_OF_DATA)?;
        Some(SymbolTable {
            literal_tree,
            distance_tree,
            eod,
            deflate64,
        })
    }

    /// The literal tree's code for symbol 256.
    pub fn eod(&self) -> VarBits {
        self.eod
    }

    pub fn deflate64(&self) -> bool {
        self.deflate64
    }

    pub fn literal_tree(&self) -> &HuffmanTree {
        &self.literal_tree
    }

    pub fn distance_tree(&self) -> Option<&HuffmanTree> {
        self.distance_tree.as_ref()
    }

    /// Decode the next literal/length symbol without consuming extra bits.
    pub fn next_symbol(
        &self,
        cursor: &mut BitCursor<'_>,
        end: &BitCursor<'_>,
    ) -> Result<u16, HuffmanError> {
        self.literal_tree.next_symbol(cursor, end)
    }

    /// Decode the next symbol and verify that its extra bits are available
    /// without consuming them.
    pub fn next_value(
        &self,
        cursor: &mut BitCursor<'_>,
        end: &BitCursor<'_>,
    ) -> Result<u16, HuffmanError> {
        let symbol = self.next_symbol(cursor, end)?;
        if symbol <= 264 {
            return Ok(symbol);
        }
        if symbol > 285 {
            return Err(HuffmanError::InvalidCode);
        }
        let extra = length_extra_bits(symbol, self.deflate64) as usize;
        if cursor.in_bounds(end, extra) {
            Ok(symbol)
        } else {
            Err(HuffmanError::UnexpectedEnd)
        }
    }

    /// Skip over the next literal or length/distance pair. Returns `false`
    /// on any decoding problem.
    pub fn advance(&self, cursor: &mut BitCursor<'_>, end: &BitCursor<'_>) -> bool {
        let symbol = match self.next_symbol(cursor, end) {
            Ok(s) => s,
            Err(_) => return false,
        };
        if symbol <= END_OF_DATA {
            return true;
        }
        cursor.advance(length_extra_bits(symbol, self.deflate64) as usize);
        let dist_tree = match &self.distance_tree {
            Some(t) => t,
            None => return false,
        };
        let dist_sym = match dist_tree.next_symbol(cursor, end) {
            Ok(s) => s as usize,
            Err(_) => return false,
        };
        if dist_sym >= DIST_CODES && !self.deflate64 {
            return false;
        }
        if dist_sym >= DIST_CODES_64 {
            return false;
        }
        cursor.advance(DIST_CODE_BITS[dist_sym] as usize);
        *cursor <= *end
    }

    /// Resolve a length symbol (257..=285) to a match length, consuming its
    /// extra bits. `None` for out-of-range symbols.
    pub fn length(&self, symbol: u16, cursor: &mut BitCursor<'_>) -> Option<u32> {
        match symbol {
            257..=264 => Some(symbol as u32 - 254),
            265..=284 => {
                // one-based after the shift, so subtract four less
                let code = symbol as u32 - 261;
                let hi = code & 3;
                let bucket = code >> 2;
                let extra = cursor.next_bits(bucket as usize);
                Some(LENGTH_CODE_OFFSET[bucket as usize] + ((hi << bucket) | extra))
            }
            285 => {
                if self.deflate64 {
                    Some(3 + cursor.next_bits(16))
                } else {
                    Some(258)
                }
            }
            _ => None,
        }
    }

    /// Decode a distance symbol plus extra bits. `None` on an invalid or
    /// out-of-range code.
    pub fn distance(&self, cursor: &mut BitCursor<'_>, end: &BitCursor<'_>) -> Option<u32> {
        let dist_tree = self.distance_tree.as_ref()?;
        let symbol = dist_tree.next_symbol(cursor, end).ok()? as usize;
        if symbol < 4 {
            return Some(DIST_CODE_OFFSET[symbol]);
        }
        if symbol >= DIST_CODES && !self.deflate64 {
            return None;
        }
        if symbol >= DIST_CODES_64 {
            return None;
        }
        let extra = cursor.next_bits(DIST_CODE_BITS[symbol] as usize);
        Some(DIST_CODE_OFFSET[symbol] + extra)
    }
}

/// Cached fixed tables; the scanner consults them for every candidate bit
/// offset, so they are built once.
pub fn default_tables(deflate64: bool) -> &'static SymbolTable {
    static FIXED: OnceLock<SymbolTable> = OnceLock::new();
    static FIXED64: OnceLock<SymbolTable> = OnceLock::new();
    if deflate64 {
        FIXED64.get_or_init(|| SymbolTable::fixed(true))
    } else {
        FIXED.get_or_init(|| SymbolTable::fixed(false))
    }
}

/// Decode the run-length-compressed literal and distance bit-length vectors
/// of a dynamic header. The two vectors are contiguous on the wire, so copy
/// instructions may span the boundary between them.
pub fn decode_bit_lengths(
    lit_count: usize,
    lit_lengths: &mut HuffmanLengthTable,
    dist_count: usize,
    dist_lengths: &mut HuffmanLengthTable,
    bit_length_tree: &HuffmanTree,
    cursor: &mut BitCursor<'_>,
    end: &BitCursor<'_>,
) -> Result<(), SymbolTableError> {
    let count = lit_count + dist_count;
    let mut prev_length = 0u8;
    let mut i = 0usize;
    while i < count {
        let code = bit_length_tree
            .next_symbol(cursor, end)
            .map_err(SymbolTableError::from)?;
        let (mut copy_count, len) = match code {
            0..=15 => {
                prev_length = code as u8;
                (1usize, code as u8)
            }
            16 => {
                if i == 0 {
                    // no previous length to copy
                    return Err(SymbolTableError::InvalidBitLengths);
                }
                (3 + cursor.next_bits(2) as usize, prev_length)
            }
            17 => (3 + cursor.next_bits(3) as usize, 0),
            18 => (11 + cursor.next_bits(7) as usize, 0),
            _ => return Err(SymbolTableError::InvalidBitLengths),
        };
        while copy_count > 0 && i < count {
            if i == END_OF_DATA as usize && len == 0 {
                // the end-of-data symbol must be present
                return Err(SymbolTableError::InvalidBitLengths);
            }
            if i < lit_count {
                lit_lengths.add_symbol(i as u16, len);
            } else {
                dist_lengths.add_symbol((i - lit_count) as u16, len);
            }
            i += 1;
            copy_count -= 1;
        }
        if copy_count > 0 {
            // too many bit lengths
            return Err(SymbolTableError::InvalidBitLengths);
        }
        if *cursor > *end {
            return Err(SymbolTableError::UnexpectedEnd);
        }
    }
    if lit_lengths.count(0) == lit_count
        || (dist_count > 1 && dist_lengths.count(0) == dist_count)
    {
        // an all-zero table is not allowed
        return Err(SymbolTableError::InvalidBitLengths);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::BitCursor;

    #[test]
    fn fixed_table_eod_code() {
        let symtab = SymbolTable::fixed(false);
        assert_eq!(symtab.eod().value(), 0);
        assert_eq!(symtab.eod().length(), 7);
    }

    #[test]
    fn fixed_table_decodes_literal() {
        // literal 'a' (97) has fixed code 0b10010001 (8 bits)
        let symtab = SymbolTable::fixed(false);
        let code = symtab.literal_tree().code_for(b'a' as u16).unwrap();
        assert_eq!(code.length(), 8);
        // write the code MSB-first into an LSB-first byte
        let byte = crate::bits::reverse_bits(code.value(), 8) as u8;
        let data = [byte];
        let mut cur = BitCursor::new(&data);
        let end = BitCursor::at_end(&data);
        assert_eq!(symtab.next_symbol(&mut cur, &end).unwrap(), b'a' as u16);
    }

    #[test]
    fn length_decoding_bases() {
        let symtab = SymbolTable::fixed(false);
        let data = [0u8; 4];
        let mut cur = BitCursor::new(&data);
        assert_eq!(symtab.length(257, &mut cur), Some(3));
        assert_eq!(symtab.length(264, &mut cur), Some(10));
        assert_eq!(symtab.length(265, &mut cur), Some(11));
        assert_eq!(symtab.length(285, &mut cur), Some(258));
        assert_eq!(symtab.length(256, &mut cur), None);
        assert_eq!(symtab.length(286, &mut cur), None);
    }

    #[test]
    fn length_extra_bits_add_in() {
        let symtab = SymbolTable::fixed(false);
        // symbol 265 covers lengths 11-12 with one extra bit
        let data = [0b1u8];
        let mut cur = BitCursor::new(&data);
        assert_eq!(symtab.length(265, &mut cur), Some(12));
    }

    #[test]
    fn distance_decoding() {
        let symtab = SymbolTable::fixed(false);
        // fixed distance codes are 5 bits, symbol value in code order;
        // symbol 4 (base 5, 1 extra bit) followed by an extra bit of 1
        let sym4 = crate::bits::reverse_bits(4, 5) as u8;
        let data = [sym4 | (1 << 5)];
        let mut cur = BitCursor::new(&data);
        let end = BitCursor::at_end(&data);
        assert_eq!(symtab.distance(&mut cur, &end), Some(6));
    }

    #[test]
    fn header_sanity_checks() {
        // 5 bits lit-count = 31 (=> 288 codes) is invalid for classic deflate
        let data = [0xFFu8, 0xFF, 0xFF, 0xFF];
        let mut cur = BitCursor::new(&data);
        let end = BitCursor::at_end(&data);
        assert_eq!(
            SymbolTable::parse(&mut cur, &end, false).unwrap_err(),
            SymbolTableError::InvalidHeader
        );
    }
}
