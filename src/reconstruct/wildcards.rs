//! Sets of candidate byte values for unresolved positions, and the
//! character-encoding rules that prune them.

use crate::decoding::decodebuffer::DecodedByte;

/// A 256-bit membership set with a cached population count.
#[derive(Clone)]
pub struct WildcardSet {
    bits: [u64; 4],
    count: u16,
}

impl WildcardSet {
    pub fn new(allow_all: bool) -> WildcardSet {
        if allow_all {
            WildcardSet {
                bits: [u64::MAX; 4],
                count: 256,
            }
        } else {
            WildcardSet {
                bits: [0; 4],
                count: 0,
            }
        }
    }

    pub fn set_size(&self) -> usize {
        self.count as usize
    }

    pub fn contains(&self, value: u8) -> bool {
        self.bits[value as usize / 64] >> (value % 64) & 1 != 0
    }

    pub fn first_member(&self) -> u8 {
        for (w, &word) in self.bits.iter().enumerate() {
            if word != 0 {
                return (w * 64 + word.trailing_zeros() as usize) as u8;
            }
        }
        0
    }

    pub fn cache_set_size(&mut self) {
        self.count = self.bits.iter().map(|w| w.count_ones() as u16).sum();
    }

    pub fn add(&mut self, value: u8) {
        let word = &mut self.bits[value as usize / 64];
        let mask = 1u64 << (value % 64);
        if *word & mask == 0 {
            *word |= mask;
            self.count += 1;
        }
    }

    pub fn add_all(&mut self) {
        self.bits = [u64::MAX; 4];
        self.count = 256;
    }

    pub fn remove(&mut self, value: u8) {
        let word = &mut self.bits[value as usize / 64];
        let mask = 1u64 << (value % 64);
        if *word & mask != 0 {
            *word &= !mask;
            self.count -= 1;
        }
    }

    pub fn remove_range(&mut self, first: u8, last: u8) {
        for value in first..=last {
            self.remove(value);
        }
    }

    pub fn remove_all(&mut self) {
        self.bits = [0; 4];
        self.count = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0u16..256).filter(move |&v| self.contains(v as u8)).map(|v| v as u8)
    }
}

/// One wildcard set per unresolved origin.
pub struct WildcardCollection {
    sets: Vec<WildcardSet>,
}

impl WildcardCollection {
    pub fn new(num_sets: usize, allow_all: bool) -> WildcardCollection {
        WildcardCollection {
            sets: vec![WildcardSet::new(allow_all); num_sets],
        }
    }

    pub fn num_sets(&self) -> usize {
        self.sets.len()
    }

    pub fn set(&self, origin: u32) -> Option<&WildcardSet> {
        self.sets.get(origin as usize)
    }

    pub fn set_mut(&mut self, origin: u32) -> Option<&mut WildcardSet> {
        self.sets.get_mut(origin as usize)
    }

    pub fn set_size(&self, origin: u32) -> usize {
        self.set(origin).map(|s| s.set_size()).unwrap_or(0)
    }

    pub fn contains(&self, origin: u32, value: u8) -> bool {
        self.set(origin).map(|s| s.contains(value)).unwrap_or(false)
    }

    pub fn remove(&mut self, origin: u32, value: u8) {
        if let Some(set) = self.set_mut(origin) {
            set.remove(value);
        }
    }

    pub fn remove_range(&mut self, origin: u32, first: u8, last: u8) {
        if let Some(set) = self.set_mut(origin) {
            set.remove_range(first, last);
        }
    }

    pub fn remove_all(&mut self, origin: u32) {
        if let Some(set) = self.set_mut(origin) {
            set.remove_all();
        }
    }

    pub fn remove_from_all(&mut self, value: u8) {
        for set in &mut self.sets {
            set.remove(value);
        }
    }

    /// Constraints that empty a set are inconsistent with the file; such
    /// sets revert to allowing everything rather than over-restricting.
    pub fn allow_all_if_empty(&mut self) {
        for set in &mut self.sets {
            if set.set_size() == 0 {
                set.add_all();
            }
        }
    }
}

/// Remove byte values that would produce invalid UTF-8 around known
/// literals.
pub fn eliminate_invalid_utf8(wildcards: &mut WildcardCollection, bytes: &[DecodedByte]) {
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i].is_literal() {
            let byte = bytes[i].byte_value();
            if byte & 0x80 == 0 {
                // the following byte must not be a continuation byte
                if let Some(origin) = continuation_target(&bytes[i + 1]) {
                    wildcards.remove_range(origin, 0x80, 0xBF);
                }
            } else if byte & 0xC0 == 0x80 {
                // a continuation byte cannot follow a 7-bit byte
                if i > 0 {
                    if let Some(origin) = continuation_target(&bytes[i - 1]) {
                        wildcards.remove_range(origin, 0x00, 0x7F);
                    }
                }
            } else {
                // lead byte: the required number of continuation bytes
                // must all be continuation-valid
                let mut lead = byte;
                while lead & 0x40 != 0 && i + 1 < bytes.len() {
                    if let Some(origin) = continuation_target(&bytes[i + 1]) {
                        wildcards.remove_range(origin, 0x00, 0x7F);
                        wildcards.remove_range(origin, 0xC0, 0xFF);
                    }
                    lead <<= 1;
                    i += 1;
                }
            }
        }
        i += 1;
    }
}

fn continuation_target(db: &DecodedByte) -> Option<u32> {
    if db.is_reference() {
        db.origin()
    } else {
        None
    }
}

/// For 16-bit fixed-width encodings every other byte is zero; detect the
/// parity from known literals and enforce it on unknowns.
pub fn eliminate_invalid_utf16(wildcards: &mut WildcardCollection, bytes: &[DecodedByte]) {
    // 2 = undetermined, 0/1 = the parity whose bytes are the zero bytes
    let mut alignment = 2usize;
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i].is_literal() && bytes[i + 1].is_literal() {
            let v1 = bytes[i].byte_value();
            let v2 = bytes[i + 1].byte_value();
            if alignment == 2 {
                if v1 == 0 && v2 != 0 {
                    alignment = 0;
                } else if v1 != 0 && v2 == 0 {
                    alignment = 1;
                }
            } else if alignment == 1 && v1 == 0 {
                return; // inconsistent alignment, leave the sets alone
            } else if alignment == 0 && v2 == 0 {
                return;
            }
        }
        i += 2;
    }
    if alignment == 2 {
        return;
    }
    for (i, db) in bytes.iter().enumerate() {
        if db.is_literal() {
            continue;
        }
        if let Some(origin) = db.origin() {
            if i % 2 == alignment {
                // this parity holds the zero bytes
                if wildcards.set_size(origin) > 1 {
                    wildcards.remove_range(origin, 0x01, 0xFF);
                }
            } else {
                wildcards.remove(origin, 0x00);
            }
        }
    }
}

/// EUC encodings use high-bit bytes in pairs; a lone unknown between two
/// 7-bit literals cannot be high-bit.
pub fn eliminate_invalid_euc(wildcards: &mut WildcardCollection, bytes: &[DecodedByte]) {
    for i in 1..bytes.len().saturating_sub(1) {
        if bytes[i].is_reference()
            && bytes[i - 1].is_literal()
            && bytes[i + 1].is_literal()
            && bytes[i - 1].byte_value() & 0x80 == 0
            && bytes[i + 1].byte_value() & 0x80 == 0
        {
            if let Some(origin) = bytes[i].origin() {
                wildcards.remove_range(origin, 0x80, 0xFF);
            }
        }
    }
}

/// When the file uses CR-LF line endings, unknown bytes adjacent to either
/// half must not break the convention.
pub fn enforce_crlf(wildcards: &mut WildcardCollection, bytes: &[DecodedByte]) {
    for i in 1..bytes.len().saturating_sub(1) {
        if !bytes[i].is_reference() {
            continue;
        }
        let origin = match bytes[i].origin() {
            Some(o) => o,
            None => continue,
        };
        if bytes[i - 1].is_literal() && bytes[i - 1].byte_value() == b'\r' {
            wildcards.remove(origin, b'\n');
        } else if bytes[i + 1].is_literal() && bytes[i + 1].byte_value() == b'\n' {
            wildcards.remove(origin, b'\r');
        }
    }
}

/// Character encodings recognized by the pruning passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Ascii,
    Utf8,
    Latin1,
    Utf16,
    Euc,
}

/// Apply the encoding-specific pruning passes, then undo any set the
/// constraints emptied.
pub fn eliminate_invalid_encodings(
    wildcards: &mut WildcardCollection,
    encoding: TextEncoding,
    bytes: &[DecodedByte],
) {
    match encoding {
        TextEncoding::Utf8 => eliminate_invalid_utf8(wildcards, bytes),
        TextEncoding::Utf16 => eliminate_invalid_utf16(wildcards, bytes),
        TextEncoding::Euc => eliminate_invalid_euc(wildcards, bytes),
        TextEncoding::Ascii | TextEncoding::Latin1 => {}
    }
    wildcards.allow_all_if_empty();
}
