//! The output buffer of a recovery run.
//!
//! Every decoded byte is tagged: a literal with a confidence level, an
//! inferred literal that records the unresolved origin it came from, an
//! unresolved reference into content we never saw, or a discontinuity
//! marker standing where an unrecoverable span was skipped. Back-reference
//! copies propagate origins so that all copies of one unknown byte form an
//! equivalence class the reconstructor can solve once.

use crate::deflate::{MAX_MATCH, MAX_MATCH_64, MIN_MATCH, REFERENCE_WINDOW, REFERENCE_WINDOW_64};

/// Number of confidence levels; a byte decoded straight from an intact
/// packet carries the maximum.
pub const CONFIDENCE_LEVELS: u8 = 100;

/// Confidence of a byte nothing is known about.
pub const CONFIDENCE_UNKNOWN: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodedByte {
    /// A byte decoded directly from the compressed stream.
    Literal { value: u8, confidence: u8 },
    /// A formerly unresolved byte assigned by the reconstructor; the origin
    /// is preserved so equivalence classes stay identifiable.
    Inferred {
        value: u8,
        confidence: u8,
        origin: u32,
    },
    /// A byte whose value is unknown; all positions sharing `origin` hold
    /// the same (unknown) value.
    Reference { origin: u32 },
    /// Marks the seam where an unrecoverable span was skipped.
    Discontinuity,
}

impl DecodedByte {
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            DecodedByte::Literal { .. } | DecodedByte::Inferred { .. }
        )
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, DecodedByte::Reference { .. })
    }

    pub fn is_inferred(&self) -> bool {
        matches!(self, DecodedByte::Inferred { .. })
    }

    pub fn is_discontinuity(&self) -> bool {
        matches!(self, DecodedByte::Discontinuity)
    }

    /// The byte value, or 0 for positions that have none.
    pub fn byte_value(&self) -> u8 {
        match self {
            DecodedByte::Literal { value, .. } | DecodedByte::Inferred { value, .. } => *value,
            _ => 0,
        }
    }

    pub fn confidence(&self) -> u8 {
        match self {
            DecodedByte::Literal { confidence, .. } | DecodedByte::Inferred { confidence, .. } => {
                *confidence
            }
            _ => CONFIDENCE_UNKNOWN,
        }
    }

    pub fn origin(&self) -> Option<u32> {
        match self {
            DecodedByte::Inferred { origin, .. } | DecodedByte::Reference { origin } => {
                Some(*origin)
            }
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BufferError {
    /// A back-reference reaches before the earliest addressable position.
    InvalidDistance { distance: u32, available: usize },
    /// A back-reference length is outside [3, 258] (or the DEFLATE64 bound).
    InvalidLength { length: u32 },
}

impl core::fmt::Display for BufferError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BufferError::InvalidDistance {
                distance,
                available,
            } => write!(
                f,
                "back-reference distance {} exceeds {} available bytes",
                distance, available
            ),
            BufferError::InvalidLength { length } => {
                write!(f, "back-reference length {} out of range", length)
            }
        }
    }
}

impl std::error::Error for BufferError {}

/// Per-origin occurrence counts (how many buffer positions share the
/// origin beyond its first appearance).
pub struct WildcardCounts {
    counts: Vec<u32>,
}

impl WildcardCounts {
    fn new() -> WildcardCounts {
        WildcardCounts { counts: Vec::new() }
    }

    fn ensure(&mut self, origin: u32) {
        if origin as usize >= self.counts.len() {
            self.counts.resize(origin as usize + 1, 0);
        }
    }

    pub fn count(&self, origin: u32) -> u32 {
        self.counts.get(origin as usize).copied().unwrap_or(0)
    }

    pub fn incr(&mut self, origin: u32) {
        self.ensure(origin);
        self.counts[origin as usize] += 1;
    }

    pub fn num_counts(&self) -> usize {
        self.counts.len()
    }

    /// Highest origin that actually occurs in decoded output.
    pub fn highest_used(&self) -> u32 {
        self.counts
            .iter()
            .rposition(|&c| c > 0)
            .map(|i| i as u32)
            .unwrap_or(0)
    }
}

/// Sliding-window output buffer of decoded bytes.
pub struct DecodeBuffer {
    bytes: Vec<DecodedByte>,
    replacements: Vec<Option<(u8, u8)>>,
    wildcard_counts: WildcardCounts,
    /// Buffer indices of discontinuity markers.
    discontinuities: Vec<usize>,
    next_origin: u32,
    refwindow: usize,
    max_match: usize,
    deflate64: bool,
}

impl DecodeBuffer {
    pub fn new(deflate64: bool) -> DecodeBuffer {
        DecodeBuffer {
            bytes: Vec::new(),
            replacements: Vec::new(),
            wildcard_counts: WildcardCounts::new(),
            discontinuities: Vec::new(),
            next_origin: 0,
            refwindow: if deflate64 {
                REFERENCE_WINDOW_64
            } else {
                REFERENCE_WINDOW
            },
            max_match: if deflate64 { MAX_MATCH_64 } else { MAX_MATCH },
            deflate64,
        }
    }

    pub fn deflate64(&self) -> bool {
        self.deflate64
    }

    pub fn reference_window(&self) -> usize {
        self.refwindow
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[DecodedByte] {
        &self.bytes
    }

    pub fn byte(&self, index: usize) -> DecodedByte {
        self.bytes[index]
    }

    pub fn num_origins(&self) -> u32 {
        self.next_origin
    }

    pub fn wildcard_counts(&self) -> &WildcardCounts {
        &self.wildcard_counts
    }

    pub fn discontinuities(&self) -> &[usize] {
        &self.discontinuities
    }

    pub fn push_literal(&mut self, value: u8, confidence: u8) {
        self.bytes.push(DecodedByte::Literal { value, confidence });
    }

    pub fn push_string(&mut self, text: &[u8], confidence: u8) {
        for &b in text {
            self.push_literal(b, confidence);
        }
    }

    /// Copy `length` bytes starting `distance` back. Unresolved sources are
    /// copied as references to the same origin, so the copy stays in the
    /// origin's equivalence class.
    pub fn copy_reference(&mut self, length: u32, distance: u32) -> Result<(), BufferError> {
        if (length as usize) < MIN_MATCH || length as usize > self.max_match {
            return Err(BufferError::InvalidLength { length });
        }
        if distance == 0
            || distance as usize > self.refwindow
            || distance as usize > self.bytes.len()
        {
            return Err(BufferError::InvalidDistance {
                distance,
                available: self.bytes.len(),
            });
        }
        for _ in 0..length {
            let src = self.bytes[self.bytes.len() - distance as usize];
            match src {
                DecodedByte::Reference { origin } => {
                    self.wildcard_counts.incr(origin);
                    self.bytes.push(DecodedByte::Reference { origin });
                }
                DecodedByte::Discontinuity => {
                    // cannot happen while every discontinuity reserves a
                    // full window of fresh origins; treat it as unknown
                    let origin = self.fresh_origin();
                    self.bytes.push(DecodedByte::Reference { origin });
                }
                other => self.bytes.push(other),
            }
        }
        Ok(())
    }

    fn fresh_origin(&mut self) -> u32 {
        let origin = self.next_origin;
        self.next_origin += 1;
        self.replacements.push(None);
        self.wildcard_counts.ensure(origin);
        origin
    }

    /// Append an unresolved position with a fresh origin.
    pub fn push_unknown(&mut self) -> u32 {
        let origin = self.fresh_origin();
        self.bytes.push(DecodedByte::Reference { origin });
        origin
    }

    /// Append another occurrence of an existing unresolved origin.
    pub fn push_unknown_again(&mut self, origin: u32) {
        self.wildcard_counts.incr(origin);
        self.bytes.push(DecodedByte::Reference { origin });
    }

    /// Insert a discontinuity marker followed by `max_backref` unresolved
    /// positions with fresh origins, so back-references decoded after the
    /// gap stay addressable.
    pub fn push_discontinuity(&mut self, max_backref: usize, _clear: bool) {
        self.discontinuities.push(self.bytes.len());
        self.bytes.push(DecodedByte::Discontinuity);
        for _ in 0..max_backref {
            let origin = self.fresh_origin();
            self.bytes.push(DecodedByte::Reference { origin });
        }
    }

    /// Record the inferred value for every position sharing `origin`.
    pub fn apply_replacement(&mut self, origin: u32, value: u8, confidence: u8) {
        if let Some(slot) = self.replacements.get_mut(origin as usize) {
            *slot = Some((value, confidence));
        }
    }

    pub fn replacement(&self, origin: u32) -> Option<(u8, u8)> {
        self.replacements.get(origin as usize).copied().flatten()
    }

    pub fn have_replacement(&self, origin: u32) -> bool {
        self.replacement(origin).is_some()
    }

    pub fn num_replacements(&self) -> usize {
        self.replacements.len()
    }

    /// Resolve one entry against the replacement store.
    pub fn resolve(&self, db: DecodedByte) -> DecodedByte {
        match db {
            DecodedByte::Reference { origin } => match self.replacement(origin) {
                Some((value, confidence)) => DecodedByte::Inferred {
                    value,
                    confidence,
                    origin,
                },
                None => db,
            },
            other => other,
        }
    }

    /// Rewrite the buffer, turning every reference with a replacement into
    /// an inferred literal. Running it again changes nothing.
    pub fn finalize(&mut self) {
        for i in 0..self.bytes.len() {
            self.bytes[i] = self.resolve(self.bytes[i]);
        }
    }

    /// The finished output: buffer contents minus reserved positions that
    /// were never referenced and never assigned a value.
    pub fn finalized_bytes(&self) -> Vec<DecodedByte> {
        let mut reserved: Vec<bool> = vec![false; self.bytes.len()];
        for &m in &self.discontinuities {
            let end = (m + 1 + self.refwindow).min(self.bytes.len());
            for flag in reserved.iter_mut().take(end).skip(m + 1) {
                *flag = true;
            }
        }
        let mut out = Vec::with_capacity(self.bytes.len());
        for (i, &db) in self.bytes.iter().enumerate() {
            let resolved = self.resolve(db);
            match resolved {
                DecodedByte::Reference { origin }
                    if reserved[i] && self.wildcard_counts.count(origin) == 0 =>
                {
                    // a reserved stand-in nothing ever pointed at
                }
                other => out.push(other),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_copy_preserves_values() {
        let mut buf = DecodeBuffer::new(false);
        buf.push_string(b"ABC", CONFIDENCE_LEVELS);
        buf.copy_reference(3, 3).unwrap();
        let values: Vec<u8> = buf.bytes().iter().map(|b| b.byte_value()).collect();
        assert_eq!(values, b"ABCABC");
    }

    #[test]
    fn overlapping_copy_repeats() {
        let mut buf = DecodeBuffer::new(false);
        buf.push_literal(b'a', CONFIDENCE_LEVELS);
        buf.copy_reference(5, 1).unwrap();
        let values: Vec<u8> = buf.bytes().iter().map(|b| b.byte_value()).collect();
        assert_eq!(values, b"aaaaaa");
    }

    #[test]
    fn invalid_references_rejected() {
        let mut buf = DecodeBuffer::new(false);
        buf.push_string(b"xy", CONFIDENCE_LEVELS);
        assert!(matches!(
            buf.copy_reference(3, 5),
            Err(BufferError::InvalidDistance { .. })
        ));
        assert!(matches!(
            buf.copy_reference(2, 1),
            Err(BufferError::InvalidLength { .. })
        ));
        assert!(matches!(
            buf.copy_reference(259, 1),
            Err(BufferError::InvalidLength { .. })
        ));
    }

    #[test]
    fn discontinuity_reserves_addressable_window() {
        let mut buf = DecodeBuffer::new(false);
        buf.push_discontinuity(REFERENCE_WINDOW, false);
        assert_eq!(buf.len(), REFERENCE_WINDOW + 1);
        // a maximal-distance reference right after the gap must resolve
        buf.copy_reference(3, REFERENCE_WINDOW as u32).unwrap();
        let copied = buf.byte(REFERENCE_WINDOW + 1);
        assert!(copied.is_reference());
        assert_eq!(copied.origin(), buf.byte(1).origin());
    }

    #[test]
    fn copies_share_origin_class() {
        let mut buf = DecodeBuffer::new(false);
        buf.push_discontinuity(8, false);
        buf.copy_reference(4, 4).unwrap();
        let o1 = buf.byte(5).origin().unwrap();
        let o2 = buf.byte(9).origin().unwrap();
        assert_eq!(o1, o2);
        assert_eq!(buf.wildcard_counts().count(o1), 1);
    }

    #[test]
    fn replacements_resolve_whole_class() {
        let mut buf = DecodeBuffer::new(false);
        buf.push_discontinuity(4, false);
        buf.copy_reference(4, 4).unwrap();
        let origin = buf.byte(1).origin().unwrap();
        buf.apply_replacement(origin, b'Q', 42);
        buf.finalize();
        let b = buf.byte(1);
        assert!(b.is_inferred());
        assert_eq!(b.byte_value(), b'Q');
        assert_eq!(b.confidence(), 42);
        assert_eq!(b.origin(), Some(origin));
        let copy = buf.byte(5);
        assert_eq!(copy.byte_value(), b'Q');
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut buf = DecodeBuffer::new(false);
        buf.push_discontinuity(4, false);
        buf.push_string(b"end", CONFIDENCE_LEVELS);
        let origin = buf.byte(2).origin().unwrap();
        buf.apply_replacement(origin, b'z', 10);
        buf.finalize();
        let snapshot = buf.bytes().to_vec();
        buf.finalize();
        assert_eq!(buf.bytes(), snapshot.as_slice());
    }

    #[test]
    fn finalized_bytes_drop_unused_reserved_positions() {
        let mut buf = DecodeBuffer::new(false);
        buf.push_discontinuity(8, false);
        buf.copy_reference(3, 8).unwrap();
        buf.push_string(b"!", CONFIDENCE_LEVELS);
        let out = buf.finalized_bytes();
        // marker + 3 referenced reserved positions + 3 copies + literal
        let references = out.iter().filter(|b| b.is_reference()).count();
        assert_eq!(references, 6);
        assert!(out.iter().any(|b| b.is_discontinuity()));
        assert_eq!(out.last().unwrap().byte_value(), b'!');
    }
}
