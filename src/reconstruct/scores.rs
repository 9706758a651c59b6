//! Score vectors and the small bookkeeping structures of the
//! reconstruction loop.

/// Scores are kept in single precision to halve the working-set size.
pub type Score = f32;

/// Context quality seen for one unresolved position.
#[derive(Clone, Copy, Default)]
pub struct ContextFlags {
    flags: u8,
}

impl ContextFlags {
    const LEFT: u8 = 1;
    const RIGHT: u8 = 2;
    const CENTER: u8 = 4;

    pub fn clear(&mut self) {
        self.flags = 0;
    }

    pub fn good_left(&self) -> bool {
        self.flags & Self::LEFT != 0
    }

    pub fn good_right(&self) -> bool {
        self.flags & Self::RIGHT != 0
    }

    pub fn good_center(&self) -> bool {
        self.flags & Self::CENTER != 0
    }

    pub fn any_good(&self) -> bool {
        self.flags != 0
    }

    pub fn set_left(&mut self) {
        self.flags |= Self::LEFT;
    }

    pub fn set_right(&mut self) {
        self.flags |= Self::RIGHT;
    }

    pub fn set_side(&mut self, right: bool) {
        self.flags |= if right { Self::RIGHT } else { Self::LEFT };
    }

    pub fn set_center(&mut self) {
        self.flags |= Self::CENTER;
    }
}

/// A 256-way score vector with cached top-two metadata.
pub struct ScoreVector {
    scores: [Score; 256],
    highest: Score,
    second: Score,
    high_index: u8,
    dirty: bool,
}

impl ScoreVector {
    pub fn new() -> ScoreVector {
        ScoreVector {
            scores: [0.0; 256],
            highest: 0.0,
            second: 0.0,
            high_index: 0,
            dirty: false,
        }
    }

    pub fn clear(&mut self) {
        self.scores = [0.0; 256];
        self.highest = 0.0;
        self.second = 0.0;
        self.high_index = 0;
        self.dirty = false;
    }

    pub fn score(&self, byte: u8) -> Score {
        self.scores[byte as usize]
    }

    pub fn scores_mut(&mut self) -> &mut [Score; 256] {
        self.dirty = true;
        &mut self.scores
    }

    pub fn set(&mut self, byte: u8, value: Score) {
        self.scores[byte as usize] = value;
        self.dirty = true;
    }

    pub fn incr(&mut self, byte: u8, delta: Score) {
        self.scores[byte as usize] += delta;
        self.dirty = true;
    }

    pub fn clear_byte(&mut self, byte: u8) {
        self.scores[byte as usize] = 0.0;
        self.dirty = true;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn find_top(&mut self) {
        let mut hi = self.scores[0];
        let mut second = Score::MIN;
        let mut hi_idx = 0u8;
        for (i, &sc) in self.scores.iter().enumerate().skip(1) {
            if sc > hi {
                second = hi;
                hi = sc;
                hi_idx = i as u8;
            } else if sc > second {
                second = sc;
            }
        }
        self.highest = hi;
        self.second = second;
        self.high_index = hi_idx;
        self.dirty = false;
    }

    pub fn highest(&mut self) -> Score {
        if self.dirty {
            self.find_top();
        }
        self.highest
    }

    pub fn second(&mut self) -> Score {
        if self.dirty {
            self.find_top();
        }
        self.second
    }

    pub fn index_of_highest(&mut self) -> u8 {
        if self.dirty {
            self.find_top();
        }
        self.high_index
    }
}

impl Default for ScoreVector {
    fn default() -> Self {
        ScoreVector::new()
    }
}

/// Score vectors indexed by unresolved origin.
pub struct ScoreCollection {
    scores: Vec<ScoreVector>,
}

impl ScoreCollection {
    pub fn new(num_origins: usize) -> ScoreCollection {
        let mut scores = Vec::with_capacity(num_origins);
        scores.resize_with(num_origins, ScoreVector::new);
        ScoreCollection { scores }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn vector(&self, origin: u32) -> &ScoreVector {
        &self.scores[origin as usize]
    }

    pub fn vector_mut(&mut self, origin: u32) -> &mut ScoreVector {
        &mut self.scores[origin as usize]
    }

    pub fn clear(&mut self, origin: u32) {
        self.scores[origin as usize].clear();
    }

    pub fn clear_all(&mut self) {
        for v in &mut self.scores {
            v.clear();
        }
    }
}

/// Plain per-origin counters (context sightings and the like).
pub struct OriginCounts {
    counts: Vec<u32>,
}

impl OriginCounts {
    pub fn new(num_origins: usize) -> OriginCounts {
        OriginCounts {
            counts: vec![0; num_origins],
        }
    }

    pub fn count(&self, origin: u32) -> u32 {
        self.counts.get(origin as usize).copied().unwrap_or(0)
    }

    pub fn incr(&mut self, origin: u32, delta: i32) {
        if let Some(c) = self.counts.get_mut(origin as usize) {
            *c = (*c as i64 + delta as i64).max(0) as u32;
        }
    }

    pub fn clear(&mut self) {
        for c in &mut self.counts {
            *c = 0;
        }
    }
}

/// Maps each unresolved origin to the buffer positions it occupies, so a
/// replacement can re-score exactly the neighborhoods it touches.
pub struct OriginIndex {
    locations: Vec<Vec<u32>>,
}

impl OriginIndex {
    pub fn build(
        bytes: &[crate::decoding::decodebuffer::DecodedByte],
        num_origins: usize,
    ) -> OriginIndex {
        let mut locations = vec![Vec::new(); num_origins];
        for (pos, db) in bytes.iter().enumerate() {
            if db.is_reference() {
                if let Some(origin) = db.origin() {
                    if (origin as usize) < num_origins {
                        locations[origin as usize].push(pos as u32);
                    }
                }
            }
        }
        OriginIndex { locations }
    }

    pub fn locations(&self, origin: u32) -> &[u32] {
        self.locations
            .get(origin as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_two_tracking() {
        let mut v = ScoreVector::new();
        v.incr(b'a', 5.0);
        v.incr(b'b', 3.0);
        v.incr(b'c', 9.0);
        assert_eq!(v.index_of_highest(), b'c');
        assert_eq!(v.highest(), 9.0);
        assert_eq!(v.second(), 5.0);
        v.incr(b'b', 7.0);
        assert_eq!(v.highest(), 10.0);
        assert_eq!(v.index_of_highest(), b'b');
        assert_eq!(v.second(), 9.0);
    }

    #[test]
    fn origin_index_collects_positions() {
        use crate::decoding::decodebuffer::DecodedByte;
        let bytes = [
            DecodedByte::Reference { origin: 0 },
            DecodedByte::Literal {
                value: b'x',
                confidence: 1,
            },
            DecodedByte::Reference { origin: 0 },
            DecodedByte::Reference { origin: 2 },
        ];
        let index = OriginIndex::build(&bytes, 3);
        assert_eq!(index.locations(0), &[0, 2]);
        assert!(index.locations(1).is_empty());
        assert_eq!(index.locations(2), &[3]);
    }
}
