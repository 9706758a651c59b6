//! A search node: a pair of tree hypotheses plus the bit position reached
//! walking backwards, with the bookkeeping that constrains the next
//! extension.

use std::rc::Rc;

use crate::partial::tree_hypothesis::{TreeHypothesis, MAX_LITERAL_REPEATS};

#[derive(Clone)]
pub struct Hypothesis {
    pub lit: Rc<TreeHypothesis>,
    pub dist: Rc<TreeHypothesis>,
    /// Earliest bit of the consistent suffix (the next extension ends
    /// here).
    pub bit_pos: usize,
    /// Bits covered so far.
    pub bit_count: u32,
    /// Canonical value and length of the most recent literal, for the
    /// repeat limiter.
    pub last_literal: u32,
    pub last_literal_len: u8,
    pub last_literal_repeat: u8,
    /// Walking backwards, a distance code has been consumed and the next
    /// item must be the matching length code.
    pub in_backref: bool,
}

impl Hypothesis {
    pub fn seed(
        lit: Rc<TreeHypothesis>,
        dist: Rc<TreeHypothesis>,
        bit_pos: usize,
        bit_count: u32,
    ) -> Hypothesis {
        Hypothesis {
            lit,
            dist,
            bit_pos,
            bit_count,
            last_literal: 0,
            last_literal_len: 0,
            last_literal_repeat: 0,
            in_backref: false,
        }
    }

    /// More identical literals in a row than any sane encoder would emit.
    pub fn excessive_repeats(&self, canon: u32, length: u8) -> bool {
        self.last_literal_len == length
            && self.last_literal == canon
            && self.last_literal_repeat >= MAX_LITERAL_REPEATS
    }

    /// Key for the deduplication directory: tree identity is pointer
    /// identity thanks to interning.
    pub fn dedup_key(&self) -> (usize, usize, u32) {
        (
            Rc::as_ptr(&self.lit) as usize,
            Rc::as_ptr(&self.dist) as usize,
            self.bit_count,
        )
    }

    pub fn same_trees(&self, other: &Hypothesis) -> bool {
        Rc::ptr_eq(&self.lit, &other.lit) && Rc::ptr_eq(&self.dist, &other.dist)
    }
}
