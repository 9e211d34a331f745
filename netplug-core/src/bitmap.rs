//! Fixed-size allocation bitmap.
//!
//! A set bit marks a taken slot. The size is fixed at construction; the
//! serialized form is validated on decode so a stored bitmap can never claim
//! slots outside its length.

use serde::{Deserialize, Serialize};

const WORD_BITS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBitmap")]
pub struct AllocBitmap {
    len: usize,
    words: Vec<u64>,
}

#[derive(Deserialize)]
struct RawBitmap {
    len: usize,
    words: Vec<u64>,
}

impl TryFrom<RawBitmap> for AllocBitmap {
    type Error = String;

    fn try_from(raw: RawBitmap) -> Result<Self, Self::Error> {
        if raw.words.len() != words_for(raw.len) {
            return Err(format!(
                "bitmap of {} slots needs {} words, got {}",
                raw.len,
                words_for(raw.len),
                raw.words.len()
            ));
        }
        let tail = raw.len % WORD_BITS;
        if tail != 0
            && let Some(last) = raw.words.last()
            && last >> tail != 0
        {
            return Err("bitmap has bits set beyond its length".to_string());
        }
        Ok(Self {
            len: raw.len,
            words: raw.words,
        })
    }
}

fn words_for(len: usize) -> usize {
    len.div_ceil(WORD_BITS)
}

impl AllocBitmap {
    /// An empty bitmap of `len` slots.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0; words_for(len)],
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of taken slots.
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of free slots.
    pub fn count_clear(&self) -> usize {
        self.len - self.count_set()
    }

    pub fn is_set(&self, slot: usize) -> bool {
        slot < self.len && self.words[slot / WORD_BITS] & (1 << (slot % WORD_BITS)) != 0
    }

    /// Mark `slot` taken. Returns `false` if it already was, or if it is out
    /// of range.
    pub fn set(&mut self, slot: usize) -> bool {
        if slot >= self.len || self.is_set(slot) {
            return false;
        }
        self.words[slot / WORD_BITS] |= 1 << (slot % WORD_BITS);
        true
    }

    /// Mark `slot` free. Returns `false` if it already was, or if it is out
    /// of range.
    pub fn clear(&mut self, slot: usize) -> bool {
        if !self.is_set(slot) {
            return false;
        }
        self.words[slot / WORD_BITS] &= !(1 << (slot % WORD_BITS));
        true
    }

    /// Lowest free slot.
    pub fn first_clear(&self) -> Option<usize> {
        self.first_clear_from(0)
    }

    /// Lowest free slot at or after `start`.
    pub fn first_clear_from(&self, start: usize) -> Option<usize> {
        let mut slot = start;
        while slot < self.len {
            let word = self.words[slot / WORD_BITS] | ((1u64 << (slot % WORD_BITS)) - 1);
            if word != u64::MAX {
                let found = (slot / WORD_BITS) * WORD_BITS + word.trailing_ones() as usize;
                return (found < self.len).then_some(found);
            }
            slot = (slot / WORD_BITS + 1) * WORD_BITS;
        }
        None
    }

    /// Iterator over taken slots in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&slot| self.is_set(slot))
    }
}
