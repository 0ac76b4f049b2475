//! Crash-resumable bitmap of chunk reservation state: 32 bits per word,
//! 1-based bit indices, `total_chunks + 1` meaning
//! "none found".

use anyhow::{Error, Result};
use ck_api_types::CloneError;

/// A bitmap of `total_chunks` bits tracking which chunks of the current
/// snapshot state have been reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBitmap {
    total_chunks: u32,
    words: Vec<u32>,
}

fn word_count(total_chunks: u32) -> usize {
    ((total_chunks + 31) / 32) as usize
}

/// Mask of the valid (non-padding) bits in the last word, so `total_chunks`
/// values that aren't multiples of 32 don't make stray padding bits look
/// "unset".
fn last_word_mask(total_chunks: u32) -> u32 {
    let rem = total_chunks % 32;
    if rem == 0 {
        u32::MAX
    } else {
        (1u32 << rem) - 1
    }
}

impl ChunkBitmap {
    pub fn new(total_chunks: u32) -> Self {
        let mut bm = ChunkBitmap {
            total_chunks,
            words: vec![0u32; word_count(total_chunks)],
        };
        bm.pad_last_word();
        bm
    }

    /// Sets the padding bits beyond `total_chunks` in the last word so
    /// that `get_min_unset_bit`/`get_max_set_bit` never report them.
    fn pad_last_word(&mut self) {
        if let Some(last) = self.words.last_mut() {
            let mask = last_word_mask(self.total_chunks);
            *last |= !mask;
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    fn word_bit(bit_1based: u32) -> (usize, u32) {
        let zero_based = bit_1based - 1;
        ((zero_based / 32) as usize, zero_based % 32)
    }

    pub fn set(&mut self, bit_1based: u32) {
        assert!(bit_1based >= 1 && bit_1based <= self.total_chunks);
        let (w, b) = Self::word_bit(bit_1based);
        self.words[w] |= 1 << b;
    }

    pub fn clear(&mut self, bit_1based: u32) {
        assert!(bit_1based >= 1 && bit_1based <= self.total_chunks);
        let (w, b) = Self::word_bit(bit_1based);
        self.words[w] &= !(1 << b);
    }

    pub fn is_set(&self, bit_1based: u32) -> bool {
        assert!(bit_1based >= 1 && bit_1based <= self.total_chunks);
        let (w, b) = Self::word_bit(bit_1based);
        self.words[w] & (1 << b) != 0
    }

    /// First unset (0) bit, scanning words left to right. Returns
    /// `total_chunks + 1` if every bit is set.
    pub fn get_min_unset_bit(&self) -> u32 {
        for (idx, &word) in self.words.iter().enumerate() {
            if word != u32::MAX {
                let bit_in_word = (!word).trailing_zeros();
                let candidate = idx as u32 * 32 + bit_in_word + 1;
                if candidate <= self.total_chunks {
                    return candidate;
                }
            }
        }
        self.total_chunks + 1
    }

    /// Last set (1) bit, scanning words right to left. Returns
    /// `total_chunks + 1` if every bit is unset (matching the "none"
    /// sentinel used throughout the chunk info protocol).
    pub fn get_max_set_bit(&self) -> u32 {
        for (idx, &word) in self.words.iter().enumerate().rev() {
            if word != 0 {
                let bit_in_word = 31 - word.leading_zeros();
                let candidate = idx as u32 * 32 + bit_in_word + 1;
                if candidate <= self.total_chunks {
                    return candidate;
                }
            }
        }
        self.total_chunks + 1
    }

    /// Re-sizes the bitmap to `max_bits`, reusing the existing backing
    /// storage when it is already big enough. Returns the previous buffer
    /// when a new one had to be allocated, so the caller can decide what
    /// to do with it (the original drops it via the arena heap; here it
    /// is simply returned for the caller to drop).
    pub fn reset(&mut self, max_bits: u32) -> Option<Vec<u32>> {
        let needed = word_count(max_bits);
        if needed <= self.words.len() {
            self.total_chunks = max_bits;
            for w in self.words.iter_mut() {
                *w = 0;
            }
            self.pad_last_word();
            None
        } else {
            let old = std::mem::replace(&mut self.words, vec![0u32; needed]);
            self.total_chunks = max_bits;
            self.pad_last_word();
            Some(old)
        }
    }

    /// Snapshot of the backing words, for serialization into a STATE
    /// descriptor body.
    pub fn words_snapshot(&self) -> Vec<u32> {
        self.words.clone()
    }

    /// Rebuilds a bitmap from a word vector read off the wire. Rejects a
    /// word count inconsistent with `total_chunks` rather than silently
    /// truncating or zero-extending it.
    pub fn from_words(total_chunks: u32, words: Vec<u32>) -> Result<Self, Error> {
        let expected = word_count(total_chunks);
        if words.len() != expected {
            return Err(CloneError::InvalidDescriptor(format!(
                "chunk bitmap word count {} does not match expected {} for {} chunks",
                words.len(),
                expected,
                total_chunks
            ))
            .into());
        }
        let mut bm = ChunkBitmap { total_chunks, words };
        bm.pad_last_word();
        Ok(bm)
    }
}
