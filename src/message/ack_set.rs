//! Received-sequence tracking.

use serde::{Deserialize, Serialize};

const WORD_BITS: i32 = 64;

/// Bitmap of processed sequence numbers above a floor.
///
/// Every sequence below `min_sequence` is processed; bit `i` records
/// `min_sequence + i`. The floor advances over contiguous runs, so
/// [`ack_number`](Self::ack_number) is the highest sequence below which
/// nothing is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckSet {
    min_sequence: i32,
    bits: Vec<u64>,
}

impl Default for AckSet {
    fn default() -> Self {
        Self::new(1)
    }
}

impl AckSet {
    /// Start expecting `first` as the next sequence.
    pub fn new(first: i32) -> Self {
        Self {
            min_sequence: first,
            bits: Vec::new(),
        }
    }

    /// Lowest unprocessed sequence.
    pub fn min_sequence(&self) -> i32 {
        self.min_sequence
    }

    /// Highest contiguous processed sequence.
    pub fn ack_number(&self) -> i32 {
        self.min_sequence - 1
    }

    pub fn is_set(&self, seq: i32) -> bool {
        if seq < self.min_sequence {
            return true;
        }
        let offset = seq - self.min_sequence;
        let word = (offset / WORD_BITS) as usize;
        let bit = offset % WORD_BITS;
        self.bits.get(word).is_some_and(|w| w & (1u64 << bit) != 0)
    }

    /// Mark `seq` processed; returns false if it already was.
    pub fn set(&mut self, seq: i32) -> bool {
        if self.is_set(seq) {
            return false;
        }
        let offset = seq - self.min_sequence;
        let word = (offset / WORD_BITS) as usize;
        if self.bits.len() <= word {
            self.bits.resize(word + 1, 0);
        }
        self.bits[word] |= 1u64 << (offset % WORD_BITS);
        self.advance();
        true
    }

    fn advance(&mut self) {
        while let Some(&first) = self.bits.first() {
            if first == u64::MAX {
                self.bits.remove(0);
                self.min_sequence += WORD_BITS;
                continue;
            }
            let run = first.trailing_ones();
            if run > 0 {
                self.shift_right(run);
                self.min_sequence += run as i32;
            }
            break;
        }
        while self.bits.last() == Some(&0) {
            self.bits.pop();
        }
    }

    fn shift_right(&mut self, n: u32) {
        let len = self.bits.len();
        for i in 0..len {
            let carry = if i + 1 < len {
                self.bits[i + 1] << (64 - n)
            } else {
                0
            };
            self.bits[i] = (self.bits[i] >> n) | carry;
        }
    }
}
