use super::*;

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Fixed-width occupancy map, a set bit means "in use".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitmap([u64; BITMAP_WORDS]);

impl Bitmap {
    pub fn test(&self, bno: usize) -> bool {
        let (group, bit) = (bno / 64, bno % 64);
        self.0[group] & (1 << bit) != 0
    }

    pub fn set(&mut self, bno: usize) {
        let (group, bit) = (bno / 64, bno % 64);
        self.0[group] |= 1 << bit;
    }

    pub fn clear(&mut self, bno: usize) {
        let (group, bit) = (bno / 64, bno % 64);
        self.0[group] &= !(1 << bit);
    }

    /// First clear bit inside `range`, lowest index first.
    pub fn first_clear(&self, range: Range<usize>) -> Option<usize> {
        let end = range.end.min(BITMAP_BITS);
        let mut bno = range.start;
        while bno < end {
            let (group, bit) = (bno / 64, bno % 64);
            // skip the already-scanned low bits of this word
            let word = self.0[group] | ((1u64 << bit) - 1);
            if word != u64::MAX {
                let found = group * 64 + word.trailing_ones() as usize;
                return (found < end).then_some(found);
            }
            bno = (group + 1) * 64;
        }
        None
    }

    pub fn count_ones(&self) -> u32 {
        self.0.iter().map(|word| word.count_ones()).sum()
    }
}
