//! Small fixed-size register sets.

use std::fmt;
use std::ops::{BitAnd, BitOr, Not, Sub};

/// A set of register numbers 0..32.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BitSet32(u32);

impl BitSet32 {
    pub const fn new() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, index: u32) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }

    pub fn insert(&mut self, index: u32) {
        assert!(index < 32);
        self.0 |= 1 << index;
    }

    pub fn remove(&mut self, index: u32) {
        assert!(index < 32);
        self.0 &= !(1 << index);
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Members in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u32> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let index = bits.trailing_zeros();
            bits &= bits - 1;
            Some(index)
        })
    }
}

impl FromIterator<u32> for BitSet32 {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = Self::new();
        for index in iter {
            set.insert(index);
        }
        set
    }
}

impl BitOr for BitSet32 {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for BitSet32 {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Sub for BitSet32 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl Not for BitSet32 {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for BitSet32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
