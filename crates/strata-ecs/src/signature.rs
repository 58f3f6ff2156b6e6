//! Signatures and fixed-width bit sets over schema indices.
//!
//! A [`SignatureIndexes`] is a small inline list of component indices used to
//! build archetype keys without heap allocation. [`ComponentBits`] and
//! [`TagBits`] are fixed-width (256-bit) bit sets over component and tag
//! indices; they are the set-algebra substrate for archetype keys and query
//! matching. The bit width is baked into archetype storage, so the constants
//! below must stay consistent across one [`EntityStore`](crate::store::EntityStore).

use crate::schema::{ComponentIndex, TagIndex};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Capacity constants
// ---------------------------------------------------------------------------

/// Maximum number of distinct component types per store.
pub const MAX_COMPONENT_TYPES: usize = 256;

/// Maximum number of distinct tag types per store.
pub const MAX_TAG_TYPES: usize = 256;

/// 64-bit words per bit set. Sized for [`MAX_COMPONENT_TYPES`].
pub const BITSET_WORDS: usize = MAX_COMPONENT_TYPES / 64;

/// Maximum number of component indices in one inline signature.
pub const MAX_SIGNATURE_COMPONENTS: usize = 5;

// ---------------------------------------------------------------------------
// SignatureIndexes -- fixed-capacity inline index list
// ---------------------------------------------------------------------------

/// An ordered, deduplicated list of up to [`MAX_SIGNATURE_COMPONENTS`]
/// component indices, stored inline. Unpopulated slots hold `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureIndexes {
    slots: [i16; MAX_SIGNATURE_COMPONENTS],
    len: u8,
}

impl Default for SignatureIndexes {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl SignatureIndexes {
    /// A signature with no populated slots.
    pub const EMPTY: Self = Self {
        slots: [-1; MAX_SIGNATURE_COMPONENTS],
        len: 0,
    };

    /// Build a signature from component indices. Duplicates collapse into a
    /// single slot. Fails when more than [`MAX_SIGNATURE_COMPONENTS`] distinct
    /// indices are given.
    pub fn new(indices: &[ComponentIndex]) -> Result<Self, EcsError> {
        let mut sig = Self::EMPTY;
        for &index in indices {
            sig.push(index)?;
        }
        Ok(sig)
    }

    /// Append an index, ignoring it if already present.
    pub fn push(&mut self, index: ComponentIndex) -> Result<(), EcsError> {
        let raw = index.raw() as i16;
        if self.slots[..self.len as usize].contains(&raw) {
            return Ok(());
        }
        if self.len as usize == MAX_SIGNATURE_COMPONENTS {
            return Err(EcsError::SignatureOverflow {
                len: self.len as usize + 1,
                max: MAX_SIGNATURE_COMPONENTS,
            });
        }
        self.slots[self.len as usize] = raw;
        self.len += 1;
        Ok(())
    }

    /// Number of populated slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether no slot is populated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `i`-th populated component index. Fails when slot `i` is not
    /// populated.
    pub fn get(&self, i: usize) -> Result<ComponentIndex, EcsError> {
        if i >= self.len as usize {
            return Err(EcsError::SignatureSlotOutOfRange {
                index: i,
                len: self.len as usize,
            });
        }
        Ok(ComponentIndex::from_raw(self.slots[i] as u16))
    }

    /// The raw slot value at `i`: the component index for populated slots,
    /// `-1` for unpopulated slots within the fixed capacity. Fails only when
    /// `i` is outside the physical capacity of the type.
    pub fn index_or_sentinel(&self, i: usize) -> Result<i16, EcsError> {
        if i >= MAX_SIGNATURE_COMPONENTS {
            return Err(EcsError::SignatureSlotOutOfRange {
                index: i,
                len: MAX_SIGNATURE_COMPONENTS,
            });
        }
        Ok(self.slots[i])
    }

    /// Iterate the populated component indices in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = ComponentIndex> + '_ {
        self.slots[..self.len as usize]
            .iter()
            .map(|&slot| ComponentIndex::from_raw(slot as u16))
    }
}

// ---------------------------------------------------------------------------
// Bit sets
// ---------------------------------------------------------------------------

/// Iterator over set bit positions of a word array, ascending.
struct RawBitIter {
    words: [u64; BITSET_WORDS],
    cursor: usize,
}

impl Iterator for RawBitIter {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        while self.cursor < BITSET_WORDS {
            let word = self.words[self.cursor];
            if word != 0 {
                let bit = word.trailing_zeros() as u16;
                // Clear the lowest set bit.
                self.words[self.cursor] = word & (word - 1);
                return Some(self.cursor as u16 * 64 + bit);
            }
            self.cursor += 1;
        }
        None
    }
}

macro_rules! bit_set_type {
    ($(#[$meta:meta])* $name:ident, $index:ty, $capacity:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name {
            words: [u64; BITSET_WORDS],
        }

        impl $name {
            /// The empty set.
            pub const EMPTY: Self = Self {
                words: [0; BITSET_WORDS],
            };

            /// A set holding exactly one index.
            #[inline]
            pub fn single(index: $index) -> Self {
                let mut set = Self::EMPTY;
                set.add(index);
                set
            }

            #[inline]
            pub fn add(&mut self, index: $index) {
                let bit = index.raw() as usize;
                debug_assert!(bit < $capacity);
                self.words[bit / 64] |= 1u64 << (bit % 64);
            }

            #[inline]
            pub fn remove(&mut self, index: $index) {
                let bit = index.raw() as usize;
                self.words[bit / 64] &= !(1u64 << (bit % 64));
            }

            #[inline]
            pub fn has(&self, index: $index) -> bool {
                let bit = index.raw() as usize;
                self.words[bit / 64] & (1u64 << (bit % 64)) != 0
            }

            /// Subset test: every bit of `other` is set in `self`.
            #[inline]
            pub fn has_all(&self, other: &Self) -> bool {
                self.words
                    .iter()
                    .zip(&other.words)
                    .all(|(a, b)| a & b == *b)
            }

            /// Intersection test: at least one bit of `other` is set in `self`.
            #[inline]
            pub fn has_any(&self, other: &Self) -> bool {
                self.words.iter().zip(&other.words).any(|(a, b)| a & b != 0)
            }

            #[inline]
            pub fn is_disjoint(&self, other: &Self) -> bool {
                !self.has_any(other)
            }

            /// Population count.
            #[inline]
            pub fn count(&self) -> u32 {
                self.words.iter().map(|w| w.count_ones()).sum()
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.words.iter().all(|&w| w == 0)
            }

            /// Set bits of `self` that are not set in `other`.
            #[inline]
            pub fn difference(&self, other: &Self) -> Self {
                let mut words = [0u64; BITSET_WORDS];
                for (i, word) in words.iter_mut().enumerate() {
                    *word = self.words[i] & !other.words[i];
                }
                Self { words }
            }

            /// Iterate set bit positions in ascending index order.
            pub fn bits(&self) -> impl Iterator<Item = $index> {
                RawBitIter {
                    words: self.words,
                    cursor: 0,
                }
                .map(<$index>::from_raw)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                let mut words = [0u64; BITSET_WORDS];
                for (i, word) in words.iter_mut().enumerate() {
                    *word = self.words[i] | rhs.words[i];
                }
                Self { words }
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", stringify!($name))?;
                f.debug_set().entries(self.bits().map(|i| i.raw())).finish()
            }
        }
    };
}

bit_set_type!(
    /// Fixed-width bit set over component indices.
    ComponentBits,
    ComponentIndex,
    MAX_COMPONENT_TYPES
);

bit_set_type!(
    /// Fixed-width bit set over tag indices.
    TagBits,
    TagIndex,
    MAX_TAG_TYPES
);

impl ComponentBits {
    /// Build a component bit set from a signature. Fails when an index does
    /// not fit the bit width.
    pub fn from_signature(sig: &SignatureIndexes) -> Result<Self, EcsError> {
        let mut set = Self::EMPTY;
        for index in sig.iter() {
            if index.raw() as usize >= MAX_COMPONENT_TYPES {
                return Err(EcsError::IndexOutOfRange {
                    index: index.raw() as usize,
                    width: MAX_COMPONENT_TYPES,
                });
            }
            set.add(index);
        }
        Ok(set)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn c(raw: u16) -> ComponentIndex {
        ComponentIndex::from_raw(raw)
    }

    #[test]
    fn signature_holds_up_to_bound() {
        let indices: Vec<_> = (0..5).map(c).collect();
        let sig = SignatureIndexes::new(&indices).unwrap();
        assert_eq!(sig.len(), 5);
        for i in 0..5 {
            assert_eq!(sig.get(i).unwrap(), c(i as u16));
        }
    }

    #[test]
    fn signature_of_six_is_rejected() {
        let indices: Vec<_> = (0..6).map(c).collect();
        let err = SignatureIndexes::new(&indices).unwrap_err();
        assert!(matches!(err, EcsError::SignatureOverflow { .. }));
    }

    #[test]
    fn empty_signature_get_zero_fails() {
        let sig = SignatureIndexes::EMPTY;
        assert!(sig.get(0).is_err());
    }

    #[test]
    fn sentinel_within_capacity_never_fails() {
        let sig = SignatureIndexes::new(&[c(7)]).unwrap();
        assert_eq!(sig.index_or_sentinel(0).unwrap(), 7);
        assert_eq!(sig.index_or_sentinel(4).unwrap(), -1);
        assert!(sig.index_or_sentinel(5).is_err());
    }

    #[test]
    fn signature_deduplicates() {
        let sig = SignatureIndexes::new(&[c(3), c(3), c(9)]).unwrap();
        assert_eq!(sig.len(), 2);
        assert_eq!(sig.get(1).unwrap(), c(9));
    }

    #[test]
    fn bit_set_algebra() {
        let mut a = ComponentBits::EMPTY;
        a.add(c(0));
        a.add(c(65));
        a.add(c(255));
        assert_eq!(a.count(), 3);
        assert!(a.has(c(65)));

        let b = ComponentBits::single(c(65));
        assert!(a.has_all(&b));
        assert!(!b.has_all(&a));
        assert!(a.has_any(&b));

        let mut without = a;
        without.remove(c(65));
        assert!(without.is_disjoint(&b));
        assert_eq!(a.difference(&b).count(), 2);
    }

    #[test]
    fn bit_iteration_is_ascending() {
        let mut set = ComponentBits::EMPTY;
        for raw in [200, 3, 64, 127] {
            set.add(c(raw));
        }
        let collected: Vec<_> = set.bits().map(|i| i.raw()).collect();
        assert_eq!(collected, vec![3, 64, 127, 200]);
    }

    #[test]
    fn union_via_bitor() {
        let a = ComponentBits::single(c(1));
        let b = ComponentBits::single(c(70));
        let union = a | b;
        assert!(union.has(c(1)) && union.has(c(70)));
        assert_eq!(union.count(), 2);
    }

    #[test]
    fn bits_round_trip_through_signature() {
        let sig = SignatureIndexes::new(&[c(2), c(130)]).unwrap();
        let bits = ComponentBits::from_signature(&sig).unwrap();
        assert!(bits.has(c(2)) && bits.has(c(130)));
        assert_eq!(bits.count(), 2);
    }
}
