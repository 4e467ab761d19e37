// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Fixed-width sets of vifs and neighbors.
//!
//! The route and cache logic is phrased almost entirely in terms of
//! set operations over these (children, subordinates, outgoing vifs,
//! pruned neighbors), so they get named operations instead of raw
//! integer twiddling.

use super::MAX_NEIGHBORS;
use super::MAX_VIFS;
use super::NbrIndex;
use super::VifIndex;
use core::fmt;
use serde::Deserialize;
use serde::Serialize;

macro_rules! bitmap {
    ($(#[$attr:meta])* $name:ident, $repr:ty, $idx:ty, $max:expr) => {
        $(#[$attr])*
        #[derive(
            Clone, Copy, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
        )]
        pub struct $name($repr);

        const _: () = assert!(<$repr>::BITS as usize >= $max);

        impl $name {
            pub const EMPTY: Self = Self(0);

            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            pub const fn bits(&self) -> $repr {
                self.0
            }

            pub fn single(idx: $idx) -> Self {
                let mut s = Self::EMPTY;
                s.set(idx);
                s
            }

            pub fn set(&mut self, idx: $idx) {
                debug_assert!((idx as usize) < $max);
                if (idx as usize) < $max {
                    self.0 |= 1 << idx;
                }
            }

            /// Remove `idx`; out-of-range indices are never members.
            pub fn clear(&mut self, idx: $idx) {
                if (idx as usize) < $max {
                    self.0 &= !(1 << idx);
                }
            }

            pub fn contains(&self, idx: $idx) -> bool {
                (idx as usize) < $max && self.0 & (1 << idx) != 0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn len(&self) -> u32 {
                self.0.count_ones()
            }

            /// Add every member of `other`.
            pub fn set_mask(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Remove every member of `other`.
            pub fn clear_mask(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            pub fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            pub fn intersection(self, other: Self) -> Self {
                Self(self.0 & other.0)
            }

            pub fn difference(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }

            /// Is every member of `self` also in `other`?
            pub fn is_subset(&self, other: Self) -> bool {
                self.0 & !other.0 == 0
            }

            pub fn intersects(&self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            pub fn iter(&self) -> impl Iterator<Item = $idx> + '_ {
                (0..$max as $idx).filter(move |i| self.contains(*i))
            }
        }

        impl FromIterator<$idx> for $name {
            fn from_iter<I: IntoIterator<Item = $idx>>(iter: I) -> Self {
                let mut s = Self::EMPTY;
                for i in iter {
                    s.set(i);
                }
                s
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.debug_set().entries(self.iter()).finish()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                let mut first = true;
                for i in self.iter() {
                    if !first {
                        write!(f, ",")?;
                    }
                    write!(f, "{i}")?;
                    first = false;
                }
                if first {
                    write!(f, "-")?;
                }
                Ok(())
            }
        }
    };
}

bitmap!(
    /// A set of vifs.
    VifBitmap,
    u32,
    VifIndex,
    MAX_VIFS
);

bitmap!(
    /// A set of neighbors, indexed by each neighbor's process-wide
    /// neighbor index.
    NbrBitmap,
    u64,
    NbrIndex,
    MAX_NEIGHBORS
);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_ops() {
        let a: VifBitmap = [0, 2, 5].into_iter().collect();
        let b: VifBitmap = [2, 3].into_iter().collect();

        assert_eq!(a.intersection(b), VifBitmap::single(2));
        assert_eq!(a.difference(b), [0, 5].into_iter().collect());
        assert_eq!(a.union(b).len(), 4);
        assert!(VifBitmap::single(2).is_subset(a));
        assert!(!b.is_subset(a));
        assert!(VifBitmap::EMPTY.is_subset(b));
    }

    #[test]
    fn clear_mask() {
        let mut n: NbrBitmap = [1, 40, 63].into_iter().collect();
        n.clear_mask([40, 63].into_iter().collect());
        assert_eq!(n, NbrBitmap::single(1));
        n.clear(1);
        assert!(n.is_empty());
        assert!(!n.contains(63));

        let mut v = VifBitmap::single(3);
        v.clear(MAX_VIFS as VifIndex + 8);
        assert_eq!(v, VifBitmap::single(3));
    }

    #[test]
    fn display() {
        let a: VifBitmap = [1, 4].into_iter().collect();
        assert_eq!(a.to_string(), "1,4");
        assert_eq!(VifBitmap::EMPTY.to_string(), "-");
    }
}
