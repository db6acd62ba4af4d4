//! Persistent set of snapshot ids.
//!
//! Ids are allocated monotonically and most sets only hold recent ids, so the
//! set keeps a 128-bit window at `lower_bound` and spills anything older into
//! a sorted, shared overflow list. Every mutation returns a new set.

use std::fmt;
use std::sync::Arc;

pub type SnapshotId = u64;

const WORD_BITS: u64 = 64;
const WINDOW_BITS: u64 = WORD_BITS * 2;

#[derive(Clone, PartialEq, Eq, Default)]
pub struct SnapshotIdSet {
    /// Ids `lower_bound..lower_bound + 64`.
    lower: u64,
    /// Ids `lower_bound + 64..lower_bound + 128`.
    upper: u64,
    lower_bound: SnapshotId,
    /// Ids below `lower_bound`, ascending.
    below: Option<Arc<[SnapshotId]>>,
}

impl SnapshotIdSet {
    pub const EMPTY: SnapshotIdSet = SnapshotIdSet {
        lower: 0,
        upper: 0,
        lower_bound: 0,
        below: None,
    };

    pub fn new() -> Self {
        Self::EMPTY
    }

    pub fn is_empty(&self) -> bool {
        self.lower == 0 && self.upper == 0 && self.below.is_none()
    }

    pub fn get(&self, id: SnapshotId) -> bool {
        if id < self.lower_bound {
            return self
                .below
                .as_deref()
                .is_some_and(|below| below.binary_search(&id).is_ok());
        }
        let offset = id - self.lower_bound;
        if offset < WORD_BITS {
            self.lower & (1 << offset) != 0
        } else if offset < WINDOW_BITS {
            self.upper & (1 << (offset - WORD_BITS)) != 0
        } else {
            false
        }
    }

    /// Returns a set that also contains `id`.
    #[must_use]
    pub fn set(&self, id: SnapshotId) -> Self {
        if self.get(id) {
            return self.clone();
        }
        if id < self.lower_bound {
            let mut below: Vec<SnapshotId> = self.below.as_deref().unwrap_or_default().to_vec();
            let position = below.partition_point(|&existing| existing < id);
            below.insert(position, id);
            return Self {
                below: Some(below.into()),
                ..self.clone()
            };
        }
        let offset = id - self.lower_bound;
        if offset < WORD_BITS {
            Self {
                lower: self.lower | (1 << offset),
                ..self.clone()
            }
        } else if offset < WINDOW_BITS {
            Self {
                upper: self.upper | (1 << (offset - WORD_BITS)),
                ..self.clone()
            }
        } else {
            self.slide_to(id).set(id)
        }
    }

    /// Returns a set without `id`.
    #[must_use]
    pub fn clear(&self, id: SnapshotId) -> Self {
        if !self.get(id) {
            return self.clone();
        }
        if id < self.lower_bound {
            let below: Vec<SnapshotId> = self
                .below
                .as_deref()
                .unwrap_or_default()
                .iter()
                .copied()
                .filter(|&existing| existing != id)
                .collect();
            return Self {
                below: (!below.is_empty()).then(|| below.into()),
                ..self.clone()
            };
        }
        let offset = id - self.lower_bound;
        if offset < WORD_BITS {
            Self {
                lower: self.lower & !(1 << offset),
                ..self.clone()
            }
        } else {
            Self {
                upper: self.upper & !(1 << (offset - WORD_BITS)),
                ..self.clone()
            }
        }
    }

    /// Ids in `self` that are not in `other`.
    #[must_use]
    pub fn and_not(&self, other: &SnapshotIdSet) -> Self {
        if other.is_empty() || self.is_empty() {
            return self.clone();
        }
        if self.lower_bound == other.lower_bound && other.below.is_none() {
            return Self {
                lower: self.lower & !other.lower,
                upper: self.upper & !other.upper,
                ..self.clone()
            };
        }
        other.iter().fold(self.clone(), |set, id| set.clear(id))
    }

    /// Ids in either set.
    #[must_use]
    pub fn or(&self, other: &SnapshotIdSet) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        if self.lower_bound == other.lower_bound && other.below.is_none() {
            return Self {
                lower: self.lower | other.lower,
                upper: self.upper | other.upper,
                ..self.clone()
            };
        }
        other.iter().fold(self.clone(), |set, id| set.set(id))
    }

    /// Adds every id in `from..until`.
    #[must_use]
    pub fn add_range(&self, from: SnapshotId, until: SnapshotId) -> Self {
        (from..until).fold(self.clone(), |set, id| set.set(id))
    }

    /// Lowest id in the set, or `default` when the set holds nothing at or below it.
    pub fn lowest(&self, default: SnapshotId) -> SnapshotId {
        match self.iter().next() {
            Some(id) if id <= default => id,
            _ => default,
        }
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            set: self,
            below_index: 0,
            offset: 0,
        }
    }

    /// Moves the window up so that `id` falls in its lower word.
    fn slide_to(&self, id: SnapshotId) -> Self {
        let target = id / WORD_BITS * WORD_BITS;
        let mut below: Vec<SnapshotId> = self.below.as_deref().unwrap_or_default().to_vec();
        let mut lower = self.lower;
        let mut upper = self.upper;
        let mut lower_bound = self.lower_bound;
        while lower_bound < target {
            below.extend(bits(lower).map(|bit| lower_bound + bit));
            if upper == 0 {
                lower = 0;
                lower_bound = target;
                break;
            }
            lower = upper;
            upper = 0;
            lower_bound += WORD_BITS;
        }
        Self {
            lower,
            upper,
            lower_bound,
            below: (!below.is_empty()).then(|| below.into()),
        }
    }
}

fn bits(word: u64) -> impl Iterator<Item = u64> {
    (0..WORD_BITS).filter(move |&bit| word & (1 << bit) != 0)
}

impl fmt::Debug for SnapshotIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<SnapshotId> for SnapshotIdSet {
    fn from_iter<I: IntoIterator<Item = SnapshotId>>(iter: I) -> Self {
        iter.into_iter().fold(Self::EMPTY, |set, id| set.set(id))
    }
}

/// Ascending iterator over a [`SnapshotIdSet`].
pub struct Iter<'a> {
    set: &'a SnapshotIdSet,
    below_index: usize,
    offset: u64,
}

impl Iterator for Iter<'_> {
    type Item = SnapshotId;

    fn next(&mut self) -> Option<SnapshotId> {
        if let Some(below) = self.set.below.as_deref() {
            if let Some(&id) = below.get(self.below_index) {
                self.below_index += 1;
                return Some(id);
            }
        }
        while self.offset < WINDOW_BITS {
            let offset = self.offset;
            self.offset += 1;
            let present = if offset < WORD_BITS {
                self.set.lower & (1 << offset) != 0
            } else {
                self.set.upper & (1 << (offset - WORD_BITS)) != 0
            };
            if present {
                return Some(self.set.lower_bound + offset);
            }
        }
        None
    }
}

impl<'a> IntoIterator for &'a SnapshotIdSet {
    type Item = SnapshotId;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_and_clear_across_the_window() {
        let set = SnapshotIdSet::new().set(3).set(70).set(127);
        assert!(set.get(3) && set.get(70) && set.get(127));
        assert!(!set.get(4) && !set.get(128));
        let set = set.clear(70);
        assert!(!set.get(70));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 127]);
    }

    #[test]
    fn high_ids_slide_the_window_and_keep_old_ids() {
        let set = SnapshotIdSet::new().set(5).set(70).set(900);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![5, 70, 900]);
        let set = set.set(2).clear(5);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![2, 70, 900]);
        assert_eq!(set.lowest(1000), 2);
        assert_eq!(set.lowest(1), 1);
    }

    #[test]
    fn or_and_not_agree_with_membership() {
        let left: SnapshotIdSet = [1, 2, 3, 300].into_iter().collect();
        let right: SnapshotIdSet = [2, 300, 301].into_iter().collect();
        assert_eq!(left.or(&right).iter().collect::<Vec<_>>(), vec![1, 2, 3, 300, 301]);
        assert_eq!(left.and_not(&right).iter().collect::<Vec<_>>(), vec![1, 3]);
        assert!(right.and_not(&right).is_empty());
    }

    #[test]
    fn add_range_is_half_open() {
        let set = SnapshotIdSet::EMPTY.add_range(10, 13);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![10, 11, 12]);
        assert_eq!(format!("{set:?}"), "{10, 11, 12}");
    }
}
