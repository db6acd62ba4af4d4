//! Fixed-stride group records and the anchor encodings stored in them.

use crate::Key;

const NODE_BIT: u32 = 1 << 30;
const OBJECT_KEY_BIT: u32 = 1 << 29;
const AUX_BIT: u32 = 1 << 28;
const MARK_BIT: u32 = 1 << 27;
const CONTAINS_MARK_BIT: u32 = 1 << 26;
const NODE_COUNT_MASK: u32 = CONTAINS_MARK_BIT - 1;

/// Bits 28..=30 flag the optional leading data slots: aux, object key, node.
const DATA_SLOT_SHIFT: u32 = 28;

/// Parent anchors above this value are start relative, at or below are end relative.
pub(crate) const PARENT_ANCHOR_PIVOT: isize = -2;

/// One entry of the group array.
///
/// `parent_anchor` and `data_anchor` use gap-relative encodings so that moving
/// a gap only rewrites the entries it passes over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct GroupFields {
    pub(crate) key: Key,
    info: u32,
    pub(crate) parent_anchor: isize,
    pub(crate) size: usize,
    pub(crate) data_anchor: isize,
}

impl GroupFields {
    pub(crate) fn new(
        key: Key,
        is_node: bool,
        has_object_key: bool,
        has_aux: bool,
        parent_anchor: isize,
        data_anchor: isize,
    ) -> Self {
        let mut info = 0;
        if is_node {
            info |= NODE_BIT;
        }
        if has_object_key {
            info |= OBJECT_KEY_BIT;
        }
        if has_aux {
            info |= AUX_BIT;
        }
        Self {
            key,
            info,
            parent_anchor,
            size: 0,
            data_anchor,
        }
    }

    #[inline]
    pub(crate) fn is_node(&self) -> bool {
        self.info & NODE_BIT != 0
    }

    #[inline]
    pub(crate) fn has_object_key(&self) -> bool {
        self.info & OBJECT_KEY_BIT != 0
    }

    #[inline]
    pub(crate) fn has_aux(&self) -> bool {
        self.info & AUX_BIT != 0
    }

    #[inline]
    pub(crate) fn has_mark(&self) -> bool {
        self.info & MARK_BIT != 0
    }

    pub(crate) fn set_mark(&mut self, value: bool) {
        if value {
            self.info |= MARK_BIT;
        } else {
            self.info &= !MARK_BIT;
        }
    }

    #[inline]
    pub(crate) fn contains_mark(&self) -> bool {
        self.info & CONTAINS_MARK_BIT != 0
    }

    pub(crate) fn set_contains_mark(&mut self, value: bool) {
        if value {
            self.info |= CONTAINS_MARK_BIT;
        } else {
            self.info &= !CONTAINS_MARK_BIT;
        }
    }

    #[inline]
    pub(crate) fn contains_any_mark(&self) -> bool {
        self.info & (MARK_BIT | CONTAINS_MARK_BIT) != 0
    }

    #[inline]
    pub(crate) fn node_count(&self) -> usize {
        (self.info & NODE_COUNT_MASK) as usize
    }

    pub(crate) fn set_node_count(&mut self, count: usize) {
        assert!(
            count < NODE_COUNT_MASK as usize,
            "internal error: node count {count} overflows the group record"
        );
        self.info = (self.info & !NODE_COUNT_MASK) | count as u32;
    }

    /// Nodes this group contributes to its parent's count.
    #[inline]
    pub(crate) fn nodes_for_parent(&self) -> usize {
        if self.is_node() {
            1
        } else {
            self.node_count()
        }
    }

    /// Number of leading data slots (node, object key, aux) before user slots.
    #[inline]
    pub(crate) fn data_slot_prefix(&self) -> usize {
        ((self.info >> DATA_SLOT_SHIFT) & 0b111).count_ones() as usize
    }

    /// Offset of the object key from the start of the group's data.
    #[inline]
    pub(crate) fn object_key_offset(&self) -> usize {
        (self.info >> (DATA_SLOT_SHIFT + 2)).count_ones() as usize
    }

    /// Offset of the aux value from the start of the group's data.
    #[inline]
    pub(crate) fn aux_offset(&self) -> usize {
        ((self.info >> (DATA_SLOT_SHIFT + 1)) & 0b11).count_ones() as usize
    }
}

pub(crate) fn data_index_to_anchor(
    index: usize,
    gap_start: usize,
    gap_len: usize,
    capacity: usize,
) -> isize {
    if index > gap_start {
        -(((capacity - gap_len) - index + 1) as isize)
    } else {
        index as isize
    }
}

pub(crate) fn data_anchor_to_index(anchor: isize, gap_len: usize, capacity: usize) -> usize {
    if anchor < 0 {
        ((capacity - gap_len) as isize + anchor + 1) as usize
    } else {
        anchor as usize
    }
}

/// `index` is -1 for root-level groups.
pub(crate) fn parent_index_to_anchor(index: isize, gap_start: usize, size: usize) -> isize {
    if index < gap_start as isize {
        index
    } else {
        -(size as isize - index - PARENT_ANCHOR_PIVOT)
    }
}

pub(crate) fn parent_anchor_to_index(anchor: isize, size: usize) -> isize {
    if anchor > PARENT_ANCHOR_PIVOT {
        anchor
    } else {
        size as isize + anchor - PARENT_ANCHOR_PIVOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_prefix_offsets_follow_flag_order() {
        let all = GroupFields::new(1, true, true, false, -1, 0);
        assert_eq!(all.data_slot_prefix(), 2);
        assert_eq!(all.object_key_offset(), 1);

        let mut data = GroupFields::new(1, false, true, true, -1, 0);
        assert_eq!(data.data_slot_prefix(), 2);
        assert_eq!(data.object_key_offset(), 0);
        assert_eq!(data.aux_offset(), 1);
        data.set_node_count(5);
        data.set_mark(true);
        assert_eq!(data.node_count(), 5);
        assert!(data.has_mark() && data.contains_any_mark());
        assert!(!data.contains_mark());
    }

    #[test]
    fn parent_anchor_encoding_survives_gap_relative_round_trip() {
        let size = 20;
        for index in -1..20isize {
            for gap_start in 0..=20usize {
                let anchor = parent_index_to_anchor(index, gap_start, size);
                assert_eq!(parent_anchor_to_index(anchor, size), index);
            }
        }
    }

    #[test]
    fn data_anchor_encoding_survives_gap_relative_round_trip() {
        let capacity = 64;
        let gap_len = 10;
        for index in 0..=(capacity - gap_len) {
            for gap_start in 0..=(capacity - gap_len) {
                let anchor = data_index_to_anchor(index, gap_start, gap_len, capacity);
                assert_eq!(data_anchor_to_index(anchor, gap_len, capacity), index);
            }
        }
    }
}
