//! Gap-buffer backed positional store of groups and their slots.
//!
//! Groups are kept in pre-order in one fixed-stride array; each group's
//! slots live in a second array in the same order. Both arrays carry a single
//! movable gap, so an edit near the previous edit only shifts the entries
//! between the two positions. Parent pointers, data pointers and external
//! [`Anchor`]s are stored relative to the start or the end of the table
//! depending on which side of the gap they fall, which keeps them valid while
//! the gap moves.
//!
//! A table is read through any number of [`SlotReader`]s or edited through a
//! single [`SlotWriter`]; the borrow checker enforces the exclusion. Closing a
//! writer parks both gaps at the end so readers can index the arrays directly.

mod anchor;
mod group;
mod priority_set;
mod reader;
mod writer;

use std::any::Any;
use std::cell::RefCell;
use std::fmt;

pub use anchor::Anchor;
pub use reader::{KeyInfo, SlotReader};
pub use writer::SlotWriter;

use crate::error::SlotTableError;
use crate::Key;
use group::GroupFields;

/// A slot value. `None` marks an empty slot.
pub type Slot = Option<Box<dyn Any>>;

/// Minimum number of group records added when the group array grows.
pub(crate) const MIN_GROUP_GROWTH: usize = 32;
/// Minimum number of slots added when the slot array grows.
pub(crate) const MIN_SLOTS_GROWTH: usize = 32;

#[derive(Default)]
pub struct SlotTable {
    pub(crate) groups: Vec<GroupFields>,
    pub(crate) groups_size: usize,
    pub(crate) slots: Vec<Slot>,
    pub(crate) slots_size: usize,
    /// Sorted by location. Readers may add anchors, hence the cell.
    pub(crate) anchors: RefCell<Vec<Anchor>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups in the table.
    pub fn size(&self) -> usize {
        self.groups_size
    }

    pub fn is_empty(&self) -> bool {
        self.groups_size == 0
    }

    /// Number of slots across all groups, including node and key slots.
    pub fn slots_size(&self) -> usize {
        self.slots_size
    }

    pub fn read(&self) -> SlotReader<'_> {
        SlotReader::new(self)
    }

    pub fn write(&mut self) -> SlotWriter<'_> {
        SlotWriter::new(self)
    }

    /// Returns the anchor for `index`, creating one if needed.
    pub fn anchor(&self, index: usize) -> Anchor {
        assert!(
            index < self.groups_size,
            "internal error: anchor index {index} out of range 0..{}",
            self.groups_size
        );
        anchor::get_or_add(&mut self.anchors.borrow_mut(), index, self.groups_size, || {
            Anchor::new(index as isize)
        })
    }

    /// [`anchor`](Self::anchor) that reports out-of-range indices instead of panicking.
    pub fn try_anchor(&self, index: usize) -> Option<Anchor> {
        (index < self.groups_size).then(|| self.anchor(index))
    }

    pub fn owns_anchor(&self, anchor: &Anchor) -> bool {
        if !anchor.valid() {
            return false;
        }
        let anchors = self.anchors.borrow();
        let location = anchor.index_for(self.groups_size);
        matches!(
            anchor::search(&anchors, location, self.groups_size),
            Ok(position) if anchors[position] == *anchor
        )
    }

    /// Resolves an anchor to its current group index.
    pub fn anchor_index(&self, anchor: &Anchor) -> Result<usize, SlotTableError> {
        if !anchor.valid() {
            return Err(SlotTableError::AnchorInvalid);
        }
        if !self.owns_anchor(anchor) {
            return Err(SlotTableError::AnchorNotOwned);
        }
        Ok(anchor.index_for(self.groups_size))
    }

    /// True if the anchor resolves to `group` or one of its descendants.
    pub fn group_contains_anchor(&self, group: usize, anchor: &Anchor) -> bool {
        match self.anchor_index(anchor) {
            Ok(location) => {
                group < self.groups_size
                    && location >= group
                    && location < group + self.groups[group].size
            }
            Err(_) => false,
        }
    }

    /// Keys of the groups directly under `parent`, or the root groups for `None`.
    pub fn child_keys(&self, parent: Option<usize>) -> Vec<Key> {
        let (mut child, end) = match parent {
            Some(group) => (group + 1, group + self.groups[group].size),
            None => (0, self.groups_size),
        };
        let mut keys = Vec::new();
        while child < end {
            keys.push(self.groups[child].key);
            child += self.groups[child].size;
        }
        keys
    }

    /// Every group as `(depth, key)` in table order.
    pub fn groups_as_keys(&self) -> Vec<(usize, Key)> {
        let mut ends: Vec<usize> = Vec::new();
        let mut keys = Vec::with_capacity(self.groups_size);
        for index in 0..self.groups_size {
            while ends.last().is_some_and(|&end| index >= end) {
                ends.pop();
            }
            let fields = &self.groups[index];
            keys.push((ends.len(), fields.key));
            ends.push(index + fields.size);
        }
        keys
    }

    /// Checks every structural invariant of a closed table.
    ///
    /// The gap is at the end of both arrays when no writer is open, so group
    /// addresses and indices coincide here.
    pub fn verify_well_formed(&self) -> Result<(), SlotTableError> {
        let mut current = 0;
        while current < self.groups_size {
            let end = current + self.groups[current].size;
            self.validate_group(&mut current, -1, end)?;
        }
        if current != self.groups_size {
            return Err(malformed(current, "incomplete group at root"));
        }

        let mut last_location: Option<usize> = None;
        for anchor in self.anchors.borrow().iter() {
            if !anchor.valid() {
                return Err(malformed(0, "invalid anchor left in the anchor list"));
            }
            let location = anchor.index_for(self.groups_size);
            if location >= self.groups_size {
                return Err(malformed(location, "anchor out of bounds"));
            }
            if last_location.is_some_and(|last| last >= location) {
                return Err(malformed(location, "anchors out of order"));
            }
            last_location = Some(location);
        }
        Ok(())
    }

    fn validate_group(
        &self,
        current: &mut usize,
        parent: isize,
        parent_end: usize,
    ) -> Result<usize, SlotTableError> {
        let group = *current;
        *current += 1;
        let fields = &self.groups[group];
        if fields.parent_anchor != parent {
            return Err(malformed(
                group,
                format!("expected parent {parent}, found {}", fields.parent_anchor),
            ));
        }
        let end = group + fields.size;
        if fields.size == 0 {
            return Err(malformed(group, "group has zero size"));
        }
        if end > self.groups_size {
            return Err(malformed(group, "group extends past the end of the table"));
        }
        if end > parent_end {
            return Err(malformed(group, "group extends past its parent"));
        }
        if fields.data_anchor < 0 {
            return Err(malformed(group, "end relative data anchor in a closed table"));
        }
        let data_start = fields.data_anchor as usize;
        let data_end = self.data_index(group + 1);
        if data_start > data_end || data_end > self.slots_size {
            return Err(malformed(group, "data range out of order or out of bounds"));
        }
        if data_end - data_start < fields.data_slot_prefix() {
            return Err(malformed(group, "missing node, key or aux slot"));
        }
        if fields.is_node() && self.slots[data_start].is_none() {
            return Err(malformed(group, "node group without a node"));
        }

        let mut node_count = 0;
        while *current < end {
            node_count += self.validate_group(current, group as isize, end)?;
        }
        if fields.node_count() != node_count {
            return Err(malformed(
                group,
                format!("recorded {} nodes, counted {node_count}", fields.node_count()),
            ));
        }
        if *current - group != fields.size {
            return Err(malformed(
                group,
                format!("recorded size {}, counted {}", fields.size, *current - group),
            ));
        }
        if fields.contains_any_mark() && parent >= 0 && !self.groups[parent as usize].contains_mark() {
            return Err(malformed(group, "marked group under a parent without contains-mark"));
        }
        Ok(if fields.is_node() { 1 } else { node_count })
    }

    #[inline]
    pub(crate) fn data_index(&self, group: usize) -> usize {
        if group < self.groups_size {
            self.groups[group].data_anchor as usize
        } else {
            self.slots_size
        }
    }
}

fn malformed(group: usize, reason: impl Into<String>) -> SlotTableError {
    SlotTableError::Malformed {
        group,
        reason: reason.into(),
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("groups", &self.groups_size)
            .field("slots", &self.slots_size)
            .field("anchors", &self.anchors.borrow().len())
            .finish()
    }
}

/// Indented dump of the group tree, one group per line.
impl fmt::Display for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack: Vec<usize> = Vec::new();
        for index in 0..self.groups_size {
            while stack.last().is_some_and(|&end| index >= end) {
                stack.pop();
            }
            let fields = &self.groups[index];
            let slots = self.data_index(index + 1) - self.data_index(index);
            writeln!(
                f,
                "{:indent$}Group({index}) key={}{} size={} nodes={} slots={slots}{}",
                "",
                fields.key,
                if fields.is_node() { " node" } else { "" },
                fields.size,
                fields.node_count(),
                if fields.has_mark() { " marked" } else { "" },
                indent = stack.len() * 2
            )?;
            stack.push(index + fields.size);
        }
        Ok(())
    }
}
