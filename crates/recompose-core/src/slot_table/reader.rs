use std::any::Any;

use smallvec::SmallVec;

use super::anchor::{self, Anchor};
use super::group::GroupFields;
use super::SlotTable;
use crate::Key;

/// Identity and position of a group, used when matching old children against
/// new ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: Key,
    pub object_key: Option<Key>,
    /// Group index in the table.
    pub location: usize,
    /// Nodes the group contributes to its parent.
    pub nodes: usize,
    /// Position among its siblings.
    pub index: usize,
}

/// Forward cursor over a closed [`SlotTable`].
///
/// The cursor is either on a group (`current_group`) or at the end of the
/// group it is inside (`is_group_end`). Entering a group positions the slot
/// cursor on its first user slot.
pub struct SlotReader<'a> {
    table: &'a SlotTable,
    groups: &'a [GroupFields],
    groups_size: usize,
    current_group: usize,
    current_end: usize,
    parent: isize,
    current_slot: usize,
    current_slot_end: usize,
    empty_count: usize,
    current_slot_stack: SmallVec<[usize; 16]>,
}

impl<'a> SlotReader<'a> {
    pub(crate) fn new(table: &'a SlotTable) -> Self {
        Self {
            table,
            groups: &table.groups[..table.groups_size],
            groups_size: table.groups_size,
            current_group: 0,
            current_end: table.groups_size,
            parent: -1,
            current_slot: 0,
            current_slot_end: 0,
            empty_count: 0,
            current_slot_stack: SmallVec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.groups_size
    }

    pub fn current_group(&self) -> usize {
        self.current_group
    }

    /// End of the group the cursor is inside.
    pub fn current_end(&self) -> usize {
        self.current_end
    }

    /// The group the cursor is inside, `None` at the root.
    pub fn parent(&self) -> Option<usize> {
        (self.parent >= 0).then_some(self.parent as usize)
    }

    pub fn is_group_end(&self) -> bool {
        self.in_empty() || self.current_group == self.current_end
    }

    /// True between `begin_empty` and the matching `end_empty`.
    pub fn in_empty(&self) -> bool {
        self.empty_count > 0
    }

    pub fn group_size(&self, index: usize) -> usize {
        self.groups[index].size
    }

    pub fn group_end(&self, index: usize) -> usize {
        index + self.groups[index].size
    }

    pub fn group_key(&self, index: usize) -> Key {
        self.groups[index].key
    }

    pub fn is_node(&self, index: usize) -> bool {
        self.groups[index].is_node()
    }

    /// Nodes directly or transitively emitted below `index`, not counting itself.
    pub fn node_count(&self, index: usize) -> usize {
        self.groups[index].node_count()
    }

    pub fn nodes_for_parent(&self, index: usize) -> usize {
        self.groups[index].nodes_for_parent()
    }

    pub fn has_mark(&self, index: usize) -> bool {
        self.groups[index].has_mark()
    }

    pub fn contains_mark(&self, index: usize) -> bool {
        self.groups[index].contains_mark()
    }

    pub fn parent_of(&self, index: usize) -> Option<usize> {
        let parent = self.groups[index].parent_anchor;
        (parent >= 0).then_some(parent as usize)
    }

    pub fn group_object_key(&self, index: usize) -> Option<Key> {
        let fields = &self.groups[index];
        if !fields.has_object_key() {
            return None;
        }
        let slot = self.table.data_index(index) + fields.object_key_offset();
        self.table.slots[slot]
            .as_deref()
            .and_then(|value| value.downcast_ref::<Key>())
            .copied()
    }

    pub fn group_aux(&self, index: usize) -> Option<&'a dyn Any> {
        let fields = &self.groups[index];
        if !fields.has_aux() {
            return None;
        }
        let slot = self.table.data_index(index) + fields.aux_offset();
        self.table.slots[slot].as_deref()
    }

    pub fn node(&self, index: usize) -> Option<&'a dyn Any> {
        if !self.groups[index].is_node() {
            return None;
        }
        self.table.slots[self.table.data_index(index)].as_deref()
    }

    /// Number of user slots of `group`.
    pub fn group_slot_count(&self, group: usize) -> usize {
        self.table.data_index(group + 1) - self.slot_start(group)
    }

    /// User slot `index` of `group`.
    pub fn group_get(&self, group: usize, index: usize) -> Option<&'a dyn Any> {
        let start = self.slot_start(group);
        let end = self.table.data_index(group + 1);
        let slot = start + index;
        if slot < end {
            self.table.slots[slot].as_deref()
        } else {
            None
        }
    }

    /// All user slots of `group`, in order.
    pub fn group_slots(&self, group: usize) -> impl Iterator<Item = Option<&'a dyn Any>> + 'a {
        let start = self.slot_start(group);
        let end = self.table.data_index(group + 1);
        self.table.slots[start..end].iter().map(|slot| slot.as_deref())
    }

    /// Every slot, including node and key slots, of `group` and its descendants.
    pub fn subtree_slots(&self, group: usize) -> impl Iterator<Item = Option<&'a dyn Any>> + 'a {
        let start = self.table.data_index(group);
        let end = self.table.data_index(group + self.groups[group].size);
        self.table.slots[start..end].iter().map(|slot| slot.as_deref())
    }

    fn slot_start(&self, group: usize) -> usize {
        self.table.data_index(group) + self.groups[group].data_slot_prefix()
    }

    /// Reads the next user slot of the current parent. `None` past the end.
    pub fn next(&mut self) -> Option<&'a dyn Any> {
        if self.empty_count > 0 || self.current_slot >= self.current_slot_end {
            return None;
        }
        let slot = self.current_slot;
        self.current_slot += 1;
        self.table.slots[slot].as_deref()
    }

    /// Index of the next user slot relative to the parent's first user slot.
    pub fn slot_position(&self) -> usize {
        match self.parent() {
            Some(parent) => self.current_slot - self.slot_start(parent),
            None => 0,
        }
    }

    /// Makes the cursor report group end until `end_empty`.
    pub fn begin_empty(&mut self) {
        self.empty_count += 1;
    }

    pub fn end_empty(&mut self) {
        assert!(self.empty_count > 0, "internal error: unbalanced end_empty");
        self.empty_count -= 1;
    }

    /// Enters the group at the cursor.
    pub fn start_group(&mut self) {
        if self.empty_count > 0 {
            return;
        }
        let parent = self.current_group;
        assert!(
            parent < self.current_end,
            "internal error: start_group at the end of group {}",
            self.parent
        );
        let fields = &self.groups[parent];
        self.parent = parent as isize;
        self.current_end = parent + fields.size;
        self.current_group = parent + 1;
        self.current_slot_stack.push(self.current_slot);
        self.current_slot = self.table.data_index(parent) + fields.data_slot_prefix();
        self.current_slot_end = self.table.data_index(parent + 1);
    }

    /// Skips the group at the cursor, returning the nodes it contributes.
    pub fn skip_group(&mut self) -> usize {
        assert!(
            self.empty_count == 0,
            "internal error: cannot skip while in an empty region"
        );
        let fields = &self.groups[self.current_group];
        let count = fields.nodes_for_parent();
        self.current_group += fields.size;
        count
    }

    /// Moves the cursor to the end of the current group.
    pub fn skip_to_group_end(&mut self) {
        assert!(
            self.empty_count == 0,
            "internal error: cannot skip to group end while in an empty region"
        );
        self.current_group = self.current_end;
        self.current_slot = self.current_slot_end;
    }

    /// Leaves the current group. The cursor must be at its end.
    pub fn end_group(&mut self) {
        if self.empty_count > 0 {
            return;
        }
        assert!(
            self.current_group == self.current_end,
            "internal error: end_group called at {} before the group end {}",
            self.current_group,
            self.current_end
        );
        let parent = self.parent;
        assert!(parent >= 0, "internal error: end_group at the root");
        let new_parent = self.groups[parent as usize].parent_anchor;
        self.parent = new_parent;
        self.current_end = if new_parent < 0 {
            self.groups_size
        } else {
            self.group_end(new_parent as usize)
        };
        match self.current_slot_stack.pop() {
            Some(slot) => {
                self.current_slot = slot;
                self.current_slot_end = if new_parent < 0 {
                    0
                } else {
                    self.table.data_index(new_parent as usize + 1)
                };
            }
            None => {
                self.current_slot = 0;
                self.current_slot_end = 0;
            }
        }
    }

    /// Positions the cursor on `index`, which must lie inside the current parent.
    pub fn reposition(&mut self, index: usize) {
        assert!(
            self.empty_count == 0,
            "internal error: cannot reposition while in an empty region"
        );
        self.current_group = index;
        let parent = if index < self.groups_size {
            self.groups[index].parent_anchor
        } else {
            -1
        };
        self.parent = parent;
        self.current_end = if parent < 0 {
            self.groups_size
        } else {
            self.group_end(parent as usize)
        };
        self.current_slot = 0;
        self.current_slot_end = 0;
    }

    /// Re-enters `index` as the current parent, positioned at its first child.
    pub fn restore_parent(&mut self, index: usize) {
        let fields = &self.groups[index];
        self.current_group = index + 1;
        self.current_end = index + fields.size;
        self.parent = index as isize;
        self.current_slot = self.table.data_index(index) + fields.data_slot_prefix();
        self.current_slot_end = self.table.data_index(index + 1);
    }

    /// Direct children of the current group from the cursor to its end.
    pub fn extract_keys(&self) -> Vec<KeyInfo> {
        let mut keys = Vec::new();
        if self.empty_count > 0 {
            return keys;
        }
        let mut index = 0;
        let mut child = self.current_group;
        while child < self.current_end {
            keys.push(KeyInfo {
                key: self.groups[child].key,
                object_key: self.group_object_key(child),
                location: child,
                nodes: self.groups[child].nodes_for_parent(),
                index,
            });
            index += 1;
            child += self.groups[child].size;
        }
        keys
    }

    pub fn anchor(&self, index: usize) -> Anchor {
        let mut anchors = self.table.anchors.borrow_mut();
        anchor::get_or_add(&mut anchors, index, self.groups_size, || {
            Anchor::new(index as isize)
        })
    }
}
