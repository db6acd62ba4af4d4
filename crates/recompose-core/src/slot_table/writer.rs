use std::any::Any;
use std::cmp::{max, min};

use smallvec::SmallVec;

use super::anchor::{self, Anchor};
use super::group::{
    data_anchor_to_index, data_index_to_anchor, parent_anchor_to_index, parent_index_to_anchor,
    GroupFields,
};
use super::priority_set::PrioritySet;
use super::{Slot, SlotTable, MIN_GROUP_GROWTH, MIN_SLOTS_GROWTH};
use crate::error::SlotTableError;
use crate::Key;

/// Editing cursor over a [`SlotTable`].
///
/// Groups are entered with `start_group` and left with `end_group`. Outside an
/// insert region the writer walks existing groups; between `begin_insert` and
/// `end_insert` every `start_group` creates a new group at the cursor.
///
/// Dropping the writer closes it: both gaps are moved to the end and the
/// table's sizes are updated.
pub struct SlotWriter<'a> {
    table: &'a mut SlotTable,

    group_gap_start: usize,
    group_gap_len: usize,
    current_group: usize,
    current_group_end: usize,

    slots_gap_start: usize,
    slots_gap_len: usize,
    /// First group whose data anchor is end relative.
    slots_gap_owner: usize,
    current_slot: usize,
    current_slot_end: usize,

    parent: isize,
    insert_count: usize,
    node_count: usize,

    start_stack: SmallVec<[isize; 16]>,
    /// Group ends saved relative to the end of the table.
    end_stack: SmallVec<[usize; 16]>,
    node_count_stack: SmallVec<[usize; 16]>,

    pending_recalculate_marks: Option<PrioritySet>,
    closed: bool,
}

impl<'a> SlotWriter<'a> {
    pub(crate) fn new(table: &'a mut SlotTable) -> Self {
        let groups_size = table.groups_size;
        let slots_size = table.slots_size;
        let group_gap_len = table.groups.len() - groups_size;
        let slots_gap_len = table.slots.len() - slots_size;
        Self {
            table,
            group_gap_start: groups_size,
            group_gap_len,
            current_group: 0,
            current_group_end: groups_size,
            slots_gap_start: slots_size,
            slots_gap_len,
            slots_gap_owner: groups_size,
            current_slot: 0,
            current_slot_end: 0,
            parent: -1,
            insert_count: 0,
            node_count: 0,
            start_stack: SmallVec::new(),
            end_stack: SmallVec::new(),
            node_count_stack: SmallVec::new(),
            pending_recalculate_marks: None,
            closed: false,
        }
    }

    // ---------------------------------------------------------------------
    // Cursor state
    // ---------------------------------------------------------------------

    /// Number of groups, excluding the gap.
    pub fn size(&self) -> usize {
        self.capacity() - self.group_gap_len
    }

    pub fn current_group(&self) -> usize {
        self.current_group
    }

    pub fn current_group_end(&self) -> usize {
        self.current_group_end
    }

    /// The group the cursor is inside, `None` at the root.
    pub fn parent(&self) -> Option<usize> {
        (self.parent >= 0).then_some(self.parent as usize)
    }

    pub fn is_group_end(&self) -> bool {
        self.current_group == self.current_group_end
    }

    pub fn is_inserting(&self) -> bool {
        self.insert_count > 0
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.table.groups.len()
    }

    #[inline]
    fn slots_size(&self) -> usize {
        self.table.slots.len() - self.slots_gap_len
    }

    #[inline]
    fn group_index_to_address(&self, index: usize) -> usize {
        if index < self.group_gap_start {
            index
        } else {
            index + self.group_gap_len
        }
    }

    #[inline]
    fn data_index_to_data_address(&self, index: usize) -> usize {
        if index < self.slots_gap_start {
            index
        } else {
            index + self.slots_gap_len
        }
    }

    #[inline]
    fn fields(&self, index: usize) -> &GroupFields {
        &self.table.groups[self.group_index_to_address(index)]
    }

    #[inline]
    fn fields_mut(&mut self, index: usize) -> &mut GroupFields {
        let address = self.group_index_to_address(index);
        &mut self.table.groups[address]
    }

    fn data_index_at_address(&self, address: usize) -> usize {
        if address >= self.capacity() {
            self.slots_size()
        } else {
            data_anchor_to_index(
                self.table.groups[address].data_anchor,
                self.slots_gap_len,
                self.table.slots.len(),
            )
        }
    }

    #[inline]
    fn data_index(&self, index: usize) -> usize {
        self.data_index_at_address(self.group_index_to_address(index))
    }

    fn slot_index_at_address(&self, address: usize) -> usize {
        if address >= self.capacity() {
            self.slots_size()
        } else {
            self.data_index_at_address(address) + self.table.groups[address].data_slot_prefix()
        }
    }

    /// Encodes a data index for the group at `address`, honouring the gap owner.
    fn encode_data_anchor(&self, index: usize, address: usize) -> isize {
        let gap_start = if self.slots_gap_owner < address {
            0
        } else {
            self.slots_gap_start
        };
        data_index_to_anchor(index, gap_start, self.slots_gap_len, self.table.slots.len())
    }

    fn parent_at(&self, index: usize) -> isize {
        parent_anchor_to_index(self.fields(index).parent_anchor, self.size())
    }

    // ---------------------------------------------------------------------
    // Group queries
    // ---------------------------------------------------------------------

    pub fn group_size(&self, index: usize) -> usize {
        self.fields(index).size
    }

    pub fn group_key(&self, index: usize) -> Key {
        self.fields(index).key
    }

    pub fn is_node(&self, index: usize) -> bool {
        self.fields(index).is_node()
    }

    pub fn node_count(&self, index: usize) -> usize {
        self.fields(index).node_count()
    }

    pub fn parent_of(&self, index: usize) -> Option<usize> {
        let parent = self.parent_at(index);
        (parent >= 0).then_some(parent as usize)
    }

    pub fn group_object_key(&self, index: usize) -> Option<Key> {
        let fields = *self.fields(index);
        if !fields.has_object_key() {
            return None;
        }
        let slot = self.data_index_to_data_address(self.data_index(index) + fields.object_key_offset());
        self.table.slots[slot]
            .as_deref()
            .and_then(|value| value.downcast_ref::<Key>())
            .copied()
    }

    pub fn group_aux(&self, index: usize) -> Option<&dyn Any> {
        let fields = *self.fields(index);
        if !fields.has_aux() {
            return None;
        }
        let slot = self.data_index_to_data_address(self.data_index(index) + fields.aux_offset());
        self.table.slots[slot].as_deref()
    }

    pub fn node(&self, index: usize) -> Option<&dyn Any> {
        if !self.fields(index).is_node() {
            return None;
        }
        let slot = self.data_index_to_data_address(self.data_index(index));
        self.table.slots[slot].as_deref()
    }

    /// User slot `index` of `group`.
    pub fn slot(&self, group: usize, index: usize) -> Option<&dyn Any> {
        let start = self.slot_index_at_address(self.group_index_to_address(group));
        let end = self.data_index(group + 1);
        let slot = start + index;
        if slot < end {
            self.table.slots[self.data_index_to_data_address(slot)].as_deref()
        } else {
            None
        }
    }

    pub fn group_slot_count(&self, group: usize) -> usize {
        self.data_index(group + 1) - self.slot_index_at_address(self.group_index_to_address(group))
    }

    /// True if `anchor` resolves to `group` or a descendant.
    pub fn group_contains_anchor(&self, group: usize, anchor: &Anchor) -> bool {
        match self.anchor_index(anchor) {
            Ok(location) => location >= group && location < group + self.group_size(group),
            Err(_) => false,
        }
    }

    // ---------------------------------------------------------------------
    // Slot editing
    // ---------------------------------------------------------------------

    /// Writes the next slot of the current group and returns the previous value.
    ///
    /// While inserting a new slot is created at the cursor.
    pub fn update(&mut self, value: Slot) -> Slot {
        if self.insert_count > 0 {
            assert!(
                self.current_group == (self.parent + 1) as usize,
                "internal error: slots must be written before child groups"
            );
            self.insert_slots(1, self.parent);
        } else {
            assert!(
                self.current_slot < self.current_slot_end,
                "internal error: update past the last slot of group {}",
                self.parent
            );
        }
        let address = self.data_index_to_data_address(self.current_slot);
        self.current_slot += 1;
        std::mem::replace(&mut self.table.slots[address], value)
    }

    /// Replaces user slot `index` of the current parent, returning the old value.
    pub fn set(&mut self, index: usize, value: Slot) -> Slot {
        let parent = self.require_parent("set");
        let start = self.slot_index_at_address(self.group_index_to_address(parent));
        let end = self.data_index(parent + 1);
        let slot = start + index;
        assert!(
            slot < end,
            "internal error: slot {index} out of range for group {parent} with {} slots",
            end - start
        );
        let address = self.data_index_to_data_address(slot);
        std::mem::replace(&mut self.table.slots[address], value)
    }

    /// Adds a user slot after the last user slot of the current parent.
    pub fn append_slot(&mut self, value: Slot) {
        assert!(
            self.insert_count == 0,
            "internal error: append_slot is for existing groups, use update while inserting"
        );
        let parent = self.require_parent("append_slot");
        let saved = self.current_slot;
        let end = self.data_index(parent + 1);
        self.current_slot = end;
        self.insert_slots(1, parent as isize);
        let address = self.data_index_to_data_address(self.current_slot);
        self.table.slots[address] = value;
        self.current_slot = if saved >= end { saved + 1 } else { saved };
    }

    /// Removes the user slots of the current parent from `index` on, returning them.
    pub fn trim_slots(&mut self, index: usize) -> Vec<Slot> {
        assert!(
            self.insert_count == 0,
            "internal error: cannot trim slots while inserting"
        );
        let parent = self.require_parent("trim_slots");
        let start = self.slot_index_at_address(self.group_index_to_address(parent)) + index;
        let end = self.data_index(parent + 1);
        if start >= end {
            return Vec::new();
        }
        let mut removed = Vec::with_capacity(end - start);
        for slot in start..end {
            let address = self.data_index_to_data_address(slot);
            removed.push(self.table.slots[address].take());
        }
        let saved = self.current_slot;
        self.remove_slots(start, end - start, parent as isize);
        self.current_slot = if saved > start { start } else { saved };
        removed
    }

    /// Replaces the node of the group at the cursor's parent.
    pub fn update_node(&mut self, value: Box<dyn Any>) {
        let parent = self.require_parent("update_node");
        self.update_node_of_group(parent, value);
    }

    fn update_node_of_group(&mut self, index: usize, value: Box<dyn Any>) {
        let address = self.group_index_to_address(index);
        assert!(
            address < self.capacity() && self.table.groups[address].is_node(),
            "internal error: group {index} is not a node group"
        );
        let slot = self.data_index_to_data_address(self.data_index_at_address(address));
        self.table.slots[slot] = Some(value);
    }

    /// Replaces or adds the aux value of the current parent.
    pub fn update_aux(&mut self, value: Box<dyn Any>) {
        let parent = self.require_parent("update_aux");
        let fields = *self.fields(parent);
        assert!(
            fields.has_aux(),
            "internal error: group {parent} was created without an aux slot"
        );
        let slot = self.data_index_to_data_address(self.data_index(parent) + fields.aux_offset());
        self.table.slots[slot] = Some(value);
    }

    fn require_parent(&self, operation: &str) -> usize {
        assert!(
            self.parent >= 0,
            "internal error: {operation} requires an open group"
        );
        self.parent as usize
    }

    // ---------------------------------------------------------------------
    // Navigation
    // ---------------------------------------------------------------------

    /// Moves the cursor forward by `amount` groups within the current parent.
    pub fn advance_by(&mut self, amount: usize) {
        assert!(
            self.insert_count == 0,
            "internal error: cannot seek while inserting"
        );
        if amount == 0 {
            return;
        }
        let index = self.current_group + amount;
        assert!(
            index >= self.parent.max(0) as usize && index <= self.current_group_end,
            "internal error: cannot seek outside the current group ({} - {})",
            self.parent,
            self.current_group_end
        );
        self.current_group = index;
        let new_slot = self.data_index(index);
        self.current_slot = new_slot;
        self.current_slot_end = new_slot;
    }

    /// Moves the cursor to the anchored group, which must be at or after the cursor.
    pub fn seek(&mut self, anchor: &Anchor) -> Result<(), SlotTableError> {
        let index = self.anchor_index(anchor)?;
        assert!(
            index >= self.current_group,
            "internal error: cannot seek backwards from {} to {index}",
            self.current_group
        );
        self.advance_by(index - self.current_group);
        Ok(())
    }

    /// Skips the group at the cursor, returning the nodes it contributes.
    pub fn skip_group(&mut self) -> usize {
        let fields = *self.fields(self.current_group);
        let new_group = self.current_group + fields.size;
        self.current_group = new_group;
        self.current_slot = self.data_index(new_group);
        fields.nodes_for_parent()
    }

    /// Moves the cursor to the end of the current group.
    pub fn skip_to_group_end(&mut self) {
        let new_group = self.current_group_end;
        self.current_group = new_group;
        self.current_slot = self.data_index(new_group);
    }

    /// Enters the group at the cursor without changing its key.
    pub fn start_existing_group(&mut self) {
        assert!(
            self.insert_count == 0,
            "internal error: key is required when inserting"
        );
        let key = self.group_key(self.current_group);
        self.start_group_impl(key, None, false, None);
    }

    pub fn start_group(&mut self, key: Key) {
        self.start_group_impl(key, None, false, None);
    }

    /// Starts a group that also stores `object_key` for keyed matching.
    pub fn start_data(&mut self, key: Key, object_key: Option<Key>, aux: Option<Box<dyn Any>>) {
        self.start_group_impl(key, object_key, false, aux);
    }

    /// Starts a group that owns `node`.
    pub fn start_node(&mut self, key: Key, node: Box<dyn Any>) {
        self.start_group_impl(key, None, true, Some(node));
    }

    fn start_group_impl(
        &mut self,
        key: Key,
        object_key: Option<Key>,
        is_node: bool,
        aux: Option<Box<dyn Any>>,
    ) {
        let inserting = self.insert_count > 0;
        self.node_count_stack.push(self.node_count);

        self.current_group_end = if inserting {
            let current = self.current_group;
            self.insert_groups(1);
            let address = self.group_index_to_address(current);
            let has_object_key = object_key.is_some();
            let has_aux = !is_node && aux.is_some();
            let data_anchor = self.encode_data_anchor(self.current_slot, address);
            self.table.groups[address] = GroupFields::new(
                key,
                is_node,
                has_object_key,
                has_aux,
                self.parent,
                data_anchor,
            );
            self.current_slot_end = self.current_slot;

            let needed = is_node as usize + has_object_key as usize + has_aux as usize;
            if needed > 0 {
                self.insert_slots(needed, current as isize);
                let mut slot = self.current_slot;
                if is_node {
                    self.table.slots[slot] = aux;
                    slot += 1;
                    if let Some(object_key) = object_key {
                        self.table.slots[slot] = Some(Box::new(object_key));
                        slot += 1;
                    }
                } else {
                    if let Some(object_key) = object_key {
                        self.table.slots[slot] = Some(Box::new(object_key));
                        slot += 1;
                    }
                    if has_aux {
                        self.table.slots[slot] = aux;
                        slot += 1;
                    }
                }
                self.current_slot = slot;
            }
            self.node_count = 0;
            let new_current = current + 1;
            self.parent = current as isize;
            self.current_group = new_current;
            new_current
        } else {
            self.start_stack.push(self.parent);
            self.save_current_group_end();
            let current = self.current_group;
            assert!(
                current < self.current_group_end,
                "internal error: start_group past the end of group {}",
                self.parent
            );
            let address = self.group_index_to_address(current);
            assert!(
                self.table.groups[address].key == key,
                "internal error: start_group({key}) on group {current} with key {}",
                self.table.groups[address].key
            );
            if let Some(value) = aux {
                if is_node {
                    self.update_node_of_group(current, value);
                } else {
                    let fields = self.table.groups[address];
                    if fields.has_aux() {
                        let slot = self.data_index_to_data_address(
                            self.data_index_at_address(address) + fields.aux_offset(),
                        );
                        self.table.slots[slot] = Some(value);
                    }
                }
            }
            self.current_slot = self.slot_index_at_address(address);
            self.current_slot_end = self.data_index(current + 1);
            self.node_count = self.table.groups[address].node_count();
            self.parent = current as isize;
            self.current_group = current + 1;
            current + self.table.groups[address].size
        };
    }

    /// Ends the current group and returns the node count it recorded.
    pub fn end_group(&mut self) -> usize {
        let inserting = self.insert_count > 0;
        let current_group = self.current_group;
        let current_group_end = self.current_group_end;
        let group_index = self.parent;
        assert!(group_index >= 0, "internal error: end_group at the root");
        let group_index = group_index as usize;
        let group_address = self.group_index_to_address(group_index);
        let new_nodes = self.node_count;
        let new_group_size = current_group - group_index;
        let is_node = self.table.groups[group_address].is_node();

        if inserting {
            let fields = &mut self.table.groups[group_address];
            fields.size = new_group_size;
            fields.set_node_count(new_nodes);
            let saved = self.node_count_stack.pop().unwrap_or_default();
            self.node_count = saved + if is_node { 1 } else { new_nodes };
            self.parent = self.parent_at(group_index);
        } else {
            assert!(
                current_group == current_group_end,
                "internal error: expected to be at the end of group {group_index}"
            );
            let old_group_size = self.table.groups[group_address].size;
            let old_nodes = self.table.groups[group_address].node_count();
            {
                let fields = &mut self.table.groups[group_address];
                fields.size = new_group_size;
                fields.set_node_count(new_nodes);
            }
            let new_parent = self.start_stack.pop().unwrap_or(-1);
            self.restore_current_group_end();
            self.parent = new_parent;
            let group_parent = self.parent_at(group_index);
            let saved = self.node_count_stack.pop().unwrap_or_default();
            self.node_count = saved;
            if group_parent == new_parent {
                if !is_node {
                    self.node_count = (self.node_count + new_nodes).saturating_sub(old_nodes);
                }
            } else {
                // The group was reached through `seek`; propagate the change
                // along the spine up to the group that was started.
                let group_size_delta = new_group_size as isize - old_group_size as isize;
                let mut nodes_delta = if is_node {
                    0
                } else {
                    new_nodes as isize - old_nodes as isize
                };
                if group_size_delta != 0 || nodes_delta != 0 {
                    let mut current = group_parent;
                    while current >= 0 && current != new_parent && (nodes_delta != 0 || group_size_delta != 0) {
                        let index = current as usize;
                        let address = self.group_index_to_address(index);
                        let fields = &mut self.table.groups[address];
                        if group_size_delta != 0 {
                            fields.size = (fields.size as isize + group_size_delta) as usize;
                        }
                        if nodes_delta != 0 {
                            let count = fields.node_count() as isize + nodes_delta;
                            fields.set_node_count(count as usize);
                        }
                        if fields.is_node() {
                            nodes_delta = 0;
                        }
                        current = self.parent_at(index);
                    }
                }
                self.node_count = (self.node_count as isize + nodes_delta) as usize;
            }
        }
        new_nodes
    }

    /// Enters insert mode. Nests.
    pub fn begin_insert(&mut self) {
        if self.insert_count == 0 {
            self.save_current_group_end();
            self.current_slot = self.data_index(self.current_group);
        }
        self.insert_count += 1;
    }

    pub fn end_insert(&mut self) {
        assert!(
            self.insert_count > 0,
            "internal error: unbalanced begin_insert/end_insert"
        );
        self.insert_count -= 1;
        if self.insert_count == 0 {
            assert!(
                self.node_count_stack.len() == self.start_stack.len(),
                "internal error: start_group/end_group mismatch while inserting"
            );
            self.restore_current_group_end();
        }
    }

    // ---------------------------------------------------------------------
    // Structural edits
    // ---------------------------------------------------------------------

    /// Removes the group at the cursor and its slots.
    ///
    /// Anchors into the removed range are invalidated. Returns true if any
    /// anchor was removed.
    pub fn remove_group(&mut self) -> bool {
        assert!(
            self.insert_count == 0,
            "internal error: cannot remove a group while inserting"
        );
        self.current_slot = self.data_index(self.current_group);
        let old_group = self.current_group;
        let old_slot = self.current_slot;
        let count = self.skip_group();

        if let Some(pending) = self.pending_recalculate_marks.as_mut() {
            while pending.peek().is_some_and(|group| group >= old_group) {
                pending.take_max();
            }
        }

        let anchors_removed = self.remove_groups(old_group, self.current_group - old_group);
        self.remove_slots(
            old_slot,
            self.current_slot - old_slot,
            old_group as isize - 1,
        );
        self.current_group = old_group;
        self.current_slot = old_slot;
        self.node_count = self.node_count.saturating_sub(count);
        anchors_removed
    }

    /// Moves the group `offset` siblings after the cursor to the cursor.
    ///
    /// Anchors into the moved group follow it.
    pub fn move_group(&mut self, offset: usize) {
        assert!(
            self.insert_count == 0,
            "internal error: cannot move a group while inserting"
        );
        if offset == 0 {
            return;
        }
        self.current_slot = self.data_index(self.current_group);
        let current = self.current_group;
        let parent = self.parent;
        let parent_end = self.current_group_end;

        let mut group_to_move = current;
        for _ in 0..offset {
            group_to_move += self.group_size(group_to_move);
            assert!(
                group_to_move < parent_end,
                "internal error: move offset {offset} is past the end of group {parent}"
            );
        }

        let move_len = self.group_size(group_to_move);
        let current_slot = self.current_slot;
        let data_start = self.data_index(group_to_move);
        let data_end = self.data_index(group_to_move + move_len);
        let move_data_len = data_end - data_start;

        // Make room for the slots and groups at the cursor.
        self.insert_slots(move_data_len, current as isize - 1);
        self.insert_groups(move_len);

        // Copy the group records.
        let move_location_address = self.group_index_to_address(group_to_move + move_len);
        let current_address = self.group_index_to_address(current);
        self.table.groups.copy_within(
            move_location_address..move_location_address + move_len,
            current_address,
        );

        // Move the slot values.
        if move_data_len > 0 {
            let source = self.data_index_to_data_address(data_start + move_data_len);
            for offset in 0..move_data_len {
                let value = self.table.slots[source + offset].take();
                self.table.slots[current_slot + offset] = value;
            }
        }

        // Rebase the data anchors of the copied records.
        let data_move_distance = data_start + move_data_len - current_slot;
        for group in current..current + move_len {
            let address = self.group_index_to_address(group);
            let old_index = self.data_index_at_address(address);
            let new_index = old_index - data_move_distance;
            self.table.groups[address].data_anchor = self.encode_data_anchor(new_index, address);
        }

        self.move_anchors(group_to_move + move_len, current, move_len);

        let removed = self.remove_groups(group_to_move + move_len, move_len);
        assert!(!removed, "internal error: moving a group removed its anchors");

        self.fix_parent_anchors_for(parent, self.current_group_end, current);
        if move_data_len > 0 {
            self.remove_slots(
                data_start + move_data_len,
                move_data_len,
                (group_to_move + move_len) as isize - 1,
            );
        }
    }

    /// Moves the group at `index` of `table` to the cursor of this writer.
    ///
    /// The writer must be inserting. Anchors into the moved group are
    /// transferred to this table and returned.
    pub fn move_from(&mut self, table: &mut SlotTable, index: usize) -> Vec<Anchor> {
        assert!(
            self.insert_count > 0,
            "internal error: move_from requires an insert region"
        );
        assert!(
            index < table.groups_size,
            "internal error: move_from index {index} out of range"
        );

        if index == 0
            && self.current_group == 0
            && self.table.groups_size == 0
            && self.size() == 0
            && table.groups[0].size == table.groups_size
        {
            return self.adopt_table(table);
        }

        let mut from = table.write();
        move_group_between(&mut from, index, self)
    }

    /// Takes over all of `table`'s storage when this table is empty.
    fn adopt_table(&mut self, table: &mut SlotTable) -> Vec<Anchor> {
        std::mem::swap(&mut self.table.groups, &mut table.groups);
        std::mem::swap(&mut self.table.slots, &mut table.slots);
        std::mem::swap(self.table.anchors.get_mut(), table.anchors.get_mut());
        let groups_size = std::mem::take(&mut table.groups_size);
        let slots_size = std::mem::take(&mut table.slots_size);

        self.group_gap_start = groups_size;
        self.group_gap_len = self.table.groups.len() - groups_size;
        self.slots_gap_start = slots_size;
        self.slots_gap_len = self.table.slots.len() - slots_size;
        self.slots_gap_owner = groups_size;
        self.current_group_end += groups_size;
        self.current_group = groups_size;
        self.current_slot = slots_size;
        self.node_count += self.table.groups[0].nodes_for_parent();
        self.table.anchors.get_mut().clone()
    }

    /// Wraps the groups from the cursor to the end of the parent in a new group.
    pub fn insert_parent_group(&mut self, key: Key) {
        assert!(
            self.insert_count == 0,
            "internal error: cannot insert a parent group while inserting"
        );
        if self.is_group_end() {
            self.begin_insert();
            self.start_group(key);
            self.end_group();
            self.end_insert();
            return;
        }

        let current = self.current_group;
        let parent = self.parent_at(current);
        let parent_end = if parent >= 0 {
            parent as usize + self.group_size(parent as usize)
        } else {
            self.size()
        };
        let remaining = parent_end - current;
        let mut node_count = 0;
        let mut child = current;
        while child < parent_end {
            let fields = self.fields(child);
            node_count += fields.nodes_for_parent();
            child += fields.size;
        }
        let data_index = self.data_index(current);

        self.begin_insert();
        self.insert_groups(1);
        self.end_insert();

        let address = self.group_index_to_address(current);
        let data_anchor = self.encode_data_anchor(data_index, address);
        let mut fields = GroupFields::new(key, false, false, false, parent, data_anchor);
        fields.size = remaining + 1;
        fields.set_node_count(node_count);
        self.table.groups[address] = fields;

        if parent >= 0 {
            self.add_to_group_size_along_spine(parent as usize, 1);
        }
        self.fix_parent_anchors_for(parent, current + remaining + 1, current);
        self.current_group = current + remaining + 1;
        self.current_slot = self.data_index(self.current_group);
    }

    fn add_to_group_size_along_spine(&mut self, index: usize, amount: usize) {
        let mut current = index as isize;
        while current >= 0 {
            let index = current as usize;
            self.fields_mut(index).size += amount;
            current = self.parent_at(index);
        }
    }

    // ---------------------------------------------------------------------
    // Anchors
    // ---------------------------------------------------------------------

    /// Returns the anchor for the group at `index`, creating it if needed.
    pub fn anchor(&mut self, index: usize) -> Anchor {
        let size = self.size();
        assert!(
            index < size,
            "internal error: anchor index {index} out of range 0..{size}"
        );
        let gap_start = self.group_gap_start;
        anchor::get_or_add(self.table.anchors.get_mut(), index, size, || {
            if index < gap_start {
                Anchor::new(index as isize)
            } else {
                Anchor::new(-((size - index) as isize))
            }
        })
    }

    pub fn anchor_index(&self, anchor: &Anchor) -> Result<usize, SlotTableError> {
        if !anchor.valid() {
            return Err(SlotTableError::AnchorInvalid);
        }
        let size = self.size();
        let location = anchor.index_for(size);
        let anchors = self.table.anchors.borrow();
        match anchor::search(&anchors, location, size) {
            Ok(position) if anchors[position] == *anchor => Ok(location),
            _ => Err(SlotTableError::AnchorNotOwned),
        }
    }

    /// Rewrites anchor locations crossed by a gap move.
    fn update_anchors(&mut self, previous_gap_start: usize, new_gap_start: usize) {
        let size = self.size();
        let anchors = self.table.anchors.get_mut();
        if previous_gap_start < new_gap_start {
            let mut index = anchor::location_of(anchors, previous_gap_start, size);
            while index < anchors.len() {
                let location = anchors[index].location();
                if location >= 0 {
                    break;
                }
                let new_location = size as isize + location;
                if new_location >= new_gap_start as isize {
                    break;
                }
                anchors[index].set_location(new_location);
                index += 1;
            }
        } else {
            let mut index = anchor::location_of(anchors, new_gap_start, size);
            while index < anchors.len() {
                let location = anchors[index].location();
                if location < 0 {
                    break;
                }
                anchors[index].set_location(-(size as isize - location));
                index += 1;
            }
        }
    }

    /// Invalidates and drops anchors in `start..start + len`.
    fn remove_anchors(&mut self, start: usize, len: usize) -> bool {
        let size = self.size();
        let remove_end = start + len;
        let anchors = self.table.anchors.get_mut();
        if anchors.is_empty() {
            return false;
        }
        let mut index = anchor::location_of(anchors, remove_end, size).min(anchors.len() - 1) as isize;
        let mut remove_start = index as usize + 1;
        let mut remove_end_position = 0;
        while index >= 0 {
            let anchor = &anchors[index as usize];
            let location = anchor.index_for(size);
            if location < start {
                break;
            }
            if location < remove_end {
                anchor.invalidate();
                remove_start = index as usize;
                if remove_end_position == 0 {
                    remove_end_position = index as usize + 1;
                }
            }
            index -= 1;
        }
        let removed = remove_start < remove_end_position;
        if removed {
            anchors.drain(remove_start..remove_end_position);
        }
        removed
    }

    /// Re-targets anchors in `original..original + len` to `new_location..`.
    fn move_anchors(&mut self, original: usize, new_location: usize, len: usize) {
        let end = original + len;
        let size = self.size();
        let gap_start = self.group_gap_start;
        let anchors = self.table.anchors.get_mut();
        let index = anchor::location_of(anchors, original, size);
        let mut moved = Vec::new();
        while index < anchors.len() {
            let location = anchors[index].index_for(size);
            if location >= original && location < end {
                moved.push(anchors.remove(index));
            } else {
                break;
            }
        }
        for anchor in moved {
            let new_index = anchor.index_for(size) - original + new_location;
            if new_index >= gap_start {
                anchor.set_location(-((size - new_index) as isize));
            } else {
                anchor.set_location(new_index as isize);
            }
            let position = anchor::location_of(anchors, new_index, size);
            anchors.insert(position, anchor);
        }
    }

    // ---------------------------------------------------------------------
    // Marks
    // ---------------------------------------------------------------------

    /// Marks `group`, or the current parent when `None`.
    pub fn mark_group(&mut self, group: Option<usize>) {
        let group = match group {
            Some(group) => group,
            None => self.require_parent("mark_group"),
        };
        let fields = self.fields_mut(group);
        if fields.has_mark() {
            return;
        }
        fields.set_mark(true);
        if !fields.contains_mark() {
            let parent = self.parent_at(group);
            self.update_contains_mark(parent);
        }
    }

    pub fn has_mark(&self, group: usize) -> bool {
        self.fields(group).has_mark()
    }

    pub fn contains_mark(&self, group: usize) -> bool {
        self.fields(group).contains_mark()
    }

    fn contains_group_mark(&self, group: isize) -> bool {
        group >= 0 && self.fields(group as usize).contains_mark()
    }

    fn contains_any_group_marks(&self, group: isize) -> bool {
        group >= 0 && self.fields(group as usize).contains_any_mark()
    }

    fn update_contains_mark(&mut self, group: isize) {
        if group >= 0 {
            self.pending_recalculate_marks
                .get_or_insert_with(PrioritySet::default)
                .add(group as usize);
        }
    }

    fn recalculate_marks(&mut self) {
        let Some(mut pending) = self.pending_recalculate_marks.take() else {
            return;
        };
        while let Some(group) = pending.take_max() {
            self.update_contains_mark_now(group, &mut pending);
        }
    }

    fn update_contains_mark_now(&mut self, group: usize, pending: &mut PrioritySet) {
        let should_contain = self.child_contains_any_marks(group);
        let fields = self.fields_mut(group);
        if fields.contains_mark() != should_contain {
            fields.set_contains_mark(should_contain);
            let parent = self.parent_at(group);
            if parent >= 0 {
                pending.add(parent as usize);
            }
        }
    }

    fn child_contains_any_marks(&self, group: usize) -> bool {
        let end = group + self.group_size(group);
        let mut child = group + 1;
        while child < end {
            if self.fields(child).contains_any_mark() {
                return true;
            }
            child += self.group_size(child);
        }
        false
    }

    // ---------------------------------------------------------------------
    // Gap management
    // ---------------------------------------------------------------------

    fn save_current_group_end(&mut self) {
        self.end_stack
            .push(self.capacity() - self.group_gap_len - self.current_group_end);
    }

    fn restore_current_group_end(&mut self) {
        let saved = self.end_stack.pop().unwrap_or_default();
        self.current_group_end = self.capacity() - self.group_gap_len - saved;
    }

    /// Points every child of `parent` in `first_child..end_group` back at it.
    fn fix_parent_anchors_for(&mut self, parent: isize, end_group: usize, first_child: usize) {
        let parent_anchor = parent_index_to_anchor(parent, self.group_gap_start, self.size());
        let mut child = first_child;
        while child < end_group {
            let address = self.group_index_to_address(child);
            self.table.groups[address].parent_anchor = parent_anchor;
            let child_end = child + self.table.groups[address].size;
            self.fix_parent_anchors_for(child as isize, child_end, child + 1);
            child = child_end;
        }
    }

    fn move_group_gap_to(&mut self, index: usize) {
        let gap_len = self.group_gap_len;
        let gap_start = self.group_gap_start;
        if gap_start != index {
            if !self.table.anchors.get_mut().is_empty() {
                self.update_anchors(gap_start, index);
            }
            if gap_len > 0 {
                let groups = &mut self.table.groups;
                if index < gap_start {
                    groups.copy_within(index..gap_start, index + gap_len);
                } else {
                    groups.copy_within(gap_start + gap_len..index + gap_len, gap_start);
                }
            }

            let size = self.size();
            let capacity = self.capacity();
            let mut address = if index < gap_start {
                index + gap_len
            } else {
                gap_start
            };
            while address < capacity {
                let old_anchor = self.table.groups[address].parent_anchor;
                let parent = parent_anchor_to_index(old_anchor, size);
                let new_anchor = parent_index_to_anchor(parent, index, size);
                if new_anchor != old_anchor {
                    self.table.groups[address].parent_anchor = new_anchor;
                }
                address += 1;
                if address == index {
                    address += gap_len;
                }
            }
        }
        self.group_gap_start = index;
    }

    fn move_slot_gap_to(&mut self, index: usize, group: isize) {
        let gap_len = self.slots_gap_len;
        let gap_start = self.slots_gap_start;
        let owner = self.slots_gap_owner;
        if gap_start != index {
            let slots = &mut self.table.slots;
            if index < gap_start {
                slots[index..gap_start + gap_len].rotate_right(gap_len);
            } else {
                slots[gap_start..index + gap_len].rotate_left(gap_len);
            }
        }

        let new_owner = min(group + 1, self.size() as isize) as usize;
        if owner != new_owner {
            let slots_size = self.slots_size() as isize;
            if new_owner < owner {
                let mut address = self.group_index_to_address(new_owner);
                let stop = self.group_index_to_address(owner);
                let group_gap_start = self.group_gap_start;
                while address < stop {
                    let anchor = self.table.groups[address].data_anchor;
                    if anchor >= 0 {
                        self.table.groups[address].data_anchor = -(slots_size - anchor + 1);
                    }
                    address += 1;
                    if address == group_gap_start {
                        address += self.group_gap_len;
                    }
                }
            } else {
                let mut address = self.group_index_to_address(owner);
                let stop = self.group_index_to_address(new_owner);
                let group_gap_start = self.group_gap_start;
                while address < stop {
                    let anchor = self.table.groups[address].data_anchor;
                    if anchor < 0 {
                        self.table.groups[address].data_anchor = slots_size + anchor + 1;
                    }
                    address += 1;
                    if address == group_gap_start {
                        address += self.group_gap_len;
                    }
                }
            }
            self.slots_gap_owner = new_owner;
        }
        self.slots_gap_start = index;
    }

    fn insert_groups(&mut self, size: usize) {
        if size == 0 {
            return;
        }
        let current = self.current_group;
        self.move_group_gap_to(current);
        let gap_start = self.group_gap_start;
        let mut gap_len = self.group_gap_len;
        let old_capacity = self.capacity();
        let old_size = old_capacity - gap_len;
        if gap_len < size {
            let new_capacity = max(max(old_capacity * 2, old_size + size), MIN_GROUP_GROWTH);
            let new_gap_len = new_capacity - old_size;
            let groups = &mut self.table.groups;
            groups.splice(
                gap_start..gap_start,
                std::iter::repeat(GroupFields::default()).take(new_gap_len - gap_len),
            );
            gap_len = new_gap_len;
        }

        if self.current_group_end >= gap_start {
            self.current_group_end += size;
        }
        self.group_gap_start = gap_start + size;
        self.group_gap_len = gap_len - size;

        // New records start with the data index of the group they were inserted before.
        let index = if old_size > 0 {
            self.data_index(current + size)
        } else {
            0
        };
        let anchor_gap_start = if self.slots_gap_owner < gap_start {
            0
        } else {
            self.slots_gap_start
        };
        let anchor = data_index_to_anchor(
            index,
            anchor_gap_start,
            self.slots_gap_len,
            self.table.slots.len(),
        );
        for address in gap_start..gap_start + size {
            self.table.groups[address].data_anchor = anchor;
        }
        if self.slots_gap_owner >= gap_start {
            self.slots_gap_owner += size;
        }
    }

    fn insert_slots(&mut self, size: usize, group: isize) {
        if size == 0 {
            return;
        }
        self.move_slot_gap_to(self.current_slot, group);
        let gap_start = self.slots_gap_start;
        let mut gap_len = self.slots_gap_len;
        if gap_len < size {
            let old_capacity = self.table.slots.len();
            let old_size = old_capacity - gap_len;
            let new_capacity = max(max(old_capacity * 2, old_size + size), MIN_SLOTS_GROWTH);
            let new_gap_len = new_capacity - old_size;
            self.table.slots.splice(
                gap_start..gap_start,
                std::iter::repeat_with(|| None).take(new_gap_len - gap_len),
            );
            gap_len = new_gap_len;
        }
        if self.current_slot_end >= gap_start {
            self.current_slot_end += size;
        }
        self.slots_gap_start = gap_start + size;
        self.slots_gap_len = gap_len - size;
    }

    fn remove_groups(&mut self, start: usize, len: usize) -> bool {
        if len == 0 {
            return false;
        }
        self.move_group_gap_to(start);
        let anchors_removed = if self.table.anchors.get_mut().is_empty() {
            false
        } else {
            self.remove_anchors(start, len)
        };
        self.group_gap_start = start;
        self.group_gap_len += len;

        if self.slots_gap_owner > start {
            self.slots_gap_owner = max(start, self.slots_gap_owner - len);
        }
        if self.current_group_end >= self.group_gap_start {
            self.current_group_end -= len;
        }
        let parent = self.parent;
        if self.contains_group_mark(parent) {
            self.update_contains_mark(parent);
        }
        anchors_removed
    }

    fn remove_slots(&mut self, start: usize, len: usize, group: isize) {
        if len == 0 {
            return;
        }
        let gap_len = self.slots_gap_len;
        self.move_slot_gap_to(start + len, group);
        self.slots_gap_start = start;
        self.slots_gap_len = gap_len + len;
        for slot in &mut self.table.slots[start..start + len] {
            *slot = None;
        }
        if self.current_slot_end >= start {
            self.current_slot_end = self.current_slot_end.saturating_sub(len).max(start);
        }
    }

    /// Checks that data indices never decrease while the writer is open.
    pub fn verify_data_anchors(&self) -> Result<(), SlotTableError> {
        let mut previous = 0;
        for index in 0..self.size() {
            let data = self.data_index(index);
            if data < previous || data > self.slots_size() {
                return Err(SlotTableError::Malformed {
                    group: index,
                    reason: format!("data index {data} out of order after {previous}"),
                });
            }
            previous = data;
        }
        Ok(())
    }

    /// Moves both gaps to the end and publishes the sizes to the table.
    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let size = self.size();
        self.move_group_gap_to(size);
        let slots_size = self.slots_size();
        self.move_slot_gap_to(slots_size, self.group_gap_start as isize);
        self.recalculate_marks();
        self.table.groups_size = self.group_gap_start;
        self.table.slots_size = self.slots_gap_start;
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        // a table abandoned mid-edit is discarded by its owner; finishing it
        // here could panic again on half-written groups
        if !std::thread::panicking() {
            self.finish();
        }
    }
}

/// Moves the group at `from_index` of `from` to the cursor of `to`.
fn move_group_between(from: &mut SlotWriter<'_>, from_index: usize, to: &mut SlotWriter<'_>) -> Vec<Anchor> {
    let groups_to_move = from.group_size(from_index);
    let source_groups_end = from_index + groups_to_move;
    let source_slots_start = from.data_index(from_index);
    let source_slots_end = from.data_index(source_groups_end);
    let slots_to_move = source_slots_end - source_slots_start;
    let has_marks = from.contains_any_group_marks(from_index as isize);

    // Decode the source layout before any gap moves.
    let source_data: SmallVec<[usize; 16]> = (from_index..source_groups_end)
        .map(|group| from.data_index(group))
        .collect();
    let source_parents: SmallVec<[isize; 16]> = (from_index..source_groups_end)
        .map(|group| from.parent_at(group))
        .collect();

    to.current_slot = to.data_index(to.current_group);
    to.insert_groups(groups_to_move);
    to.insert_slots(slots_to_move, to.current_group as isize);

    if from.slots_gap_start < source_slots_end {
        from.move_slot_gap_to(source_slots_end, source_groups_end as isize);
    }
    if from.group_gap_start < source_groups_end {
        from.move_group_gap_to(source_groups_end);
    }

    let current_group = to.current_group;
    let current_slot = to.current_slot;
    let from_slot_base = from.data_index_to_data_address(source_slots_start);
    for offset in 0..slots_to_move {
        let value = from.table.slots[from_slot_base + offset].take();
        to.table.slots[current_slot + offset] = value;
    }

    let parent = to.parent;
    let parent_delta = current_group as isize - from_index as isize;
    let to_size = to.size();
    for offset in 0..groups_to_move {
        let source_address = from.group_index_to_address(from_index + offset);
        let mut fields = from.table.groups[source_address];
        let address = current_group + offset;
        fields.parent_anchor = if offset == 0 {
            parent
        } else {
            parent_index_to_anchor(source_parents[offset] + parent_delta, to.group_gap_start, to_size)
        };
        let new_data = source_data[offset] - source_slots_start + current_slot;
        fields.data_anchor = to.encode_data_anchor(new_data, address);
        if address == to.slots_gap_owner {
            to.slots_gap_owner += 1;
        }
        to.table.groups[address] = fields;
    }

    // Transfer anchors into the moved range.
    let from_size = from.size();
    let moved_anchors: Vec<Anchor> = {
        let from_anchors = from.table.anchors.get_mut();
        let start = anchor::location_of(from_anchors, from_index, from_size);
        let end = anchor::location_of(from_anchors, source_groups_end, from_size);
        if start < end {
            let taken: Vec<Anchor> = from_anchors.drain(start..end).collect();
            for anchor in &taken {
                let index = anchor.index_for(from_size) as isize + parent_delta;
                anchor.set_location(index);
            }
            taken
        } else {
            Vec::new()
        }
    };
    if !moved_anchors.is_empty() {
        let to_anchors = to.table.anchors.get_mut();
        let position = anchor::location_of(to_anchors, current_group, to_size);
        to_anchors.splice(position..position, moved_anchors.iter().cloned());
    }

    // Remove the now-empty source group, keeping parent sizes consistent.
    let parent_group = from.parent_at(from_index);
    let anchors_removed = if parent_group >= 0 {
        let parent_group = parent_group as usize;
        let mut root = parent_group;
        while let Some(up) = from.parent_of(root) {
            root = up;
        }
        from.advance_by(root - from.current_group);
        from.start_existing_group();
        if parent_group != root {
            from.advance_by(parent_group - from.current_group);
            from.start_existing_group();
        }
        from.advance_by(from_index - from.current_group);
        let removed = from.remove_group();
        from.skip_to_group_end();
        from.end_group();
        if parent_group != root {
            from.skip_to_group_end();
            from.end_group();
        }
        removed
    } else {
        from.advance_by(from_index - from.current_group);
        from.remove_group()
    };
    assert!(
        !anchors_removed,
        "internal error: anchors left behind when moving group {from_index}"
    );

    to.node_count += to.table.groups[current_group].nodes_for_parent();
    to.current_group = current_group + groups_to_move;
    to.current_slot = current_slot + slots_to_move;
    if has_marks {
        to.update_contains_mark(parent);
    }
    moved_anchors
}
