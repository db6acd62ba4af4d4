//! Tracks the oldest snapshot id each open snapshot can still observe.
//!
//! Record pruning never discards a record that a pinned id might read.

use std::collections::BTreeMap;

use crate::snapshot_id_set::{SnapshotId, SnapshotIdSet};

/// A pin on one snapshot id. Released through [`PinTable::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PinHandle(Option<SnapshotId>);

impl PinHandle {
    pub(crate) const NONE: PinHandle = PinHandle(None);
}

/// Multiset of pinned ids.
#[derive(Debug, Default)]
pub(crate) struct PinTable {
    pins: BTreeMap<SnapshotId, usize>,
}

impl PinTable {
    /// Pins the lowest id visible to a snapshot with `id` and `invalid`.
    pub(crate) fn track(&mut self, id: SnapshotId, invalid: &SnapshotIdSet) -> PinHandle {
        let pinned = invalid.lowest(id);
        *self.pins.entry(pinned).or_insert(0) += 1;
        PinHandle(Some(pinned))
    }

    pub(crate) fn release(&mut self, handle: PinHandle) {
        let Some(id) = handle.0 else {
            return;
        };
        if let Some(count) = self.pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&id);
            }
        }
    }

    pub(crate) fn lowest(&self) -> Option<SnapshotId> {
        self.pins.keys().next().copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pins.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_follows_outstanding_pins() {
        let mut table = PinTable::default();
        let first = table.track(5, &SnapshotIdSet::EMPTY);
        let second = table.track(9, &SnapshotIdSet::EMPTY.set(3));
        let third = table.track(9, &SnapshotIdSet::EMPTY.set(3));
        assert_eq!(table.lowest(), Some(3));
        table.release(second);
        assert_eq!(table.lowest(), Some(3));
        table.release(third);
        assert_eq!(table.lowest(), Some(5));
        table.release(first);
        table.release(PinHandle::NONE);
        assert_eq!(table.lowest(), None);
        assert_eq!(table.len(), 0);
    }
}
