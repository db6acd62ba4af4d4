//! Snapshots taken from another non-global snapshot.
//!
//! A nested mutable snapshot applies into its parent: its records become
//! visible to the parent but stay hidden from everyone else until the parent
//! itself applies.

use std::mem;
use std::sync::Arc;

use super::mutable::merge_modified;
use super::{
    merge_observers, CoreInit, CoreKind, ReadObserver, Snapshot, SnapshotApplyResult,
    SnapshotCore, WriteObserver,
};
use crate::error::SnapshotError;
use crate::snapshot_pinning::PinHandle;

#[derive(Clone)]
pub struct NestedMutableSnapshot(Arc<SnapshotCore>);

#[derive(Clone)]
pub struct NestedReadonlySnapshot(Arc<SnapshotCore>);

/// Read-only child of a mutable snapshot. The parent moves to a new id so its
/// later writes stay invisible to the child.
pub(crate) fn take_readonly(
    parent: &Arc<SnapshotCore>,
    read_observer: Option<ReadObserver>,
) -> Result<Snapshot, SnapshotError> {
    let system = parent.system().clone();
    let mut registry = system.registry();
    let (id, invalid) = {
        let mut state = parent.state();
        SnapshotCore::validate_open(&state)?;
        let previous = parent.view();
        let id = registry.allocate_id();
        let invalid = previous.invalid.add_range(previous.id + 1, id);
        parent.advance_locked(&mut registry, &mut state);
        SnapshotCore::nested_activated(&mut state);
        (id, invalid)
    };
    let core = SnapshotCore::new(
        &system,
        &mut registry,
        CoreInit {
            kind: CoreKind::NestedReadonly,
            id,
            invalid,
            read_observer: merge_observers(read_observer, parent.read_observer()),
            write_observer: None,
            parent: Some(Arc::clone(parent)),
            owns_id: true,
        },
    );
    Ok(Snapshot::NestedReadonly(NestedReadonlySnapshot(core)))
}

/// Read-only child of a read-only snapshot; nothing can change underneath it,
/// so it shares the parent's id.
pub(crate) fn take_readonly_sharing_id(
    parent: &Arc<SnapshotCore>,
    read_observer: Option<ReadObserver>,
) -> Result<Snapshot, SnapshotError> {
    let system = parent.system().clone();
    let mut registry = system.registry();
    {
        let mut state = parent.state();
        if state.disposed {
            return Err(SnapshotError::Disposed);
        }
        SnapshotCore::nested_activated(&mut state);
    }
    let view = parent.view();
    let core = SnapshotCore::new(
        &system,
        &mut registry,
        CoreInit {
            kind: CoreKind::NestedReadonly,
            id: view.id,
            invalid: view.invalid,
            read_observer: merge_observers(read_observer, parent.read_observer()),
            write_observer: None,
            parent: Some(Arc::clone(parent)),
            owns_id: false,
        },
    );
    Ok(Snapshot::NestedReadonly(NestedReadonlySnapshot(core)))
}

/// Mutable child of a mutable snapshot. The parent treats the child's id as
/// invalid until the child applies.
pub(crate) fn take_mutable(
    parent: &Arc<SnapshotCore>,
    read_observer: Option<ReadObserver>,
    write_observer: Option<WriteObserver>,
) -> Result<Snapshot, SnapshotError> {
    let system = parent.system().clone();
    let mut registry = system.registry();
    let (id, invalid) = {
        let mut state = parent.state();
        SnapshotCore::validate_open(&state)?;
        let previous = parent.view();
        let id = registry.allocate_id();
        parent.view_mut().invalid = previous.invalid.set(id);
        let invalid = previous.invalid.add_range(previous.id + 1, id);
        parent.advance_locked(&mut registry, &mut state);
        SnapshotCore::nested_activated(&mut state);
        (id, invalid)
    };
    let core = SnapshotCore::new(
        &system,
        &mut registry,
        CoreInit {
            kind: CoreKind::NestedMutable,
            id,
            invalid,
            read_observer: merge_observers(read_observer, parent.read_observer()),
            write_observer: merge_observers(write_observer, parent.write_observer()),
            parent: Some(Arc::clone(parent)),
            owns_id: true,
        },
    );
    Ok(Snapshot::NestedMutable(NestedMutableSnapshot(core)))
}

impl NestedMutableSnapshot {
    pub(crate) fn core(&self) -> &Arc<SnapshotCore> {
        &self.0
    }

    pub(crate) fn take_nested_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        take_readonly(&self.0, read_observer)
    }

    pub(crate) fn take_nested_mutable_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        take_mutable(&self.0, read_observer, write_observer)
    }

    /// Merges this snapshot's writes into its parent.
    ///
    /// Fails without touching the parent when the parent was already applied
    /// or disposed, or when a state conflicts with a write the parent made
    /// after this snapshot was taken.
    pub fn apply(&self) -> Result<SnapshotApplyResult, SnapshotError> {
        let core = &self.0;
        let Some(parent) = core.parent() else {
            return Err(SnapshotError::NotOpen);
        };
        let system = core.system().clone();
        let mut registry = system.registry();
        let merged = {
            let mut parent_state = parent.state();
            if parent_state.applied || parent_state.disposed {
                return Ok(SnapshotApplyResult::Failure);
            }
            let mut state = core.state();
            SnapshotCore::validate_open(&state)?;

            let merged = if state.modified.is_empty() {
                core.close_locked(&mut registry, &mut state);
                Vec::new()
            } else {
                let merged = match merge_modified(core, &mut registry, &mut state, parent.view())
                {
                    Some(merged) => merged,
                    None => return Ok(SnapshotApplyResult::Failure),
                };
                parent_state.modified.extend(mem::take(&mut state.modified));
                merged
            };

            let view = core.view();
            if parent.view().id < view.id {
                parent.advance_locked(&mut registry, &mut parent_state);
            }
            {
                let mut parent_view = parent.view_mut();
                parent_view.invalid = parent_view
                    .invalid
                    .clear(view.id)
                    .and_not(&state.previous_ids);
            }
            parent_state.previous_ids = parent_state
                .previous_ids
                .set(view.id)
                .or(&state.previous_ids);
            // the parent keeps our records alive until it closes
            let pin = mem::replace(&mut state.pin, PinHandle::NONE);
            parent_state.previous_pins.push(pin);
            parent_state.previous_pins.append(&mut state.previous_pins);
            state.applied = true;
            state.deactivated = true;
            merged
        };
        parent.nested_deactivated(&mut registry);
        registry.prune(merged.iter());
        Ok(SnapshotApplyResult::Success)
    }
}

impl NestedReadonlySnapshot {
    pub(crate) fn core(&self) -> &Arc<SnapshotCore> {
        &self.0
    }

    pub(crate) fn take_nested_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        take_readonly_sharing_id(&self.0, read_observer)
    }
}
