use std::mem;
use std::sync::Arc;

use super::global::take_new_snapshot;
use super::nested;
use super::{
    notify_apply, CoreInit, CoreKind, CoreState, ReadObserver, Registry, Snapshot,
    SnapshotApplyResult, SnapshotCore, SnapshotSystem, SnapshotView, WriteObserver,
};
use crate::collections::map::HashSet;
use crate::error::SnapshotError;
use crate::state::{ApplyContext, MergeOutcome, StateObject};

/// A top-level snapshot whose writes become globally visible on
/// [`apply`](MutableSnapshot::apply).
#[derive(Clone)]
pub struct MutableSnapshot(Arc<SnapshotCore>);

impl MutableSnapshot {
    pub(crate) fn take(
        system: &SnapshotSystem,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Self {
        take_new_snapshot(system, |registry, invalid| {
            let id = registry.allocate_id();
            Self(SnapshotCore::new(
                system,
                registry,
                CoreInit {
                    kind: CoreKind::Mutable,
                    id,
                    invalid,
                    read_observer,
                    write_observer,
                    parent: None,
                    owns_id: true,
                },
            ))
        })
    }

    pub(crate) fn core(&self) -> &Arc<SnapshotCore> {
        &self.0
    }

    pub(crate) fn take_nested_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        nested::take_readonly(&self.0, read_observer)
    }

    pub(crate) fn take_nested_mutable_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        nested::take_mutable(&self.0, read_observer, write_observer)
    }

    /// Publishes this snapshot's writes.
    ///
    /// Every modified state is checked against the newest applied record.
    /// When another snapshot changed the same state since this one was taken,
    /// the state's mutation policy decides: equivalent values keep the applied
    /// record, a successful merge produces a new record, anything else fails
    /// the whole apply and leaves the global state untouched.
    pub fn apply(&self) -> Result<SnapshotApplyResult, SnapshotError> {
        let core = &self.0;
        let system = core.system().clone();
        let (observers, previous_global, modified, merged, id) = {
            let mut registry = system.registry();
            let mut state = core.state();
            SnapshotCore::validate_open(&state)?;
            if !registry.is_open(core.view().id) {
                return Err(SnapshotError::NotOpen);
            }
            let mut merged = Vec::new();
            if !state.modified.is_empty() {
                let current =
                    SnapshotView::new(registry.next_id(), registry.invalid_for_new_snapshot());
                match merge_modified(core, &mut registry, &mut state, current) {
                    Some(states) => merged = states,
                    None => return Ok(SnapshotApplyResult::Failure),
                }
            }
            let id = core.view().id;
            registry.close(id, &state.previous_ids);
            let previous_global = registry.take_new_global();
            state.applied = true;
            let modified = mem::take(&mut state.modified);
            (registry.apply_observers(), previous_global, modified, merged, id)
        };

        log::debug!(
            "applied snapshot {id}: {} modified, {} merged",
            modified.states().len(),
            merged.len()
        );
        notify_apply(&observers, &previous_global.modified, id);
        notify_apply(&observers, &modified, id);

        let mut registry = system.registry();
        {
            let mut state = core.state();
            SnapshotCore::release_pins(&mut registry, &mut state);
        }
        registry.prune(
            previous_global
                .modified
                .states()
                .iter()
                .chain(modified.states())
                .chain(merged.iter()),
        );
        Ok(SnapshotApplyResult::Success)
    }
}

/// Checks every state modified through `core` against `current`, the view
/// the writes are being applied onto. Returns the states that received a
/// merged record, or `None` when some state conflicts.
pub(super) fn merge_modified(
    core: &SnapshotCore,
    registry: &mut Registry,
    state: &mut CoreState,
    current: SnapshotView,
) -> Option<Vec<Arc<dyn StateObject>>> {
    let view = core.view();
    let context = ApplyContext {
        current,
        previous: SnapshotView::new(view.id, view.invalid.set(view.id).or(&state.previous_ids)),
        applied: view.clone(),
    };
    let mut pending = Vec::new();
    let mut silent = HashSet::default();
    for object in state.modified.states() {
        match object.merge_for_apply(&context) {
            MergeOutcome::Unchanged => {}
            MergeOutcome::Conflict => {
                log::debug!(
                    "snapshot {} conflicts on {:?}",
                    view.id,
                    object.state_id()
                );
                return None;
            }
            MergeOutcome::Commit { record, notify } => {
                if !notify {
                    silent.insert(object.state_id());
                }
                pending.push((Arc::clone(object), record));
            }
        }
    }
    if pending.is_empty() {
        return Some(Vec::new());
    }
    // merged records must be newer than whatever they were merged against
    let id = core.advance_locked(registry, state);
    let merged = pending
        .into_iter()
        .map(|(object, record)| {
            object.commit_merged(record, id);
            object
        })
        .collect();
    state.modified.remove_all(&silent);
    Some(merged)
}
