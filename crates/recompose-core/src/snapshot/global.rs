use std::sync::Arc;

use super::{notify_apply, Registry, SnapshotSystem, SnapshotView};
use crate::snapshot_id_set::SnapshotIdSet;
use crate::state::StateObject;

/// The snapshot that reads and writes outside any explicit snapshot go
/// through. Its writes become visible to new snapshots once the global
/// snapshot advances.
#[derive(Clone)]
pub struct GlobalSnapshot {
    system: SnapshotSystem,
}

impl GlobalSnapshot {
    pub(crate) fn new(system: SnapshotSystem) -> Self {
        Self { system }
    }

    pub fn system(&self) -> &SnapshotSystem {
        &self.system
    }

    pub(crate) fn view(&self) -> SnapshotView {
        let registry = self.system.registry();
        SnapshotView::new(registry.global.id, registry.global.invalid.clone())
    }

    pub(crate) fn has_pending_changes(&self) -> bool {
        !self.system.registry().global.modified.is_empty()
    }

    /// Global writes run under the system lock; observers run after it is released.
    pub(crate) fn write_state(
        &self,
        object: &Arc<dyn StateObject>,
        write: impl FnOnce(&SnapshotView),
    ) {
        let observers = {
            let mut registry = self.system.registry();
            let view = SnapshotView::new(registry.global.id, registry.global.invalid.clone());
            write(&view);
            registry.global.modified.insert(object);
            registry.global_write_observers()
        };
        let id = object.state_id();
        for observer in observers {
            observer(id);
        }
    }
}

/// Runs `make` with the ids a new snapshot must ignore, then advances the
/// global snapshot so that later global writes stay invisible to the result.
pub(crate) fn take_new_snapshot<T>(
    system: &SnapshotSystem,
    make: impl FnOnce(&mut Registry, SnapshotIdSet) -> T,
) -> T {
    let (result, previous_global, observers) = {
        let mut registry = system.registry();
        let invalid = registry.invalid_for_new_snapshot();
        let result = make(&mut registry, invalid);
        let previous = registry.take_new_global();
        let observers = if previous.modified.is_empty() {
            Vec::new()
        } else {
            registry.apply_observers()
        };
        (result, previous, observers)
    };
    notify_apply(&observers, &previous_global.modified, previous_global.id);
    system.registry().prune(previous_global.modified.states());
    result
}

pub(super) fn advance(system: &SnapshotSystem) {
    take_new_snapshot(system, |_, _| ());
}
