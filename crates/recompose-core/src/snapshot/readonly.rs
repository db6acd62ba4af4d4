use std::sync::Arc;

use super::global::take_new_snapshot;
use super::nested;
use super::{CoreInit, CoreKind, ReadObserver, Snapshot, SnapshotCore, SnapshotSystem};
use crate::error::SnapshotError;

/// A frozen view of everything applied before it was taken.
#[derive(Clone)]
pub struct ReadonlySnapshot(Arc<SnapshotCore>);

impl ReadonlySnapshot {
    pub(crate) fn take(system: &SnapshotSystem, read_observer: Option<ReadObserver>) -> Self {
        take_new_snapshot(system, |registry, invalid| {
            let id = registry.allocate_id();
            Self(SnapshotCore::new(
                system,
                registry,
                CoreInit {
                    kind: CoreKind::Readonly,
                    id,
                    invalid,
                    read_observer,
                    write_observer: None,
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
        nested::take_readonly_sharing_id(&self.0, read_observer)
    }
}
