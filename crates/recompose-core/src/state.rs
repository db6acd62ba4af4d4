//! Snapshot-aware mutable state cells.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::SnapshotError;
use crate::snapshot::{read, write, Snapshot, SnapshotView, INVALID_SNAPSHOT, PREEXISTING_SNAPSHOT};
use crate::snapshot_id_set::{SnapshotId, SnapshotIdSet};

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a state cell, stable for its whole lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct StateId(u64);

impl StateId {
    fn next() -> Self {
        Self(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Decides when two values of a state count as the same write and how
/// concurrent writes combine.
pub trait MutationPolicy<T>: Send + Sync {
    fn equivalent(&self, a: &T, b: &T) -> bool;

    /// Three-way merge of a conflicting apply. `previous` is what the applying
    /// snapshot started from, `current` the newest applied value and
    /// `applied` the value being applied. `None` reports a conflict.
    fn merge(&self, _previous: &T, _current: &T, _applied: &T) -> Option<T> {
        None
    }
}

pub struct StructuralEquality;

impl<T: PartialEq> MutationPolicy<T> for StructuralEquality {
    fn equivalent(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

pub struct ReferentialEquality;

impl<T: ?Sized + Send + Sync> MutationPolicy<Arc<T>> for ReferentialEquality {
    fn equivalent(&self, a: &Arc<T>, b: &Arc<T>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

pub struct NeverEqual;

impl<T> MutationPolicy<T> for NeverEqual {
    fn equivalent(&self, _a: &T, _b: &T) -> bool {
        false
    }
}

pub fn structural_equality<T: PartialEq + 'static>() -> Arc<dyn MutationPolicy<T>> {
    Arc::new(StructuralEquality)
}

pub fn referential_equality<T: ?Sized + Send + Sync + 'static>() -> Arc<dyn MutationPolicy<Arc<T>>> {
    Arc::new(ReferentialEquality)
}

pub fn never_equal<T: 'static>() -> Arc<dyn MutationPolicy<T>> {
    Arc::new(NeverEqual)
}

/// Views used to check one state while a snapshot applies.
pub(crate) struct ApplyContext {
    /// What the apply target sees now.
    pub(crate) current: SnapshotView,
    /// What the applying snapshot saw before its own writes.
    pub(crate) previous: SnapshotView,
    /// What the applying snapshot sees including its own writes.
    pub(crate) applied: SnapshotView,
}

/// A record value waiting for the id it will be committed under.
pub(crate) type PendingRecord = Box<dyn Any + Send>;

pub(crate) enum MergeOutcome {
    /// Nobody else wrote the state; the snapshot's own record wins as is.
    Unchanged,
    Conflict,
    /// Commit a new record. `notify` is false when the applied value was
    /// equivalent to the current one, so observers see no change.
    Commit { record: PendingRecord, notify: bool },
}

/// Type-erased view of a state cell used by the snapshot machinery.
pub(crate) trait StateObject: Send + Sync {
    fn state_id(&self) -> StateId;

    fn merge_for_apply(&self, context: &ApplyContext) -> MergeOutcome;

    fn commit_merged(&self, record: PendingRecord, id: SnapshotId);

    /// Marks records written by `id` or any of `previous` as dead.
    fn abandon_records(&self, id: SnapshotId, previous: &SnapshotIdSet);

    /// Drops dead records and every record below `reuse_limit` except the
    /// newest one. Returns whether more than one record remains.
    fn prune(&self, reuse_limit: SnapshotId) -> bool;
}

struct StateRecord<T> {
    snapshot_id: SnapshotId,
    value: T,
}

struct StateCell<T> {
    id: StateId,
    records: RwLock<Vec<StateRecord<T>>>,
    policy: Arc<dyn MutationPolicy<T>>,
}

/// Index of the newest record `view` can see.
fn readable<T>(records: &[StateRecord<T>], view: &SnapshotView) -> Option<usize> {
    records
        .iter()
        .enumerate()
        .filter(|(_, record)| view.is_valid(record.snapshot_id))
        .max_by_key(|(_, record)| record.snapshot_id)
        .map(|(index, _)| index)
}

impl<T: Clone + Send + Sync + 'static> StateObject for StateCell<T> {
    fn state_id(&self) -> StateId {
        self.id
    }

    fn merge_for_apply(&self, context: &ApplyContext) -> MergeOutcome {
        let records = read(&self.records);
        let Some(current) = readable(&records, &context.current) else {
            return MergeOutcome::Unchanged;
        };
        let Some(previous) = readable(&records, &context.previous) else {
            return MergeOutcome::Unchanged;
        };
        if current == previous {
            return MergeOutcome::Unchanged;
        }
        let Some(applied) = readable(&records, &context.applied) else {
            panic!(
                "internal error: {:?} has no record for applying snapshot {}",
                self.id, context.applied.id
            );
        };
        let (previous, current, applied) =
            (&records[previous].value, &records[current].value, &records[applied].value);
        if self.policy.equivalent(current, applied) {
            return MergeOutcome::Commit {
                record: Box::new(current.clone()),
                notify: false,
            };
        }
        match self.policy.merge(previous, current, applied) {
            Some(merged) => MergeOutcome::Commit {
                record: Box::new(merged),
                notify: true,
            },
            None => MergeOutcome::Conflict,
        }
    }

    fn commit_merged(&self, record: PendingRecord, id: SnapshotId) {
        match record.downcast::<T>() {
            Ok(value) => write(&self.records).push(StateRecord {
                snapshot_id: id,
                value: *value,
            }),
            Err(_) => panic!("internal error: merged record type mismatch for {:?}", self.id),
        }
    }

    fn abandon_records(&self, id: SnapshotId, previous: &SnapshotIdSet) {
        for record in write(&self.records).iter_mut() {
            if record.snapshot_id == id || previous.get(record.snapshot_id) {
                record.snapshot_id = INVALID_SNAPSHOT;
            }
        }
    }

    fn prune(&self, reuse_limit: SnapshotId) -> bool {
        let mut records = write(&self.records);
        records.retain(|record| record.snapshot_id != INVALID_SNAPSHOT);
        let newest_below = records
            .iter()
            .map(|record| record.snapshot_id)
            .filter(|&id| id < reuse_limit)
            .max();
        if let Some(keep) = newest_below {
            records.retain(|record| record.snapshot_id >= reuse_limit || record.snapshot_id == keep);
        }
        records.len() > 1
    }
}

/// A value whose reads and writes are isolated per [`Snapshot`].
///
/// Cloning yields another handle to the same cell.
pub struct MutableState<T> {
    cell: Arc<StateCell<T>>,
}

impl<T> Clone for MutableState<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> MutableState<T> {
    /// A state using structural equality.
    pub fn new(snapshot: &Snapshot, value: T) -> Self {
        Self::with_policy(snapshot, value, structural_equality())
    }
}

impl<T: Clone + Send + Sync + 'static> MutableState<T> {
    /// Creates the state inside `snapshot`. Snapshots that cannot see
    /// `snapshot` still read `value` as the initial value, unless `snapshot`
    /// is the global one.
    pub fn with_policy(snapshot: &Snapshot, value: T, policy: Arc<dyn MutationPolicy<T>>) -> Self {
        let view = snapshot.view();
        let mut records = Vec::with_capacity(2);
        if !snapshot.is_global() {
            records.push(StateRecord {
                snapshot_id: PREEXISTING_SNAPSHOT,
                value: value.clone(),
            });
        }
        records.push(StateRecord {
            snapshot_id: view.id,
            value,
        });
        Self {
            cell: Arc::new(StateCell {
                id: StateId::next(),
                records: RwLock::new(records),
                policy,
            }),
        }
    }

    pub fn id(&self) -> StateId {
        self.cell.id
    }

    pub fn get(&self, snapshot: &Snapshot) -> T {
        self.with(snapshot, T::clone)
    }

    /// Reads without cloning. Reports the read to the snapshot's read observer.
    ///
    /// # Panics
    ///
    /// If no record is visible to `snapshot`, which happens when the state was
    /// created after `snapshot` was taken.
    pub fn with<R>(&self, snapshot: &Snapshot, f: impl FnOnce(&T) -> R) -> R {
        let view = snapshot.view();
        snapshot.record_read(self.cell.id);
        let records = read(&self.cell.records);
        match readable(&records, &view) {
            Some(index) => f(&records[index].value),
            None => panic!(
                "{:?} has no record visible to snapshot {}; it was created after the snapshot was taken",
                self.cell.id, view.id
            ),
        }
    }

    /// Writes `value` unless the policy says it equals the current value.
    pub fn set(&self, snapshot: &Snapshot, value: T) -> Result<(), SnapshotError> {
        if snapshot.is_read_only() {
            return Err(SnapshotError::ReadOnlyWrite);
        }
        let unchanged = {
            let view = snapshot.view();
            let records = read(&self.cell.records);
            readable(&records, &view)
                .is_some_and(|index| self.cell.policy.equivalent(&records[index].value, &value))
        };
        if unchanged {
            return Ok(());
        }
        self.write(snapshot, move |slot| *slot = value)
    }

    /// Mutates the value in place through `snapshot`, always counting as a write.
    pub fn update<R>(&self, snapshot: &Snapshot, f: impl FnOnce(&mut T) -> R) -> Result<R, SnapshotError> {
        let mut result = None;
        self.write(snapshot, |slot| result = Some(f(slot)))?;
        match result {
            Some(result) => Ok(result),
            None => Err(SnapshotError::Disposed),
        }
    }

    fn write(&self, snapshot: &Snapshot, f: impl FnOnce(&mut T)) -> Result<(), SnapshotError> {
        let object: Arc<dyn StateObject> = self.cell.clone();
        let cell = &self.cell;
        snapshot.write_state(&object, |view| {
            let mut records = write(&cell.records);
            let Some(index) = readable(&records, view) else {
                panic!(
                    "{:?} has no record visible to snapshot {}; it was created after the snapshot was taken",
                    cell.id, view.id
                );
            };
            if records[index].snapshot_id == view.id {
                f(&mut records[index].value);
                return;
            }
            let mut value = records[index].value.clone();
            f(&mut value);
            records.push(StateRecord {
                snapshot_id: view.id,
                value,
            });
        })
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        read(&self.cell.records).len()
    }
}

impl<T: fmt::Debug> fmt::Debug for MutableState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let records = read(&self.cell.records);
        f.debug_struct("MutableState")
            .field("id", &self.cell.id)
            .field(
                "records",
                &records
                    .iter()
                    .map(|record| (record.snapshot_id, &record.value))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}
