//! Multi-version state snapshots.
//!
//! A [`SnapshotSystem`] hands out snapshot ids, tracks which ids are still
//! open and decides at apply time whether a snapshot's writes may become
//! visible to everyone else. State cells keep one record per writing
//! snapshot; a read sees the newest record whose id is visible to the reader.
//!
//! There is no ambient "current snapshot": every read and write names the
//! [`Snapshot`] it goes through.

mod global;
mod mutable;
mod nested;
mod readonly;

use std::fmt;
use std::mem;
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

use crate::collections::map::{HashMap, HashSet};
use crate::error::SnapshotError;
use crate::snapshot_id_set::{SnapshotId, SnapshotIdSet};
use crate::snapshot_pinning::{PinHandle, PinTable};
use crate::state::{StateId, StateObject};

pub use global::GlobalSnapshot;
pub use mutable::MutableSnapshot;
pub use nested::{NestedMutableSnapshot, NestedReadonlySnapshot};
pub use readonly::ReadonlySnapshot;

/// Records carrying this id are dead and may be dropped by pruning.
pub(crate) const INVALID_SNAPSHOT: SnapshotId = 0;

/// Id of the first global snapshot. States created inside a non-global
/// snapshot also get a record with this id so that snapshots which cannot see
/// the creating snapshot still find an initial value.
pub(crate) const PREEXISTING_SNAPSHOT: SnapshotId = 1;

pub type ReadObserver = Arc<dyn Fn(StateId) + Send + Sync>;
pub type WriteObserver = Arc<dyn Fn(StateId) + Send + Sync>;

/// Called after a successful apply with the modified states and the id of the
/// snapshot that was applied.
pub type ApplyObserver = Arc<dyn Fn(&[StateId], SnapshotId) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotApplyResult {
    Success,
    /// A state written by the snapshot was also changed by a snapshot that
    /// applied first, and its policy could not merge the two writes.
    Failure,
}

impl SnapshotApplyResult {
    pub fn is_success(&self) -> bool {
        matches!(self, SnapshotApplyResult::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SnapshotApplyResult::Failure)
    }

    #[track_caller]
    pub fn check(&self) {
        if self.is_failure() {
            panic!("snapshot apply failed: conflicting write");
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// What a snapshot can see: its own id and the lower ids it must ignore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SnapshotView {
    pub(crate) id: SnapshotId,
    pub(crate) invalid: SnapshotIdSet,
}

impl SnapshotView {
    pub(crate) fn new(id: SnapshotId, invalid: SnapshotIdSet) -> Self {
        Self { id, invalid }
    }

    #[inline]
    pub(crate) fn is_valid(&self, record: SnapshotId) -> bool {
        record != INVALID_SNAPSHOT && record <= self.id && !self.invalid.get(record)
    }
}

/// States written through one snapshot, in first-write order.
#[derive(Default)]
pub(crate) struct ModifiedStates {
    order: Vec<Arc<dyn StateObject>>,
    seen: HashSet<StateId>,
}

impl ModifiedStates {
    pub(crate) fn insert(&mut self, state: &Arc<dyn StateObject>) {
        if self.seen.insert(state.state_id()) {
            self.order.push(Arc::clone(state));
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub(crate) fn states(&self) -> &[Arc<dyn StateObject>] {
        &self.order
    }

    pub(crate) fn ids(&self) -> Vec<StateId> {
        self.order.iter().map(|state| state.state_id()).collect()
    }

    pub(crate) fn remove_all(&mut self, ids: &HashSet<StateId>) {
        if ids.is_empty() {
            return;
        }
        self.order.retain(|state| !ids.contains(&state.state_id()));
        self.seen.retain(|id| !ids.contains(id));
    }

    pub(crate) fn extend(&mut self, other: ModifiedStates) {
        for state in other.order {
            self.insert(&state);
        }
    }
}

pub(crate) struct GlobalRecord {
    pub(crate) id: SnapshotId,
    pub(crate) invalid: SnapshotIdSet,
    pub(crate) modified: ModifiedStates,
    pin: PinHandle,
}

/// Everything guarded by the system lock.
pub(crate) struct Registry {
    next_id: SnapshotId,
    open: SnapshotIdSet,
    pub(crate) global: GlobalRecord,
    pub(crate) pins: PinTable,
    apply_observers: Vec<(u64, ApplyObserver)>,
    global_write_observers: Vec<(u64, WriteObserver)>,
    next_observer: u64,
    /// States that still hold more than one record after their last pruning.
    extra_states: HashMap<StateId, Weak<dyn StateObject>>,
}

impl Registry {
    fn new() -> Self {
        let global_id = PREEXISTING_SNAPSHOT;
        let mut pins = PinTable::default();
        let pin = pins.track(global_id, &SnapshotIdSet::EMPTY);
        Self {
            next_id: global_id + 1,
            open: SnapshotIdSet::EMPTY.set(global_id),
            global: GlobalRecord {
                id: global_id,
                invalid: SnapshotIdSet::EMPTY,
                modified: ModifiedStates::default(),
                pin,
            },
            pins,
            apply_observers: Vec::new(),
            global_write_observers: Vec::new(),
            next_observer: 1,
            extra_states: HashMap::default(),
        }
    }

    /// Allocates a fresh id and marks it open.
    pub(crate) fn allocate_id(&mut self) -> SnapshotId {
        let id = self.next_id;
        self.next_id += 1;
        self.open = self.open.set(id);
        id
    }

    pub(crate) fn next_id(&self) -> SnapshotId {
        self.next_id
    }

    pub(crate) fn is_open(&self, id: SnapshotId) -> bool {
        self.open.get(id)
    }

    /// Makes `id` and every id in `previous` visible to snapshots taken later.
    pub(crate) fn close(&mut self, id: SnapshotId, previous: &SnapshotIdSet) {
        self.open = self.open.clear(id).and_not(previous);
    }

    /// Ids a snapshot taken now must not see, excluding the global snapshot's
    /// own pending writes.
    pub(crate) fn invalid_for_new_snapshot(&self) -> SnapshotIdSet {
        self.open.clear(self.global.id)
    }

    /// Closes the current global snapshot and opens its successor. Returns
    /// the closed global so the caller can notify about its writes.
    pub(crate) fn take_new_global(&mut self) -> GlobalRecord {
        let previous_id = self.global.id;
        self.open = self.open.clear(previous_id);
        let global_id = self.next_id;
        self.next_id += 1;
        let invalid = self.open.clone();
        self.open = self.open.set(global_id);
        let pin = self.pins.track(global_id, &invalid);
        let previous = mem::replace(
            &mut self.global,
            GlobalRecord {
                id: global_id,
                invalid,
                modified: ModifiedStates::default(),
                pin,
            },
        );
        self.pins.release(previous.pin);
        previous
    }

    pub(crate) fn apply_observers(&self) -> Vec<ApplyObserver> {
        self.apply_observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    pub(crate) fn global_write_observers(&self) -> Vec<WriteObserver> {
        self.global_write_observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    /// Records below this id are only kept if they are the newest such record.
    fn reuse_limit(&self) -> SnapshotId {
        self.pins.lowest().unwrap_or(self.next_id)
    }

    /// Drops records no open snapshot can read, from `states` and from every
    /// state left over from an earlier pass.
    pub(crate) fn prune<'a>(&mut self, states: impl IntoIterator<Item = &'a Arc<dyn StateObject>>) {
        let limit = self.reuse_limit();
        self.extra_states
            .retain(|_, state| state.upgrade().is_some_and(|state| state.prune(limit)));
        for state in states {
            if state.prune(limit) {
                self.extra_states
                    .insert(state.state_id(), Arc::downgrade(state));
            }
        }
    }
}

pub(crate) struct SystemInner {
    registry: Mutex<Registry>,
}

/// Owns snapshot ids, the open set, the global snapshot and observer lists.
///
/// Cloning is cheap and yields a handle to the same system.
#[derive(Clone)]
pub struct SnapshotSystem {
    inner: Arc<SystemInner>,
}

impl SnapshotSystem {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SystemInner {
                registry: Mutex::new(Registry::new()),
            }),
        }
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.inner.registry)
    }

    /// The always-open snapshot that writes outside any explicit snapshot go to.
    pub fn global(&self) -> Snapshot {
        Snapshot::Global(GlobalSnapshot::new(self.clone()))
    }

    /// A read-only view of everything applied so far.
    pub fn take_snapshot(&self, read_observer: Option<ReadObserver>) -> Snapshot {
        Snapshot::Readonly(ReadonlySnapshot::take(self, read_observer))
    }

    pub fn take_mutable_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Snapshot {
        Snapshot::Mutable(MutableSnapshot::take(self, read_observer, write_observer))
    }

    /// Applies pending writes made through the global snapshot and notifies
    /// apply observers about them.
    pub fn advance_global(&self) {
        global::advance(self);
    }

    /// [`advance_global`](Self::advance_global), skipped when the global
    /// snapshot has no pending writes.
    pub fn send_apply_notifications(&self) {
        let pending = !self.registry().global.modified.is_empty();
        if pending {
            self.advance_global();
        }
    }

    pub fn register_apply_observer(&self, observer: ApplyObserver) -> ObserverHandle {
        let mut registry = self.registry();
        let id = registry.next_observer;
        registry.next_observer += 1;
        registry.apply_observers.push((id, observer));
        ObserverHandle {
            system: Arc::downgrade(&self.inner),
            kind: ObserverKind::Apply,
            id,
        }
    }

    /// Observes writes made directly through the global snapshot, typically
    /// to schedule [`send_apply_notifications`](Self::send_apply_notifications).
    pub fn register_global_write_observer(&self, observer: WriteObserver) -> ObserverHandle {
        let mut registry = self.registry();
        let id = registry.next_observer;
        registry.next_observer += 1;
        registry.global_write_observers.push((id, observer));
        ObserverHandle {
            system: Arc::downgrade(&self.inner),
            kind: ObserverKind::GlobalWrite,
            id,
        }
    }

    /// Lowest snapshot id some open snapshot may still read.
    pub fn lowest_pinned(&self) -> Option<SnapshotId> {
        self.registry().pins.lowest()
    }

    pub fn open_snapshots(&self) -> SnapshotIdSet {
        self.registry().open.clone()
    }

    pub fn ptr_eq(&self, other: &SnapshotSystem) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for SnapshotSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SnapshotSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry();
        f.debug_struct("SnapshotSystem")
            .field("next_id", &registry.next_id)
            .field("open", &registry.open)
            .field("global", &registry.global.id)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObserverKind {
    Apply,
    GlobalWrite,
}

/// Unregisters its observer when dropped.
#[must_use = "dropping the handle unregisters the observer"]
pub struct ObserverHandle {
    system: Weak<SystemInner>,
    kind: ObserverKind,
    id: u64,
}

impl ObserverHandle {
    pub fn dispose(self) {}
}

impl fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        let Some(inner) = self.system.upgrade() else {
            return;
        };
        let mut registry = lock(&inner.registry);
        let id = self.id;
        match self.kind {
            ObserverKind::Apply => registry.apply_observers.retain(|(other, _)| *other != id),
            ObserverKind::GlobalWrite => registry
                .global_write_observers
                .retain(|(other, _)| *other != id),
        }
    }
}

pub(crate) fn notify_apply(
    observers: &[ApplyObserver],
    modified: &ModifiedStates,
    snapshot: SnapshotId,
) {
    if modified.is_empty() || observers.is_empty() {
        return;
    }
    let ids = modified.ids();
    for observer in observers {
        observer(&ids, snapshot);
    }
}

/// Chains two optional observers; both are called, `first` first.
pub(crate) fn merge_observers(
    first: Option<Arc<dyn Fn(StateId) + Send + Sync>>,
    second: Option<Arc<dyn Fn(StateId) + Send + Sync>>,
) -> Option<Arc<dyn Fn(StateId) + Send + Sync>> {
    match (first, second) {
        (Some(a), Some(b)) => Some(Arc::new(move |id| {
            a(id);
            b(id);
        })),
        (a, b) => a.or(b),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoreKind {
    Mutable,
    Readonly,
    NestedMutable,
    NestedReadonly,
}

pub(crate) struct CoreState {
    pub(crate) previous_ids: SnapshotIdSet,
    pub(crate) modified: ModifiedStates,
    pub(crate) pin: PinHandle,
    pub(crate) previous_pins: Vec<PinHandle>,
    pub(crate) applied: bool,
    pub(crate) disposed: bool,
    /// Set once a nested snapshot has released its hold on its parent.
    pub(crate) deactivated: bool,
    /// This snapshot plus every nested snapshot taken from it and not yet disposed.
    pub(crate) active: usize,
}

/// Shared body of every non-global snapshot. Disposed when the last handle drops.
pub(crate) struct SnapshotCore {
    system: SnapshotSystem,
    kind: CoreKind,
    view: RwLock<SnapshotView>,
    state: Mutex<CoreState>,
    read_observer: Option<ReadObserver>,
    write_observer: Option<WriteObserver>,
    parent: Option<Arc<SnapshotCore>>,
    /// False for a read-only snapshot nested in a read-only parent; it reuses
    /// the parent's id and must not close it.
    owns_id: bool,
}

pub(crate) struct CoreInit {
    pub(crate) kind: CoreKind,
    pub(crate) id: SnapshotId,
    pub(crate) invalid: SnapshotIdSet,
    pub(crate) read_observer: Option<ReadObserver>,
    pub(crate) write_observer: Option<WriteObserver>,
    pub(crate) parent: Option<Arc<SnapshotCore>>,
    pub(crate) owns_id: bool,
}

impl SnapshotCore {
    /// Builds the core and pins its lowest visible id. Called with the
    /// registry locked.
    pub(crate) fn new(system: &SnapshotSystem, registry: &mut Registry, init: CoreInit) -> Arc<Self> {
        let pin = registry.pins.track(init.id, &init.invalid);
        Arc::new(Self {
            system: system.clone(),
            kind: init.kind,
            view: RwLock::new(SnapshotView::new(init.id, init.invalid)),
            state: Mutex::new(CoreState {
                previous_ids: SnapshotIdSet::EMPTY,
                modified: ModifiedStates::default(),
                pin,
                previous_pins: Vec::new(),
                applied: false,
                disposed: false,
                deactivated: false,
                active: 1,
            }),
            read_observer: init.read_observer,
            write_observer: init.write_observer,
            parent: init.parent,
            owns_id: init.owns_id,
        })
    }

    pub(crate) fn system(&self) -> &SnapshotSystem {
        &self.system
    }

    pub(crate) fn parent(&self) -> Option<&Arc<SnapshotCore>> {
        self.parent.as_ref()
    }

    pub(crate) fn view(&self) -> SnapshotView {
        read(&self.view).clone()
    }

    pub(crate) fn view_mut(&self) -> RwLockWriteGuard<'_, SnapshotView> {
        write(&self.view)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, CoreState> {
        lock(&self.state)
    }

    pub(crate) fn read_observer(&self) -> Option<ReadObserver> {
        self.read_observer.clone()
    }

    pub(crate) fn write_observer(&self) -> Option<WriteObserver> {
        self.write_observer.clone()
    }

    pub(crate) fn is_mutable(&self) -> bool {
        matches!(self.kind, CoreKind::Mutable | CoreKind::NestedMutable)
    }

    pub(crate) fn validate_open(state: &CoreState) -> Result<(), SnapshotError> {
        if state.disposed {
            Err(SnapshotError::Disposed)
        } else if state.applied {
            Err(SnapshotError::AlreadyApplied)
        } else {
            Ok(())
        }
    }

    /// Moves this snapshot to a fresh id so that writes made from now on are
    /// newer than anything allocated in between. The old id stays readable
    /// through `previous_ids`.
    pub(crate) fn advance_locked(&self, registry: &mut Registry, state: &mut CoreState) -> SnapshotId {
        let mut view = self.view_mut();
        state.previous_ids = state.previous_ids.set(view.id);
        if state.applied || state.disposed {
            return view.id;
        }
        let previous = view.id;
        let id = registry.allocate_id();
        view.invalid = view.invalid.add_range(previous + 1, id);
        view.id = id;
        id
    }

    /// Closes this snapshot's ids and releases every pin it holds.
    pub(crate) fn close_locked(&self, registry: &mut Registry, state: &mut CoreState) {
        let id = read(&self.view).id;
        registry.close(id, &state.previous_ids);
        Self::release_pins(registry, state);
    }

    pub(crate) fn release_pins(registry: &mut Registry, state: &mut CoreState) {
        registry.pins.release(mem::replace(&mut state.pin, PinHandle::NONE));
        for pin in state.previous_pins.drain(..) {
            registry.pins.release(pin);
        }
    }

    /// Discards every record written through this snapshot.
    fn abandon_locked(
        &self,
        registry: &mut Registry,
        state: &mut CoreState,
    ) -> Vec<Arc<dyn StateObject>> {
        let id = read(&self.view).id;
        let modified = mem::take(&mut state.modified);
        for object in modified.states() {
            object.abandon_records(id, &state.previous_ids);
        }
        if !modified.is_empty() {
            log::debug!(
                "abandoning snapshot {id} with {} modified states",
                modified.states().len()
            );
        }
        self.close_locked(registry, state);
        modified.order
    }

    /// Drops one activation; the last one closes or abandons the snapshot.
    fn release_activation_locked(
        &self,
        registry: &mut Registry,
        state: &mut CoreState,
    ) -> Vec<Arc<dyn StateObject>> {
        state.active = state.active.saturating_sub(1);
        if state.active > 0 {
            return Vec::new();
        }
        match self.kind {
            CoreKind::Mutable | CoreKind::NestedMutable => {
                if state.applied {
                    Self::release_pins(registry, state);
                    Vec::new()
                } else {
                    self.abandon_locked(registry, state)
                }
            }
            CoreKind::Readonly | CoreKind::NestedReadonly => {
                if self.owns_id {
                    self.close_locked(registry, state);
                } else {
                    Self::release_pins(registry, state);
                }
                Vec::new()
            }
        }
    }

    pub(crate) fn nested_activated(state: &mut CoreState) {
        state.active += 1;
    }

    /// Called by a nested snapshot when it is applied or disposed.
    pub(crate) fn nested_deactivated(&self, registry: &mut Registry) {
        let abandoned = {
            let mut state = self.state();
            self.release_activation_locked(registry, &mut state)
        };
        registry.prune(abandoned.iter());
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state().disposed
    }

    pub(crate) fn has_pending_changes(&self) -> bool {
        !self.state().modified.is_empty()
    }

    pub(crate) fn dispose(&self) {
        let system = self.system.clone();
        let mut registry = system.registry();
        let (abandoned, release_parent) = {
            let mut state = self.state();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let abandoned = self.release_activation_locked(&mut registry, &mut state);
            let release_parent = !mem::replace(&mut state.deactivated, true);
            (abandoned, release_parent)
        };
        registry.prune(abandoned.iter());
        if release_parent {
            if let Some(parent) = &self.parent {
                parent.nested_deactivated(&mut registry);
            }
        }
    }

    /// Writes through this snapshot. `write` receives the snapshot's view.
    pub(crate) fn write_state(
        &self,
        object: &Arc<dyn StateObject>,
        write: impl FnOnce(&SnapshotView),
    ) -> Result<(), SnapshotError> {
        if !self.is_mutable() {
            return Err(SnapshotError::ReadOnlyWrite);
        }
        Self::validate_open(&self.state())?;
        let view = self.view();
        write(&view);
        self.state().modified.insert(object);
        if let Some(observer) = &self.write_observer {
            observer(object.state_id());
        }
        Ok(())
    }
}

impl Drop for SnapshotCore {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A handle to one snapshot of any kind.
///
/// Handles are cheap to clone. A non-global snapshot is disposed when its last
/// handle is dropped or when [`dispose`](Snapshot::dispose) is called through
/// any handle; a mutable snapshot disposed without a successful apply is
/// abandoned and its writes are discarded.
#[derive(Clone)]
pub enum Snapshot {
    Global(GlobalSnapshot),
    Mutable(MutableSnapshot),
    Readonly(ReadonlySnapshot),
    NestedMutable(NestedMutableSnapshot),
    NestedReadonly(NestedReadonlySnapshot),
}

impl Snapshot {
    fn core(&self) -> Option<&Arc<SnapshotCore>> {
        match self {
            Snapshot::Global(_) => None,
            Snapshot::Mutable(s) => Some(s.core()),
            Snapshot::Readonly(s) => Some(s.core()),
            Snapshot::NestedMutable(s) => Some(s.core()),
            Snapshot::NestedReadonly(s) => Some(s.core()),
        }
    }

    pub fn system(&self) -> &SnapshotSystem {
        match self {
            Snapshot::Global(s) => s.system(),
            Snapshot::Mutable(s) => s.core().system(),
            Snapshot::Readonly(s) => s.core().system(),
            Snapshot::NestedMutable(s) => s.core().system(),
            Snapshot::NestedReadonly(s) => s.core().system(),
        }
    }

    pub(crate) fn view(&self) -> SnapshotView {
        match self {
            Snapshot::Global(s) => s.view(),
            Snapshot::Mutable(s) => s.core().view(),
            Snapshot::Readonly(s) => s.core().view(),
            Snapshot::NestedMutable(s) => s.core().view(),
            Snapshot::NestedReadonly(s) => s.core().view(),
        }
    }

    pub fn id(&self) -> SnapshotId {
        self.view().id
    }

    pub fn invalid(&self) -> SnapshotIdSet {
        self.view().invalid
    }

    /// Whether a record written by snapshot `id` is visible here.
    pub fn is_valid(&self, id: SnapshotId) -> bool {
        self.view().is_valid(id)
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Snapshot::Global(_))
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Snapshot::Readonly(_) | Snapshot::NestedReadonly(_))
    }

    pub fn is_disposed(&self) -> bool {
        self.core().is_some_and(|core| core.is_disposed())
    }

    pub fn has_pending_changes(&self) -> bool {
        match self {
            Snapshot::Global(s) => s.has_pending_changes(),
            _ => self.core().is_some_and(|core| core.has_pending_changes()),
        }
    }

    /// A read-only snapshot frozen at this snapshot's current view.
    pub fn take_nested_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        match self {
            Snapshot::Global(s) => Ok(s.system().take_snapshot(read_observer)),
            Snapshot::Mutable(s) => s.take_nested_snapshot(read_observer),
            Snapshot::Readonly(s) => s.take_nested_snapshot(read_observer),
            Snapshot::NestedMutable(s) => s.take_nested_snapshot(read_observer),
            Snapshot::NestedReadonly(s) => s.take_nested_snapshot(read_observer),
        }
    }

    /// A mutable child whose apply merges into this snapshot instead of the
    /// global state. Taken from the global snapshot it is a top-level mutable
    /// snapshot.
    pub fn take_nested_mutable_snapshot(
        &self,
        read_observer: Option<ReadObserver>,
        write_observer: Option<WriteObserver>,
    ) -> Result<Snapshot, SnapshotError> {
        match self {
            Snapshot::Global(s) => Ok(s
                .system()
                .take_mutable_snapshot(read_observer, write_observer)),
            Snapshot::Mutable(s) => s.take_nested_mutable_snapshot(read_observer, write_observer),
            Snapshot::NestedMutable(s) => {
                s.take_nested_mutable_snapshot(read_observer, write_observer)
            }
            Snapshot::Readonly(_) | Snapshot::NestedReadonly(_) => Err(SnapshotError::NotMutable),
        }
    }

    pub fn apply(&self) -> Result<SnapshotApplyResult, SnapshotError> {
        match self {
            Snapshot::Global(_) => Err(SnapshotError::GlobalApply),
            Snapshot::Mutable(s) => s.apply(),
            Snapshot::NestedMutable(s) => s.apply(),
            Snapshot::Readonly(_) | Snapshot::NestedReadonly(_) => Err(SnapshotError::NotMutable),
        }
    }

    /// Releases the snapshot. The global snapshot cannot be disposed; the
    /// call is ignored for it.
    pub fn dispose(&self) {
        if let Some(core) = self.core() {
            core.dispose();
        }
    }

    pub(crate) fn record_read(&self, state: StateId) {
        if let Some(observer) = self.core().and_then(|core| core.read_observer.as_ref()) {
            observer(state);
        }
    }

    pub(crate) fn write_state(
        &self,
        object: &Arc<dyn StateObject>,
        write: impl FnOnce(&SnapshotView),
    ) -> Result<(), SnapshotError> {
        match self {
            Snapshot::Global(s) => {
                s.write_state(object, write);
                Ok(())
            }
            _ => match self.core() {
                Some(core) => core.write_state(object, write),
                None => Err(SnapshotError::ReadOnlyWrite),
            },
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Snapshot::Global(_) => "Global",
            Snapshot::Mutable(_) => "Mutable",
            Snapshot::Readonly(_) => "Readonly",
            Snapshot::NestedMutable(_) => "NestedMutable",
            Snapshot::NestedReadonly(_) => "NestedReadonly",
        };
        let view = self.view();
        f.debug_struct(kind)
            .field("id", &view.id)
            .field("invalid", &view.invalid)
            .finish()
    }
}
