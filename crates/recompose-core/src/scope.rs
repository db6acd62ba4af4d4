//! Restartable scopes and the registry mapping state reads to them.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::collections::map::HashMap;
use crate::composer::RestartFn;
use crate::slot_table::{Anchor, SlotTable};
use crate::snapshot::SnapshotSystem;
use crate::snapshot_state_observer::SnapshotStateObserver;
use crate::state::StateId;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ScopeId(u64);

impl ScopeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct ScopeInner {
    id: ScopeId,
    key: Cell<u64>,
    anchor: RefCell<Option<Anchor>>,
    invalid: Cell<bool>,
    released: Cell<bool>,
    restart: RefCell<Option<Rc<dyn Any>>>,
}

/// A restart group that can be composed again on its own.
///
/// The scope lives in the first slot of its group and is shared with the
/// registry; dropping the group releases it.
#[derive(Clone)]
pub struct RecomposeScope {
    inner: Rc<ScopeInner>,
}

impl RecomposeScope {
    fn new(id: ScopeId) -> Self {
        Self {
            inner: Rc::new(ScopeInner {
                id,
                key: Cell::new(0),
                anchor: RefCell::new(None),
                invalid: Cell::new(false),
                released: Cell::new(false),
                restart: RefCell::new(None),
            }),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// Schedules this scope for the next recompose pass.
    pub fn invalidate(&self) {
        if !self.inner.released.get() {
            self.inner.invalid.set(true);
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.inner.invalid.get()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.get()
    }

    /// Compound key of the scope's group when it was last composed.
    pub fn key(&self) -> u64 {
        self.inner.key.get()
    }

    pub fn anchor(&self) -> Option<Anchor> {
        self.inner.anchor.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn set_anchor(&self, anchor: Anchor) {
        *self.inner.anchor.borrow_mut() = Some(anchor);
    }

    pub(crate) fn set_key(&self, key: u64) {
        self.inner.key.set(key);
    }

    pub(crate) fn mark_valid(&self) {
        self.inner.invalid.set(false);
    }

    pub(crate) fn set_restart<N: 'static>(&self, restart: RestartFn<N>) {
        *self.inner.restart.borrow_mut() = Some(Rc::new(restart));
    }

    /// The content last composed in this scope.
    pub(crate) fn restart<N: 'static>(&self) -> Option<RestartFn<N>> {
        self.inner
            .restart
            .borrow()
            .as_ref()
            .and_then(|restart| restart.downcast_ref::<RestartFn<N>>())
            .cloned()
    }

    fn release(&self) {
        self.inner.released.set(true);
        self.inner.invalid.set(false);
        self.inner.restart.borrow_mut().take();
        self.inner.anchor.borrow_mut().take();
    }
}

impl fmt::Debug for RecomposeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecomposeScope")
            .field("id", &self.inner.id)
            .field("invalid", &self.inner.invalid.get())
            .field("released", &self.inner.released.get())
            .finish()
    }
}

/// Live scopes of one composition and the states each one read.
pub struct ScopeRegistry {
    scopes: HashMap<ScopeId, RecomposeScope>,
    reads: SnapshotStateObserver<ScopeId>,
    next_id: u64,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self {
            scopes: HashMap::default(),
            reads: SnapshotStateObserver::new(),
            next_id: 1,
        }
    }

    /// Starts turning snapshots applied in `system` into invalidations.
    pub fn start(&mut self, system: &SnapshotSystem) {
        self.reads.start(system);
    }

    pub fn stop(&mut self) {
        self.reads.stop();
    }

    /// A fresh scope. It becomes live once [`register`](Self::register)ed.
    pub(crate) fn create_scope(&mut self) -> RecomposeScope {
        let id = ScopeId(self.next_id);
        self.next_id += 1;
        RecomposeScope::new(id)
    }

    pub(crate) fn register(&mut self, scope: RecomposeScope) {
        self.scopes.insert(scope.id(), scope);
    }

    /// Drops `scope` and everything it read; later invalidations are ignored.
    pub(crate) fn release(&mut self, scope: &RecomposeScope) {
        self.scopes.remove(&scope.id());
        self.reads.clear(&scope.id());
        scope.release();
    }

    pub(crate) fn release_all(&mut self) {
        for (_, scope) in self.scopes.drain() {
            scope.release();
        }
        self.reads.clear_all();
    }

    /// Replaces the reads of `scope` with `reads`.
    pub(crate) fn set_reads(&mut self, scope: ScopeId, reads: impl IntoIterator<Item = StateId>) {
        self.reads.begin_scope(&scope);
        for state in reads {
            self.reads.record_read(&scope, state);
        }
    }

    pub fn reads_of(&self, scope: ScopeId) -> &[StateId] {
        self.reads.reads_of(&scope)
    }

    /// Reports `changed` states as if a snapshot writing them had applied.
    pub fn notify_changes(&self, changed: &[StateId]) {
        self.reads.notify_changes(changed);
    }

    /// Invalidates every live scope that read a state changed since the last
    /// call. Returns how many scopes were invalidated.
    pub fn process_changes(&mut self) -> usize {
        let mut count = 0;
        for id in self.reads.drain_changes() {
            if let Some(scope) = self.scopes.get(&id) {
                scope.invalidate();
                count += 1;
            }
        }
        count
    }

    pub fn has_invalidations(&mut self) -> bool {
        self.process_changes();
        self.scopes.values().any(RecomposeScope::is_invalid)
    }

    /// Invalid scopes keyed by the current index of their group in `table`.
    ///
    /// Scopes whose anchors no longer resolve are released.
    pub(crate) fn resolve_invalid(&mut self, table: &SlotTable) -> BTreeMap<usize, RecomposeScope> {
        let mut resolved = BTreeMap::new();
        let mut stale = Vec::new();
        for scope in self.scopes.values().filter(|scope| scope.is_invalid()) {
            let index = match scope.anchor() {
                Some(anchor) => table.anchor_index(&anchor),
                None => continue,
            };
            match index {
                Ok(index) => {
                    resolved.insert(index, scope.clone());
                }
                Err(err) => {
                    log::warn!("discarding invalidation of {:?}: {err}", scope.id());
                    stale.push(scope.clone());
                }
            }
        }
        for scope in stale {
            self.release(&scope);
        }
        resolved
    }

    pub fn get(&self, id: ScopeId) -> Option<&RecomposeScope> {
        self.scopes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

impl Default for ScopeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_scope_ignores_invalidation() {
        let mut registry = ScopeRegistry::new();
        let scope = registry.create_scope();
        registry.register(scope.clone());
        registry.release(&scope);
        scope.invalidate();
        assert!(!scope.is_invalid());
        assert!(!registry.has_invalidations());
    }

    #[test]
    fn state_change_invalidates_reader() {
        let mut registry = ScopeRegistry::new();
        let reader = registry.create_scope();
        let other = registry.create_scope();
        registry.register(reader.clone());
        registry.register(other.clone());
        let system = SnapshotSystem::new();
        let state = crate::state::MutableState::new(&system.global(), 0).id();
        registry.set_reads(reader.id(), [state]);

        registry.notify_changes(&[state]);
        assert!(registry.has_invalidations());
        assert!(reader.is_invalid());
        assert!(!other.is_invalid());
    }

    #[test]
    fn unresolvable_anchor_is_discarded() {
        let mut registry = ScopeRegistry::new();
        let scope = registry.create_scope();
        let foreign = SlotTable::new();
        let mut owner = SlotTable::new();
        {
            let mut writer = owner.write();
            writer.begin_insert();
            writer.start_group(1);
            writer.end_group();
            writer.end_insert();
            writer.close();
        }
        scope.set_anchor(owner.anchor(0));
        registry.register(scope.clone());
        scope.invalidate();

        assert!(registry.resolve_invalid(&foreign).is_empty());
        assert!(scope.is_released());
        assert!(registry.is_empty());
    }
}
