//! Tracks which states each scope read and reports the scopes whose reads
//! were changed by an applied snapshot.
//!
//! Apply notifications may arrive on any thread, so they are only queued
//! there; mapping state ids back to scopes happens on the owner's thread in
//! [`SnapshotStateObserver::drain_changes`].

use std::hash::Hash;
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::collections::map::{HashMap, HashSet};
use crate::snapshot::{lock, ObserverHandle, SnapshotSystem};
use crate::state::StateId;

pub struct SnapshotStateObserver<S> {
    reads: HashMap<S, SmallVec<[StateId; 4]>>,
    readers: HashMap<StateId, HashSet<S>>,
    pending: Arc<Mutex<Vec<StateId>>>,
    handle: Option<ObserverHandle>,
}

impl<S: Clone + Eq + Hash> SnapshotStateObserver<S> {
    pub fn new() -> Self {
        Self {
            reads: HashMap::default(),
            readers: HashMap::default(),
            pending: Arc::new(Mutex::new(Vec::new())),
            handle: None,
        }
    }

    /// Starts listening for applied snapshots of `system`. Restarting replaces
    /// the previous registration.
    pub fn start(&mut self, system: &SnapshotSystem) {
        let pending = Arc::clone(&self.pending);
        self.handle = Some(system.register_apply_observer(Arc::new(move |changed, _| {
            lock(&pending).extend_from_slice(changed);
        })));
    }

    pub fn stop(&mut self) {
        self.handle = None;
    }

    pub fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// Forgets what `scope` read so a fresh pass can record it again.
    pub fn begin_scope(&mut self, scope: &S) {
        self.clear(scope);
    }

    pub fn record_read(&mut self, scope: &S, state: StateId) {
        let reads = self.reads.entry(scope.clone()).or_default();
        if reads.contains(&state) {
            return;
        }
        reads.push(state);
        self.readers.entry(state).or_default().insert(scope.clone());
    }

    pub fn clear(&mut self, scope: &S) {
        let Some(reads) = self.reads.remove(scope) else {
            return;
        };
        for state in reads {
            if let Some(readers) = self.readers.get_mut(&state) {
                readers.remove(scope);
                if readers.is_empty() {
                    self.readers.remove(&state);
                }
            }
        }
    }

    pub fn clear_all(&mut self) {
        self.reads.clear();
        self.readers.clear();
        lock(&self.pending).clear();
    }

    /// Queues `changed` as if a snapshot writing those states had applied.
    pub fn notify_changes(&self, changed: &[StateId]) {
        lock(&self.pending).extend_from_slice(changed);
    }

    pub fn has_pending_changes(&self) -> bool {
        !lock(&self.pending).is_empty()
    }

    /// Scopes that read any state changed since the last drain, each once.
    pub fn drain_changes(&mut self) -> Vec<S> {
        let changed = std::mem::take(&mut *lock(&self.pending));
        let mut seen = HashSet::default();
        let mut scopes = Vec::new();
        for state in changed {
            let Some(readers) = self.readers.get(&state) else {
                continue;
            };
            for scope in readers {
                if seen.insert(scope.clone()) {
                    scopes.push(scope.clone());
                }
            }
        }
        scopes
    }

    /// States `scope` read during its last pass.
    pub fn reads_of(&self, scope: &S) -> &[StateId] {
        self.reads.get(scope).map(|reads| reads.as_slice()).unwrap_or(&[])
    }
}

impl<S: Clone + Eq + Hash> Default for SnapshotStateObserver<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MutableState;

    #[test]
    fn changed_state_reports_its_readers_once() {
        let system = SnapshotSystem::new();
        let global = system.global();
        let a = MutableState::new(&global, 1);
        let b = MutableState::new(&global, 2);
        let mut observer = SnapshotStateObserver::<u32>::new();
        observer.record_read(&1, a.id());
        observer.record_read(&1, b.id());
        observer.record_read(&2, b.id());

        observer.notify_changes(&[a.id(), b.id()]);
        let mut changed = observer.drain_changes();
        changed.sort();
        assert_eq!(changed, vec![1, 2]);
        assert!(observer.drain_changes().is_empty());
    }

    #[test]
    fn begin_scope_drops_previous_reads() {
        let system = SnapshotSystem::new();
        let global = system.global();
        let a = MutableState::new(&global, 1);
        let mut observer = SnapshotStateObserver::<u32>::new();
        observer.record_read(&7, a.id());
        observer.begin_scope(&7);
        assert!(observer.reads_of(&7).is_empty());

        observer.notify_changes(&[a.id()]);
        assert!(observer.drain_changes().is_empty());
    }

    #[test]
    fn applied_snapshot_is_observed_until_stopped() {
        let system = SnapshotSystem::new();
        let state = MutableState::new(&system.global(), 0);
        let mut observer = SnapshotStateObserver::<&'static str>::new();
        observer.start(&system);
        observer.record_read(&"label", state.id());

        let snapshot = system.take_mutable_snapshot(None, None);
        state.set(&snapshot, 1).unwrap();
        snapshot.apply().unwrap().check();
        assert!(observer.has_pending_changes());
        assert_eq!(observer.drain_changes(), vec!["label"]);

        observer.stop();
        let snapshot = system.take_mutable_snapshot(None, None);
        state.set(&snapshot, 2).unwrap();
        snapshot.apply().unwrap().check();
        assert!(!observer.has_pending_changes());
    }
}
