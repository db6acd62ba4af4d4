use super::*;
use std::sync::{Arc, Mutex};
use std::thread;

fn apply(snapshot: &Snapshot) -> SnapshotApplyResult {
    snapshot.apply().expect("apply should not error")
}

#[test]
fn readonly_snapshot_keeps_its_view_after_apply() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 1);
    let frozen = system.take_snapshot(None);

    let writer = system.take_mutable_snapshot(None, None);
    state.set(&writer, 2).unwrap();
    assert_eq!(state.get(&writer), 2);
    assert_eq!(state.get(&frozen), 1);
    apply(&writer).check();

    assert_eq!(state.get(&frozen), 1);
    assert_eq!(state.get(&system.global()), 2);
    assert_eq!(state.get(&system.take_snapshot(None)), 2);
}

#[test]
fn readonly_snapshot_is_isolated_across_threads() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), String::from("before"));
    let frozen = system.take_snapshot(None);

    thread::scope(|scope| {
        scope
            .spawn(|| {
                let writer = system.take_mutable_snapshot(None, None);
                state.set(&writer, String::from("after")).unwrap();
                apply(&writer).check();
            })
            .join()
            .unwrap();
        let seen = scope.spawn(|| state.get(&frozen)).join().unwrap();
        assert_eq!(seen, "before");
    });
    assert_eq!(state.get(&system.global()), "after");
}

#[test]
fn snapshots_on_different_threads_apply_disjoint_writes() {
    let system = SnapshotSystem::new();
    let global = system.global();
    let states: Vec<_> = (0..4).map(|i| MutableState::new(&global, i)).collect();

    thread::scope(|scope| {
        for state in &states {
            let system = &system;
            scope.spawn(move || {
                let snapshot = system.take_mutable_snapshot(None, None);
                let value = state.get(&snapshot);
                state.set(&snapshot, value + 100).unwrap();
                apply(&snapshot).check();
            });
        }
    });

    let values: Vec<i32> = states.iter().map(|state| state.get(&system.global())).collect();
    assert_eq!(values, vec![100, 101, 102, 103]);
}

#[test]
fn conflicting_writes_fail_the_later_apply() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    let first = system.take_mutable_snapshot(None, None);
    let second = system.take_mutable_snapshot(None, None);
    state.set(&first, 1).unwrap();
    state.set(&second, 2).unwrap();

    assert!(apply(&first).is_success());
    assert!(apply(&second).is_failure());
    assert_eq!(state.get(&system.global()), 1);
}

#[test]
fn writes_to_different_states_do_not_conflict() {
    let system = SnapshotSystem::new();
    let global = system.global();
    let a = MutableState::new(&global, 0);
    let b = MutableState::new(&global, 0);
    let first = system.take_mutable_snapshot(None, None);
    let second = system.take_mutable_snapshot(None, None);
    a.set(&first, 1).unwrap();
    b.set(&second, 2).unwrap();

    apply(&first).check();
    apply(&second).check();
    assert_eq!((a.get(&global), b.get(&global)), (1, 2));
}

#[test]
fn equal_concurrent_writes_are_not_conflicts() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    let first = system.take_mutable_snapshot(None, None);
    let second = system.take_mutable_snapshot(None, None);
    state.set(&first, 5).unwrap();
    state.set(&second, 5).unwrap();

    apply(&first).check();
    apply(&second).check();
    assert_eq!(state.get(&system.global()), 5);
}

struct Counter;

impl MutationPolicy<i64> for Counter {
    fn equivalent(&self, a: &i64, b: &i64) -> bool {
        a == b
    }

    fn merge(&self, previous: &i64, current: &i64, applied: &i64) -> Option<i64> {
        Some(current + (applied - previous))
    }
}

#[test]
fn merge_policy_combines_concurrent_increments() {
    let system = SnapshotSystem::new();
    let counter = MutableState::with_policy(&system.global(), 0i64, Arc::new(Counter));
    let first = system.take_mutable_snapshot(None, None);
    let second = system.take_mutable_snapshot(None, None);
    counter.update(&first, |value| *value += 1).unwrap();
    counter.update(&second, |value| *value += 2).unwrap();

    apply(&first).check();
    apply(&second).check();
    assert_eq!(counter.get(&system.global()), 3);
}

#[test]
fn never_equal_policy_conflicts_on_identical_values() {
    let system = SnapshotSystem::new();
    let state = MutableState::with_policy(&system.global(), 0, never_equal());
    let first = system.take_mutable_snapshot(None, None);
    let second = system.take_mutable_snapshot(None, None);
    state.set(&first, 7).unwrap();
    state.set(&second, 7).unwrap();

    apply(&first).check();
    assert!(apply(&second).is_failure());
}

#[test]
fn nested_mutable_apply_is_visible_to_parent_only() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    let parent = system.take_mutable_snapshot(None, None);
    let child = parent.take_nested_mutable_snapshot(None, None).unwrap();
    state.set(&child, 10).unwrap();
    assert_eq!(state.get(&parent), 0);

    apply(&child).check();
    assert_eq!(state.get(&parent), 10);
    assert_eq!(state.get(&system.global()), 0);

    apply(&parent).check();
    assert_eq!(state.get(&system.global()), 10);
}

#[test]
fn nested_readonly_freezes_parent_view() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    let parent = system.take_mutable_snapshot(None, None);
    state.set(&parent, 1).unwrap();
    let frozen = parent.take_nested_snapshot(None).unwrap();
    state.set(&parent, 2).unwrap();

    assert_eq!(state.get(&frozen), 1);
    assert_eq!(state.get(&parent), 2);
    assert_eq!(state.set(&frozen, 3), Err(SnapshotError::ReadOnlyWrite));
}

#[test]
fn applying_a_child_of_an_applied_parent_fails() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    let parent = system.take_mutable_snapshot(None, None);
    let child = parent.take_nested_mutable_snapshot(None, None).unwrap();
    state.set(&child, 4).unwrap();
    apply(&parent).check();

    assert!(apply(&child).is_failure());
    assert_eq!(state.get(&system.global()), 0);
}

#[test]
fn disposing_an_unapplied_snapshot_discards_its_records() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    let snapshot = system.take_mutable_snapshot(None, None);
    state.set(&snapshot, 9).unwrap();
    assert_eq!(state.record_count(), 2);

    snapshot.dispose();
    assert!(snapshot.is_disposed());
    assert_eq!(state.record_count(), 1);
    assert_eq!(state.get(&system.global()), 0);
    assert_eq!(snapshot.apply(), Err(SnapshotError::Disposed));
}

#[test]
fn dropping_the_last_handle_abandons_the_snapshot() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    {
        let snapshot = system.take_mutable_snapshot(None, None);
        state.set(&snapshot, 9).unwrap();
    }
    assert_eq!(state.record_count(), 1);
    assert!(system.lowest_pinned().is_some());
}

#[test]
fn open_readers_keep_old_records_until_released() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    let reader = system.take_snapshot(None);

    let writer = system.take_mutable_snapshot(None, None);
    state.set(&writer, 10).unwrap();
    apply(&writer).check();
    assert_eq!(state.record_count(), 2);
    assert_eq!(state.get(&reader), 0);

    reader.dispose();
    system.advance_global();
    assert_eq!(state.record_count(), 1);
    assert_eq!(state.get(&system.global()), 10);
}

#[test]
fn repeated_applies_do_not_accumulate_records() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    for value in 1..=20 {
        let snapshot = system.take_mutable_snapshot(None, None);
        state.set(&snapshot, value).unwrap();
        apply(&snapshot).check();
    }
    assert_eq!(state.record_count(), 1);
    assert_eq!(state.get(&system.global()), 20);
}

#[test]
fn apply_observer_sees_modified_states_until_handle_drops() {
    let system = SnapshotSystem::new();
    let global = system.global();
    let written = MutableState::new(&global, 0);
    let untouched = MutableState::new(&global, 0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handle = {
        let seen = Arc::clone(&seen);
        system.register_apply_observer(Arc::new(move |changed, _| {
            seen.lock().unwrap().extend_from_slice(changed);
        }))
    };

    let snapshot = system.take_mutable_snapshot(None, None);
    written.set(&snapshot, 1).unwrap();
    apply(&snapshot).check();
    assert_eq!(*seen.lock().unwrap(), vec![written.id()]);
    assert!(!seen.lock().unwrap().contains(&untouched.id()));

    drop(handle);
    let snapshot = system.take_mutable_snapshot(None, None);
    written.set(&snapshot, 2).unwrap();
    apply(&snapshot).check();
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn global_writes_notify_on_advance() {
    let system = SnapshotSystem::new();
    let global = system.global();
    let state = MutableState::new(&global, 0);
    let applied = Arc::new(Mutex::new(Vec::new()));
    let written = Arc::new(Mutex::new(Vec::new()));
    let _apply = {
        let applied = Arc::clone(&applied);
        system.register_apply_observer(Arc::new(move |changed, _| {
            applied.lock().unwrap().extend_from_slice(changed);
        }))
    };
    let _write = {
        let written = Arc::clone(&written);
        system.register_global_write_observer(Arc::new(move |id| {
            written.lock().unwrap().push(id);
        }))
    };

    system.send_apply_notifications();
    assert!(applied.lock().unwrap().is_empty());

    state.set(&global, 3).unwrap();
    assert_eq!(*written.lock().unwrap(), vec![state.id()]);
    assert!(global.has_pending_changes());

    system.send_apply_notifications();
    assert_eq!(*applied.lock().unwrap(), vec![state.id()]);
    assert!(!global.has_pending_changes());
    assert_eq!(state.get(&system.take_snapshot(None)), 3);
}

#[test]
fn misuse_is_reported_as_errors() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    assert_eq!(system.global().apply(), Err(SnapshotError::GlobalApply));

    let readonly = system.take_snapshot(None);
    assert_eq!(state.set(&readonly, 1), Err(SnapshotError::ReadOnlyWrite));
    assert_eq!(readonly.apply(), Err(SnapshotError::NotMutable));
    assert_eq!(
        readonly.take_nested_mutable_snapshot(None, None).err(),
        Some(SnapshotError::NotMutable)
    );

    let snapshot = system.take_mutable_snapshot(None, None);
    apply(&snapshot).check();
    assert_eq!(snapshot.apply(), Err(SnapshotError::AlreadyApplied));
}

#[test]
fn read_observer_reports_reads() {
    let system = SnapshotSystem::new();
    let state = MutableState::new(&system.global(), 0);
    let reads = Arc::new(Mutex::new(Vec::new()));
    let snapshot = {
        let reads = Arc::clone(&reads);
        system.take_snapshot(Some(Arc::new(move |id| reads.lock().unwrap().push(id))))
    };
    state.get(&snapshot);
    assert_eq!(*reads.lock().unwrap(), vec![state.id()]);
}
