use super::*;
use crate::applier::move_range;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

type Node = Rc<TestNode>;

#[derive(Default)]
struct TestNode {
    label: RefCell<String>,
    children: RefCell<Vec<Node>>,
}

impl TestNode {
    fn new(label: &str) -> Node {
        Rc::new(Self {
            label: RefCell::new(label.to_string()),
            children: RefCell::default(),
        })
    }

    fn label(&self) -> String {
        self.label.borrow().clone()
    }

    fn set_label(&self, label: &str) {
        *self.label.borrow_mut() = label.to_string();
    }

    fn child_labels(&self) -> Vec<String> {
        self.children.borrow().iter().map(|child| child.label()).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Insert(usize, String),
    Remove(usize, usize),
    Move(usize, usize, usize),
    Update(String),
}

/// Attaches nodes top-down and logs every edit.
struct TestApplier {
    root: Node,
    stack: Vec<Node>,
    ops: Vec<Op>,
    cleared: bool,
}

impl TestApplier {
    fn new() -> Self {
        Self {
            root: TestNode::new("root"),
            stack: Vec::new(),
            ops: Vec::new(),
            cleared: false,
        }
    }

    fn current(&self) -> Node {
        self.stack.last().cloned().unwrap_or_else(|| Rc::clone(&self.root))
    }

    /// Labels of the root's children.
    fn top(&self) -> Vec<String> {
        self.root.child_labels()
    }

    /// Labels of the children of the root's first child.
    fn items(&self) -> Vec<String> {
        self.root.children.borrow()[0].child_labels()
    }

    fn take_ops(&mut self) -> Vec<Op> {
        std::mem::take(&mut self.ops)
    }
}

impl Applier for TestApplier {
    type Node = Node;

    fn down(&mut self, node: &Node) {
        self.stack.push(Rc::clone(node));
    }

    fn up(&mut self) {
        assert!(self.stack.pop().is_some(), "unbalanced up");
    }

    fn insert_top_down(&mut self, index: usize, node: &Node) {
        self.ops.push(Op::Insert(index, node.label()));
        self.current().children.borrow_mut().insert(index, Rc::clone(node));
    }

    fn insert_bottom_up(&mut self, _index: usize, _node: &Node) {}

    fn remove(&mut self, index: usize, count: usize) {
        self.ops.push(Op::Remove(index, count));
        self.current().children.borrow_mut().drain(index..index + count);
    }

    fn move_nodes(&mut self, from: usize, to: usize, count: usize) {
        self.ops.push(Op::Move(from, to, count));
        move_range(&mut self.current().children.borrow_mut(), from, to, count);
    }

    fn clear(&mut self) {
        self.root.children.borrow_mut().clear();
        self.stack.clear();
        self.cleared = true;
    }

    fn update(&mut self, node: &Node, change: NodeUpdate<Node>) {
        change(node);
        self.ops.push(Op::Update(node.label()));
    }
}

fn composition(system: &SnapshotSystem) -> Composition<TestApplier> {
    composition_with(system, ComposerConfig::default().with_verify_after_write(true))
}

fn composition_with(system: &SnapshotSystem, config: ComposerConfig) -> Composition<TestApplier> {
    Composition::with_config(TestApplier::new(), system.clone(), config)
}

fn write<T: Clone + PartialEq + Send + Sync + 'static>(
    system: &SnapshotSystem,
    state: &MutableState<T>,
    value: T,
) {
    let snapshot = system.take_mutable_snapshot(None, None);
    state.set(&snapshot, value).unwrap();
    snapshot.apply().unwrap().check();
}

fn text(c: &mut Composer<'_, Node>, label: &str) {
    let label = label.to_string();
    c.emit_node(
        || TestNode::new(&label),
        |u| u.set(label.clone(), |node, value| node.set_label(value)),
        |_| {},
    );
}

/// A `list` node with one keyed text node per item.
fn keyed_list(items: Rc<RefCell<Vec<&'static str>>>) -> impl Fn(&mut Composer<'_, Node>) + 'static {
    move |c| {
        let items = items.borrow().clone();
        c.emit_node(
            || TestNode::new("list"),
            |_| {},
            |c| {
                for item in &items {
                    c.key(item, |c| text(c, item));
                }
            },
        );
    }
}

fn assert_balanced(composition: &Composition<TestApplier>) {
    assert!(composition.applier().stack.is_empty(), "applier left inside a node");
}

#[test]
fn initial_pass_builds_the_tree() {
    let system = SnapshotSystem::new();
    let mut composition = composition(&system);
    let items = Rc::new(RefCell::new(vec!["a", "b", "c"]));
    composition.set_content(keyed_list(items)).unwrap();

    assert_eq!(composition.applier().top(), vec!["list"]);
    assert_eq!(composition.applier().items(), vec!["a", "b", "c"]);
    assert_balanced(&composition);
    assert!(!composition.slot_table().is_empty());
    assert_eq!(composition.scopes().len(), 1);
}

#[test]
fn identical_recompose_emits_no_edits() {
    let system = SnapshotSystem::new();
    let mut composition = composition(&system);
    let items = Rc::new(RefCell::new(vec!["a", "b", "c"]));
    composition.set_content(keyed_list(Rc::clone(&items))).unwrap();
    let groups = composition.slot_table().groups_as_keys();
    composition.applier_mut().take_ops();

    composition.set_content(keyed_list(items)).unwrap();

    assert_eq!(composition.applier_mut().take_ops(), Vec::<Op>::new());
    assert_eq!(composition.slot_table().groups_as_keys(), groups);
    assert_balanced(&composition);
}

#[test]
fn keyed_reorder_moves_nodes() {
    let system = SnapshotSystem::new();
    let mut composition = composition(&system);
    let items = Rc::new(RefCell::new(vec!["a", "b", "c"]));
    composition.set_content(keyed_list(Rc::clone(&items))).unwrap();
    let before: Vec<Node> = composition.applier().root.children.borrow()[0]
        .children
        .borrow()
        .clone();
    composition.applier_mut().take_ops();

    *items.borrow_mut() = vec!["c", "a", "b"];
    composition.set_content(keyed_list(items)).unwrap();

    assert_eq!(composition.applier_mut().take_ops(), vec![Op::Move(2, 0, 1)]);
    assert_eq!(composition.applier().items(), vec!["c", "a", "b"]);
    let after = composition.applier().root.children.borrow()[0]
        .children
        .borrow()
        .clone();
    assert!(Rc::ptr_eq(&after[0], &before[2]));
    assert!(Rc::ptr_eq(&after[1], &before[0]));
    assert_balanced(&composition);
}

#[test]
fn keys_beyond_the_search_window_are_replaced() {
    let system = SnapshotSystem::new();
    let config = ComposerConfig::default()
        .with_key_search_window(1)
        .with_verify_after_write(true);
    let mut composition = composition_with(&system, config);
    let items = Rc::new(RefCell::new(vec!["a", "b", "c", "d"]));
    composition.set_content(keyed_list(Rc::clone(&items))).unwrap();
    composition.applier_mut().take_ops();

    *items.borrow_mut() = vec!["d", "a", "b", "c"];
    composition.set_content(keyed_list(items)).unwrap();

    let ops = composition.applier_mut().take_ops();
    assert!(ops.contains(&Op::Insert(0, "d".into())));
    assert!(ops.contains(&Op::Remove(4, 1)));
    assert!(!ops.iter().any(|op| matches!(op, Op::Move(..))));
    assert_eq!(composition.applier().items(), vec!["d", "a", "b", "c"]);
    assert_balanced(&composition);
}

#[test]
fn removed_and_added_items() {
    let system = SnapshotSystem::new();
    let mut composition = composition(&system);
    let items = Rc::new(RefCell::new(vec!["a", "b", "c"]));
    composition.set_content(keyed_list(Rc::clone(&items))).unwrap();
    composition.applier_mut().take_ops();

    *items.borrow_mut() = vec!["a", "c", "e"];
    composition.set_content(keyed_list(items)).unwrap();

    assert_eq!(composition.applier().items(), vec!["a", "c", "e"]);
    assert_balanced(&composition);
}

#[test]
fn state_change_recomposes_the_reader() {
    let system = SnapshotSystem::new();
    let label = MutableState::new(&system.global(), String::from("hello"));
    let runs = Rc::new(Cell::new(0));
    let mut composition = composition(&system);
    {
        let label = label.clone();
        let runs = Rc::clone(&runs);
        composition
            .set_content(move |c| {
                runs.set(runs.get() + 1);
                let value = c.read(&label);
                text(c, &value);
            })
            .unwrap();
    }
    composition.applier_mut().take_ops();
    assert!(!composition.has_invalidations());

    write(&system, &label, String::from("world"));
    assert!(composition.has_invalidations());
    assert!(composition.recompose().unwrap());

    assert_eq!(runs.get(), 2);
    assert_eq!(composition.applier().top(), vec!["world"]);
    assert_eq!(
        composition.applier_mut().take_ops(),
        vec![Op::Update("world".into())]
    );
    assert!(!composition.has_invalidations());
    assert!(!composition.recompose().unwrap());
}

#[test]
fn unrelated_state_change_does_not_invalidate() {
    let system = SnapshotSystem::new();
    let read = MutableState::new(&system.global(), 0);
    let unread = MutableState::new(&system.global(), 0);
    let mut composition = composition(&system);
    {
        let read = read.clone();
        composition
            .set_content(move |c| {
                c.read(&read);
            })
            .unwrap();
    }
    write(&system, &unread, 1);
    assert!(!composition.has_invalidations());
    assert!(!composition.recompose().unwrap());
}

/// Root reads `outer`; a nested restart group reads `inner`.
struct Nested {
    outer: MutableState<i32>,
    inner: MutableState<i32>,
    outer_runs: Rc<Cell<usize>>,
    inner_runs: Rc<Cell<usize>>,
}

impl Nested {
    fn new(system: &SnapshotSystem) -> Self {
        Self {
            outer: MutableState::new(&system.global(), 0),
            inner: MutableState::new(&system.global(), 0),
            outer_runs: Rc::default(),
            inner_runs: Rc::default(),
        }
    }

    fn content(&self, skippable: bool) -> impl Fn(&mut Composer<'_, Node>) + 'static {
        let outer = self.outer.clone();
        let inner = self.inner.clone();
        let outer_runs = Rc::clone(&self.outer_runs);
        let inner_runs = Rc::clone(&self.inner_runs);
        move |c| {
            outer_runs.set(outer_runs.get() + 1);
            c.read(&outer);
            let inner = inner.clone();
            let inner_runs = Rc::clone(&inner_runs);
            c.restart_group(7, move |c| {
                if skippable && c.skipping() {
                    c.skip_to_group_end();
                    return;
                }
                inner_runs.set(inner_runs.get() + 1);
                let value = c.read(&inner);
                text(c, &value.to_string());
            });
        }
    }
}

#[test]
fn child_invalidation_leaves_parent_alone() {
    let system = SnapshotSystem::new();
    let nested = Nested::new(&system);
    let mut composition = composition(&system);
    composition.set_content(nested.content(false)).unwrap();
    assert_eq!(composition.scopes().len(), 2);

    write(&system, &nested.inner, 5);
    assert!(composition.recompose().unwrap());

    assert_eq!(nested.outer_runs.get(), 1);
    assert_eq!(nested.inner_runs.get(), 2);
    assert_eq!(composition.applier().top(), vec!["5"]);
    assert_balanced(&composition);
}

#[test]
fn parent_invalidation_supersedes_child() {
    let system = SnapshotSystem::new();
    let nested = Nested::new(&system);
    let mut composition = composition(&system);
    composition.set_content(nested.content(false)).unwrap();

    let snapshot = system.take_mutable_snapshot(None, None);
    nested.outer.set(&snapshot, 1).unwrap();
    nested.inner.set(&snapshot, 2).unwrap();
    snapshot.apply().unwrap().check();
    assert!(composition.recompose().unwrap());

    assert_eq!(nested.outer_runs.get(), 2);
    assert_eq!(nested.inner_runs.get(), 2);
    assert_eq!(composition.applier().top(), vec!["2"]);
    assert!(!composition.has_invalidations());
}

#[test]
fn skipped_child_keeps_its_subscriptions() {
    let system = SnapshotSystem::new();
    let nested = Nested::new(&system);
    let mut composition = composition(&system);
    composition.set_content(nested.content(true)).unwrap();
    composition.applier_mut().take_ops();

    write(&system, &nested.outer, 1);
    assert!(composition.recompose().unwrap());
    assert_eq!(nested.outer_runs.get(), 2);
    assert_eq!(nested.inner_runs.get(), 1);
    assert_eq!(composition.applier_mut().take_ops(), Vec::<Op>::new());

    write(&system, &nested.inner, 3);
    assert!(composition.recompose().unwrap());
    assert_eq!(nested.outer_runs.get(), 2);
    assert_eq!(nested.inner_runs.get(), 2);
    assert_eq!(composition.applier().top(), vec!["3"]);
}

struct Probe {
    name: &'static str,
    log: Rc<RefCell<Vec<String>>>,
}

impl Probe {
    fn new(name: &'static str, log: &Rc<RefCell<Vec<String>>>) -> Self {
        Self {
            name,
            log: Rc::clone(log),
        }
    }

    fn push(&self, event: &str) {
        self.log.borrow_mut().push(format!("{event} {}", self.name));
    }
}

impl RememberObserver for Probe {
    fn on_remembered(&self) {
        self.push("remembered");
    }

    fn on_forgotten(&self) {
        self.push("forgotten");
    }

    fn on_abandoned(&self) {
        self.push("abandoned");
    }
}

fn probes(
    show: &MutableState<bool>,
    log: &Rc<RefCell<Vec<String>>>,
) -> impl Fn(&mut Composer<'_, Node>) + 'static {
    let show = show.clone();
    let log = Rc::clone(log);
    move |c| {
        if c.read(&show) {
            c.group(1, |c| {
                c.remember_observer(|| Probe::new("first", &log));
                c.remember_observer(|| Probe::new("second", &log));
            });
        }
    }
}

#[test]
fn remembered_values_follow_their_groups() {
    let system = SnapshotSystem::new();
    let show = MutableState::new(&system.global(), true);
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut composition = composition(&system);
    composition.set_content(probes(&show, &log)).unwrap();
    assert_eq!(
        log.borrow_mut().drain(..).collect::<Vec<_>>(),
        vec!["remembered first", "remembered second"]
    );

    write(&system, &show, false);
    composition.recompose().unwrap();
    assert_eq!(
        log.borrow_mut().drain(..).collect::<Vec<_>>(),
        vec!["forgotten second", "forgotten first"]
    );

    write(&system, &show, true);
    composition.recompose().unwrap();
    assert_eq!(
        log.borrow_mut().drain(..).collect::<Vec<_>>(),
        vec!["remembered first", "remembered second"]
    );
}

#[test]
fn remember_returns_the_same_value_across_passes() {
    let system = SnapshotSystem::new();
    let tick = MutableState::new(&system.global(), 0);
    let seen: Rc<RefCell<Vec<Owned<usize>>>> = Rc::default();
    let inits = Rc::new(Cell::new(0));
    let mut composition = composition(&system);
    {
        let tick = tick.clone();
        let seen = Rc::clone(&seen);
        let inits = Rc::clone(&inits);
        composition
            .set_content(move |c| {
                let tick = c.read(&tick);
                let value = c.remember(|| {
                    inits.set(inits.get() + 1);
                    0usize
                });
                value.update(|value| *value += 1);
                let keyed = c.remember_with_key(tick / 2, || tick);
                assert_eq!(keyed.get(), tick - tick % 2);
                seen.borrow_mut().push(value);
            })
            .unwrap();
    }
    write(&system, &tick, 1);
    composition.recompose().unwrap();
    write(&system, &tick, 2);
    composition.recompose().unwrap();

    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert!(seen[0].ptr_eq(&seen[2]));
    assert_eq!(seen[2].get(), 3);
    assert_eq!(inits.get(), 1);
}

#[test]
fn changed_reports_new_values_only() {
    let system = SnapshotSystem::new();
    let value = MutableState::new(&system.global(), 1);
    let tick = MutableState::new(&system.global(), 0);
    let results = Rc::new(RefCell::new(Vec::new()));
    let mut composition = composition(&system);
    {
        let value = value.clone();
        let tick = tick.clone();
        let results = Rc::clone(&results);
        composition
            .set_content(move |c| {
                c.read(&tick);
                let value = c.read(&value);
                let changed = c.changed(&value);
                results.borrow_mut().push(changed);
            })
            .unwrap();
    }
    write(&system, &tick, 1);
    composition.recompose().unwrap();
    write(&system, &value, 2);
    composition.recompose().unwrap();

    assert_eq!(*results.borrow(), vec![true, false, true]);
}

#[test]
fn panicking_content_leaves_the_composition_untouched() {
    let system = SnapshotSystem::new();
    let boom = MutableState::new(&system.global(), false);
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut composition = composition(&system);
    {
        let boom = boom.clone();
        let log = Rc::clone(&log);
        composition
            .set_content(move |c| {
                text(c, "stable");
                if c.read(&boom) {
                    c.remember_observer(|| Probe::new("fresh", &log));
                    text(c, "doomed");
                    panic!("content failed");
                }
            })
            .unwrap();
    }
    let groups = composition.slot_table().groups_as_keys();
    composition.applier_mut().take_ops();

    write(&system, &boom, true);
    let result = panic::catch_unwind(AssertUnwindSafe(|| composition.recompose()));
    assert!(result.is_err());

    assert_eq!(composition.slot_table().groups_as_keys(), groups);
    assert_eq!(composition.applier_mut().take_ops(), Vec::<Op>::new());
    assert_eq!(composition.applier().top(), vec!["stable"]);
    assert_eq!(*log.borrow(), vec!["abandoned fresh"]);
    assert!(composition.has_invalidations());

    write(&system, &boom, false);
    assert!(composition.recompose().unwrap());
    assert_eq!(composition.applier().top(), vec!["stable"]);
    assert_eq!(composition.slot_table().groups_as_keys(), groups);
}

#[test]
fn persistent_conflicts_are_reported() {
    let system = SnapshotSystem::new();
    let shared = MutableState::new(&system.global(), 0);
    let attempts = Rc::new(Cell::new(0));
    let config = ComposerConfig::default().with_max_apply_retries(2);
    let mut composition = composition_with(&system, config);
    let result = {
        let system = system.clone();
        let attempts = Rc::clone(&attempts);
        composition.set_content(move |c| {
            attempts.set(attempts.get() + 1);
            let attempt = attempts.get() as i32;
            shared.set(c.snapshot(), attempt).unwrap();
            let other = system.take_mutable_snapshot(None, None);
            shared.set(&other, -attempt).unwrap();
            other.apply().unwrap().check();
        })
    };

    assert_eq!(result, Err(ComposeError::ApplyConflict { attempts: 2 }));
    assert_eq!(attempts.get(), 2);
    assert!(composition.slot_table().is_empty());
    assert!(composition.scopes().is_empty());
}

#[test]
fn removing_a_group_releases_its_scopes() {
    let system = SnapshotSystem::new();
    let show = MutableState::new(&system.global(), true);
    let child: Rc<RefCell<Option<RecomposeScope>>> = Rc::default();
    let mut composition = composition(&system);
    {
        let show = show.clone();
        let child = Rc::clone(&child);
        composition
            .set_content(move |c| {
                if c.read(&show) {
                    let child = Rc::clone(&child);
                    c.restart_group(3, move |c| {
                        *child.borrow_mut() = c.current_scope();
                        text(c, "child");
                    });
                }
            })
            .unwrap();
    }
    assert_eq!(composition.scopes().len(), 2);
    let scope = child.borrow().clone().unwrap();
    assert!(!scope.is_released());

    write(&system, &show, false);
    composition.recompose().unwrap();

    assert!(scope.is_released());
    scope.invalidate();
    assert!(!scope.is_invalid());
    assert_eq!(composition.scopes().len(), 1);
    assert!(composition.applier().top().is_empty());
    assert!(!composition.has_invalidations());
}

#[test]
fn updater_applies_only_changes() {
    let system = SnapshotSystem::new();
    let label = MutableState::new(&system.global(), String::from("one"));
    let tick = MutableState::new(&system.global(), 0);
    let inits = Rc::new(Cell::new(0));
    let mut composition = composition(&system);
    {
        let label = label.clone();
        let tick = tick.clone();
        let inits = Rc::clone(&inits);
        composition
            .set_content(move |c| {
                c.read(&tick);
                let label = c.read(&label);
                let inits = Rc::clone(&inits);
                c.emit_node(
                    || TestNode::new(""),
                    |u| {
                        u.set(label.clone(), |node, value| node.set_label(value));
                        u.update(label.len(), |node, len| {
                            node.set_label(&format!("{}:{len}", node.label()))
                        });
                        u.init(move |_| inits.set(inits.get() + 1));
                    },
                    |_| {},
                );
            })
            .unwrap();
    }
    let ops = composition.applier_mut().take_ops();
    assert_eq!(ops[0], Op::Insert(0, String::new()));
    assert_eq!(ops.len(), 3);
    assert_eq!(inits.get(), 1);
    assert_eq!(composition.applier().top(), vec!["one"]);

    write(&system, &tick, 1);
    composition.recompose().unwrap();
    assert_eq!(composition.applier_mut().take_ops(), Vec::<Op>::new());

    write(&system, &label, String::from("three"));
    composition.recompose().unwrap();
    assert_eq!(
        composition.applier_mut().take_ops(),
        vec![Op::Update("three".into()), Op::Update("three:5".into())]
    );
    assert_eq!(inits.get(), 1);
}

#[test]
fn nested_nodes_keep_applier_balanced() {
    let system = SnapshotSystem::new();
    let count = MutableState::new(&system.global(), 1usize);
    let mut composition = composition(&system);
    {
        let count = count.clone();
        composition
            .set_content(move |c| {
                c.emit_node(
                    || TestNode::new("outer"),
                    |_| {},
                    |c| {
                        let count = count.clone();
                        c.restart_group(9, move |c| {
                            for index in 0..c.read(&count) {
                                c.key(&index, |c| text(c, &index.to_string()));
                            }
                        });
                    },
                );
                text(c, "after");
            })
            .unwrap();
    }
    assert_eq!(composition.applier().top(), vec!["outer", "after"]);

    write(&system, &count, 3);
    composition.recompose().unwrap();
    assert_eq!(composition.applier().items(), vec!["0", "1", "2"]);
    assert_eq!(composition.applier().top(), vec!["outer", "after"]);
    assert_balanced(&composition);

    write(&system, &count, 0);
    composition.recompose().unwrap();
    assert!(composition.applier().items().is_empty());
    assert_balanced(&composition);
}

#[test]
fn compound_keys_are_stable_across_passes() {
    let system = SnapshotSystem::new();
    let tick = MutableState::new(&system.global(), 0);
    let keys = Rc::new(RefCell::new(Vec::new()));
    let mut composition = composition(&system);
    {
        let tick = tick.clone();
        let keys = Rc::clone(&keys);
        composition
            .set_content(move |c| {
                c.read(&tick);
                let keys = Rc::clone(&keys);
                c.group(5, move |c| keys.borrow_mut().push(c.compound_key_hash()));
            })
            .unwrap();
    }
    write(&system, &tick, 1);
    composition.recompose().unwrap();

    let keys = keys.borrow();
    assert_eq!(keys.len(), 2);
    assert_eq!(keys[0], keys[1]);
}

#[test]
fn dispose_forgets_everything() {
    let system = SnapshotSystem::new();
    let show = MutableState::new(&system.global(), true);
    let log = Rc::new(RefCell::new(Vec::new()));
    let mut composition = composition(&system);
    composition.set_content(probes(&show, &log)).unwrap();
    log.borrow_mut().clear();

    composition.dispose();

    assert!(composition.is_disposed());
    assert!(composition.applier().cleared);
    assert!(composition.slot_table().is_empty());
    assert!(composition.scopes().is_empty());
    assert_eq!(*log.borrow(), vec!["forgotten second", "forgotten first"]);

    write(&system, &show, false);
    assert!(!composition.has_invalidations());
    assert!(!composition.recompose().unwrap());
}
