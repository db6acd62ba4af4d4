//! The reconciliation driver.
//!
//! A pass runs the composable content against the committed slot table
//! without touching it. Groups that match are entered through a reader; new
//! groups are built in a separate insert table. Every structural decision is
//! recorded as a [`SlotChange`] and, for node groups, a [`NodeChange`]. Only
//! when the whole pass finished and its snapshot applied are the changes
//! replayed onto the committed table and the applier. A pass that panics or
//! conflicts leaves both untouched.

use std::any::Any;
use std::collections::BTreeMap;
use std::hash::Hash;
use std::panic::Location;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::applier::NodeUpdate;
use crate::config::ComposerConfig;
use crate::hash::{enter_compound_key, exit_compound_key, hash_key};
use crate::owned::Owned;
use crate::remember::{RememberEvents, RememberObserver, RememberedValue};
use crate::scope::{RecomposeScope, ScopeRegistry};
use crate::slot_table::{Anchor, KeyInfo, SlotReader, SlotTable, SlotWriter};
use crate::snapshot::Snapshot;
use crate::state::{MutableState, StateId};
use crate::{location_key, Key};

/// Content of a restart group, run again when its scope is invalidated.
pub type RestartFn<N> = Rc<dyn Fn(&mut Composer<'_, N>)>;

/// Key of the group wrapping the root content.
pub(crate) const ROOT_KEY: Key = 100;

/// Edit of the committed table, replayed in order with a writer.
pub(crate) enum SlotChange {
    /// Step over the group at the cursor.
    Skip,
    /// Enter the group at the cursor.
    Enter,
    /// Leave the current group; the cursor is at its end.
    Exit,
    /// Bring the sibling `offset` groups ahead to the cursor.
    Move(usize),
    /// Move a group built in the insert table to the cursor.
    Insert(Anchor),
    /// Drop the group at the cursor.
    Remove,
    SetSlot { index: usize, value: Box<dyn Any> },
    AppendSlot(Box<dyn Any>),
    SkipToEnd,
    /// Mark the current group as holding lifecycle values.
    Mark,
}

pub(crate) enum NodeChange<N> {
    Down(N),
    Up,
    InsertTopDown { index: usize, node: N },
    InsertBottomUp { index: usize, node: N },
    Remove { index: usize, count: usize },
    Move { from: usize, to: usize, count: usize },
    Update { node: N, change: NodeUpdate<N> },
}

/// What a committed restart group leaves behind.
pub(crate) struct ScopeUpdate<N: 'static> {
    pub(crate) scope: RecomposeScope,
    pub(crate) restart: RestartFn<N>,
    pub(crate) reads: SmallVec<[StateId; 4]>,
    pub(crate) key: Key,
    /// The content skipped to its end; the previous reads still hold.
    pub(crate) skipped: bool,
}

/// Everything one pass decided.
pub(crate) struct ChangeSet<N: 'static> {
    pub(crate) slots: Vec<SlotChange>,
    pub(crate) nodes: Vec<NodeChange<N>>,
    pub(crate) recomposed: Vec<ScopeUpdate<N>>,
    pub(crate) created: Vec<RecomposeScope>,
    pub(crate) released: Vec<RecomposeScope>,
}

impl<N> ChangeSet<N> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            nodes: Vec::new(),
            recomposed: Vec::new(),
            created: Vec::new(),
            released: Vec::new(),
        }
    }
}

/// Old children not yet matched, in the order the writer will see them.
struct Pending {
    keys: Vec<KeyInfo>,
}

impl Pending {
    fn find(&self, key: Key, object_key: Option<Key>, window: usize) -> Option<usize> {
        self.keys
            .iter()
            .take(window + 1)
            .position(|info| info.key == key && info.object_key == object_key)
    }
}

struct Frame {
    /// Value folded into the compound key.
    key: Key,
    /// Reader location for existing groups.
    location: Option<usize>,
    is_node: bool,
    pending: Option<Pending>,
}

struct RestartFrame<N: 'static> {
    scope: RecomposeScope,
    restart: RestartFn<N>,
    reads: SmallVec<[StateId; 4]>,
    key: Key,
    forced: bool,
    skipped: bool,
    /// `frames.len()` inside the restart group.
    depth: usize,
}

struct PathNode<N> {
    node: N,
    /// A `Down` was emitted for it.
    realized: bool,
}

/// Result of reading one slot of the group just started.
struct SlotRead<'a> {
    index: usize,
    value: Option<&'a dyn Any>,
    exists: bool,
}

/// Drives one pass over a composition.
pub struct Composer<'a, N: 'static> {
    reader: SlotReader<'a>,
    insert: SlotWriter<'a>,
    snapshot: &'a Snapshot,
    registry: &'a mut ScopeRegistry,
    events: &'a mut RememberEvents,
    key_search_window: usize,
    invalid: BTreeMap<usize, RecomposeScope>,
    frames: SmallVec<[Frame; 16]>,
    insert_depth: usize,
    insert_root: usize,
    compound_key: Key,
    node_index: usize,
    node_index_stack: SmallVec<[usize; 16]>,
    node_path: Vec<PathNode<N>>,
    pending_ups: usize,
    restarts: Vec<RestartFrame<N>>,
    changes: ChangeSet<N>,
}

impl<'a, N: Clone + 'static> Composer<'a, N> {
    pub(crate) fn new(
        table: &'a SlotTable,
        insert_table: &'a mut SlotTable,
        snapshot: &'a Snapshot,
        registry: &'a mut ScopeRegistry,
        events: &'a mut RememberEvents,
        config: &ComposerConfig,
        invalid: BTreeMap<usize, RecomposeScope>,
    ) -> Self {
        let mut frames = SmallVec::new();
        frames.push(Frame {
            key: 0,
            location: None,
            is_node: false,
            pending: None,
        });
        Self {
            reader: table.read(),
            insert: insert_table.write(),
            snapshot,
            registry,
            events,
            key_search_window: config.key_search_window,
            invalid,
            frames,
            insert_depth: 0,
            insert_root: 0,
            compound_key: 0,
            node_index: 0,
            node_index_stack: SmallVec::new(),
            node_path: Vec::new(),
            pending_ups: 0,
            restarts: Vec::new(),
            changes: ChangeSet::new(),
        }
    }

    /// Composes `content` into an empty table.
    pub(crate) fn compose_root(&mut self, content: RestartFn<N>) {
        self.restart_group_with(ROOT_KEY, content);
    }

    /// Recomposes every invalid scope, parents before their children.
    pub(crate) fn recompose_invalid(&mut self) {
        self.recompose_to_group_end();
    }

    pub(crate) fn finish(mut self) -> ChangeSet<N> {
        assert!(
            self.frames.len() == 1 && self.insert_depth == 0,
            "internal error: pass finished with {} open groups",
            self.frames.len() - 1
        );
        for _ in 0..self.pending_ups {
            self.changes.nodes.push(NodeChange::Up);
        }
        self.insert.close();
        self.changes
    }

    // ---------------------------------------------------------------------
    // Content API
    // ---------------------------------------------------------------------

    /// The snapshot this pass reads and writes through.
    pub fn snapshot(&self) -> &Snapshot {
        self.snapshot
    }

    /// Reads `state` and subscribes the enclosing restart scope to it.
    pub fn read<T: Clone + Send + Sync + 'static>(&mut self, state: &MutableState<T>) -> T {
        if let Some(frame) = self.restarts.last_mut() {
            let id = state.id();
            if !frame.reads.contains(&id) {
                frame.reads.push(id);
            }
        }
        state.get(self.snapshot)
    }

    /// Whether the current restart group may skip its content: nothing is
    /// being inserted and its scope was not invalidated.
    pub fn skipping(&self) -> bool {
        self.insert_depth == 0 && self.restarts.last().is_some_and(|frame| !frame.forced)
    }

    pub fn inserting(&self) -> bool {
        self.insert_depth > 0
    }

    pub fn current_scope(&self) -> Option<RecomposeScope> {
        self.restarts.last().map(|frame| frame.scope.clone())
    }

    /// Key identifying the current position from the root; stable across
    /// passes for the same call path.
    pub fn compound_key_hash(&self) -> Key {
        self.compound_key
    }

    /// A group that is replaced rather than moved when its key changes.
    pub fn group<R>(&mut self, key: Key, content: impl FnOnce(&mut Self) -> R) -> R {
        self.start_data_group(key, None);
        let result = content(self);
        self.end_group_impl();
        result
    }

    /// A movable group identified by `value` among its siblings. Reordering
    /// keyed siblings moves their groups and nodes instead of rebuilding them.
    #[track_caller]
    pub fn key<K: Hash + ?Sized, R>(&mut self, value: &K, content: impl FnOnce(&mut Self) -> R) -> R {
        let key = location_key(Location::caller());
        self.start_data_group(key, Some(hash_key(value)));
        let result = content(self);
        self.end_group_impl();
        result
    }

    /// A group whose content can be composed again without its parent.
    pub fn restart_group(&mut self, key: Key, content: impl Fn(&mut Composer<'_, N>) + 'static) {
        self.restart_group_with(key, Rc::new(content));
    }

    fn restart_group_with(&mut self, key: Key, restart: RestartFn<N>) {
        let inserted = self.start_data_group(key, None);
        let location = self.current_location();
        let scope = self.restart_scope(inserted, location);
        if let Some(location) = location {
            self.invalid.remove(&location);
        }
        let forced = inserted || scope.is_invalid();
        self.run_restart(scope, restart, forced);
        self.end_group_impl();
    }

    /// Skips the rest of the current group, keeping what the last pass
    /// composed there. Invalid scopes inside are still recomposed.
    pub fn skip_to_group_end(&mut self) {
        assert!(
            self.insert_depth == 0,
            "internal error: cannot skip a group that is being inserted"
        );
        let depth = self.frames.len();
        if let Some(frame) = self.restarts.last_mut() {
            if frame.depth == depth {
                frame.skipped = true;
            }
        }
        let pending = self.frames.last_mut().and_then(|frame| frame.pending.take());
        match pending {
            Some(pending) => {
                self.node_index += pending.keys.iter().map(|info| info.nodes).sum::<usize>();
                self.reader.skip_to_group_end();
                self.changes.slots.push(SlotChange::SkipToEnd);
            }
            None => self.recompose_to_group_end(),
        }
    }

    /// Value created by `init` on the first pass, the same value afterwards.
    #[track_caller]
    pub fn remember<T: 'static>(&mut self, init: impl FnOnce() -> T) -> Owned<T> {
        let key = location_key(Location::caller());
        self.start_data_group(key, None);
        let read = self.read_slot();
        let stored = read
            .value
            .and_then(|value| value.downcast_ref::<RememberedValue>())
            .and_then(RememberedValue::get::<T>);
        let owned = match stored {
            Some(owned) => owned,
            None => {
                if let Some(old) = read.value {
                    self.forget_slot(old);
                }
                let owned = Owned::new(init());
                self.write_slot(&read, Box::new(RememberedValue::plain(owned.clone())));
                owned
            }
        };
        self.end_group_impl();
        owned
    }

    /// [`remember`](Self::remember) for values that observe their lifecycle.
    #[track_caller]
    pub fn remember_observer<T: RememberObserver + 'static>(
        &mut self,
        init: impl FnOnce() -> T,
    ) -> Owned<T> {
        let key = location_key(Location::caller());
        self.start_data_group(key, None);
        let read = self.read_slot();
        let stored = read
            .value
            .and_then(|value| value.downcast_ref::<RememberedValue>())
            .and_then(RememberedValue::get::<T>);
        let owned = match stored {
            Some(owned) => owned,
            None => self.store_observed(&read, init),
        };
        self.end_group_impl();
        owned
    }

    /// Like [`remember`](Self::remember), but `init` runs again whenever
    /// `key` differs from the previous pass. The replaced value is forgotten.
    #[track_caller]
    pub fn remember_with_key<K, T>(&mut self, key: K, init: impl FnOnce() -> T) -> Owned<T>
    where
        K: PartialEq + 'static,
        T: 'static,
    {
        let group_key = location_key(Location::caller());
        self.start_data_group(group_key, None);
        let key_read = self.read_slot();
        let same_key = key_read
            .value
            .and_then(|value| value.downcast_ref::<K>())
            .is_some_and(|previous| *previous == key);
        let value_read = self.read_slot();
        let stored = value_read
            .value
            .and_then(|value| value.downcast_ref::<RememberedValue>())
            .and_then(RememberedValue::get::<T>);
        let owned = match stored {
            Some(owned) if same_key => owned,
            _ => {
                if !same_key {
                    self.write_slot(&key_read, Box::new(key));
                }
                if let Some(old) = value_read.value {
                    self.forget_slot(old);
                }
                let owned = Owned::new(init());
                self.write_slot(&value_read, Box::new(RememberedValue::plain(owned.clone())));
                owned
            }
        };
        self.end_group_impl();
        owned
    }

    /// Stores `value` and reports whether it differs from the previous pass.
    /// Always true the first time.
    #[track_caller]
    pub fn changed<V: PartialEq + Clone + 'static>(&mut self, value: &V) -> bool {
        let key = location_key(Location::caller());
        self.start_data_group(key, None);
        let changed = self.compare_and_store(value);
        self.end_group_impl();
        changed
    }

    /// Emits a node. `factory` runs only when the node is new; `update`
    /// records property changes; `content` composes the node's children.
    #[track_caller]
    pub fn emit_node<F, U, C>(&mut self, factory: F, update: U, content: C)
    where
        F: FnOnce() -> N,
        U: FnOnce(&mut Updater<'_, 'a, N>),
        C: FnOnce(&mut Self),
    {
        let key = location_key(Location::caller());
        let (node, inserted) = self.start_node_group(key, factory);
        update(&mut Updater {
            composer: self,
            node,
            inserted,
        });
        content(self);
        self.end_group_impl();
    }

    // ---------------------------------------------------------------------
    // Group matching
    // ---------------------------------------------------------------------

    fn current_location(&self) -> Option<usize> {
        self.frames.last().and_then(|frame| frame.location)
    }

    /// Starts a data group, returning whether it is new.
    fn start_data_group(&mut self, key: Key, object_key: Option<Key>) -> bool {
        match self.find_or_begin_insert(key, object_key) {
            Some(location) => {
                self.enter_existing(location);
                false
            }
            None => {
                self.insert.start_data(key, object_key, None);
                self.push_frame(object_key.unwrap_or(key), None, false);
                true
            }
        }
    }

    fn start_node_group(&mut self, key: Key, factory: impl FnOnce() -> N) -> (N, bool) {
        match self.find_or_begin_insert(key, None) {
            Some(location) => {
                self.enter_existing(location);
                let node = self.node_path.last().map(|entry| entry.node.clone());
                match node {
                    Some(node) => (node, false),
                    None => panic!("internal error: node group {location} has no node"),
                }
            }
            None => {
                let node = factory();
                self.insert.start_node(key, Box::new(node.clone()));
                self.push_frame(key, None, true);
                self.realize();
                let index = self.node_index;
                self.changes.nodes.push(NodeChange::InsertTopDown {
                    index,
                    node: node.clone(),
                });
                self.changes.nodes.push(NodeChange::Down(node.clone()));
                self.node_index_stack.push(index);
                self.node_index = 0;
                self.node_path.push(PathNode {
                    node: node.clone(),
                    realized: true,
                });
                (node, true)
            }
        }
    }

    /// The existing group to reuse for `key`, or `None` after entering
    /// insert mode.
    fn find_or_begin_insert(&mut self, key: Key, object_key: Option<Key>) -> Option<usize> {
        if self.insert_depth == 0 {
            if let Some(location) = self.match_existing(key, object_key) {
                return Some(location);
            }
            self.reader.begin_empty();
            self.insert.begin_insert();
            self.insert_root = self.insert.current_group();
            log::trace!("insert group {key} at node index {}", self.node_index);
        }
        self.insert_depth += 1;
        None
    }

    fn match_existing(&mut self, key: Key, object_key: Option<Key>) -> Option<usize> {
        let window = self.key_search_window;
        let Some(frame) = self.frames.last_mut() else {
            panic!("internal error: no open group");
        };
        if frame.pending.is_none() {
            if self.reader.is_group_end() {
                return None;
            }
            let current = self.reader.current_group();
            if self.reader.group_key(current) == key
                && self.reader.group_object_key(current) == object_key
            {
                return Some(current);
            }
            frame.pending = Some(Pending {
                keys: self.reader.extract_keys(),
            });
        }
        let pending = frame.pending.as_mut()?;
        let position = pending.find(key, object_key, window)?;
        let nodes_before: usize = pending.keys[..position].iter().map(|info| info.nodes).sum();
        let info = pending.keys.remove(position);
        if position > 0 {
            log::trace!("move group {key} forward by {position}");
            self.changes.slots.push(SlotChange::Move(position));
            if info.nodes > 0 && nodes_before > 0 {
                self.realize();
                self.changes.nodes.push(NodeChange::Move {
                    from: self.node_index + nodes_before,
                    to: self.node_index,
                    count: info.nodes,
                });
            }
        }
        self.reader.reposition(info.location);
        Some(info.location)
    }

    fn enter_existing(&mut self, location: usize) {
        let key = self
            .reader
            .group_object_key(location)
            .unwrap_or_else(|| self.reader.group_key(location));
        let is_node = self.reader.is_node(location);
        let node = if is_node {
            match self.reader.node(location).and_then(|node| node.downcast_ref::<N>()) {
                Some(node) => Some(node.clone()),
                None => panic!("internal error: node group {location} holds a different node type"),
            }
        } else {
            None
        };
        self.reader.start_group();
        self.changes.slots.push(SlotChange::Enter);
        self.push_frame(key, Some(location), is_node);
        if let Some(node) = node {
            self.node_index_stack.push(self.node_index);
            self.node_index = 0;
            self.node_path.push(PathNode {
                node,
                realized: false,
            });
        }
    }

    fn push_frame(&mut self, key: Key, location: Option<usize>, is_node: bool) {
        self.frames.push(Frame {
            key,
            location,
            is_node,
            pending: None,
        });
        self.compound_key = enter_compound_key(self.compound_key, key);
    }

    fn end_group_impl(&mut self) {
        if self.frames.len() <= 1 {
            panic!("internal error: end_group without a matching start");
        }
        let Some(frame) = self.frames.pop() else {
            return;
        };
        self.compound_key = exit_compound_key(self.compound_key, frame.key);
        if frame.location.is_none() {
            self.insert.end_group();
            if frame.is_node {
                self.exit_inserted_node();
            }
            self.insert_depth -= 1;
            if self.insert_depth == 0 {
                self.insert.end_insert();
                self.reader.end_empty();
                let anchor = self.insert.anchor(self.insert_root);
                self.changes.slots.push(SlotChange::Insert(anchor));
            }
            return;
        }
        self.remove_leftovers(frame.pending);
        self.reader.skip_to_group_end();
        self.reader.end_group();
        self.changes.slots.push(SlotChange::Exit);
        if frame.is_node {
            self.exit_existing_node();
        }
    }

    /// Removes old children the content did not ask for again.
    fn remove_leftovers(&mut self, pending: Option<Pending>) {
        let leftovers = match pending {
            Some(pending) => pending.keys,
            None if self.reader.is_group_end() => return,
            None => self.reader.extract_keys(),
        };
        let mut count = 0;
        for info in &leftovers {
            log::trace!("remove group {} at {}", info.key, info.location);
            self.changes.slots.push(SlotChange::Remove);
            self.collect_removed(info.location);
            count += info.nodes;
        }
        if count > 0 {
            self.realize();
            self.changes.nodes.push(NodeChange::Remove {
                index: self.node_index,
                count,
            });
        }
    }

    /// Queues lifecycle callbacks and scope releases for a removed subtree.
    fn collect_removed(&mut self, location: usize) {
        if !self.reader.has_mark(location) && !self.reader.contains_mark(location) {
            return;
        }
        let slots: Vec<&'a dyn Any> = self.reader.subtree_slots(location).flatten().collect();
        for slot in slots {
            self.forget_slot(slot);
        }
    }

    fn forget_slot(&mut self, slot: &dyn Any) {
        if let Some(value) = slot.downcast_ref::<RememberedValue>() {
            if let Some(observer) = value.observer() {
                self.events.forgetting(Rc::clone(observer));
            }
        } else if let Some(scope) = slot.downcast_ref::<RecomposeScope>() {
            self.changes.released.push(scope.clone());
        }
    }

    // ---------------------------------------------------------------------
    // Recomposition
    // ---------------------------------------------------------------------

    /// Walks the rest of the current group, skipping subtrees without
    /// invalid scopes and recomposing the invalid ones.
    fn recompose_to_group_end(&mut self) {
        while !self.reader.is_group_end() {
            let group = self.reader.current_group();
            let end = self.reader.group_end(group);
            if self.invalid.range(group..end).next().is_none() {
                self.changes.slots.push(SlotChange::Skip);
                self.node_index += self.reader.skip_group();
                continue;
            }
            let scope = self.invalid.remove(&group);
            self.enter_existing(group);
            match scope.and_then(|scope| scope.restart::<N>().map(|restart| (scope, restart))) {
                Some((scope, restart)) => {
                    log::trace!("recompose {:?} at group {group}", scope.id());
                    // the scope itself sits in the first slot
                    let _ = self.reader.next();
                    self.run_restart(scope, restart, true);
                }
                None => self.recompose_to_group_end(),
            }
            self.end_group_impl();
        }
    }

    fn run_restart(&mut self, scope: RecomposeScope, restart: RestartFn<N>, forced: bool) {
        self.restarts.push(RestartFrame {
            scope,
            restart: Rc::clone(&restart),
            reads: SmallVec::new(),
            key: self.compound_key,
            forced,
            skipped: false,
            depth: self.frames.len(),
        });
        restart(self);
        let Some(frame) = self.restarts.pop() else {
            panic!("internal error: restart frame stack underflow");
        };
        self.changes.recomposed.push(ScopeUpdate {
            scope: frame.scope,
            restart: frame.restart,
            reads: frame.reads,
            key: frame.key,
            skipped: frame.skipped,
        });
    }

    /// The scope stored in the restart group just started, created if missing.
    fn restart_scope(&mut self, inserted: bool, location: Option<usize>) -> RecomposeScope {
        let read = self.read_slot();
        if let Some(scope) = read.value.and_then(|value| value.downcast_ref::<RecomposeScope>()) {
            return scope.clone();
        }
        if let Some(old) = read.value {
            self.forget_slot(old);
        }
        let scope = self.registry.create_scope();
        let anchor = match (inserted, location) {
            (false, Some(location)) => self.reader.anchor(location),
            _ => match self.insert.parent() {
                Some(parent) => self.insert.anchor(parent),
                None => panic!("internal error: restart group without a group"),
            },
        };
        scope.set_anchor(anchor);
        self.write_slot(&read, Box::new(scope.clone()));
        self.mark_current();
        self.changes.created.push(scope.clone());
        scope
    }

    // ---------------------------------------------------------------------
    // Slots
    // ---------------------------------------------------------------------

    fn read_slot(&mut self) -> SlotRead<'a> {
        if self.insert_depth > 0 {
            return SlotRead {
                index: 0,
                value: None,
                exists: false,
            };
        }
        let index = self.reader.slot_position();
        let exists = self
            .reader
            .parent()
            .is_some_and(|parent| index < self.reader.group_slot_count(parent));
        let value = self.reader.next();
        SlotRead {
            index,
            value,
            exists,
        }
    }

    fn write_slot(&mut self, read: &SlotRead<'_>, value: Box<dyn Any>) {
        if self.insert_depth > 0 {
            self.insert.update(Some(value));
        } else if read.exists {
            self.changes.slots.push(SlotChange::SetSlot {
                index: read.index,
                value,
            });
        } else {
            self.changes.slots.push(SlotChange::AppendSlot(value));
        }
    }

    fn mark_current(&mut self) {
        if self.insert_depth > 0 {
            self.insert.mark_group(None);
        } else {
            self.changes.slots.push(SlotChange::Mark);
        }
    }

    fn compare_and_store<V: PartialEq + Clone + 'static>(&mut self, value: &V) -> bool {
        let read = self.read_slot();
        let same = read
            .value
            .and_then(|previous| previous.downcast_ref::<V>())
            .is_some_and(|previous| previous == value);
        if !same {
            self.write_slot(&read, Box::new(value.clone()));
        }
        !same
    }

    fn store_observed<T: RememberObserver + 'static>(
        &mut self,
        read: &SlotRead<'_>,
        init: impl FnOnce() -> T,
    ) -> Owned<T> {
        if let Some(old) = read.value {
            self.forget_slot(old);
        }
        let owned = Owned::new(init());
        let remembered = RememberedValue::observed(owned.clone());
        if let Some(observer) = remembered.observer() {
            self.events.remembering(Rc::clone(observer));
        }
        self.write_slot(read, Box::new(remembered));
        self.mark_current();
        owned
    }

    // ---------------------------------------------------------------------
    // Node path
    // ---------------------------------------------------------------------

    /// Emits the `Up`s owed so far and a `Down` for every entered node the
    /// applier has not seen yet.
    fn realize(&mut self) {
        for _ in 0..self.pending_ups {
            self.changes.nodes.push(NodeChange::Up);
        }
        self.pending_ups = 0;
        for entry in self.node_path.iter_mut().filter(|entry| !entry.realized) {
            self.changes.nodes.push(NodeChange::Down(entry.node.clone()));
            entry.realized = true;
        }
    }

    fn exit_existing_node(&mut self) {
        if let Some(entry) = self.node_path.pop() {
            if entry.realized {
                self.pending_ups += 1;
            }
        }
        self.node_index = self.node_index_stack.pop().unwrap_or(0) + 1;
    }

    fn exit_inserted_node(&mut self) {
        let Some(entry) = self.node_path.pop() else {
            panic!("internal error: node path underflow");
        };
        self.pending_ups += 1;
        let index = self.node_index_stack.pop().unwrap_or(0);
        self.node_index = index + 1;
        self.realize();
        self.changes.nodes.push(NodeChange::InsertBottomUp {
            index,
            node: entry.node,
        });
    }

    fn push_node_update(&mut self, node: N, change: NodeUpdate<N>) {
        self.changes.nodes.push(NodeChange::Update { node, change });
    }
}

/// Records property changes of the node being emitted.
pub struct Updater<'c, 'a, N: Clone + 'static> {
    composer: &'c mut Composer<'a, N>,
    node: N,
    inserted: bool,
}

impl<N: Clone + 'static> Updater<'_, '_, N> {
    pub fn node(&self) -> &N {
        &self.node
    }

    /// Whether the node was created in this pass.
    pub fn inserted(&self) -> bool {
        self.inserted
    }

    /// Runs `apply` on a new node, and on an existing one when `value`
    /// differs from the previous pass.
    pub fn set<V: PartialEq + Clone + 'static>(&mut self, value: V, apply: impl FnOnce(&N, &V) + 'static) {
        if self.composer.compare_and_store(&value) {
            self.composer
                .push_node_update(self.node.clone(), Box::new(move |node| apply(node, &value)));
        }
    }

    /// Like [`set`](Self::set) but skipped for a new node.
    pub fn update<V: PartialEq + Clone + 'static>(
        &mut self,
        value: V,
        apply: impl FnOnce(&N, &V) + 'static,
    ) {
        if self.composer.compare_and_store(&value) && !self.inserted {
            self.composer
                .push_node_update(self.node.clone(), Box::new(move |node| apply(node, &value)));
        }
    }

    /// Runs `apply` once, when the node is created.
    pub fn init(&mut self, apply: impl FnOnce(&N) + 'static) {
        if self.inserted {
            self.composer
                .push_node_update(self.node.clone(), Box::new(apply));
        }
    }
}
