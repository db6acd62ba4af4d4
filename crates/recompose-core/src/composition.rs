use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use crate::applier::Applier;
use crate::composer::{ChangeSet, Composer, NodeChange, RestartFn, SlotChange};
use crate::config::ComposerConfig;
use crate::error::ComposeError;
use crate::remember::{RememberEvents, RememberedValue};
use crate::scope::{RecomposeScope, ScopeRegistry};
use crate::slot_table::SlotTable;
use crate::snapshot::{Snapshot, SnapshotSystem};

/// A tree of groups kept in sync with the nodes of an [`Applier`].
pub struct Composition<A: Applier> {
    slot_table: SlotTable,
    insert_table: SlotTable,
    applier: A,
    scopes: ScopeRegistry,
    events: RememberEvents,
    system: SnapshotSystem,
    config: ComposerConfig,
    /// Content waiting for the first committed pass.
    root_content: Option<RestartFn<A::Node>>,
    root_scope: Option<RecomposeScope>,
    disposed: bool,
}

impl<A: Applier> Composition<A> {
    pub fn new(applier: A, system: SnapshotSystem) -> Self {
        Self::with_config(applier, system, ComposerConfig::from_env())
    }

    pub fn with_config(applier: A, system: SnapshotSystem, config: ComposerConfig) -> Self {
        let mut scopes = ScopeRegistry::new();
        scopes.start(&system);
        Self {
            slot_table: SlotTable::new(),
            insert_table: SlotTable::new(),
            applier,
            scopes,
            events: RememberEvents::default(),
            system,
            config,
            root_content: None,
            root_scope: None,
            disposed: false,
        }
    }

    pub fn applier(&self) -> &A {
        &self.applier
    }

    pub fn applier_mut(&mut self) -> &mut A {
        &mut self.applier
    }

    pub fn slot_table(&self) -> &SlotTable {
        &self.slot_table
    }

    pub fn system(&self) -> &SnapshotSystem {
        &self.system
    }

    pub fn config(&self) -> &ComposerConfig {
        &self.config
    }

    pub fn scopes(&self) -> &ScopeRegistry {
        &self.scopes
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Composes `content`, replacing whatever was composed before.
    ///
    /// # Panics
    ///
    /// If the composition was disposed, or when `content` panics. A panicking
    /// pass leaves the composition as it was.
    pub fn set_content(
        &mut self,
        content: impl Fn(&mut Composer<'_, A::Node>) + 'static,
    ) -> Result<(), ComposeError> {
        assert!(!self.disposed, "internal error: set_content on a disposed composition");
        let content: RestartFn<A::Node> = Rc::new(content);
        match &self.root_scope {
            Some(scope) => {
                scope.set_restart(content);
                scope.invalidate();
            }
            None => self.root_content = Some(content),
        }
        self.compose().map(|_| ())
    }

    /// Recomposes every invalidated scope. Returns whether anything was
    /// recomposed.
    pub fn recompose(&mut self) -> Result<bool, ComposeError> {
        if self.disposed {
            return Ok(false);
        }
        self.compose()
    }

    /// Whether a state read by this composition changed, or a scope was
    /// invalidated directly, since the last pass.
    pub fn has_invalidations(&mut self) -> bool {
        !self.disposed && self.scopes.has_invalidations()
    }

    /// Forgets every remembered value, releases all scopes and clears the
    /// applier. The composition cannot be used afterwards.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        {
            let reader = self.slot_table.read();
            let mut group = 0;
            while group < reader.size() {
                for slot in reader.subtree_slots(group).flatten() {
                    if let Some(observer) = slot
                        .downcast_ref::<RememberedValue>()
                        .and_then(RememberedValue::observer)
                    {
                        self.events.forgetting(Rc::clone(observer));
                    }
                }
                group += reader.group_size(group);
            }
        }
        self.scopes.release_all();
        self.scopes.stop();
        self.root_scope = None;
        self.root_content = None;
        self.applier.clear();
        self.slot_table = SlotTable::new();
        self.events.dispatch();
        log::debug!("composition disposed");
    }

    fn compose(&mut self) -> Result<bool, ComposeError> {
        let attempts = self.config.max_apply_retries.max(1);
        for attempt in 1..=attempts {
            self.scopes.process_changes();
            let invalid = self.scopes.resolve_invalid(&self.slot_table);
            let initial = self.root_content.is_some() && self.slot_table.is_empty();
            if invalid.is_empty() && !initial {
                return Ok(false);
            }
            log::debug!(
                "composition pass {attempt}: {} invalid scopes{}",
                invalid.len(),
                if initial { ", initial content" } else { "" }
            );

            let snapshot = self.system.take_mutable_snapshot(None, None);
            let changes = {
                let Self {
                    slot_table,
                    insert_table,
                    scopes,
                    events,
                    config,
                    root_content,
                    ..
                } = self;
                let root = if initial { root_content.clone() } else { None };
                panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut composer =
                        Composer::new(slot_table, insert_table, &snapshot, scopes, events, config, invalid);
                    match root {
                        Some(content) => composer.compose_root(content),
                        None => composer.recompose_invalid(),
                    }
                    composer.finish()
                }))
            };
            let changes = match changes {
                Ok(changes) => changes,
                Err(payload) => {
                    self.abandon_pass(&snapshot);
                    panic::resume_unwind(payload);
                }
            };

            match snapshot.apply() {
                Ok(result) if result.is_success() => {
                    snapshot.dispose();
                    self.commit(changes)?;
                    return Ok(true);
                }
                Ok(_) => {
                    log::warn!("composition snapshot conflicted on attempt {attempt} of {attempts}");
                    drop(changes);
                    self.abandon_pass(&snapshot);
                }
                Err(err) => {
                    drop(changes);
                    self.abandon_pass(&snapshot);
                    return Err(err.into());
                }
            }
        }
        Err(ComposeError::ApplyConflict { attempts })
    }

    fn abandon_pass(&mut self, snapshot: &Snapshot) {
        snapshot.dispose();
        self.events.abandon();
        self.insert_table = SlotTable::new();
    }

    fn commit(&mut self, changes: ChangeSet<A::Node>) -> Result<(), ComposeError> {
        let ChangeSet {
            slots,
            nodes,
            recomposed,
            created,
            released,
        } = changes;
        let slot_edits = slots.len();
        {
            let mut writer = self.slot_table.write();
            for change in slots {
                match change {
                    SlotChange::Skip => {
                        writer.skip_group();
                    }
                    SlotChange::Enter => writer.start_existing_group(),
                    SlotChange::Exit => {
                        writer.end_group();
                    }
                    SlotChange::Move(offset) => writer.move_group(offset),
                    SlotChange::Insert(anchor) => {
                        let index = self.insert_table.anchor_index(&anchor)?;
                        writer.begin_insert();
                        writer.move_from(&mut self.insert_table, index);
                        writer.end_insert();
                    }
                    SlotChange::Remove => {
                        writer.remove_group();
                    }
                    SlotChange::SetSlot { index, value } => {
                        writer.set(index, Some(value));
                    }
                    SlotChange::AppendSlot(value) => writer.append_slot(Some(value)),
                    SlotChange::SkipToEnd => writer.skip_to_group_end(),
                    SlotChange::Mark => writer.mark_group(None),
                }
            }
            writer.close();
        }
        if self.config.verify_after_write {
            self.slot_table.verify_well_formed()?;
        }

        let node_edits = nodes.len();
        if !nodes.is_empty() {
            self.applier.on_begin_changes();
            for change in nodes {
                match change {
                    NodeChange::Down(node) => self.applier.down(&node),
                    NodeChange::Up => self.applier.up(),
                    NodeChange::InsertTopDown { index, node } => {
                        self.applier.insert_top_down(index, &node)
                    }
                    NodeChange::InsertBottomUp { index, node } => {
                        self.applier.insert_bottom_up(index, &node)
                    }
                    NodeChange::Remove { index, count } => self.applier.remove(index, count),
                    NodeChange::Move { from, to, count } => self.applier.move_nodes(from, to, count),
                    NodeChange::Update { node, change } => self.applier.update(&node, change),
                }
            }
            self.applier.on_end_changes();
        }

        for scope in &released {
            self.scopes.release(scope);
        }
        for scope in created {
            if self.root_scope.is_none() && self.root_content.is_some() {
                self.root_scope = Some(scope.clone());
            }
            self.scopes.register(scope);
        }
        for update in recomposed {
            if update.scope.is_released() {
                continue;
            }
            update.scope.mark_valid();
            if update.skipped {
                continue;
            }
            update.scope.set_key(update.key);
            update.scope.set_restart(update.restart);
            self.scopes.set_reads(update.scope.id(), update.reads);
        }
        self.root_content = None;
        self.events.dispatch();
        log::debug!(
            "composition committed: {slot_edits} slot edits, {node_edits} node edits, {} scopes released",
            released.len()
        );
        Ok(())
    }
}
