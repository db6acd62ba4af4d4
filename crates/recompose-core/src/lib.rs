#![doc = r"Slot table, reconciliation driver and snapshot state for incremental recomposition."]

pub mod applier;
pub mod collections;
pub mod composer;
mod composition;
pub mod config;
pub mod error;
pub mod hash;
pub mod owned;
pub mod remember;
pub mod scope;
pub mod slot_table;
pub mod snapshot;
pub mod snapshot_id_set;
pub mod snapshot_pinning;
pub mod snapshot_state_observer;
pub mod state;

pub use applier::{Applier, NodeUpdate};
pub use composer::{Composer, RestartFn, Updater};
pub use composition::Composition;
pub use config::ComposerConfig;
pub use error::{ComposeError, SlotTableError, SnapshotError};
pub use owned::Owned;
pub use remember::RememberObserver;
pub use scope::{RecomposeScope, ScopeId, ScopeRegistry};
pub use slot_table::{Anchor, KeyInfo, SlotReader, SlotTable, SlotWriter};
pub use snapshot::{ObserverHandle, Snapshot, SnapshotApplyResult, SnapshotSystem};
pub use snapshot_id_set::{SnapshotId, SnapshotIdSet};
pub use snapshot_state_observer::SnapshotStateObserver;
pub use state::{
    never_equal, referential_equality, structural_equality, MutableState, MutationPolicy, StateId,
};

use std::panic::Location;

/// Identity of a group among its siblings.
pub type Key = u64;

/// Key for a call site, stable across passes.
pub fn location_key(location: &Location<'_>) -> Key {
    hash::hash_key(&(location.file(), location.line(), location.column()))
}

/// Key of the caller's source location.
#[track_caller]
pub fn caller_key() -> Key {
    location_key(Location::caller())
}

#[cfg(test)]
#[path = "tests/slot_table_tests.rs"]
mod slot_table_tests;

#[cfg(test)]
#[path = "tests/snapshot_tests.rs"]
mod snapshot_tests;

#[cfg(test)]
#[path = "tests/composer_tests.rs"]
mod composer_tests;
