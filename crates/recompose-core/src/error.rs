use std::fmt;

/// Errors raised by slot table operations that a caller can reasonably check
/// for. Cursor misuse is not represented here; it panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotTableError {
    /// The anchor's group was removed.
    AnchorInvalid,
    /// The anchor is valid but belongs to a different table.
    AnchorNotOwned,
    /// A structural consistency check failed.
    Malformed { group: usize, reason: String },
}

impl fmt::Display for SlotTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotTableError::AnchorInvalid => write!(f, "anchor no longer refers to a group"),
            SlotTableError::AnchorNotOwned => write!(f, "anchor is not owned by this slot table"),
            SlotTableError::Malformed { group, reason } => {
                write!(f, "slot table malformed at group {group}: {reason}")
            }
        }
    }
}

impl std::error::Error for SlotTableError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    /// The snapshot was disposed before the operation.
    Disposed,
    /// The snapshot was already applied.
    AlreadyApplied,
    /// A state write was attempted through a read-only snapshot.
    ReadOnlyWrite,
    /// Apply was requested on a read-only snapshot.
    NotMutable,
    /// The snapshot id is no longer in the open set.
    NotOpen,
    /// The global snapshot is applied with `advance_global`, not `apply`.
    GlobalApply,
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Disposed => write!(f, "snapshot has been disposed"),
            SnapshotError::AlreadyApplied => write!(f, "snapshot has already been applied"),
            SnapshotError::ReadOnlyWrite => write!(f, "cannot write to a state in a read-only snapshot"),
            SnapshotError::NotMutable => write!(f, "read-only snapshots cannot be applied"),
            SnapshotError::NotOpen => write!(f, "snapshot is not open"),
            SnapshotError::GlobalApply => {
                write!(f, "the global snapshot cannot be applied directly; advance it instead")
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    /// Every attempt to apply the composition snapshot hit a conflicting write.
    ApplyConflict { attempts: usize },
    Snapshot(SnapshotError),
    SlotTable(SlotTableError),
}

impl fmt::Display for ComposeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComposeError::ApplyConflict { attempts } => {
                write!(f, "composition snapshot conflicted on all {attempts} attempts")
            }
            ComposeError::Snapshot(err) => write!(f, "snapshot error during composition: {err}"),
            ComposeError::SlotTable(err) => write!(f, "slot table error during composition: {err}"),
        }
    }
}

impl std::error::Error for ComposeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ComposeError::ApplyConflict { .. } => None,
            ComposeError::Snapshot(err) => Some(err),
            ComposeError::SlotTable(err) => Some(err),
        }
    }
}

impl From<SnapshotError> for ComposeError {
    fn from(err: SnapshotError) -> Self {
        ComposeError::Snapshot(err)
    }
}

impl From<SlotTableError> for ComposeError {
    fn from(err: SlotTableError) -> Self {
        ComposeError::SlotTable(err)
    }
}
