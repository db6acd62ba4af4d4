use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

const INVALID_LOCATION: isize = isize::MIN;

/// A stable reference to a group that survives edits to the table.
///
/// The location is either a start-relative index or, for groups after the
/// writer's gap, a negative distance from the end of the table. Clones share
/// the same location, so an anchor handed out to a caller sees every update
/// the owning table makes.
#[derive(Clone)]
pub struct Anchor {
    location: Rc<Cell<isize>>,
}

impl Anchor {
    pub(crate) fn new(location: isize) -> Self {
        Self {
            location: Rc::new(Cell::new(location)),
        }
    }

    /// False once the group this anchor pointed at has been removed.
    pub fn valid(&self) -> bool {
        self.location.get() != INVALID_LOCATION
    }

    #[inline]
    pub(crate) fn location(&self) -> isize {
        self.location.get()
    }

    #[inline]
    pub(crate) fn set_location(&self, location: isize) {
        self.location.set(location);
    }

    pub(crate) fn invalidate(&self) {
        self.location.set(INVALID_LOCATION);
    }

    /// Index of the anchored group given the effective size of the owning table.
    #[inline]
    pub(crate) fn index_for(&self, effective_size: usize) -> usize {
        let location = self.location.get();
        if location < 0 {
            (effective_size as isize + location) as usize
        } else {
            location as usize
        }
    }
}

impl PartialEq for Anchor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.location, &other.location)
    }
}

impl Eq for Anchor {}

impl fmt::Debug for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid() {
            write!(f, "Anchor({})", self.location.get())
        } else {
            write!(f, "Anchor(invalid)")
        }
    }
}

/// Binary search over a location-sorted anchor list.
///
/// Returns `Ok(position)` on an exact hit and `Err(insertion point)` otherwise.
pub(crate) fn search(anchors: &[Anchor], index: usize, effective_size: usize) -> Result<usize, usize> {
    anchors.binary_search_by(|anchor| anchor.index_for(effective_size).cmp(&index))
}

/// First position whose anchor is at or after `index`.
pub(crate) fn location_of(anchors: &[Anchor], index: usize, effective_size: usize) -> usize {
    match search(anchors, index, effective_size) {
        Ok(position) | Err(position) => position,
    }
}

/// Returns the anchor at `index`, creating it with `make` if none exists.
pub(crate) fn get_or_add(
    anchors: &mut Vec<Anchor>,
    index: usize,
    effective_size: usize,
    make: impl FnOnce() -> Anchor,
) -> Anchor {
    match search(anchors, index, effective_size) {
        Ok(position) => anchors[position].clone(),
        Err(position) => {
            let anchor = make();
            anchors.insert(position, anchor.clone());
            anchor
        }
    }
}
